use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use clap::Parser;
use deskbroker::{
    core::{
        config::BrokerConfig,
        crypto::{MsSinceEpoch, StandardCipher, StandardIssuer},
        model::StaffUser,
    },
    executor::{ActorExecutor, ActorService},
    memory::{MemoryBroker, MemoryCache, MemoryTicketRepository},
    web,
};

type Executor = ActorExecutor<MemoryBroker, MemoryCache, MemoryTicketRepository, StandardCipher, StandardIssuer>;

#[derive(Parser, Debug)]
#[command(name = "deskbroker", about = "Actor endpoint of the desktop broker")]
struct Args {
    /// TOML configuration file. Defaults apply when absent.
    #[arg(long, env = "DESKBROKER_CONFIG")]
    config: Option<PathBuf>,

    /// HTTP listen address, overrides `server.listen`.
    #[arg(long, env = "DESKBROKER_LISTEN")]
    listen: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => BrokerConfig::load(path)?,
        None => {
            tracing::warn!("No --config given, running with the default configuration.");
            BrokerConfig::default()
        }
    };
    let listen: SocketAddr = match args.listen {
        Some(listen) => listen,
        None => config.server.listen.parse()?,
    };

    let broker = MemoryBroker::default();
    for staff in &config.server.staff {
        broker.add_staff(staff.token.clone(), StaffUser { name: staff.name.clone(), is_staff: true });
    }
    if config.server.staff.is_empty() {
        tracing::warn!("No staff tokens configured, register calls will all be denied.");
    }

    let executor: Arc<Executor> = Arc::new(ActorExecutor::new(
        broker,
        MemoryCache::default(),
        MemoryTicketRepository::default(),
        &config,
    ));

    let sweeper = executor.clone();
    let every = config.tickets.cleanup_interval.max(Duration::from_secs(1));
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        loop {
            interval.tick().await;
            match sweeper.cleanup_tickets(MsSinceEpoch::now()) {
                Ok(0) => {}
                Ok(removed) => tracing::debug!(removed, "swept expired tickets"),
                Err(e) => tracing::error!(error = %e, "ticket sweep failed"),
            }
        }
    });

    let app = web::router(executor, config.server.trusted_proxies.clone())
        .into_make_service_with_connect_info::<SocketAddr>();

    tracing::info!("deskbroker {} listening on {}", config.server.version, listen);
    let listener = tokio::net::TcpListener::bind(listen).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutting down");
        })
        .await?;

    Ok(())
}
