use std::{sync::Arc, time::Duration};

use uuid::Uuid;

use crate::{
    core::{
        config::BrokerConfig,
        crypto::{
            MsSinceEpoch,
            specials::{FauxCipher, FauxDeployment, FauxIssuer, FauxOsManager, FauxService},
        },
        model::{ServicePool, ServiceRecord, StaffUser},
        userservice::{CacheLevel, UserService},
    },
    executor::ActorExecutor,
    memory::{MemoryBroker, MemoryCache, MemoryTicketRepository},
};

pub const ARBTEST_DURATION: Duration = Duration::from_secs(2);

pub const STAFF_TOKEN: &str = "staff-bearer-token";
pub const MAC: &str = "AA:BB:CC:DD:EE:FF";
pub const MASTER_TOKEN: &str = "master-token-0123456789";
pub const UNMANAGED_ID: &str = "10.0.0.50";

pub type TestExecutor = ActorExecutor<MemoryBroker, MemoryCache, MemoryTicketRepository, FauxCipher, FauxIssuer>;

pub struct Fixture {
    pub executor: TestExecutor,
    pub pool: Uuid,
    /// A usable user service whose unique id is [MAC].
    pub user_service: Uuid,
    /// The service owning [MASTER_TOKEN].
    pub service: Uuid,
    pub unmanaged: FauxService,
}

/// A broker with one pool, one usable user service, one staff user and one
/// unmanaged service recognizing [UNMANAGED_ID].
pub fn fixture(now: MsSinceEpoch) -> Fixture {
    fixture_with(BrokerConfig::default(), now)
}

pub fn fixture_with(config: BrokerConfig, now: MsSinceEpoch) -> Fixture {
    let broker = MemoryBroker::default();
    broker.add_staff(STAFF_TOKEN, StaffUser { name: "admin".into(), is_staff: true });

    let service = Uuid::new_v4();
    let unmanaged = FauxService::recognizing(&[UNMANAGED_ID]);
    broker.add_service(
        ServiceRecord { id: service, name: "desktops".into(), token: Some(MASTER_TOKEN.into()) },
        Some(Arc::new(unmanaged.clone())),
    );

    let pool = Uuid::new_v4();
    let os_manager = FauxOsManager { rename_to: Some("renamed-desk".into()), ..Default::default() };
    broker.add_pool(
        ServicePool { id: pool, service, name: "pool".into(), deadline: None },
        Some(Arc::new(os_manager)),
        config.restraint.clone(),
    );

    let user_service = broker
        .add_user_service(
            UserService::new(pool, MAC, "desk", CacheLevel::L1, now),
            Box::new(FauxDeployment::finishing()),
            now,
        )
        .unwrap()
        .unwrap();
    broker.finish_preparation(user_service, now).unwrap();

    Fixture {
        executor: ActorExecutor::new(broker, MemoryCache::default(), MemoryTicketRepository::default(), &config),
        pool,
        user_service,
        service,
        unmanaged,
    }
}
