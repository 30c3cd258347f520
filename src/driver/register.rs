use serde::Deserialize;
use serde_json::Value;

use crate::{
    core::{
        MsSinceEpoch, ProtocolError, Query, Reply,
        crypto::random_string,
        model::{ActorCommands, ActorIdentity, StaffUser},
    },
    driver::{ActorDriver, DriverInner, DriverPollResult, Stage, drive, unexpected},
};

/// Length of the tokens handed out to registered actors.
pub const ACTOR_TOKEN_LENGTH: usize = 40;

#[derive(Debug, Clone, Deserialize)]
pub struct RegisterRequest {
    pub mac: String,
    pub ip: String,
    pub hostname: String,
    pub pre_command: String,
    pub post_command: String,
    pub run_once_command: String,
    pub log_level: i64,
    #[serde(default)]
    pub os: Option<String>,
    #[serde(default)]
    pub custom: Option<Value>,
    #[serde(default)]
    pub version: Option<String>,
}

/// Registers an actor under its MAC, reusing the existing identity if any.
///
/// The only driver that requires an authenticated staff caller.
///
/// # Example
/// ```
/// use deskbroker::{ActorDriver, RegisterDriver, RegisterRequest, Query, Reply};
/// use deskbroker::core::{crypto::MsSinceEpoch, model::StaffUser};
///
/// let request: RegisterRequest = serde_json::from_value(serde_json::json!({
///     "mac": "AA:BB:CC:DD:EE:FF", "ip": "10.0.0.2", "hostname": "desk",
///     "pre_command": "", "post_command": "", "run_once_command": "", "log_level": 2
/// })).unwrap();
/// let staff = StaffUser { name: "admin".into(), is_staff: true };
/// let mut driver = RegisterDriver::new(request, Some(staff), "10.0.0.1".into());
/// driver.recv(MsSinceEpoch(0), None);
///
/// assert!(matches!(driver.poll_transmit(), Some(Query::FindActorByMac { .. })));
/// driver.recv(MsSinceEpoch(0), Some(Reply::Actor(None)));
/// assert!(matches!(driver.poll_transmit(), Some(Query::StoreActor(_))));
/// driver.recv(MsSinceEpoch(0), Some(Reply::Stored));
/// assert!(driver.poll_result().is_ready());
/// ```
pub struct RegisterDriver {
    inner: DriverInner,
    stage: Stage<Progress, String>,
}

enum Progress {
    Init {
        request: RegisterRequest,
        caller: Option<StaffUser>,
        source: String,
    },
    /// Waiting on the existing identity.
    Lookup {
        request: RegisterRequest,
        username: String,
        source: String,
    },
    /// Waiting on the store, holds the token to hand back.
    Store(String),
}

type Step = super::Step<Progress, String>;

impl RegisterDriver {
    pub fn new(request: RegisterRequest, caller: Option<StaffUser>, source: String) -> Self {
        Self {
            inner: DriverInner::default(),
            stage: Stage::Running(Progress::Init { request, caller, source }),
        }
    }
}

impl ActorDriver for RegisterDriver {
    type Output = String;

    fn recv(&mut self, now: MsSinceEpoch, reply: Option<Reply>) {
        drive(&mut self.inner, &mut self.stage, |inner, progress| match progress {
            Progress::Init { request, caller, source } => handle_init(inner, request, caller, source),
            Progress::Lookup { request, username, source } => {
                handle_lookup(inner, request, username, source, reply, now)
            }
            Progress::Store(token) => handle_store(token, reply),
        });
    }
    fn poll_transmit(&mut self) -> Option<Query> {
        self.inner.dequeue()
    }
    fn poll_result(&mut self) -> DriverPollResult<String> {
        self.stage.poll()
    }
}

fn handle_init(inner: &mut DriverInner, request: RegisterRequest, caller: Option<StaffUser>, source: String) -> Step {
    let Some(caller) = caller.filter(|c| c.is_staff) else {
        return Err(ProtocolError::AccessDenied);
    };

    inner.send(Query::FindActorByMac { mac: request.mac.clone() });
    Ok(Stage::Running(Progress::Lookup { request, username: caller.name, source }))
}

fn handle_lookup(
    inner: &mut DriverInner,
    request: RegisterRequest,
    username: String,
    source: String,
    reply: Option<Reply>,
    now: MsSinceEpoch,
) -> Step {
    let existing = match reply {
        None => return Ok(Stage::Running(Progress::Lookup { request, username, source })),
        Some(Reply::Actor(existing)) => existing,
        Some(_) => return unexpected("register lookup"),
    };

    let commands = ActorCommands {
        pre_command: request.pre_command,
        post_command: request.post_command,
        run_once_command: request.run_once_command,
        custom: request.custom.unwrap_or(Value::Null),
    };
    let subtype = request.version.unwrap_or_default();

    let identity = match existing {
        Some(identity) => ActorIdentity {
            ip: request.ip,
            ip_from: source,
            hostname: request.hostname,
            log_level: request.log_level,
            subtype,
            commands,
            username,
            stamp: now,
            ..identity
        },
        None => ActorIdentity {
            token: random_string(ACTOR_TOKEN_LENGTH),
            mac: request.mac,
            ip: request.ip,
            ip_from: source,
            hostname: request.hostname,
            log_level: request.log_level,
            os: request.os.unwrap_or_default(),
            subtype,
            commands,
            username,
            stamp: now,
        },
    };

    let token = identity.token.clone();
    inner.send(Query::StoreActor(identity));
    Ok(Stage::Running(Progress::Store(token)))
}

fn handle_store(token: String, reply: Option<Reply>) -> Step {
    match reply {
        None => Ok(Stage::Running(Progress::Store(token))),
        Some(Reply::Stored) => Ok(Stage::Finished(Some(token))),
        Some(_) => unexpected("register store"),
    }
}
