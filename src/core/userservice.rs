use std::{collections::BTreeMap, fmt::Display};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::core::{
    collab::{Deployment, TaskState},
    crypto::{MsSinceEpoch, random_string},
    error::UserServiceError,
};

pub const PROP_IP: &str = "ip";
pub const PROP_COMMS_URL: &str = "comms_url";
pub const PROP_CERT: &str = "cert";
pub const PROP_PRIV: &str = "priv";
pub const PROP_PRIV_PASSWD: &str = "priv_passwd";

const SRC_IP_LEN: usize = 15;
const SRC_HOSTNAME_LEN: usize = 64;
const SESSION_ID_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum State {
    Preparing,
    Usable,
    Removable,
    Removing,
    Removed,
    Canceling,
    Canceled,
    Error,
}

impl State {
    pub fn to_static_str(&self) -> &'static str {
        match self {
            Self::Preparing => "PREPARING",
            Self::Usable => "USABLE",
            Self::Removable => "REMOVABLE",
            Self::Removing => "REMOVING",
            Self::Removed => "REMOVED",
            Self::Canceling => "CANCELING",
            Self::Canceled => "CANCELED",
            Self::Error => "ERROR",
        }
    }
    /// Final states never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Removed | Self::Canceled)
    }
    /// States in which an actor may bind to the service.
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Usable | Self::Preparing)
    }
}

impl Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.to_static_str().fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OsState {
    Preparing,
    Usable,
}

/// Cache placement. Only [CacheLevel::Assigned] can carry a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CacheLevel {
    Assigned = 0,
    L1 = 1,
    L2 = 2,
}

/// Usage accounting event produced by [UserService::set_in_use].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Accounting {
    Start,
    Stop,
}

/// What the owner has to do after the in-use flag changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InUseSignal {
    pub accounting: Accounting,
    /// The service was released, the owner should check if it must be recycled.
    pub check_removal: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub start: MsSinceEpoch,
    pub end: Option<MsSinceEpoch>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ConnectionSource {
    pub ip: String,
    pub hostname: String,
}

/// Side work the repository performs when a user service is deleted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleanupAction {
    ClearLogs(Uuid),
    ClearEnvironment(Uuid),
    CloseSessions(Uuid),
}

pub trait Lifecycle {
    fn on_delete(&self) -> Vec<CleanupAction>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserService {
    pub uuid: Uuid,
    pub pool: Uuid,
    pub unique_id: String,
    pub friendly_name: String,
    pub state: State,
    pub os_state: OsState,
    pub state_date: MsSinceEpoch,
    pub creation_date: MsSinceEpoch,
    pub cache_level: CacheLevel,
    pub in_use: bool,
    pub in_use_date: MsSinceEpoch,
    pub user: Option<Uuid>,
    pub actor_version: String,
    pub src_ip: String,
    pub src_hostname: String,
    pub properties: BTreeMap<String, String>,
    pub sessions: Vec<Session>,
    pub destroy_after: bool,
}

impl UserService {
    pub fn new(pool: Uuid, unique_id: impl Into<String>, friendly_name: impl Into<String>, cache_level: CacheLevel, now: MsSinceEpoch) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            pool,
            unique_id: unique_id.into(),
            friendly_name: friendly_name.into(),
            state: State::Preparing,
            os_state: OsState::Preparing,
            state_date: now,
            creation_date: now,
            cache_level,
            in_use: false,
            in_use_date: MsSinceEpoch::NEVER,
            user: None,
            actor_version: String::new(),
            src_ip: String::new(),
            src_hostname: String::new(),
            properties: BTreeMap::new(),
            sessions: Vec::new(),
            destroy_after: false,
        }
    }

    /// Moves to `state`. Final states are sticky and `ERROR` is reachable from
    /// any other state.
    pub fn set_state(&mut self, state: State, now: MsSinceEpoch) -> Result<(), UserServiceError> {
        if state == self.state {
            return Ok(());
        }
        if self.state.is_terminal() {
            return Err(UserServiceError::Terminal(self.state));
        }
        debug!(uuid = %self.uuid, from = %self.state, to = %state, "user service state change");
        self.state = state;
        self.state_date = now;
        Ok(())
    }

    pub fn set_os_state(&mut self, os_state: OsState, now: MsSinceEpoch) {
        if os_state != self.os_state {
            self.os_state = os_state;
            self.state_date = now;
        }
    }

    pub fn set_in_use(&mut self, in_use: bool, now: MsSinceEpoch) -> InUseSignal {
        self.in_use = in_use;
        self.in_use_date = now;
        InUseSignal {
            accounting: if in_use { Accounting::Start } else { Accounting::Stop },
            check_removal: !in_use,
        }
    }

    pub fn assign_to_user(&mut self, user: Uuid, now: MsSinceEpoch) {
        self.cache_level = CacheLevel::Assigned;
        self.state_date = now;
        self.user = Some(user);
    }

    pub fn is_usable(&self) -> bool {
        self.state == State::Usable
    }

    pub fn is_preparing(&self) -> bool {
        self.state == State::Preparing
    }

    /// Marks the service for removal; the provider is asked to destroy it later.
    pub fn release(&mut self, now: MsSinceEpoch) -> Result<(), UserServiceError> {
        info!(uuid = %self.uuid, "releasing user service");
        self.set_state(State::Removable, now)
    }

    /// Destroys the service through its provider.
    pub fn remove(&mut self, deployment: &mut dyn Deployment, now: MsSinceEpoch) -> Result<(), UserServiceError> {
        if !matches!(self.state, State::Usable | State::Removable) {
            return Err(UserServiceError::IllegalTransition { from: self.state, to: State::Removing });
        }
        self.set_state(State::Removing, now)?;
        self.set_in_use(false, now);
        let task = deployment.destroy();
        self.apply_task(task, State::Removed, now)
    }

    /// Aborts an in-flight preparation. Anything else is removed instead.
    pub fn cancel(&mut self, deployment: &mut dyn Deployment, now: MsSinceEpoch) -> Result<(), UserServiceError> {
        if !self.is_preparing() {
            debug!(uuid = %self.uuid, "cancel on a non running operation, removing instead");
            return self.remove(deployment, now);
        }
        if !deployment.supports_cancel() {
            self.destroy_after = true;
            return Ok(());
        }
        self.set_state(State::Canceling, now)?;
        let task = deployment.cancel();
        self.apply_task(task, State::Canceled, now)
    }

    pub fn remove_or_cancel(&mut self, deployment: &mut dyn Deployment, now: MsSinceEpoch) -> Result<(), UserServiceError> {
        if self.is_usable() {
            self.remove(deployment, now)
        } else {
            self.cancel(deployment, now)
        }
    }

    /// Called when the provider finished preparing the service.
    pub fn finish_preparation(&mut self, deployment: &mut dyn Deployment, now: MsSinceEpoch) -> Result<(), UserServiceError> {
        self.set_state(State::Usable, now)?;
        if self.destroy_after {
            self.destroy_after = false;
            return self.remove(deployment, now);
        }
        Ok(())
    }

    pub fn move_to_level(&mut self, level: CacheLevel, deployment: &mut dyn Deployment, now: MsSinceEpoch) -> Result<(), UserServiceError> {
        if level != CacheLevel::Assigned && self.user.is_some() {
            return Err(UserServiceError::NotAssignable);
        }
        let task = deployment.move_to_cache(level);
        self.cache_level = level;
        match task {
            TaskState::Running if self.is_usable() => self.set_state(State::Preparing, now),
            TaskState::Error(reason) => {
                self.set_state(State::Error, now)?;
                Err(UserServiceError::Provider(reason))
            }
            _ => Ok(()),
        }
    }

    fn apply_task(&mut self, task: TaskState, finished: State, now: MsSinceEpoch) -> Result<(), UserServiceError> {
        match task {
            TaskState::Running => Ok(()),
            TaskState::Finished => self.set_state(finished, now),
            TaskState::Error(reason) => {
                self.set_state(State::Error, now)?;
                Err(UserServiceError::Provider(reason))
            }
        }
    }

    pub fn start_session(&mut self, now: MsSinceEpoch) -> String {
        let id = random_string(SESSION_ID_LEN);
        self.sessions.push(Session { id: id.clone(), start: now, end: None });
        id
    }

    /// Closes the named session, or every open session when `id` is empty.
    pub fn end_session(&mut self, id: &str, now: MsSinceEpoch) -> usize {
        let mut closed = 0;
        for session in self.sessions.iter_mut().filter(|s| s.end.is_none()) {
            if id.is_empty() || session.id == id {
                session.end = Some(now);
                closed += 1;
            }
        }
        closed
    }

    pub fn open_sessions(&self) -> impl Iterator<Item = &Session> {
        self.sessions.iter().filter(|s| s.end.is_none())
    }

    pub fn property(&self, name: &str) -> Option<&str> {
        self.properties.get(name).map(String::as_str)
    }

    pub fn set_property(&mut self, name: &str, value: impl Into<String>) {
        self.properties.insert(name.to_string(), value.into());
    }

    pub fn log_ip(&mut self, ip: &str) {
        self.set_property(PROP_IP, ip);
    }

    pub fn set_comms_url(&mut self, url: impl Into<String>) {
        self.set_property(PROP_COMMS_URL, url);
    }

    pub fn set_connection_source(&mut self, ip: &str, hostname: &str) {
        self.src_ip = ip.chars().take(SRC_IP_LEN).collect();
        self.src_hostname = hostname.chars().take(SRC_HOSTNAME_LEN).collect();
        if self.src_ip != ip || self.src_hostname != hostname {
            info!(ip = %self.src_ip, hostname = %self.src_hostname, "truncated connection source");
        }
    }

    pub fn connection_source(&self) -> ConnectionSource {
        ConnectionSource {
            ip: if self.src_ip.is_empty() { "0.0.0.0".into() } else { self.src_ip.clone() },
            hostname: if self.src_hostname.is_empty() { "unknown".into() } else { self.src_hostname.clone() },
        }
    }
}

impl Lifecycle for UserService {
    fn on_delete(&self) -> Vec<CleanupAction> {
        vec![
            CleanupAction::CloseSessions(self.uuid),
            CleanupAction::ClearEnvironment(self.uuid),
            CleanupAction::ClearLogs(self.uuid),
        ]
    }
}


#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use crate::core::{
        collab::TaskState,
        crypto::{MsSinceEpoch, specials::FauxDeployment},
        error::UserServiceError,
    };

    use super::{Accounting, CacheLevel, CleanupAction, Lifecycle, OsState, State, UserService};

    fn usable() -> UserService {
        let mut service = UserService::new(Uuid::new_v4(), "aa:bb", "desk", CacheLevel::L1, MsSinceEpoch(0));
        service.set_state(State::Usable, MsSinceEpoch(10)).unwrap();
        service
    }

    #[test]
    pub fn test_state_date_only_moves_on_change() {
        let mut service = usable();
        assert_eq!(service.state_date, MsSinceEpoch(10));
        service.set_state(State::Usable, MsSinceEpoch(20)).unwrap();
        assert_eq!(service.state_date, MsSinceEpoch(10));
        service.set_os_state(OsState::Usable, MsSinceEpoch(30));
        assert_eq!(service.state_date, MsSinceEpoch(30));
    }

    #[test]
    pub fn test_error_reachable_but_terminal_is_sticky() {
        let mut service = usable();
        service.set_state(State::Error, MsSinceEpoch(11)).unwrap();

        let mut gone = usable();
        gone.state = State::Removed;
        assert_eq!(gone.set_state(State::Error, MsSinceEpoch(1)), Err(UserServiceError::Terminal(State::Removed)));
    }

    #[test]
    pub fn test_in_use_signals() {
        let mut service = usable();
        let on = service.set_in_use(true, MsSinceEpoch(5));
        assert_eq!(on.accounting, Accounting::Start);
        assert!(!on.check_removal);
        let off = service.set_in_use(false, MsSinceEpoch(6));
        assert_eq!(off.accounting, Accounting::Stop);
        assert!(off.check_removal);
        assert_eq!(service.in_use_date, MsSinceEpoch(6));
    }

    #[test]
    pub fn test_remove_requires_usable() {
        let mut deployment = FauxDeployment::finishing();
        let mut service = UserService::new(Uuid::new_v4(), "x", "x", CacheLevel::L1, MsSinceEpoch(0));
        assert!(matches!(
            service.remove(&mut deployment, MsSinceEpoch(1)),
            Err(UserServiceError::IllegalTransition { .. })
        ));

        let mut service = usable();
        service.set_in_use(true, MsSinceEpoch(1));
        service.remove(&mut deployment, MsSinceEpoch(2)).unwrap();
        assert_eq!(service.state, State::Removed);
        assert!(!service.in_use);
    }

    #[test]
    pub fn test_cancel_paths() {
        let now = MsSinceEpoch(1);

        let mut cancellable = FauxDeployment::finishing();
        let mut service = UserService::new(Uuid::new_v4(), "x", "x", CacheLevel::L1, MsSinceEpoch(0));
        service.cancel(&mut cancellable, now).unwrap();
        assert_eq!(service.state, State::Canceled);

        let mut stubborn = FauxDeployment::finishing().without_cancel();
        let mut service = UserService::new(Uuid::new_v4(), "x", "x", CacheLevel::L1, MsSinceEpoch(0));
        service.cancel(&mut stubborn, now).unwrap();
        assert_eq!(service.state, State::Preparing);
        assert!(service.destroy_after);
        service.finish_preparation(&mut stubborn, now).unwrap();
        assert_eq!(service.state, State::Removed);

        let mut service = usable();
        service.cancel(&mut cancellable, now).unwrap();
        assert_eq!(service.state, State::Removed);
    }

    #[test]
    pub fn test_move_to_level() {
        let mut running = FauxDeployment::with_task(TaskState::Running);
        let mut service = usable();
        service.move_to_level(CacheLevel::L2, &mut running, MsSinceEpoch(3)).unwrap();
        assert_eq!(service.cache_level, CacheLevel::L2);
        assert_eq!(service.state, State::Preparing);

        let mut done = FauxDeployment::finishing();
        let mut assigned = usable();
        assigned.assign_to_user(Uuid::new_v4(), MsSinceEpoch(4));
        assert_eq!(assigned.cache_level, CacheLevel::Assigned);
        assert_eq!(
            assigned.move_to_level(CacheLevel::L1, &mut done, MsSinceEpoch(5)),
            Err(UserServiceError::NotAssignable)
        );
    }

    #[test]
    pub fn test_sessions() {
        let mut service = usable();
        let first = service.start_session(MsSinceEpoch(1));
        let second = service.start_session(MsSinceEpoch(2));
        assert_ne!(first, second);
        assert_eq!(service.end_session(&first, MsSinceEpoch(3)), 1);
        assert_eq!(service.open_sessions().count(), 1);
        assert_eq!(service.end_session("", MsSinceEpoch(4)), 1);
        assert_eq!(service.open_sessions().count(), 0);
    }

    #[test]
    pub fn test_connection_source_truncation() {
        let mut service = usable();
        assert_eq!(service.connection_source().ip, "0.0.0.0");
        service.set_connection_source("1234567890123456789", &"h".repeat(100));
        assert_eq!(service.src_ip.len(), 15);
        assert_eq!(service.src_hostname.len(), 64);
    }

    #[test]
    pub fn test_on_delete_actions() {
        let service = usable();
        let actions = service.on_delete();
        assert!(actions.contains(&CleanupAction::ClearLogs(service.uuid)));
        assert!(actions.contains(&CleanupAction::ClearEnvironment(service.uuid)));
        assert!(actions.contains(&CleanupAction::CloseSessions(service.uuid)));
    }
}
