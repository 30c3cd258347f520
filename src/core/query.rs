use uuid::Uuid;

use crate::core::{
    action::NotifyAction,
    collab::IdInfo,
    crypto::{CertificateBundle, MsSinceEpoch},
    model::{ActorIdentity, IdEntry, ServiceRecord, ServiceTokenAlias},
    userservice::{ConnectionSource, OsState, State},
};

/// Work a protocol driver needs from the outside world.
#[derive(Debug, Clone)]
pub enum Query {
    FindActorByMac { mac: String },
    StoreActor(ActorIdentity),
    ValidateActorToken { token: String },
    /// Looks a service up by master token, optionally following aliases.
    FindService { token: String, through_alias: bool },
    FindAlias { alias: String },
    FindAliasFor { service: Uuid, unique_id: String },
    CreateAlias(ServiceTokenAlias),
    FindUserService(FindUserServiceQuery),
    PrepareActor { user_service: Uuid, version: String },
    FetchUserService { token: String },
    OpenSession { token: String, username: String },
    CloseSession { token: String, username: String, session_id: String },
    Release { user_service: Uuid },
    IssueCertificate { ip: String },
    CommitReady(CommitReadyQuery),
    NotifyService(NotifyServiceQuery),
    ResolveValidId { service: Uuid, ids: Vec<String> },
    NotifyInitialization { service: Uuid, id: String },
    StoreIdInfo { service: Uuid, id: String, info: IdInfo },
}

impl Query {
    pub fn name(&self) -> &'static str {
        match self {
            Self::FindActorByMac { .. } => "find_actor_by_mac",
            Self::StoreActor(_) => "store_actor",
            Self::ValidateActorToken { .. } => "validate_actor_token",
            Self::FindService { .. } => "find_service",
            Self::FindAlias { .. } => "find_alias",
            Self::FindAliasFor { .. } => "find_alias_for",
            Self::CreateAlias(_) => "create_alias",
            Self::FindUserService(_) => "find_user_service",
            Self::PrepareActor { .. } => "prepare_actor",
            Self::FetchUserService { .. } => "fetch_user_service",
            Self::OpenSession { .. } => "open_session",
            Self::CloseSession { .. } => "close_session",
            Self::Release { .. } => "release",
            Self::IssueCertificate { .. } => "issue_certificate",
            Self::CommitReady(_) => "commit_ready",
            Self::NotifyService(_) => "notify_service",
            Self::ResolveValidId { .. } => "resolve_valid_id",
            Self::NotifyInitialization { .. } => "notify_initialization",
            Self::StoreIdInfo { .. } => "store_id_info",
        }
    }
}

/// The answer to a [Query].
#[derive(Debug, Clone)]
pub enum Reply {
    Stored,
    Actor(Option<ActorIdentity>),
    TokenValid(bool),
    Service(Option<ServiceRecord>),
    Alias(Option<ServiceTokenAlias>),
    UserService(Option<UserServiceView>),
    Prepared(PreparedActor),
    SessionOpened(Option<OpenedSession>),
    SessionClosed(Option<ClosedSession>),
    Certificate(Result<CertificateBundle, String>),
    Notified(Result<(), String>),
    ValidId(Option<String>),
}

/// Matches user services whose unique id is one of `ids`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FindUserServiceQuery {
    pub ids: Vec<String>,
    /// Restricts the search to the pools of this service.
    pub service: Option<Uuid>,
    pub states: Vec<State>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserServiceView {
    pub uuid: Uuid,
    pub unique_id: String,
    pub state: State,
    pub os_state: OsState,
    pub in_use: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PreparedActor {
    pub unique_id: String,
    pub os: serde_json::Value,
}

/// Policy of the OS manager relevant to a login.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoginPolicy {
    pub max_idle: Option<u64>,
    pub ignore_deadline: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenedSession {
    pub session_id: String,
    pub source: ConnectionSource,
    pub pool_deadline: Option<MsSinceEpoch>,
    pub os_manager: Option<LoginPolicy>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClosedSession {
    pub user_service: Uuid,
    pub was_in_use: bool,
    /// True as well when the pool has no OS manager.
    pub removable_on_logout: bool,
}

#[derive(Debug, Clone)]
pub struct CommitReadyQuery {
    pub user_service: Uuid,
    pub ip: String,
    pub comms_url: String,
    pub certificate: CertificateBundle,
    pub mark_os_usable: bool,
    pub clear_in_use: bool,
}

#[derive(Debug, Clone)]
pub struct NotifyServiceQuery {
    pub token: String,
    pub action: NotifyAction,
    pub ids: Vec<IdEntry>,
    pub session_type: String,
    pub data: Option<serde_json::Value>,
}
