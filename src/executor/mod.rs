mod actor;

use std::task::Poll;

use serde_json::Value;
use uuid::Uuid;

pub use actor::*;

use crate::{
    ActorDriver,
    core::{
        ClosedSession, CommitReadyQuery, FindUserServiceQuery, NotifyServiceQuery, OpenedSession, PreparedActor,
        ProtocolError, Query, Reply, StoreError, UserServiceView,
        collab::IdInfo,
        crypto::{CertificateIssuer, MsSinceEpoch},
        model::{ActorIdentity, LogLevel, ServiceRecord, ServiceTokenAlias, StaffUser},
    },
};

/// Everything the actor protocol needs from persistence and from the
/// collaborators attached to pools and services.
///
/// Lookups that miss return `Ok(None)`, errors are reserved for failures of
/// the backend itself.
pub trait BrokerBackend: Send + Sync {
    fn find_actor_by_mac(&self, mac: &str) -> Result<Option<ActorIdentity>, StoreError>;
    fn store_actor(&self, identity: ActorIdentity) -> Result<(), StoreError>;
    fn validate_actor_token(&self, token: &str) -> Result<bool, StoreError>;

    fn find_service(&self, token: &str, through_alias: bool) -> Result<Option<ServiceRecord>, StoreError>;
    fn find_alias(&self, alias: &str) -> Result<Option<ServiceTokenAlias>, StoreError>;
    fn find_alias_for(&self, service: Uuid, unique_id: &str) -> Result<Option<ServiceTokenAlias>, StoreError>;
    fn create_alias(&self, alias: ServiceTokenAlias) -> Result<(), StoreError>;

    fn find_user_service(&self, query: &FindUserServiceQuery) -> Result<Option<UserServiceView>, StoreError>;
    /// Records the actor version and collects the OS manager instructions.
    fn prepare_actor(&self, user_service: Uuid, version: &str, now: MsSinceEpoch) -> Result<PreparedActor, StoreError>;
    fn fetch_user_service(&self, token: &str) -> Result<Option<UserServiceView>, StoreError>;
    fn open_session(&self, token: &str, username: &str, now: MsSinceEpoch) -> Result<Option<OpenedSession>, StoreError>;
    fn close_session(&self, token: &str, username: &str, session_id: &str, now: MsSinceEpoch) -> Result<Option<ClosedSession>, StoreError>;
    fn release(&self, user_service: Uuid, now: MsSinceEpoch) -> Result<(), StoreError>;
    fn commit_ready(&self, query: CommitReadyQuery, now: MsSinceEpoch) -> Result<(), StoreError>;

    /// The inner result carries the reason the service refused the notification.
    fn notify_service(&self, query: &NotifyServiceQuery) -> Result<Result<(), String>, StoreError>;
    fn resolve_valid_id(&self, service: Uuid, ids: &[String]) -> Result<Option<String>, StoreError>;
    fn notify_initialization(&self, service: Uuid, id: &str) -> Result<(), StoreError>;
    fn store_id_info(&self, service: Uuid, id: &str, info: IdInfo) -> Result<(), StoreError>;

    /// Returns false when the token names no user service.
    fn record_version(&self, token: &str, version: &str, ip: &str, now: MsSinceEpoch) -> Result<bool, StoreError>;
    /// The version last reported by the actor of a user service.
    fn actor_version(&self, token: &str) -> Result<Option<String>, StoreError>;
    /// Returns false when the token names no user service.
    fn append_log(&self, token: &str, level: LogLevel, message: &str, now: MsSinceEpoch) -> Result<bool, StoreError>;
    fn authenticate(&self, bearer: &str) -> Option<StaffUser>;
}

/// Answers a single driver query against the backend.
pub fn answer<B, I>(backend: &B, query: Query, now: MsSinceEpoch) -> Result<Reply, StoreError>
where
    B: BrokerBackend + ?Sized,
    I: CertificateIssuer,
{
    Ok(match query {
        Query::FindActorByMac { mac } => Reply::Actor(backend.find_actor_by_mac(&mac)?),
        Query::StoreActor(identity) => {
            backend.store_actor(identity)?;
            Reply::Stored
        }
        Query::ValidateActorToken { token } => Reply::TokenValid(backend.validate_actor_token(&token)?),
        Query::FindService { token, through_alias } => Reply::Service(backend.find_service(&token, through_alias)?),
        Query::FindAlias { alias } => Reply::Alias(backend.find_alias(&alias)?),
        Query::FindAliasFor { service, unique_id } => Reply::Alias(backend.find_alias_for(service, &unique_id)?),
        Query::CreateAlias(alias) => {
            backend.create_alias(alias)?;
            Reply::Stored
        }
        Query::FindUserService(query) => Reply::UserService(backend.find_user_service(&query)?),
        Query::PrepareActor { user_service, version } => {
            Reply::Prepared(backend.prepare_actor(user_service, &version, now)?)
        }
        Query::FetchUserService { token } => Reply::UserService(backend.fetch_user_service(&token)?),
        Query::OpenSession { token, username } => Reply::SessionOpened(backend.open_session(&token, &username, now)?),
        Query::CloseSession { token, username, session_id } => {
            Reply::SessionClosed(backend.close_session(&token, &username, &session_id, now)?)
        }
        Query::Release { user_service } => {
            backend.release(user_service, now)?;
            Reply::Stored
        }
        Query::IssueCertificate { ip } => Reply::Certificate(I::issue(&ip).map_err(|e| e.to_string())),
        Query::CommitReady(query) => {
            backend.commit_ready(query, now)?;
            Reply::Stored
        }
        Query::NotifyService(query) => Reply::Notified(backend.notify_service(&query)?),
        Query::ResolveValidId { service, ids } => Reply::ValidId(backend.resolve_valid_id(service, &ids)?),
        Query::NotifyInitialization { service, id } => {
            backend.notify_initialization(service, &id)?;
            Reply::Stored
        }
        Query::StoreIdInfo { service, id, info } => {
            backend.store_id_info(service, &id, info)?;
            Reply::Stored
        }
    })
}

/// Drives a machine to completion, answering its queries from the backend.
pub fn run<D, B, I>(backend: &B, mut machine: D, now: MsSinceEpoch) -> Result<D::Output, ProtocolError>
where
    D: ActorDriver,
    B: BrokerBackend + ?Sized,
    I: CertificateIssuer,
{
    machine.recv(now, None);

    let mut poll = machine.poll_result();
    while poll.is_pending() {
        let Some(transmit) = machine.poll_transmit() else {
            return Err(ProtocolError::UnexpectedReply("stalled without a query"));
        };
        tracing::trace!(query = transmit.name(), "answering driver query");
        machine.recv(now, Some(answer::<B, I>(backend, transmit, now)?));
        poll = machine.poll_result();
    }

    match poll {
        Poll::Ready(result) => result,
        Poll::Pending => Err(ProtocolError::UnexpectedReply("stalled without a query")),
    }
}

/// The `{result, error}` pair every actor call answers with.
#[derive(Debug, Clone, PartialEq)]
pub struct ActorReply {
    pub result: Value,
    pub error: Option<String>,
}

impl ActorReply {
    pub fn ok(result: impl Into<Value>) -> Self {
        Self { result: result.into(), error: None }
    }
    pub fn failed(result: impl Into<Value>, error: impl Into<String>) -> Self {
        Self { result: result.into(), error: Some(error.into()) }
    }
}
