use serde::Deserialize;
use serde_json::{Value, json};
use uuid::Uuid;

use crate::{
    core::{
        FindUserServiceQuery, MsSinceEpoch, ProtocolError, Query, Reply,
        crypto::random_string,
        model::{ActorKind, IdEntry, ServiceTokenAlias},
        userservice::State,
    },
    driver::{ActorDriver, DriverInner, DriverPollResult, Stage, candidate_ids, drive, fix_ids, unexpected},
};

/// Length of the alias tokens minted for unmanaged endpoints.
pub const ALIAS_TOKEN_LENGTH: usize = 40;

#[derive(Debug, Clone, Deserialize)]
pub struct InitializeRequest {
    #[serde(rename = "type")]
    pub kind: ActorKind,
    pub version: String,
    pub token: String,
    pub id: Vec<IdEntry>,
}

/// What an actor learns from initialization.
#[derive(Debug, Clone, PartialEq)]
pub enum Initialization {
    /// A user service claims this machine.
    Managed {
        own_token: Uuid,
        unique_id: String,
        os: Value,
        alias_token: Option<String>,
    },
    /// Nothing claims this machine yet.
    NotManaged { alias_token: Option<String> },
}

impl Initialization {
    /// The shape actors expect on the wire.
    pub fn to_json(&self) -> Value {
        match self {
            Self::Managed { own_token, unique_id, os, alias_token } => json!({
                "own_token": own_token.to_string(),
                "token": own_token.to_string(),
                "master_token": alias_token,
                "unique_id": unique_id,
                "os": os,
            }),
            Self::NotManaged { alias_token } => json!({
                "own_token": Value::Null,
                "token": alias_token,
                "master_token": alias_token,
                "unique_id": Value::Null,
                "os": Value::Null,
            }),
        }
    }
}

/// Binds an actor to the user service matching one of its ids.
///
/// Managed actors authenticate with their registration token. Unmanaged
/// ones present either an alias, which is kept as is, or a service master
/// token, which gets them an alias of their own bound to their first id.
pub struct InitializeDriver {
    inner: DriverInner,
    stage: Stage<Progress, Initialization>,
}

enum Progress {
    Init(InitializeRequest),
    /// Managed, waiting on the token check.
    ValidateToken(InitializeRequest),
    /// Unmanaged, waiting on the alias lookup of the presented token.
    FindAlias(InitializeRequest),
    /// Unmanaged, the token was not an alias, so it must be a master token.
    FindService(InitializeRequest),
    /// Unmanaged, waiting on the alias bound to this machine.
    FindOwnAlias {
        request: InitializeRequest,
        service: Uuid,
        unique_id: String,
    },
    /// Unmanaged, waiting for a fresh alias to be stored.
    CreateAlias {
        request: InitializeRequest,
        service: Uuid,
        alias: String,
    },
    FindUserService {
        version: String,
        alias_token: Option<String>,
    },
    Prepare {
        own_token: Uuid,
        alias_token: Option<String>,
    },
}

type Step = super::Step<Progress, Initialization>;

impl InitializeDriver {
    pub fn new(request: InitializeRequest) -> Self {
        Self {
            inner: DriverInner::default(),
            stage: Stage::Running(Progress::Init(request)),
        }
    }
}

impl ActorDriver for InitializeDriver {
    type Output = Initialization;

    fn recv(&mut self, _: MsSinceEpoch, reply: Option<Reply>) {
        drive(&mut self.inner, &mut self.stage, |inner, progress| match progress {
            Progress::Init(request) => handle_init(inner, request),
            Progress::ValidateToken(request) => handle_validate(inner, request, reply),
            Progress::FindAlias(request) => handle_find_alias(inner, request, reply),
            Progress::FindService(request) => handle_find_service(inner, request, reply),
            Progress::FindOwnAlias { request, service, unique_id } => {
                handle_own_alias(inner, request, service, unique_id, reply)
            }
            Progress::CreateAlias { request, service, alias } => {
                handle_alias_created(inner, request, service, alias, reply)
            }
            Progress::FindUserService { version, alias_token } => {
                handle_user_service(inner, version, alias_token, reply)
            }
            Progress::Prepare { own_token, alias_token } => handle_prepared(own_token, alias_token, reply),
        });
    }
    fn poll_transmit(&mut self) -> Option<Query> {
        self.inner.dequeue()
    }
    fn poll_result(&mut self) -> DriverPollResult<Initialization> {
        self.stage.poll()
    }
}

fn waiting(progress: Progress) -> Step {
    Ok(Stage::Running(progress))
}

fn handle_init(inner: &mut DriverInner, request: InitializeRequest) -> Step {
    match request.kind {
        ActorKind::Managed => {
            inner.send(Query::ValidateActorToken { token: request.token.clone() });
            waiting(Progress::ValidateToken(request))
        }
        ActorKind::Unmanaged => {
            inner.send(Query::FindAlias { alias: request.token.clone() });
            waiting(Progress::FindAlias(request))
        }
    }
}

fn handle_validate(inner: &mut DriverInner, request: InitializeRequest, reply: Option<Reply>) -> Step {
    match reply {
        None => waiting(Progress::ValidateToken(request)),
        Some(Reply::TokenValid(true)) => {
            let ids = request.id.iter().take(5).map(|e| e.mac.as_str()).filter(|m| !m.is_empty());
            find_user_service(inner, fix_ids(ids), None, request.version, None)
        }
        Some(Reply::TokenValid(false)) => Err(ProtocolError::BlockAccess("invalid actor token")),
        Some(_) => unexpected("initialize validate"),
    }
}

fn handle_find_alias(inner: &mut DriverInner, request: InitializeRequest, reply: Option<Reply>) -> Step {
    match reply {
        None => waiting(Progress::FindAlias(request)),
        // A presented alias is kept as the actor's token, only master tokens mint one.
        Some(Reply::Alias(Some(alias))) => unmanaged_lookup(inner, request, alias.service, alias.alias),
        Some(Reply::Alias(None)) => {
            inner.send(Query::FindService { token: request.token.clone(), through_alias: false });
            waiting(Progress::FindService(request))
        }
        Some(_) => unexpected("initialize alias"),
    }
}

fn handle_find_service(inner: &mut DriverInner, request: InitializeRequest, reply: Option<Reply>) -> Step {
    match reply {
        None => waiting(Progress::FindService(request)),
        Some(Reply::Service(Some(service))) => bind_alias(inner, request, service.id),
        Some(Reply::Service(None)) => Err(ProtocolError::BlockAccess("unknown service token")),
        Some(_) => unexpected("initialize service"),
    }
}

/// Looks up the alias of this machine, keyed by its first id.
fn bind_alias(inner: &mut DriverInner, request: InitializeRequest, service: Uuid) -> Step {
    let first = request.id.first().ok_or(ProtocolError::MissingField("id"))?;
    let unique_id = if first.mac.is_empty() { first.ip.clone() } else { first.mac.clone() };
    inner.send(Query::FindAliasFor { service, unique_id: unique_id.clone() });
    waiting(Progress::FindOwnAlias { request, service, unique_id })
}

fn handle_own_alias(
    inner: &mut DriverInner,
    request: InitializeRequest,
    service: Uuid,
    unique_id: String,
    reply: Option<Reply>,
) -> Step {
    match reply {
        None => waiting(Progress::FindOwnAlias { request, service, unique_id }),
        Some(Reply::Alias(Some(alias))) => unmanaged_lookup(inner, request, service, alias.alias),
        Some(Reply::Alias(None)) => {
            let alias = random_string(ALIAS_TOKEN_LENGTH);
            inner.send(Query::CreateAlias(ServiceTokenAlias {
                alias: alias.clone(),
                service,
                unique_id: Some(unique_id),
            }));
            waiting(Progress::CreateAlias { request, service, alias })
        }
        Some(_) => unexpected("initialize own alias"),
    }
}

fn handle_alias_created(
    inner: &mut DriverInner,
    request: InitializeRequest,
    service: Uuid,
    alias: String,
    reply: Option<Reply>,
) -> Step {
    match reply {
        None => waiting(Progress::CreateAlias { request, service, alias }),
        Some(Reply::Stored) => unmanaged_lookup(inner, request, service, alias),
        Some(_) => unexpected("initialize create alias"),
    }
}

fn unmanaged_lookup(inner: &mut DriverInner, request: InitializeRequest, service: Uuid, alias: String) -> Step {
    let ids = fix_ids(candidate_ids(&request.id));
    find_user_service(inner, ids, Some(service), request.version, Some(alias))
}

fn find_user_service(
    inner: &mut DriverInner,
    ids: Vec<String>,
    service: Option<Uuid>,
    version: String,
    alias_token: Option<String>,
) -> Step {
    inner.send(Query::FindUserService(FindUserServiceQuery {
        ids,
        service,
        states: vec![State::Usable, State::Preparing],
    }));
    waiting(Progress::FindUserService { version, alias_token })
}

fn handle_user_service(inner: &mut DriverInner, version: String, alias_token: Option<String>, reply: Option<Reply>) -> Step {
    match reply {
        None => waiting(Progress::FindUserService { version, alias_token }),
        Some(Reply::UserService(None)) => Ok(Stage::Finished(Some(Initialization::NotManaged { alias_token }))),
        Some(Reply::UserService(Some(view))) => {
            inner.send(Query::PrepareActor { user_service: view.uuid, version });
            waiting(Progress::Prepare { own_token: view.uuid, alias_token })
        }
        Some(_) => unexpected("initialize user service"),
    }
}

fn handle_prepared(own_token: Uuid, alias_token: Option<String>, reply: Option<Reply>) -> Step {
    match reply {
        None => waiting(Progress::Prepare { own_token, alias_token }),
        Some(Reply::Prepared(prepared)) => Ok(Stage::Finished(Some(Initialization::Managed {
            own_token,
            unique_id: prepared.unique_id,
            os: prepared.os,
            alias_token,
        }))),
        Some(_) => unexpected("initialize prepare"),
    }
}


#[cfg(test)]
mod tests {
    use std::task::Poll;

    use serde_json::json;
    use uuid::Uuid;

    use crate::{
        ActorDriver, PreparedActor, ProtocolError, Query, Reply, UserServiceView,
        core::{
            crypto::MsSinceEpoch,
            model::{ServiceRecord, ServiceTokenAlias},
            userservice::{OsState, State},
        },
    };

    use super::{ALIAS_TOKEN_LENGTH, InitializeDriver, InitializeRequest, Initialization};

    const NOW: MsSinceEpoch = MsSinceEpoch(0);

    fn request(kind: &str) -> InitializeRequest {
        serde_json::from_value(json!({
            "type": kind,
            "version": "4.0.0",
            "token": "tok",
            "id": [{"mac": "aa:bb:cc:dd:ee:ff", "ip": "10.0.0.2"}, {"mac": "11:22:33:44:55:66", "ip": "10.0.1.2"}]
        }))
        .unwrap()
    }

    fn view(uuid: Uuid) -> UserServiceView {
        UserServiceView {
            uuid,
            unique_id: "AA:BB:CC:DD:EE:FF".into(),
            state: State::Usable,
            os_state: OsState::Preparing,
            in_use: false,
        }
    }

    #[test]
    pub fn test_managed_flow() {
        let uuid = Uuid::new_v4();
        let mut driver = InitializeDriver::new(request("managed"));
        driver.recv(NOW, None);
        assert!(matches!(driver.poll_transmit(), Some(Query::ValidateActorToken { token }) if token == "tok"));

        driver.recv(NOW, Some(Reply::TokenValid(true)));
        let Some(Query::FindUserService(query)) = driver.poll_transmit() else {
            panic!("expected a user service lookup");
        };
        assert_eq!(query.service, None);
        assert!(query.ids.contains(&"AA:BB:CC:DD:EE:FF".to_string()));
        assert!(query.ids.contains(&"aa:bb:cc:dd:ee:ff".to_string()));
        assert!(!query.ids.contains(&"10.0.0.2".to_string()));

        driver.recv(NOW, Some(Reply::UserService(Some(view(uuid)))));
        assert!(matches!(driver.poll_transmit(), Some(Query::PrepareActor { user_service, .. }) if user_service == uuid));

        driver.recv(NOW, Some(Reply::Prepared(PreparedActor {
            unique_id: "AA:BB:CC:DD:EE:FF".into(),
            os: json!({"action": "rename", "name": "desk"}),
        })));
        let Poll::Ready(Ok(result)) = driver.poll_result() else {
            panic!("expected an initialization");
        };
        let wire = result.to_json();
        assert_eq!(wire["own_token"], uuid.to_string());
        assert_eq!(wire["master_token"], serde_json::Value::Null);
        assert_eq!(wire["os"]["name"], "desk");
    }

    #[test]
    pub fn test_managed_bad_token() {
        let mut driver = InitializeDriver::new(request("managed"));
        driver.recv(NOW, None);
        driver.recv(NOW, Some(Reply::TokenValid(false)));
        assert!(matches!(driver.poll_result(), Poll::Ready(Err(ProtocolError::BlockAccess(_)))));
    }

    #[test]
    pub fn test_managed_not_found() {
        let mut driver = InitializeDriver::new(request("managed"));
        driver.recv(NOW, None);
        driver.recv(NOW, Some(Reply::TokenValid(true)));
        driver.recv(NOW, Some(Reply::UserService(None)));
        let Poll::Ready(Ok(result)) = driver.poll_result() else {
            panic!("expected an initialization");
        };
        assert_eq!(result, Initialization::NotManaged { alias_token: None });
        assert_eq!(result.to_json()["own_token"], serde_json::Value::Null);
    }

    #[test]
    pub fn test_unmanaged_mints_alias() {
        let service = Uuid::new_v4();
        let mut driver = InitializeDriver::new(request("unmanaged"));
        driver.recv(NOW, None);
        assert!(matches!(driver.poll_transmit(), Some(Query::FindAlias { alias }) if alias == "tok"));

        driver.recv(NOW, Some(Reply::Alias(None)));
        assert!(matches!(driver.poll_transmit(), Some(Query::FindService { through_alias: false, .. })));

        driver.recv(NOW, Some(Reply::Service(Some(ServiceRecord { id: service, name: "svc".into(), token: Some("tok".into()) }))));
        assert!(matches!(
            driver.poll_transmit(),
            Some(Query::FindAliasFor { unique_id, .. }) if unique_id == "aa:bb:cc:dd:ee:ff"
        ));

        driver.recv(NOW, Some(Reply::Alias(None)));
        let Some(Query::CreateAlias(alias)) = driver.poll_transmit() else {
            panic!("expected an alias");
        };
        assert_eq!(alias.alias.len(), ALIAS_TOKEN_LENGTH);
        assert_eq!(alias.service, service);

        driver.recv(NOW, Some(Reply::Stored));
        let Some(Query::FindUserService(query)) = driver.poll_transmit() else {
            panic!("expected a user service lookup");
        };
        assert_eq!(query.service, Some(service));
        assert!(query.ids.contains(&"10.0.1.2".to_string()));

        driver.recv(NOW, Some(Reply::UserService(None)));
        let Poll::Ready(Ok(result)) = driver.poll_result() else {
            panic!("expected an initialization");
        };
        assert_eq!(result, Initialization::NotManaged { alias_token: Some(alias.alias.clone()) });
        assert_eq!(result.to_json()["token"], alias.alias);
    }

    #[test]
    pub fn test_unmanaged_reuses_alias() {
        let service = Uuid::new_v4();
        let existing = ServiceTokenAlias { alias: "alias-1".into(), service, unique_id: Some("aa:bb:cc:dd:ee:ff".into()) };

        let mut driver = InitializeDriver::new(request("unmanaged"));
        driver.recv(NOW, None);
        driver.poll_transmit();
        driver.recv(NOW, Some(Reply::Alias(None)));
        driver.poll_transmit();
        driver.recv(NOW, Some(Reply::Service(Some(ServiceRecord { id: service, name: "svc".into(), token: Some("tok".into()) }))));
        assert!(matches!(driver.poll_transmit(), Some(Query::FindAliasFor { .. })));
        driver.recv(NOW, Some(Reply::Alias(Some(existing))));
        assert!(matches!(driver.poll_transmit(), Some(Query::FindUserService(_))));
        driver.recv(NOW, Some(Reply::UserService(None)));
        assert!(matches!(
            driver.poll_result(),
            Poll::Ready(Ok(Initialization::NotManaged { alias_token: Some(a) })) if a == "alias-1"
        ));
    }

    #[test]
    pub fn test_presented_alias_is_kept() {
        let service = Uuid::new_v4();
        let legacy = ServiceTokenAlias { alias: "legacy-alias".into(), service, unique_id: None };

        let mut driver = InitializeDriver::new(request("unmanaged"));
        driver.recv(NOW, None);
        driver.poll_transmit();
        driver.recv(NOW, Some(Reply::Alias(Some(legacy))));
        let Some(Query::FindUserService(query)) = driver.poll_transmit() else {
            panic!("expected a user service lookup, not another alias");
        };
        assert_eq!(query.service, Some(service));
        assert!(driver.poll_transmit().is_none());

        driver.recv(NOW, Some(Reply::UserService(None)));
        let Poll::Ready(Ok(result)) = driver.poll_result() else {
            panic!("expected an initialization");
        };
        assert_eq!(result.to_json()["master_token"], "legacy-alias");
    }

    #[test]
    pub fn test_unmanaged_unknown_token() {
        let mut driver = InitializeDriver::new(request("unmanaged"));
        driver.recv(NOW, None);
        driver.recv(NOW, Some(Reply::Alias(None)));
        driver.recv(NOW, Some(Reply::Service(None)));
        assert!(matches!(driver.poll_result(), Poll::Ready(Err(ProtocolError::BlockAccess(_)))));
    }

    #[test]
    pub fn test_unmanaged_without_ids() {
        let mut request = request("unmanaged");
        request.id.clear();
        let mut driver = InitializeDriver::new(request);
        driver.recv(NOW, None);
        driver.recv(NOW, Some(Reply::Alias(None)));
        driver.recv(NOW, Some(Reply::Service(Some(ServiceRecord {
            id: Uuid::new_v4(),
            name: "svc".into(),
            token: Some("tok".into()),
        }))));
        assert!(matches!(driver.poll_result(), Poll::Ready(Err(ProtocolError::MissingField("id")))));
    }
}
