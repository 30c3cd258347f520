use serde::Deserialize;
use uuid::Uuid;

use crate::{
    core::{
        FindUserServiceQuery, MsSinceEpoch, ProtocolError, Query, Reply,
        collab::IdInfo,
        model::IdEntry,
        userservice::State,
    },
    driver::{ActorDriver, CertificateReply, DriverInner, DriverPollResult, Stage, candidate_ids, drive, fix_ids, unexpected},
};

/// Username used to close sessions when an unmanaged machine restarts.
pub const INIT_USERNAME: &str = "init";

#[derive(Debug, Clone, Deserialize)]
pub struct UnmanagedRequest {
    pub token: String,
    pub id: Vec<IdEntry>,
    pub secret: String,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub enum UnmanagedOutcome {
    /// The token is neither a master token nor an alias.
    InvalidToken,
    Certificate(CertificateReply),
}

/// Start up of an endpoint owned by an unmanaged service.
///
/// The service picks which of the reported ids it knows. That id receives
/// fresh certificate material, and any user service bound to it is logged
/// out since the machine just restarted.
pub struct UnmanagedDriver {
    inner: DriverInner,
    stage: Stage<Progress, UnmanagedOutcome>,
    ciphers: Option<String>,
}

/// Material gathered for an id the service recognized.
struct Recognized {
    service: Uuid,
    id: String,
    info: IdInfo,
    reply: CertificateReply,
}

enum Progress {
    Init(UnmanagedRequest),
    FindService(UnmanagedRequest),
    ResolveId {
        request: UnmanagedRequest,
        service: Uuid,
    },
    Issue {
        request: UnmanagedRequest,
        service: Uuid,
        valid_id: Option<String>,
    },
    FindUserService(Recognized),
    CloseSession(Recognized),
    /// Waiting on the release or the initialization notice.
    Settle(Recognized),
    StoreInfo(CertificateReply),
}

type Step = super::Step<Progress, UnmanagedOutcome>;

impl UnmanagedDriver {
    pub fn new(request: UnmanagedRequest, ciphers: Option<String>) -> Self {
        Self {
            inner: DriverInner::default(),
            stage: Stage::Running(Progress::Init(request)),
            ciphers,
        }
    }
}

impl ActorDriver for UnmanagedDriver {
    type Output = UnmanagedOutcome;

    fn recv(&mut self, _: MsSinceEpoch, reply: Option<Reply>) {
        let ciphers = &self.ciphers;
        drive(&mut self.inner, &mut self.stage, |inner, progress| match progress {
            Progress::Init(request) => {
                inner.send(Query::FindService { token: request.token.clone(), through_alias: true });
                Ok(Stage::Running(Progress::FindService(request)))
            }
            Progress::FindService(request) => handle_service(inner, request, reply),
            Progress::ResolveId { request, service } => handle_valid_id(inner, request, service, reply),
            Progress::Issue { request, service, valid_id } => {
                handle_issue(inner, request, service, valid_id, reply, ciphers.clone())
            }
            Progress::FindUserService(recognized) => handle_user_service(inner, recognized, reply),
            Progress::CloseSession(recognized) => handle_closed(inner, recognized, reply),
            Progress::Settle(recognized) => match reply {
                None => Ok(Stage::Running(Progress::Settle(recognized))),
                Some(Reply::Stored) => Ok(store_id_info(inner, recognized)),
                Some(_) => unexpected("unmanaged settle"),
            },
            Progress::StoreInfo(certificate) => match reply {
                None => Ok(Stage::Running(Progress::StoreInfo(certificate))),
                Some(Reply::Stored) => Ok(Stage::Finished(Some(UnmanagedOutcome::Certificate(certificate)))),
                Some(_) => unexpected("unmanaged store"),
            },
        });
    }
    fn poll_transmit(&mut self) -> Option<Query> {
        self.inner.dequeue()
    }
    fn poll_result(&mut self) -> DriverPollResult<UnmanagedOutcome> {
        self.stage.poll()
    }
}

fn handle_service(inner: &mut DriverInner, request: UnmanagedRequest, reply: Option<Reply>) -> Step {
    match reply {
        None => Ok(Stage::Running(Progress::FindService(request))),
        Some(Reply::Service(None)) => Ok(Stage::Finished(Some(UnmanagedOutcome::InvalidToken))),
        Some(Reply::Service(Some(service))) => {
            inner.send(Query::ResolveValidId { service: service.id, ids: candidate_ids(&request.id) });
            Ok(Stage::Running(Progress::ResolveId { request, service: service.id }))
        }
        Some(_) => unexpected("unmanaged service"),
    }
}

/// The ip of the entry matching the valid id, else the first reported ip.
fn infer_ip(entries: &[IdEntry], valid_id: Option<&str>) -> Option<String> {
    valid_id
        .and_then(|id| entries.iter().find(|e| e.ip == id || e.mac == id))
        .or_else(|| entries.first())
        .map(|e| e.ip.clone())
}

fn handle_valid_id(inner: &mut DriverInner, request: UnmanagedRequest, service: Uuid, reply: Option<Reply>) -> Step {
    let valid_id = match reply {
        None => return Ok(Stage::Running(Progress::ResolveId { request, service })),
        Some(Reply::ValidId(valid_id)) => valid_id,
        Some(_) => return unexpected("unmanaged valid id"),
    };
    let ip = infer_ip(&request.id, valid_id.as_deref()).ok_or(ProtocolError::MissingField("id"))?;
    inner.send(Query::IssueCertificate { ip });
    Ok(Stage::Running(Progress::Issue { request, service, valid_id }))
}

fn handle_issue(
    inner: &mut DriverInner,
    request: UnmanagedRequest,
    service: Uuid,
    valid_id: Option<String>,
    reply: Option<Reply>,
    ciphers: Option<String>,
) -> Step {
    let bundle = match reply {
        None => return Ok(Stage::Running(Progress::Issue { request, service, valid_id })),
        Some(Reply::Certificate(Ok(bundle))) => bundle,
        Some(Reply::Certificate(Err(reason))) => return Err(ProtocolError::Certificate(reason)),
        Some(_) => return unexpected("unmanaged issue"),
    };
    let reply = CertificateReply { bundle, ciphers };
    let Some(id) = valid_id else {
        return Ok(Stage::Finished(Some(UnmanagedOutcome::Certificate(reply))));
    };

    inner.send(Query::FindUserService(FindUserServiceQuery {
        ids: fix_ids(candidate_ids(&request.id)),
        service: None,
        states: vec![State::Usable, State::Preparing],
    }));
    let info = IdInfo {
        cert: reply.bundle.certificate.clone(),
        secret: request.secret,
        port: request.port,
    };
    Ok(Stage::Running(Progress::FindUserService(Recognized { service, id, info, reply })))
}

fn handle_user_service(inner: &mut DriverInner, recognized: Recognized, reply: Option<Reply>) -> Step {
    match reply {
        None => Ok(Stage::Running(Progress::FindUserService(recognized))),
        Some(Reply::UserService(Some(view))) => {
            inner.send(Query::CloseSession {
                token: view.uuid.to_string(),
                username: INIT_USERNAME.into(),
                session_id: String::new(),
            });
            Ok(Stage::Running(Progress::CloseSession(recognized)))
        }
        Some(Reply::UserService(None)) => {
            inner.send(Query::NotifyInitialization { service: recognized.service, id: recognized.id.clone() });
            Ok(Stage::Running(Progress::Settle(recognized)))
        }
        Some(_) => unexpected("unmanaged user service"),
    }
}

fn handle_closed(inner: &mut DriverInner, recognized: Recognized, reply: Option<Reply>) -> Step {
    match reply {
        None => Ok(Stage::Running(Progress::CloseSession(recognized))),
        Some(Reply::SessionClosed(Some(closed))) if closed.was_in_use && closed.removable_on_logout => {
            inner.send(Query::Release { user_service: closed.user_service });
            Ok(Stage::Running(Progress::Settle(recognized)))
        }
        Some(Reply::SessionClosed(_)) => Ok(store_id_info(inner, recognized)),
        Some(_) => unexpected("unmanaged close"),
    }
}

fn store_id_info(inner: &mut DriverInner, recognized: Recognized) -> Stage<Progress, UnmanagedOutcome> {
    let Recognized { service, id, info, reply } = recognized;
    inner.send(Query::StoreIdInfo { service, id, info });
    Stage::Running(Progress::StoreInfo(reply))
}


#[cfg(test)]
mod tests {
    use std::task::Poll;

    use serde_json::json;
    use uuid::Uuid;

    use crate::{
        ActorDriver, ClosedSession, ProtocolError, Query, Reply, UserServiceView,
        core::{
            crypto::{CertificateBundle, MsSinceEpoch, Secret},
            model::{IdEntry, ServiceRecord},
            userservice::{OsState, State},
        },
    };

    use super::{INIT_USERNAME, UnmanagedDriver, UnmanagedOutcome, UnmanagedRequest, infer_ip};

    const NOW: MsSinceEpoch = MsSinceEpoch(0);

    fn request() -> UnmanagedRequest {
        serde_json::from_value(json!({
            "token": "master",
            "id": [{"mac": "aa:bb", "ip": "10.0.0.2"}, {"mac": "cc:dd", "ip": "10.0.0.3"}],
            "secret": "s3cr3t",
            "port": 43910
        }))
        .unwrap()
    }

    fn bundle() -> CertificateBundle {
        CertificateBundle { key: Secret::new("KEY"), certificate: "CERT".into(), password: Secret::new("PASS") }
    }

    /// Walks the driver up to the certificate issuance.
    fn issued(valid_id: Option<&str>) -> (UnmanagedDriver, Uuid) {
        let service = Uuid::new_v4();
        let mut driver = UnmanagedDriver::new(request(), None);
        driver.recv(NOW, None);
        assert!(matches!(driver.poll_transmit(), Some(Query::FindService { through_alias: true, .. })));
        driver.recv(NOW, Some(Reply::Service(Some(ServiceRecord { id: service, name: "svc".into(), token: None }))));
        assert!(matches!(driver.poll_transmit(), Some(Query::ResolveValidId { ids, .. }) if ids.len() == 4));
        driver.recv(NOW, Some(Reply::ValidId(valid_id.map(String::from))));
        let expected_ip = if valid_id == Some("cc:dd") { "10.0.0.3" } else { "10.0.0.2" };
        assert!(matches!(driver.poll_transmit(), Some(Query::IssueCertificate { ip }) if ip == expected_ip));
        driver.recv(NOW, Some(Reply::Certificate(Ok(bundle()))));
        (driver, service)
    }

    #[test]
    pub fn test_infer_ip() {
        let entries = request().id;
        assert_eq!(infer_ip(&entries, Some("10.0.0.3")).as_deref(), Some("10.0.0.3"));
        assert_eq!(infer_ip(&entries, Some("cc:dd")).as_deref(), Some("10.0.0.3"));
        assert_eq!(infer_ip(&entries, Some("unknown")).as_deref(), Some("10.0.0.2"));
        assert_eq!(infer_ip(&entries, None).as_deref(), Some("10.0.0.2"));
        assert_eq!(infer_ip(&[] as &[IdEntry], None), None);
    }

    #[test]
    pub fn test_invalid_token() {
        let mut driver = UnmanagedDriver::new(request(), None);
        driver.recv(NOW, None);
        driver.recv(NOW, Some(Reply::Service(None)));
        assert!(matches!(driver.poll_result(), Poll::Ready(Ok(UnmanagedOutcome::InvalidToken))));
    }

    #[test]
    pub fn test_no_valid_id_only_issues() {
        let (mut driver, _) = issued(None);
        assert!(driver.poll_transmit().is_none());
        assert!(matches!(driver.poll_result(), Poll::Ready(Ok(UnmanagedOutcome::Certificate(_)))));
    }

    #[test]
    pub fn test_fresh_id_notifies_initialization() {
        let (mut driver, service) = issued(Some("cc:dd"));
        assert!(matches!(driver.poll_transmit(), Some(Query::FindUserService(q)) if q.service.is_none()));
        driver.recv(NOW, Some(Reply::UserService(None)));
        assert!(matches!(
            driver.poll_transmit(),
            Some(Query::NotifyInitialization { service: s, id }) if s == service && id == "cc:dd"
        ));
        driver.recv(NOW, Some(Reply::Stored));
        let Some(Query::StoreIdInfo { id, info, .. }) = driver.poll_transmit() else {
            panic!("expected the id info");
        };
        assert_eq!(id, "cc:dd");
        assert_eq!(info.cert, "CERT");
        assert_eq!(info.port, 43910);
        assert_eq!(info.secret, "s3cr3t");

        driver.recv(NOW, Some(Reply::Stored));
        let Poll::Ready(Ok(UnmanagedOutcome::Certificate(reply))) = driver.poll_result() else {
            panic!("expected certificates");
        };
        assert_eq!(reply.to_json()["private_key"], "KEY");
    }

    #[test]
    pub fn test_known_id_logs_out_service() {
        let uuid = Uuid::new_v4();
        let (mut driver, _) = issued(Some("10.0.0.2"));
        driver.poll_transmit();
        driver.recv(NOW, Some(Reply::UserService(Some(UserServiceView {
            uuid,
            unique_id: "aa:bb".into(),
            state: State::Usable,
            os_state: OsState::Usable,
            in_use: true,
        }))));
        let Some(Query::CloseSession { token, username, session_id }) = driver.poll_transmit() else {
            panic!("expected a logout");
        };
        assert_eq!(token, uuid.to_string());
        assert_eq!(username, INIT_USERNAME);
        assert!(session_id.is_empty());

        driver.recv(NOW, Some(Reply::SessionClosed(Some(ClosedSession {
            user_service: uuid,
            was_in_use: true,
            removable_on_logout: true,
        }))));
        assert!(matches!(driver.poll_transmit(), Some(Query::Release { user_service }) if user_service == uuid));
        driver.recv(NOW, Some(Reply::Stored));
        assert!(matches!(driver.poll_transmit(), Some(Query::StoreIdInfo { .. })));
        driver.recv(NOW, Some(Reply::Stored));
        assert!(driver.poll_result().is_ready());
    }

    #[test]
    pub fn test_certificate_failure() {
        let mut driver = UnmanagedDriver::new(request(), None);
        driver.recv(NOW, None);
        driver.recv(NOW, Some(Reply::Service(Some(ServiceRecord { id: Uuid::new_v4(), name: "svc".into(), token: None }))));
        driver.recv(NOW, Some(Reply::ValidId(None)));
        driver.recv(NOW, Some(Reply::Certificate(Err("boom".into()))));
        assert!(matches!(driver.poll_result(), Poll::Ready(Err(ProtocolError::Certificate(_)))));
    }
}
