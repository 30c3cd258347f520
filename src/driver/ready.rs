use serde::Deserialize;
use serde_json::{Value, json};

use crate::{
    core::{
        CommitReadyQuery, MsSinceEpoch, ProtocolError, Query, Reply, UserServiceView,
        crypto::CertificateBundle,
        userservice::OsState,
    },
    driver::{ActorDriver, DriverInner, DriverPollResult, Stage, drive, unexpected},
};

#[derive(Debug, Clone, Deserialize)]
pub struct ReadyRequest {
    pub token: String,
    pub ip: String,
    pub port: u16,
    pub secret: String,
}

/// The certificate material an actor serves its comms channel with.
#[derive(Debug, Clone)]
pub struct CertificateReply {
    pub bundle: CertificateBundle,
    pub ciphers: Option<String>,
}

impl CertificateReply {
    /// Old actors read `key` and `certificate`, newer ones the longer names.
    pub fn to_json(&self) -> Value {
        let key = self.bundle.key.expose();
        json!({
            "key": key,
            "private_key": key,
            "certificate": self.bundle.certificate,
            "server_certificate": self.bundle.certificate,
            "password": self.bundle.password.expose(),
            "ciphers": self.ciphers,
        })
    }
}

pub fn comms_url(ip: &str, port: u16, secret: &str) -> String {
    format!("https://{ip}:{port}/actor/{secret}")
}

/// Marks a user service ready (or records its new ip) and issues the
/// certificate for its comms channel.
pub struct ReadyDriver {
    inner: DriverInner,
    stage: Stage<Progress, CertificateReply>,
    clear_in_use: bool,
    ciphers: Option<String>,
}

enum Progress {
    Init(ReadyRequest),
    Fetch(ReadyRequest),
    Issue {
        request: ReadyRequest,
        service: UserServiceView,
    },
    Commit(CertificateBundle),
}

type Step = super::Step<Progress, CertificateReply>;

impl ReadyDriver {
    /// A ready report, which also ends any previous use of the service.
    pub fn ready(request: ReadyRequest, ciphers: Option<String>) -> Self {
        Self::new(request, true, ciphers)
    }

    /// An ip change report, the service stays in whatever use it is in.
    pub fn ip_change(request: ReadyRequest, ciphers: Option<String>) -> Self {
        Self::new(request, false, ciphers)
    }

    fn new(request: ReadyRequest, clear_in_use: bool, ciphers: Option<String>) -> Self {
        Self {
            inner: DriverInner::default(),
            stage: Stage::Running(Progress::Init(request)),
            clear_in_use,
            ciphers,
        }
    }
}

impl ActorDriver for ReadyDriver {
    type Output = CertificateReply;

    fn recv(&mut self, _: MsSinceEpoch, reply: Option<Reply>) {
        let clear_in_use = self.clear_in_use;
        let ciphers = &self.ciphers;
        drive(&mut self.inner, &mut self.stage, |inner, progress| match progress {
            Progress::Init(request) => {
                inner.send(Query::FetchUserService { token: request.token.clone() });
                Ok(Stage::Running(Progress::Fetch(request)))
            }
            Progress::Fetch(request) => handle_fetch(inner, request, reply),
            Progress::Issue { request, service } => handle_issue(inner, request, service, reply, clear_in_use),
            Progress::Commit(bundle) => match reply {
                None => Ok(Stage::Running(Progress::Commit(bundle))),
                Some(Reply::Stored) => Ok(Stage::Finished(Some(CertificateReply {
                    bundle,
                    ciphers: ciphers.clone(),
                }))),
                Some(_) => unexpected("ready commit"),
            },
        });
    }
    fn poll_transmit(&mut self) -> Option<Query> {
        self.inner.dequeue()
    }
    fn poll_result(&mut self) -> DriverPollResult<CertificateReply> {
        self.stage.poll()
    }
}

fn handle_fetch(inner: &mut DriverInner, request: ReadyRequest, reply: Option<Reply>) -> Step {
    match reply {
        None => Ok(Stage::Running(Progress::Fetch(request))),
        Some(Reply::UserService(Some(service))) => {
            inner.send(Query::IssueCertificate { ip: request.ip.clone() });
            Ok(Stage::Running(Progress::Issue { request, service }))
        }
        Some(Reply::UserService(None)) => Err(ProtocolError::BlockAccess("no user service for token")),
        Some(_) => unexpected("ready fetch"),
    }
}

fn handle_issue(
    inner: &mut DriverInner,
    request: ReadyRequest,
    service: UserServiceView,
    reply: Option<Reply>,
    clear_in_use: bool,
) -> Step {
    match reply {
        None => Ok(Stage::Running(Progress::Issue { request, service })),
        Some(Reply::Certificate(Ok(bundle))) => {
            inner.send(Query::CommitReady(CommitReadyQuery {
                user_service: service.uuid,
                comms_url: comms_url(&request.ip, request.port, &request.secret),
                ip: request.ip,
                certificate: bundle.clone(),
                mark_os_usable: service.os_state != OsState::Usable,
                clear_in_use,
            }));
            Ok(Stage::Running(Progress::Commit(bundle)))
        }
        Some(Reply::Certificate(Err(reason))) => Err(ProtocolError::Certificate(reason)),
        Some(_) => unexpected("ready issue"),
    }
}
