use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    core::{
        MsSinceEpoch, NotifyServiceQuery, OpenedSession, ProtocolError, Query, Reply,
        action::NotifyAction,
        model::{ActorKind, IdEntry},
    },
    driver::{ActorDriver, DriverInner, DriverPollResult, Stage, drive, unexpected},
};

#[derive(Debug, Clone, Deserialize)]
pub struct LoginRequest {
    #[serde(rename = "type", default)]
    pub kind: ActorKind,
    pub token: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub session_type: String,
    #[serde(default)]
    pub id: Vec<IdEntry>,
}

/// What the actor needs to enforce the session on its side.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LoginInfo {
    pub ip: String,
    pub hostname: String,
    /// Seconds left until the pool deadline.
    pub deadline: Option<u64>,
    /// Seconds of idle time tolerated by the OS manager.
    pub max_idle: Option<u64>,
    pub session_id: String,
}

impl LoginInfo {
    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Opens a session on the user service named by the token.
///
/// Unmanaged actors whose token names no user service are forwarded to
/// their owning service instead, and receive an empty [LoginInfo].
pub struct LoginDriver {
    inner: DriverInner,
    stage: Stage<Progress, LoginInfo>,
}

enum Progress {
    Init(LoginRequest),
    Open(LoginRequest),
    Notify,
}

type Step = super::Step<Progress, LoginInfo>;

impl LoginDriver {
    pub fn new(request: LoginRequest) -> Self {
        Self {
            inner: DriverInner::default(),
            stage: Stage::Running(Progress::Init(request)),
        }
    }
}

impl ActorDriver for LoginDriver {
    type Output = LoginInfo;

    fn recv(&mut self, now: MsSinceEpoch, reply: Option<Reply>) {
        drive(&mut self.inner, &mut self.stage, |inner, progress| match progress {
            Progress::Init(request) => {
                inner.send(Query::OpenSession {
                    token: request.token.clone(),
                    username: request.username.clone(),
                });
                Ok(Stage::Running(Progress::Open(request)))
            }
            Progress::Open(request) => handle_open(inner, request, reply, now),
            Progress::Notify => handle_notified(reply),
        });
    }
    fn poll_transmit(&mut self) -> Option<Query> {
        self.inner.dequeue()
    }
    fn poll_result(&mut self) -> DriverPollResult<LoginInfo> {
        self.stage.poll()
    }
}

fn handle_open(inner: &mut DriverInner, request: LoginRequest, reply: Option<Reply>, now: MsSinceEpoch) -> Step {
    match reply {
        None => Ok(Stage::Running(Progress::Open(request))),
        Some(Reply::SessionOpened(Some(opened))) => Ok(Stage::Finished(Some(login_info(opened, now)))),
        Some(Reply::SessionOpened(None)) => match request.kind {
            ActorKind::Managed => Err(ProtocolError::BlockAccess("no user service for token")),
            ActorKind::Unmanaged => {
                inner.send(Query::NotifyService(NotifyServiceQuery {
                    token: request.token,
                    action: NotifyAction::Login,
                    ids: request.id,
                    session_type: request.session_type,
                    data: None,
                }));
                Ok(Stage::Running(Progress::Notify))
            }
        },
        Some(_) => unexpected("login open"),
    }
}

fn handle_notified(reply: Option<Reply>) -> Step {
    match reply {
        None => Ok(Stage::Running(Progress::Notify)),
        Some(Reply::Notified(Ok(()))) => Ok(Stage::Finished(Some(LoginInfo::default()))),
        Some(Reply::Notified(Err(reason))) => Err(ProtocolError::Notify(reason)),
        Some(_) => unexpected("login notify"),
    }
}

fn login_info(opened: OpenedSession, now: MsSinceEpoch) -> LoginInfo {
    let policy = opened.os_manager;
    let ignore_deadline = policy.is_some_and(|p| p.ignore_deadline);
    let deadline = match (opened.pool_deadline, ignore_deadline) {
        (Some(deadline), false) => Some(now.until(deadline).as_secs()),
        _ => None,
    };
    LoginInfo {
        ip: opened.source.ip,
        hostname: opened.source.hostname,
        deadline,
        max_idle: policy.and_then(|p| p.max_idle),
        session_id: opened.session_id,
    }
}
