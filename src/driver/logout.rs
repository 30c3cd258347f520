use serde::Deserialize;

use crate::{
    core::{
        ClosedSession, MsSinceEpoch, NotifyServiceQuery, ProtocolError, Query, Reply,
        action::NotifyAction,
        model::{ActorKind, IdEntry},
    },
    driver::{ActorDriver, DriverInner, DriverPollResult, Stage, drive, unexpected},
};

#[derive(Debug, Clone, Deserialize)]
pub struct LogoutRequest {
    #[serde(rename = "type", default)]
    pub kind: ActorKind,
    pub token: String,
    #[serde(default)]
    pub username: String,
    /// Empty closes every open session.
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub session_type: String,
    #[serde(default)]
    pub id: Vec<IdEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogoutOutcome {
    /// The session was closed on a managed user service.
    Closed { released: bool },
    /// The logout was forwarded to an unmanaged service.
    Notified,
}

impl LogoutOutcome {
    pub fn as_result(&self) -> &'static str {
        match self {
            Self::Closed { .. } => "ok",
            Self::Notified => "notified",
        }
    }
}

/// Closes a session and releases the user service when the OS manager allows it.
pub struct LogoutDriver {
    inner: DriverInner,
    stage: Stage<Progress, LogoutOutcome>,
}

enum Progress {
    Init(LogoutRequest),
    Close(LogoutRequest),
    Release,
    Notify,
}

type Step = super::Step<Progress, LogoutOutcome>;

impl LogoutDriver {
    pub fn new(request: LogoutRequest) -> Self {
        Self {
            inner: DriverInner::default(),
            stage: Stage::Running(Progress::Init(request)),
        }
    }
}

impl ActorDriver for LogoutDriver {
    type Output = LogoutOutcome;

    fn recv(&mut self, _: MsSinceEpoch, reply: Option<Reply>) {
        drive(&mut self.inner, &mut self.stage, |inner, progress| match progress {
            Progress::Init(request) => {
                inner.send(Query::CloseSession {
                    token: request.token.clone(),
                    username: request.username.clone(),
                    session_id: request.session_id.clone(),
                });
                Ok(Stage::Running(Progress::Close(request)))
            }
            Progress::Close(request) => handle_close(inner, request, reply),
            Progress::Release => match reply {
                None => Ok(Stage::Running(Progress::Release)),
                Some(Reply::Stored) => Ok(Stage::Finished(Some(LogoutOutcome::Closed { released: true }))),
                Some(_) => unexpected("logout release"),
            },
            Progress::Notify => match reply {
                None => Ok(Stage::Running(Progress::Notify)),
                Some(Reply::Notified(Ok(()))) => Ok(Stage::Finished(Some(LogoutOutcome::Notified))),
                Some(Reply::Notified(Err(reason))) => Err(ProtocolError::Notify(reason)),
                Some(_) => unexpected("logout notify"),
            },
        });
    }
    fn poll_transmit(&mut self) -> Option<Query> {
        self.inner.dequeue()
    }
    fn poll_result(&mut self) -> DriverPollResult<LogoutOutcome> {
        self.stage.poll()
    }
}

fn handle_close(inner: &mut DriverInner, request: LogoutRequest, reply: Option<Reply>) -> Step {
    match reply {
        None => Ok(Stage::Running(Progress::Close(request))),
        Some(Reply::SessionClosed(Some(closed))) => Ok(release_if_removable(inner, closed)),
        Some(Reply::SessionClosed(None)) => match request.kind {
            ActorKind::Managed => Err(ProtocolError::BlockAccess("no user service for token")),
            ActorKind::Unmanaged => {
                inner.send(Query::NotifyService(NotifyServiceQuery {
                    token: request.token,
                    action: NotifyAction::Logout,
                    ids: request.id,
                    session_type: request.session_type,
                    data: None,
                }));
                Ok(Stage::Running(Progress::Notify))
            }
        },
        Some(_) => unexpected("logout close"),
    }
}

fn release_if_removable(inner: &mut DriverInner, closed: ClosedSession) -> Stage<Progress, LogoutOutcome> {
    if closed.was_in_use && closed.removable_on_logout {
        inner.send(Query::Release { user_service: closed.user_service });
        Stage::Running(Progress::Release)
    } else {
        Stage::Finished(Some(LogoutOutcome::Closed { released: false }))
    }
}
