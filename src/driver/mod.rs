mod initialize;
mod login;
mod logout;
mod ready;
mod register;
mod unmanaged;

use std::{collections::BTreeSet, task::Poll};

use ringbuffer::{GrowableAllocRingBuffer, RingBuffer};

pub use initialize::*;
pub use login::*;
pub use logout::*;
pub use ready::*;
pub use register::*;
pub use unmanaged::*;

use crate::core::{MsSinceEpoch, ProtocolError, Query, Reply, model::IdEntry};

pub type DriverPollResult<T> = Poll<Result<T, ProtocolError>>;

/// The surface shared by every actor protocol driver.
///
/// A driver never performs I/O. It is fed with [Reply] values through
/// [ActorDriver::recv], emits the [Query] values it needs answered through
/// [ActorDriver::poll_transmit], and finally yields its result through
/// [ActorDriver::poll_result].
pub trait ActorDriver {
    type Output;

    /// The state machine receives some reply. This also drives the machine
    /// forward when there is nothing to deliver yet.
    fn recv(&mut self, now: MsSinceEpoch, reply: Option<Reply>);
    fn poll_transmit(&mut self) -> Option<Query>;
    fn poll_result(&mut self) -> DriverPollResult<Self::Output>;
}

/// Outer state every driver goes through, `S` is the driver specific progress.
pub(crate) enum Stage<S, T> {
    Running(S),
    Errored(Option<ProtocolError>),
    Finished(Option<T>),
    Vacant,
}

impl<S, T> Stage<S, T> {
    pub(crate) fn poll(&mut self) -> DriverPollResult<T> {
        let ready = match self {
            Self::Errored(e) => e.take().map(Err),
            Self::Finished(inner) => inner.take().map(Ok),
            _ => None,
        };
        match ready {
            Some(result) => {
                *self = Self::Vacant;
                Poll::Ready(result)
            }
            None => Poll::Pending,
        }
    }
}

#[derive(Default)]
pub(crate) struct DriverInner {
    pub(crate) buffer: GrowableAllocRingBuffer<Query>,
    pub(crate) terminated: bool,
}

impl DriverInner {
    pub(crate) fn send(&mut self, query: Query) {
        self.buffer.enqueue(query);
    }
    pub(crate) fn dequeue(&mut self) -> Option<Query> {
        self.buffer.dequeue()
    }
}

/// Runs one step of a driver and parks it in the errored stage on failure.
///
/// The step owns the progress and hands back the stage to continue from,
/// which is the same progress again when it is still waiting on a reply.
pub(crate) fn drive<S, T>(
    inner: &mut DriverInner,
    stage: &mut Stage<S, T>,
    step: impl FnOnce(&mut DriverInner, S) -> Result<Stage<S, T>, ProtocolError>,
) {
    if inner.terminated {
        return;
    }
    let progress = match std::mem::replace(stage, Stage::Vacant) {
        Stage::Running(progress) => progress,
        other => {
            *stage = other;
            return;
        }
    };
    match step(inner, progress) {
        Ok(next) => {
            if !matches!(next, Stage::Running(_)) {
                inner.terminated = true;
            }
            *stage = next;
        }
        Err(e) => {
            inner.terminated = true;
            *stage = Stage::Errored(Some(e));
        }
    }
}

pub(crate) type Step<S, T> = Result<Stage<S, T>, ProtocolError>;

/// Both letter cases of every id, since unique ids may be stored either way.
pub fn fix_ids<I, S>(ids: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut fixed = BTreeSet::new();
    for id in ids {
        let id = id.as_ref();
        fixed.insert(id.to_uppercase());
        fixed.insert(id.to_lowercase());
    }
    fixed.into_iter().collect()
}

/// Every reported ip plus the first ten macs.
pub fn candidate_ids(entries: &[IdEntry]) -> Vec<String> {
    entries
        .iter()
        .map(|e| e.ip.clone())
        .chain(entries.iter().take(10).map(|e| e.mac.clone()))
        .filter(|id| !id.is_empty())
        .collect()
}

pub(crate) fn unexpected<T>(state: &'static str) -> Result<T, ProtocolError> {
    Err(ProtocolError::UnexpectedReply(state))
}
