use std::{marker::PhantomData, time::Duration};

use serde::Deserialize;
use serde_json::Value;
use tracing::{error, info, warn};

use crate::{
    InitializeDriver, LoginDriver, LogoutDriver, ReadyDriver, RegisterDriver, UnmanagedDriver, UnmanagedOutcome,
    core::{
        ActorAction, ActorError, NotifyServiceQuery, ProtocolError, TicketError,
        action::NotifyAction,
        config::BrokerConfig,
        crypto::{CertificateIssuer, MsSinceEpoch, SymmetricCipher},
        guard::{BruteForceGuard, TtlCache},
        model::{ActorKind, IdEntry, LogLevel, StaffUser},
        ticket::{TicketRepository, TicketStore},
    },
    executor::{ActorReply, BrokerBackend, run},
};

/// Facts about the incoming call, fixed for its whole duration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    pub now: MsSinceEpoch,
    /// Address the request came from, the key of the brute force guard.
    pub source: String,
    pub caller: Option<StaffUser>,
}

impl RequestContext {
    pub fn new(now: MsSinceEpoch, source: impl Into<String>) -> Self {
        Self { now, source: source.into(), caller: None }
    }
    pub fn with_caller(mut self, caller: Option<StaffUser>) -> Self {
        self.caller = caller;
        self
    }
}

/// The object safe face of [ActorExecutor], as used by the HTTP layer.
pub trait ActorService: Send + Sync {
    fn handle(&self, ctx: &RequestContext, action: ActorAction, params: Value) -> Result<ActorReply, ActorError>;
    /// The query string variant of login, logout and data notifications.
    fn notify(&self, ctx: &RequestContext, params: Value) -> Result<ActorReply, ActorError>;
    fn authenticate(&self, bearer: &str) -> Option<StaffUser>;
    fn cleanup_tickets(&self, now: MsSinceEpoch) -> Result<usize, TicketError>;
    fn version(&self) -> &str;
    fn block_delay(&self) -> Duration;
}

#[derive(Deserialize)]
struct TestRequest {
    token: String,
    #[serde(rename = "type", default)]
    kind: ActorKind,
}

#[derive(Deserialize)]
struct TicketRequest {
    token: String,
    ticket: String,
}

#[derive(Deserialize)]
struct VersionRequest {
    token: String,
    version: String,
    ip: String,
}

#[derive(Deserialize)]
struct LogRequest {
    token: String,
    level: i64,
    message: String,
}

/// Dispatches actor calls to their drivers and applies the failure policy.
///
/// Every failure leaves the executor as access denied, the real reason only
/// goes to the logs. Failures that look like guessing (unknown tokens,
/// missing fields) count against the source address in the guard, and a
/// successful call clears its count.
pub struct ActorExecutor<B, G, R, C, I> {
    backend: B,
    guard: BruteForceGuard<G>,
    tickets: TicketStore<R, C>,
    version: String,
    ciphers: Option<String>,
    _i: PhantomData<I>,
}

impl<B, G, R, C, I> ActorExecutor<B, G, R, C, I>
where
    B: BrokerBackend,
    G: TtlCache,
    R: TicketRepository,
    C: SymmetricCipher,
    I: CertificateIssuer,
{
    pub fn new(backend: B, cache: G, repository: R, config: &BrokerConfig) -> Self {
        Self {
            backend,
            guard: BruteForceGuard::new(cache, config.guard.clone()),
            tickets: TicketStore::new(repository, config.tickets.clone()),
            version: config.server.version.clone(),
            ciphers: config.server.secure_ciphers.clone(),
            _i: PhantomData,
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn guard(&self) -> &BruteForceGuard<G> {
        &self.guard
    }

    pub fn tickets(&self) -> &TicketStore<R, C> {
        &self.tickets
    }

    fn run<D: crate::ActorDriver>(&self, machine: D, now: MsSinceEpoch) -> Result<D::Output, ActorError> {
        Ok(run::<D, B, I>(&self.backend, machine, now)?)
    }

    /// Runs one action under the guard.
    pub fn handle(&self, ctx: &RequestContext, action: ActorAction, params: Value) -> Result<ActorReply, ActorError> {
        if action.bypasses_guard() {
            return self.dispatch(ctx, action, params).map_err(|e| self.reject(ctx, action, e, false));
        }

        if self.guard.is_blocked(&ctx.source, ctx.now) {
            self.guard.record_failure(&ctx.source, ctx.now);
            return Err(ActorError::Blocked);
        }

        match self.dispatch(ctx, action, params) {
            Ok(reply) => {
                if reply.error.is_none() {
                    self.guard.clear(&ctx.source);
                }
                Ok(reply)
            }
            Err(e) => Err(self.reject(ctx, action, e, true)),
        }
    }

    /// Folds an error into the uniform access denied surface.
    fn reject(&self, ctx: &RequestContext, action: ActorAction, e: ActorError, guarded: bool) -> ActorError {
        match e {
            ActorError::BlockAccess | ActorError::MissingField(_) => {
                warn!(source = %ctx.source, %action, reason = %e, "rejected actor call");
                if guarded {
                    self.guard.record_failure(&ctx.source, ctx.now);
                }
                ActorError::AccessDenied
            }
            ActorError::AccessDenied => {
                warn!(source = %ctx.source, %action, "caller lacks permission");
                ActorError::AccessDenied
            }
            other => {
                error!(source = %ctx.source, %action, error = %other, "actor call failed");
                ActorError::AccessDenied
            }
        }
    }

    fn dispatch(&self, ctx: &RequestContext, action: ActorAction, params: Value) -> Result<ActorReply, ActorError> {
        let now = ctx.now;
        match action {
            ActorAction::Register => {
                let driver = RegisterDriver::new(serde_json::from_value(params)?, ctx.caller.clone(), ctx.source.clone());
                let token = self.run(driver, now)?;
                info!(source = %ctx.source, "registered actor");
                Ok(ActorReply::ok(token))
            }
            ActorAction::Initialize => {
                let initialization = self.run(InitializeDriver::new(serde_json::from_value(params)?), now)?;
                Ok(ActorReply::ok(initialization.to_json()))
            }
            ActorAction::Login => {
                let info = self.run(LoginDriver::new(serde_json::from_value(params)?), now)?;
                Ok(ActorReply::ok(info.to_json()))
            }
            ActorAction::Logout => {
                let outcome = self.run(LogoutDriver::new(serde_json::from_value(params)?), now)?;
                Ok(ActorReply::ok(outcome.as_result()))
            }
            ActorAction::Ready => {
                let driver = ReadyDriver::ready(serde_json::from_value(params)?, self.ciphers.clone());
                Ok(ActorReply::ok(self.run(driver, now)?.to_json()))
            }
            ActorAction::IpChange => {
                let driver = ReadyDriver::ip_change(serde_json::from_value(params)?, self.ciphers.clone());
                Ok(ActorReply::ok(self.run(driver, now)?.to_json()))
            }
            ActorAction::Unmanaged => {
                let driver = UnmanagedDriver::new(serde_json::from_value(params)?, self.ciphers.clone());
                match self.run(driver, now)? {
                    UnmanagedOutcome::InvalidToken => {
                        info!(source = %ctx.source, "unmanaged host presented an unknown token");
                        Ok(ActorReply::failed(Value::Null, "Invalid token"))
                    }
                    UnmanagedOutcome::Certificate(reply) => Ok(ActorReply::ok(reply.to_json())),
                }
            }
            // Only reachable through the query string variant.
            ActorAction::Notify => Err(ActorError::AccessDenied),
            ActorAction::Ticket => self.ticket(serde_json::from_value(params)?, now),
            ActorAction::Version => {
                let request: VersionRequest = serde_json::from_value(params)?;
                if !self.backend.record_version(&request.token, &request.version, &request.ip, now)? {
                    return Err(ActorError::BlockAccess);
                }
                Ok(ActorReply::ok("ok"))
            }
            ActorAction::Log => {
                let request: LogRequest = serde_json::from_value(params)?;
                let version = self.backend.actor_version(&request.token)?.ok_or(ActorError::BlockAccess)?;
                let level = LogLevel::from_actor(request.level, &version);
                self.backend.append_log(&request.token, level, &request.message, now)?;
                Ok(ActorReply::ok("ok"))
            }
            ActorAction::Test => self.test(ctx, serde_json::from_value(params)?),
        }
    }

    fn ticket(&self, request: TicketRequest, now: MsSinceEpoch) -> Result<ActorReply, ActorError> {
        if !self.backend.validate_actor_token(&request.token)? {
            return Err(ActorError::BlockAccess);
        }
        match self.tickets.get(&request.ticket, true, None, false, now) {
            Ok(payload) => Ok(ActorReply::ok(payload)),
            Err(TicketError::InvalidTicket(reason)) => {
                info!(reason, "actor asked for an invalid ticket");
                Ok(ActorReply::failed(Value::Null, "Invalid ticket"))
            }
            Err(TicketError::Store(e)) => Err(ActorError::Store(e)),
            Err(e) => Err(ActorError::InvalidTicket(e.to_string())),
        }
    }

    fn test(&self, ctx: &RequestContext, request: TestRequest) -> Result<ActorReply, ActorError> {
        let valid = match request.kind {
            ActorKind::Unmanaged => self.backend.find_service(&request.token, true)?.is_some(),
            ActorKind::Managed => self.backend.validate_actor_token(&request.token)?,
        };
        if valid {
            return Ok(ActorReply::ok("ok"));
        }
        self.guard.record_failure(&ctx.source, ctx.now);
        Ok(ActorReply::failed("invalid token", "invalid token"))
    }

    /// Handles the query string notification. Every failure counts against
    /// the source.
    pub fn notify(&self, ctx: &RequestContext, params: Value) -> Result<ActorReply, ActorError> {
        let field = |name: &str| params.get(name).and_then(Value::as_str).map(str::to_string);
        let (Some(action), Some(token)) = (field("action"), field("token")) else {
            return Err(ActorError::RequestError("Invalid parameters".into()));
        };
        let action = NotifyAction::try_from(action.as_str()).map_err(|e| ActorError::RequestError(e.to_string()))?;

        if self.guard.is_blocked(&ctx.source, ctx.now) {
            self.guard.record_failure(&ctx.source, ctx.now);
            return Err(ActorError::Blocked);
        }

        match self.notify_inner(ctx, action, token, params) {
            Ok(()) => {
                self.guard.clear(&ctx.source);
                Ok(ActorReply::ok("ok"))
            }
            Err(e) => {
                warn!(source = %ctx.source, %action, error = %e, "notification rejected");
                self.guard.record_failure(&ctx.source, ctx.now);
                Err(ActorError::AccessDenied)
            }
        }
    }

    fn notify_inner(&self, ctx: &RequestContext, action: NotifyAction, token: String, params: Value) -> Result<(), ActorError> {
        match action {
            NotifyAction::Login => {
                self.run(LoginDriver::new(serde_json::from_value(params)?), ctx.now)?;
            }
            NotifyAction::Logout => {
                self.run(LogoutDriver::new(serde_json::from_value(params)?), ctx.now)?;
            }
            NotifyAction::Data => {
                let query = NotifyServiceQuery {
                    token,
                    action,
                    ids: notify_ids(&params)?,
                    session_type: params.get("session_type").and_then(Value::as_str).unwrap_or_default().to_string(),
                    data: params.get("data").cloned(),
                };
                self.backend
                    .notify_service(&query)?
                    .map_err(|reason| ActorError::from(ProtocolError::Notify(reason)))?;
            }
        }
        Ok(())
    }
}

/// The host ids of a notification. `id` is either the usual list of entries
/// or, from a query string, that list JSON encoded. A bare `ip`/`mac` pair
/// stands for a single entry.
fn notify_ids(params: &Value) -> Result<Vec<IdEntry>, ActorError> {
    match params.get("id") {
        Some(Value::String(encoded)) => Ok(serde_json::from_str(encoded)?),
        Some(entries) => Ok(serde_json::from_value(entries.clone())?),
        None => {
            let field = |name: &str| params.get(name).and_then(Value::as_str).unwrap_or_default().to_string();
            let entry = IdEntry { mac: field("mac"), ip: field("ip") };
            if entry.mac.is_empty() && entry.ip.is_empty() {
                Ok(Vec::new())
            } else {
                Ok(vec![entry])
            }
        }
    }
}

impl<B, G, R, C, I> ActorService for ActorExecutor<B, G, R, C, I>
where
    B: BrokerBackend,
    G: TtlCache,
    R: TicketRepository,
    C: SymmetricCipher + Send + Sync,
    I: CertificateIssuer + Send + Sync,
{
    fn handle(&self, ctx: &RequestContext, action: ActorAction, params: Value) -> Result<ActorReply, ActorError> {
        ActorExecutor::handle(self, ctx, action, params)
    }
    fn notify(&self, ctx: &RequestContext, params: Value) -> Result<ActorReply, ActorError> {
        ActorExecutor::notify(self, ctx, params)
    }
    fn authenticate(&self, bearer: &str) -> Option<StaffUser> {
        self.backend.authenticate(bearer)
    }
    fn cleanup_tickets(&self, now: MsSinceEpoch) -> Result<usize, TicketError> {
        self.tickets.cleanup(now)
    }
    fn version(&self) -> &str {
        &self.version
    }
    fn block_delay(&self) -> Duration {
        self.guard.config().block_delay
    }
}
