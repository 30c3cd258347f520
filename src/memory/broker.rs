use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
    time::Duration,
};

use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    candidate_ids,
    core::{
        ClosedSession, CommitReadyQuery, FindUserServiceQuery, LoginPolicy, NotifyServiceQuery, OpenedSession,
        PreparedActor, StoreError, UserServiceError, UserServiceView,
        collab::{Deployment, IdInfo, OsManager, UnmanagedService, is_remote_session, notify_unmanaged},
        crypto::MsSinceEpoch,
        model::{ActorIdentity, LogEntry, LogLevel, LogSource, ServicePool, ServiceRecord, ServiceTokenAlias, StaffUser},
        restraint::RestraintPolicy,
        userservice::{
            CacheLevel, CleanupAction, Lifecycle, OsState, PROP_CERT, PROP_PRIV, PROP_PRIV_PASSWD, State, UserService,
        },
    },
    executor::BrokerBackend,
};

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum MemoryError {
    #[error("No user service with id {0}.")]
    NotFound(Uuid),
    #[error("No pool with id {0}.")]
    UnknownPool(Uuid),
    #[error(transparent)]
    UserService(#[from] UserServiceError),
}

struct PoolEntry {
    pool: ServicePool,
    os_manager: Option<Arc<dyn OsManager>>,
    restraint: RestraintPolicy,
}

struct ServiceEntry {
    record: ServiceRecord,
    unmanaged: Option<Arc<dyn UnmanagedService>>,
}

struct UserServiceEntry {
    service: UserService,
    deployment: Box<dyn Deployment>,
}

/// A complete broker state held in process memory.
///
/// Locks are always taken in the order user services, pools, everything else.
#[derive(Default)]
pub struct MemoryBroker {
    actors: RwLock<HashMap<String, ActorIdentity>>,
    services: RwLock<HashMap<Uuid, ServiceEntry>>,
    aliases: RwLock<HashMap<String, ServiceTokenAlias>>,
    pools: RwLock<HashMap<Uuid, PoolEntry>>,
    user_services: RwLock<HashMap<Uuid, UserServiceEntry>>,
    staff: RwLock<HashMap<String, StaffUser>>,
    logs: RwLock<Vec<LogEntry>>,
    environment: RwLock<HashMap<Uuid, BTreeMap<String, String>>>,
}

fn view(service: &UserService) -> UserServiceView {
    UserServiceView {
        uuid: service.uuid,
        unique_id: service.unique_id.clone(),
        state: service.state,
        os_state: service.os_state,
        in_use: service.in_use,
    }
}

fn parse_token(token: &str) -> Option<Uuid> {
    Uuid::parse_str(token).ok()
}

fn store_error(e: impl std::fmt::Display) -> StoreError {
    StoreError(e.to_string())
}

impl MemoryBroker {
    pub fn add_staff(&self, token: impl Into<String>, user: StaffUser) {
        self.staff.write().insert(token.into(), user);
    }

    pub fn add_service(&self, record: ServiceRecord, unmanaged: Option<Arc<dyn UnmanagedService>>) {
        self.services.write().insert(record.id, ServiceEntry { record, unmanaged });
    }

    pub fn add_pool(&self, pool: ServicePool, os_manager: Option<Arc<dyn OsManager>>, restraint: RestraintPolicy) {
        self.pools.write().insert(pool.id, PoolEntry { pool, os_manager, restraint });
    }

    fn errors_of(services: &HashMap<Uuid, UserServiceEntry>, pool: Uuid) -> Vec<MsSinceEpoch> {
        services
            .values()
            .filter(|e| e.service.pool == pool && e.service.state == State::Error)
            .map(|e| e.service.state_date)
            .collect()
    }

    pub fn is_restrained(&self, pool: Uuid, now: MsSinceEpoch) -> bool {
        let services = self.user_services.read();
        let pools = self.pools.read();
        pools
            .get(&pool)
            .is_some_and(|p| p.restraint.is_restrained(Self::errors_of(&services, pool), now))
    }

    pub fn remaining_restraint(&self, pool: Uuid, now: MsSinceEpoch) -> Duration {
        let services = self.user_services.read();
        let pools = self.pools.read();
        pools
            .get(&pool)
            .map(|p| p.restraint.remaining(Self::errors_of(&services, pool), now))
            .unwrap_or(Duration::ZERO)
    }

    /// Admits a new user service unless its pool is restrained, in which case
    /// nothing is stored and `None` is returned.
    pub fn add_user_service(
        &self,
        service: UserService,
        deployment: Box<dyn Deployment>,
        now: MsSinceEpoch,
    ) -> Result<Option<Uuid>, MemoryError> {
        let mut services = self.user_services.write();
        let pools = self.pools.read();
        let pool = pools.get(&service.pool).ok_or(MemoryError::UnknownPool(service.pool))?;
        let errors = Self::errors_of(&services, service.pool);
        if pool.restraint.is_restrained(errors.iter().copied(), now) {
            warn!(
                pool = %pool.pool.name,
                remaining = pool.restraint.remaining(errors, now).as_secs(),
                "pool is restrained, skipping new user service"
            );
            return Ok(None);
        }
        let uuid = service.uuid;
        debug!(%uuid, pool = %pool.pool.name, "admitted user service");
        services.insert(uuid, UserServiceEntry { service, deployment });
        Ok(Some(uuid))
    }

    /// Runs `f` against a user service and its provider.
    pub fn with_user_service<T>(
        &self,
        uuid: Uuid,
        f: impl FnOnce(&mut UserService, &mut dyn Deployment) -> T,
    ) -> Result<T, MemoryError> {
        let mut services = self.user_services.write();
        let entry = services.get_mut(&uuid).ok_or(MemoryError::NotFound(uuid))?;
        Ok(f(&mut entry.service, entry.deployment.as_mut()))
    }

    pub fn user_service(&self, uuid: Uuid) -> Option<UserService> {
        self.user_services.read().get(&uuid).map(|e| e.service.clone())
    }

    pub fn finish_preparation(&self, uuid: Uuid, now: MsSinceEpoch) -> Result<(), MemoryError> {
        Ok(self.with_user_service(uuid, |s, d| s.finish_preparation(d, now))??)
    }

    pub fn move_to_level(&self, uuid: Uuid, level: CacheLevel, now: MsSinceEpoch) -> Result<(), MemoryError> {
        Ok(self.with_user_service(uuid, |s, d| s.move_to_level(level, d, now))??)
    }

    pub fn assign(&self, uuid: Uuid, user: Uuid, now: MsSinceEpoch) -> Result<(), MemoryError> {
        self.with_user_service(uuid, |s, _| s.assign_to_user(user, now))
    }

    pub fn cancel(&self, uuid: Uuid, now: MsSinceEpoch) -> Result<(), MemoryError> {
        Ok(self.with_user_service(uuid, |s, d| s.cancel(d, now))??)
    }

    pub fn remove_or_cancel(&self, uuid: Uuid, now: MsSinceEpoch) -> Result<(), MemoryError> {
        Ok(self.with_user_service(uuid, |s, d| s.remove_or_cancel(d, now))??)
    }

    pub fn set_environment(&self, uuid: Uuid, key: &str, value: impl Into<String>) {
        self.environment.write().entry(uuid).or_default().insert(key.to_string(), value.into());
    }

    pub fn environment(&self, uuid: Uuid) -> BTreeMap<String, String> {
        self.environment.read().get(&uuid).cloned().unwrap_or_default()
    }

    /// Drops a user service after carrying out its cleanup actions.
    pub fn delete_user_service(&self, uuid: Uuid, now: MsSinceEpoch) -> Result<UserService, MemoryError> {
        let mut services = self.user_services.write();
        let mut entry = services.remove(&uuid).ok_or(MemoryError::NotFound(uuid))?;
        for action in entry.service.on_delete() {
            match action {
                CleanupAction::CloseSessions(_) => {
                    entry.service.end_session("", now);
                }
                CleanupAction::ClearLogs(owner) => self.logs.write().retain(|l| l.owner != owner),
                CleanupAction::ClearEnvironment(owner) => {
                    self.environment.write().remove(&owner);
                }
            }
        }
        info!(%uuid, "deleted user service");
        Ok(entry.service)
    }

    pub fn logs(&self, owner: Uuid) -> Vec<LogEntry> {
        self.logs.read().iter().filter(|l| l.owner == owner).cloned().collect()
    }

    pub fn actor_count(&self) -> usize {
        self.actors.read().len()
    }

    pub fn alias_count(&self) -> usize {
        self.aliases.read().len()
    }

    fn unmanaged(&self, service: Uuid) -> Option<Arc<dyn UnmanagedService>> {
        self.services.read().get(&service).and_then(|s| s.unmanaged.clone())
    }

    fn os_manager(&self, pool: Uuid) -> Option<Arc<dyn OsManager>> {
        self.pools.read().get(&pool).and_then(|p| p.os_manager.clone())
    }
}

impl BrokerBackend for MemoryBroker {
    fn find_actor_by_mac(&self, mac: &str) -> Result<Option<ActorIdentity>, StoreError> {
        Ok(self.actors.read().get(mac).cloned())
    }

    fn store_actor(&self, identity: ActorIdentity) -> Result<(), StoreError> {
        self.actors.write().insert(identity.mac.clone(), identity);
        Ok(())
    }

    fn validate_actor_token(&self, token: &str) -> Result<bool, StoreError> {
        Ok(self.actors.read().values().any(|a| a.token == token))
    }

    fn find_service(&self, token: &str, through_alias: bool) -> Result<Option<ServiceRecord>, StoreError> {
        let services = self.services.read();
        let direct = services.values().find(|s| s.record.token.as_deref() == Some(token));
        if let Some(entry) = direct {
            return Ok(Some(entry.record.clone()));
        }
        if !through_alias {
            return Ok(None);
        }
        let aliased = self.aliases.read().get(token).map(|a| a.service);
        Ok(aliased.and_then(|id| services.get(&id)).map(|s| s.record.clone()))
    }

    fn find_alias(&self, alias: &str) -> Result<Option<ServiceTokenAlias>, StoreError> {
        Ok(self.aliases.read().get(alias).cloned())
    }

    fn find_alias_for(&self, service: Uuid, unique_id: &str) -> Result<Option<ServiceTokenAlias>, StoreError> {
        Ok(self
            .aliases
            .read()
            .values()
            .find(|a| a.service == service && a.unique_id.as_deref() == Some(unique_id))
            .cloned())
    }

    fn create_alias(&self, alias: ServiceTokenAlias) -> Result<(), StoreError> {
        debug!(service = %alias.service, "created service token alias");
        self.aliases.write().insert(alias.alias.clone(), alias);
        Ok(())
    }

    fn find_user_service(&self, query: &FindUserServiceQuery) -> Result<Option<UserServiceView>, StoreError> {
        let services = self.user_services.read();
        let pools = self.pools.read();
        let in_scope = |pool: &Uuid| match query.service {
            Some(service) => pools.get(pool).is_some_and(|p| p.pool.service == service),
            None => true,
        };
        Ok(services
            .values()
            .map(|e| &e.service)
            .filter(|s| query.ids.contains(&s.unique_id) && query.states.contains(&s.state) && in_scope(&s.pool))
            .min_by_key(|s| (s.creation_date, s.uuid))
            .map(view))
    }

    fn prepare_actor(&self, user_service: Uuid, version: &str, _now: MsSinceEpoch) -> Result<PreparedActor, StoreError> {
        let pool = self
            .user_service(user_service)
            .map(|s| s.pool)
            .ok_or_else(|| store_error(MemoryError::NotFound(user_service)))?;
        let os_manager = self.os_manager(pool);
        self.with_user_service(user_service, |service, _| {
            service.actor_version = version.to_string();
            let os = os_manager.map(|m| m.actor_data(service)).unwrap_or(Value::Null);
            PreparedActor { unique_id: service.unique_id.clone(), os }
        })
        .map_err(store_error)
    }

    fn fetch_user_service(&self, token: &str) -> Result<Option<UserServiceView>, StoreError> {
        Ok(parse_token(token)
            .and_then(|uuid| self.user_service(uuid))
            .filter(|s| s.state.is_valid())
            .map(|s| view(&s)))
    }

    fn open_session(&self, token: &str, username: &str, now: MsSinceEpoch) -> Result<Option<OpenedSession>, StoreError> {
        let Some(current) = parse_token(token).and_then(|uuid| self.user_service(uuid)).filter(|s| s.state.is_valid()) else {
            return Ok(None);
        };
        let (os_manager, deadline) = {
            let pools = self.pools.read();
            let entry = pools.get(&current.pool);
            (entry.and_then(|p| p.os_manager.clone()), entry.and_then(|p| p.pool.deadline))
        };

        self.with_user_service(current.uuid, |service, _| {
            if !service.in_use {
                if let Some(manager) = &os_manager {
                    manager.logged_in(service, username);
                }
                service.set_in_use(true, now);
            }
            info!(uuid = %service.uuid, username, "session opened");
            Some(OpenedSession {
                session_id: service.start_session(now),
                source: service.connection_source(),
                pool_deadline: deadline,
                os_manager: os_manager.as_ref().map(|m| LoginPolicy {
                    max_idle: m.max_idle(),
                    ignore_deadline: m.ignore_deadline(),
                }),
            })
        })
        .map_err(store_error)
    }

    fn close_session(
        &self,
        token: &str,
        username: &str,
        session_id: &str,
        now: MsSinceEpoch,
    ) -> Result<Option<ClosedSession>, StoreError> {
        let Some(current) = parse_token(token).and_then(|uuid| self.user_service(uuid)).filter(|s| s.state.is_valid()) else {
            return Ok(None);
        };
        let os_manager = self.os_manager(current.pool);

        self.with_user_service(current.uuid, |service, _| {
            service.end_session(session_id, now);
            let was_in_use = service.in_use;
            if was_in_use {
                if let Some(manager) = &os_manager {
                    manager.logged_out(service, username);
                }
                service.set_in_use(false, now);
            }
            info!(uuid = %service.uuid, username, "session closed");
            Some(ClosedSession {
                user_service: service.uuid,
                was_in_use,
                removable_on_logout: os_manager.as_ref().is_none_or(|m| m.is_removable_on_logout(service)),
            })
        })
        .map_err(store_error)
    }

    fn release(&self, user_service: Uuid, now: MsSinceEpoch) -> Result<(), StoreError> {
        self.with_user_service(user_service, |service, _| service.release(now))
            .map_err(store_error)?
            .map_err(store_error)
    }

    fn commit_ready(&self, query: CommitReadyQuery, now: MsSinceEpoch) -> Result<(), StoreError> {
        let pool = self
            .user_service(query.user_service)
            .map(|s| s.pool)
            .ok_or_else(|| store_error(MemoryError::NotFound(query.user_service)))?;
        let os_manager = self.os_manager(pool);

        self.with_user_service(query.user_service, |service, deployment| {
            service.log_ip(&query.ip);
            deployment.set_ip(&query.ip);
            service.set_comms_url(query.comms_url);
            if query.mark_os_usable {
                service.set_os_state(OsState::Usable, now);
                if let Some(manager) = &os_manager {
                    manager.to_ready(service);
                }
            }
            service.set_property(PROP_CERT, query.certificate.certificate.clone());
            service.set_property(PROP_PRIV, query.certificate.key.expose());
            service.set_property(PROP_PRIV_PASSWD, query.certificate.password.expose());
            if query.clear_in_use {
                service.set_in_use(false, now);
            }
            info!(uuid = %service.uuid, ip = %query.ip, "user service is ready");
        })
        .map_err(store_error)
    }

    fn notify_service(&self, query: &NotifyServiceQuery) -> Result<Result<(), String>, StoreError> {
        let Some(record) = self.find_service(&query.token, true)? else {
            return Ok(Err("invalid token".into()));
        };
        let Some(unmanaged) = self.unmanaged(record.id) else {
            return Ok(Err(format!("service {} does not take notifications", record.name)));
        };
        let ids = candidate_ids(&query.ids);
        let remote = is_remote_session(&query.session_type);
        Ok(notify_unmanaged(unmanaged.as_ref(), query.action, &ids, remote, query.data.as_ref()).map_err(|e| e.to_string()))
    }

    fn resolve_valid_id(&self, service: Uuid, ids: &[String]) -> Result<Option<String>, StoreError> {
        Ok(self.unmanaged(service).and_then(|s| s.get_valid_id(ids)))
    }

    fn notify_initialization(&self, service: Uuid, id: &str) -> Result<(), StoreError> {
        if let Some(unmanaged) = self.unmanaged(service) {
            unmanaged.notify_initialization(id);
        }
        Ok(())
    }

    fn store_id_info(&self, service: Uuid, id: &str, info: IdInfo) -> Result<(), StoreError> {
        if let Some(unmanaged) = self.unmanaged(service) {
            unmanaged.store_id_info(id, info);
        }
        Ok(())
    }

    fn record_version(&self, token: &str, version: &str, ip: &str, _now: MsSinceEpoch) -> Result<bool, StoreError> {
        let Some(uuid) = parse_token(token) else {
            return Ok(false);
        };
        Ok(self
            .with_user_service(uuid, |service, _| {
                service.actor_version = version.to_string();
                service.log_ip(ip);
            })
            .is_ok())
    }

    fn actor_version(&self, token: &str) -> Result<Option<String>, StoreError> {
        Ok(parse_token(token).and_then(|uuid| self.user_service(uuid)).map(|s| s.actor_version))
    }

    fn append_log(&self, token: &str, level: LogLevel, message: &str, now: MsSinceEpoch) -> Result<bool, StoreError> {
        let Some(owner) = parse_token(token).filter(|uuid| self.user_services.read().contains_key(uuid)) else {
            return Ok(false);
        };
        self.logs.write().push(LogEntry {
            owner,
            level,
            source: LogSource::Actor,
            message: message.to_string(),
            stamp: now,
        });
        Ok(true)
    }

    fn authenticate(&self, bearer: &str) -> Option<StaffUser> {
        self.staff.read().get(bearer).cloned()
    }
}
