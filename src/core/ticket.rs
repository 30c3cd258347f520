use std::{marker::PhantomData, time::Duration};

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::{Map, Value};
use tracing::debug;
use uuid::Uuid;

use crate::{
    core::{
        crypto::{MsSinceEpoch, SymmetricCipher, random_string},
        error::{StoreError, TicketError},
    },
    ext::serde::duration_secs,
};

/// Owner persisted in place of the real key of a secure ticket.
pub const SECURED: &str = "#SECURE#";
pub const TICKET_LENGTH: usize = 40;
pub const TUNNEL_OWNER_LENGTH: usize = 8;
const ENVELOPE_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TicketConfig {
    #[serde(with = "duration_secs")]
    pub default_validity: Duration,
    /// Tickets older than this are swept no matter their validity.
    #[serde(with = "duration_secs")]
    pub max_validity: Duration,
    /// Extra time an expired ticket is kept before the sweep removes it.
    #[serde(with = "duration_secs")]
    pub grace: Duration,
    #[serde(with = "duration_secs")]
    pub tunnel_validity: Duration,
    #[serde(with = "duration_secs")]
    pub cleanup_interval: Duration,
}

impl Default for TicketConfig {
    fn default() -> Self {
        Self {
            default_validity: Duration::from_secs(60),
            max_validity: Duration::from_secs(60 * 60 * 24 * 7),
            grace: Duration::from_secs(600),
            tunnel_validity: Duration::from_secs(60 * 60 * 24 * 7),
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

/// A named check run against the payload every time the ticket is read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TicketValidator {
    FieldEquals { field: String, value: Value },
    RequiresFields { fields: Vec<String> },
}

impl TicketValidator {
    pub fn accepts(&self, payload: &Value) -> bool {
        match self {
            Self::FieldEquals { field, value } => payload.get(field) == Some(value),
            Self::RequiresFields { fields } => fields
                .iter()
                .all(|f| payload.get(f).is_some_and(|v| !v.is_null())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TicketRecord {
    pub id: String,
    pub owner: Option<String>,
    pub stamp: MsSinceEpoch,
    pub validity: Duration,
    pub data: Vec<u8>,
    pub validator: Option<TicketValidator>,
}

impl TicketRecord {
    pub fn expires(&self) -> MsSinceEpoch {
        self.stamp.after(self.validity)
    }
}

pub trait TicketRepository: Send + Sync {
    fn find(&self, id: &str) -> Result<Option<TicketRecord>, StoreError>;
    /// Inserts or replaces the record with the same id.
    fn save(&self, record: TicketRecord) -> Result<(), StoreError>;
    /// Keeps only the records accepted by `keep`, returning how many were dropped.
    fn retain(&self, keep: &mut dyn FnMut(&TicketRecord) -> bool) -> Result<usize, StoreError>;
}

/// What a tunnel server needs to open a connection for a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelTicket {
    #[serde(rename = "u")]
    pub user: Uuid,
    #[serde(rename = "s")]
    pub user_service: Uuid,
    #[serde(rename = "h")]
    pub host: Option<String>,
    #[serde(rename = "p")]
    pub port: u16,
    #[serde(rename = "e")]
    pub extra: Option<Value>,
}

#[derive(Serialize, Deserialize)]
struct Envelope {
    v: u32,
    data: Value,
}

fn encode(payload: Value) -> Result<Vec<u8>, TicketError> {
    Ok(serde_json::to_vec(&Envelope { v: ENVELOPE_VERSION, data: payload })?)
}

fn decode(bytes: &[u8]) -> Result<Value, TicketError> {
    let envelope: Envelope = serde_json::from_slice(bytes).map_err(|_| TicketError::invalid("undecodable payload"))?;
    if envelope.v != ENVELOPE_VERSION {
        return Err(TicketError::invalid(format!("unknown payload version {}", envelope.v)));
    }
    Ok(envelope.data)
}

/// Short lived, optionally encrypted handles to server side data.
pub struct TicketStore<R, C> {
    repository: R,
    config: TicketConfig,
    _c: PhantomData<C>,
}

impl<R, C> TicketStore<R, C>
where
    R: TicketRepository,
    C: SymmetricCipher,
{
    pub fn new(repository: R, config: TicketConfig) -> Self {
        Self {
            repository,
            config,
            _c: PhantomData,
        }
    }

    pub fn config(&self) -> &TicketConfig {
        &self.config
    }

    pub fn repository(&self) -> &R {
        &self.repository
    }

    fn seal(bytes: Vec<u8>, owner: Option<&str>, secure: bool) -> Result<Vec<u8>, TicketError> {
        if !secure {
            return Ok(bytes);
        }
        let owner = owner.ok_or(TicketError::MissingOwner)?;
        C::encrypt(owner.as_bytes(), &bytes).map_err(|e| TicketError::Cipher(e.to_string()))
    }

    fn open(bytes: &[u8], owner: Option<&str>, secure: bool) -> Result<Value, TicketError> {
        if !secure {
            return decode(bytes);
        }
        let owner = owner.ok_or(TicketError::MissingOwner)?;
        let plain = C::decrypt(owner.as_bytes(), bytes).map_err(|_| TicketError::invalid("cannot decrypt"))?;
        decode(&plain)
    }

    pub fn create<P: Serialize>(
        &self,
        payload: &P,
        validity: Option<Duration>,
        owner: Option<&str>,
        secure: bool,
        now: MsSinceEpoch,
    ) -> Result<String, TicketError> {
        self.create_validated(payload, None, validity, owner, secure, now)
    }

    pub fn create_validated<P: Serialize>(
        &self,
        payload: &P,
        validator: Option<TicketValidator>,
        validity: Option<Duration>,
        owner: Option<&str>,
        secure: bool,
        now: MsSinceEpoch,
    ) -> Result<String, TicketError> {
        let data = Self::seal(encode(serde_json::to_value(payload)?)?, owner, secure)?;
        let id = random_string(TICKET_LENGTH).to_lowercase();
        self.repository.save(TicketRecord {
            id: id.clone(),
            owner: if secure { Some(SECURED.to_string()) } else { owner.map(str::to_string) },
            stamp: now,
            validity: validity.unwrap_or(self.config.default_validity),
            data,
            validator,
        })?;
        Ok(id)
    }

    pub fn get(&self, id: &str, invalidate: bool, owner: Option<&str>, secure: bool, now: MsSinceEpoch) -> Result<Value, TicketError> {
        let stored_owner = match (secure, owner) {
            (true, None) => return Err(TicketError::MissingOwner),
            (true, Some(_)) => Some(SECURED),
            (false, owner) => owner,
        };

        let mut record = self
            .repository
            .find(id)?
            .filter(|r| r.owner.as_deref() == stored_owner)
            .ok_or_else(|| TicketError::invalid("does not exist"))?;

        debug!(id, expires = record.expires().0, now = now.0, "ticket validity");
        if record.expires() < now {
            return Err(TicketError::invalid("not valid anymore"));
        }

        let payload = Self::open(&record.data, owner, secure)?;

        if let Some(validator) = &record.validator {
            if !validator.accepts(&payload) {
                return Err(TicketError::invalid("validation failed"));
            }
        }

        if invalidate {
            record.stamp = now.before(record.validity).before(Duration::from_secs(1));
            self.repository.save(record)?;
        }
        Ok(payload)
    }

    pub fn get_as<T: DeserializeOwned>(&self, id: &str, invalidate: bool, owner: Option<&str>, secure: bool, now: MsSinceEpoch) -> Result<T, TicketError> {
        let payload = self.get(id, invalidate, owner, secure, now)?;
        serde_json::from_value(payload).map_err(|e| TicketError::invalid(e.to_string()))
    }

    /// Merges the non-null `fields` into the payload once `check` accepted it.
    /// A ticket that no longer exists is left alone.
    pub fn update(
        &self,
        id: &str,
        owner: Option<&str>,
        secure: bool,
        check: impl Fn(&Value) -> bool,
        fields: Map<String, Value>,
    ) -> Result<(), TicketError> {
        let Some(mut record) = self.repository.find(id)? else {
            return Ok(());
        };

        let mut payload = Self::open(&record.data, owner, secure)?;
        if !check(&payload) {
            return Err(TicketError::invalid("validation failed"));
        }

        let Some(map) = payload.as_object_mut() else {
            return Err(TicketError::invalid("payload is not a map"));
        };
        for (key, value) in fields.into_iter().filter(|(_, v)| !v.is_null()) {
            map.insert(key, value);
        }

        record.data = Self::seal(encode(payload)?, owner, secure)?;
        self.repository.save(record)?;
        Ok(())
    }

    pub fn revalidate(&self, id: &str, validity: Option<Duration>, owner: Option<&str>, now: MsSinceEpoch) -> Result<(), TicketError> {
        let mut record = self
            .repository
            .find(id)?
            .filter(|r| r.owner.as_deref() == owner)
            .ok_or_else(|| TicketError::invalid("does not exist"))?;
        record.stamp = now;
        if let Some(validity) = validity.filter(|v| !v.is_zero()) {
            record.validity = validity;
        }
        self.repository.save(record)?;
        Ok(())
    }

    /// Creates a secure ticket whose key travels inside the returned id.
    pub fn create_for_tunnel(&self, ticket: &TunnelTicket, validity: Option<Duration>, now: MsSinceEpoch) -> Result<String, TicketError> {
        let owner = random_string(TUNNEL_OWNER_LENGTH);
        let validity = validity.unwrap_or(self.config.tunnel_validity);
        let id = self.create(ticket, Some(validity), Some(&owner), true, now)?;
        Ok(id + &owner)
    }

    pub fn get_for_tunnel(&self, ticket: &str, now: MsSinceEpoch) -> Result<TunnelTicket, TicketError> {
        if !ticket.is_ascii() || ticket.len() != TICKET_LENGTH + TUNNEL_OWNER_LENGTH {
            return Err(TicketError::invalid(format!("invalid ticket format: {ticket:?}")));
        }
        let (id, owner) = ticket.split_at(TICKET_LENGTH);
        self.get_as(id, false, Some(owner), true, now)
    }

    /// Sweeps expired tickets and anything older than the maximum age.
    pub fn cleanup(&self, now: MsSinceEpoch) -> Result<usize, TicketError> {
        let grace = self.config.grace;
        let oldest = now.before(self.config.max_validity);
        let removed = self
            .repository
            .retain(&mut |r| now <= r.expires().after(grace) && r.stamp >= oldest)?;
        if removed > 0 {
            debug!(removed, "swept tickets");
        }
        Ok(removed)
    }
}
