use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::crypto::MsSinceEpoch;

/// How an actor is bound to the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ActorKind {
    #[default]
    Managed,
    Unmanaged,
}

/// One network interface reported by an actor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct IdEntry {
    #[serde(default)]
    pub mac: String,
    #[serde(default)]
    pub ip: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ActorCommands {
    pub pre_command: String,
    pub post_command: String,
    pub run_once_command: String,
    pub custom: serde_json::Value,
}

/// A registered actor, keyed by MAC.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActorIdentity {
    pub token: String,
    pub mac: String,
    pub ip: String,
    pub ip_from: String,
    pub hostname: String,
    pub log_level: i64,
    pub os: String,
    pub subtype: String,
    pub commands: ActorCommands,
    pub username: String,
    pub stamp: MsSinceEpoch,
}

/// A service able to own unmanaged endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRecord {
    pub id: Uuid,
    pub name: String,
    pub token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceTokenAlias {
    pub alias: String,
    pub service: Uuid,
    pub unique_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServicePool {
    pub id: Uuid,
    pub service: Uuid,
    pub name: String,
    pub deadline: Option<MsSinceEpoch>,
}

/// An authenticated administrative caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaffUser {
    pub name: String,
    pub is_staff: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LogLevel {
    Other = 10000,
    Debug = 20000,
    Info = 30000,
    Warning = 40000,
    Error = 50000,
    Critical = 60000,
}

impl LogLevel {
    /// Unknown values map to [LogLevel::Other].
    pub fn from_int(value: i64) -> Self {
        match value {
            20000 => Self::Debug,
            30000 => Self::Info,
            40000 => Self::Warning,
            50000 => Self::Error,
            60000 => Self::Critical,
            _ => Self::Other,
        }
    }

    /// Actors before 4.0.0 number their levels from 0 instead of 10000.
    pub fn from_actor(value: i64, actor_version: &str) -> Self {
        if version_lt(actor_version, "4.0.0") {
            Self::from_int(value + 10000)
        } else {
            Self::from_int(value)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogSource {
    Actor,
    Internal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub owner: Uuid,
    pub level: LogLevel,
    pub source: LogSource,
    pub message: String,
    pub stamp: MsSinceEpoch,
}

/// Compares dotted versions numerically, missing or garbage parts count as zero.
pub fn version_lt(left: &str, right: &str) -> bool {
    fn parts(v: &str) -> Vec<u64> {
        v.split('.')
            .map(|p| p.trim().chars().take_while(char::is_ascii_digit).collect::<String>().parse().unwrap_or(0))
            .collect()
    }
    let (mut l, mut r) = (parts(left), parts(right));
    let len = l.len().max(r.len());
    l.resize(len, 0);
    r.resize(len, 0);
    l < r
}
