use chrono::DateTime;
use serde::{Deserialize, Serialize, de::Visitor};

use crate::core::{action::ActorAction, crypto::MsSinceEpoch};


/* ACTION SERDE IMPLEMENTATIONS */
impl Serialize for ActorAction {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: serde::Serializer {
        serializer.serialize_str(self.to_static_str())
    }
}

struct ActorActionVisitor;

impl<'v> Visitor<'v> for ActorActionVisitor {
    type Value = ActorAction;
    fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
        formatter.write_str("expecting a known actor action")
    }
    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
        where
            E: serde::de::Error, {
        ActorAction::try_from(v).map_err(E::custom)
    }
}

impl<'de> Deserialize<'de> for ActorAction {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
        where
            D: serde::Deserializer<'de> {
        deserializer.deserialize_str(ActorActionVisitor)
    }
}


/* Milliseconds Since Epoch */
impl Serialize for MsSinceEpoch {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: serde::Serializer {
        if serializer.is_human_readable() {
            self.as_datetime()
                .ok_or_else(|| serde::ser::Error::custom("timestamp out of range"))?
                .serialize(serializer)
        } else {
            serializer.serialize_i64(self.0)
        }
    }
}

struct MsSinceEpochVisitor;

impl<'v> Visitor<'v> for MsSinceEpochVisitor {
    type Value = MsSinceEpoch;

    fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
        formatter.write_str("an rfc3339 date")
    }
    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
        where
            E: serde::de::Error, {
        let value = DateTime::parse_from_rfc3339(v).map_err(E::custom)?;
        Ok(MsSinceEpoch(value.timestamp_millis()))
    }
}

impl<'de> Deserialize<'de> for MsSinceEpoch {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
        where
            D: serde::Deserializer<'de> {
        if deserializer.is_human_readable() {
            deserializer.deserialize_str(MsSinceEpochVisitor)
        } else {
            Ok(MsSinceEpoch(i64::deserialize(deserializer)?))
        }
    }
}


/// Durations written as whole seconds, the way configuration files carry them.
pub mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Duration::from_secs(u64::deserialize(deserializer)?))
    }
}
