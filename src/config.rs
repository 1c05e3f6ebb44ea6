//! Serializable device configuration.

use crate::device::{DEFAULT_PORT, DEFAULT_TIMEOUT, DeviceBuilder};
use crate::error::Result;
use crate::protocol::Version;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

/// Connection settings for one device, as stored in a JSON config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub id: String,
    pub address: String,
    pub local_key: String,
    pub version: Version,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_timeout_secs")]
    pub connection_timeout_secs: u64,
    #[serde(default = "default_timeout_secs")]
    pub exchange_timeout_secs: u64,
    #[serde(default, deserialize_with = "deserialize_dps")]
    pub dps: Vec<String>,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT.as_secs()
}

impl DeviceConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn builder(&self) -> DeviceBuilder {
        DeviceBuilder::from_config(self)
    }
}

impl Serialize for Version {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

// Accepts both "3.3" and 3.3
impl<'de> Deserialize<'de> for Version {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        match Value::deserialize(deserializer)? {
            Value::String(s) => s.parse().map_err(D::Error::custom),
            Value::Number(n) => n
                .as_f64()
                .ok_or_else(|| D::Error::custom("invalid version number"))
                .and_then(|v| Version::try_from(v).map_err(D::Error::custom)),
            other => Err(D::Error::custom(format!("invalid version: {}", other))),
        }
    }
}

// Datapoint indices may be written as strings or integers
fn deserialize_dps<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<Vec<String>, D::Error> {
    Vec::<Value>::deserialize(deserializer)?
        .into_iter()
        .map(|v| match v {
            Value::String(s) => Ok(s),
            Value::Number(n) if n.is_u64() => Ok(n.to_string()),
            other => Err(D::Error::custom(format!("invalid dps index: {}", other))),
        })
        .collect()
}
