//! Connection headers: a flat `string -> string | null` map exchanged during
//! the handshake filter before the application layer sees any traffic
//!. Values are carried as a JSON object on the wire because
//! that gives us `\uXXXX` escaping, control-character escaping, and
//! multi-byte UTF-8 handling for free via `serde_json`, matching the
//! round-trip properties requires.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::error::{Error, Result};

/// Well-known header names used by the protocol stack itself. Application
/// code may set additional headers; these are reserved only in the sense
/// that the stack reads them, not that other names are rejected.
pub mod well_known {
    pub const PROTOCOL_NAME: &str = "Protocol-Name";
    pub const MINIMUM_SUPPORTED_VERSION: &str = "Minimum-Supported-Version";
    pub const COOKIE: &str = "Remoting-Cookie";
}

/// A flat header map. Kept in a `BTreeMap` so wire output is deterministic,
/// which is convenient for tests and logs even though the protocol does not
/// require a specific key order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionHeaders {
    entries: BTreeMap<String, Option<String>>,
}

impl ConnectionHeaders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.entries.insert(key.into(), Some(value.into()));
        self
    }

    pub fn set_null(&mut self, key: impl Into<String>) -> &mut Self {
        self.entries.insert(key.into(), None);
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).and_then(|v| v.as_deref())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<&str>)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_deref()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Encode as a UTF-8 JSON object, e.g. `{"Protocol-Name":"JNLP4","Remoting-Cookie":null}`.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut object = serde_json::Map::with_capacity(self.entries.len());
        for (k, v) in &self.entries {
            let value = match v {
                Some(s) => Value::String(s.clone()),
                None => Value::Null,
            };
            object.insert(k.clone(), value);
        }
        serde_json::to_vec(&Value::Object(object))
            .map_err(|e| Error::ClassResolution {
                class_name: "<connection-headers>".into(),
                reason: format!("header encoding failed: {e}"),
            })
    }

    /// Decode a JSON object of `string -> string|null` pairs. Any other JSON
    /// shape, or a non-string/non-null value, is rejected rather than
    /// silently coerced.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let value: Value = serde_json::from_slice(bytes).map_err(|e| Error::ClassResolution {
            class_name: "<connection-headers>".into(),
            reason: format!("header decoding failed: {e}"),
        })?;
        let object = value.as_object().ok_or_else(|| Error::ClassResolution {
            class_name: "<connection-headers>".into(),
            reason: "connection headers must be a JSON object".into(),
        })?;
        let mut entries = BTreeMap::new();
        for (k, v) in object {
            let parsed = match v {
                Value::Null => None,
                Value::String(s) => Some(s.clone()),
                other => {
                    return Err(Error::ClassResolution {
                        class_name: "<connection-headers>".into(),
                        reason: format!("header {k} has non-string value {other}"),
                    })
                }
            };
            entries.insert(k.clone(), parsed);
        }
        Ok(Self { entries })
    }
}
