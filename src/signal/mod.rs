// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The immutable signal envelope (C1) and its monotonic ID generator.

pub mod id;
pub mod trace;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub use id::IdGenerator;

/// Constant `specversion` carried by every signal, per the wire format.
pub const SPECVERSION: &str = "1.0.2";

/// Errors raised while constructing or validating a [`Signal`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignalError {
    /// `type` was empty.
    #[error("signal type must not be empty")]
    EmptyType,
    /// `type` did not match `^[A-Za-z0-9._*-]+$`.
    #[error("signal type `{0}` contains characters outside [A-Za-z0-9._*-]")]
    InvalidType(String),
    /// An extension namespace key did not match `^[a-z][a-z0-9]*(\.[a-z][a-z0-9]*)*$`.
    #[error("extension namespace `{0}` is not a valid lowercase dotted identifier")]
    InvalidNamespace(String),
}

fn validate_type(t: &str) -> Result<(), SignalError> {
    if t.is_empty() {
        return Err(SignalError::EmptyType);
    }
    if !t
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'*' | b'-'))
    {
        return Err(SignalError::InvalidType(t.to_string()));
    }
    Ok(())
}

fn validate_namespace(ns: &str) -> Result<(), SignalError> {
    let valid = !ns.is_empty()
        && ns.split('.').all(|segment| {
            let mut chars = segment.chars();
            match chars.next() {
                Some(first) if first.is_ascii_lowercase() => {
                    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
                }
                _ => false,
            }
        });
    if valid {
        Ok(())
    } else {
        Err(SignalError::InvalidNamespace(ns.to_string()))
    }
}

/// The immutable signal envelope carried through the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    /// Monotonic UUIDv7-compatible id, unique within a bus.
    pub id: String,
    /// Dotted-path type, e.g. `"order.created"`.
    #[serde(rename = "type")]
    pub signal_type: String,
    /// Origin identifier.
    pub source: String,
    /// ISO-8601 creation timestamp.
    pub time: DateTime<Utc>,
    /// Constant `"1.0.2"`.
    pub specversion: String,
    /// Opaque structured payload.
    pub data: Value,
    /// Optional CloudEvents `datacontenttype`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datacontenttype: Option<String>,
    /// Optional CloudEvents `dataschema`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dataschema: Option<String>,
    /// Optional CloudEvents `subject`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    /// Namespace-keyed extension payloads (e.g. `correlation`).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extensions: BTreeMap<String, Value>,
}

impl Signal {
    /// Builds a new signal, generating its `id` and `time` and validating
    /// `signal_type` and every extension namespace key.
    pub fn new(
        generator: &IdGenerator,
        signal_type: impl Into<String>,
        source: impl Into<String>,
        data: Value,
    ) -> Result<Self, SignalError> {
        let signal_type = signal_type.into();
        validate_type(&signal_type)?;
        let (id, _ts) = generator.generate();
        Ok(Self {
            id,
            signal_type,
            source: source.into(),
            time: Utc::now(),
            specversion: SPECVERSION.to_string(),
            data,
            datacontenttype: None,
            dataschema: None,
            subject: None,
            extensions: BTreeMap::new(),
        })
    }

    /// Attaches (or replaces) an extension payload under `namespace`,
    /// validating the namespace format.
    pub fn with_extension(
        mut self,
        namespace: impl Into<String>,
        payload: Value,
    ) -> Result<Self, SignalError> {
        let namespace = namespace.into();
        validate_namespace(&namespace)?;
        self.extensions.insert(namespace, payload);
        Ok(self)
    }

    /// Re-validates `signal_type` and every extension namespace key; used
    /// for signals deserialized from storage or a transport boundary,
    /// where [`Signal::new`]'s constructor checks were bypassed.
    pub fn validate(&self) -> Result<(), SignalError> {
        validate_type(&self.signal_type)?;
        for ns in self.extensions.keys() {
            validate_namespace(ns)?;
        }
        Ok(())
    }

    /// The dot-separated segments of `signal_type`, used by the router.
    #[must_use]
    pub fn type_segments(&self) -> Vec<&str> {
        self.signal_type.split('.').collect()
    }
}

/// A signal as stored in the [`crate::log::Log`]: `uuid` is the log key,
/// distinct from `signal.id` to allow future log-internal rewrites.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedSignal {
    /// The log's own monotonic key for this entry.
    pub uuid: String,
    /// Copy of `signal.signal_type`, kept denormalized for cheap replay
    /// filtering without deserializing `signal.data`.
    #[serde(rename = "type")]
    pub signal_type: String,
    /// Time the entry was appended to the log.
    pub created_at: DateTime<Utc>,
    /// The recorded signal itself.
    pub signal: Signal,
}

impl RecordedSignal {
    /// Wraps `signal` under a fresh log key.
    #[must_use]
    pub fn new(uuid: String, signal: Signal) -> Self {
        Self {
            uuid,
            signal_type: signal.signal_type.clone(),
            created_at: Utc::now(),
            signal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gen() -> IdGenerator {
        IdGenerator::new()
    }

    #[test]
    fn new_signal_has_constant_specversion_and_fresh_id() {
        let g = gen();
        let s = Signal::new(&g, "user.created", "test", Value::Null).expect("valid");
        assert_eq!(s.specversion, SPECVERSION);
        assert!(!s.id.is_empty());
    }

    #[test]
    fn empty_type_is_rejected() {
        let g = gen();
        assert_eq!(
            Signal::new(&g, "", "test", Value::Null),
            Err(SignalError::EmptyType)
        );
    }

    #[test]
    fn type_with_invalid_characters_is_rejected() {
        let g = gen();
        assert!(matches!(
            Signal::new(&g, "user created!", "test", Value::Null),
            Err(SignalError::InvalidType(_))
        ));
    }

    #[test]
    fn wildcard_characters_are_allowed_in_type() {
        let g = gen();
        assert!(Signal::new(&g, "audit.**", "test", Value::Null).is_ok());
        assert!(Signal::new(&g, "a.*", "test", Value::Null).is_ok());
    }

    #[test]
    fn extension_namespace_must_be_lowercase_dotted() {
        let g = gen();
        let s = Signal::new(&g, "user.created", "test", Value::Null).expect("valid");
        assert!(s.clone().with_extension("correlation", Value::Null).is_ok());
        assert!(s.clone().with_extension("Correlation", Value::Null).is_err());
        assert!(s.clone().with_extension("a..b", Value::Null).is_err());
        assert!(s.with_extension("1abc", Value::Null).is_err());
    }

    #[test]
    fn type_segments_splits_on_dot() {
        let g = gen();
        let s = Signal::new(&g, "a.b.c", "test", Value::Null).expect("valid");
        assert_eq!(s.type_segments(), vec!["a", "b", "c"]);
    }

    #[test]
    fn recorded_signal_denormalizes_type() {
        let g = gen();
        let s = Signal::new(&g, "order.created", "test", Value::Null).expect("valid");
        let rec = RecordedSignal::new("log-key-1".to_string(), s.clone());
        assert_eq!(rec.signal_type, s.signal_type);
        assert_eq!(rec.uuid, "log-key-1");
    }
}
