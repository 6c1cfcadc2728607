// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! W3C-compatible trace context, carried as the `correlation` signal
//! extension namespace.

use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;

/// Namespace key under which a [`TraceContext`] is stored in
/// [`crate::signal::Signal::extensions`].
pub const NAMESPACE: &str = "correlation";

/// Errors parsing or validating a trace context.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TraceError {
    /// The `traceparent` string did not have the expected
    /// `version-traceid-spanid-flags` shape.
    #[error("malformed traceparent: {0}")]
    MalformedTraceparent(String),
    /// A hex field was not the exact expected length.
    #[error("invalid hex length for {field}: expected {expected}, got {actual}")]
    InvalidHexLength {
        /// Field name (`trace_id` or `span_id`).
        field: &'static str,
        /// Expected hex character count.
        expected: usize,
        /// Actual hex character count observed.
        actual: usize,
    },
    /// A hex field contained non-hex characters.
    #[error("non-hex characters in {0}")]
    NotHex(&'static str),
}

/// A W3C `traceparent`-compatible trace context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceContext {
    /// 32 lowercase hex characters.
    pub trace_id: String,
    /// 16 lowercase hex characters.
    pub span_id: String,
    /// Optional parent span, 16 lowercase hex characters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_span_id: Option<String>,
    /// Optional upstream identifier that caused this signal to be emitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub causation_id: Option<String>,
    /// Optional opaque vendor tracestate, carried through unmodified.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tracestate: Option<String>,
}

fn random_hex(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    rand::rng().fill_bytes(&mut buf);
    hex::encode(buf)
}

fn validate_hex(field: &'static str, value: &str, expected_len: usize) -> Result<(), TraceError> {
    if value.len() != expected_len {
        return Err(TraceError::InvalidHexLength {
            field,
            expected: expected_len,
            actual: value.len(),
        });
    }
    if !value.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(TraceError::NotHex(field));
    }
    Ok(())
}

impl TraceContext {
    /// Generates a fresh root trace context (new trace, no parent).
    #[must_use]
    pub fn generate() -> Self {
        Self {
            trace_id: random_hex(16),
            span_id: random_hex(8),
            parent_span_id: None,
            causation_id: None,
            tracestate: None,
        }
    }

    /// Derives a child context sharing `trace_id`, with `self`'s span as
    /// the new parent.
    #[must_use]
    pub fn child(&self) -> Self {
        Self {
            trace_id: self.trace_id.clone(),
            span_id: random_hex(8),
            parent_span_id: Some(self.span_id.clone()),
            causation_id: self.causation_id.clone(),
            tracestate: self.tracestate.clone(),
        }
    }

    /// Validates field lengths/charset for a context constructed outside
    /// [`TraceContext::generate`] (e.g. deserialized from the wire).
    pub fn validate(&self) -> Result<(), TraceError> {
        validate_hex("trace_id", &self.trace_id, 32)?;
        validate_hex("span_id", &self.span_id, 16)?;
        if let Some(parent) = &self.parent_span_id {
            validate_hex("parent_span_id", parent, 16)?;
        }
        Ok(())
    }

    /// Renders the W3C `traceparent` header value:
    /// `00-{trace_id}-{span_id}-01`.
    #[must_use]
    pub fn to_traceparent(&self) -> String {
        format!("00-{}-{}-01", self.trace_id, self.span_id)
    }

    /// Parses a `traceparent` header value, rejecting malformed strings
    /// and requiring exact hex lengths.
    pub fn from_traceparent(s: &str) -> Result<Self, TraceError> {
        let parts: Vec<&str> = s.split('-').collect();
        if parts.len() != 4 {
            return Err(TraceError::MalformedTraceparent(s.to_string()));
        }
        let [version, trace_id, span_id, flags] = [parts[0], parts[1], parts[2], parts[3]];
        if version.len() != 2 || flags.len() != 2 {
            return Err(TraceError::MalformedTraceparent(s.to_string()));
        }
        validate_hex("trace_id", trace_id, 32)?;
        validate_hex("span_id", span_id, 16)?;

        Ok(Self {
            trace_id: trace_id.to_string(),
            span_id: span_id.to_string(),
            parent_span_id: None,
            causation_id: None,
            tracestate: None,
        })
    }

    /// Serializes to the `correlation` extension payload shape.
    #[must_use]
    pub fn to_map(&self) -> Value {
        json!(self)
    }

    /// Parses a `correlation` extension payload back into a context.
    pub fn from_map(value: &Value) -> Result<Self, TraceError> {
        serde_json::from_value(value.clone())
            .map_err(|e| TraceError::MalformedTraceparent(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn traceparent_round_trips_modulo_optional_fields() {
        let ctx = TraceContext::generate();
        let parsed = TraceContext::from_traceparent(&ctx.to_traceparent()).expect("parses");
        assert_eq!(parsed.trace_id, ctx.trace_id);
        assert_eq!(parsed.span_id, ctx.span_id);
        assert_eq!(parsed.parent_span_id, None);
        assert_eq!(parsed.causation_id, None);
        assert_eq!(parsed.tracestate, None);
    }

    #[test]
    fn map_round_trips_full_context() {
        let mut ctx = TraceContext::generate();
        ctx.causation_id = Some("cause-123".to_string());
        ctx.tracestate = Some("vendor=value".to_string());
        let map = ctx.to_map();
        let parsed = TraceContext::from_map(&map).expect("parses");
        assert_eq!(parsed, ctx);
    }

    #[test]
    fn child_shares_trace_id_and_points_parent_at_self() {
        let root = TraceContext::generate();
        let child = root.child();
        assert_eq!(child.trace_id, root.trace_id);
        assert_eq!(child.parent_span_id.as_deref(), Some(root.span_id.as_str()));
        assert_ne!(child.span_id, root.span_id);
    }

    #[test]
    fn rejects_malformed_traceparent() {
        assert!(TraceContext::from_traceparent("garbage").is_err());
        assert!(TraceContext::from_traceparent("00-short-short-01").is_err());
        assert!(
            TraceContext::from_traceparent(
                "00-00000000000000000000000000000000-0000000000000000-01"
            )
            .is_ok()
        );
    }
}
