// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Dispatch adapter contract (C7): side-effectful delivery sinks,
//! pluggable behind a single `deliver`/`validate_opts` trait.

pub mod adapters;

use serde_json::Value;
use thiserror::Error;

use crate::signal::Signal;

/// Errors a dispatch adapter may return from `deliver` or `validate_opts`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// `validate_opts` rejected the adapter configuration.
    #[error("invalid dispatch opts: {0}")]
    InvalidOpts(String),
    /// The adapter is named but not implemented by this build (e.g.
    /// `http`/`webhook`, which need an external HTTP client).
    #[error("dispatch adapter `{0}` is not implemented")]
    Unimplemented(&'static str),
    /// The adapter attempted delivery and failed.
    #[error("delivery failed: {0}")]
    DeliveryFailed(String),
    /// A persistent subscription's inbound queue was saturated. Carries the
    /// subscription id.
    #[error("subscription saturated {{id: {0}, reason: queue_full}}")]
    Backpressure(String),
    /// One or more targets in a multi-target dispatch failed; carries one
    /// reason per failed target.
    #[error("multi-target dispatch failed: {0:?}")]
    MultiFailed(Vec<String>),
}

/// Recognized dispatch adapter tags and their options.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchTarget {
    /// Deliver to a specific in-process handle, addressed by id.
    Pid {
        /// Target identifier.
        target: String,
        /// Whether the handle is called synchronously or asynchronously.
        delivery_mode: DeliveryMode,
    },
    /// Deliver to a named process.
    Named {
        /// Registered name.
        target: String,
    },
    /// Deliver to a broadcast topic.
    PubSub {
        /// Target identifier.
        target: String,
        /// Topic name.
        topic: String,
    },
    /// Append to a log sink at the given level.
    Logger {
        /// `tracing` level name (e.g. `"info"`).
        level: String,
    },
    /// Print to stdout.
    Console,
    /// Discard (testing).
    Noop,
    /// HTTP POST. Named per the wire contract; not implemented in this
    /// build (external collaborator).
    Http {
        /// Target URL.
        url: String,
        /// HTTP method.
        method: String,
        /// Extra headers.
        headers: Value,
    },
    /// HTTP POST with a signature. Not implemented in this build.
    Webhook {
        /// Target URL.
        url: String,
        /// Signing secret.
        secret: String,
        /// Mapping from signal type to webhook event type.
        event_type_map: Value,
    },
    /// No-op placeholder, valid, always succeeds.
    Nil,
}

/// Whether a `pid` target is invoked synchronously or asynchronously.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    /// The caller waits for delivery to complete.
    Sync,
    /// Delivery happens on a separate task; the caller does not wait.
    Async,
}

/// A pluggable delivery sink. `validate_opts` runs once at route
/// registration; its result is cached so the hot path never re-validates.
#[async_trait::async_trait]
pub trait Dispatcher: Send + Sync {
    /// Delivers `signal` to this adapter's sink.
    async fn deliver(&self, signal: &Signal, target: &DispatchTarget) -> Result<(), DispatchError>;

    /// Validates `target`'s options, returning a normalized target to
    /// cache on the route.
    fn validate_opts(&self, target: DispatchTarget) -> Result<DispatchTarget, DispatchError> {
        match &target {
            DispatchTarget::Http { .. } => Err(DispatchError::Unimplemented("http")),
            DispatchTarget::Webhook { .. } => Err(DispatchError::Unimplemented("webhook")),
            _ => Ok(target),
        }
    }
}
