// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Reference in-process dispatch adapters. `http` and `webhook` are named
//! in [`super::DispatchTarget`] per the wire contract but are external
//! collaborators out of scope for this build.

use tokio::sync::mpsc;

use super::{DispatchError, DispatchTarget, Dispatcher};
use crate::signal::Signal;

/// Discards every signal. Used for testing and as the `nil`/`noop`
/// target's backing implementation.
pub struct NoopDispatcher;

#[async_trait::async_trait]
impl Dispatcher for NoopDispatcher {
    async fn deliver(&self, _signal: &Signal, _target: &DispatchTarget) -> Result<(), DispatchError> {
        Ok(())
    }
}

/// Prints the signal to stdout.
pub struct ConsoleDispatcher;

#[async_trait::async_trait]
impl Dispatcher for ConsoleDispatcher {
    async fn deliver(&self, signal: &Signal, _target: &DispatchTarget) -> Result<(), DispatchError> {
        println!("{signal:?}");
        Ok(())
    }
}

/// Emits the signal as a `tracing` event at the configured level.
pub struct LoggerDispatcher;

#[async_trait::async_trait]
impl Dispatcher for LoggerDispatcher {
    async fn deliver(&self, signal: &Signal, target: &DispatchTarget) -> Result<(), DispatchError> {
        let level = match target {
            DispatchTarget::Logger { level } => level.as_str(),
            _ => "info",
        };
        match level {
            "error" => tracing::error!(signal_id = %signal.id, "dispatch.logger"),
            "warn" => tracing::warn!(signal_id = %signal.id, "dispatch.logger"),
            "debug" => tracing::debug!(signal_id = %signal.id, "dispatch.logger"),
            "trace" => tracing::trace!(signal_id = %signal.id, "dispatch.logger"),
            _ => tracing::info!(signal_id = %signal.id, "dispatch.logger"),
        }
        Ok(())
    }
}

/// Delivers over a `tokio::sync::mpsc` channel, standing in for the
/// `pid`/`named`/`pubsub` targets in a bus with no real process registry.
pub struct ChannelDispatcher {
    sender: mpsc::Sender<Signal>,
}

impl ChannelDispatcher {
    /// Wraps a channel sender as a dispatcher.
    #[must_use]
    pub fn new(sender: mpsc::Sender<Signal>) -> Self {
        Self { sender }
    }
}

#[async_trait::async_trait]
impl Dispatcher for ChannelDispatcher {
    async fn deliver(&self, signal: &Signal, _target: &DispatchTarget) -> Result<(), DispatchError> {
        self.sender
            .send(signal.clone())
            .await
            .map_err(|e| DispatchError::DeliveryFailed(e.to_string()))
    }
}

/// Always fails; used to drive DLQ scenarios in tests.
pub struct FailingDispatcher {
    reason: String,
}

impl FailingDispatcher {
    /// Builds a dispatcher that always fails with `reason`.
    #[must_use]
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[async_trait::async_trait]
impl Dispatcher for FailingDispatcher {
    async fn deliver(&self, _signal: &Signal, _target: &DispatchTarget) -> Result<(), DispatchError> {
        Err(DispatchError::DeliveryFailed(self.reason.clone()))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn sig() -> Signal {
        let g = crate::signal::IdGenerator::new();
        Signal::new(&g, "a.b", "test", json!(null)).expect("valid")
    }

    #[tokio::test]
    async fn noop_always_succeeds() {
        let d = NoopDispatcher;
        assert!(d.deliver(&sig(), &DispatchTarget::Noop).await.is_ok());
    }

    #[tokio::test]
    async fn failing_dispatcher_always_errs() {
        let d = FailingDispatcher::new("boom");
        let err = d.deliver(&sig(), &DispatchTarget::Nil).await.unwrap_err();
        assert!(matches!(err, DispatchError::DeliveryFailed(reason) if reason == "boom"));
    }

    #[tokio::test]
    async fn channel_dispatcher_delivers_clone() {
        let (tx, mut rx) = mpsc::channel(1);
        let d = ChannelDispatcher::new(tx);
        let signal = sig();
        d.deliver(&signal, &DispatchTarget::Noop).await.expect("delivered");
        let received = rx.recv().await.expect("received");
        assert_eq!(received.id, signal.id);
    }

    #[tokio::test]
    async fn http_and_webhook_are_unimplemented_at_validation() {
        let d = NoopDispatcher;
        let http = DispatchTarget::Http {
            url: "https://example.com".to_string(),
            method: "POST".to_string(),
            headers: json!({}),
        };
        assert!(matches!(
            d.validate_opts(http),
            Err(DispatchError::Unimplemented("http"))
        ));
    }
}
