// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Middleware pipeline (C4): an ordered list of hooks run around every
//! publish, each bounded by `middleware_timeout_ms`.

use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tokio::time::timeout;

use crate::{dispatch::DispatchError, signal::Signal, subscription::Subscription};

/// Errors raised while running a middleware hook.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MiddlewareError {
    /// The hook's future did not complete within `middleware_timeout_ms`.
    #[error("middleware `{0}` timed out")]
    Timeout(String),
    /// The hook returned an application-level error.
    #[error("middleware `{middleware}` failed: {reason}")]
    Failed {
        /// Name of the middleware that failed.
        middleware: String,
        /// Reason given by the middleware.
        reason: String,
    },
}

/// Result of running `before_dispatch` for one (signal, subscription)
/// pair.
#[derive(Debug, Clone)]
pub enum DispatchDecision {
    /// Proceed to dispatch with (possibly transformed) `signal`.
    Proceed(Signal),
    /// Drop this pair silently (telemetry only, no error).
    Skip,
}

/// A single middleware's per-publish accumulator, threaded through every
/// hook call within one publish and committed back to the bus at the end.
pub type MiddlewareState = Value;

/// A stage in the pipeline. Implementors hold their own config; `state`
/// is passed explicitly by the pipeline runner rather than stored on
/// `self`, so one middleware instance never races itself across
/// concurrent publishes on different buses.
pub trait Middleware: Send + Sync {
    /// Stable name used in error messages and telemetry.
    fn name(&self) -> &str;

    /// Runs before the log append; may transform `signals` or abort the
    /// whole publish.
    fn before_publish<'a>(
        &'a self,
        signals: Vec<Signal>,
        state: MiddlewareState,
    ) -> std::pin::Pin<
        Box<dyn Future<Output = Result<(Vec<Signal>, MiddlewareState), String>> + Send + 'a>,
    >;

    /// Runs once per matching subscription before dispatch; may
    /// transform the signal, skip the pair, or drop it with a warning.
    #[allow(clippy::type_complexity)]
    fn before_dispatch<'a>(
        &'a self,
        signal: Signal,
        subscription: &'a Subscription,
        state: MiddlewareState,
    ) -> std::pin::Pin<
        Box<dyn Future<Output = Result<(DispatchDecision, MiddlewareState), String>> + Send + 'a>,
    >;

    /// Runs once per dispatch after the adapter call returns.
    fn after_dispatch<'a>(
        &'a self,
        signal: &'a Signal,
        subscription: &'a Subscription,
        result: &'a Result<(), DispatchError>,
        state: MiddlewareState,
    ) -> std::pin::Pin<Box<dyn Future<Output = MiddlewareState> + Send + 'a>>;

    /// Runs once at the end of a publish.
    fn after_publish<'a>(
        &'a self,
        signals: &'a [Signal],
        state: MiddlewareState,
    ) -> std::pin::Pin<Box<dyn Future<Output = MiddlewareState> + Send + 'a>>;
}

/// One registered middleware plus its current committed state.
pub struct Stage {
    /// The middleware implementation.
    pub middleware: Box<dyn Middleware>,
    /// State committed back to the bus at the end of the prior publish.
    pub state: MiddlewareState,
}

/// Ordered list of middleware stages, run around every publish.
#[derive(Default)]
pub struct Pipeline {
    stages: Vec<Stage>,
    hook_timeout: Duration,
}

impl Pipeline {
    /// Builds an empty pipeline with the given per-hook timeout
    /// (`middleware_timeout_ms`, default 100ms).
    #[must_use]
    pub fn new(hook_timeout: Duration) -> Self {
        Self {
            stages: Vec::new(),
            hook_timeout,
        }
    }

    /// Appends a middleware, initialized with `Value::Null` state.
    pub fn register(&mut self, middleware: Box<dyn Middleware>) {
        self.stages.push(Stage {
            middleware,
            state: Value::Null,
        });
    }

    /// Runs `before_publish` across every stage in order, threading state
    /// and signals through each. Aborts (returning the failing stage's
    /// error) on the first failure or timeout without committing any
    /// state.
    pub async fn run_before_publish(
        &mut self,
        mut signals: Vec<Signal>,
    ) -> Result<Vec<Signal>, MiddlewareError> {
        for stage in &mut self.stages {
            let name = stage.middleware.name().to_string();
            let fut = stage
                .middleware
                .before_publish(signals, stage.state.clone());
            let outcome = timeout(self.hook_timeout, fut)
                .await
                .map_err(|_| MiddlewareError::Timeout(name.clone()))?;
            match outcome {
                Ok((next_signals, next_state)) => {
                    signals = next_signals;
                    stage.state = next_state;
                }
                Err(reason) => {
                    return Err(MiddlewareError::Failed {
                        middleware: name,
                        reason,
                    });
                }
            }
        }
        Ok(signals)
    }

    /// Runs `before_dispatch` across every stage for one (signal,
    /// subscription) pair. A `Skip` decision or a failure short-circuits
    /// the remaining stages; a timeout is treated as a failure (drop +
    /// warn, does not abort the publish).
    pub async fn run_before_dispatch(
        &mut self,
        mut signal: Signal,
        subscription: &Subscription,
    ) -> DispatchDecision {
        for stage in &mut self.stages {
            let name = stage.middleware.name().to_string();
            let fut =
                stage
                    .middleware
                    .before_dispatch(signal.clone(), subscription, stage.state.clone());
            match timeout(self.hook_timeout, fut).await {
                Ok(Ok((DispatchDecision::Proceed(next_signal), next_state))) => {
                    signal = next_signal;
                    stage.state = next_state;
                }
                Ok(Ok((DispatchDecision::Skip, next_state))) => {
                    stage.state = next_state;
                    return DispatchDecision::Skip;
                }
                Ok(Err(reason)) => {
                    tracing::warn!(middleware = %name, %reason, "before_dispatch failed, dropping pair");
                    return DispatchDecision::Skip;
                }
                Err(_) => {
                    tracing::warn!(middleware = %name, "before_dispatch timed out, dropping pair");
                    return DispatchDecision::Skip;
                }
            }
        }
        DispatchDecision::Proceed(signal)
    }

    /// Runs `after_dispatch` across every stage; errors are logged, not
    /// propagated, and state is preserved across a timeout.
    pub async fn run_after_dispatch(
        &mut self,
        signal: &Signal,
        subscription: &Subscription,
        result: &Result<(), DispatchError>,
    ) {
        for stage in &mut self.stages {
            let name = stage.middleware.name().to_string();
            let fut = stage
                .middleware
                .after_dispatch(signal, subscription, result, stage.state.clone());
            match timeout(self.hook_timeout, fut).await {
                Ok(next_state) => stage.state = next_state,
                Err(_) => {
                    tracing::warn!(middleware = %name, "after_dispatch timed out");
                }
            }
        }
    }

    /// Runs `after_publish` across every stage once at the end of a
    /// publish.
    pub async fn run_after_publish(&mut self, signals: &[Signal]) {
        for stage in &mut self.stages {
            let name = stage.middleware.name().to_string();
            let fut = stage.middleware.after_publish(signals, stage.state.clone());
            match timeout(self.hook_timeout, fut).await {
                Ok(next_state) => stage.state = next_state,
                Err(_) => {
                    tracing::warn!(middleware = %name, "after_publish timed out");
                }
            }
        }
    }
}
