// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Persistent subscription actor (C8): a single-threaded actor per
//! persistent subscription owning its queue, in-flight slot, checkpoint,
//! and retry state.
//!
//! Structured as a `tokio::spawn` + mailbox + `CancellationToken` actor,
//! the same task loop and graceful-draining shape used elsewhere in this
//! crate, with its own small `Transition` enum for state transitions.

use std::{collections::VecDeque, sync::Arc, time::Duration};

use thiserror::Error;
use tokio::{
    sync::{mpsc, oneshot},
    time::Instant,
};
use tokio_util::sync::CancellationToken;

use crate::{
    dispatch::{DispatchError, DispatchTarget, Dispatcher},
    signal::Signal,
    storage::{DlqEntry, StorageAdapter, StorageError},
    subscription::ClientHandle,
};

/// Errors a persistent subscription actor may return to a caller.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PersistentError {
    /// The inbound queue was at capacity (backpressure).
    #[error("queue_full")]
    QueueFull,
    /// The actor's mailbox was gone (actor has terminated).
    #[error("subscription actor is no longer running")]
    ActorGone,
}

/// One of the four states a persistent subscription actor may be in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubState {
    /// No client currently connected.
    Disconnected,
    /// A signal is in flight, awaiting ack.
    Delivering,
    /// A client is present and the queue is empty.
    Idle,
    /// Shutting down; finishes draining in-flight work.
    Draining,
}

/// The outcome of handling one actor message: either stay in the current
/// state or move to a new one.
enum Transition {
    Next(SubState),
    Stay,
}

enum Msg {
    SignalIn {
        log_uuid: String,
        signal: Signal,
        reply: oneshot::Sender<Result<(), PersistentError>>,
    },
    Ack {
        log_uuid: String,
        reply: oneshot::Sender<()>,
    },
    Reconnect {
        client: ClientHandle,
        reply: oneshot::Sender<()>,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
    State {
        reply: oneshot::Sender<SubState>,
    },
    Checkpoint {
        reply: oneshot::Sender<Option<String>>,
    },
    Drain {
        reply: oneshot::Sender<()>,
    },
}

/// Owning, clonable handle used by the bus to talk to a running
/// persistent subscription actor.
#[derive(Clone)]
pub struct PersistentHandle {
    mailbox: mpsc::Sender<Msg>,
    cancel: CancellationToken,
}

impl PersistentHandle {
    /// Synchronous enqueue call: the actor replies `Ok(())` once the
    /// signal is queued, or `QueueFull` when saturated. This is the
    /// backpressure signal to the bus.
    pub async fn signal_in(&self, log_uuid: String, signal: Signal) -> Result<(), PersistentError> {
        let (tx, rx) = oneshot::channel();
        self.mailbox
            .send(Msg::SignalIn {
                log_uuid,
                signal,
                reply: tx,
            })
            .await
            .map_err(|_| PersistentError::ActorGone)?;
        rx.await.map_err(|_| PersistentError::ActorGone)?
    }

    /// Acknowledges delivery of the signal at `log_uuid`. A mismatched
    /// uuid (not the current in-flight one) is discarded idempotently.
    pub async fn ack(&self, log_uuid: String) -> Result<(), PersistentError> {
        let (tx, rx) = oneshot::channel();
        self.mailbox
            .send(Msg::Ack { log_uuid, reply: tx })
            .await
            .map_err(|_| PersistentError::ActorGone)?;
        rx.await.map_err(|_| PersistentError::ActorGone)
    }

    /// Replaces the client handle and resumes delivery from
    /// `checkpoint + 1`.
    pub async fn reconnect(&self, client: ClientHandle) -> Result<(), PersistentError> {
        let (tx, rx) = oneshot::channel();
        self.mailbox
            .send(Msg::Reconnect { client, reply: tx })
            .await
            .map_err(|_| PersistentError::ActorGone)?;
        rx.await.map_err(|_| PersistentError::ActorGone)
    }

    /// Detaches the client handle; the queue and checkpoint are retained.
    pub async fn disconnect(&self) -> Result<(), PersistentError> {
        let (tx, rx) = oneshot::channel();
        self.mailbox
            .send(Msg::Disconnect { reply: tx })
            .await
            .map_err(|_| PersistentError::ActorGone)?;
        rx.await.map_err(|_| PersistentError::ActorGone)
    }

    /// Returns the actor's current state.
    pub async fn state(&self) -> Result<SubState, PersistentError> {
        let (tx, rx) = oneshot::channel();
        self.mailbox
            .send(Msg::State { reply: tx })
            .await
            .map_err(|_| PersistentError::ActorGone)?;
        rx.await.map_err(|_| PersistentError::ActorGone)
    }

    /// Returns the actor's last-acknowledged checkpoint, if any.
    pub async fn checkpoint(&self) -> Result<Option<String>, PersistentError> {
        let (tx, rx) = oneshot::channel();
        self.mailbox
            .send(Msg::Checkpoint { reply: tx })
            .await
            .map_err(|_| PersistentError::ActorGone)?;
        rx.await.map_err(|_| PersistentError::ActorGone)
    }

    /// Requests a graceful shutdown: the actor finishes its current
    /// in-flight delivery attempt, then stops.
    pub async fn drain(&self) -> Result<(), PersistentError> {
        let (tx, rx) = oneshot::channel();
        self.mailbox
            .send(Msg::Drain { reply: tx })
            .await
            .map_err(|_| PersistentError::ActorGone)?;
        rx.await.map_err(|_| PersistentError::ActorGone)
    }

    /// Hard stop, skipping drain.
    pub fn kill_now(&self) {
        self.cancel.cancel();
    }
}

/// Configuration for a persistent subscription actor.
#[derive(Debug, Clone)]
pub struct PersistentConfig {
    /// Maximum queue length before `signal_in` returns `QueueFull`.
    pub queue_cap: usize,
    /// Maximum delivery attempts before writing to the DLQ.
    pub max_attempts: u32,
    /// Initial backoff, doubled per attempt.
    pub backoff_ms: u64,
}

impl Default for PersistentConfig {
    fn default() -> Self {
        Self {
            queue_cap: 10_000,
            max_attempts: 5,
            backoff_ms: 100,
        }
    }
}

struct InFlight {
    log_uuid: String,
    signal: Signal,
    attempts: u32,
}

struct Actor {
    subscription_id: String,
    path: String,
    queue: VecDeque<(String, Signal)>,
    in_flight: Option<InFlight>,
    checkpoint: Option<String>,
    client: Option<ClientHandle>,
    state: SubState,
    cfg: PersistentConfig,
    dispatcher: Arc<dyn Dispatcher>,
    target: DispatchTarget,
    storage: Arc<dyn StorageAdapter>,
}

impl Actor {
    fn checkpoint_key(&self) -> String {
        format!("sub:{}", self.subscription_id)
    }

    fn enqueue(&mut self, log_uuid: String, signal: Signal) -> Result<Transition, PersistentError> {
        if self.queue.len() >= self.cfg.queue_cap {
            return Err(PersistentError::QueueFull);
        }
        self.queue.push_back((log_uuid, signal));
        match self.state {
            SubState::Idle if self.in_flight.is_none() => Ok(Transition::Next(SubState::Delivering)),
            _ => Ok(Transition::Stay),
        }
    }

    async fn try_start_delivery(&mut self) {
        if self.in_flight.is_some() {
            return;
        }
        let Some((log_uuid, signal)) = self.queue.pop_front() else {
            self.state = SubState::Idle;
            return;
        };
        self.in_flight = Some(InFlight {
            log_uuid,
            signal,
            attempts: 0,
        });
        self.state = SubState::Delivering;
    }

    async fn attempt_delivery(&mut self) -> Option<Duration> {
        let Some(in_flight) = &self.in_flight else {
            return None;
        };
        let result = self
            .dispatcher
            .deliver(&in_flight.signal, &self.target)
            .await;

        match result {
            Ok(()) => {
                let uuid = in_flight.log_uuid.clone();
                self.advance_checkpoint(uuid).await;
                self.in_flight = None;
                self.try_start_delivery().await;
                None
            }
            Err(e) => self.handle_delivery_failure(e).await,
        }
    }

    async fn handle_delivery_failure(&mut self, err: DispatchError) -> Option<Duration> {
        let Some(in_flight) = &mut self.in_flight else {
            return None;
        };
        in_flight.attempts += 1;
        if in_flight.attempts < self.cfg.max_attempts {
            let backoff = self.cfg.backoff_ms * 2u64.pow(in_flight.attempts - 1);
            Some(Duration::from_millis(backoff))
        } else {
            let entry = DlqEntry {
                entry_id: in_flight.log_uuid.clone(),
                signal: in_flight.signal.clone(),
                failure_reason: err.to_string(),
                attempts: in_flight.attempts,
                last_attempt_at: chrono::Utc::now(),
            };
            let uuid = in_flight.log_uuid.clone();
            let _ = self
                .storage
                .put_dlq_entry(&self.subscription_id, entry)
                .await;
            self.advance_checkpoint(uuid).await;
            self.in_flight = None;
            self.try_start_delivery().await;
            None
        }
    }

    async fn advance_checkpoint(&mut self, log_uuid: String) {
        self.checkpoint = Some(log_uuid.clone());
        let _ = self
            .storage
            .put_checkpoint(&self.checkpoint_key(), log_uuid.into_bytes())
            .await;
    }

    async fn handle(&mut self, msg: Msg) -> Option<Duration> {
        match msg {
            Msg::SignalIn {
                log_uuid,
                signal,
                reply,
            } => {
                let outcome = self.enqueue(log_uuid, signal);
                match outcome {
                    Ok(Transition::Next(next)) => {
                        self.state = next;
                        let _ = reply.send(Ok(()));
                        self.try_start_delivery().await;
                        return Some(Duration::ZERO);
                    }
                    Ok(Transition::Stay) => {
                        let _ = reply.send(Ok(()));
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e));
                    }
                }
                None
            }
            Msg::Ack { log_uuid, reply } => {
                let matches_in_flight = self
                    .in_flight
                    .as_ref()
                    .is_some_and(|f| f.log_uuid == log_uuid);
                if matches_in_flight {
                    self.advance_checkpoint(log_uuid).await;
                    self.in_flight = None;
                    self.try_start_delivery().await;
                }
                let _ = reply.send(());
                if self.in_flight.is_some() {
                    Some(Duration::ZERO)
                } else {
                    None
                }
            }
            Msg::Reconnect { client, reply } => {
                self.client = Some(client);
                if self.state == SubState::Disconnected {
                    self.state = if self.queue.is_empty() && self.in_flight.is_none() {
                        SubState::Idle
                    } else {
                        SubState::Delivering
                    };
                }
                let _ = reply.send(());
                self.try_start_delivery().await;
                Some(Duration::ZERO)
            }
            Msg::Disconnect { reply } => {
                self.client = None;
                self.state = SubState::Disconnected;
                let _ = reply.send(());
                None
            }
            Msg::State { reply } => {
                let _ = reply.send(self.state);
                None
            }
            Msg::Checkpoint { reply } => {
                let _ = reply.send(self.checkpoint.clone());
                None
            }
            Msg::Drain { reply } => {
                self.state = SubState::Draining;
                let _ = reply.send(());
                None
            }
        }
    }
}

/// Spawns a persistent subscription actor, replaying any unacknowledged
/// log entries matching `path` past the loaded checkpoint.
pub async fn spawn(
    subscription_id: String,
    path: String,
    target: DispatchTarget,
    dispatcher: Arc<dyn Dispatcher>,
    storage: Arc<dyn StorageAdapter>,
    cfg: PersistentConfig,
    replay: Vec<(String, Signal)>,
) -> PersistentHandle {
    let checkpoint_key = format!("sub:{subscription_id}");
    let checkpoint = storage
        .get_checkpoint(&checkpoint_key)
        .await
        .ok()
        .flatten()
        .and_then(|bytes| String::from_utf8(bytes).ok());

    let queue: VecDeque<(String, Signal)> = replay
        .into_iter()
        .filter(|(uuid, _)| checkpoint.as_deref().is_none_or(|cp| uuid.as_str() > cp))
        .collect();

    let (tx, mut rx) = mpsc::channel(256);
    let cancel = CancellationToken::new();
    let cancel_for_task = cancel.clone();

    let mut actor = Actor {
        subscription_id,
        path,
        queue,
        in_flight: None,
        checkpoint,
        client: None,
        state: SubState::Idle,
        cfg,
        dispatcher,
        target,
        storage,
    };

    tokio::spawn(async move {
        let far_future = Instant::now() + Duration::from_secs(60 * 60 * 24 * 365);
        let mut retry_sleep = Box::pin(tokio::time::sleep_until(far_future));
        let mut retry_pending = false;

        actor.try_start_delivery().await;
        if actor.in_flight.is_some() {
            retry_sleep.as_mut().reset(Instant::now());
            retry_pending = true;
        }

        loop {
            tokio::select! {
                () = cancel_for_task.cancelled() => break,
                maybe_msg = rx.recv() => {
                    match maybe_msg {
                        Some(msg) => {
                            if let Some(delay) = actor.handle(msg).await {
                                retry_sleep.as_mut().reset(Instant::now() + delay);
                                retry_pending = true;
                            }
                            if actor.state == SubState::Draining && actor.in_flight.is_none() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                () = &mut retry_sleep, if retry_pending => {
                    retry_pending = false;
                    tokio::select! {
                        () = cancel_for_task.cancelled() => break,
                        delay = actor.attempt_delivery() => {
                            if let Some(delay) = delay {
                                retry_sleep.as_mut().reset(Instant::now() + delay);
                                retry_pending = true;
                            }
                        }
                    }
                }
            }
        }
    });

    PersistentHandle {
        mailbox: tx,
        cancel,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{dispatch::adapters::NoopDispatcher, storage::memory::InMemoryStorage};

    fn sig(t: &str) -> Signal {
        let g = crate::signal::IdGenerator::new();
        Signal::new(&g, t, "test", json!(null)).expect("valid")
    }

    async fn handle_with(cfg: PersistentConfig, dispatcher: Arc<dyn Dispatcher>) -> PersistentHandle {
        spawn(
            "sub-1".to_string(),
            "e.*".to_string(),
            DispatchTarget::Noop,
            dispatcher,
            Arc::new(InMemoryStorage::new()),
            cfg,
            vec![],
        )
        .await
    }

    #[tokio::test]
    async fn signal_in_then_ack_advances_checkpoint() {
        let handle = handle_with(PersistentConfig::default(), Arc::new(NoopDispatcher)).await;
        handle
            .signal_in("u1".to_string(), sig("e.a"))
            .await
            .expect("enqueued");
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.ack("u1".to_string()).await.expect("acked");
        assert_eq!(handle.checkpoint().await.unwrap(), Some("u1".to_string()));
    }

    #[tokio::test]
    async fn queue_full_returns_backpressure_error() {
        let cfg = PersistentConfig {
            queue_cap: 1,
            ..PersistentConfig::default()
        };
        let handle = handle_with(cfg, Arc::new(NoopDispatcher)).await;
        // First signal starts delivering immediately (queue drains to 0),
        // so fill the in-flight slot, then saturate the queue behind it.
        handle.signal_in("u1".to_string(), sig("e.a")).await.unwrap();
        handle.signal_in("u2".to_string(), sig("e.b")).await.unwrap();
        let result = handle.signal_in("u3".to_string(), sig("e.c")).await;
        assert_eq!(result, Err(PersistentError::QueueFull));
    }

    #[tokio::test]
    async fn mismatched_ack_is_discarded_idempotently() {
        let handle = handle_with(PersistentConfig::default(), Arc::new(NoopDispatcher)).await;
        handle.signal_in("u1".to_string(), sig("e.a")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.ack("not-u1".to_string()).await.expect("ignored");
        assert_eq!(handle.checkpoint().await.unwrap(), None);
    }

    #[tokio::test]
    async fn disconnect_then_reconnect_preserves_queue_and_checkpoint() {
        let handle = handle_with(PersistentConfig::default(), Arc::new(NoopDispatcher)).await;
        handle.signal_in("u1".to_string(), sig("e.a")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.ack("u1".to_string()).await.unwrap();
        handle.disconnect().await.unwrap();
        assert_eq!(handle.state().await.unwrap(), SubState::Disconnected);
        let (_anchor, client) = ClientHandle::new();
        handle.reconnect(client).await.unwrap();
        assert_eq!(handle.checkpoint().await.unwrap(), Some("u1".to_string()));
    }
}
