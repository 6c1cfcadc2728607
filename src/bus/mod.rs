// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The signal bus (C9): ties the router, middleware pipeline, log,
//! partition pool, and subscription registry into the single entry point.

pub mod dlq;
pub mod snapshot;

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use thiserror::Error;
use tokio::{
    sync::{Mutex as AsyncMutex, Semaphore},
    task::JoinSet,
};

use crate::{
    cfg::config::BusConfig,
    dispatch::{
        DispatchError, DispatchTarget, Dispatcher,
        adapters::{ChannelDispatcher, ConsoleDispatcher, LoggerDispatcher, NoopDispatcher},
    },
    log::{Log, LogError},
    middleware::{DispatchDecision, MiddlewareError, Pipeline},
    partition::{PartitionPool, ShardDispatch},
    router::{RouterError, SharedRouter, Target},
    signal::{IdGenerator, RecordedSignal, Signal, SignalError},
    storage::{DlqEntry, StorageAdapter, StorageError},
    subscription::{ClientHandle, DispatchConfig, Subscription, persistent::PersistentConfig},
};

pub use snapshot::{Snapshot, SnapshotRegistry};

/// Unified error surface for bus operations, grouped into the
/// five buckets every caller needs to branch on: validation, routing,
/// execution, timeout, internal.
#[derive(Debug, Error, Clone)]
pub enum BusError {
    /// A signal or route failed validation before anything was recorded.
    #[error("validation error: {0}")]
    Validation(String),
    /// No route, or a conflicting route, prevented dispatch.
    #[error("routing error: {0}")]
    Routing(String),
    /// A dispatch attempt failed, or a subscription's queue was full.
    #[error("execution error: {0}")]
    Execution(String),
    /// A middleware hook did not complete within its timeout.
    #[error("timeout error: {0}")]
    Timeout(String),
    /// An unexpected internal condition (storage backend failure, etc.).
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<SignalError> for BusError {
    fn from(e: SignalError) -> Self {
        BusError::Validation(e.to_string())
    }
}

impl From<LogError> for BusError {
    fn from(e: LogError) -> Self {
        BusError::Validation(e.to_string())
    }
}

impl From<RouterError> for BusError {
    fn from(e: RouterError) -> Self {
        match e {
            RouterError::NilType | RouterError::NoHandlers => BusError::Routing(e.to_string()),
            RouterError::InvalidPath(_) | RouterError::RouteConflict { .. } => {
                BusError::Validation(e.to_string())
            }
        }
    }
}

impl From<MiddlewareError> for BusError {
    fn from(e: MiddlewareError) -> Self {
        match e {
            MiddlewareError::Timeout(_) => BusError::Timeout(e.to_string()),
            MiddlewareError::Failed { .. } => BusError::Execution(e.to_string()),
        }
    }
}

impl From<StorageError> for BusError {
    fn from(e: StorageError) -> Self {
        BusError::Internal(e.to_string())
    }
}

/// State that must be touched under a single writer's serialization point:
/// the log (append order matters) and the middleware pipeline (per-stage
/// state threading must not interleave between publishes).
struct BusCore {
    log: Log,
    pipeline: Pipeline,
}

/// The in-process signal bus.
pub struct Bus {
    router: SharedRouter,
    subscriptions: DashMap<String, Subscription>,
    dispatchers: DashMap<String, Arc<dyn Dispatcher>>,
    core: AsyncMutex<BusCore>,
    partitions: Option<PartitionPool>,
    storage: Arc<dyn StorageAdapter>,
    id_gen: IdGenerator,
    snapshots: SnapshotRegistry,
    persistent_defaults: PersistentConfig,
    log_ttl_ms: Option<u64>,
    dispatch_max_concurrency: usize,
}

/// Resolves the reference dispatcher implementation backing a target tag.
/// `pid`/`named`/`pubsub` targets need a live channel supplied by the
/// caller via [`Bus::subscribe_with_dispatcher`]; plain `subscribe` only
/// accepts the self-contained tags.
fn default_dispatcher_for(target: &DispatchTarget) -> Option<Arc<dyn Dispatcher>> {
    match target {
        DispatchTarget::Console => Some(Arc::new(ConsoleDispatcher)),
        DispatchTarget::Logger { .. } => Some(Arc::new(LoggerDispatcher)),
        DispatchTarget::Noop | DispatchTarget::Nil => Some(Arc::new(NoopDispatcher)),
        _ => None,
    }
}

impl Bus {
    /// Builds a bus from `cfg`, backed by `storage`.
    #[must_use]
    pub fn new(cfg: &BusConfig, storage: Arc<dyn StorageAdapter>) -> Self {
        let partitions = if cfg.partitions.count > 1 {
            Some(PartitionPool::new(
                cfg.partitions.count,
                cfg.partitions.rate_limit_per_sec,
                cfg.partitions.burst_size,
            ))
        } else {
            None
        };

        Self {
            router: SharedRouter::new(),
            subscriptions: DashMap::new(),
            dispatchers: DashMap::new(),
            core: AsyncMutex::new(BusCore {
                log: Log::new(cfg.log.max_log_size, cfg.log.ttl_ms),
                pipeline: Pipeline::new(Duration::from_millis(cfg.middleware.timeout_ms)),
            }),
            partitions,
            storage,
            id_gen: IdGenerator::new(),
            snapshots: SnapshotRegistry::new(),
            persistent_defaults: PersistentConfig {
                queue_cap: cfg.persistent_subscription.queue_cap,
                max_attempts: cfg.persistent_subscription.max_attempts,
                backoff_ms: cfg.persistent_subscription.backoff_ms,
            },
            log_ttl_ms: cfg.log.ttl_ms,
            dispatch_max_concurrency: cfg.dispatch.max_concurrency,
        }
    }

    /// Registers a middleware stage, run around every publish in
    /// registration order.
    pub async fn register_middleware(&self, middleware: Box<dyn crate::middleware::Middleware>) {
        self.core.lock().await.pipeline.register(middleware);
    }

    /// Registers a non-persistent subscription at `path`, backed by one of
    /// the self-contained dispatch tags (`console`, `logger`, `noop`,
    /// `nil`). Use [`Bus::subscribe_with_dispatcher`] for `pid`/`named`/
    /// `pubsub` targets, and [`Bus::subscribe_persistent`] for at-least-
    /// once delivery.
    pub fn subscribe(&self, path: String, target: DispatchTarget) -> Result<String, BusError> {
        let dispatcher = default_dispatcher_for(&target)
            .ok_or_else(|| BusError::Validation(format!("no default dispatcher for {target:?}")))?;
        self.subscribe_with_dispatcher(path, target, dispatcher)
    }

    /// Registers a non-persistent subscription backed by an explicit
    /// dispatcher instance, e.g. a [`ChannelDispatcher`] standing in for a
    /// `pid` target. Use [`Bus::subscribe_persistent`] for at-least-once
    /// delivery. `target`'s options are validated once here; the validated
    /// target is what gets stored on the subscription, so the hot dispatch
    /// path never re-validates.
    pub fn subscribe_with_dispatcher(
        &self,
        path: String,
        target: DispatchTarget,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> Result<String, BusError> {
        let target = dispatcher
            .validate_opts(target)
            .map_err(|e| BusError::Validation(e.to_string()))?;
        let (id, _ts) = self.id_gen.generate();
        self.router
            .add(vec![crate::router::Route::new(path.clone(), Target::Atom(id.clone()))])?;
        self.subscriptions.insert(
            id.clone(),
            Subscription::new_non_persistent(id.clone(), path, target),
        );
        self.dispatchers.insert(id.clone(), dispatcher);
        Ok(id)
    }

    /// Registers a non-persistent subscription dispatched to several
    /// targets in parallel, up to the configured concurrency cap. Every
    /// target's options are validated once here, same as
    /// [`Bus::subscribe_with_dispatcher`].
    pub fn subscribe_multi(
        &self,
        path: String,
        targets: Vec<DispatchTarget>,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> Result<String, BusError> {
        let targets = targets
            .into_iter()
            .map(|t| dispatcher.validate_opts(t))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| BusError::Validation(e.to_string()))?;
        let (id, _ts) = self.id_gen.generate();
        self.router
            .add(vec![crate::router::Route::new(path.clone(), Target::Atom(id.clone()))])?;
        self.subscriptions.insert(
            id.clone(),
            Subscription::new_non_persistent_multi(id.clone(), path, targets),
        );
        self.dispatchers.insert(id.clone(), dispatcher);
        Ok(id)
    }

    /// Registers a persistent subscription: spawns its actor, replaying
    /// any matching log entries past its stored checkpoint.
    pub async fn subscribe_persistent(
        &self,
        path: String,
        target: DispatchTarget,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> Result<String, BusError> {
        let (id, _ts) = self.id_gen.generate();
        self.spawn_persistent(id, path, target, dispatcher).await
    }

    /// Restarts a persistent subscription under a known id, e.g. after a
    /// supervisor restart: the actor reloads its checkpoint from storage
    /// and replays only the log entries past it. If `subscription_id` is
    /// already registered it is drained and replaced.
    pub async fn resume_persistent(
        &self,
        subscription_id: String,
        path: String,
        target: DispatchTarget,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> Result<String, BusError> {
        if let Some((_, old)) = self.subscriptions.remove(&subscription_id) {
            if let Some(handle) = &old.persistence {
                let _ = handle.drain().await;
            }
            self.dispatchers.remove(&subscription_id);
            self.router.remove(&[old.path])?;
        }
        self.spawn_persistent(subscription_id, path, target, dispatcher).await
    }

    async fn spawn_persistent(
        &self,
        id: String,
        path: String,
        target: DispatchTarget,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> Result<String, BusError> {
        let target = dispatcher
            .validate_opts(target)
            .map_err(|e| BusError::Validation(e.to_string()))?;

        let replay = {
            let core = self.core.lock().await;
            core.log
                .replay(&path, None)
                .into_iter()
                .map(|rec| (rec.uuid, rec.signal))
                .collect()
        };

        let handle = crate::subscription::persistent::spawn(
            id.clone(),
            path.clone(),
            target.clone(),
            Arc::clone(&dispatcher),
            Arc::clone(&self.storage),
            self.persistent_defaults.clone(),
            replay,
        )
        .await;

        self.router
            .add(vec![crate::router::Route::new(path.clone(), Target::Atom(id.clone()))])?;
        self.subscriptions.insert(
            id.clone(),
            Subscription::new_persistent(id.clone(), path, target, handle),
        );
        self.dispatchers.insert(id.clone(), dispatcher);
        Ok(id)
    }

    /// Removes a subscription. For a persistent subscription this requests
    /// a graceful drain before dropping the registry entry; the underlying
    /// route (and any other subscription sharing its exact path) is
    /// removed along with it.
    pub async fn unsubscribe(&self, subscription_id: &str) -> Result<(), BusError> {
        let Some((_, sub)) = self.subscriptions.remove(subscription_id) else {
            return Ok(());
        };
        if let Some(handle) = &sub.persistence {
            let _ = handle.drain().await;
        }
        self.dispatchers.remove(subscription_id);
        self.router.remove(&[sub.path])?;
        Ok(())
    }

    /// Attaches a live client to a subscription, e.g. after a reconnect.
    /// For a persistent subscription, resumes delivery from its stored
    /// checkpoint and returns that checkpoint (the log uuid of the last
    /// acknowledged signal, if any).
    pub async fn reconnect(
        &self,
        subscription_id: &str,
        client: ClientHandle,
    ) -> Result<Option<String>, BusError> {
        let mut entry = self
            .subscriptions
            .get_mut(subscription_id)
            .ok_or_else(|| BusError::Validation(format!("unknown subscription {subscription_id}")))?;
        entry.set_client(Some(client.clone()));
        if let Some(handle) = &entry.persistence {
            handle
                .reconnect(client)
                .await
                .map_err(|e| BusError::Execution(e.to_string()))?;
            return handle
                .checkpoint()
                .await
                .map_err(|e| BusError::Execution(e.to_string()));
        }
        Ok(None)
    }

    /// Publishes `signals` through the full pipeline: pre-log middleware,
    /// log append, per-signal routing, per-pair middleware and dispatch,
    /// post-dispatch and post-publish middleware. Returns the recorded
    /// signals on success.
    pub async fn publish(&self, signals: Vec<Signal>) -> Result<Vec<RecordedSignal>, BusError> {
        for s in &signals {
            s.validate()?;
        }

        let mut core = self.core.lock().await;
        let signals = core.pipeline.run_before_publish(signals).await?;
        let pairs = core.log.append(&self.id_gen, signals)?;
        let recorded: Vec<RecordedSignal> = pairs
            .iter()
            .map(|(uuid, signal)| RecordedSignal::new(uuid.clone(), signal.clone()))
            .collect();

        for (uuid, signal) in &pairs {
            self.dispatch_one(&mut core.pipeline, uuid, signal).await?;
        }

        core.pipeline.run_after_publish(&pairs.iter().map(|(_, s)| s.clone()).collect::<Vec<_>>()).await;
        Ok(recorded)
    }

    /// Routes and delivers one recorded signal to every matching
    /// subscription. Backpressure from a persistent subscription's
    /// saturated queue aborts the whole publish call.
    async fn dispatch_one(&self, pipeline: &mut Pipeline, log_uuid: &str, signal: &Signal) -> Result<(), BusError> {
        let targets = match self.router.route(signal) {
            Ok(t) => t,
            Err(RouterError::NoHandlers) => return Ok(()),
            Err(e) => {
                tracing::warn!(error = %e, "routing failed for published signal");
                return Ok(());
            }
        };

        for subscription_id in flatten_atoms(&targets) {
            let Some(sub) = self.subscriptions.get(&subscription_id) else {
                continue;
            };

            let decision = pipeline.run_before_dispatch(signal.clone(), &sub).await;
            let DispatchDecision::Proceed(signal) = decision else {
                continue;
            };

            let result = self.deliver_to(&sub, log_uuid, &signal).await;
            pipeline.run_after_dispatch(&signal, &sub, &result).await;
            if let Err(DispatchError::Backpressure(id)) = &result {
                tracing::warn!(subscription_id = %id, "backpressure");
                return Err(BusError::Execution(format!(
                    "subscription saturated {{id: {id}, reason: queue_full}}"
                )));
            }
        }
        Ok(())
    }

    async fn deliver_to(
        &self,
        sub: &Subscription,
        log_uuid: &str,
        signal: &Signal,
    ) -> Result<(), DispatchError> {
        if let Some(handle) = &sub.persistence {
            return handle.signal_in(log_uuid.to_string(), signal.clone()).await.map_err(|e| {
                if matches!(e, crate::subscription::persistent::PersistentError::QueueFull) {
                    DispatchError::Backpressure(sub.id.clone())
                } else {
                    DispatchError::DeliveryFailed(e.to_string())
                }
            });
        }

        let Some(dispatcher) = self.dispatchers.get(&sub.id).map(|d| Arc::clone(&d)) else {
            return Err(DispatchError::DeliveryFailed(format!(
                "no dispatcher registered for subscription {}",
                sub.id
            )));
        };

        match &sub.dispatch {
            DispatchConfig::Single(target) => {
                if let Some(partitions) = &self.partitions {
                    partitions.cast(
                        &sub.id,
                        ShardDispatch {
                            signal: signal.clone(),
                            subscription_id: sub.id.clone(),
                            dispatcher,
                            target: target.clone(),
                        },
                    );
                    Ok(())
                } else {
                    dispatcher.deliver(signal, target).await
                }
            }
            DispatchConfig::Multi(targets) => {
                if let Some(partitions) = &self.partitions {
                    for target in targets {
                        partitions.cast(
                            &sub.id,
                            ShardDispatch {
                                signal: signal.clone(),
                                subscription_id: sub.id.clone(),
                                dispatcher: Arc::clone(&dispatcher),
                                target: target.clone(),
                            },
                        );
                    }
                    Ok(())
                } else {
                    deliver_multi(dispatcher, signal, targets, self.dispatch_max_concurrency).await
                }
            }
        }
    }

    /// Takes a new snapshot of every log entry matching `path`.
    pub async fn snapshot_create(&self, id: String, path: String) -> Snapshot {
        let core = self.core.lock().await;
        self.snapshots.create(id, path, &core.log)
    }

    /// Lists snapshot metadata.
    #[must_use]
    pub fn snapshot_list(&self) -> Vec<(String, String, DateTime<Utc>)> {
        self.snapshots.list()
    }

    /// Reads a snapshot by id.
    #[must_use]
    pub fn snapshot_read(&self, id: &str) -> Option<Snapshot> {
        self.snapshots.read(id)
    }

    /// Deletes a snapshot by id.
    pub fn snapshot_delete(&self, id: &str) {
        self.snapshots.delete(id);
    }

    /// Lists DLQ entries for `subscription_id`.
    pub async fn dlq_entries(&self, subscription_id: &str) -> Result<Vec<DlqEntry>, BusError> {
        Ok(dlq::dlq_entries(self.storage.as_ref(), subscription_id).await?)
    }

    /// Redrives up to `limit` DLQ entries for `subscription_id`.
    pub async fn redrive_dlq(
        &self,
        subscription_id: &str,
        limit: usize,
        clear_on_success: bool,
    ) -> Result<dlq::RedriveReport, BusError> {
        let sub = self
            .subscriptions
            .get(subscription_id)
            .ok_or_else(|| BusError::Validation(format!("unknown subscription {subscription_id}")))?;
        let dispatcher = self
            .dispatchers
            .get(subscription_id)
            .map(|d| Arc::clone(&d))
            .ok_or_else(|| BusError::Internal(format!("no dispatcher for {subscription_id}")))?;
        match &sub.dispatch {
            DispatchConfig::Single(target) => Ok(dlq::redrive_dlq(
                self.storage.as_ref(),
                subscription_id,
                &dispatcher,
                target,
                limit,
                clear_on_success,
            )
            .await?),
            DispatchConfig::Multi(targets) => Ok(dlq::redrive_dlq_multi(
                self.storage.as_ref(),
                subscription_id,
                &dispatcher,
                targets,
                limit,
                clear_on_success,
            )
            .await?),
        }
    }

    /// Clears the DLQ for `subscription_id`.
    pub async fn clear_dlq(&self, subscription_id: &str) -> Result<(), BusError> {
        Ok(dlq::clear_dlq(self.storage.as_ref(), subscription_id).await?)
    }

    /// Swaps the dispatcher backing a non-persistent or persistent
    /// subscription, e.g. to fix a broken adapter before a DLQ redrive.
    /// Does not affect an already-spawned persistent actor's in-flight
    /// dispatcher; only future [`Bus::redrive_dlq`] calls and new dispatch
    /// use the replacement.
    pub fn replace_dispatcher(
        &self,
        subscription_id: &str,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> Result<(), BusError> {
        if !self.subscriptions.contains_key(subscription_id) {
            return Err(BusError::Validation(format!("unknown subscription {subscription_id}")));
        }
        self.dispatchers.insert(subscription_id.to_string(), dispatcher);
        Ok(())
    }

    /// Spawns the log GC tick (only if `log_ttl_ms` is configured) and the
    /// subscriber-death reaper. Requires the bus to be shared via `Arc` so
    /// the background tasks can outlive the caller.
    pub fn start_background_tasks(self: &Arc<Self>) {
        if let Some(ttl_ms) = self.log_ttl_ms {
            let bus = Arc::clone(self);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_millis(ttl_ms.max(1)));
                loop {
                    ticker.tick().await;
                    let removed = bus.core.lock().await.log.gc();
                    if removed > 0 {
                        tracing::debug!(removed, "log.gc");
                    }
                }
            });
        }

        let bus = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(5));
            loop {
                ticker.tick().await;
                let dead: Vec<String> = bus
                    .subscriptions
                    .iter()
                    .filter(|e| e.client.as_ref().is_some_and(|c| !c.is_alive()))
                    .map(|e| e.id.clone())
                    .collect();
                for id in dead {
                    if let Some(mut sub) = bus.subscriptions.get_mut(&id) {
                        if sub.persistent {
                            if let Some(handle) = &sub.persistence {
                                let _ = handle.disconnect().await;
                            }
                            sub.set_client(None);
                        } else {
                            drop(sub);
                            bus.subscriptions.remove(&id);
                            bus.dispatchers.remove(&id);
                        }
                    }
                }
            }
        });
    }
}

/// Delivers `signal` to every target in `targets` concurrently, capped at
/// `max_concurrency` in flight at once. Succeeds only if every target
/// accepts delivery; otherwise carries every failure reason.
async fn deliver_multi(
    dispatcher: Arc<dyn Dispatcher>,
    signal: &Signal,
    targets: &[DispatchTarget],
    max_concurrency: usize,
) -> Result<(), DispatchError> {
    let semaphore = Arc::new(Semaphore::new(max_concurrency.max(1)));
    let mut set = JoinSet::new();
    for target in targets.iter().cloned() {
        let dispatcher = Arc::clone(&dispatcher);
        let signal = signal.clone();
        let semaphore = Arc::clone(&semaphore);
        set.spawn(async move {
            let Ok(_permit) = semaphore.acquire_owned().await else {
                return Err(DispatchError::DeliveryFailed("dispatch semaphore closed".to_string()));
            };
            dispatcher.deliver(&signal, &target).await
        });
    }

    let mut reasons = Vec::new();
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => reasons.push(e.to_string()),
            Err(e) => reasons.push(e.to_string()),
        }
    }

    if reasons.is_empty() {
        Ok(())
    } else {
        Err(DispatchError::MultiFailed(reasons))
    }
}

fn flatten_atoms(targets: &[Target]) -> Vec<String> {
    let mut out = Vec::new();
    for t in targets {
        match t {
            Target::Atom(id) => out.push(id.clone()),
            Target::Multi(inner) => out.extend(flatten_atoms(inner)),
            Target::AdapterCall(module, _opts) => {
                tracing::warn!(module = %module, "adapter-call targets are not resolvable by this bus");
            }
        }
    }
    out
}
