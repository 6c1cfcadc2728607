// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Subscription registry entries and the persistent subscription actor.

pub mod persistent;

use std::sync::{Arc, Weak};

use crate::dispatch::DispatchTarget;
pub use persistent::PersistentHandle;

/// Non-owning back-reference to the consuming process. Modeled as a weak
/// marker rather than a real process registry lookup: the owning client
/// task holds the paired `Arc<()>` and the bus treats a strong count of
/// zero as the client's disconnect notification.
#[derive(Clone)]
pub struct ClientHandle {
    marker: Weak<()>,
}

impl ClientHandle {
    /// Creates a live handle; the returned `Arc<()>` must be held by the
    /// owning client for as long as it is considered connected.
    #[must_use]
    pub fn new() -> (Arc<()>, Self) {
        let anchor = Arc::new(());
        let marker = Arc::downgrade(&anchor);
        (anchor, Self { marker })
    }

    /// Whether the owning client is still alive.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.marker.strong_count() > 0
    }
}

/// Dispatch configuration for a subscription: a single target, or a list
/// dispatched in parallel up to the bus's configured concurrency cap.
#[derive(Debug, Clone)]
pub enum DispatchConfig {
    /// A single adapter target.
    Single(DispatchTarget),
    /// Multiple targets, dispatched with a concurrency cap.
    Multi(Vec<DispatchTarget>),
}

/// A registered subscription.
pub struct Subscription {
    /// Unique id within the bus.
    pub id: String,
    /// Route pattern this subscription was registered under.
    pub path: String,
    /// Adapter configuration used to deliver matching signals.
    pub dispatch: DispatchConfig,
    /// Whether this subscription is backed by a persistent actor.
    pub persistent: bool,
    /// Owned handle to the subscription actor; `None` for non-persistent
    /// subscriptions.
    pub persistence: Option<PersistentHandle>,
    /// Non-owning back-reference to the consuming client, if currently
    /// connected.
    pub client: Option<ClientHandle>,
}

impl Subscription {
    /// Builds a non-persistent subscription record.
    #[must_use]
    pub fn new_non_persistent(id: String, path: String, dispatch: DispatchTarget) -> Self {
        Self {
            id,
            path,
            dispatch: DispatchConfig::Single(dispatch),
            persistent: false,
            persistence: None,
            client: None,
        }
    }

    /// Builds a non-persistent subscription record dispatched to several
    /// targets in parallel.
    #[must_use]
    pub fn new_non_persistent_multi(id: String, path: String, targets: Vec<DispatchTarget>) -> Self {
        Self {
            id,
            path,
            dispatch: DispatchConfig::Multi(targets),
            persistent: false,
            persistence: None,
            client: None,
        }
    }

    /// Builds a persistent subscription record backed by `handle`.
    #[must_use]
    pub fn new_persistent(
        id: String,
        path: String,
        dispatch: DispatchTarget,
        handle: PersistentHandle,
    ) -> Self {
        Self {
            id,
            path,
            dispatch: DispatchConfig::Single(dispatch),
            persistent: true,
            persistence: Some(handle),
            client: None,
        }
    }

    /// Replaces the client back-reference, e.g. after a reconnect.
    pub fn set_client(&mut self, client: Option<ClientHandle>) {
        self.client = client;
    }
}
