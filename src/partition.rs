// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Partition shard (C10): an optional fan-out shard for non-persistent
//! subscriptions, rate-limited with a token bucket.
//!
//! Each shard is its own dedicated `tokio::spawn`ed mailbox loop, the same
//! per-connection actor shape used elsewhere in this crate, generalized to
//! a generic async dispatch mailbox. The token bucket itself is
//! hand-rolled rather than pulled in from a rate-limiting crate.

use std::{sync::Arc, time::Duration};

use tokio::{sync::mpsc, time::Instant};

use crate::{
    dispatch::{DispatchTarget, Dispatcher},
    signal::Signal,
};

/// Token-bucket rate limiter. Tokens refill continuously at
/// `rate_per_sec`; `burst_size` bounds how many may accumulate.
struct TokenBucket {
    rate_per_sec: f64,
    burst_size: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(rate_per_sec: u32, burst_size: u32) -> Self {
        Self {
            rate_per_sec: f64::from(rate_per_sec),
            burst_size: f64::from(burst_size),
            tokens: f64::from(burst_size),
            last_refill: Instant::now(),
        }
    }

    fn try_acquire(&mut self) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.last_refill = now;
        self.tokens = (self.tokens + elapsed * self.rate_per_sec).min(self.burst_size);

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// A signal routed to a subscription on this shard, plus the dispatcher
/// and target used to deliver it.
pub struct ShardDispatch {
    /// The signal to deliver.
    pub signal: Signal,
    /// Id of the subscription this dispatch targets (for telemetry).
    pub subscription_id: String,
    /// The adapter implementation to call.
    pub dispatcher: Arc<dyn Dispatcher>,
    /// The adapter's validated target configuration.
    pub target: DispatchTarget,
}

/// Handle to a running partition shard.
#[derive(Clone)]
pub struct PartitionHandle {
    mailbox: mpsc::Sender<ShardDispatch>,
}

impl PartitionHandle {
    /// Casts a dispatch to the shard; non-blocking from the bus's
    /// perspective (fire-and-forget fan-out).
    pub fn cast(&self, dispatch: ShardDispatch) {
        if self.mailbox.try_send(dispatch).is_err() {
            tracing::warn!("partition mailbox full, dropping dispatch");
        }
    }
}

/// Stable hash of a subscription id into a shard index.
#[must_use]
pub fn shard_index(subscription_id: &str, partition_count: usize) -> usize {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    subscription_id.hash(&mut hasher);
    (hasher.finish() as usize) % partition_count.max(1)
}

/// Spawns a partition shard actor with its own token bucket.
#[must_use]
pub fn spawn(rate_limit_per_sec: u32, burst_size: u32) -> PartitionHandle {
    let (tx, mut rx) = mpsc::channel::<ShardDispatch>(4096);

    tokio::spawn(async move {
        let mut bucket = TokenBucket::new(rate_limit_per_sec, burst_size);
        while let Some(dispatch) = rx.recv().await {
            if !bucket.try_acquire() {
                tracing::warn!(
                    subscription_id = %dispatch.subscription_id,
                    "queue.overflow"
                );
                continue;
            }
            if let Err(e) = dispatch
                .dispatcher
                .deliver(&dispatch.signal, &dispatch.target)
                .await
            {
                tracing::warn!(
                    subscription_id = %dispatch.subscription_id,
                    error = %e,
                    "partition dispatch failed"
                );
            }
        }
    });

    PartitionHandle { mailbox: tx }
}

/// A pool of partition shards, one per configured partition.
pub struct PartitionPool {
    shards: Vec<PartitionHandle>,
}

impl PartitionPool {
    /// Spawns `partition_count` shards, each with the given rate limit.
    #[must_use]
    pub fn new(partition_count: usize, rate_limit_per_sec: u32, burst_size: u32) -> Self {
        let shards = (0..partition_count.max(1))
            .map(|_| spawn(rate_limit_per_sec, burst_size))
            .collect();
        Self { shards }
    }

    /// Casts `dispatch` to the shard owning `subscription_id`.
    pub fn cast(&self, subscription_id: &str, dispatch: ShardDispatch) {
        let idx = shard_index(subscription_id, self.shards.len());
        self.shards[idx].cast(dispatch);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shard_index_is_stable_for_same_id() {
        assert_eq!(shard_index("sub-1", 8), shard_index("sub-1", 8));
    }

    #[test]
    fn shard_index_stays_in_bounds() {
        for i in 0..100 {
            let id = format!("sub-{i}");
            assert!(shard_index(&id, 4) < 4);
        }
    }

    #[test]
    fn token_bucket_exhausts_and_refills() {
        let mut bucket = TokenBucket::new(1000, 2);
        assert!(bucket.try_acquire());
        assert!(bucket.try_acquire());
        assert!(!bucket.try_acquire());
    }

    #[tokio::test]
    async fn token_bucket_refills_over_time() {
        let mut bucket = TokenBucket::new(1000, 1);
        assert!(bucket.try_acquire());
        assert!(!bucket.try_acquire());
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(bucket.try_acquire());
    }
}
