// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{fs, path::Path};

use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};

/// Root configuration for a [`crate::bus::Bus`], loaded from YAML.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct BusConfig {
    /// Middleware pipeline settings.
    pub middleware: MiddlewareConfig,
    /// Non-persistent fan-out partitioning.
    pub partitions: PartitionConfig,
    /// Log retention settings.
    pub log: LogConfig,
    /// Dispatch concurrency settings.
    pub dispatch: DispatchConfig,
    /// Defaults applied to every persistent subscription.
    pub persistent_subscription: PersistentSubscriptionConfig,
}

/// `middleware_timeout_ms`, default 100.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct MiddlewareConfig {
    #[serde(rename = "TimeoutMs", default = "default_middleware_timeout_ms")]
    /// Per-hook timeout in milliseconds.
    pub timeout_ms: u64,
}

impl Default for MiddlewareConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_middleware_timeout_ms(),
        }
    }
}

fn default_middleware_timeout_ms() -> u64 {
    100
}

/// `partition_count`, `partition_rate_limit_per_sec`, `partition_burst_size`.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct PartitionConfig {
    #[serde(rename = "Count", default = "default_partition_count")]
    /// Number of shards; 1 disables partitioning (inline dispatch).
    pub count: usize,
    #[serde(rename = "RateLimitPerSec", default = "default_rate_limit_per_sec")]
    /// Token-bucket refill rate per shard.
    pub rate_limit_per_sec: u32,
    #[serde(rename = "BurstSize", default = "default_burst_size")]
    /// Token-bucket burst capacity per shard.
    pub burst_size: u32,
}

impl Default for PartitionConfig {
    fn default() -> Self {
        Self {
            count: default_partition_count(),
            rate_limit_per_sec: default_rate_limit_per_sec(),
            burst_size: default_burst_size(),
        }
    }
}

fn default_partition_count() -> usize {
    1
}
fn default_rate_limit_per_sec() -> u32 {
    10_000
}
fn default_burst_size() -> u32 {
    1_000
}

/// `max_log_size`, `log_ttl_ms`.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct LogConfig {
    #[serde(rename = "MaxSize", default = "default_max_log_size")]
    /// Maximum number of retained log entries.
    pub max_log_size: usize,
    #[serde(rename = "TtlMs", default)]
    /// Optional TTL in milliseconds; unset disables GC.
    pub ttl_ms: Option<u64>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            max_log_size: default_max_log_size(),
            ttl_ms: None,
        }
    }
}

fn default_max_log_size() -> usize {
    100_000
}

/// `dispatch_max_concurrency`.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct DispatchConfig {
    #[serde(rename = "MaxConcurrency", default = "default_dispatch_max_concurrency")]
    /// Concurrency cap for multi-target dispatch.
    pub max_concurrency: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_dispatch_max_concurrency(),
        }
    }
}

fn default_dispatch_max_concurrency() -> usize {
    8
}

/// Persistent subscription queue cap, `max_attempts`, `backoff_ms`.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct PersistentSubscriptionConfig {
    #[serde(rename = "QueueCap", default = "default_queue_cap")]
    /// Maximum queue length before `signal_in` returns `queue_full`.
    pub queue_cap: usize,
    #[serde(rename = "MaxAttempts", default = "default_max_attempts")]
    /// Maximum delivery attempts before writing to the DLQ.
    pub max_attempts: u32,
    #[serde(rename = "BackoffMs", default = "default_backoff_ms")]
    /// Initial retry backoff, doubled per attempt.
    pub backoff_ms: u64,
}

impl Default for PersistentSubscriptionConfig {
    fn default() -> Self {
        Self {
            queue_cap: default_queue_cap(),
            max_attempts: default_max_attempts(),
            backoff_ms: default_backoff_ms(),
        }
    }
}

fn default_queue_cap() -> usize {
    10_000
}
fn default_max_attempts() -> u32 {
    5
}
fn default_backoff_ms() -> u64 {
    100
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            middleware: MiddlewareConfig::default(),
            partitions: PartitionConfig::default(),
            log: LogConfig::default(),
            dispatch: DispatchConfig::default(),
            persistent_subscription: PersistentSubscriptionConfig::default(),
        }
    }
}

impl BusConfig {
    /// Loads the configuration from YAML, validates it, and returns the
    /// ready-to-use value.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let s = fs::read_to_string(path)?;
        let mut cfg: BusConfig =
            serde_yaml::from_str(&s).context("failed to parse config YAML")?;
        cfg.validate_and_normalize()?;
        Ok(cfg)
    }

    /// Validates invariants and normalizes derived fields.
    pub fn validate_and_normalize(&mut self) -> Result<()> {
        ensure!(self.partitions.count >= 1, "partitions.Count must be >= 1");
        ensure!(
            self.partitions.rate_limit_per_sec >= 1,
            "partitions.RateLimitPerSec must be >= 1"
        );
        ensure!(self.log.max_log_size >= 1, "log.MaxSize must be >= 1");
        ensure!(
            self.dispatch.max_concurrency >= 1,
            "dispatch.MaxConcurrency must be >= 1"
        );
        ensure!(
            self.persistent_subscription.queue_cap >= 1,
            "persistent_subscription.QueueCap must be >= 1"
        );
        ensure!(
            self.persistent_subscription.max_attempts >= 1,
            "persistent_subscription.MaxAttempts must be >= 1"
        );
        if self.middleware.timeout_ms == 0 {
            self.middleware.timeout_ms = default_middleware_timeout_ms();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_knobs() {
        let cfg = BusConfig::default();
        assert_eq!(cfg.middleware.timeout_ms, 100);
        assert_eq!(cfg.partitions.count, 1);
        assert_eq!(cfg.partitions.rate_limit_per_sec, 10_000);
        assert_eq!(cfg.partitions.burst_size, 1_000);
        assert_eq!(cfg.log.max_log_size, 100_000);
        assert_eq!(cfg.log.ttl_ms, None);
        assert_eq!(cfg.dispatch.max_concurrency, 8);
        assert_eq!(cfg.persistent_subscription.queue_cap, 10_000);
        assert_eq!(cfg.persistent_subscription.max_attempts, 5);
        assert_eq!(cfg.persistent_subscription.backoff_ms, 100);
    }

    #[test]
    fn validate_rejects_zero_partition_count() {
        let mut cfg = BusConfig::default();
        cfg.partitions.count = 0;
        assert!(cfg.validate_and_normalize().is_err());
    }

    #[test]
    fn validate_normalizes_zero_middleware_timeout() {
        let mut cfg = BusConfig::default();
        cfg.middleware.timeout_ms = 0;
        cfg.validate_and_normalize().expect("normalizes instead of failing");
        assert_eq!(cfg.middleware.timeout_ms, 100);
    }
}
