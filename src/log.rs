// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Bounded, ordered, optionally TTL-pruned store of recorded signals
//! (C5), keyed by monotonic uuid.
//!
//! Owned exclusively by the bus actor; no external mutation.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use thiserror::Error;

use crate::{
    router,
    signal::{RecordedSignal, Signal},
};

/// Errors raised by log operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LogError {
    /// `append` was called with a value that failed signal validation.
    #[error("invalid signal: {0}")]
    InvalidSignals(String),
}

/// Ordered, bounded store of [`RecordedSignal`]s.
pub struct Log {
    entries: BTreeMap<String, RecordedSignal>,
    max_log_size: usize,
    log_ttl_ms: Option<u64>,
}

impl Log {
    /// Creates an empty log.
    #[must_use]
    pub fn new(max_log_size: usize, log_ttl_ms: Option<u64>) -> Self {
        Self {
            entries: BTreeMap::new(),
            max_log_size,
            log_ttl_ms,
        }
    }

    /// Appends `signals` under freshly generated log keys, discarding the
    /// oldest entries if `max_log_size` is exceeded. Returns the
    /// `(uuid, signal)` pairs in append order.
    pub fn append(
        &mut self,
        generator: &crate::signal::IdGenerator,
        signals: Vec<Signal>,
    ) -> Result<Vec<(String, Signal)>, LogError> {
        for s in &signals {
            s.validate()
                .map_err(|e| LogError::InvalidSignals(e.to_string()))?;
        }

        let mut pairs = Vec::with_capacity(signals.len());
        for signal in signals {
            let (uuid, _ts) = generator.generate();
            let recorded = RecordedSignal::new(uuid.clone(), signal.clone());
            self.entries.insert(uuid.clone(), recorded);
            pairs.push((uuid, signal));
        }

        while self.entries.len() > self.max_log_size {
            if let Some(oldest_key) = self.entries.keys().next().cloned() {
                self.entries.remove(&oldest_key);
            } else {
                break;
            }
        }

        Ok(pairs)
    }

    /// Filters all entries whose type matches `path` and whose `uuid` is
    /// strictly greater than `from_uuid` (when given), ordered by uuid
    /// ascending.
    #[must_use]
    pub fn replay(&self, path: &str, from_uuid: Option<&str>) -> Vec<RecordedSignal> {
        self.entries
            .iter()
            .filter(|(uuid, _)| from_uuid.is_none_or(|from| uuid.as_str() > from))
            .filter(|(_, rec)| router::matches(&rec.signal_type, path))
            .map(|(_, rec)| rec.clone())
            .collect()
    }

    /// Drops entries older than `log_ttl_ms`, if set. Returns the number
    /// of entries removed.
    pub fn gc(&mut self) -> usize {
        let Some(ttl_ms) = self.log_ttl_ms else {
            return 0;
        };
        let cutoff: DateTime<Utc> = Utc::now() - ChronoDuration::milliseconds(ttl_ms as i64);
        let before = self.entries.len();
        self.entries.retain(|_, rec| rec.created_at >= cutoff);
        before - self.entries.len()
    }

    /// Current number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the log holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Looks up a single entry by its log key.
    #[must_use]
    pub fn get(&self, uuid: &str) -> Option<&RecordedSignal> {
        self.entries.get(uuid)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn gen() -> crate::signal::IdGenerator {
        crate::signal::IdGenerator::new()
    }

    fn sig(g: &crate::signal::IdGenerator, t: &str) -> Signal {
        Signal::new(g, t, "test", json!(null)).expect("valid")
    }

    #[test]
    fn append_assigns_ascending_uuid_keys() {
        let g = gen();
        let mut log = Log::new(100, None);
        let pairs = log
            .append(&g, vec![sig(&g, "a.b"), sig(&g, "a.c")])
            .expect("append");
        assert_eq!(pairs.len(), 2);
        assert!(pairs[0].0 < pairs[1].0);
    }

    #[test]
    fn append_discards_oldest_past_max_log_size() {
        let g = gen();
        let mut log = Log::new(2, None);
        log.append(&g, vec![sig(&g, "a"), sig(&g, "b"), sig(&g, "c")])
            .expect("append");
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn replay_filters_by_pattern_and_orders_ascending() {
        let g = gen();
        let mut log = Log::new(100, None);
        log.append(&g, vec![sig(&g, "a.x"), sig(&g, "b.x"), sig(&g, "a.y")])
            .expect("append");
        let replayed = log.replay("a.*", None);
        assert_eq!(replayed.len(), 2);
        assert!(replayed[0].uuid < replayed[1].uuid);
    }

    #[test]
    fn replay_respects_from_uuid_watermark() {
        let g = gen();
        let mut log = Log::new(100, None);
        let pairs = log
            .append(&g, vec![sig(&g, "a.x"), sig(&g, "a.y")])
            .expect("append");
        let replayed = log.replay("a.*", Some(&pairs[0].0));
        assert_eq!(replayed.len(), 1);
        assert_eq!(replayed[0].uuid, pairs[1].0);
    }

    #[test]
    fn gc_is_noop_without_ttl() {
        let g = gen();
        let mut log = Log::new(100, None);
        log.append(&g, vec![sig(&g, "a")]).expect("append");
        assert_eq!(log.gc(), 0);
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn gc_drops_entries_older_than_ttl() {
        let g = gen();
        let mut log = Log::new(100, Some(0));
        log.append(&g, vec![sig(&g, "a")]).expect("append");
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert_eq!(log.gc(), 1);
        assert!(log.is_empty());
    }
}
