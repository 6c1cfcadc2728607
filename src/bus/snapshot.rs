// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Snapshot create/list/read/delete, delegated out of the main bus module
//! as its own small piece over the log.
//!
//! A snapshot is the result of a filtered replay at call time; it is not
//! a database snapshot and does not protect against log GC of entries
//! that existed when it was taken.

use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::{log::Log, signal::RecordedSignal};

/// A point-in-time materialization of log entries matching `path`.
#[derive(Debug, Clone)]
pub struct Snapshot {
    /// Snapshot id.
    pub id: String,
    /// Pattern the entries were filtered by.
    pub path: String,
    /// When the snapshot was taken.
    pub created_at: DateTime<Utc>,
    /// The matching entries, in log-uuid ascending order.
    pub entries: Vec<RecordedSignal>,
}

/// In-process registry of taken snapshots. Snapshots are bus-local state
/// (not required to survive a restart; see DESIGN.md open question on
/// snapshot durability).
#[derive(Default)]
pub struct SnapshotRegistry {
    snapshots: DashMap<String, Snapshot>,
}

impl SnapshotRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes a new snapshot of every log entry matching `path`.
    pub fn create(&self, id: String, path: String, log: &Log) -> Snapshot {
        let entries = log.replay(&path, None);
        let snapshot = Snapshot {
            id: id.clone(),
            path,
            created_at: Utc::now(),
            entries,
        };
        self.snapshots.insert(id, snapshot.clone());
        snapshot
    }

    /// Lists snapshot metadata (without entries) in no particular order.
    #[must_use]
    pub fn list(&self) -> Vec<(String, String, DateTime<Utc>)> {
        self.snapshots
            .iter()
            .map(|e| (e.id.clone(), e.path.clone(), e.created_at))
            .collect()
    }

    /// Reads a snapshot by id.
    #[must_use]
    pub fn read(&self, id: &str) -> Option<Snapshot> {
        self.snapshots.get(id).map(|e| e.clone())
    }

    /// Deletes a snapshot by id. Idempotent.
    pub fn delete(&self, id: &str) {
        self.snapshots.remove(id);
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::signal::{IdGenerator, Signal};

    #[test]
    fn create_list_read_delete_round_trip() {
        let gen = IdGenerator::new();
        let mut log = Log::new(100, None);
        log.append(&gen, vec![Signal::new(&gen, "a.b", "t", json!(null)).unwrap()])
            .unwrap();

        let registry = SnapshotRegistry::new();
        let snap = registry.create("snap-1".to_string(), "a.*".to_string(), &log);
        assert_eq!(snap.entries.len(), 1);

        assert_eq!(registry.list().len(), 1);
        assert!(registry.read("snap-1").is_some());
        registry.delete("snap-1");
        assert!(registry.read("snap-1").is_none());
    }
}
