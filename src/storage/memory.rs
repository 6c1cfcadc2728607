// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! In-memory reference [`StorageAdapter`], used by the CLI demo and the
//! test suite. Modeled on a `DashMap`-keyed registry, the same shape used
//! elsewhere in this crate for concurrent shared state.

use dashmap::DashMap;

use super::{DlqEntry, JournalEntry, StorageAdapter, StorageError};

/// In-process, non-durable storage adapter backed by `DashMap`s. Safe for
/// concurrent readers and writers; offers no persistence across restarts.
#[derive(Default)]
pub struct InMemoryStorage {
    checkpoints: DashMap<String, Vec<u8>>,
    journals: DashMap<String, Vec<JournalEntry>>,
    dlq: DashMap<String, Vec<DlqEntry>>,
}

impl InMemoryStorage {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl StorageAdapter for InMemoryStorage {
    async fn get_checkpoint(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.checkpoints.get(key).map(|v| v.clone()))
    }

    async fn put_checkpoint(&self, key: &str, data: Vec<u8>) -> Result<(), StorageError> {
        self.checkpoints.insert(key.to_string(), data);
        Ok(())
    }

    async fn delete_checkpoint(&self, key: &str) -> Result<(), StorageError> {
        self.checkpoints.remove(key);
        Ok(())
    }

    async fn load_journal(&self, thread_id: &str) -> Result<Vec<JournalEntry>, StorageError> {
        Ok(self
            .journals
            .get(thread_id)
            .map(|v| v.clone())
            .unwrap_or_default())
    }

    async fn append_journal(
        &self,
        thread_id: &str,
        entries: Vec<JournalEntry>,
        expected_rev: Option<u64>,
    ) -> Result<u64, StorageError> {
        let mut journal = self.journals.entry(thread_id.to_string()).or_default();
        if let Some(expected) = expected_rev {
            let current = journal.len() as u64;
            if current != expected {
                return Err(StorageError::Conflict(thread_id.to_string()));
            }
        }
        journal.extend(entries);
        Ok(journal.len() as u64)
    }

    async fn delete_journal(&self, thread_id: &str) -> Result<(), StorageError> {
        self.journals.remove(thread_id);
        Ok(())
    }

    async fn get_dlq_entries(&self, subscription_id: &str) -> Result<Vec<DlqEntry>, StorageError> {
        Ok(self
            .dlq
            .get(subscription_id)
            .map(|v| v.clone())
            .unwrap_or_default())
    }

    async fn put_dlq_entry(
        &self,
        subscription_id: &str,
        entry: DlqEntry,
    ) -> Result<(), StorageError> {
        self.dlq
            .entry(subscription_id.to_string())
            .or_default()
            .push(entry);
        Ok(())
    }

    async fn delete_dlq_entry(
        &self,
        subscription_id: &str,
        entry_id: &str,
    ) -> Result<(), StorageError> {
        if let Some(mut entries) = self.dlq.get_mut(subscription_id) {
            entries.retain(|e| e.entry_id != entry_id);
        }
        Ok(())
    }

    async fn clear_dlq(&self, subscription_id: &str) -> Result<(), StorageError> {
        self.dlq.remove(subscription_id);
        Ok(())
    }
}
