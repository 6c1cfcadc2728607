// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Storage adapter contract (C6): key/value checkpoints, a per-stream
//! append log, and DLQ storage. External collaborators implement this
//! trait; [`memory::InMemoryStorage`] is the in-repo reference adapter.

pub mod memory;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::signal::Signal;

/// Errors a storage adapter may return.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// The requested key or stream does not exist.
    #[error("not found: {0}")]
    NotFound(String),
    /// `append_journal` was called with a stale `expected_rev`.
    #[error("optimistic concurrency conflict on stream {0}")]
    Conflict(String),
    /// The backing store malfunctioned.
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// One entry in a per-stream append-only journal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalEntry {
    /// Entry id, unique within the stream.
    pub id: String,
    /// Monotonic sequence number within the stream.
    pub seq: u64,
    /// When the entry was appended.
    pub at: DateTime<Utc>,
    /// Entry kind, opaque to storage.
    pub kind: String,
    /// Opaque payload.
    pub payload: Value,
    /// References to other entries (e.g. causal links), opaque to storage.
    pub refs: Vec<String>,
}

/// A dead-letter entry: a signal a persistent subscription exhausted all
/// delivery attempts for.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqEntry {
    /// Id of this DLQ entry, unique within the subscription.
    pub entry_id: String,
    /// The signal that could not be delivered.
    pub signal: Signal,
    /// Human-readable failure reason from the last attempt.
    pub failure_reason: String,
    /// Number of delivery attempts made before giving up.
    pub attempts: u32,
    /// When the last attempt was made.
    pub last_attempt_at: DateTime<Utc>,
}

/// The checkpoint/journal contract plus DLQ operations. Implementations
/// must be safe for concurrent readers; writers may be serialized per
/// key/stream.
#[async_trait::async_trait]
pub trait StorageAdapter: Send + Sync {
    /// Reads the checkpoint stored under `key`.
    async fn get_checkpoint(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Overwrites the checkpoint stored under `key`.
    async fn put_checkpoint(&self, key: &str, data: Vec<u8>) -> Result<(), StorageError>;

    /// Deletes the checkpoint stored under `key`. Idempotent.
    async fn delete_checkpoint(&self, key: &str) -> Result<(), StorageError>;

    /// Loads the ordered journal for `thread_id`.
    async fn load_journal(&self, thread_id: &str) -> Result<Vec<JournalEntry>, StorageError>;

    /// Appends `entries` to `thread_id`'s journal. When `expected_rev` is
    /// set, the append is rejected with [`StorageError::Conflict`] unless
    /// the current journal length equals it.
    async fn append_journal(
        &self,
        thread_id: &str,
        entries: Vec<JournalEntry>,
        expected_rev: Option<u64>,
    ) -> Result<u64, StorageError>;

    /// Deletes `thread_id`'s entire journal. Idempotent.
    async fn delete_journal(&self, thread_id: &str) -> Result<(), StorageError>;

    /// Lists DLQ entries for `subscription_id`.
    async fn get_dlq_entries(&self, subscription_id: &str) -> Result<Vec<DlqEntry>, StorageError>;

    /// Adds a DLQ entry for `subscription_id`.
    async fn put_dlq_entry(
        &self,
        subscription_id: &str,
        entry: DlqEntry,
    ) -> Result<(), StorageError>;

    /// Removes one DLQ entry. Idempotent.
    async fn delete_dlq_entry(
        &self,
        subscription_id: &str,
        entry_id: &str,
    ) -> Result<(), StorageError>;

    /// Removes every DLQ entry for `subscription_id`.
    async fn clear_dlq(&self, subscription_id: &str) -> Result<(), StorageError>;
}
