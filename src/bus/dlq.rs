// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! DLQ administration: `dlq_entries`, `redrive_dlq`, `clear_dlq`,
//! delegated out of the main bus module.

use std::sync::Arc;

use crate::{
    dispatch::{DispatchTarget, Dispatcher},
    storage::{DlqEntry, StorageAdapter, StorageError},
};

/// Result of a redrive pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RedriveReport {
    /// Entries that redelivered successfully.
    pub succeeded: u32,
    /// Entries that failed again.
    pub failed: u32,
}

/// Lists DLQ entries for `subscription_id`.
pub async fn dlq_entries(
    storage: &dyn StorageAdapter,
    subscription_id: &str,
) -> Result<Vec<DlqEntry>, StorageError> {
    storage.get_dlq_entries(subscription_id).await
}

/// Re-dispatches up to `limit` DLQ entries for `subscription_id` via
/// `dispatcher`/`target`. When `clear_on_success` is set, only entries
/// that redelivered successfully are removed from the DLQ; failed entries
/// are left in place.
pub async fn redrive_dlq(
    storage: &dyn StorageAdapter,
    subscription_id: &str,
    dispatcher: &Arc<dyn Dispatcher>,
    target: &DispatchTarget,
    limit: usize,
    clear_on_success: bool,
) -> Result<RedriveReport, StorageError> {
    let entries = storage.get_dlq_entries(subscription_id).await?;
    let mut report = RedriveReport::default();

    for entry in entries.into_iter().take(limit) {
        match dispatcher.deliver(&entry.signal, target).await {
            Ok(()) => {
                report.succeeded += 1;
                if clear_on_success {
                    storage
                        .delete_dlq_entry(subscription_id, &entry.entry_id)
                        .await?;
                }
            }
            Err(_) => {
                report.failed += 1;
            }
        }
    }

    Ok(report)
}

/// Re-dispatches up to `limit` DLQ entries to every target in `targets`. An
/// entry counts as redelivered only once every target accepts it; a
/// partial failure leaves the entry in the DLQ even if some targets
/// succeeded.
pub async fn redrive_dlq_multi(
    storage: &dyn StorageAdapter,
    subscription_id: &str,
    dispatcher: &Arc<dyn Dispatcher>,
    targets: &[DispatchTarget],
    limit: usize,
    clear_on_success: bool,
) -> Result<RedriveReport, StorageError> {
    let entries = storage.get_dlq_entries(subscription_id).await?;
    let mut report = RedriveReport::default();

    for entry in entries.into_iter().take(limit) {
        let mut all_ok = true;
        for target in targets {
            if dispatcher.deliver(&entry.signal, target).await.is_err() {
                all_ok = false;
            }
        }

        if all_ok {
            report.succeeded += 1;
            if clear_on_success {
                storage
                    .delete_dlq_entry(subscription_id, &entry.entry_id)
                    .await?;
            }
        } else {
            report.failed += 1;
        }
    }

    Ok(report)
}

/// Removes every DLQ entry for `subscription_id`.
pub async fn clear_dlq(storage: &dyn StorageAdapter, subscription_id: &str) -> Result<(), StorageError> {
    storage.clear_dlq(subscription_id).await
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{
        dispatch::adapters::{FailingDispatcher, NoopDispatcher},
        signal::{IdGenerator, Signal},
        storage::memory::InMemoryStorage,
    };

    async fn seed_dlq(storage: &InMemoryStorage, sub: &str, n: usize) {
        let g = IdGenerator::new();
        for i in 0..n {
            let signal = Signal::new(&g, "e.a", "t", json!(null)).unwrap();
            storage
                .put_dlq_entry(
                    sub,
                    DlqEntry {
                        entry_id: format!("d{i}"),
                        signal,
                        failure_reason: "boom".to_string(),
                        attempts: 2,
                        last_attempt_at: chrono::Utc::now(),
                    },
                )
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn redrive_with_working_adapter_clears_on_success() {
        let storage = InMemoryStorage::new();
        seed_dlq(&storage, "sub1", 2).await;
        let dispatcher: Arc<dyn Dispatcher> = Arc::new(NoopDispatcher);

        let report = redrive_dlq(&storage, "sub1", &dispatcher, &DispatchTarget::Noop, 10, true)
            .await
            .unwrap();
        assert_eq!(report, RedriveReport { succeeded: 2, failed: 0 });
        assert!(storage.get_dlq_entries("sub1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn redrive_with_failing_adapter_leaves_entries() {
        let storage = InMemoryStorage::new();
        seed_dlq(&storage, "sub1", 1).await;
        let dispatcher: Arc<dyn Dispatcher> = Arc::new(FailingDispatcher::new("still broken"));

        let report = redrive_dlq(&storage, "sub1", &dispatcher, &DispatchTarget::Noop, 10, true)
            .await
            .unwrap();
        assert_eq!(report, RedriveReport { succeeded: 0, failed: 1 });
        assert_eq!(storage.get_dlq_entries("sub1").await.unwrap().len(), 1);
    }
}
