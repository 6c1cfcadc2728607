//! Spec §8 scenario 5: a subscription with `max_attempts = 2` and a
//! failing adapter lands a signal in the DLQ; redriving with a fixed
//! adapter clears it.

use std::{sync::Arc, time::Duration};

use signalbus_rs::{
    cfg::config::BusConfig,
    dispatch::{DispatchTarget, adapters::{FailingDispatcher, NoopDispatcher}},
    signal::IdGenerator,
};

use crate::integration_tests::common::{new_bus_with_config, signal};

#[tokio::test]
async fn redrive_after_max_attempts_clears_dlq_and_advances_checkpoint() {
    let mut cfg = BusConfig::default();
    cfg.persistent_subscription.max_attempts = 2;
    cfg.persistent_subscription.backoff_ms = 5;
    let bus = new_bus_with_config(&cfg);

    let id = bus
        .subscribe_persistent(
            "order.*".to_string(),
            DispatchTarget::Noop,
            Arc::new(FailingDispatcher::new("downstream unavailable")),
        )
        .await
        .expect("subscribed");

    let generator = IdGenerator::new();
    bus.publish(vec![signal(&generator, "order.created")]).await.expect("published");

    tokio::time::sleep(Duration::from_millis(100)).await;

    let entries = bus.dlq_entries(&id).await.expect("dlq read");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].attempts, 2);

    bus.replace_dispatcher(&id, Arc::new(NoopDispatcher)).expect("swap adapter");
    let report = bus.redrive_dlq(&id, 10, true).await.expect("redrive");
    assert_eq!(report.succeeded, 1);
    assert_eq!(report.failed, 0);

    let entries_after = bus.dlq_entries(&id).await.expect("dlq read");
    assert!(entries_after.is_empty());
}
