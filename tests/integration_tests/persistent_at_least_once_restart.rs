//! Spec §8 scenario 4: two persistent subscriptions on the same
//! pattern, one falls behind, restart resumes it from its checkpoint
//! without redelivering already-acked signals.

use std::{sync::Arc, time::Duration};

use signalbus_rs::{
    dispatch::{DispatchTarget, adapters::{ChannelDispatcher, NoopDispatcher}},
    signal::IdGenerator,
    storage::StorageAdapter,
};
use tokio::sync::mpsc;

use crate::integration_tests::common::{new_bus_with, signal};

#[tokio::test]
async fn lagging_subscriber_redelivers_unacked_signals_after_restart() {
    let storage = Arc::new(signalbus_rs::storage::memory::InMemoryStorage::new());
    let bus = new_bus_with(Arc::clone(&storage) as Arc<dyn StorageAdapter>);

    let s1 = bus
        .subscribe_persistent("e.*".to_string(), DispatchTarget::Noop, Arc::new(NoopDispatcher))
        .await
        .expect("s1 subscribed");
    let s2 = bus
        .subscribe_persistent("e.*".to_string(), DispatchTarget::Noop, Arc::new(NoopDispatcher))
        .await
        .expect("s2 subscribed");

    let generator = IdGenerator::new();
    let e1 = signal(&generator, "e.a");
    let e2 = signal(&generator, "e.b");
    let e3 = signal(&generator, "e.c");
    let recorded = bus.publish(vec![e1, e2, e3]).await.expect("published");
    assert_eq!(recorded.len(), 3);
    let (u1, u3) = (&recorded[0].uuid, &recorded[2].uuid);

    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(
        storage.get_checkpoint(&format!("sub:{s1}")).await.expect("read"),
        Some(u3.clone().into_bytes()),
        "S1 acked all three, checkpoint should sit at e3"
    );

    storage
        .put_checkpoint(&format!("sub:{s2}"), u1.clone().into_bytes())
        .await
        .expect("seed s2 as if it only acked e1");

    let (tx, mut rx) = mpsc::channel(8);
    bus.resume_persistent(
        s2.clone(),
        "e.*".to_string(),
        DispatchTarget::Noop,
        Arc::new(ChannelDispatcher::new(tx)),
    )
    .await
    .expect("s2 resumed");

    let first = rx.recv().await.expect("e2 redelivered");
    let second = rx.recv().await.expect("e3 redelivered");
    assert_eq!(first.signal_type, "e.b");
    assert_eq!(second.signal_type, "e.c");

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(
        storage.get_checkpoint(&format!("sub:{s2}")).await.expect("read"),
        Some(u3.clone().into_bytes())
    );
}
