// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use signalbus_rs::{
    bus::Bus,
    cfg::{cli::resolve_config_path, config::BusConfig, logger::init_logger},
    dispatch::{DispatchTarget, adapters::NoopDispatcher},
    signal::{IdGenerator, Signal},
    storage::memory::InMemoryStorage,
};
use serde_json::json;
use tokio::time::sleep;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let _init_logger = init_logger("tests/config_logger.yaml")?;

    let cfg = resolve_config_path("docker/bus/config.bus.yaml")
        .and_then(BusConfig::load_from_file)
        .unwrap_or_else(|_| BusConfig::default());

    let storage = Arc::new(InMemoryStorage::new());
    let bus = Arc::new(Bus::new(&cfg, storage));
    bus.start_background_tasks();

    let sub_id = bus
        .subscribe_persistent(
            "order.*".to_string(),
            DispatchTarget::Noop,
            Arc::new(NoopDispatcher),
        )
        .await
        .context("failed to register demo subscription")?;
    info!(subscription_id = %sub_id, "subscribed");

    let generator = IdGenerator::new();
    let signal = Signal::new(&generator, "order.created", "demo", json!({"order_id": 1}))
        .context("failed to build demo signal")?;

    let recorded = bus
        .publish(vec![signal])
        .await
        .context("publish failed")?;
    info!(count = recorded.len(), "published");

    sleep(Duration::from_millis(50)).await;

    bus.unsubscribe(&sub_id).await.context("unsubscribe failed")?;

    Ok(())
}
