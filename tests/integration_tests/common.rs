use std::sync::Arc;

use serde_json::json;
use signalbus_rs::{
    bus::Bus,
    cfg::config::BusConfig,
    signal::{IdGenerator, Signal},
    storage::{StorageAdapter, memory::InMemoryStorage},
};

pub fn new_bus_with_config(cfg: &BusConfig) -> Bus {
    Bus::new(cfg, Arc::new(InMemoryStorage::new()))
}

pub fn new_bus_with(storage: Arc<dyn StorageAdapter>) -> Bus {
    Bus::new(&BusConfig::default(), storage)
}

pub fn signal(generator: &IdGenerator, signal_type: &str) -> Signal {
    Signal::new(generator, signal_type, "test", json!(null)).expect("valid signal")
}
