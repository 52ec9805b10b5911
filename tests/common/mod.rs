#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use rabbit_broker::rabbitmq::memory::MemoryBroker;
use rabbit_broker::{BrokerOptions, RabbitMQBroker};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn memory_broker(options: BrokerOptions) -> (Arc<MemoryBroker>, RabbitMQBroker) {
    init_tracing();
    let memory = MemoryBroker::new();
    let broker = RabbitMQBroker::with_connector(options, memory.connector());
    (memory, broker)
}

/// Polls `check` every 5ms for up to ten (possibly virtual) seconds.
pub async fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    for _ in 0..2000 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {}", what);
}
