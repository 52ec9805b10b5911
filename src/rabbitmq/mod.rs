// src/rabbitmq/mod.rs
// Resilient publish/subscribe over RabbitMQ.

pub mod errors;
pub mod options;
pub mod transport;

pub mod amqp_client;
#[cfg(any(test, feature = "test-util"))]
pub mod memory;

pub mod backoff;
pub mod gate;
pub mod inflight;

pub mod broker;
pub mod connection;
pub mod publication;
pub mod subscriber;

// Re-export specific items to simplify imports elsewhere
pub use broker::RabbitMQBroker;
pub use connection::ConnectionManager;
pub use errors::{RabbitMQError, Result};
pub use options::{
    BrokerOptions, ErrorHandler, Exchange, PublishOptions, SubscribeOptions, TlsOptions,
    DEFAULT_EXCHANGE, DEFAULT_HEARTBEAT_SECS, DEFAULT_RABBIT_URL,
};
pub use publication::{handler_fn, Handler, Publication};
pub use subscriber::Subscriber;
