//! Transport seam between the supervisors and the AMQP client library.
//!
//! The connection and subscriber supervisors only ever talk to these traits.
//! [`crate::rabbitmq::amqp_client`] implements them on top of `lapin`, and
//! `crate::rabbitmq::memory` (feature `test-util`) provides an in-process
//! broker with the same contract.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use lapin::types::FieldTable;
use tokio::sync::oneshot;

use super::errors::Result;
use super::options::TlsOptions;

/// Lazy, unbounded sequence of deliveries. Ends when the channel or the
/// connection it was opened on is closed.
pub type DeliveryStream = BoxStream<'static, Result<Delivery>>;

/// Everything needed to dial the broker, resolved once by the facade and
/// reused by every reconnect attempt.
#[derive(Debug, Clone)]
pub struct DialConfig {
    pub secure: bool,
    pub tls: Option<TlsOptions>,
    pub external_auth: bool,
    /// Heartbeat interval in seconds.
    pub heartbeat: u16,
    pub locale: String,
    pub connection_name: Option<String>,
}

impl Default for DialConfig {
    fn default() -> Self {
        Self {
            secure: false,
            tls: None,
            external_auth: false,
            heartbeat: 10,
            locale: "en_US".to_string(),
            connection_name: None,
        }
    }
}

impl DialConfig {
    /// TLS is used when asked for explicitly, when TLS material is supplied,
    /// or when the URL already carries the `amqps` scheme.
    pub fn wants_tls(&self, url: &str) -> bool {
        self.secure || self.tls.is_some() || url.starts_with("amqps://")
    }

    /// Rewrites the scheme to `amqps://` when TLS is wanted.
    pub fn effective_url(&self, url: &str) -> String {
        if self.wants_tls(url) {
            url.replacen("amqp://", "amqps://", 1)
        } else {
            url.to_string()
        }
    }
}

/// A message handed to the transport for publishing.
#[derive(Debug, Clone, Default)]
pub struct Publishing {
    pub headers: FieldTable,
    pub body: Vec<u8>,
    pub delivery_mode: Option<u8>,
    pub priority: Option<u8>,
}

/// Positive/negative acknowledgement of a single delivery.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<()>;

    async fn nack(&self, requeue: bool) -> Result<()>;
}

/// One message instance received by a consumer.
#[derive(Clone)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub routing_key: String,
    pub headers: FieldTable,
    pub body: Vec<u8>,
    pub redelivered: bool,
    pub acker: Arc<dyn Acknowledger>,
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("routing_key", &self.routing_key)
            .field("headers", &self.headers)
            .field("body_len", &self.body.len())
            .field("redelivered", &self.redelivered)
            .finish()
    }
}

/// Opens physical connections.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &str, dial: &DialConfig) -> Result<Arc<dyn AmqpConnection>>;
}

/// One physical connection to the broker.
#[async_trait]
pub trait AmqpConnection: Send + Sync {
    /// Opens a channel, applying QoS when `prefetch_count > 0` and enabling
    /// publisher confirms when `confirm` is set.
    async fn create_channel(
        &self,
        prefetch_count: u16,
        prefetch_global: bool,
        confirm: bool,
    ) -> Result<Arc<dyn AmqpChannel>>;

    /// Fires once when the connection is lost unexpectedly. A graceful
    /// [`AmqpConnection::close`] does not fire it. Registering replaces any
    /// earlier registration.
    fn notify_lost(&self) -> oneshot::Receiver<super::errors::RabbitMQError>;

    fn is_connected(&self) -> bool;

    async fn close(&self) -> Result<()>;
}

/// One logical conduit over a connection.
#[async_trait]
pub trait AmqpChannel: Send + Sync {
    async fn declare_exchange(&self, name: &str) -> Result<()>;

    async fn declare_durable_exchange(&self, name: &str) -> Result<()>;

    /// Declares a transient (auto-delete) queue and returns its name, which
    /// is server-generated when `name` is empty.
    async fn declare_queue(&self, name: &str, args: &FieldTable) -> Result<String>;

    async fn declare_durable_queue(&self, name: &str, args: &FieldTable) -> Result<String>;

    async fn consume_queue(&self, queue: &str, auto_ack: bool) -> Result<DeliveryStream>;

    async fn bind_queue(
        &self,
        queue: &str,
        routing_key: &str,
        exchange: &str,
        headers: &FieldTable,
    ) -> Result<()>;

    async fn publish(&self, exchange: &str, routing_key: &str, msg: Publishing) -> Result<()>;

    async fn close(&self) -> Result<()>;
}
