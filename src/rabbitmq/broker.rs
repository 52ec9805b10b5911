// src/rabbitmq/broker.rs
// Publish/subscribe facade over the connection and subscription supervisors.

use std::fmt;
use std::sync::{Arc, Mutex};

use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::amqp_client::LapinConnector;
use super::connection::{lock, ConnectionManager};
use super::errors::{RabbitMQError, Result};
use super::inflight::InFlight;
use super::options::{BrokerOptions, PublishOptions, SubscribeOptions};
use super::publication::{field_table, Handler};
use super::subscriber::{self, Subscriber};
use super::transport::{Connector, DialConfig, Publishing};
use crate::message::Message;

pub struct RabbitMQBroker {
    options: BrokerOptions,
    connector: Arc<dyn Connector>,
    conn: AsyncMutex<Option<Arc<ConnectionManager>>>,
    inflight: InFlight,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl fmt::Display for RabbitMQBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rabbitmq")
    }
}

impl fmt::Debug for RabbitMQBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RabbitMQBroker")
            .field("options", &self.options)
            .field("in_flight", &self.inflight.count())
            .finish()
    }
}

impl RabbitMQBroker {
    pub fn new(options: BrokerOptions) -> Self {
        Self::with_connector(options, Arc::new(LapinConnector))
    }

    /// Builds a broker on top of an arbitrary transport.
    pub fn with_connector(options: BrokerOptions, connector: Arc<dyn Connector>) -> Self {
        RabbitMQBroker {
            options,
            connector,
            conn: AsyncMutex::new(None),
            inflight: InFlight::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn options(&self) -> &BrokerOptions {
        &self.options
    }

    /// First configured address, or an empty string.
    pub fn address(&self) -> String {
        self.options.addrs.first().cloned().unwrap_or_default()
    }

    /// Replaces the options. Takes effect on the first `connect`.
    pub fn init(&mut self, options: BrokerOptions) {
        self.options = options;
    }

    /// Number of handler invocations currently running.
    pub fn in_flight(&self) -> usize {
        self.inflight.count()
    }

    pub async fn is_connected(&self) -> bool {
        match self.connection().await {
            Some(conn) => conn.is_connected(),
            None => false,
        }
    }

    fn dial_config(&self) -> DialConfig {
        DialConfig {
            secure: self.options.secure,
            tls: self.options.tls.clone(),
            external_auth: self.options.external_auth,
            heartbeat: self.options.heartbeat,
            connection_name: self.options.connection_name.clone(),
            ..DialConfig::default()
        }
    }

    async fn connection(&self) -> Option<Arc<ConnectionManager>> {
        self.conn.lock().await.clone()
    }

    /// Connects and returns once the first connection is up. Reconnection
    /// after that happens in the background.
    pub async fn connect(&self) -> Result<()> {
        let conn = {
            let mut slot = self.conn.lock().await;
            slot.get_or_insert_with(|| {
                let url = self.options.resolve_url();
                debug!(
                    url = %url,
                    exchange = %self.options.exchange.name,
                    "Creating connection supervisor"
                );
                Arc::new(
                    ConnectionManager::new(
                        self.connector.clone(),
                        url,
                        self.options.exchange.clone(),
                        self.options.prefetch_count,
                        self.options.prefetch_global,
                    )
                    .with_confirm_publish(self.options.confirm_publish),
                )
            })
            .clone()
        };
        conn.connect(self.dial_config()).await
    }

    /// Closes the connection, then waits for running handlers and every
    /// subscription task to finish.
    pub async fn disconnect(&self) -> Result<()> {
        let conn = self
            .connection()
            .await
            .ok_or_else(|| RabbitMQError::not_connected("connection is nil"))?;

        let result = conn.close().await;
        self.inflight.wait_idle().await;

        let tasks = std::mem::take(&mut *lock(&self.tasks));
        for task in tasks {
            if let Err(err) = task.await {
                error!(error = %err, "Subscription task failed");
            }
        }
        info!("Disconnected from RabbitMQ");
        result
    }

    pub async fn publish(
        &self,
        topic: &str,
        message: &Message,
        options: PublishOptions,
    ) -> Result<()> {
        let conn = self
            .connection()
            .await
            .ok_or_else(|| RabbitMQError::not_connected("connection is nil"))?;
        let publishing = Publishing {
            headers: field_table(&message.header),
            body: message.body.clone(),
            delivery_mode: options.delivery_mode,
            priority: options.priority,
        };
        conn.publish(&self.options.exchange.name, topic, publishing)
            .await
    }

    /// Starts a subscription on `topic`. Returns immediately; consuming
    /// starts whenever the connection is up.
    pub async fn subscribe<H>(
        &self,
        topic: &str,
        handler: H,
        options: SubscribeOptions,
    ) -> Result<Subscriber>
    where
        H: Handler + 'static,
    {
        let conn = self
            .connection()
            .await
            .ok_or_else(|| RabbitMQError::not_connected("not connected"))?;

        let (subscriber, task) = subscriber::start(
            conn,
            topic.to_string(),
            Arc::new(handler),
            options,
            self.options.error_handler.clone(),
            self.inflight.clone(),
        );

        let mut tasks = lock(&self.tasks);
        tasks.retain(|task| !task.is_finished());
        tasks.push(task);
        debug!(topic, "Subscription started");
        Ok(subscriber)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rabbitmq::memory::MemoryBroker;
    use crate::rabbitmq::publication::{handler_fn, Publication};

    fn broker(memory: &Arc<MemoryBroker>) -> RabbitMQBroker {
        RabbitMQBroker::with_connector(BrokerOptions::default(), memory.connector())
    }

    #[test]
    fn test_display_and_address() {
        let broker = RabbitMQBroker::new(BrokerOptions::default().addrs(["amqp://rabbit:5672"]));
        assert_eq!(broker.to_string(), "rabbitmq");
        assert_eq!(broker.address(), "amqp://rabbit:5672");

        let broker = RabbitMQBroker::new(BrokerOptions::default());
        assert_eq!(broker.address(), "");
    }

    #[test]
    fn test_init_replaces_options() {
        let mut broker = RabbitMQBroker::new(BrokerOptions::default());
        broker.init(BrokerOptions::default().exchange_name("orders"));
        assert_eq!(broker.options().exchange.name, "orders");
    }

    #[tokio::test]
    async fn test_operations_before_connect() {
        let memory = MemoryBroker::new();
        let broker = broker(&memory);

        let err = broker
            .publish("orders", &Message::new("x"), PublishOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "connection is nil");

        let err = broker.disconnect().await.unwrap_err();
        assert_eq!(err.to_string(), "connection is nil");

        let err = broker
            .subscribe(
                "orders",
                handler_fn(|_p: Publication| async { anyhow::Ok(()) }),
                SubscribeOptions::default(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "not connected");
    }

    #[tokio::test]
    async fn test_publish_carries_headers_and_options() {
        let memory = MemoryBroker::new();
        let broker = broker(&memory);
        broker.connect().await.unwrap();

        let message = Message::new("payload").with_header("x-id", "42");
        broker
            .publish("orders", &message, PublishOptions::default().persistent())
            .await
            .unwrap();

        let published = memory.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].exchange, "idealeak");
        assert_eq!(published[0].routing_key, "orders");
        assert_eq!(published[0].publishing.delivery_mode, Some(2));
        assert_eq!(
            crate::rabbitmq::publication::string_headers(&published[0].publishing.headers),
            message.header
        );
        broker.disconnect().await.unwrap();
    }
}
