// src/rabbitmq/amqp_client.rs
// lapin-backed implementation of the transport traits.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    acker::Acker,
    auth::SASLMechanism,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions,
    },
    tcp::OwnedTLSConfig,
    types::FieldTable,
    uri::AMQPUri,
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::connection::lock;
use super::errors::{RabbitMQError, Result};
use super::transport::{
    Acknowledger, AmqpChannel, AmqpConnection, Connector, Delivery, DeliveryStream, DialConfig,
    Publishing,
};

/// Dials real brokers through lapin.
#[derive(Debug, Clone, Default)]
pub struct LapinConnector;

pub fn connection_properties(dial: &DialConfig) -> ConnectionProperties {
    let mut properties = ConnectionProperties::default();
    properties.locale = dial.locale.clone();
    if let Some(name) = &dial.connection_name {
        properties = properties.with_connection_name(name.clone().into());
    }
    properties
}

/// TLS settings for lapin. A supplied CA chain must contain at least one
/// PEM certificate.
pub fn tls_config(dial: &DialConfig) -> Result<OwnedTLSConfig> {
    let cert_chain = dial.tls.as_ref().and_then(|t| t.cert_chain.clone());
    if let Some(pem) = &cert_chain {
        if !pem.contains("-----BEGIN CERTIFICATE-----") {
            return Err(RabbitMQError::TlsError(
                "CA chain contains no PEM certificate".to_string(),
            ));
        }
    }
    Ok(OwnedTLSConfig {
        cert_chain,
        ..OwnedTLSConfig::default()
    })
}

#[async_trait]
impl Connector for LapinConnector {
    async fn connect(&self, url: &str, dial: &DialConfig) -> Result<Arc<dyn AmqpConnection>> {
        let url = dial.effective_url(url);
        let mut uri: AMQPUri = url
            .parse()
            .map_err(|e: String| RabbitMQError::ConfigError(format!("invalid AMQP URI: {}", e)))?;
        uri.query.heartbeat = Some(dial.heartbeat);
        if dial.external_auth {
            uri.query.auth_mechanism = Some(SASLMechanism::External);
        }

        let properties = connection_properties(dial);
        let connection = if dial.wants_tls(&url) {
            let tls = tls_config(dial)?;
            Connection::connect_uri_with_config(uri, properties, tls)
                .await
                .map_err(|e| RabbitMQError::TlsError(e.to_string()))?
        } else {
            Connection::connect_uri(uri, properties).await?
        };

        info!(secure = dial.wants_tls(&url), "Connected to RabbitMQ");
        Ok(Arc::new(LapinConnection::new(connection)))
    }
}

/// One-shot loss notification shared with lapin's `on_error` callback.
#[derive(Clone, Default)]
struct LostSignal(Arc<Mutex<Option<oneshot::Sender<RabbitMQError>>>>);

impl LostSignal {
    fn fire(&self, err: RabbitMQError) {
        if let Some(tx) = lock(&self.0).take() {
            let _ = tx.send(err);
        }
    }

    fn disarm(&self) {
        lock(&self.0).take();
    }

    /// Installs a fresh sender, then checks `connected`. An error reported
    /// before the sender was in place would otherwise be lost.
    fn arm(&self, connected: impl FnOnce() -> bool) -> oneshot::Receiver<RabbitMQError> {
        let (tx, rx) = oneshot::channel();
        *lock(&self.0) = Some(tx);
        if !connected() {
            self.fire(RabbitMQError::ConnectionError(
                "connection already closed".to_string(),
            ));
        }
        rx
    }
}

pub struct LapinConnection {
    connection: Connection,
    lost: LostSignal,
}

impl LapinConnection {
    pub fn new(connection: Connection) -> Self {
        let lost = LostSignal::default();
        let signal = lost.clone();
        connection.on_error(move |err| {
            warn!(error = %err, "RabbitMQ connection error");
            signal.fire(err.into());
        });
        Self { connection, lost }
    }
}

#[async_trait]
impl AmqpConnection for LapinConnection {
    async fn create_channel(
        &self,
        prefetch_count: u16,
        prefetch_global: bool,
        confirm: bool,
    ) -> Result<Arc<dyn AmqpChannel>> {
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|e| RabbitMQError::ChannelError(e.to_string()))?;

        // Configure QoS if specified
        if prefetch_count > 0 {
            debug!(prefetch_count, prefetch_global, "Setting channel QoS");
            channel
                .basic_qos(
                    prefetch_count,
                    BasicQosOptions {
                        global: prefetch_global,
                    },
                )
                .await
                .map_err(|e| RabbitMQError::ChannelError(format!("Failed to set QoS: {}", e)))?;
        }

        if confirm {
            channel
                .confirm_select(ConfirmSelectOptions::default())
                .await
                .map_err(|e| {
                    RabbitMQError::ChannelError(format!("Failed to enable confirm mode: {}", e))
                })?;
        }

        debug!(channel_id = channel.id(), "Channel created");
        Ok(Arc::new(LapinChannel { channel }))
    }

    fn notify_lost(&self) -> oneshot::Receiver<RabbitMQError> {
        self.lost.arm(|| self.connection.status().connected())
    }

    fn is_connected(&self) -> bool {
        self.connection.status().connected()
    }

    async fn close(&self) -> Result<()> {
        // Graceful close is not a loss.
        self.lost.disarm();
        if !self.connection.status().connected() {
            return Ok(());
        }
        info!("Closing RabbitMQ connection gracefully");
        self.connection
            .close(0, "Closing connection")
            .await
            .map_err(|e| RabbitMQError::ConnectionError(e.to_string()))
    }
}

pub struct LapinChannel {
    channel: Channel,
}

impl LapinChannel {
    async fn exchange(&self, name: &str, durable: bool) -> Result<()> {
        self.channel
            .exchange_declare(
                name,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                RabbitMQError::TopologyError(format!("Failed to declare exchange {}: {}", name, e))
            })
    }

    async fn queue(&self, name: &str, args: &FieldTable, durable: bool) -> Result<String> {
        let queue = self
            .channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable,
                    auto_delete: !durable,
                    ..QueueDeclareOptions::default()
                },
                args.clone(),
            )
            .await
            .map_err(|e| {
                RabbitMQError::TopologyError(format!("Failed to declare queue {}: {}", name, e))
            })?;
        Ok(queue.name().as_str().to_string())
    }
}

#[async_trait]
impl AmqpChannel for LapinChannel {
    async fn declare_exchange(&self, name: &str) -> Result<()> {
        self.exchange(name, false).await
    }

    async fn declare_durable_exchange(&self, name: &str) -> Result<()> {
        self.exchange(name, true).await
    }

    async fn declare_queue(&self, name: &str, args: &FieldTable) -> Result<String> {
        self.queue(name, args, false).await
    }

    async fn declare_durable_queue(&self, name: &str, args: &FieldTable) -> Result<String> {
        self.queue(name, args, true).await
    }

    async fn consume_queue(&self, queue: &str, auto_ack: bool) -> Result<DeliveryStream> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                &format!("consumer-{}", Uuid::new_v4()),
                BasicConsumeOptions {
                    no_ack: auto_ack,
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| RabbitMQError::ConsumeError(e.to_string()))?;

        let stream = consumer.map(|result| {
            result
                .map(|delivery| Delivery {
                    delivery_tag: delivery.delivery_tag,
                    routing_key: delivery.routing_key.as_str().to_string(),
                    headers: delivery.properties.headers().clone().unwrap_or_default(),
                    redelivered: delivery.redelivered,
                    acker: Arc::new(LapinAcker(delivery.acker)),
                    body: delivery.data,
                })
                .map_err(|e| RabbitMQError::ConsumeError(e.to_string()))
        });
        Ok(stream.boxed())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        routing_key: &str,
        exchange: &str,
        headers: &FieldTable,
    ) -> Result<()> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                headers.clone(),
            )
            .await
            .map_err(|e| RabbitMQError::TopologyError(format!("Failed to bind queue: {}", e)))
    }

    async fn publish(&self, exchange: &str, routing_key: &str, msg: Publishing) -> Result<()> {
        let mut properties = BasicProperties::default().with_headers(msg.headers);
        if let Some(mode) = msg.delivery_mode {
            properties = properties.with_delivery_mode(mode);
        }
        if let Some(priority) = msg.priority {
            properties = properties.with_priority(priority);
        }

        let confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &msg.body,
                properties,
            )
            .await
            .map_err(|e| RabbitMQError::PublishError(e.to_string()))?
            .await
            .map_err(|e| RabbitMQError::PublishError(e.to_string()))?;

        if confirm.is_nack() {
            return Err(RabbitMQError::PublishError(format!(
                "broker rejected message for {}",
                routing_key
            )));
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if !self.channel.status().connected() {
            return Ok(());
        }
        self.channel
            .close(0, "Closing channel")
            .await
            .map_err(|e| RabbitMQError::ChannelError(e.to_string()))
    }
}

struct LapinAcker(Acker);

#[async_trait]
impl Acknowledger for LapinAcker {
    async fn ack(&self) -> Result<()> {
        self.0
            .ack(BasicAckOptions::default())
            .await
            .map(|_| ())
            .map_err(|e| RabbitMQError::AckError(e.to_string()))
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        self.0
            .nack(BasicNackOptions {
                requeue,
                ..BasicNackOptions::default()
            })
            .await
            .map(|_| ())
            .map_err(|e| RabbitMQError::AckError(e.to_string()))
    }
}
