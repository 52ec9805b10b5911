// src/rabbitmq/publication.rs

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use lapin::types::{AMQPValue, FieldTable};

use super::errors::Result;
use super::transport::{Acknowledger, Delivery};
use crate::message::Message;

/// A received message as seen by a subscription handler.
#[derive(Clone)]
pub struct Publication {
    acker: Arc<dyn Acknowledger>,
    acked: Arc<AtomicBool>,
    message: Message,
    topic: String,
    redelivered: bool,
    error: Option<Arc<anyhow::Error>>,
}

impl std::fmt::Debug for Publication {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Publication")
            .field("topic", &self.topic)
            .field("message", &self.message)
            .field("redelivered", &self.redelivered)
            .field("error", &self.error)
            .finish()
    }
}

impl Publication {
    pub fn from_delivery(delivery: Delivery) -> Self {
        let message = Message {
            header: string_headers(&delivery.headers),
            body: delivery.body,
        };
        Publication {
            acker: delivery.acker,
            acked: Arc::new(AtomicBool::new(false)),
            message,
            topic: delivery.routing_key,
            redelivered: delivery.redelivered,
            error: None,
        }
    }

    /// Acknowledges the original delivery. Only the first call reaches the
    /// broker; later calls return `Ok(())`.
    pub async fn ack(&self) -> Result<()> {
        if self.acked.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.acker.ack().await
    }

    pub(crate) async fn nack(&self, requeue: bool) -> Result<()> {
        if self.acked.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.acker.nack(requeue).await
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    /// Routing key the message was published with.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn redelivered(&self) -> bool {
        self.redelivered
    }

    /// The handler error, once the handler has returned one.
    pub fn error(&self) -> Option<&anyhow::Error> {
        self.error.as_deref()
    }

    pub(crate) fn set_error(&mut self, error: anyhow::Error) {
        self.error = Some(Arc::new(error));
    }
}

/// Keeps string-valued headers, drops everything else.
pub fn string_headers(headers: &FieldTable) -> std::collections::HashMap<String, String> {
    headers
        .inner()
        .iter()
        .filter_map(|(key, value)| {
            let value = match value {
                AMQPValue::LongString(s) => std::str::from_utf8(s.as_bytes()).ok()?.to_string(),
                AMQPValue::ShortString(s) => s.as_str().to_string(),
                _ => return None,
            };
            Some((key.as_str().to_string(), value))
        })
        .collect()
}

/// Converts message headers into an AMQP header table.
pub fn field_table(headers: &std::collections::HashMap<String, String>) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in headers {
        table.insert(key.clone().into(), AMQPValue::LongString(value.clone().into()));
    }
    table
}

/// What to do with a delivery once its handler has returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckAction {
    None,
    Ack,
    Nack { requeue: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckPolicy {
    pub auto_ack: bool,
    pub ack_on_success: bool,
    pub requeue_on_error: bool,
}

impl AckPolicy {
    pub fn decide(&self, handler_ok: bool) -> AckAction {
        if self.auto_ack || !self.ack_on_success {
            return AckAction::None;
        }
        if handler_ok {
            AckAction::Ack
        } else {
            AckAction::Nack {
                requeue: self.requeue_on_error,
            }
        }
    }
}

/// Processes publications for one subscription.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, publication: &Publication) -> anyhow::Result<()>;
}

/// Adapts an async closure taking an owned [`Publication`] into a [`Handler`].
pub struct FnHandler<F>(F);

pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Publication) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    FnHandler(f)
}

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(Publication) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn handle(&self, publication: &Publication) -> anyhow::Result<()> {
        (self.0)(publication.clone()).await
    }
}
