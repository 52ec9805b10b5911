//! Subscription supervisor.
//!
//! Each subscription runs one task that waits for the connection gate,
//! consumes from its queue and dispatches deliveries to the handler one at a
//! time. When the delivery stream ends (connection lost, channel closed) the
//! task goes back to waiting for the gate and resubscribes. Consume failures
//! are retried with exponential backoff.

use std::sync::{Arc, Mutex};

use futures::StreamExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use super::backoff::Backoff;
use super::connection::{closed, is_closed, lock, ConnectionManager};
use super::errors::Result;
use super::gate::ConnectionGate;
use super::inflight::InFlight;
use super::options::{ErrorHandler, SubscribeOptions};
use super::publication::{AckAction, AckPolicy, Handler, Publication};
use super::transport::{AmqpChannel, Delivery};

struct Shared {
    running: watch::Sender<bool>,
    channel: Mutex<Option<Arc<dyn AmqpChannel>>>,
}

impl Shared {
    fn take_channel(&self) -> Option<Arc<dyn AmqpChannel>> {
        lock(&self.channel).take()
    }
}

/// Handle to an active subscription.
#[derive(Clone)]
pub struct Subscriber {
    topic: String,
    options: SubscribeOptions,
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscriber")
            .field("topic", &self.topic)
            .field("queue", &self.options.queue)
            .field("running", &self.is_running())
            .finish()
    }
}

impl Subscriber {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn options(&self) -> &SubscribeOptions {
        &self.options
    }

    pub fn is_running(&self) -> bool {
        *self.shared.running.borrow()
    }

    /// Stops the subscription and closes its channel. No further handler
    /// invocation starts once this returns. Only the first call does work.
    pub async fn unsubscribe(&self) -> Result<()> {
        if !self.shared.running.send_replace(false) {
            return Ok(());
        }
        info!(topic = %self.topic, "Unsubscribing");
        match self.shared.take_channel() {
            Some(channel) => channel.close().await,
            None => Ok(()),
        }
    }
}

struct SubscriptionTask {
    conn: Arc<ConnectionManager>,
    topic: String,
    options: SubscribeOptions,
    handler: Arc<dyn Handler>,
    error_handler: Option<ErrorHandler>,
    inflight: InFlight,
    shared: Arc<Shared>,
}

/// Starts the supervisor task for one subscription.
pub(crate) fn start(
    conn: Arc<ConnectionManager>,
    topic: String,
    handler: Arc<dyn Handler>,
    options: SubscribeOptions,
    error_handler: Option<ErrorHandler>,
    inflight: InFlight,
) -> (Subscriber, JoinHandle<()>) {
    let (running, _) = watch::channel(true);
    let shared = Arc::new(Shared {
        running,
        channel: Mutex::new(None),
    });
    let subscriber = Subscriber {
        topic: topic.clone(),
        options: options.clone(),
        shared: shared.clone(),
    };
    let task = SubscriptionTask {
        conn,
        topic,
        options,
        handler,
        error_handler,
        inflight,
        shared,
    };
    (subscriber, tokio::spawn(task.run()))
}

async fn stopped(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|running| !*running).await;
}

impl SubscriptionTask {
    fn policy(&self) -> AckPolicy {
        AckPolicy {
            auto_ack: self.options.auto_ack,
            ack_on_success: self.options.ack_on_success,
            requeue_on_error: self.options.requeue_on_error,
        }
    }

    async fn run(self) {
        let mut gate = self.conn.subscribe_gate();
        let mut close_rx = self.conn.close_signal();
        let mut running_rx = self.shared.running.subscribe();
        let mut backoff = Backoff::default();
        let policy = self.policy();

        loop {
            if !*running_rx.borrow() {
                break;
            }

            let epoch = tokio::select! {
                _ = closed(&mut close_rx) => break,
                _ = stopped(&mut running_rx) => break,
                epoch = ConnectionGate::wait_open(&mut gate) => match epoch {
                    Some(epoch) => epoch,
                    None => break,
                },
            };
            if !self.conn.is_current(epoch).await {
                // Stale wake-up: the connection behind this epoch is already
                // gone. Wait for the supervisor to move the gate.
                tokio::select! {
                    _ = closed(&mut close_rx) => break,
                    _ = stopped(&mut running_rx) => break,
                    changed = gate.changed() => if changed.is_err() { break },
                }
                continue;
            }

            let consumed = self
                .conn
                .consume(
                    &self.options.queue,
                    &self.topic,
                    &self.options.headers,
                    &self.options.queue_args,
                    self.options.auto_ack,
                    self.options.durable_queue,
                )
                .await;
            let (channel, mut stream) = match consumed {
                Ok(consumed) => consumed,
                Err(err) => {
                    let delay = backoff.next_delay();
                    warn!(
                        topic = %self.topic,
                        epoch,
                        error = %err,
                        delay_ms = delay.as_millis() as u64,
                        "Resubscribe failed"
                    );
                    tokio::select! {
                        _ = closed(&mut close_rx) => break,
                        _ = stopped(&mut running_rx) => break,
                        _ = sleep(delay) => {}
                    }
                    continue;
                }
            };

            backoff.reset();
            *lock(&self.shared.channel) = Some(channel);
            if !*running_rx.borrow() {
                if let Some(channel) = self.shared.take_channel() {
                    let _ = channel.close().await;
                }
                break;
            }
            info!(topic = %self.topic, epoch, "Subscribed");

            loop {
                let next = tokio::select! {
                    biased;
                    _ = closed(&mut close_rx) => return,
                    _ = stopped(&mut running_rx) => return,
                    next = stream.next() => next,
                };
                let delivery = match next {
                    Some(Ok(delivery)) => delivery,
                    Some(Err(err)) => {
                        warn!(topic = %self.topic, error = %err, "Delivery stream failed");
                        break;
                    }
                    None => break,
                };

                let _guard = self.inflight.enter();
                if !*running_rx.borrow() || is_closed(&close_rx) {
                    return;
                }
                self.dispatch(delivery, policy).await;
            }

            if let Some(channel) = self.shared.take_channel() {
                let _ = channel.close().await;
            }
            debug!(topic = %self.topic, "Delivery stream ended, resubscribing");
        }
        debug!(topic = %self.topic, "Subscription stopped");
    }

    async fn dispatch(&self, delivery: Delivery, policy: AckPolicy) {
        let mut publication = Publication::from_delivery(delivery);
        let result = self.handler.handle(&publication).await;

        match policy.decide(result.is_ok()) {
            AckAction::None => {}
            AckAction::Ack => {
                if let Err(err) = publication.ack().await {
                    warn!(topic = %self.topic, error = %err, "Failed to ack message");
                }
            }
            AckAction::Nack { requeue } => {
                if let Err(err) = publication.nack(requeue).await {
                    warn!(topic = %self.topic, error = %err, "Failed to nack message");
                }
            }
        }

        if let Err(err) = result {
            warn!(topic = %self.topic, error = %format_args!("{:#}", err), "Handler failed");
            if let Some(error_handler) = &self.error_handler {
                publication.set_error(err);
                error_handler(&publication);
            }
        }
    }
}
