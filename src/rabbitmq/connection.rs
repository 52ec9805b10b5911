// src/rabbitmq/connection.rs
// Connection supervisor: owns the physical connection, the exchange and the
// publish channel, and keeps them alive by reconnecting in the background.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use lapin::types::FieldTable;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use super::errors::{RabbitMQError, Result};
use super::gate::{ConnectionGate, GateState};
use super::options::Exchange;
use super::transport::{
    AmqpChannel, AmqpConnection, Connector, DeliveryStream, DialConfig, Publishing,
};

/// Fixed pause between two failed reconnect attempts.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(1);

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Resolves once the close signal has fired. A dropped sender counts as
/// fired: it is only ever replaced after a close.
pub async fn closed(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|closed| *closed).await;
}

pub(crate) fn is_closed(rx: &watch::Receiver<bool>) -> bool {
    *rx.borrow() || rx.has_changed().is_err()
}

struct Live {
    connection: Arc<dyn AmqpConnection>,
    // Held so the QoS settings stay applied for the lifetime of the connection.
    _topology_channel: Arc<dyn AmqpChannel>,
    exchange_channel: Arc<dyn AmqpChannel>,
}

pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    url: String,
    exchange: Exchange,
    prefetch_count: u16,
    prefetch_global: bool,
    confirm_publish: bool,
    reconnect_delay: Duration,
    gate: ConnectionGate,
    // Guards the live connection; gate transitions happen while it is held.
    state: AsyncMutex<Option<Live>>,
    connecting: AsyncMutex<()>,
    close_tx: Mutex<watch::Sender<bool>>,
    reconnect_task: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
    pub fn new(
        connector: Arc<dyn Connector>,
        url: impl Into<String>,
        exchange: Exchange,
        prefetch_count: u16,
        prefetch_global: bool,
    ) -> Self {
        let (close_tx, _) = watch::channel(false);
        ConnectionManager {
            connector,
            url: url.into(),
            exchange,
            prefetch_count,
            prefetch_global,
            confirm_publish: false,
            reconnect_delay: RECONNECT_DELAY,
            gate: ConnectionGate::new(),
            state: AsyncMutex::new(None),
            connecting: AsyncMutex::new(()),
            close_tx: Mutex::new(close_tx),
            reconnect_task: Mutex::new(None),
        }
    }

    /// Wait for broker confirms on the publish channel.
    pub fn with_confirm_publish(mut self, confirm: bool) -> Self {
        self.confirm_publish = confirm;
        self
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn exchange(&self) -> &Exchange {
        &self.exchange
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn is_connected(&self) -> bool {
        self.gate.is_open()
    }

    pub fn gate_state(&self) -> GateState {
        self.gate.state()
    }

    pub fn subscribe_gate(&self) -> watch::Receiver<GateState> {
        self.gate.subscribe()
    }

    /// Receiver for the close signal of the current connect cycle.
    pub fn close_signal(&self) -> watch::Receiver<bool> {
        lock(&self.close_tx).subscribe()
    }

    fn closing(&self) -> bool {
        *lock(&self.close_tx).borrow()
    }

    /// True while a healthy live connection is installed for `epoch`.
    pub async fn is_current(&self, epoch: u64) -> bool {
        let state = self.state.lock().await;
        state
            .as_ref()
            .is_some_and(|live| live.connection.is_connected())
            && self.gate.state()
                == GateState {
                    connected: true,
                    epoch,
                }
    }

    /// Performs one connection attempt and, once it succeeds, keeps the
    /// connection alive in the background until [`ConnectionManager::close`].
    ///
    /// While the background loop is between connections this returns
    /// `NotConnected` instead of dialing a second time.
    pub async fn connect(self: &Arc<Self>, dial: DialConfig) -> Result<()> {
        let _connecting = self.connecting.lock().await;
        if self.is_connected() {
            return Ok(());
        }

        {
            let mut close_tx = lock(&self.close_tx);
            if *close_tx.borrow() {
                let (tx, _) = watch::channel(false);
                *close_tx = tx;
            } else if lock(&self.reconnect_task)
                .as_ref()
                .is_some_and(|task| !task.is_finished())
            {
                debug!("Reconnect already in progress");
                return Err(RabbitMQError::not_connected("reconnect in progress"));
            }
        }

        let close_rx = self.close_signal();
        match self.establish(&dial).await? {
            Some(epoch) => info!(epoch, exchange = %self.exchange.name, "Connected to RabbitMQ"),
            None => return Ok(()),
        }

        let this = Arc::clone(self);
        let task = tokio::spawn(async move { this.supervise(dial, close_rx).await });
        *lock(&self.reconnect_task) = Some(task);
        Ok(())
    }

    /// Dials and builds the topology, then installs the connection and opens
    /// the gate. `None` means the close signal fired in the meantime and the
    /// new connection was discarded.
    async fn establish(&self, dial: &DialConfig) -> Result<Option<u64>> {
        let connection = self.connector.connect(&self.url, dial).await?;
        let (topology, exchange_channel) = match self.open_channels(&connection).await {
            Ok(channels) => channels,
            Err(err) => {
                let _ = connection.close().await;
                return Err(err);
            }
        };

        let mut state = self.state.lock().await;
        if self.closing() {
            drop(state);
            debug!("Close requested while connecting, discarding connection");
            let _ = connection.close().await;
            return Ok(None);
        }
        *state = Some(Live {
            connection,
            _topology_channel: topology,
            exchange_channel,
        });
        Ok(Some(self.gate.open()))
    }

    async fn open_channels(
        &self,
        connection: &Arc<dyn AmqpConnection>,
    ) -> Result<(Arc<dyn AmqpChannel>, Arc<dyn AmqpChannel>)> {
        let topology = connection
            .create_channel(self.prefetch_count, self.prefetch_global, false)
            .await?;
        if self.exchange.durable {
            topology.declare_durable_exchange(&self.exchange.name).await?;
        } else {
            topology.declare_exchange(&self.exchange.name).await?;
        }
        let exchange_channel = connection
            .create_channel(self.prefetch_count, self.prefetch_global, self.confirm_publish)
            .await?;
        Ok((topology, exchange_channel))
    }

    async fn supervise(self: Arc<Self>, dial: DialConfig, mut close_rx: watch::Receiver<bool>) {
        loop {
            let lost = match self.live_connection().await {
                Some(connection) => connection.notify_lost(),
                None => return,
            };

            tokio::select! {
                biased;
                _ = closed(&mut close_rx) => return,
                reason = lost => {
                    if is_closed(&close_rx) {
                        return;
                    }
                    let reason = reason
                        .map(|e| e.to_string())
                        .unwrap_or_else(|_| "connection dropped".to_string());
                    warn!(error = %reason, "RabbitMQ connection lost");
                }
            }

            self.mark_lost().await;

            let mut attempt: u32 = 0;
            loop {
                if is_closed(&close_rx) {
                    return;
                }
                attempt += 1;
                let established = tokio::select! {
                    biased;
                    _ = closed(&mut close_rx) => return,
                    established = self.establish(&dial) => established,
                };
                match established {
                    Ok(Some(epoch)) => {
                        info!(epoch, attempt, "Reconnected to RabbitMQ");
                        break;
                    }
                    Ok(None) => return,
                    Err(err) => {
                        warn!(
                            attempt,
                            error = %err,
                            delay_ms = self.reconnect_delay.as_millis() as u64,
                            "Reconnect failed"
                        );
                        tokio::select! {
                            _ = closed(&mut close_rx) => return,
                            _ = sleep(self.reconnect_delay) => {}
                        }
                    }
                }
            }
        }
    }

    async fn mark_lost(&self) {
        let live = {
            let mut state = self.state.lock().await;
            self.gate.close();
            state.take()
        };
        if let Some(live) = live {
            let _ = live.connection.close().await;
        }
    }

    async fn live_connection(&self) -> Option<Arc<dyn AmqpConnection>> {
        self.state
            .lock()
            .await
            .as_ref()
            .map(|live| live.connection.clone())
    }

    /// Opens a fresh channel, declares and binds the queue and starts
    /// consuming from it. The channel is closed again when any step fails.
    pub async fn consume(
        &self,
        queue: &str,
        routing_key: &str,
        headers: &FieldTable,
        queue_args: &FieldTable,
        auto_ack: bool,
        durable: bool,
    ) -> Result<(Arc<dyn AmqpChannel>, DeliveryStream)> {
        let connection = self
            .live_connection()
            .await
            .ok_or_else(|| RabbitMQError::not_connected("not connected"))?;
        let channel = connection
            .create_channel(self.prefetch_count, self.prefetch_global, false)
            .await?;

        match self
            .consume_on(&channel, queue, routing_key, headers, queue_args, auto_ack, durable)
            .await
        {
            Ok(stream) => Ok((channel, stream)),
            Err(err) => {
                if let Err(close_err) = channel.close().await {
                    debug!(error = %close_err, "Failed to close consume channel");
                }
                Err(err)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn consume_on(
        &self,
        channel: &Arc<dyn AmqpChannel>,
        queue: &str,
        routing_key: &str,
        headers: &FieldTable,
        queue_args: &FieldTable,
        auto_ack: bool,
        durable: bool,
    ) -> Result<DeliveryStream> {
        let queue = if durable {
            channel.declare_durable_queue(queue, queue_args).await?
        } else {
            channel.declare_queue(queue, queue_args).await?
        };
        let stream = channel.consume_queue(&queue, auto_ack).await?;
        channel
            .bind_queue(&queue, routing_key, &self.exchange.name, headers)
            .await?;
        debug!(queue = %queue, routing_key, "Consuming");
        Ok(stream)
    }

    /// Publishes on the dedicated publish channel. Fails fast with
    /// `NotConnected` while no live connection is installed.
    pub async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        publishing: Publishing,
    ) -> Result<()> {
        let channel = self
            .state
            .lock()
            .await
            .as_ref()
            .map(|live| live.exchange_channel.clone())
            .ok_or_else(|| RabbitMQError::not_connected("not connected"))?;
        channel.publish(exchange, routing_key, publishing).await
    }

    /// Fires the close signal, drops the live connection and waits for the
    /// reconnect loop to stop. Calling it again is a no-op.
    pub async fn close(&self) -> Result<()> {
        {
            let close_tx = lock(&self.close_tx);
            if *close_tx.borrow() {
                return Ok(());
            }
            close_tx.send_replace(true);
        }

        let live = {
            let mut state = self.state.lock().await;
            self.gate.close();
            state.take()
        };
        let result = match live {
            Some(live) => {
                info!("Closing RabbitMQ connection");
                live.connection.close().await
            }
            None => Ok(()),
        };

        let task = lock(&self.reconnect_task).take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                error!(error = %err, "Reconnect task failed");
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::rabbitmq::memory::MemoryBroker;

    fn manager(broker: &Arc<MemoryBroker>) -> Arc<ConnectionManager> {
        Arc::new(
            ConnectionManager::new(
                broker.connector(),
                "amqp://memory",
                Exchange::default(),
                0,
                false,
            )
            .with_reconnect_delay(Duration::from_millis(20)),
        )
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_connect_declares_exchange_and_opens_gate() {
        let broker = MemoryBroker::new();
        let conn = manager(&broker);
        conn.connect(DialConfig::default()).await.unwrap();

        assert!(conn.is_connected());
        assert_eq!(conn.gate_state().epoch, 1);
        assert!(conn.is_current(1).await);
        assert!(broker.has_exchange("idealeak"));

        // Already connected: no second dial.
        conn.connect(DialConfig::default()).await.unwrap();
        assert_eq!(broker.connect_attempts(), 1);
        conn.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_first_connect_failure_is_returned() {
        let broker = MemoryBroker::new();
        broker.fail_next_connects(1);
        let conn = manager(&broker);

        let err = conn.connect(DialConfig::default()).await.unwrap_err();
        assert!(matches!(err, RabbitMQError::ConnectionError(_)));
        assert!(!conn.is_connected());

        conn.connect(DialConfig::default()).await.unwrap();
        assert!(conn.is_connected());
        conn.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_reconnects_after_loss() {
        let broker = MemoryBroker::new();
        let conn = manager(&broker);
        conn.connect(DialConfig::default()).await.unwrap();

        broker.fail_next_connects(2);
        broker.drop_connections();
        wait_until(|| !conn.is_connected()).await;
        wait_until(|| conn.is_connected()).await;

        assert_eq!(conn.gate_state().epoch, 2);
        assert!(!conn.is_current(1).await);
        assert_eq!(broker.connect_attempts(), 4);
        assert_eq!(broker.open_connections(), 1);
        conn.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_stops_reconnecting() {
        let broker = MemoryBroker::new();
        let conn = manager(&broker);
        conn.connect(DialConfig::default()).await.unwrap();

        conn.close().await.unwrap();
        conn.close().await.unwrap();
        assert!(!conn.is_connected());
        assert_eq!(broker.open_connections(), 0);

        let attempts = broker.connect_attempts();
        sleep(Duration::from_millis(60)).await;
        assert_eq!(broker.connect_attempts(), attempts);
    }

    #[tokio::test]
    async fn test_connect_after_close_allocates_fresh_signal() {
        let broker = MemoryBroker::new();
        let conn = manager(&broker);
        conn.connect(DialConfig::default()).await.unwrap();
        let old_signal = conn.close_signal();
        conn.close().await.unwrap();
        assert!(is_closed(&old_signal));

        conn.connect(DialConfig::default()).await.unwrap();
        assert!(conn.is_connected());
        assert!(!is_closed(&conn.close_signal()));
        conn.close().await.unwrap();
    }

    /// Dials through the memory broker once, then never completes a dial.
    struct StallingConnector {
        inner: Arc<dyn Connector>,
        dials: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl Connector for StallingConnector {
        async fn connect(&self, url: &str, dial: &DialConfig) -> Result<Arc<dyn AmqpConnection>> {
            if self.dials.fetch_add(1, Ordering::SeqCst) == 0 {
                return self.inner.connect(url, dial).await;
            }
            futures::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_interrupts_pending_reconnect_dial() {
        let broker = MemoryBroker::new();
        let connector = Arc::new(StallingConnector {
            inner: broker.connector(),
            dials: AtomicUsize::new(0),
        });
        let conn = Arc::new(ConnectionManager::new(
            connector.clone(),
            "amqp://memory",
            Exchange::default(),
            0,
            false,
        ));
        conn.connect(DialConfig::default()).await.unwrap();

        broker.drop_connections();
        wait_until(|| connector.dials.load(Ordering::SeqCst) == 2).await;
        assert!(!conn.is_connected());

        let closed = tokio::time::timeout(Duration::from_secs(5), conn.close()).await;
        assert!(closed.is_ok());
        assert!(lock(&conn.reconnect_task).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_during_reconnect_is_not_connected() {
        let broker = MemoryBroker::new();
        let conn = manager(&broker);
        conn.connect(DialConfig::default()).await.unwrap();

        broker.fail_next_connects(u32::MAX);
        broker.drop_connections();
        wait_until(|| !conn.is_connected()).await;

        let err = conn.connect(DialConfig::default()).await.unwrap_err();
        assert!(err.is_not_connected());
        assert_eq!(err.to_string(), "reconnect in progress");

        broker.fail_next_connects(0);
        wait_until(|| conn.is_connected()).await;
        conn.connect(DialConfig::default()).await.unwrap();
        conn.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_publish_fails_fast_without_connection() {
        let broker = MemoryBroker::new();
        let conn = manager(&broker);
        let err = conn
            .publish("idealeak", "orders", Publishing::default())
            .await
            .unwrap_err();
        assert!(err.is_not_connected());
    }

    #[tokio::test]
    async fn test_failed_consume_closes_its_channel() {
        let broker = MemoryBroker::new();
        let conn = manager(&broker);
        conn.connect(DialConfig::default()).await.unwrap();

        broker.fail_next_consumes(1);
        let result = conn
            .consume(
                "orders",
                "orders",
                &FieldTable::default(),
                &FieldTable::default(),
                true,
                true,
            )
            .await;
        assert!(result.is_err());
        assert_eq!(broker.consumer_count("orders"), 0);

        let (_channel, _stream) = conn
            .consume(
                "orders",
                "orders",
                &FieldTable::default(),
                &FieldTable::default(),
                true,
                true,
            )
            .await
            .unwrap();
        assert_eq!(broker.consumer_count("orders"), 1);
        conn.close().await.unwrap();
    }
}
