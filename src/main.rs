use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use rabbit_broker::config::{self, BrokerConfig};
use rabbit_broker::env::EnvOverrides;
use rabbit_broker::{
    handler_fn, Message, PublishOptions, Publication, RabbitMQBroker, SubscribeOptions,
};

#[derive(Debug, Serialize, Deserialize)]
struct OrderCreated {
    order_id: Uuid,
    created_at: chrono::DateTime<Utc>,
    total: f64,
}

fn load_settings() -> Result<BrokerConfig> {
    let mut settings = config::load_config().context("Failed to load configuration")?;
    EnvOverrides::load()
        .context("Invalid RabbitMQ environment settings")?
        .apply(&mut settings);
    Ok(settings)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // `--init-config [path]` writes the default configuration and exits.
    let mut args = std::env::args().skip(1);
    if args.next().as_deref() == Some("--init-config") {
        let path = args
            .next()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(config::CONFIG_FILE_NAME));
        return config::create_default_config_file(&path);
    }

    let settings = load_settings()?;
    let options = settings
        .broker_options()?
        .error_handler(|publication: &Publication| {
            if let Some(err) = publication.error() {
                error!(topic = publication.topic(), error = %err, "Message handling failed");
            }
        });

    let broker = RabbitMQBroker::new(options);
    broker
        .connect()
        .await
        .with_context(|| format!("Failed to connect to {}", broker.options().resolve_url()))?;
    info!(broker = %broker, exchange = %settings.exchange.name, "Broker connected");

    let subscriber = broker
        .subscribe(
            &settings.demo.topic,
            handler_fn(|publication: Publication| async move {
                let order: OrderCreated = publication
                    .message()
                    .decode()
                    .context("Order payload is not valid JSON")?;
                info!(
                    order_id = %order.order_id,
                    total = order.total,
                    redelivered = publication.redelivered(),
                    "Order received"
                );
                anyhow::Ok(())
            }),
            SubscribeOptions::default()
                .queue(settings.demo.queue.clone())
                .ack_on_success(),
        )
        .await?;

    let order = OrderCreated {
        order_id: Uuid::new_v4(),
        created_at: Utc::now(),
        total: 59.99,
    };
    let message = Message::json(&order)?.with_header("Message-Id", Uuid::new_v4().to_string());
    if let Err(err) = broker
        .publish(&settings.demo.topic, &message, PublishOptions::default().persistent())
        .await
    {
        warn!(error = %err, "Failed to publish demo order");
    }

    info!("Service running. Press Ctrl+C to exit.");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;

    subscriber.unsubscribe().await?;
    broker.disconnect().await?;
    info!("Shutdown complete");
    Ok(())
}
