// src/rabbitmq/errors.rs

use lapin::Error as LapinError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RabbitMQError {
    /// Operation attempted before a successful `connect`, or while no live
    /// connection is installed.
    #[error("{0}")]
    NotConnected(String),

    #[error("RabbitMQ connection error: {0}")]
    ConnectionError(String),

    #[error("RabbitMQ channel error: {0}")]
    ChannelError(String),

    #[error("RabbitMQ topology error: {0}")]
    TopologyError(String),

    #[error("RabbitMQ publish error: {0}")]
    PublishError(String),

    #[error("RabbitMQ consume error: {0}")]
    ConsumeError(String),

    #[error("RabbitMQ acknowledge error: {0}")]
    AckError(String),

    /// The TLS material was rejected, either locally or during the handshake.
    #[error("TLS configuration error: {0}")]
    TlsError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Unknown error: {0}")]
    Unknown(String),
}

// Custom Result type for RabbitMQ operations
pub type Result<T> = std::result::Result<T, RabbitMQError>;

impl RabbitMQError {
    pub fn not_connected(reason: &str) -> Self {
        RabbitMQError::NotConnected(reason.to_string())
    }

    pub fn is_not_connected(&self) -> bool {
        matches!(self, RabbitMQError::NotConnected(_))
    }
}

// Converting from lapin errors
impl From<LapinError> for RabbitMQError {
    fn from(error: LapinError) -> Self {
        match &error {
            LapinError::InvalidConnectionState(_) | LapinError::IOError(_) => {
                RabbitMQError::ConnectionError(error.to_string())
            }
            LapinError::InvalidChannel(_)
            | LapinError::InvalidChannelState(_)
            | LapinError::ChannelsLimitReached => RabbitMQError::ChannelError(error.to_string()),
            _ => {
                // Use string representation for the rest
                let error_text = error.to_string();

                if error_text.contains("connection") {
                    RabbitMQError::ConnectionError(error_text)
                } else if error_text.contains("channel") {
                    RabbitMQError::ChannelError(error_text)
                } else if error_text.contains("publish") {
                    RabbitMQError::PublishError(error_text)
                } else if error_text.contains("consume") {
                    RabbitMQError::ConsumeError(error_text)
                } else if error_text.contains("ack") || error_text.contains("nack") {
                    RabbitMQError::AckError(error_text)
                } else {
                    RabbitMQError::Unknown(error_text)
                }
            }
        }
    }
}
