pub mod config;
pub mod env;
pub mod message;
pub mod rabbitmq;

pub use message::Message;
pub use rabbitmq::{
    handler_fn, BrokerOptions, Handler, PublishOptions, Publication, RabbitMQBroker, RabbitMQError,
    SubscribeOptions, Subscriber,
};
