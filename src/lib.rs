//! Fanout - realtime pub/sub fanout
//!
//! Delivers channel messages to locally connected clients and spreads them
//! across processes through a pluggable broker: a partitioned log (Kafka), an
//! acknowledged queue (RabbitMQ) or ephemeral pub/sub (Redis).

pub mod bus;
pub mod channel;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod dlq;
pub mod manager;
pub mod message;
pub mod utils;

pub use bus::{connect_broker, Broker, BrokerError, BrokerKind, HandlerError, MessageHandler};
pub use connection::Connection;
pub use manager::{FanoutError, Manager};
pub use message::{Message, MessageKind};
