//! Message brokers: transports that deliver task envelopes to workers.
//!
//! - [`AmqpBroker`]: publish over AMQP 0-9-1 (RabbitMQ)
//! - [`RedisBroker`]: publish onto Redis lists
//! - [`FailoverDispatcher`]: a broker-of-brokers retrying across members

mod amqp;
mod dispatcher;
mod redis;

use async_trait::async_trait;

use crate::error::Result;
use crate::message::TaskMessage;

pub(crate) use amqp::channel_pool;
pub use amqp::{AmqpBroker, AmqpBrokerOptions};
pub use dispatcher::{FailoverDispatcher, FailoverStrategy, RoundRobinStrategy};
pub use redis::RedisBroker;

/// A transport able to deliver task envelopes to a worker pool.
#[async_trait]
pub trait MessageBroker: Send + Sync {
    /// Publishes one task envelope, resolving with a transport-specific
    /// receipt string once the write is accepted.
    async fn publish(&self, message: &TaskMessage) -> Result<String>;

    /// Tears the broker down. Calling any operation afterwards fails with
    /// a disconnect error; calling `end` twice is unsupported.
    async fn end(&self) -> Result<()>;
}
