//! Result backends: stores/notifiers that deliver result envelopes back.
//!
//! - [`RedisBackend`]: results stored under `celery-task-meta-*` keys and
//!   published on channels of the same name
//! - [`RpcBackend`]: results consumed from a per-client AMQP reply queue,
//!   correlated by `correlation_id`

pub mod redis;
mod rpc;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::message::ResultMessage;

pub use redis::{RedisBackend, RedisBackendOptions, RedisBaseOptions, RedisOptions};
pub use rpc::{RpcBackend, RpcBackendOptions};

/// A store/notifier able to deliver result envelopes back to the client.
#[async_trait]
pub trait ResultBackend: Send + Sync {
    /// Publishes a result envelope. Clients rarely call this since workers
    /// own the write side, but the backend interface is symmetric.
    async fn put(&self, message: &ResultMessage) -> Result<String>;

    /// Resolves with the result envelope for `task_id`, whether it arrived
    /// before this call or arrives later. `timeout` bounds the wait; on
    /// expiry only this call fails and the correlation entry survives for
    /// an idempotent re-`get`.
    async fn get(&self, task_id: &str, timeout: Option<Duration>) -> Result<ResultMessage>;

    /// Drops the stored result for `task_id`, reporting the backend's
    /// reply as a string.
    async fn delete(&self, task_id: &str) -> Result<String>;

    /// Tears the backend down, rejecting every in-flight `get` with a
    /// disconnect error and refusing new operations.
    async fn end(&self) -> Result<()>;

    /// Connection target this backend talks to.
    fn uri(&self) -> Result<String>;
}
