//! Redis task publisher.
//!
//! The Celery Redis transport is list-based: publishing LPUSHes the
//! JSON-encoded task envelope onto the list named by the routing key, and
//! workers BRPOP from it.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bb8_redis::bb8::Pool;
use bb8_redis::RedisConnectionManager;
use redis::AsyncCommands;
use tracing::{debug, info};

use super::MessageBroker;
use crate::backend::redis::{create_redis_pool, RedisOptions};
use crate::error::{Result, TaskwireError};
use crate::message::TaskMessage;

/// Task publisher over Redis lists.
pub struct RedisBroker {
    pool: Pool<RedisConnectionManager>,
    target: String,
    ended: AtomicBool,
}

impl RedisBroker {
    pub async fn connect(url: &str) -> Result<Self> {
        Self::with_options(RedisOptions::from_uri(url)?).await
    }

    pub async fn with_options(options: RedisOptions) -> Result<Self> {
        let url = options.resolve_connection_url().await?;
        let pool = create_redis_pool(&url).await?;
        let target = options.describe();
        info!(addr = %target, "connected to Redis broker");
        Ok(Self {
            pool,
            target,
            ended: AtomicBool::new(false),
        })
    }

    fn ensure_open(&self) -> Result<()> {
        if self.ended.load(Ordering::SeqCst) {
            return Err(TaskwireError::Disconnected(
                "redis broker has been ended".into(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl MessageBroker for RedisBroker {
    async fn publish(&self, message: &TaskMessage) -> Result<String> {
        self.ensure_open()?;
        let queue = &message.properties.delivery_info.routing_key;
        let payload = serde_json::to_string(message)?;

        let mut conn = self.pool.get().await?;
        let depth: i64 = conn.lpush(queue, payload).await?;
        debug!(
            queue = %queue,
            correlation_id = %message.properties.correlation_id,
            depth,
            "task message pushed"
        );
        Ok(depth.to_string())
    }

    async fn end(&self) -> Result<()> {
        self.ended.store(true, Ordering::SeqCst);
        info!(addr = %self.target, "redis broker ended");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{DeliveryInfo, TaskProperties};

    fn sample_message(queue: &str) -> TaskMessage {
        TaskMessage {
            body: "W1tdLCB7fSwge31d".into(),
            content_encoding: "utf-8".into(),
            content_type: "application/json".into(),
            headers: serde_json::Map::new(),
            properties: TaskProperties {
                correlation_id: uuid::Uuid::new_v4().to_string(),
                reply_to: "client".into(),
                delivery_mode: 2,
                delivery_info: DeliveryInfo {
                    exchange: "".into(),
                    routing_key: queue.to_owned(),
                },
                priority: 0,
                body_encoding: "base64".into(),
            },
        }
    }

    // Integration coverage requires Redis:
    //   docker run --rm -p 6379:6379 redis:7

    #[tokio::test]
    #[ignore = "requires Redis running"]
    async fn publish_pushes_the_envelope_onto_the_queue_list() {
        let broker = RedisBroker::connect("redis://localhost:6379").await.unwrap();
        let queue = format!("taskwire-test-{}", uuid::Uuid::new_v4());

        let depth = broker.publish(&sample_message(&queue)).await.unwrap();
        assert_eq!(depth, "1");

        let mut conn = broker.pool.get().await.unwrap();
        let raw: Option<String> = conn.rpop(&queue, None).await.unwrap();
        let envelope: TaskMessage = serde_json::from_str(&raw.unwrap()).unwrap();
        assert_eq!(envelope.properties.delivery_info.routing_key, queue);
    }

    #[tokio::test]
    #[ignore = "requires Redis running"]
    async fn publish_after_end_is_refused() {
        let broker = RedisBroker::connect("redis://localhost:6379").await.unwrap();
        broker.end().await.unwrap();
        assert!(matches!(
            broker.publish(&sample_message("q")).await,
            Err(TaskwireError::Disconnected(_))
        ));
    }
}
