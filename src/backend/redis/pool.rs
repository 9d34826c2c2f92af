//! Command-connection pooling.
//!
//! The result backend and the Redis broker both draw their command
//! connections from a bb8 pool built here. The constructor probes the
//! target with PING before handing the pool out, so an unreachable server
//! or a bad URL fails at construction instead of on the first task
//! submission.

use std::time::Duration;

use bb8_redis::bb8::Pool;
use bb8_redis::RedisConnectionManager;
use tracing::{debug, warn};

use crate::error::{Result, TaskwireError};

/// Tuning for the shared command-connection pool.
#[derive(Debug, Clone, Copy)]
pub struct RedisPoolConfig {
    /// Upper bound on concurrent command connections.
    pub max_size: u32,
    /// How long a borrower may wait for a free connection.
    pub conn_timeout: Duration,
    /// Connections idle this long are dropped from the pool.
    pub idle_timeout: Duration,
    /// How many PING probes to try before declaring the target dead.
    pub verify_attempts: u32,
    /// Pause before the second probe; doubled for each probe after that.
    pub verify_delay: Duration,
}

impl Default for RedisPoolConfig {
    fn default() -> Self {
        Self {
            max_size: 16,
            conn_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(300),
            verify_attempts: 3,
            verify_delay: Duration::from_millis(250),
        }
    }
}

/// Pool over `redis_url` with default tuning.
pub async fn create_redis_pool(redis_url: &str) -> Result<Pool<RedisConnectionManager>> {
    create_redis_pool_with(redis_url, RedisPoolConfig::default()).await
}

/// Pool over `redis_url` with explicit tuning. Fails unless the target
/// answers a PING within the configured probe budget.
pub async fn create_redis_pool_with(
    redis_url: &str,
    config: RedisPoolConfig,
) -> Result<Pool<RedisConnectionManager>> {
    if config.max_size == 0 {
        return Err(TaskwireError::Pool(
            "pool max_size must be at least 1".into(),
        ));
    }

    let manager = RedisConnectionManager::new(redis_url).map_err(|e| {
        TaskwireError::Parse(format!(
            "bad redis url {}: {e}",
            redact_credentials(redis_url)
        ))
    })?;

    let pool = Pool::builder()
        .max_size(config.max_size)
        .connection_timeout(config.conn_timeout)
        .idle_timeout(Some(config.idle_timeout))
        .build(manager)
        .await
        .map_err(|e| TaskwireError::Redis(format!("redis pool construction failed: {e}")))?;

    verify_target(&pool, &config).await?;
    debug!(
        max_size = config.max_size,
        addr = %redact_credentials(redis_url),
        "redis command pool ready"
    );
    Ok(pool)
}

/// Probes the pool's target until it answers PONG or the probe budget is
/// spent.
async fn verify_target(
    pool: &Pool<RedisConnectionManager>,
    config: &RedisPoolConfig,
) -> Result<()> {
    let attempts = config.verify_attempts.max(1);
    let mut delay = config.verify_delay;
    let mut last_error = TaskwireError::Redis("no probe attempted".into());

    for attempt in 1..=attempts {
        match ping(pool).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                warn!(attempt, attempts, error = %e, "redis probe failed");
                last_error = e;
                if attempt < attempts {
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
            }
        }
    }

    Err(TaskwireError::Redis(format!(
        "redis target failed verification after {attempts} probe(s): {last_error}"
    )))
}

async fn ping(pool: &Pool<RedisConnectionManager>) -> Result<()> {
    let mut conn = pool.get().await?;
    let reply: String = redis::cmd("PING").query_async(&mut *conn).await?;
    if reply != "PONG" {
        return Err(TaskwireError::Redis(format!(
            "unexpected PING reply {reply:?}"
        )));
    }
    Ok(())
}

/// Strips the userinfo section out of a connection string before it
/// reaches a log line.
pub(crate) fn redact_credentials(url: &str) -> String {
    let Some((scheme, rest)) = url.split_once("://") else {
        return url.to_owned();
    };
    match rest.rsplit_once('@') {
        Some((_, host)) => format!("{scheme}://<redacted>@{host}"),
        None => url.to_owned(),
    }
}
