//! Redis result backend.
//!
//! Workers SET the result under `celery-task-meta-<uuid>` and PUBLISH the
//! same payload on a channel of the same name. Retrieval subscribes first
//! and only then issues the GET: a producer racing between our GET and a
//! later subscribe would otherwise be missed, while subscribe-then-GET sees
//! either the stored value or the published message.

mod pool;

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bb8_redis::bb8::Pool;
use bb8_redis::RedisConnectionManager;
use futures::StreamExt;
use redis::AsyncCommands;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::ResultBackend;
use crate::error::{Result, TaskwireError};
use crate::message::ResultMessage;
use crate::uri::redis::{RedisSocketUri, RedisTcpUri, SentinelUri};
use crate::uri::{get_scheme, percent_encode, Scheme};
use crate::utility::{next_event, with_timeout};

pub use pool::{create_redis_pool, create_redis_pool_with, RedisPoolConfig};

/// Connection options shared by every Redis deployment shape.
#[derive(Debug, Clone, Default)]
pub struct RedisBaseOptions {
    pub password: Option<String>,
    pub db: Option<i64>,
    pub no_delay: Option<bool>,
    pub tls: bool,
}

/// Tagged Redis deployment shape. The discriminant mirrors how deployments
/// are configured: a node list means Cluster, a sentinel list means
/// Sentinel, a filesystem path means a unix socket, and a host means plain
/// TCP.
#[derive(Debug, Clone)]
pub enum RedisOptions {
    Tcp {
        host: String,
        port: u16,
        base: RedisBaseOptions,
    },
    Socket {
        path: String,
        base: RedisBaseOptions,
    },
    Sentinel {
        sentinels: Vec<(String, u16)>,
        master_name: String,
        base: RedisBaseOptions,
    },
    Cluster {
        nodes: Vec<(String, u16)>,
        base: RedisBaseOptions,
    },
}

impl RedisOptions {
    /// Parses a `redis`, `rediss`, `redis+socket`, `rediss+socket`,
    /// `sentinel`, or `sentinels` connection string.
    pub fn from_uri(raw: &str) -> Result<RedisOptions> {
        match get_scheme(raw)? {
            Scheme::Redis | Scheme::RedisTls => {
                let parsed = RedisTcpUri::parse(raw)?;
                Ok(RedisOptions::Tcp {
                    host: parsed.host.clone(),
                    port: parsed.port_or_default(),
                    base: RedisBaseOptions {
                        password: parsed.password,
                        db: parsed.db,
                        no_delay: parsed.no_delay,
                        tls: parsed.tls,
                    },
                })
            }
            Scheme::RedisSocket | Scheme::RedisSocketTls => {
                let parsed = RedisSocketUri::parse(raw)?;
                Ok(RedisOptions::Socket {
                    path: parsed.path,
                    base: RedisBaseOptions {
                        password: parsed.password,
                        db: None,
                        no_delay: parsed.no_delay,
                        tls: parsed.tls,
                    },
                })
            }
            Scheme::Sentinel | Scheme::SentinelTls => {
                let parsed = SentinelUri::parse(raw)?;
                Ok(RedisOptions::Sentinel {
                    sentinels: vec![(parsed.host.clone(), parsed.port_or_default())],
                    master_name: parsed.master_name,
                    base: RedisBaseOptions {
                        password: parsed.password,
                        db: parsed.db,
                        no_delay: None,
                        tls: parsed.tls,
                    },
                })
            }
            other => Err(TaskwireError::Parse(format!(
                "{other} is not a Redis scheme"
            ))),
        }
    }

    /// Human-readable connection target, credentials omitted.
    pub fn describe(&self) -> String {
        match self {
            RedisOptions::Tcp { host, port, base } => {
                format!(
                    "{}://{}:{}/{}",
                    if base.tls { "rediss" } else { "redis" },
                    host,
                    port,
                    base.db.unwrap_or(0)
                )
            }
            RedisOptions::Socket { path, base } => {
                format!(
                    "{}://{}",
                    if base.tls { "rediss+socket" } else { "redis+socket" },
                    path
                )
            }
            RedisOptions::Sentinel {
                sentinels,
                master_name,
                ..
            } => format!(
                "sentinel://{}?masterName={}",
                sentinels
                    .iter()
                    .map(|(h, p)| format!("{h}:{p}"))
                    .collect::<Vec<_>>()
                    .join(","),
                master_name
            ),
            RedisOptions::Cluster { nodes, .. } => format!(
                "redis-cluster://{}",
                nodes
                    .iter()
                    .map(|(h, p)| format!("{h}:{p}"))
                    .collect::<Vec<_>>()
                    .join(",")
            ),
        }
    }

    /// Resolves the shape down to the single-node driver URL the backend
    /// connects to. Sentinel queries the sentinel list for the current
    /// master address.
    pub(crate) async fn resolve_connection_url(&self) -> Result<String> {
        match self {
            RedisOptions::Tcp { host, port, base } => Ok(tcp_url(host, *port, base)),
            RedisOptions::Socket { path, base } => Ok(socket_url(path, base)),
            RedisOptions::Sentinel {
                sentinels,
                master_name,
                base,
            } => {
                let (host, port) = resolve_sentinel_master(sentinels, master_name).await?;
                info!(master = %master_name, host = %host, port, "sentinel resolved master");
                Ok(tcp_url(&host, port, base))
            }
            RedisOptions::Cluster { .. } => Err(TaskwireError::Unimplemented(
                "redis cluster result backend".into(),
            )),
        }
    }
}

fn tcp_url(host: &str, port: u16, base: &RedisBaseOptions) -> String {
    let scheme = if base.tls { "rediss" } else { "redis" };
    let auth = base
        .password
        .as_ref()
        .map(|pass| format!(":{}@", percent_encode(pass)))
        .unwrap_or_default();
    format!("{scheme}://{auth}{host}:{port}/{}", base.db.unwrap_or(0))
}

fn socket_url(path: &str, base: &RedisBaseOptions) -> String {
    let mut params = Vec::new();
    if let Some(db) = base.db {
        params.push(format!("db={db}"));
    }
    if let Some(pass) = &base.password {
        params.push(format!("pass={}", percent_encode(pass)));
    }
    let query = if params.is_empty() {
        String::new()
    } else {
        format!("?{}", params.join("&"))
    };
    format!("redis+unix://{path}{query}")
}

async fn resolve_sentinel_master(
    sentinels: &[(String, u16)],
    master_name: &str,
) -> Result<(String, u16)> {
    for (host, port) in sentinels {
        let url = format!("redis://{host}:{port}");
        let client = match redis::Client::open(url.as_str()) {
            Ok(client) => client,
            Err(e) => {
                warn!(sentinel = %host, error = %e, "skipping unusable sentinel address");
                continue;
            }
        };
        let mut conn = match client.get_multiplexed_async_connection().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!(sentinel = %host, error = %e, "sentinel unreachable");
                continue;
            }
        };

        let reply: std::result::Result<Option<(String, String)>, redis::RedisError> =
            redis::cmd("SENTINEL")
                .arg("get-master-addr-by-name")
                .arg(master_name)
                .query_async(&mut conn)
                .await;
        match reply {
            Ok(Some((master_host, master_port))) => {
                let port = master_port.parse::<u16>().map_err(|_| {
                    TaskwireError::Parse(format!(
                        "sentinel returned invalid master port {master_port:?}"
                    ))
                })?;
                return Ok((master_host, port));
            }
            Ok(None) => {
                warn!(sentinel = %host, master = %master_name, "sentinel does not know the master");
            }
            Err(e) => {
                warn!(sentinel = %host, error = %e, "sentinel query failed");
            }
        }
    }
    Err(TaskwireError::Redis(format!(
        "no sentinel could resolve master {master_name:?}"
    )))
}

#[derive(Debug, Clone)]
pub struct RedisBackendOptions {
    /// Prefix scoping every result key.
    pub key_prefix: String,
    /// TTL applied by `put`.
    pub result_expires: Duration,
}

impl Default for RedisBackendOptions {
    fn default() -> Self {
        Self {
            key_prefix: "celery-task-meta-".to_owned(),
            result_expires: Duration::from_secs(86_400),
        }
    }
}

/// Result backend over Redis SET/GET plus PUBLISH/SUBSCRIBE.
///
/// Command traffic shares a connection pool; each in-flight `get` holds its
/// own exclusive subscriber connection, released on every outcome.
pub struct RedisBackend {
    pool: Pool<RedisConnectionManager>,
    client: redis::Client,
    key_prefix: String,
    expires: Duration,
    target: String,
    shutdown: broadcast::Sender<()>,
    ended: AtomicBool,
}

impl RedisBackend {
    pub async fn connect(url: &str) -> Result<Self> {
        Self::with_options(RedisOptions::from_uri(url)?, RedisBackendOptions::default()).await
    }

    pub async fn with_options(
        options: RedisOptions,
        backend_options: RedisBackendOptions,
    ) -> Result<Self> {
        let url = options.resolve_connection_url().await?;
        let pool = create_redis_pool(&url).await?;
        let client = redis::Client::open(url.as_str())?;
        let (shutdown, _) = broadcast::channel(1);
        let target = options.describe();
        info!(addr = %target, "connected to Redis result backend");

        Ok(Self {
            pool,
            client,
            key_prefix: backend_options.key_prefix,
            expires: backend_options.result_expires,
            target,
            shutdown,
            ended: AtomicBool::new(false),
        })
    }

    fn result_key(&self, task_id: &str) -> String {
        format!("{}{}", self.key_prefix, task_id)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.ended.load(Ordering::SeqCst) {
            return Err(TaskwireError::Disconnected(
                "redis result backend has been ended".into(),
            ));
        }
        Ok(())
    }

    async fn wait_for_result(
        &self,
        key: &str,
        pubsub: &mut redis::aio::PubSub,
    ) -> Result<ResultMessage> {
        {
            let mut conn = self.pool.get().await?;
            let existing: Option<String> = conn.get(key).await?;
            if let Some(raw) = existing {
                debug!(key = %key, "result already stored");
                return Ok(serde_json::from_str(&raw)?);
            }
        }

        let mut messages = pubsub.on_message();
        match messages.next().await {
            Some(message) => {
                let raw: String = message.get_payload()?;
                debug!(key = %key, "result arrived on subscription");
                Ok(serde_json::from_str(&raw)?)
            }
            None => Err(TaskwireError::Disconnected(
                "subscriber connection closed".into(),
            )),
        }
    }
}

#[async_trait]
impl ResultBackend for RedisBackend {
    async fn put(&self, message: &ResultMessage) -> Result<String> {
        self.ensure_open()?;
        let key = self.result_key(&message.task_id);
        let payload = serde_json::to_string(message)?;

        let mut conn = self.pool.get().await?;
        let stored: String = conn
            .set_ex(&key, payload.as_str(), self.expires.as_secs())
            .await?;
        let _subscribers: i64 = conn.publish(&key, payload.as_str()).await?;
        debug!(key = %key, "result stored and published");
        Ok(stored)
    }

    async fn get(&self, task_id: &str, timeout: Option<Duration>) -> Result<ResultMessage> {
        // Register for the shutdown signal before the open-check so an
        // end() arriving in between cannot slip past this waiter.
        let mut shutdown = self.shutdown.subscribe();
        self.ensure_open()?;
        let key = self.result_key(task_id);

        // Subscribe before GET so a producer landing in between cannot be
        // missed. Workers SET then PUBLISH in that order.
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(&key).await?;
        debug!(key = %key, "subscribed for result notification");

        let outcome = tokio::select! {
            outcome = with_timeout(self.wait_for_result(&key, &mut pubsub), timeout) => outcome,
            _ = next_event(&mut shutdown) => Err(TaskwireError::Disconnected("disconnecting".into())),
        };

        let _ = pubsub.unsubscribe(&key).await;
        outcome
    }

    async fn delete(&self, task_id: &str) -> Result<String> {
        self.ensure_open()?;
        let key = self.result_key(task_id);
        let mut conn = self.pool.get().await?;
        let removed: i64 = conn.del(&key).await?;
        Ok(removed.to_string())
    }

    async fn end(&self) -> Result<()> {
        self.ended.store(true, Ordering::SeqCst);
        let _ = self.shutdown.send(());
        info!(addr = %self.target, "redis result backend ended");
        Ok(())
    }

    fn uri(&self) -> Result<String> {
        Ok(self.target.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::TaskStatus;
    use serde_json::json;

    #[test]
    fn uri_parsing_discriminates_deployment_shapes() {
        assert!(matches!(
            RedisOptions::from_uri("redis://localhost").unwrap(),
            RedisOptions::Tcp { port: 6379, .. }
        ));
        assert!(matches!(
            RedisOptions::from_uri("redis+socket:///tmp/redis.sock").unwrap(),
            RedisOptions::Socket { .. }
        ));
        assert!(matches!(
            RedisOptions::from_uri("sentinel://h?masterName=cache").unwrap(),
            RedisOptions::Sentinel { .. }
        ));
        assert!(RedisOptions::from_uri("amqp://h").is_err());
    }

    #[test]
    fn driver_urls_carry_credentials_and_db() {
        let options = RedisOptions::from_uri("redis://:p%40ss@h:6380/2").unwrap();
        assert!(matches!(&options, RedisOptions::Tcp { port: 6380, .. }));
        if let RedisOptions::Tcp { host, port, base } = &options {
            assert_eq!(tcp_url(host, *port, base), "redis://:p%40ss@h:6380/2");
        }

        let socket = RedisOptions::from_uri("redis+socket:///var/r.sock?password=pw").unwrap();
        if let RedisOptions::Socket { path, base } = &socket {
            assert_eq!(socket_url(path, base), "redis+unix:///var/r.sock?pass=pw");
        }
    }

    #[tokio::test]
    async fn cluster_construction_is_unimplemented() {
        let options = RedisOptions::Cluster {
            nodes: vec![("h".into(), 7000)],
            base: RedisBaseOptions::default(),
        };
        assert!(matches!(
            options.resolve_connection_url().await,
            Err(TaskwireError::Unimplemented(_))
        ));
    }

    #[test]
    fn describe_never_contains_credentials() {
        let options = RedisOptions::from_uri("redis://:secret@h:6379/1").unwrap();
        let described = options.describe();
        assert!(!described.contains("secret"));
        assert_eq!(described, "redis://h:6379/1");
    }

    fn sample_result(task_id: &str) -> ResultMessage {
        ResultMessage {
            task_id: task_id.to_owned(),
            status: TaskStatus::Success,
            result: json!(25),
            traceback: None,
            children: Vec::new(),
        }
    }

    // Integration coverage requires Redis:
    //   docker run --rm -p 6379:6379 redis:7

    #[tokio::test]
    #[ignore = "requires Redis running"]
    async fn get_resolves_immediately_from_a_stored_result() {
        let backend = RedisBackend::connect("redis://localhost:6379").await.unwrap();
        let task_id = uuid::Uuid::new_v4().to_string();
        backend.put(&sample_result(&task_id)).await.unwrap();

        let fetched = backend
            .get(&task_id, Some(Duration::from_millis(20)))
            .await
            .unwrap();
        assert_eq!(fetched.result, json!(25));
        backend.delete(&task_id).await.unwrap();
    }

    #[tokio::test]
    #[ignore = "requires Redis running"]
    async fn get_begun_before_the_publish_still_resolves() {
        let backend =
            std::sync::Arc::new(RedisBackend::connect("redis://localhost:6379").await.unwrap());
        let task_id = uuid::Uuid::new_v4().to_string();

        let waiter = {
            let backend = backend.clone();
            let task_id = task_id.clone();
            tokio::spawn(async move { backend.get(&task_id, Some(Duration::from_secs(2))).await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        backend.put(&sample_result(&task_id)).await.unwrap();

        let fetched = waiter.await.unwrap().unwrap();
        assert_eq!(fetched.task_id, task_id);
        backend.delete(&task_id).await.unwrap();
    }

    #[tokio::test]
    #[ignore = "requires Redis running"]
    async fn put_applies_the_default_day_long_ttl() {
        let backend = RedisBackend::connect("redis://localhost:6379").await.unwrap();
        let task_id = uuid::Uuid::new_v4().to_string();
        backend.put(&sample_result(&task_id)).await.unwrap();

        let mut conn = backend.pool.get().await.unwrap();
        let ttl: i64 = redis::cmd("TTL")
            .arg(backend.result_key(&task_id))
            .query_async(&mut *conn)
            .await
            .unwrap();
        assert!(ttl >= 86_398, "ttl was {ttl}");
        backend.delete(&task_id).await.unwrap();
    }

    #[tokio::test]
    #[ignore = "requires Redis running"]
    async fn delete_reports_hits_and_misses() {
        let backend = RedisBackend::connect("redis://localhost:6379").await.unwrap();
        let task_id = uuid::Uuid::new_v4().to_string();
        backend.put(&sample_result(&task_id)).await.unwrap();

        assert_eq!(backend.delete(&task_id).await.unwrap(), "1");
        assert_eq!(backend.delete(&task_id).await.unwrap(), "0");
    }

    #[tokio::test]
    #[ignore = "requires Redis running"]
    async fn end_rejects_in_flight_gets() {
        let backend =
            std::sync::Arc::new(RedisBackend::connect("redis://localhost:6379").await.unwrap());
        let waiter = {
            let backend = backend.clone();
            tokio::spawn(async move {
                backend
                    .get(&uuid::Uuid::new_v4().to_string(), Some(Duration::from_secs(5)))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        backend.end().await.unwrap();

        let outcome = waiter.await.unwrap();
        assert!(matches!(outcome, Err(TaskwireError::Disconnected(_))));
    }
}
