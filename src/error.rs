//! Crate-wide error type.
//!
//! All layers report through one enum so a failure produced deep in a
//! transport can fan out to every waiter holding a result future. Variants
//! carry message strings rather than source errors to keep the enum `Clone`;
//! a single broker failure may settle many pending futures at once.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, TaskwireError>;

/// Errors surfaced by brokers, backends, parsers and containers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskwireError {
    /// Malformed URI, query string, integer or boolean.
    #[error("parse error: {0}")]
    Parse(String),

    /// Operation recognized but intentionally not provided.
    #[error("unimplemented: {0}")]
    Unimplemented(String),

    /// Operation attempted after `end()`, or torn down while in flight.
    #[error("disconnected: {0}")]
    Disconnected(String),

    /// A timed wait elapsed before the awaited outcome arrived.
    #[error("timed out: {0}")]
    Timeout(String),

    /// The AMQP broker dropped our reply consumer.
    #[error("consumer cancelled: {0}")]
    ConsumerCancelled(String),

    /// Every broker in a failover group failed to accept a publish.
    #[error("all brokers failed: {0}")]
    Broker(String),

    /// Redis driver failure.
    #[error("redis error: {0}")]
    Redis(String),

    /// AMQP driver failure.
    #[error("amqp error: {0}")]
    Amqp(String),

    /// Encoding or decoding of a payload failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Resource pool misuse or exhaustion during teardown.
    #[error("pool error: {0}")]
    Pool(String),
}

impl From<redis::RedisError> for TaskwireError {
    fn from(err: redis::RedisError) -> Self {
        TaskwireError::Redis(err.to_string())
    }
}

impl From<bb8_redis::bb8::RunError<redis::RedisError>> for TaskwireError {
    fn from(err: bb8_redis::bb8::RunError<redis::RedisError>) -> Self {
        TaskwireError::Pool(err.to_string())
    }
}

impl From<lapin::Error> for TaskwireError {
    fn from(err: lapin::Error) -> Self {
        TaskwireError::Amqp(err.to_string())
    }
}

impl From<serde_json::Error> for TaskwireError {
    fn from(err: serde_json::Error) -> Self {
        TaskwireError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for TaskwireError {
    fn from(err: serde_yaml::Error) -> Self {
        TaskwireError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for TaskwireError {
    fn from(err: std::io::Error) -> Self {
        TaskwireError::Serialization(err.to_string())
    }
}

impl From<base64::DecodeError> for TaskwireError {
    fn from(err: base64::DecodeError) -> Self {
        TaskwireError::Serialization(err.to_string())
    }
}

impl From<std::string::FromUtf8Error> for TaskwireError {
    fn from(err: std::string::FromUtf8Error) -> Self {
        TaskwireError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn variants_render_their_kind() {
        let err = TaskwireError::Parse("bad port".into());
        assert_eq!(err.to_string(), "parse error: bad port");

        let err = TaskwireError::Broker("2 broker(s) failed".into());
        assert!(err.to_string().starts_with("all brokers failed"));
    }

    #[test]
    fn driver_errors_map_to_their_transport() {
        let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        assert!(matches!(
            TaskwireError::from(json_err),
            TaskwireError::Serialization(_)
        ));
    }
}
