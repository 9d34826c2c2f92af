//! Redis connection-string parsing: TCP, unix socket, and Sentinel.

use once_cell::sync::Lazy;
use regex::Regex;

use super::{get_scheme, parse_uri, Scheme, Uri};
use crate::error::{Result, TaskwireError};
use crate::uri::query::{apply_descriptors, QueryDescriptor};

static DB_PATH_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^/0*(\d+)$").expect("db path regex"));

/// Typed `redis://` / `rediss://` connection record.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RedisTcpUri {
    pub tls: bool,
    pub host: String,
    pub port: Option<u16>,
    /// Query `password` wins over a userinfo password.
    pub password: Option<String>,
    pub db: Option<i64>,
    pub no_delay: Option<bool>,
}

impl RedisTcpUri {
    pub fn parse(raw: &str) -> Result<RedisTcpUri> {
        let scheme = get_scheme(raw)?;
        parse_redis_tcp_uri(&parse_uri(raw)?, scheme)
    }

    pub fn port_or_default(&self) -> u16 {
        self.port.unwrap_or(6379)
    }
}

/// Typed `redis+socket://` / `rediss+socket://` connection record.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RedisSocketUri {
    pub tls: bool,
    pub path: String,
    pub password: Option<String>,
    pub no_delay: Option<bool>,
}

impl RedisSocketUri {
    pub fn parse(raw: &str) -> Result<RedisSocketUri> {
        let scheme = get_scheme(raw)?;
        parse_redis_socket_uri(&parse_uri(raw)?, scheme)
    }
}

/// Typed `sentinel://` / `sentinels://` record: one sentinel node plus the
/// master name it should resolve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentinelUri {
    pub tls: bool,
    pub host: String,
    pub port: Option<u16>,
    pub master_name: String,
    pub password: Option<String>,
    pub db: Option<i64>,
}

impl SentinelUri {
    pub fn parse(raw: &str) -> Result<SentinelUri> {
        let scheme = get_scheme(raw)?;
        parse_sentinel_uri(&parse_uri(raw)?, scheme)
    }

    pub fn port_or_default(&self) -> u16 {
        self.port.unwrap_or(26379)
    }
}

/// Refines a generic [`Uri`] into a [`RedisTcpUri`].
pub fn parse_redis_tcp_uri(uri: &Uri, scheme: Scheme) -> Result<RedisTcpUri> {
    let tls = match scheme {
        Scheme::Redis => false,
        Scheme::RedisTls => true,
        other => {
            return Err(TaskwireError::Parse(format!(
                "{other} is not a Redis TCP scheme"
            )));
        }
    };

    let authority = uri.authority.as_ref().ok_or_else(|| {
        TaskwireError::Parse(format!("missing host in Redis uri {:?}", uri.raw))
    })?;

    let mut parsed = RedisTcpUri {
        tls,
        host: authority.host.clone(),
        port: authority.port,
        password: authority.user_info.as_ref().and_then(|u| u.pass.clone()),
        db: parse_db_path(&uri.path, &uri.raw)?,
        no_delay: None,
    };

    let descriptors: Vec<QueryDescriptor<RedisTcpUri>> = vec![
        QueryDescriptor::string("password", |u: &mut RedisTcpUri, v| u.password = Some(v)),
        QueryDescriptor::boolean("no_delay", |u: &mut RedisTcpUri, v| u.no_delay = Some(v)),
    ];
    apply_descriptors(&mut parsed, &uri.query, &descriptors)?;

    Ok(parsed)
}

/// Refines a generic [`Uri`] into a [`RedisSocketUri`].
pub fn parse_redis_socket_uri(uri: &Uri, scheme: Scheme) -> Result<RedisSocketUri> {
    let tls = match scheme {
        Scheme::RedisSocket => false,
        Scheme::RedisSocketTls => true,
        other => {
            return Err(TaskwireError::Parse(format!(
                "{other} is not a Redis socket scheme"
            )));
        }
    };

    if uri.path.is_empty() {
        return Err(TaskwireError::Parse(format!(
            "missing socket path in {:?}",
            uri.raw
        )));
    }
    if uri.path.contains('\0') {
        return Err(TaskwireError::Parse(format!(
            "socket path in {:?} contains a NUL byte",
            uri.raw
        )));
    }

    let mut parsed = RedisSocketUri {
        tls,
        path: uri.path.clone(),
        password: None,
        no_delay: None,
    };

    let descriptors: Vec<QueryDescriptor<RedisSocketUri>> = vec![
        QueryDescriptor::string("password", |u: &mut RedisSocketUri, v| u.password = Some(v)),
        QueryDescriptor::boolean("no_delay", |u: &mut RedisSocketUri, v| u.no_delay = Some(v)),
    ];
    apply_descriptors(&mut parsed, &uri.query, &descriptors)?;

    Ok(parsed)
}

/// Refines a generic [`Uri`] into a [`SentinelUri`]. The master name comes
/// from the `masterName` query and defaults to Redis's conventional
/// `mymaster`.
pub fn parse_sentinel_uri(uri: &Uri, scheme: Scheme) -> Result<SentinelUri> {
    let tls = match scheme {
        Scheme::Sentinel => false,
        Scheme::SentinelTls => true,
        other => {
            return Err(TaskwireError::Parse(format!(
                "{other} is not a Sentinel scheme"
            )));
        }
    };

    let authority = uri.authority.as_ref().ok_or_else(|| {
        TaskwireError::Parse(format!("missing host in Sentinel uri {:?}", uri.raw))
    })?;

    let mut parsed = SentinelUri {
        tls,
        host: authority.host.clone(),
        port: authority.port,
        master_name: "mymaster".to_owned(),
        password: authority.user_info.as_ref().and_then(|u| u.pass.clone()),
        db: parse_db_path(&uri.path, &uri.raw)?,
    };

    let descriptors: Vec<QueryDescriptor<SentinelUri>> = vec![
        QueryDescriptor::string("master_name", |u: &mut SentinelUri, v| u.master_name = v),
        QueryDescriptor::string("password", |u: &mut SentinelUri, v| u.password = Some(v)),
    ];
    apply_descriptors(&mut parsed, &uri.query, &descriptors)?;

    Ok(parsed)
}

fn parse_db_path(path: &str, raw: &str) -> Result<Option<i64>> {
    if path.is_empty() || path == "/" {
        return Ok(None);
    }
    let caps = DB_PATH_RE.captures(path).ok_or_else(|| {
        TaskwireError::Parse(format!("invalid database path {path:?} in {raw:?}"))
    })?;
    caps[1]
        .parse::<i64>()
        .map(Some)
        .map_err(|_| TaskwireError::Parse(format!("database index {path:?} out of range")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn password_and_db_come_from_userinfo_and_path() {
        let parsed = RedisTcpUri::parse("redis://:super%20secure@localhost/0").unwrap();
        assert_eq!(parsed.host, "localhost");
        assert_eq!(parsed.password.as_deref(), Some("super secure"));
        assert_eq!(parsed.db, Some(0));
        assert!(!parsed.tls);
    }

    #[test]
    fn query_password_beats_userinfo_password() {
        let parsed = RedisTcpUri::parse("redis://:one@h?password=two").unwrap();
        assert_eq!(parsed.password.as_deref(), Some("two"));
    }

    #[test]
    fn leading_zeroes_in_the_db_segment_are_tolerated() {
        assert_eq!(RedisTcpUri::parse("redis://h/007").unwrap().db, Some(7));
        assert_eq!(RedisTcpUri::parse("redis://h").unwrap().db, None);
        assert_eq!(RedisTcpUri::parse("redis://h/").unwrap().db, None);
        assert!(RedisTcpUri::parse("redis://h/db1").is_err());
    }

    #[test]
    fn rediss_sets_the_tls_flag() {
        let parsed = RedisTcpUri::parse("rediss://h:6380?noDelay=yes").unwrap();
        assert!(parsed.tls);
        assert_eq!(parsed.port, Some(6380));
        assert_eq!(parsed.no_delay, Some(true));
        assert_eq!(parsed.port_or_default(), 6380);
    }

    #[test]
    fn socket_uris_carry_the_filesystem_path() {
        let parsed =
            RedisSocketUri::parse("redis+socket:///var/run/redis.sock?password=pw").unwrap();
        assert_eq!(parsed.path, "/var/run/redis.sock");
        assert_eq!(parsed.password.as_deref(), Some("pw"));

        assert!(RedisSocketUri::parse("redis+socket://").is_err());
    }

    #[test]
    fn sentinel_uri_carries_the_master_name() {
        let parsed = SentinelUri::parse("sentinel://h:26379?masterName=cache").unwrap();
        assert_eq!(parsed.master_name, "cache");
        assert_eq!(parsed.port_or_default(), 26379);

        let defaulted = SentinelUri::parse("sentinels://h").unwrap();
        assert_eq!(defaulted.master_name, "mymaster");
        assert!(defaulted.tls);
    }
}
