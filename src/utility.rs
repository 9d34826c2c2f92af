//! Small parsing and async helpers shared across the crate.
//!
//! The string parsers back the typed query descriptors in [`crate::uri`];
//! the timeout helpers back every user-facing `get` with a deadline.

use std::future::Future;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use tokio::sync::broadcast;

use crate::error::{Result, TaskwireError};

static BINARY_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^0b([01]+)$").expect("binary regex"));
static HEX_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^0x([0-9a-f]+)$").expect("hex regex"));
static OCTAL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^0([0-7]+)$").expect("octal regex"));
static DECIMAL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(0|[1-9][0-9]*)$").expect("decimal regex"));

/// Parses an integer accepting `0b` binary, `0x` hex, leading-zero octal, or
/// decimal notation. Surrounding whitespace is ignored; anything else,
/// including an empty body, mixed bases, or digits invalid for the chosen
/// base, is a [`TaskwireError::Parse`]. Note that a leading zero selects octal, so
/// `"08"` is rejected rather than read as decimal.
pub fn parse_integer(value: &str) -> Result<i64> {
    let trimmed = value.trim().to_lowercase();

    let (body, radix) = if let Some(caps) = BINARY_RE.captures(&trimmed) {
        (caps[1].to_string(), 2)
    } else if let Some(caps) = HEX_RE.captures(&trimmed) {
        (caps[1].to_string(), 16)
    } else if let Some(caps) = OCTAL_RE.captures(&trimmed) {
        (caps[1].to_string(), 8)
    } else if let Some(caps) = DECIMAL_RE.captures(&trimmed) {
        (caps[1].to_string(), 10)
    } else {
        return Err(TaskwireError::Parse(format!(
            "unable to parse integer from {value:?}"
        )));
    };

    i64::from_str_radix(&body, radix)
        .map_err(|e| TaskwireError::Parse(format!("unable to parse integer from {value:?}: {e}")))
}

/// Parses `true|on|yes|1` and `false|off|no|0` (case-insensitive).
pub fn parse_boolean(value: &str) -> Result<bool> {
    match value.trim().to_lowercase().as_str() {
        "true" | "on" | "yes" | "1" => Ok(true),
        "false" | "off" | "no" | "0" => Ok(false),
        other => Err(TaskwireError::Parse(format!(
            "unable to parse boolean from {other:?}"
        ))),
    }
}

/// Converts `snake_case` to `camelCase`. Already-camelCase input passes
/// through unchanged.
pub fn to_camel_case(value: &str) -> String {
    let mut converted = String::with_capacity(value.len());
    let mut upper_next = false;
    for c in value.chars() {
        if c == '_' {
            upper_next = true;
        } else if upper_next {
            converted.extend(c.to_uppercase());
            upper_next = false;
        } else {
            converted.push(c);
        }
    }
    converted
}

/// Races `future` against a deadline. With no deadline the future passes
/// through untouched; otherwise expiry settles the call with
/// [`TaskwireError::Timeout`] and drops the inner future.
pub async fn with_timeout<T, F>(future: F, timeout: Option<Duration>) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match timeout {
        None => future.await,
        Some(duration) => match tokio::time::timeout(duration, future).await {
            Ok(outcome) => outcome,
            Err(_) => Err(TaskwireError::Timeout(format!(
                "no result after {}ms",
                duration.as_millis()
            ))),
        },
    }
}

/// Sleeps for `duration` and then fails with [`TaskwireError::Timeout`].
/// Useful as the losing arm of a race.
pub async fn timer<T>(duration: Duration) -> Result<T> {
    tokio::time::sleep(duration).await;
    Err(TaskwireError::Timeout(format!(
        "timer elapsed after {}ms",
        duration.as_millis()
    )))
}

/// Resolves with the next value broadcast on `rx`. Missed-message lag is
/// skipped; a closed channel is a [`TaskwireError::Disconnected`].
pub async fn next_event<T: Clone>(rx: &mut broadcast::Receiver<T>) -> Result<T> {
    loop {
        match rx.recv().await {
            Ok(value) => return Ok(value),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::debug!(skipped, "event receiver lagged, retrying");
            }
            Err(broadcast::error::RecvError::Closed) => {
                return Err(TaskwireError::Disconnected("event channel closed".into()));
            }
        }
    }
}

/// Re-listens on `rx` until `filter_map` produces a value, then resolves
/// with it. Events the filter rejects are discarded.
pub async fn filter_map_event<T, U, F>(rx: &mut broadcast::Receiver<T>, mut filter_map: F) -> Result<U>
where
    T: Clone,
    F: FnMut(T) -> Option<U>,
{
    loop {
        let event = next_event(rx).await?;
        if let Some(value) = filter_map(event) {
            return Ok(value);
        }
    }
}
