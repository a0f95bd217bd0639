//! Environment configuration.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use crate::core::{
    ConnectionTimeouts, ExponentialBackoff, HealthPolicy, IngestError, IngestResult, MaxAttempts,
    WebSocketBufferConfig,
};
use crate::forward::{ForwardRetryPolicy, Forwarder, HttpSink};
use crate::protocol::{EventFilter, TimestampPolicy};
use crate::transport::WsTransport;
use crate::ws::IngestActorArgs;

pub const DEFAULT_HOME_ASSISTANT_URL: &str = "ws://homeassistant.local:8123/api/websocket";
pub const DEFAULT_ENRICHMENT_URL: &str = "http://enrichment-pipeline:8002";
const WEBSOCKET_PATH: &str = "/api/websocket";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub home_assistant_url: String,
    pub token: String,
    pub event_filter: EventFilter,
    pub max_retry_attempts: MaxAttempts,
    pub retry_base_delay: Duration,
    pub max_retry_delay: Duration,
    pub reconnect_jitter: bool,
    pub timeouts: ConnectionTimeouts,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub max_message_bytes: usize,
    pub enrichment_url: String,
    pub forward_timeout: Duration,
    pub forward_retry: ForwardRetryPolicy,
    pub forward_queue_capacity: usize,
    pub health: HealthPolicy,
    pub timestamp_policy: TimestampPolicy,
    pub health_bind: SocketAddr,
    pub log_level: String,
    pub log_format: LogFormat,
}

fn invalid(key: &str, value: &str, expected: &str) -> IngestError {
    IngestError::Config(format!("{key}={value:?} is not {expected}"))
}

fn parse<T: FromStr>(key: &str, value: &str, expected: &str) -> IngestResult<T> {
    value.trim().parse().map_err(|_| invalid(key, value, expected))
}

fn parse_bool(key: &str, value: &str) -> IngestResult<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(invalid(key, value, "a boolean")),
    }
}

/// Accept `ws(s)://` as is and rewrite `http(s)://` to the websocket scheme. A bare host gets
/// the standard `/api/websocket` path.
pub fn websocket_url(raw: &str) -> IngestResult<String> {
    let raw = raw.trim().trim_end_matches('/');
    let (scheme, rest) = raw
        .split_once("://")
        .ok_or_else(|| invalid("HOME_ASSISTANT_URL", raw, "an absolute URL"))?;
    let scheme = match scheme.to_ascii_lowercase().as_str() {
        "ws" | "http" => "ws",
        "wss" | "https" => "wss",
        _ => return Err(invalid("HOME_ASSISTANT_URL", raw, "a ws, wss, http or https URL")),
    };
    if rest.is_empty() {
        return Err(invalid("HOME_ASSISTANT_URL", raw, "a URL with a host"));
    }
    if rest.contains('/') {
        Ok(format!("{scheme}://{rest}"))
    } else {
        Ok(format!("{scheme}://{rest}{WEBSOCKET_PATH}"))
    }
}

impl IngestConfig {
    pub fn from_env() -> IngestResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Unset and empty values take defaults; only the token is
    /// required.
    pub fn from_lookup<F>(lookup: F) -> IngestResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let secs = |key: &str, default: u64| -> IngestResult<Duration> {
            match get(key) {
                Some(v) => parse(key, &v, "a whole number of seconds").map(Duration::from_secs),
                None => Ok(Duration::from_secs(default)),
            }
        };
        let millis = |key: &str, default: u64| -> IngestResult<Duration> {
            match get(key) {
                Some(v) => {
                    parse(key, &v, "a whole number of milliseconds").map(Duration::from_millis)
                }
                None => Ok(Duration::from_millis(default)),
            }
        };

        let home_assistant_url = websocket_url(
            &get("HOME_ASSISTANT_URL").unwrap_or_else(|| DEFAULT_HOME_ASSISTANT_URL.to_string()),
        )?;
        let token = get("HOME_ASSISTANT_TOKEN")
            .map(|t| t.trim().to_string())
            .ok_or_else(|| IngestError::Config("HOME_ASSISTANT_TOKEN is required".to_string()))?;
        let event_filter = get("HA_EVENT_TYPE")
            .map(|v| EventFilter::parse(&v))
            .unwrap_or_default();

        let max_retry_attempts = match get("MAX_RETRY_ATTEMPTS") {
            Some(v) => MaxAttempts::from_signed(parse("MAX_RETRY_ATTEMPTS", &v, "an integer")?),
            None => MaxAttempts::Unbounded,
        };
        let reconnect_jitter = match get("RECONNECT_JITTER") {
            Some(v) => parse_bool("RECONNECT_JITTER", &v)?,
            None => false,
        };

        let timeouts = ConnectionTimeouts {
            connect: secs("CONNECT_TIMEOUT_SECS", 10)?,
            read: secs("READ_TIMEOUT_SECS", 90)?,
            auth: secs("AUTH_TIMEOUT_SECS", 10)?,
            subscribe: secs("SUBSCRIBE_TIMEOUT_SECS", 10)?,
            ..ConnectionTimeouts::default()
        };

        let max_message_bytes = match get("MAX_MESSAGE_BYTES") {
            Some(v) => parse("MAX_MESSAGE_BYTES", &v, "a byte count")?,
            None => 4 * 1024 * 1024,
        };
        if max_message_bytes == 0 {
            return Err(invalid("MAX_MESSAGE_BYTES", "0", "a positive byte count"));
        }

        let forward_retry = ForwardRetryPolicy {
            attempts: match get("FORWARD_RETRY_COUNT") {
                Some(v) => parse("FORWARD_RETRY_COUNT", &v, "a non-negative integer")?,
                None => 3,
            },
            initial_delay: millis("FORWARD_RETRY_DELAY_MS", 250)?,
            ..ForwardRetryPolicy::default()
        };
        let forward_queue_capacity = match get("FORWARD_QUEUE_CAPACITY") {
            Some(v) => parse("FORWARD_QUEUE_CAPACITY", &v, "a positive integer")?,
            None => 1024,
        };

        let forward_failure_degraded_rate = match get("FORWARD_FAILURE_DEGRADED_RATE") {
            Some(v) => {
                let rate: f64 = parse("FORWARD_FAILURE_DEGRADED_RATE", &v, "a ratio")?;
                if !(0.0..=1.0).contains(&rate) {
                    return Err(invalid("FORWARD_FAILURE_DEGRADED_RATE", &v, "between 0 and 1"));
                }
                Some(rate)
            }
            None => None,
        };
        let timestamp_policy = match get("TIMESTAMP_POLICY") {
            None => TimestampPolicy::InferMissing,
            Some(v) => match v.trim().to_ascii_lowercase().as_str() {
                "infer" => TimestampPolicy::InferMissing,
                "require" => TimestampPolicy::Require,
                _ => return Err(invalid("TIMESTAMP_POLICY", &v, "`infer` or `require`")),
            },
        };

        let health_bind = match get("HEALTH_BIND") {
            Some(v) => parse("HEALTH_BIND", &v, "a socket address")?,
            None => SocketAddr::from(([0, 0, 0, 0], 8001)),
        };
        let log_format = match get("LOG_FORMAT").map(|v| v.trim().to_ascii_lowercase()) {
            None => LogFormat::Pretty,
            Some(v) if v == "pretty" => LogFormat::Pretty,
            Some(v) if v == "json" => LogFormat::Json,
            Some(v) => return Err(invalid("LOG_FORMAT", &v, "`json` or `pretty`")),
        };

        Ok(Self {
            home_assistant_url,
            token,
            event_filter,
            max_retry_attempts,
            retry_base_delay: millis("RETRY_BASE_DELAY_MS", 1000)?,
            max_retry_delay: secs("MAX_RETRY_DELAY_SECS", 300)?,
            reconnect_jitter,
            timeouts,
            heartbeat_interval: secs("HEARTBEAT_INTERVAL_SECS", 30)?,
            heartbeat_timeout: secs("HEARTBEAT_TIMEOUT_SECS", 10)?,
            max_message_bytes,
            enrichment_url: get("ENRICHMENT_SERVICE_URL")
                .unwrap_or_else(|| DEFAULT_ENRICHMENT_URL.to_string()),
            forward_timeout: secs("FORWARD_TIMEOUT_SECS", 5)?,
            forward_retry,
            forward_queue_capacity,
            health: HealthPolicy {
                staleness_window: secs("STALENESS_WINDOW_SECS", 300)?,
                forward_failure_degraded_rate,
            },
            timestamp_policy,
            health_bind,
            log_level: get("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            log_format,
        })
    }

    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff::new(
            self.retry_base_delay,
            self.max_retry_delay,
            self.max_retry_attempts,
        )
    }

    pub fn http_sink(&self) -> IngestResult<HttpSink> {
        HttpSink::new(&self.enrichment_url, self.forward_timeout)
    }

    pub fn actor_args<T: WsTransport>(
        &self,
        transport: T,
        forwarder: Forwarder,
    ) -> IngestActorArgs<T> {
        IngestActorArgs {
            filter: self.event_filter.clone(),
            backoff: self.backoff(),
            jitter: self.reconnect_jitter,
            timeouts: self.timeouts,
            heartbeat_interval: self.heartbeat_interval,
            heartbeat_timeout: self.heartbeat_timeout,
            buffers: WebSocketBufferConfig {
                // Transport limit stays above the violation threshold so oversized frames
                // reach the codec and get counted.
                max_message_bytes: self
                    .max_message_bytes
                    .saturating_mul(2)
                    .max(WebSocketBufferConfig::default().max_message_bytes),
                ..WebSocketBufferConfig::default()
            },
            max_message_bytes: self.max_message_bytes,
            timestamp_policy: self.timestamp_policy,
            health_policy: self.health,
            forward_queue_capacity: self.forward_queue_capacity,
            ..IngestActorArgs::new(
                self.home_assistant_url.clone(),
                self.token.clone(),
                transport,
                forwarder,
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config(pairs: &[(&str, &str)]) -> IngestResult<IngestConfig> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        IngestConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_with_only_a_token() {
        let cfg = config(&[("HOME_ASSISTANT_TOKEN", "secret")]).unwrap();
        assert_eq!(cfg.home_assistant_url, DEFAULT_HOME_ASSISTANT_URL);
        assert_eq!(cfg.token, "secret");
        assert_eq!(cfg.event_filter, EventFilter::Type("state_changed".into()));
        assert_eq!(cfg.max_retry_attempts, MaxAttempts::Unbounded);
        assert_eq!(cfg.retry_base_delay, Duration::from_secs(1));
        assert_eq!(cfg.max_retry_delay, Duration::from_secs(300));
        assert!(!cfg.reconnect_jitter);
        assert_eq!(cfg.timeouts.read, Duration::from_secs(90));
        assert_eq!(cfg.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(cfg.max_message_bytes, 4 * 1024 * 1024);
        assert_eq!(cfg.enrichment_url, DEFAULT_ENRICHMENT_URL);
        assert_eq!(cfg.forward_retry.attempts, 3);
        assert_eq!(cfg.forward_retry.initial_delay, Duration::from_millis(250));
        assert_eq!(cfg.forward_queue_capacity, 1024);
        assert_eq!(cfg.health.staleness_window, Duration::from_secs(300));
        assert_eq!(cfg.health.forward_failure_degraded_rate, None);
        assert_eq!(cfg.timestamp_policy, TimestampPolicy::InferMissing);
        assert_eq!(cfg.health_bind, "0.0.0.0:8001".parse().unwrap());
        assert_eq!(cfg.log_format, LogFormat::Pretty);
    }

    #[test]
    fn token_is_required() {
        assert!(matches!(config(&[]), Err(IngestError::Config(_))));
        assert!(matches!(
            config(&[("HOME_ASSISTANT_TOKEN", "  ")]),
            Err(IngestError::Config(_))
        ));
    }

    #[test]
    fn overrides_are_applied() {
        let cfg = config(&[
            ("HOME_ASSISTANT_TOKEN", "t"),
            ("HOME_ASSISTANT_URL", "https://ha.example.com"),
            ("HA_EVENT_TYPE", "*"),
            ("MAX_RETRY_ATTEMPTS", "5"),
            ("RECONNECT_JITTER", "true"),
            ("HEARTBEAT_INTERVAL_SECS", "0"),
            ("FORWARD_FAILURE_DEGRADED_RATE", "0.25"),
            ("TIMESTAMP_POLICY", "require"),
            ("LOG_FORMAT", "json"),
        ])
        .unwrap();
        assert_eq!(cfg.home_assistant_url, "wss://ha.example.com/api/websocket");
        assert_eq!(cfg.event_filter, EventFilter::All);
        assert_eq!(cfg.max_retry_attempts, MaxAttempts::Limited(5));
        assert!(cfg.reconnect_jitter);
        assert!(cfg.heartbeat_interval.is_zero());
        assert_eq!(cfg.health.forward_failure_degraded_rate, Some(0.25));
        assert_eq!(cfg.timestamp_policy, TimestampPolicy::Require);
        assert_eq!(cfg.log_format, LogFormat::Json);
    }

    #[test]
    fn invalid_values_are_errors() {
        for (key, value) in [
            ("READ_TIMEOUT_SECS", "soon"),
            ("RECONNECT_JITTER", "maybe"),
            ("FORWARD_FAILURE_DEGRADED_RATE", "1.5"),
            ("TIMESTAMP_POLICY", "guess"),
            ("HOME_ASSISTANT_URL", "ftp://ha"),
            ("MAX_MESSAGE_BYTES", "0"),
            ("HEALTH_BIND", "nowhere"),
        ] {
            let result = config(&[("HOME_ASSISTANT_TOKEN", "t"), (key, value)]);
            assert!(
                matches!(result, Err(IngestError::Config(_))),
                "{key}={value} accepted"
            );
        }
    }

    #[test]
    fn websocket_url_normalization() {
        assert_eq!(
            websocket_url("http://homeassistant.local:8123/").unwrap(),
            "ws://homeassistant.local:8123/api/websocket"
        );
        assert_eq!(
            websocket_url("wss://ha.example.com/custom/ws").unwrap(),
            "wss://ha.example.com/custom/ws"
        );
        assert!(websocket_url("homeassistant.local").is_err());
    }
}
