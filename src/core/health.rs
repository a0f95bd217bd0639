use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::circular_buffer::CircularBuffer;
use super::heartbeat::RttSummary;
use super::types::ConnectionState;

const RATE_WINDOW: Duration = Duration::from_secs(60);
const MAX_WINDOW_SAMPLES: usize = 65_536;
const MAX_RECENT_ERRORS: usize = 20;
const MAX_ERROR_TEXT_BYTES: usize = 1024;

fn truncate_string(s: &str) -> String {
    if s.len() <= MAX_ERROR_TEXT_BYTES {
        return s.to_string();
    }

    let mut end = MAX_ERROR_TEXT_BYTES;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

/// Overall status reported by `/health`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Thresholds that turn counters into a status.
#[derive(Debug, Clone, Copy)]
pub struct HealthPolicy {
    /// Max time since the last event (or since streaming began) before the stream is stale.
    pub staleness_window: Duration,
    /// Lifetime forward failure ratio above which a streaming connection reports degraded.
    /// `None` keeps forwarding out of the status entirely.
    pub forward_failure_degraded_rate: Option<f64>,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self {
            staleness_window: Duration::from_secs(300),
            forward_failure_degraded_rate: None,
        }
    }
}

/// Counters maintained by the forwarding task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ForwardCounts {
    pub forwarded: u64,
    pub failed: u64,
    pub retries: u64,
}

impl ForwardCounts {
    pub fn failure_rate(&self) -> f64 {
        let total = self.forwarded.saturating_add(self.failed);
        if total == 0 {
            0.0
        } else {
            self.failed as f64 / total as f64
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorRecord {
    pub at: DateTime<Utc>,
    pub context: &'static str,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionHealth {
    pub state: ConnectionState,
    pub is_running: bool,
    pub connection_attempts: u64,
    pub successful_connections: u64,
    pub failed_connections: u64,
    pub disconnects: u64,
    pub auth_failures: u64,
    pub last_error: Option<String>,
    pub last_connected_at: Option<DateTime<Utc>>,
    pub recent_errors: Vec<ErrorRecord>,
    pub uptime_seconds: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubscriptionHealth {
    pub is_subscribed: bool,
    pub subscription_id: Option<u64>,
    pub total_events_received: u64,
    pub event_rate_per_minute: f64,
    pub last_event_age_seconds: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineHealth {
    pub events_normalized: u64,
    pub validation_failures: u64,
    pub malformed_messages: u64,
    pub protocol_violations: u64,
    /// Events dropped because the forward queue was full.
    pub forward_dropped: u64,
    pub events_forwarded: u64,
    pub forward_failures: u64,
    pub forward_retries: u64,
    pub forward_failure_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HeartbeatHealth {
    pub rtt_samples: u64,
    pub rtt_p50_us: u64,
    pub rtt_p99_us: u64,
}

/// Read-only view served by the health endpoint.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthSnapshot {
    pub status: HealthStatus,
    pub connection: ConnectionHealth,
    pub subscription: SubscriptionHealth,
    pub pipeline: PipelineHealth,
    pub heartbeat: HeartbeatHealth,
}

/// Aggregates connection and event-flow counters.
///
/// Owned by the connection actor, which is its only writer. Monotonic time is passed in by the
/// caller so windows and staleness can be tested without sleeping.
#[derive(Debug)]
pub struct HealthAggregator {
    policy: HealthPolicy,
    started: Instant,
    state: ConnectionState,
    connection_attempts: u64,
    successful_connections: u64,
    failed_connections: u64,
    disconnects: u64,
    auth_failures: u64,
    subscription_id: Option<u64>,
    subscribed: bool,
    total_events_received: u64,
    events_normalized: u64,
    validation_failures: u64,
    malformed_messages: u64,
    protocol_violations: u64,
    forward_dropped: u64,
    event_window: CircularBuffer<Instant>,
    last_event_at: Option<Instant>,
    streaming_since: Option<Instant>,
    last_error: Option<String>,
    recent_errors: CircularBuffer<ErrorRecord>,
    last_connected_at: Option<DateTime<Utc>>,
}

impl HealthAggregator {
    pub fn new(policy: HealthPolicy, now: Instant) -> Self {
        Self {
            policy,
            started: now,
            state: ConnectionState::Disconnected,
            connection_attempts: 0,
            successful_connections: 0,
            failed_connections: 0,
            disconnects: 0,
            auth_failures: 0,
            subscription_id: None,
            subscribed: false,
            total_events_received: 0,
            events_normalized: 0,
            validation_failures: 0,
            malformed_messages: 0,
            protocol_violations: 0,
            forward_dropped: 0,
            event_window: CircularBuffer::new(MAX_WINDOW_SAMPLES),
            last_event_at: None,
            streaming_since: None,
            last_error: None,
            recent_errors: CircularBuffer::new(MAX_RECENT_ERRORS),
            last_connected_at: None,
        }
    }

    pub fn record_state(&mut self, state: ConnectionState, now: Instant) {
        self.state = state;
        if state == ConnectionState::Streaming {
            self.streaming_since = Some(now);
        } else {
            self.streaming_since = None;
            self.subscribed = false;
        }
    }

    pub fn record_connection_attempt(&mut self) {
        self.connection_attempts = self.connection_attempts.saturating_add(1);
    }

    /// A connection counts as successful once it is authenticated and subscribed.
    pub fn record_connection_success(&mut self) {
        self.successful_connections = self.successful_connections.saturating_add(1);
        self.last_connected_at = Some(Utc::now());
    }

    /// An attempt that failed before reaching streaming.
    pub fn record_connection_failure(&mut self, error: &str, auth_rejected: bool) {
        self.failed_connections = self.failed_connections.saturating_add(1);
        if auth_rejected {
            self.auth_failures = self.auth_failures.saturating_add(1);
        }
        self.record_error("connect", error);
    }

    /// A streaming connection that dropped.
    pub fn record_disconnect(&mut self, error: &str) {
        self.disconnects = self.disconnects.saturating_add(1);
        self.record_error("stream", error);
    }

    pub fn record_error(&mut self, context: &'static str, error: &str) {
        let message = truncate_string(error);
        self.last_error = Some(message.clone());
        self.recent_errors.push(ErrorRecord {
            at: Utc::now(),
            context,
            message,
        });
    }

    pub fn record_subscription(&mut self, id: u64, acknowledged: bool) {
        self.subscription_id = Some(id);
        self.subscribed = acknowledged;
    }

    pub fn record_event_received(&mut self, now: Instant) {
        self.total_events_received = self.total_events_received.saturating_add(1);
        self.last_event_at = Some(now);
        self.event_window.push(now);
        self.event_window
            .prune_front_while(|t| now.saturating_duration_since(*t) > RATE_WINDOW);
    }

    pub fn record_normalized(&mut self) {
        self.events_normalized = self.events_normalized.saturating_add(1);
    }

    pub fn record_validation_failure(&mut self) {
        self.validation_failures = self.validation_failures.saturating_add(1);
    }

    pub fn record_malformed(&mut self) {
        self.malformed_messages = self.malformed_messages.saturating_add(1);
    }

    pub fn record_protocol_violation(&mut self, detail: &str) {
        self.protocol_violations = self.protocol_violations.saturating_add(1);
        self.record_error("protocol", detail);
    }

    pub fn record_forward_dropped(&mut self) {
        self.forward_dropped = self.forward_dropped.saturating_add(1);
    }

    /// Events received in the trailing 60 seconds.
    pub fn events_per_minute(&self, now: Instant) -> f64 {
        self.event_window
            .iter()
            .rev()
            .take_while(|t| now.saturating_duration_since(**t) <= RATE_WINDOW)
            .count() as f64
    }

    pub fn status(&self, now: Instant, forward: ForwardCounts) -> HealthStatus {
        if self.state != ConnectionState::Streaming {
            return HealthStatus::Unhealthy;
        }

        let last_activity = match (self.last_event_at, self.streaming_since) {
            (Some(event), Some(since)) => Some(event.max(since)),
            (event, since) => event.or(since),
        };
        let stale = last_activity
            .map(|t| now.saturating_duration_since(t) > self.policy.staleness_window)
            .unwrap_or(true);
        if stale {
            return HealthStatus::Degraded;
        }

        if let Some(threshold) = self.policy.forward_failure_degraded_rate
            && forward.failure_rate() > threshold
        {
            return HealthStatus::Degraded;
        }

        HealthStatus::Healthy
    }

    pub fn snapshot(&self, now: Instant, forward: ForwardCounts, rtt: RttSummary) -> HealthSnapshot {
        HealthSnapshot {
            status: self.status(now, forward),
            connection: ConnectionHealth {
                state: self.state,
                is_running: self.state.is_running(),
                connection_attempts: self.connection_attempts,
                successful_connections: self.successful_connections,
                failed_connections: self.failed_connections,
                disconnects: self.disconnects,
                auth_failures: self.auth_failures,
                last_error: self.last_error.clone(),
                last_connected_at: self.last_connected_at,
                recent_errors: self.recent_errors.iter().cloned().collect(),
                uptime_seconds: now.saturating_duration_since(self.started).as_secs(),
            },
            subscription: SubscriptionHealth {
                is_subscribed: self.subscribed,
                subscription_id: self.subscription_id,
                total_events_received: self.total_events_received,
                event_rate_per_minute: self.events_per_minute(now),
                last_event_age_seconds: self
                    .last_event_at
                    .map(|t| now.saturating_duration_since(t).as_secs_f64()),
            },
            pipeline: PipelineHealth {
                events_normalized: self.events_normalized,
                validation_failures: self.validation_failures,
                malformed_messages: self.malformed_messages,
                protocol_violations: self.protocol_violations,
                forward_dropped: self.forward_dropped,
                events_forwarded: forward.forwarded,
                forward_failures: forward.failed,
                forward_retries: forward.retries,
                forward_failure_rate: forward.failure_rate(),
            },
            heartbeat: HeartbeatHealth {
                rtt_samples: rtt.samples,
                rtt_p50_us: rtt.p50_us,
                rtt_p99_us: rtt.p99_us,
            },
        }
    }
}
