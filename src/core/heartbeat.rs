use std::time::{Duration, Instant};

use hdrhistogram::Histogram;

/// Result of matching an inbound `pong` against the outstanding ping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PongResult {
    Matched(Duration),
    Unexpected,
}

/// Application-level heartbeat over the upstream `ping`/`pong` commands.
///
/// Only one ping is outstanding at a time. If its pong does not arrive within `timeout` the
/// connection is considered dead even though the socket may still look open.
#[derive(Debug)]
pub struct Heartbeat {
    interval: Duration,
    timeout: Duration,
    pending: Option<(u64, Instant)>,
    rtt_us: Histogram<u64>,
}

/// Ping round-trip percentiles, in microseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RttSummary {
    pub samples: u64,
    pub p50_us: u64,
    pub p99_us: u64,
}

impl Heartbeat {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self {
            interval,
            timeout,
            pending: None,
            rtt_us: new_histogram(),
        }
    }

    /// Zero interval disables the heartbeat.
    pub fn enabled(&self) -> bool {
        !self.interval.is_zero()
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Record that ping `id` was written at `now`. Returns false when a ping is already in
    /// flight, in which case nothing should be sent.
    pub fn on_ping_sent(&mut self, id: u64, now: Instant) -> bool {
        if self.pending.is_some() {
            return false;
        }
        self.pending = Some((id, now));
        true
    }

    pub fn on_pong(&mut self, id: u64, now: Instant) -> PongResult {
        match self.pending {
            Some((pending_id, sent_at)) if pending_id == id => {
                self.pending = None;
                let rtt = now.saturating_duration_since(sent_at);
                let micros = rtt.as_micros().min(u64::MAX as u128) as u64;
                let _ = self.rtt_us.record(micros.max(1));
                PongResult::Matched(rtt)
            }
            _ => PongResult::Unexpected,
        }
    }

    /// True when the outstanding ping has waited longer than the timeout.
    pub fn is_overdue(&self, now: Instant) -> bool {
        self.pending
            .map(|(_, sent_at)| now.saturating_duration_since(sent_at) > self.timeout)
            .unwrap_or(false)
    }

    /// Forget the outstanding ping; RTT history survives reconnects.
    pub fn reset(&mut self) {
        self.pending = None;
    }

    pub fn rtt_summary(&self) -> RttSummary {
        let samples = self.rtt_us.len();
        if samples == 0 {
            return RttSummary::default();
        }
        RttSummary {
            samples,
            p50_us: self.rtt_us.value_at_percentile(50.0),
            p99_us: self.rtt_us.value_at_percentile(99.0),
        }
    }
}

fn new_histogram() -> Histogram<u64> {
    // 1us..=60s, 3 significant digits.
    Histogram::new_with_bounds(1, 60_000_000, 3).expect("histogram bounds are valid")
}
