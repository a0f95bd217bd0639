//! Delivery of normalized events to the downstream enrichment pipeline.
//!
//! Events leave the connection actor through a bounded channel and are forwarded one at a time
//! by a single task, so downstream sees them in receipt order.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::core::ForwardCounts;
use crate::protocol::NormalizedEvent;

pub mod http;

pub use http::HttpSink;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ForwardError {
    #[error("request timed out")]
    Timeout,
    #[error("downstream returned HTTP {0}")]
    Status(u16),
    #[error("downstream rejected event: {0}")]
    Rejected(String),
    #[error("unreadable downstream response: {0}")]
    InvalidResponse(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("failed to encode event: {0}")]
    Encode(String),
}

/// One delivery attempt of one event.
#[async_trait]
pub trait EventSink: Send + Sync {
    fn name(&self) -> &'static str;

    async fn deliver(&self, event: &NormalizedEvent) -> Result<(), ForwardError>;
}

/// Bounded retry for a single event.
#[derive(Debug, Clone, Copy)]
pub struct ForwardRetryPolicy {
    /// Total attempts, including the first. Zero is treated as one.
    pub attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ForwardRetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl ForwardRetryPolicy {
    /// Delay before the `retry`-th retry (1-based): `initial * 2^(retry-1)`, capped.
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32.checked_shl(retry - 1).unwrap_or(u32::MAX);
        self.initial_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Lock-free forwarding counters, shared with the health snapshot.
#[derive(Debug, Default)]
pub struct ForwardStats {
    forwarded: AtomicU64,
    failed: AtomicU64,
    retries: AtomicU64,
}

impl ForwardStats {
    pub fn counts(&self) -> ForwardCounts {
        ForwardCounts {
            forwarded: self.forwarded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
        }
    }
}

#[derive(Clone)]
pub struct Forwarder {
    sink: Arc<dyn EventSink>,
    policy: ForwardRetryPolicy,
    stats: Arc<ForwardStats>,
}

impl Forwarder {
    pub fn new(sink: Arc<dyn EventSink>, policy: ForwardRetryPolicy) -> Self {
        Self {
            sink,
            policy,
            stats: Arc::new(ForwardStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<ForwardStats> {
        Arc::clone(&self.stats)
    }

    /// Deliver one event, retrying within the policy budget. Returns false once the budget is
    /// spent; the event is then dropped and counted as a failure.
    pub async fn forward(&self, event: &NormalizedEvent) -> bool {
        let attempts = self.policy.attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            if attempt > 1 {
                let delay = self.policy.delay_for_retry(attempt - 1);
                self.stats.retries.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    sink = self.sink.name(),
                    event_id = %event.event_id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "retrying forward"
                );
                tokio::time::sleep(delay).await;
            }

            match self.sink.deliver(event).await {
                Ok(()) => {
                    self.stats.forwarded.fetch_add(1, Ordering::Relaxed);
                    if attempt > 1 {
                        tracing::info!(
                            sink = self.sink.name(),
                            event_id = %event.event_id,
                            attempt,
                            "forward recovered after retry"
                        );
                    }
                    return true;
                }
                Err(e) => {
                    tracing::warn!(
                        sink = self.sink.name(),
                        event_id = %event.event_id,
                        entity_id = %event.entity_id,
                        attempt,
                        max_attempts = attempts,
                        error = %e,
                        "forward failed"
                    );
                    last_error = Some(e);
                }
            }
        }

        self.stats.failed.fetch_add(1, Ordering::Relaxed);
        tracing::error!(
            sink = self.sink.name(),
            event_id = %event.event_id,
            entity_id = %event.entity_id,
            error = ?last_error,
            "dropping event after exhausting forward retries"
        );
        false
    }
}

/// Drain `rx` sequentially until every sender is dropped.
pub fn spawn_forwarding_task(
    forwarder: Forwarder,
    mut rx: mpsc::Receiver<NormalizedEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            forwarder.forward(&event).await;
        }
        tracing::debug!("forwarding task drained");
    })
}
