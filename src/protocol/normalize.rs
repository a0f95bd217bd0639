use chrono::{DateTime, Utc};
use serde::Serialize;
use sonic_rs::{JsonValueTrait, Value};
use thiserror::Error;
use uuid::Uuid;

use super::codec::RawEvent;

pub const EVENT_SOURCE: &str = "home_assistant";

/// What to do with an event that carries no usable timestamp.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TimestampPolicy {
    /// Stamp processing time and flag the event as inferred.
    #[default]
    InferMissing,
    /// Reject the event.
    Require,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("event has no entity_id")]
    MissingEntityId,
    #[error("event has no event_type")]
    MissingEventType,
    #[error("event has no usable timestamp")]
    MissingTimestamp,
}

/// Canonical event handed to the forwarding client.
///
/// `event_id` is freshly generated per event. Home Assistant reuses one context id for every
/// state change a single action causes, so that id is carried separately as `context_id`.
#[derive(Debug, Clone, Serialize)]
pub struct NormalizedEvent {
    pub event_id: String,
    pub context_id: Option<String>,
    pub entity_id: String,
    pub domain: String,
    pub event_type: String,
    pub old_state: Option<Value>,
    pub new_state: Option<Value>,
    pub timestamp: DateTime<Utc>,
    pub timestamp_inferred: bool,
    pub source: &'static str,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.trim().is_empty())
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

fn state_timestamp(state: Option<&Value>, field: &str) -> Option<DateTime<Utc>> {
    state
        .and_then(|s| s.get(field))
        .and_then(|v| v.as_str())
        .and_then(parse_timestamp)
}

/// Validate a raw event and convert it to a [`NormalizedEvent`].
///
/// The timestamp comes from `time_fired`, then `new_state.last_updated`, then
/// `new_state.last_changed`. Unparseable values count as absent.
pub fn normalize(
    event: RawEvent,
    policy: TimestampPolicy,
    now: DateTime<Utc>,
) -> Result<NormalizedEvent, ValidationError> {
    let RawEvent {
        event_type,
        time_fired,
        data,
        context,
        origin: _,
    } = event;
    let data = data.unwrap_or_default();

    let entity_id = non_empty(data.entity_id).ok_or(ValidationError::MissingEntityId)?;
    let event_type = non_empty(event_type).ok_or(ValidationError::MissingEventType)?;

    let observed = time_fired
        .as_deref()
        .and_then(parse_timestamp)
        .or_else(|| state_timestamp(data.new_state.as_ref(), "last_updated"))
        .or_else(|| state_timestamp(data.new_state.as_ref(), "last_changed"));
    let (timestamp, timestamp_inferred) = match (observed, policy) {
        (Some(ts), _) => (ts, false),
        (None, TimestampPolicy::InferMissing) => (now, true),
        (None, TimestampPolicy::Require) => return Err(ValidationError::MissingTimestamp),
    };

    let context_id = non_empty(context.and_then(|c| c.id));
    let domain = entity_id
        .split_once('.')
        .map(|(domain, _)| domain)
        .unwrap_or(entity_id.as_str())
        .to_string();

    Ok(NormalizedEvent {
        event_id: Uuid::new_v4().to_string(),
        context_id,
        entity_id,
        domain,
        event_type,
        old_state: data.old_state,
        new_state: data.new_state,
        timestamp,
        timestamp_inferred,
        source: EVENT_SOURCE,
    })
}
