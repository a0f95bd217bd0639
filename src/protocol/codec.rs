use serde::{Deserialize, Serialize};
use sonic_rs::Value;
use thiserror::Error;

use crate::core::{IngestError, IngestResult, WsFrame};

/// Which upstream events to subscribe to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventFilter {
    All,
    Type(String),
}

impl EventFilter {
    /// `*` and `all` (any case) select every event type.
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        if raw == "*" || raw.eq_ignore_ascii_case("all") {
            EventFilter::All
        } else {
            EventFilter::Type(raw.to_string())
        }
    }
}

impl Default for EventFilter {
    fn default() -> Self {
        EventFilter::Type("state_changed".to_string())
    }
}

/// Frames that violate transport limits. Counted separately from malformed JSON.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolViolation {
    #[error("message of {len} bytes exceeds limit of {max} bytes")]
    Oversized { len: usize, max: usize },
}

/// Upstream `context` block; only the id is used.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawContext {
    pub id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawEventData {
    pub entity_id: Option<String>,
    pub old_state: Option<Value>,
    pub new_state: Option<Value>,
}

/// Event payload as received. Every field is optional; validation happens in the normalizer.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawEvent {
    pub event_type: Option<String>,
    pub time_fired: Option<String>,
    pub data: Option<RawEventData>,
    pub context: Option<RawContext>,
    pub origin: Option<String>,
}

/// Decoded upstream message.
#[derive(Debug, Clone)]
pub enum ParsedMessage {
    AuthRequired {
        ha_version: Option<String>,
    },
    AuthOk {
        ha_version: Option<String>,
    },
    AuthInvalid {
        message: String,
    },
    SubscriptionResult {
        id: u64,
        success: bool,
        error: Option<String>,
    },
    /// `id` echoes the subscription command; some servers and relays omit it.
    Event {
        id: Option<u64>,
        event: RawEvent,
    },
    Pong {
        id: u64,
    },
    /// Well-formed message of a type the client does not act on.
    Other {
        kind: String,
    },
    Unknown {
        reason: String,
    },
}

impl ParsedMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ParsedMessage::AuthRequired { .. } => "auth_required",
            ParsedMessage::AuthOk { .. } => "auth_ok",
            ParsedMessage::AuthInvalid { .. } => "auth_invalid",
            ParsedMessage::SubscriptionResult { .. } => "result",
            ParsedMessage::Event { .. } => "event",
            ParsedMessage::Pong { .. } => "pong",
            ParsedMessage::Other { .. } => "other",
            ParsedMessage::Unknown { .. } => "unknown",
        }
    }
}

#[derive(Debug, Deserialize)]
struct ResultError {
    code: Option<Value>,
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: Option<String>,
    id: Option<u64>,
    success: Option<bool>,
    message: Option<String>,
    ha_version: Option<String>,
    error: Option<ResultError>,
    event: Option<RawEvent>,
}

#[derive(Serialize)]
struct AuthCommand<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    access_token: &'a str,
}

#[derive(Serialize)]
struct IdCommand<'a> {
    id: u64,
    #[serde(rename = "type")]
    kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    event_type: Option<&'a str>,
}

fn encode<T: Serialize>(value: &T) -> IngestResult<WsFrame> {
    sonic_rs::to_vec(value)
        .map(WsFrame::json)
        .map_err(|e| IngestError::TransportError {
            context: "encode",
            error: e.to_string(),
        })
}

/// `{"type":"auth","access_token":...}`
pub fn encode_auth(token: &str) -> IngestResult<WsFrame> {
    encode(&AuthCommand {
        kind: "auth",
        access_token: token,
    })
}

/// `{"id":N,"type":"subscribe_events","event_type":...}`; the filter field is omitted for `All`.
pub fn encode_subscribe(id: u64, filter: &EventFilter) -> IngestResult<WsFrame> {
    let event_type = match filter {
        EventFilter::All => None,
        EventFilter::Type(t) => Some(t.as_str()),
    };
    encode(&IdCommand {
        id,
        kind: "subscribe_events",
        event_type,
    })
}

/// `{"id":N,"type":"ping"}`
pub fn encode_ping(id: u64) -> IngestResult<WsFrame> {
    encode(&IdCommand {
        id,
        kind: "ping",
        event_type: None,
    })
}

fn unknown(reason: impl Into<String>) -> ParsedMessage {
    ParsedMessage::Unknown {
        reason: reason.into(),
    }
}

fn result_error_text(error: ResultError) -> String {
    let code = error.code.map(|c| c.to_string());
    match (code, error.message) {
        (Some(code), Some(message)) => format!("{code}: {message}"),
        (None, Some(message)) => message,
        (Some(code), None) => code,
        (None, None) => "unspecified error".to_string(),
    }
}

/// Decode one upstream text frame.
///
/// Oversized input is a [`ProtocolViolation`]. Anything else that cannot be interpreted
/// (bad JSON, missing `type`, missing `id` where one is required) decodes to
/// [`ParsedMessage::Unknown`] so the caller can count it and keep streaming. Valid messages of
/// an unhandled type decode to [`ParsedMessage::Other`].
pub fn decode(raw: &[u8], max_bytes: usize) -> Result<ParsedMessage, ProtocolViolation> {
    if raw.len() > max_bytes {
        return Err(ProtocolViolation::Oversized {
            len: raw.len(),
            max: max_bytes,
        });
    }

    let envelope: Envelope = match sonic_rs::from_slice(raw) {
        Ok(envelope) => envelope,
        Err(err) => return Ok(unknown(format!("malformed json: {err}"))),
    };
    let Some(kind) = envelope.kind.as_deref() else {
        return Ok(unknown("missing type"));
    };

    let parsed = match kind {
        "auth_required" => ParsedMessage::AuthRequired {
            ha_version: envelope.ha_version,
        },
        "auth_ok" => ParsedMessage::AuthOk {
            ha_version: envelope.ha_version,
        },
        "auth_invalid" => ParsedMessage::AuthInvalid {
            message: envelope
                .message
                .unwrap_or_else(|| "invalid credentials".to_string()),
        },
        "result" => match envelope.id {
            Some(id) => ParsedMessage::SubscriptionResult {
                id,
                success: envelope.success.unwrap_or(false),
                error: envelope.error.map(result_error_text),
            },
            None => unknown("result without id"),
        },
        "event" => match envelope.event {
            Some(event) => ParsedMessage::Event {
                id: envelope.id,
                event,
            },
            None => unknown("event without payload"),
        },
        "pong" => match envelope.id {
            Some(id) => ParsedMessage::Pong { id },
            None => unknown("pong without id"),
        },
        other => ParsedMessage::Other {
            kind: other.to_string(),
        },
    };
    Ok(parsed)
}
