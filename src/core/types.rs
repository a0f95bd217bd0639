use std::fmt;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

/// Convenience result alias for ingestion operations.
pub type IngestResult<T> = Result<T, IngestError>;

/// Canonical error surface for the connection layer.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Transport error ({context}): {error}")]
    TransportError {
        context: &'static str,
        error: String,
    },

    #[error("Invalid state transition: {from} -> {to}")]
    InvalidTransition {
        from: ConnectionState,
        to: ConnectionState,
    },

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Lifecycle of the single upstream connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Authenticating,
    Subscribing,
    Streaming,
    Reconnecting,
    ShuttingDown,
    Failed,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Authenticating => "authenticating",
            ConnectionState::Subscribing => "subscribing",
            ConnectionState::Streaming => "streaming",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::ShuttingDown => "shutting_down",
            ConnectionState::Failed => "failed",
        }
    }

    /// Terminal states never leave; no reconnection is scheduled from them.
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::ShuttingDown | ConnectionState::Failed)
    }

    /// True while the client owns, or is working towards, a live connection.
    pub fn is_running(self) -> bool {
        !matches!(
            self,
            ConnectionState::Disconnected | ConnectionState::ShuttingDown | ConnectionState::Failed
        )
    }

    /// Whether `self -> to` is an edge of the connection lifecycle.
    pub fn can_transition_to(self, to: ConnectionState) -> bool {
        use ConnectionState::*;

        if to == ShuttingDown {
            return self != ShuttingDown;
        }
        matches!(
            (self, to),
            (Disconnected, Connecting)
                | (Reconnecting, Connecting)
                | (Connecting, Authenticating)
                | (Authenticating, Subscribing)
                | (Subscribing, Streaming)
                | (Connecting, Reconnecting)
                | (Authenticating, Reconnecting)
                | (Subscribing, Reconnecting)
                | (Streaming, Reconnecting)
                | (Connecting, Failed)
                | (Authenticating, Failed)
                | (Subscribing, Failed)
                | (Streaming, Failed)
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why the current connection attempt (or live connection) ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectCause {
    ConnectFailed { error: String },
    ConnectTimeout,
    AuthInvalid { message: String },
    AuthTimeout,
    SubscriptionRejected { message: String },
    SubscriptionTimeout,
    RemoteClosed { reason: String },
    ReadFailure { error: String },
    ReadTimeout,
    HeartbeatTimeout,
    WriteFailure { error: String },
    ProtocolDesync { reason: String },
}

impl DisconnectCause {
    /// Credential problems are retried like everything else but logged louder.
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, DisconnectCause::AuthInvalid { .. })
    }
}

impl fmt::Display for DisconnectCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectCause::ConnectFailed { error } => write!(f, "connect failed: {error}"),
            DisconnectCause::ConnectTimeout => f.write_str("connect timed out"),
            DisconnectCause::AuthInvalid { message } => {
                write!(f, "authentication rejected: {message}")
            }
            DisconnectCause::AuthTimeout => f.write_str("authentication timed out"),
            DisconnectCause::SubscriptionRejected { message } => {
                write!(f, "subscription rejected: {message}")
            }
            DisconnectCause::SubscriptionTimeout => f.write_str("subscription timed out"),
            DisconnectCause::RemoteClosed { reason } => write!(f, "remote closed: {reason}"),
            DisconnectCause::ReadFailure { error } => write!(f, "read error: {error}"),
            DisconnectCause::ReadTimeout => f.write_str("read timed out"),
            DisconnectCause::HeartbeatTimeout => f.write_str("heartbeat pong overdue"),
            DisconnectCause::WriteFailure { error } => write!(f, "write error: {error}"),
            DisconnectCause::ProtocolDesync { reason } => write!(f, "protocol desync: {reason}"),
        }
    }
}

/// Transport-level buffer and frame limits handed to the websocket implementation.
#[derive(Clone, Copy, Debug)]
pub struct WebSocketBufferConfig {
    pub write_buffer_bytes: usize,
    pub max_write_buffer_bytes: usize,
    /// Hard ceiling enforced by the transport. Frames above the codec limit but below this one
    /// are still delivered so they can be counted as protocol violations instead of killing the
    /// connection.
    pub max_message_bytes: usize,
}

impl Default for WebSocketBufferConfig {
    fn default() -> Self {
        Self {
            write_buffer_bytes: 128 << 10,
            max_write_buffer_bytes: 256 << 10,
            max_message_bytes: 64 * 1024 * 1024,
        }
    }
}

/// Timeouts used by the connection actor. All are independently configurable.
#[derive(Clone, Copy, Debug)]
pub struct ConnectionTimeouts {
    pub connect: Duration,
    pub read: Duration,
    pub auth: Duration,
    pub subscribe: Duration,
    /// Grace period for the reader task and the close handshake when stopping.
    pub shutdown_grace: Duration,
    /// How long stop waits for queued events to be forwarded.
    pub forward_drain: Duration,
}

impl Default for ConnectionTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(10),
            read: Duration::from_secs(90),
            auth: Duration::from_secs(10),
            subscribe: Duration::from_secs(10),
            shutdown_grace: Duration::from_secs(2),
            forward_drain: Duration::from_secs(10),
        }
    }
}
