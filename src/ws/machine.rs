use crate::core::{
    ConnectionState, ExponentialBackoff, IngestError, IngestResult, RetryDecision,
};

/// Connection lifecycle and retry bookkeeping with no IO.
///
/// The actor drives this from transport callbacks; every edge is validated so a late callback
/// can never move the connection somewhere it should not be.
#[derive(Debug, Clone)]
pub struct ConnectionMachine {
    state: ConnectionState,
    backoff: ExponentialBackoff,
}

impl ConnectionMachine {
    pub fn new(backoff: ExponentialBackoff) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            backoff,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn attempt(&self) -> u32 {
        self.backoff.attempt()
    }

    fn transition(&mut self, to: ConnectionState) -> IngestResult<ConnectionState> {
        let from = self.state;
        if !from.can_transition_to(to) {
            return Err(IngestError::InvalidTransition { from, to });
        }
        self.state = to;
        Ok(from)
    }

    /// `Disconnected -> Connecting`. Returns false (and changes nothing) when already running
    /// or terminal.
    pub fn start(&mut self) -> bool {
        if self.state != ConnectionState::Disconnected {
            return false;
        }
        self.state = ConnectionState::Connecting;
        true
    }

    /// `Reconnecting -> Connecting`.
    pub fn backoff_elapsed(&mut self) -> IngestResult<()> {
        self.transition(ConnectionState::Connecting).map(|_| ())
    }

    /// `Connecting -> Authenticating`.
    pub fn transport_connected(&mut self) -> IngestResult<()> {
        self.transition(ConnectionState::Authenticating).map(|_| ())
    }

    /// `Authenticating -> Subscribing`.
    pub fn authenticated(&mut self) -> IngestResult<()> {
        self.transition(ConnectionState::Subscribing).map(|_| ())
    }

    /// `Subscribing -> Streaming`. Resets the retry counter.
    pub fn subscribed(&mut self) -> IngestResult<()> {
        self.transition(ConnectionState::Streaming)?;
        self.backoff.reset();
        Ok(())
    }

    /// The current attempt or live connection failed. Moves to `Reconnecting` with the next
    /// delay, or to `Failed` once a finite attempt budget is spent.
    pub fn fail(&mut self) -> IngestResult<RetryDecision> {
        let from = self.state;
        if !from.can_transition_to(ConnectionState::Reconnecting) {
            return Err(IngestError::InvalidTransition {
                from,
                to: ConnectionState::Reconnecting,
            });
        }
        let decision = self.backoff.on_failure();
        self.state = match decision {
            RetryDecision::Retry { .. } => ConnectionState::Reconnecting,
            RetryDecision::Exhausted { .. } => ConnectionState::Failed,
        };
        Ok(decision)
    }

    /// Any state but `ShuttingDown` itself. Returns false if already shutting down.
    pub fn shutdown(&mut self) -> bool {
        self.transition(ConnectionState::ShuttingDown).is_ok()
    }
}

impl Default for ConnectionMachine {
    fn default() -> Self {
        Self::new(ExponentialBackoff::default())
    }
}
