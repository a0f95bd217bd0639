//! Connection actor for the upstream Home Assistant websocket.
//!
//! The read loop runs in its own task; the actor owns the lifecycle, the writer, retry state
//! and the health aggregator, and receives frames and timer expiries as messages. Each
//! connection attempt gets a fresh epoch so messages from an abandoned attempt are ignored.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use kameo::prelude::{Actor, ActorRef, Context, Message as KameoMessage, WeakActorRef};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::machine::ConnectionMachine;
use crate::core::{
    ConnectionState, ConnectionTimeouts, DisconnectCause, ExponentialBackoff, HealthAggregator,
    HealthPolicy, HealthSnapshot, Heartbeat, IngestError, IngestResult, PongResult,
    RetryDecision, WebSocketBufferConfig, WsFrame, data_payload, jitter_delay,
};
use crate::forward::{Forwarder, ForwardStats, spawn_forwarding_task};
use crate::protocol::{
    EventFilter, NormalizedEvent, ParsedMessage, RawEvent, TimestampPolicy, decode, encode_auth,
    encode_ping, encode_subscribe, normalize,
};
use crate::transport::WsTransport;
use crate::transport::tungstenite::TungsteniteTransport;

/// Monotonic clock that follows tokio's test clock when it is paused.
fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

fn duration_ms(d: Duration) -> u64 {
    d.as_millis().min(u64::MAX as u128) as u64
}

/// Arguments passed when spawning an [`IngestActor`].
pub struct IngestActorArgs<T: WsTransport = TungsteniteTransport> {
    pub url: String,
    pub token: String,
    pub filter: EventFilter,
    pub transport: T,
    pub backoff: ExponentialBackoff,
    /// Scale each scheduled reconnect sleep by a random factor in `[0.5, 1.0]`.
    pub jitter: bool,
    pub timeouts: ConnectionTimeouts,
    /// Zero disables the application heartbeat.
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub buffers: WebSocketBufferConfig,
    /// Frames larger than this are counted as protocol violations and skipped.
    pub max_message_bytes: usize,
    pub timestamp_policy: TimestampPolicy,
    pub health_policy: HealthPolicy,
    pub forwarder: Forwarder,
    pub forward_queue_capacity: usize,
}

impl<T: WsTransport> IngestActorArgs<T> {
    pub fn new(
        url: impl Into<String>,
        token: impl Into<String>,
        transport: T,
        forwarder: Forwarder,
    ) -> Self {
        Self {
            url: url.into(),
            token: token.into(),
            filter: EventFilter::default(),
            transport,
            backoff: ExponentialBackoff::default(),
            jitter: false,
            timeouts: ConnectionTimeouts::default(),
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(10),
            buffers: WebSocketBufferConfig::default(),
            max_message_bytes: 4 * 1024 * 1024,
            timestamp_policy: TimestampPolicy::default(),
            health_policy: HealthPolicy::default(),
            forwarder,
            forward_queue_capacity: 1024,
        }
    }
}

pub struct IngestActor<T: WsTransport = TungsteniteTransport> {
    url: String,
    token: String,
    filter: EventFilter,
    transport: T,
    machine: ConnectionMachine,
    jitter: bool,
    timeouts: ConnectionTimeouts,
    buffers: WebSocketBufferConfig,
    max_message_bytes: usize,
    timestamp_policy: TimestampPolicy,
    heartbeat: Heartbeat,
    health: HealthAggregator,
    forward_stats: Arc<ForwardStats>,
    forward_tx: Option<mpsc::Sender<NormalizedEvent>>,
    forward_task: Option<JoinHandle<()>>,
    actor_ref: ActorRef<Self>,
    epoch: u64,
    next_command_id: u64,
    subscription_id: Option<u64>,
    writer: Option<T::Writer>,
    reader_task: Option<JoinHandle<()>>,
    reader_shutdown: Option<watch::Sender<bool>>,
    connect_task: Option<JoinHandle<()>>,
    backoff_task: Option<JoinHandle<()>>,
    handshake_timer: Option<JoinHandle<()>>,
    heartbeat_task: Option<JoinHandle<()>>,
    heartbeat_check_task: Option<JoinHandle<()>>,
}

impl<T: WsTransport> Actor for IngestActor<T> {
    type Args = IngestActorArgs<T>;
    type Error = IngestError;

    fn name() -> &'static str {
        "IngestActor"
    }

    async fn on_start(args: Self::Args, actor_ref: ActorRef<Self>) -> IngestResult<Self> {
        let IngestActorArgs {
            url,
            token,
            filter,
            transport,
            backoff,
            jitter,
            timeouts,
            heartbeat_interval,
            heartbeat_timeout,
            buffers,
            max_message_bytes,
            timestamp_policy,
            health_policy,
            forwarder,
            forward_queue_capacity,
        } = args;

        let forward_stats = forwarder.stats();
        let (forward_tx, forward_rx) = mpsc::channel(forward_queue_capacity.max(1));
        let forward_task = spawn_forwarding_task(forwarder, forward_rx);

        Ok(Self {
            url,
            token,
            filter,
            transport,
            machine: ConnectionMachine::new(backoff),
            jitter,
            timeouts,
            buffers,
            max_message_bytes,
            timestamp_policy,
            heartbeat: Heartbeat::new(heartbeat_interval, heartbeat_timeout),
            health: HealthAggregator::new(health_policy, now()),
            forward_stats,
            forward_tx: Some(forward_tx),
            forward_task: Some(forward_task),
            actor_ref,
            epoch: 0,
            next_command_id: 1,
            subscription_id: None,
            writer: None,
            reader_task: None,
            reader_shutdown: None,
            connect_task: None,
            backoff_task: None,
            handshake_timer: None,
            heartbeat_task: None,
            heartbeat_check_task: None,
        })
    }

    async fn on_stop(
        &mut self,
        _ctx: WeakActorRef<Self>,
        _reason: kameo::error::ActorStopReason,
    ) -> IngestResult<()> {
        self.shutdown().await;
        Ok(())
    }

    fn on_panic(
        &mut self,
        _actor_ref: kameo::actor::WeakActorRef<Self>,
        err: kameo::prelude::PanicError,
    ) -> impl std::future::Future<
        Output = Result<std::ops::ControlFlow<kameo::prelude::ActorStopReason>, Self::Error>,
    > + Send {
        async move {
            // Handler errors are logged; the connection keeps being supervised.
            error!(error = ?err, "IngestActor handler failed");
            Ok(std::ops::ControlFlow::Continue(()))
        }
    }
}

/// Internal events delivered by the reader, connect and timer tasks.
#[derive(Debug)]
pub enum IngestEvent {
    Inbound { epoch: u64, frame: WsFrame },
    Disconnect { epoch: u64, cause: DisconnectCause },
    ConnectFailed { epoch: u64, cause: DisconnectCause },
    HandshakeTimeout { epoch: u64, phase: ConnectionState },
    HeartbeatTick { epoch: u64 },
    HeartbeatCheck { epoch: u64 },
    BackoffElapsed { epoch: u64 },
}

pub(crate) struct ConnectionEstablished<TR: WsTransport> {
    pub(crate) epoch: u64,
    pub(crate) reader: TR::Reader,
    pub(crate) writer: TR::Writer,
}

/// Begin connecting. Replies `Ok(false)` when already running.
#[derive(Debug, Clone, Copy)]
pub struct Start;

/// Cancel any pending reconnect, close the connection and drain the forward queue.
#[derive(Debug, Clone, Copy)]
pub struct Stop;

#[derive(Debug, Clone, Copy)]
pub struct GetHealthSnapshot;

#[derive(Debug, Clone, Copy)]
pub struct GetConnectionState;

impl<T: WsTransport> KameoMessage<Start> for IngestActor<T> {
    type Reply = IngestResult<bool>;

    async fn handle(&mut self, _msg: Start, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        let from = self.machine.state();
        if from.is_terminal() {
            return Err(IngestError::InvalidTransition {
                from,
                to: ConnectionState::Connecting,
            });
        }
        if !self.machine.start() {
            debug!(state = %from, "start ignored; already running");
            return Ok(false);
        }
        info!(url = %self.url, filter = ?self.filter, "starting home assistant ingestion");
        self.begin_connect(from);
        Ok(true)
    }
}

impl<T: WsTransport> KameoMessage<Stop> for IngestActor<T> {
    type Reply = IngestResult<()>;

    async fn handle(&mut self, _msg: Stop, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        self.shutdown().await;
        Ok(())
    }
}

impl<T: WsTransport> KameoMessage<GetHealthSnapshot> for IngestActor<T> {
    type Reply = IngestResult<HealthSnapshot>;

    async fn handle(
        &mut self,
        _msg: GetHealthSnapshot,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        Ok(self.health.snapshot(
            now(),
            self.forward_stats.counts(),
            self.heartbeat.rtt_summary(),
        ))
    }
}

impl<T: WsTransport> KameoMessage<GetConnectionState> for IngestActor<T> {
    type Reply = IngestResult<ConnectionState>;

    async fn handle(
        &mut self,
        _msg: GetConnectionState,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        Ok(self.machine.state())
    }
}

impl<T: WsTransport> KameoMessage<ConnectionEstablished<T>> for IngestActor<T> {
    type Reply = IngestResult<()>;

    async fn handle(
        &mut self,
        msg: ConnectionEstablished<T>,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        let ConnectionEstablished {
            epoch,
            reader,
            writer,
        } = msg;
        if epoch != self.epoch || self.machine.state() != ConnectionState::Connecting {
            debug!(epoch, current = self.epoch, "discarding stale connection");
            return Ok(());
        }
        self.connect_task = None;

        let from = self.machine.state();
        self.machine.transport_connected()?;
        self.record_transition(from);

        self.writer = Some(writer);
        self.spawn_reader(reader);
        self.arm_handshake_timer(ConnectionState::Authenticating, self.timeouts.auth);
        Ok(())
    }
}

impl<T: WsTransport> KameoMessage<IngestEvent> for IngestActor<T> {
    type Reply = IngestResult<()>;

    async fn handle(
        &mut self,
        event: IngestEvent,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        match event {
            IngestEvent::Inbound { epoch, frame } => {
                if epoch == self.epoch {
                    self.process_frame(frame).await;
                }
            }
            IngestEvent::Disconnect { epoch, cause } => {
                if epoch == self.epoch {
                    self.fail(cause).await;
                }
            }
            IngestEvent::ConnectFailed { epoch, cause } => {
                if epoch == self.epoch && self.machine.state() == ConnectionState::Connecting {
                    self.connect_task = None;
                    self.fail(cause).await;
                }
            }
            IngestEvent::HandshakeTimeout { epoch, phase } => {
                if epoch == self.epoch && self.machine.state() == phase {
                    let cause = match phase {
                        ConnectionState::Subscribing => DisconnectCause::SubscriptionTimeout,
                        _ => DisconnectCause::AuthTimeout,
                    };
                    self.fail(cause).await;
                }
            }
            IngestEvent::HeartbeatTick { epoch } => {
                if epoch == self.epoch && self.machine.state() == ConnectionState::Streaming {
                    self.heartbeat_tick().await;
                }
            }
            IngestEvent::HeartbeatCheck { epoch } => {
                if epoch == self.epoch && self.machine.state() == ConnectionState::Streaming {
                    self.heartbeat_check().await;
                }
            }
            IngestEvent::BackoffElapsed { epoch } => {
                if epoch == self.epoch && self.machine.state() == ConnectionState::Reconnecting {
                    self.backoff_task = None;
                    let from = self.machine.state();
                    self.machine.backoff_elapsed()?;
                    self.begin_connect(from);
                }
            }
        }
        Ok(())
    }
}

impl<T: WsTransport> IngestActor<T> {
    fn record_transition(&mut self, from: ConnectionState) {
        let to = self.machine.state();
        self.health.record_state(to, now());
        info!(
            from = %from,
            to = %to,
            epoch = self.epoch,
            attempt = self.machine.attempt(),
            "connection state transition"
        );
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_command_id;
        self.next_command_id = self.next_command_id.wrapping_add(1).max(1);
        id
    }

    /// Called right after the machine entered `Connecting`.
    fn begin_connect(&mut self, from: ConnectionState) {
        self.epoch = self.epoch.wrapping_add(1);
        self.health.record_connection_attempt();
        self.record_transition(from);

        let epoch = self.epoch;
        let actor_ref = self.actor_ref.clone();
        let transport = self.transport.clone();
        let url = self.url.clone();
        let buffers = self.buffers;
        let connect_timeout = self.timeouts.connect;

        self.connect_task = Some(tokio::spawn(async move {
            match tokio::time::timeout(connect_timeout, transport.connect(url, buffers)).await {
                Ok(Ok((reader, writer))) => {
                    let _ = actor_ref
                        .tell(ConnectionEstablished::<T> {
                            epoch,
                            reader,
                            writer,
                        })
                        .send()
                        .await;
                }
                Ok(Err(err)) => {
                    let _ = actor_ref
                        .tell(IngestEvent::ConnectFailed {
                            epoch,
                            cause: DisconnectCause::ConnectFailed {
                                error: err.to_string(),
                            },
                        })
                        .send()
                        .await;
                }
                Err(_) => {
                    let _ = actor_ref
                        .tell(IngestEvent::ConnectFailed {
                            epoch,
                            cause: DisconnectCause::ConnectTimeout,
                        })
                        .send()
                        .await;
                }
            }
        }));
    }

    fn spawn_reader(&mut self, mut reader: T::Reader) {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        self.reader_shutdown = Some(shutdown_tx);

        let epoch = self.epoch;
        let actor_ref = self.actor_ref.clone();
        let read_timeout = self.timeouts.read;

        self.reader_task = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    res = shutdown_rx.changed() => {
                        if res.is_err() || *shutdown_rx.borrow_and_update() { break; }
                    }
                    next = tokio::time::timeout(read_timeout, reader.next()) => {
                        let cause = match next {
                            Ok(Some(Ok(WsFrame::Close(frame)))) => {
                                info!(epoch, close = ?frame, "received websocket close frame");
                                DisconnectCause::RemoteClosed {
                                    reason: WsFrame::close_reason(frame.as_ref()),
                                }
                            }
                            Ok(Some(Ok(frame))) => {
                                if actor_ref
                                    .tell(IngestEvent::Inbound { epoch, frame })
                                    .send()
                                    .await
                                    .is_err()
                                {
                                    break;
                                }
                                continue;
                            }
                            Ok(Some(Err(err))) => DisconnectCause::ReadFailure {
                                error: err.to_string(),
                            },
                            Ok(None) => DisconnectCause::RemoteClosed {
                                reason: "stream ended".to_string(),
                            },
                            Err(_) => DisconnectCause::ReadTimeout,
                        };
                        let _ = actor_ref
                            .tell(IngestEvent::Disconnect { epoch, cause })
                            .send()
                            .await;
                        break;
                    }
                }
            }
        }));
    }

    fn arm_handshake_timer(&mut self, phase: ConnectionState, after: Duration) {
        if let Some(timer) = self.handshake_timer.take() {
            timer.abort();
        }
        let epoch = self.epoch;
        let actor_ref = self.actor_ref.clone();
        self.handshake_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = actor_ref
                .tell(IngestEvent::HandshakeTimeout { epoch, phase })
                .send()
                .await;
        }));
    }

    fn cancel_handshake_timer(&mut self) {
        if let Some(timer) = self.handshake_timer.take() {
            timer.abort();
        }
    }

    fn start_heartbeat(&mut self) {
        if let Some(task) = self.heartbeat_task.take() {
            task.abort();
        }
        self.heartbeat.reset();
        if !self.heartbeat.enabled() {
            debug!("application heartbeat disabled");
            return;
        }

        let epoch = self.epoch;
        let actor_ref = self.actor_ref.clone();
        let interval = self.heartbeat.interval();
        self.heartbeat_task = Some(tokio::spawn(async move {
            let start = tokio::time::Instant::now() + interval;
            let mut ticker = tokio::time::interval_at(start, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if actor_ref
                    .tell(IngestEvent::HeartbeatTick { epoch })
                    .send()
                    .await
                    .is_err()
                {
                    break;
                }
            }
        }));
    }

    async fn heartbeat_check(&mut self) {
        if self.heartbeat.is_overdue(now()) {
            self.fail(DisconnectCause::HeartbeatTimeout).await;
        }
    }

    async fn heartbeat_tick(&mut self) {
        let at = now();
        if self.heartbeat.is_overdue(at) {
            self.fail(DisconnectCause::HeartbeatTimeout).await;
            return;
        }
        if self.heartbeat.is_pending() {
            return;
        }

        let id = self.next_id();
        self.heartbeat.on_ping_sent(id, at);

        // Check once the pong deadline has passed instead of waiting for the next tick.
        let epoch = self.epoch;
        let actor_ref = self.actor_ref.clone();
        let deadline = self.heartbeat.timeout() + Duration::from_millis(1);
        if let Some(task) = self.heartbeat_check_task.take() {
            task.abort();
        }
        self.heartbeat_check_task = Some(tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            let _ = actor_ref
                .tell(IngestEvent::HeartbeatCheck { epoch })
                .send()
                .await;
        }));

        match encode_ping(id) {
            Ok(frame) => {
                if let Err(err) = self.send_frame(frame).await {
                    self.fail(DisconnectCause::WriteFailure {
                        error: err.to_string(),
                    })
                    .await;
                }
            }
            Err(err) => warn!(error = %err, "failed to encode ping"),
        }
    }

    async fn send_frame(&mut self, frame: WsFrame) -> IngestResult<()> {
        let Some(writer) = self.writer.as_mut() else {
            return Err(IngestError::TransportError {
                context: "write",
                error: "no active connection".to_string(),
            });
        };
        writer.send(frame).await
    }

    /// Encode and write a handshake command; a failure ends the attempt.
    async fn send_command(&mut self, frame: IngestResult<WsFrame>) -> bool {
        let result = match frame {
            Ok(frame) => self.send_frame(frame).await,
            Err(err) => Err(err),
        };
        match result {
            Ok(()) => true,
            Err(err) => {
                self.fail(DisconnectCause::WriteFailure {
                    error: err.to_string(),
                })
                .await;
                false
            }
        }
    }

    async fn process_frame(&mut self, frame: WsFrame) {
        let Some(payload) = data_payload(&frame) else {
            return;
        };
        match decode(payload, self.max_message_bytes) {
            Ok(message) => self.dispatch(message).await,
            Err(violation) => {
                warn!(error = %violation, "skipping frame that violates protocol limits");
                self.health.record_protocol_violation(&violation.to_string());
            }
        }
    }

    async fn dispatch(&mut self, message: ParsedMessage) {
        let state = self.machine.state();
        match (message, state) {
            (ParsedMessage::AuthRequired { ha_version }, ConnectionState::Authenticating) => {
                debug!(ha_version = ?ha_version, "upstream requested authentication");
                let frame = encode_auth(&self.token);
                self.send_command(frame).await;
            }
            (ParsedMessage::AuthOk { ha_version }, ConnectionState::Authenticating) => {
                info!(ha_version = ?ha_version, "authenticated with home assistant");
                self.cancel_handshake_timer();
                if let Err(err) = self.machine.authenticated() {
                    warn!(error = %err, "unexpected auth_ok");
                    return;
                }
                self.record_transition(state);

                let id = self.next_id();
                self.subscription_id = Some(id);
                self.health.record_subscription(id, false);
                let frame = encode_subscribe(id, &self.filter);
                if self.send_command(frame).await {
                    self.arm_handshake_timer(ConnectionState::Subscribing, self.timeouts.subscribe);
                }
            }
            (ParsedMessage::AuthInvalid { message }, ConnectionState::Authenticating) => {
                error!(
                    url = %self.url,
                    message = %message,
                    "home assistant rejected the access token"
                );
                self.fail(DisconnectCause::AuthInvalid { message }).await;
            }
            (
                ParsedMessage::SubscriptionResult { id, success, error },
                ConnectionState::Subscribing,
            ) if Some(id) == self.subscription_id => {
                self.cancel_handshake_timer();
                if !success {
                    let message = error.unwrap_or_else(|| "subscription rejected".to_string());
                    self.fail(DisconnectCause::SubscriptionRejected { message })
                        .await;
                    return;
                }
                if let Err(err) = self.machine.subscribed() {
                    warn!(error = %err, "unexpected subscription result");
                    return;
                }
                self.health.record_subscription(id, true);
                self.record_transition(state);
                self.health.record_connection_success();
                info!(subscription_id = id, filter = ?self.filter, "streaming events");
                self.start_heartbeat();
            }
            // Events without an id are accepted on the current connection.
            (ParsedMessage::Event { id, event }, ConnectionState::Streaming)
                if id.is_none() || id == self.subscription_id =>
            {
                self.on_event(event).await;
            }
            (ParsedMessage::Event { id, .. }, _) => {
                debug!(id = ?id, state = %state, "ignoring event outside the active subscription");
            }
            (ParsedMessage::Pong { id }, _) => match self.heartbeat.on_pong(id, now()) {
                PongResult::Matched(rtt) => debug!(id, rtt_us = rtt.as_micros() as u64, "pong"),
                PongResult::Unexpected => debug!(id, "unexpected pong"),
            },
            (ParsedMessage::Other { kind }, _) => {
                debug!(kind = %kind, state = %state, "ignoring unhandled message type");
            }
            (ParsedMessage::Unknown { reason }, _) => {
                warn!(reason = %reason, "skipping malformed message");
                self.health.record_malformed();
            }
            (ParsedMessage::SubscriptionResult { id, success, .. }, _) => {
                debug!(id, success, state = %state, "ignoring unrelated result");
            }
            (message, ConnectionState::Streaming) => {
                let reason = format!("unexpected {} while streaming", message.kind());
                self.fail(DisconnectCause::ProtocolDesync { reason }).await;
            }
            (message, _) => {
                debug!(kind = message.kind(), state = %state, "ignoring out-of-phase message");
            }
        }
    }

    async fn on_event(&mut self, event: RawEvent) {
        self.health.record_event_received(now());
        match normalize(event, self.timestamp_policy, Utc::now()) {
            Ok(event) => {
                self.health.record_normalized();
                debug!(
                    event_id = %event.event_id,
                    entity_id = %event.entity_id,
                    timestamp_inferred = event.timestamp_inferred,
                    "normalized event"
                );
                self.enqueue_forward(event);
            }
            Err(err) => {
                self.health.record_validation_failure();
                debug!(error = %err, "event failed validation");
            }
        }
    }

    /// Hand an event to the forwarding task without waiting. A full queue drops the event so
    /// a slow downstream never stalls the mailbox.
    fn enqueue_forward(&mut self, event: NormalizedEvent) {
        let Some(tx) = self.forward_tx.as_ref() else {
            return;
        };
        match tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                self.health.record_forward_dropped();
                warn!(
                    event_id = %event.event_id,
                    entity_id = %event.entity_id,
                    capacity = tx.max_capacity(),
                    "forward queue full; dropping event"
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!("forwarding task stopped; dropping event");
            }
        }
    }

    /// Stop the IO and timer tasks of the current attempt and invalidate its epoch.
    fn teardown_connection(&mut self) {
        if let Some(shutdown) = self.reader_shutdown.take() {
            let _ = shutdown.send(true);
        }
        for task in [
            self.reader_task.take(),
            self.connect_task.take(),
            self.handshake_timer.take(),
            self.heartbeat_task.take(),
            self.heartbeat_check_task.take(),
        ]
        .into_iter()
        .flatten()
        {
            task.abort();
        }
        self.writer = None;
        self.subscription_id = None;
        self.heartbeat.reset();
        self.epoch = self.epoch.wrapping_add(1);
    }

    async fn fail(&mut self, cause: DisconnectCause) {
        let from = self.machine.state();
        if !from.can_transition_to(ConnectionState::Reconnecting) {
            debug!(state = %from, cause = %cause, "ignoring failure outside an active attempt");
            return;
        }

        self.teardown_connection();
        let text = cause.to_string();
        if from == ConnectionState::Streaming {
            self.health.record_disconnect(&text);
        } else {
            self.health.record_connection_failure(&text, cause.is_auth_failure());
        }

        let decision = match self.machine.fail() {
            Ok(decision) => decision,
            Err(err) => {
                warn!(error = %err, "failure transition rejected");
                return;
            }
        };
        self.record_transition(from);

        match decision {
            RetryDecision::Retry { attempt, delay } => {
                let sleep = if self.jitter { jitter_delay(delay) } else { delay };
                warn!(
                    url = %self.url,
                    from = %from,
                    cause = %cause,
                    attempt,
                    delay_ms = duration_ms(sleep),
                    "connection lost; scheduling reconnect"
                );
                self.schedule_backoff(sleep);
            }
            RetryDecision::Exhausted { attempts } => {
                error!(
                    url = %self.url,
                    cause = %cause,
                    attempts,
                    "reconnect attempts exhausted; giving up"
                );
            }
        }
    }

    fn schedule_backoff(&mut self, delay: Duration) {
        if let Some(task) = self.backoff_task.take() {
            task.abort();
        }
        let epoch = self.epoch;
        let actor_ref = self.actor_ref.clone();
        self.backoff_task = Some(tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let _ = actor_ref
                .tell(IngestEvent::BackoffElapsed { epoch })
                .send()
                .await;
        }));
    }

    async fn shutdown(&mut self) {
        let from = self.machine.state();
        if !self.machine.shutdown() {
            return;
        }
        self.record_transition(from);

        if let Some(task) = self.backoff_task.take() {
            task.abort();
        }
        let grace = self.timeouts.shutdown_grace;

        if let Some(shutdown) = self.reader_shutdown.take() {
            let _ = shutdown.send(true);
        }
        if let Some(mut reader) = self.reader_task.take()
            && tokio::time::timeout(grace, &mut reader).await.is_err()
        {
            warn!("reader task did not stop within grace period; aborting");
            reader.abort();
        }

        if let Some(mut writer) = self.writer.take() {
            let close = async {
                writer.send(WsFrame::close(1000, "shutdown")).await?;
                writer.close().await
            };
            match tokio::time::timeout(grace, close).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => debug!(error = %err, "close handshake failed"),
                Err(_) => debug!("close handshake timed out"),
            }
        }
        self.teardown_connection();

        // Closing the queue lets the forwarding task drain and exit.
        self.forward_tx = None;
        if let Some(mut task) = self.forward_task.take()
            && tokio::time::timeout(self.timeouts.forward_drain, &mut task)
                .await
                .is_err()
        {
            warn!("forward queue did not drain in time; aborting");
            task.abort();
        }

        info!(url = %self.url, "ingestion stopped");
    }
}
