//! Test doubles for driving the ingestion actor without a real socket or HTTP server.
//!
//! [`MockTransport`] hands out scripted connections; each accepted one comes with a
//! [`MockServer`] that plays the upstream side. [`RecordingSink`] stands in for the
//! downstream pipeline.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::Sink;
use sonic_rs::{JsonValueTrait, Value};
use tokio::sync::mpsc;

use crate::core::{IngestError, WebSocketBufferConfig, WsFrame, data_payload};
use crate::forward::{EventSink, ForwardError};
use crate::protocol::NormalizedEvent;
use crate::transport::{WsTransport, WsTransportConnectFuture};

enum ScriptedConnect {
    Accept(MockReader, MockWriter),
    Refuse(String),
    Hang,
}

/// In-memory transport. Each `connect` consumes the next scripted outcome; with nothing
/// scripted it is refused.
#[derive(Clone, Default)]
pub struct MockTransport {
    script: Arc<Mutex<VecDeque<ScriptedConnect>>>,
    connects: Arc<AtomicUsize>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, outcome: ScriptedConnect) {
        self.script
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push_back(outcome);
    }

    /// Script a successful connection and return the server side of it.
    pub fn push_connection(&self) -> MockServer {
        let (sent_tx, sent_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        self.push(ScriptedConnect::Accept(
            MockReader { rx: inbound_rx },
            MockWriter { sent_tx },
        ));
        MockServer {
            outbound_rx: sent_rx,
            inbound_tx: Some(inbound_tx),
        }
    }

    pub fn push_refusal(&self, error: impl Into<String>) {
        self.push(ScriptedConnect::Refuse(error.into()));
    }

    /// Script a connect that never completes.
    pub fn push_hang(&self) {
        self.push(ScriptedConnect::Hang);
    }

    /// Number of `connect` calls so far.
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

impl WsTransport for MockTransport {
    type Reader = MockReader;
    type Writer = MockWriter;

    fn connect(
        &self,
        _url: String,
        _buffers: WebSocketBufferConfig,
    ) -> WsTransportConnectFuture<Self::Reader, Self::Writer> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let outcome = self
            .script
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .pop_front();
        Box::pin(async move {
            match outcome {
                Some(ScriptedConnect::Accept(reader, writer)) => Ok((reader, writer)),
                Some(ScriptedConnect::Refuse(error)) => Err(IngestError::ConnectionFailed(error)),
                Some(ScriptedConnect::Hang) => std::future::pending().await,
                None => Err(IngestError::ConnectionFailed(
                    "connection refused".to_string(),
                )),
            }
        })
    }
}

/// Error surface for operations on [`MockServer`].
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum MockServerError {
    /// The inbound socket side was intentionally dropped.
    SocketDropped,
    /// The client side is no longer reading.
    ChannelClosed,
    /// Nothing was written by the client in time.
    Timeout,
    /// The client wrote something other than what the handshake expects.
    Unexpected(String),
}

impl std::fmt::Display for MockServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MockServerError::SocketDropped => f.write_str("mock socket already dropped"),
            MockServerError::ChannelClosed => f.write_str("mock client channel is closed"),
            MockServerError::Timeout => f.write_str("timed out waiting for client frame"),
            MockServerError::Unexpected(frame) => write!(f, "unexpected client frame: {frame}"),
        }
    }
}

impl std::error::Error for MockServerError {}

/// Upstream side of one scripted connection.
pub struct MockServer {
    outbound_rx: mpsc::UnboundedReceiver<WsFrame>,
    inbound_tx: Option<mpsc::UnboundedSender<Result<WsFrame, IngestError>>>,
}

impl MockServer {
    /// Receive a frame written by the client.
    pub async fn recv_outbound(&mut self) -> Option<WsFrame> {
        self.outbound_rx.recv().await
    }

    pub async fn recv_outbound_timeout(&mut self, timeout: Duration) -> Option<WsFrame> {
        tokio::time::timeout(timeout, self.outbound_rx.recv())
            .await
            .unwrap_or_default()
    }

    /// Receive the next client frame parsed as JSON.
    pub async fn recv_json(&mut self, timeout: Duration) -> Result<Value, MockServerError> {
        let frame = self
            .recv_outbound_timeout(timeout)
            .await
            .ok_or(MockServerError::Timeout)?;
        let payload = data_payload(&frame)
            .ok_or_else(|| MockServerError::Unexpected(format!("{frame:?}")))?;
        sonic_rs::from_slice(payload)
            .map_err(|_| MockServerError::Unexpected(String::from_utf8_lossy(payload).into()))
    }

    /// Receive the next client command and check its `type`.
    pub async fn expect_command(
        &mut self,
        kind: &str,
        timeout: Duration,
    ) -> Result<Value, MockServerError> {
        let value = self.recv_json(timeout).await?;
        if value.get("type").and_then(|t| t.as_str()) == Some(kind) {
            Ok(value)
        } else {
            Err(MockServerError::Unexpected(value.to_string()))
        }
    }

    fn send(&self, item: Result<WsFrame, IngestError>) -> Result<(), MockServerError> {
        let Some(tx) = self.inbound_tx.as_ref() else {
            return Err(MockServerError::SocketDropped);
        };
        tx.send(item).map_err(|_| MockServerError::ChannelClosed)
    }

    pub fn send_inbound(&self, frame: WsFrame) -> Result<(), MockServerError> {
        self.send(Ok(frame))
    }

    pub fn send_text(&self, text: impl AsRef<str>) -> Result<(), MockServerError> {
        self.send_inbound(WsFrame::Text(text.as_ref().as_bytes().to_vec().into()))
    }

    pub fn send_close(&self, code: u16, reason: &'static str) -> Result<(), MockServerError> {
        self.send_inbound(WsFrame::close(code, reason))
    }

    /// Surface a read error on the client side.
    pub fn fail_read(&self, error: impl Into<String>) -> Result<(), MockServerError> {
        self.send(Err(IngestError::TransportError {
            context: "read",
            error: error.into(),
        }))
    }

    /// End the inbound stream, as when the peer goes away without a close frame.
    pub fn drop_socket(&mut self) {
        self.inbound_tx = None;
    }

    /// Play the upstream side of auth and subscription. Returns the subscription id.
    pub async fn complete_handshake(&mut self, timeout: Duration) -> Result<u64, MockServerError> {
        self.send_text(r#"{"type":"auth_required","ha_version":"2024.6.0"}"#)?;
        self.expect_command("auth", timeout).await?;
        self.send_text(r#"{"type":"auth_ok","ha_version":"2024.6.0"}"#)?;
        let subscribe = self.expect_command("subscribe_events", timeout).await?;
        let id = subscribe
            .get("id")
            .and_then(|v| v.as_u64())
            .ok_or_else(|| MockServerError::Unexpected(subscribe.to_string()))?;
        self.send_text(format!(
            r#"{{"id":{id},"type":"result","success":true,"result":null}}"#
        ))?;
        Ok(id)
    }
}

/// Reader side for [`MockTransport`].
pub struct MockReader {
    rx: mpsc::UnboundedReceiver<Result<WsFrame, IngestError>>,
}

impl futures_util::Stream for MockReader {
    type Item = Result<WsFrame, IngestError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.rx).poll_recv(cx)
    }
}

/// Writer side for [`MockTransport`].
pub struct MockWriter {
    sent_tx: mpsc::UnboundedSender<WsFrame>,
}

impl Sink<WsFrame> for MockWriter {
    type Error = IngestError;

    fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn start_send(self: Pin<&mut Self>, item: WsFrame) -> Result<(), Self::Error> {
        self.get_mut()
            .sent_tx
            .send(item)
            .map_err(|_| IngestError::TransportError {
                context: "mock_transport_write",
                error: "mock outbound channel closed".to_string(),
            })
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }
}

/// Downstream stand-in that records delivered events. Optionally fails the first `n`
/// delivery attempts with HTTP 503.
#[derive(Default)]
pub struct RecordingSink {
    delivered: Mutex<Vec<NormalizedEvent>>,
    attempts: AtomicU32,
    fail_first: u32,
}

impl RecordingSink {
    pub fn failing_first(n: u32) -> Self {
        Self {
            fail_first: n,
            ..Self::default()
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn delivered(&self) -> Vec<NormalizedEvent> {
        self.delivered
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }
}

#[async_trait]
impl EventSink for RecordingSink {
    fn name(&self) -> &'static str {
        "recording"
    }

    async fn deliver(&self, event: &NormalizedEvent) -> Result<(), ForwardError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst).saturating_add(1);
        if attempt <= self.fail_first {
            return Err(ForwardError::Status(503));
        }
        self.delivered
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(event.clone());
        Ok(())
    }
}

/// A `state_changed` event message as Home Assistant sends it.
pub fn state_changed_json(subscription_id: u64, entity_id: &str, old: &str, new: &str) -> String {
    format!(
        concat!(
            r#"{{"id":{id},"type":"event","event":{{"event_type":"state_changed","#,
            r#""time_fired":"2024-01-01T12:00:00.000000+00:00","origin":"LOCAL","#,
            r#""context":{{"id":"ctx-{entity}-{new}","parent_id":null,"user_id":null}},"#,
            r#""data":{{"entity_id":"{entity}","#,
            r#""old_state":{{"entity_id":"{entity}","state":"{old}","attributes":{{}}}},"#,
            r#""new_state":{{"entity_id":"{entity}","state":"{new}","attributes":{{}},"#,
            r#""last_updated":"2024-01-01T12:00:00.000000+00:00"}}}}}}}}"#
        ),
        id = subscription_id,
        entity = entity_id,
        old = old,
        new = new,
    )
}
