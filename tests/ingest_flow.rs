use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use hass_ingest::core::{
    ConnectionState, ExponentialBackoff, HealthSnapshot, HealthStatus, MaxAttempts,
};
use hass_ingest::forward::{EventSink, ForwardError, ForwardRetryPolicy, Forwarder};
use hass_ingest::protocol::NormalizedEvent;
use hass_ingest::testing::{MockTransport, RecordingSink, state_changed_json};
use hass_ingest::ws::{
    GetConnectionState, GetHealthSnapshot, IngestActor, IngestActorArgs, Start, Stop,
};
use kameo::Actor;
use kameo::prelude::ActorRef;
use sonic_rs::JsonValueTrait;

const STEP: Duration = Duration::from_secs(2);

type TestActorRef = ActorRef<IngestActor<MockTransport>>;

fn args(transport: &MockTransport, sink: Arc<RecordingSink>) -> IngestActorArgs<MockTransport> {
    let forwarder = Forwarder::new(
        sink,
        ForwardRetryPolicy {
            attempts: 1,
            ..ForwardRetryPolicy::default()
        },
    );
    let mut args = IngestActorArgs::new(
        "ws://mock.local/api/websocket",
        "test-token",
        transport.clone(),
        forwarder,
    );
    args.backoff = ExponentialBackoff::new(
        Duration::from_millis(10),
        Duration::from_millis(50),
        MaxAttempts::Unbounded,
    );
    args.heartbeat_interval = Duration::ZERO;
    args
}

async fn wait_for_state(actor: &TestActorRef, want: ConnectionState, timeout: Duration) {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let state = actor.ask(GetConnectionState).await.unwrap();
        if state == want {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for {want} (last={state})");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

async fn wait_for_snapshot<F>(actor: &TestActorRef, timeout: Duration, pred: F) -> HealthSnapshot
where
    F: Fn(&HealthSnapshot) -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let snapshot = actor.ask(GetHealthSnapshot).await.unwrap();
        if pred(&snapshot) {
            return snapshot;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for snapshot condition (last={snapshot:?})");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn handshake_sends_token_then_subscribes_to_state_changed() {
    let transport = MockTransport::new();
    let mut server = transport.push_connection();
    let actor = IngestActor::spawn(args(&transport, Arc::new(RecordingSink::default())));

    assert!(actor.ask(Start).await.unwrap());

    server
        .send_text(r#"{"type":"auth_required","ha_version":"2024.6.0"}"#)
        .unwrap();
    let auth = server.expect_command("auth", STEP).await.unwrap();
    assert_eq!(
        auth.get("access_token").and_then(|v| v.as_str()),
        Some("test-token")
    );
    wait_for_state(&actor, ConnectionState::Authenticating, STEP).await;

    server.send_text(r#"{"type":"auth_ok","ha_version":"2024.6.0"}"#).unwrap();
    let subscribe = server.expect_command("subscribe_events", STEP).await.unwrap();
    assert_eq!(
        subscribe.get("event_type").and_then(|v| v.as_str()),
        Some("state_changed")
    );
    let id = subscribe.get("id").and_then(|v| v.as_u64()).unwrap();
    wait_for_state(&actor, ConnectionState::Subscribing, STEP).await;

    server
        .send_text(format!(r#"{{"id":{id},"type":"result","success":true,"result":null}}"#))
        .unwrap();
    wait_for_state(&actor, ConnectionState::Streaming, STEP).await;

    let snapshot = actor.ask(GetHealthSnapshot).await.unwrap();
    assert!(snapshot.subscription.is_subscribed);
    assert_eq!(snapshot.subscription.subscription_id, Some(id));
    assert_eq!(snapshot.connection.successful_connections, 1);
    assert!(snapshot.connection.last_connected_at.is_some());

    actor.ask(Stop).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn state_change_is_normalized_and_forwarded() {
    let transport = MockTransport::new();
    let mut server = transport.push_connection();
    let sink = Arc::new(RecordingSink::default());
    let actor = IngestActor::spawn(args(&transport, sink.clone()));

    actor.ask(Start).await.unwrap();
    let id = server.complete_handshake(STEP).await.unwrap();
    server
        .send_text(state_changed_json(id, "sensor.temp", "20", "21"))
        .unwrap();

    let snapshot = wait_for_snapshot(&actor, STEP, |s| s.pipeline.events_forwarded == 1).await;
    assert_eq!(snapshot.subscription.total_events_received, 1);
    assert_eq!(snapshot.pipeline.events_normalized, 1);
    assert_eq!(snapshot.status, HealthStatus::Healthy);

    let delivered = sink.delivered();
    assert_eq!(delivered.len(), 1);
    let event = &delivered[0];
    assert_eq!(event.entity_id, "sensor.temp");
    assert_eq!(event.domain, "sensor");
    assert_eq!(event.event_type, "state_changed");
    assert_eq!(event.source, "home_assistant");
    assert!(!event.timestamp_inferred);
    let old_state = event.old_state.as_ref().unwrap();
    let new_state = event.new_state.as_ref().unwrap();
    assert_eq!(old_state.get("state").and_then(|v| v.as_str()), Some("20"));
    assert_eq!(new_state.get("state").and_then(|v| v.as_str()), Some("21"));

    actor.ask(Stop).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn malformed_and_invalid_messages_do_not_break_the_stream() {
    let transport = MockTransport::new();
    let mut server = transport.push_connection();
    let sink = Arc::new(RecordingSink::default());
    let actor = IngestActor::spawn(args(&transport, sink.clone()));

    actor.ask(Start).await.unwrap();
    let id = server.complete_handshake(STEP).await.unwrap();

    server.send_text("{not json").unwrap();
    server
        .send_text(r#"{"id":99,"type":"zone_changed"}"#)
        .unwrap();
    server
        .send_text(format!(
            r#"{{"id":{id},"type":"event","event":{{"event_type":"state_changed","data":{{}}}}}}"#
        ))
        .unwrap();
    server
        .send_text(state_changed_json(id, "light.kitchen", "off", "on"))
        .unwrap();

    let snapshot = wait_for_snapshot(&actor, STEP, |s| s.pipeline.events_forwarded == 1).await;
    assert_eq!(snapshot.pipeline.malformed_messages, 1);
    assert_eq!(snapshot.pipeline.validation_failures, 1);
    assert_eq!(snapshot.pipeline.events_normalized, 1);
    assert_eq!(snapshot.subscription.total_events_received, 2);
    assert_eq!(snapshot.connection.state, ConnectionState::Streaming);
    assert_eq!(sink.delivered()[0].entity_id, "light.kitchen");

    actor.ask(Stop).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn oversized_frame_is_counted_and_skipped() {
    let transport = MockTransport::new();
    let mut server = transport.push_connection();
    let sink = Arc::new(RecordingSink::default());
    let mut args = args(&transport, sink.clone());
    args.max_message_bytes = 1024;
    let actor = IngestActor::spawn(args);

    actor.ask(Start).await.unwrap();
    let id = server.complete_handshake(STEP).await.unwrap();

    server.send_text("x".repeat(2048)).unwrap();
    server
        .send_text(state_changed_json(id, "sensor.ok", "1", "2"))
        .unwrap();

    let snapshot = wait_for_snapshot(&actor, STEP, |s| s.pipeline.events_forwarded == 1).await;
    assert_eq!(snapshot.pipeline.protocol_violations, 1);
    assert_eq!(snapshot.pipeline.malformed_messages, 0);
    assert_eq!(snapshot.connection.state, ConnectionState::Streaming);

    actor.ask(Stop).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dropped_socket_reconnects_with_a_new_subscription() {
    let transport = MockTransport::new();
    let mut first = transport.push_connection();
    let mut second = transport.push_connection();
    let sink = Arc::new(RecordingSink::default());
    let actor = IngestActor::spawn(args(&transport, sink.clone()));

    actor.ask(Start).await.unwrap();
    let first_id = first.complete_handshake(STEP).await.unwrap();
    first.drop_socket();

    let second_id = second.complete_handshake(STEP).await.unwrap();
    assert!(second_id > first_id);
    wait_for_state(&actor, ConnectionState::Streaming, STEP).await;

    // Events tagged with the old subscription are not ours any more.
    second
        .send_text(state_changed_json(first_id, "sensor.stale", "1", "2"))
        .unwrap();
    second
        .send_text(state_changed_json(second_id, "sensor.fresh", "1", "2"))
        .unwrap();

    let snapshot = wait_for_snapshot(&actor, STEP, |s| s.pipeline.events_forwarded == 1).await;
    assert_eq!(snapshot.connection.connection_attempts, 2);
    assert_eq!(snapshot.connection.successful_connections, 2);
    assert_eq!(snapshot.connection.disconnects, 1);
    assert_eq!(snapshot.subscription.subscription_id, Some(second_id));
    assert_eq!(sink.delivered()[0].entity_id, "sensor.fresh");
    assert_eq!(transport.connects(), 2);

    actor.ask(Stop).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn close_frame_and_read_error_both_trigger_reconnect() {
    let transport = MockTransport::new();
    let mut first = transport.push_connection();
    let mut second = transport.push_connection();
    let mut third = transport.push_connection();
    let actor = IngestActor::spawn(args(&transport, Arc::new(RecordingSink::default())));

    actor.ask(Start).await.unwrap();
    first.complete_handshake(STEP).await.unwrap();
    first.send_close(1001, "going away").unwrap();

    second.complete_handshake(STEP).await.unwrap();
    second.fail_read("connection reset by peer").unwrap();

    third.complete_handshake(STEP).await.unwrap();
    let snapshot =
        wait_for_snapshot(&actor, STEP, |s| s.connection.successful_connections == 3).await;
    assert_eq!(snapshot.connection.disconnects, 2);
    assert!(
        snapshot
            .connection
            .last_error
            .as_deref()
            .unwrap_or_default()
            .contains("connection reset by peer")
    );
    assert!(
        snapshot
            .connection
            .recent_errors
            .iter()
            .any(|e| e.message.contains("going away"))
    );

    actor.ask(Stop).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rejected_token_is_retried_and_counted() {
    let transport = MockTransport::new();
    let mut first = transport.push_connection();
    let mut second = transport.push_connection();
    let actor = IngestActor::spawn(args(&transport, Arc::new(RecordingSink::default())));

    actor.ask(Start).await.unwrap();
    first.send_text(r#"{"type":"auth_required"}"#).unwrap();
    first.expect_command("auth", STEP).await.unwrap();
    first
        .send_text(r#"{"type":"auth_invalid","message":"Invalid access token"}"#)
        .unwrap();

    second.complete_handshake(STEP).await.unwrap();
    let snapshot =
        wait_for_snapshot(&actor, STEP, |s| s.connection.state == ConnectionState::Streaming)
            .await;
    assert_eq!(snapshot.connection.auth_failures, 1);
    assert_eq!(snapshot.connection.failed_connections, 1);
    assert_eq!(snapshot.connection.successful_connections, 1);

    actor.ask(Stop).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rejected_subscription_is_retried() {
    let transport = MockTransport::new();
    let mut first = transport.push_connection();
    let mut second = transport.push_connection();
    let actor = IngestActor::spawn(args(&transport, Arc::new(RecordingSink::default())));

    actor.ask(Start).await.unwrap();
    first.send_text(r#"{"type":"auth_required"}"#).unwrap();
    first.expect_command("auth", STEP).await.unwrap();
    first.send_text(r#"{"type":"auth_ok"}"#).unwrap();
    let subscribe = first.expect_command("subscribe_events", STEP).await.unwrap();
    let id = subscribe.get("id").and_then(|v| v.as_u64()).unwrap();
    first
        .send_text(format!(
            r#"{{"id":{id},"type":"result","success":false,"error":{{"code":"unauthorized","message":"nope"}}}}"#
        ))
        .unwrap();

    second.complete_handshake(STEP).await.unwrap();
    let snapshot =
        wait_for_snapshot(&actor, STEP, |s| s.connection.state == ConnectionState::Streaming)
            .await;
    assert_eq!(snapshot.connection.failed_connections, 1);
    assert_eq!(snapshot.connection.auth_failures, 0);

    actor.ask(Stop).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn limited_attempts_end_in_failed_state() {
    let transport = MockTransport::new();
    let mut args = args(&transport, Arc::new(RecordingSink::default()));
    args.backoff = ExponentialBackoff::new(
        Duration::from_millis(5),
        Duration::from_millis(5),
        MaxAttempts::Limited(2),
    );
    let actor = IngestActor::spawn(args);

    actor.ask(Start).await.unwrap();
    wait_for_state(&actor, ConnectionState::Failed, STEP).await;

    // Initial attempt plus two retries.
    assert_eq!(transport.connects(), 3);
    let snapshot = actor.ask(GetHealthSnapshot).await.unwrap();
    assert_eq!(snapshot.connection.failed_connections, 3);
    assert_eq!(snapshot.status, HealthStatus::Unhealthy);
    assert!(!snapshot.connection.is_running);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(transport.connects(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_cancels_pending_reconnect() {
    let transport = MockTransport::new();
    let mut args = args(&transport, Arc::new(RecordingSink::default()));
    args.backoff = ExponentialBackoff::new(
        Duration::from_millis(200),
        Duration::from_secs(1),
        MaxAttempts::Unbounded,
    );
    let actor = IngestActor::spawn(args);

    actor.ask(Start).await.unwrap();
    wait_for_state(&actor, ConnectionState::Reconnecting, STEP).await;
    assert_eq!(transport.connects(), 1);

    actor.ask(Stop).await.unwrap();
    assert_eq!(
        actor.ask(GetConnectionState).await.unwrap(),
        ConnectionState::ShuttingDown
    );

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(transport.connects(), 1);
    assert!(actor.ask(Start).await.is_err());

    // Stopping twice is fine.
    actor.ask(Stop).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_drains_forward_queue() {
    let transport = MockTransport::new();
    let mut server = transport.push_connection();
    let sink = Arc::new(RecordingSink::default());
    let actor = IngestActor::spawn(args(&transport, sink.clone()));

    actor.ask(Start).await.unwrap();
    let id = server.complete_handshake(STEP).await.unwrap();
    for i in 0..20 {
        server
            .send_text(state_changed_json(id, &format!("sensor.s{i}"), "0", "1"))
            .unwrap();
    }
    wait_for_snapshot(&actor, STEP, |s| s.pipeline.events_normalized == 20).await;

    actor.ask(Stop).await.unwrap();
    let delivered: Vec<_> = sink.delivered().into_iter().map(|e| e.entity_id).collect();
    let expected: Vec<_> = (0..20).map(|i| format!("sensor.s{i}")).collect();
    assert_eq!(delivered, expected);

    // The close frame is sent on the way out.
    let mut saw_close = false;
    while let Some(frame) = server.recv_outbound_timeout(Duration::from_millis(100)).await {
        if matches!(frame, hass_ingest::core::WsFrame::Close(_)) {
            saw_close = true;
        }
    }
    assert!(saw_close);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn event_without_id_is_accepted_while_streaming() {
    let transport = MockTransport::new();
    let mut server = transport.push_connection();
    let sink = Arc::new(RecordingSink::default());
    let actor = IngestActor::spawn(args(&transport, sink.clone()));

    actor.ask(Start).await.unwrap();
    server.complete_handshake(STEP).await.unwrap();
    server
        .send_text(concat!(
            r#"{"type":"event","event":{"event_type":"state_changed","#,
            r#""time_fired":"2025-01-15T10:30:00Z","data":{"entity_id":"sensor.temp","#,
            r#""old_state":{"state":"22.1"},"new_state":{"state":"22.3"}}}}"#
        ))
        .unwrap();

    let snapshot = wait_for_snapshot(&actor, STEP, |s| s.pipeline.events_forwarded == 1).await;
    assert_eq!(snapshot.pipeline.malformed_messages, 0);

    let delivered = sink.delivered();
    assert_eq!(delivered.len(), 1);
    let event = &delivered[0];
    assert_eq!(event.entity_id, "sensor.temp");
    assert_eq!(
        event.old_state.as_ref().and_then(|s| s.get("state")).and_then(|v| v.as_str()),
        Some("22.1")
    );
    assert_eq!(
        event.new_state.as_ref().and_then(|s| s.get("state")).and_then(|v| v.as_str()),
        Some("22.3")
    );
    assert_eq!(
        event.timestamp,
        Utc.with_ymd_and_hms(2025, 1, 15, 10, 30, 0).unwrap()
    );
    assert!(!event.timestamp_inferred);
    assert_eq!(event.context_id, None);

    actor.ask(Stop).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn three_refusals_then_streaming_reports_healthy() {
    let transport = MockTransport::new();
    for _ in 0..3 {
        transport.push_refusal("connection refused");
    }
    let mut server = transport.push_connection();
    let sink = Arc::new(RecordingSink::default());
    let actor = IngestActor::spawn(args(&transport, sink.clone()));

    actor.ask(Start).await.unwrap();
    let id = server.complete_handshake(STEP).await.unwrap();
    for i in 0..5 {
        server
            .send_text(state_changed_json(id, &format!("sensor.s{i}"), "0", "1"))
            .unwrap();
    }

    let snapshot = wait_for_snapshot(&actor, STEP, |s| s.pipeline.events_forwarded == 5).await;
    assert_eq!(snapshot.connection.connection_attempts, 4);
    assert_eq!(snapshot.connection.successful_connections, 1);
    assert_eq!(snapshot.connection.failed_connections, 3);
    assert_eq!(snapshot.subscription.total_events_received, 5);
    assert_eq!(snapshot.status, HealthStatus::Healthy);
    assert_eq!(transport.connects(), 4);

    actor.ask(Stop).await.unwrap();
}

/// Downstream that accepts a request and never answers.
struct StalledSink;

#[async_trait]
impl EventSink for StalledSink {
    fn name(&self) -> &'static str {
        "stalled"
    }

    async fn deliver(&self, _event: &NormalizedEvent) -> Result<(), ForwardError> {
        std::future::pending::<()>().await;
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stalled_downstream_drops_events_instead_of_blocking() {
    let transport = MockTransport::new();
    let mut server = transport.push_connection();
    let forwarder = Forwarder::new(
        Arc::new(StalledSink),
        ForwardRetryPolicy {
            attempts: 1,
            ..ForwardRetryPolicy::default()
        },
    );
    let mut args = IngestActorArgs::new(
        "ws://mock.local/api/websocket",
        "test-token",
        transport.clone(),
        forwarder,
    );
    args.heartbeat_interval = Duration::ZERO;
    args.forward_queue_capacity = 1;
    args.timeouts.forward_drain = Duration::from_millis(100);
    let actor = IngestActor::spawn(args);

    actor.ask(Start).await.unwrap();
    let id = server.complete_handshake(STEP).await.unwrap();
    for i in 0..5 {
        server
            .send_text(state_changed_json(id, &format!("sensor.s{i}"), "0", "1"))
            .unwrap();
    }

    // One event is in flight and one is queued; the rest are dropped.
    let snapshot = wait_for_snapshot(&actor, STEP, |s| s.pipeline.events_normalized == 5).await;
    assert!(snapshot.pipeline.forward_dropped >= 3);
    assert_eq!(snapshot.pipeline.events_forwarded, 0);
    assert_eq!(snapshot.connection.state, ConnectionState::Streaming);

    tokio::time::timeout(STEP, actor.ask(GetHealthSnapshot))
        .await
        .expect("snapshot answered while downstream is stalled")
        .unwrap();
    tokio::time::timeout(STEP, actor.ask(Stop))
        .await
        .expect("stop returned while downstream is stalled")
        .unwrap();
}
