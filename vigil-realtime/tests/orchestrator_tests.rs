mod support;

use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;
use support::{ORIGIN, PipelineFixture, SUBJECT, domain_event, to_message, wait_until};
use vigil_realtime::authority::SuppressReason;
use vigil_realtime::bus::{BroadcastBus, BusMessage, BusReceiver};
use vigil_realtime::orchestrator::Disposition;
use vigil_realtime::routing::EventKind;
use vigil_realtime::sse::StreamMessage;
use vigil_realtime::{Channel, DeliverySource, RealtimeEvent, TabId};
use vigil_storage::ProcessedLog;

// ── Idempotence ─────────────────────────────────────────────────

#[tokio::test]
async fn same_event_twice_is_persisted_and_notified_once() {
    support::init_tracing();
    let mut fx = PipelineFixture::leader();
    let event = domain_event("evt-42", 100, "report_created");

    let first = fx.pipeline.process_raw_event(&to_message(&event), None).await;
    let second = fx.pipeline.process_raw_event(&to_message(&event), None).await;

    assert_eq!(first, Disposition::Delivered);
    assert_eq!(second, Disposition::Duplicate);
    assert_eq!(fx.log.processed_count().unwrap(), 1);
    assert_eq!(fx.collector.ids(), vec!["evt-42".to_string()]);
    assert_eq!(fx.handler.applied_count(), 1);
    assert_eq!(fx.acks.submitted(), 1);
}

#[tokio::test]
async fn durable_log_catches_duplicates_after_reload() {
    let log = Arc::new(ProcessedLog::open_in_memory().unwrap());
    let event = domain_event("evt-42", 100, "report_created");

    let mut before = PipelineFixture::build(log.clone(), true);
    before.pipeline.process_raw_event(&to_message(&event), None).await;

    // Fresh authority log, same durable store.
    let mut after = PipelineFixture::build(log.clone(), true);
    let outcome = after.pipeline.process_raw_event(&to_message(&event), None).await;

    assert_eq!(outcome, Disposition::Duplicate);
    assert_eq!(after.collector.len(), 0);
    assert_eq!(after.acks.submitted(), 0);
    assert_eq!(log.processed_count().unwrap(), 1);
}

#[tokio::test]
async fn persisting_advances_the_channel_cursor() {
    let mut fx = PipelineFixture::leader();
    fx.pipeline
        .process_raw_event(&to_message(&domain_event("e1", 700, "report_created")), None)
        .await;
    fx.pipeline
        .process_raw_event(&to_message(&domain_event("e2", 650, "report_updated")), None)
        .await;

    assert_eq!(fx.log.cursor(SUBJECT, "feed").unwrap(), Some(700));
}

// ── Ordered resync ──────────────────────────────────────────────

#[tokio::test]
async fn resync_applies_catch_up_in_timestamp_order() {
    let mut fx = PipelineFixture::leader();
    fx.log.advance_cursor(SUBJECT, "feed", 500).unwrap();
    fx.backend.set_catch_up(vec![
        domain_event("evt-530", 530, "report_created"),
        domain_event("evt-510", 510, "report_created"),
        domain_event("evt-520", 520, "report_updated"),
    ]);

    let delivered = fx.pipeline.resync(fx.backend.as_ref()).await.unwrap();

    assert_eq!(delivered, 3);
    assert_eq!(fx.backend.catch_up_calls(), vec![500]);
    assert_eq!(fx.collector.timestamps(), vec![510, 520, 530]);
    assert!(fx.collector.deliveries().iter().all(|d| {
        d.source == DeliverySource::Replay && d.event.is_replay
    }));
    assert_eq!(fx.log.cursor(SUBJECT, "feed").unwrap(), Some(530));
}

#[tokio::test]
async fn resync_without_cursors_starts_from_zero() {
    let mut fx = PipelineFixture::leader();
    fx.backend
        .set_catch_up(vec![domain_event("evt-1", 10, "notification_created")]);

    fx.pipeline.resync(fx.backend.as_ref()).await.unwrap();

    assert_eq!(fx.backend.catch_up_calls(), vec![0]);
    assert_eq!(fx.log.cursor(SUBJECT, "user").unwrap(), Some(10));
}

#[tokio::test]
async fn resync_uses_the_oldest_cursor_and_skips_what_was_applied() {
    let mut fx = PipelineFixture::leader();
    fx.pipeline
        .process_raw_event(&to_message(&domain_event("evt-600", 600, "report_created")), None)
        .await;
    fx.log.advance_cursor(SUBJECT, "user", 400).unwrap();
    fx.backend.set_catch_up(vec![
        domain_event("evt-450", 450, "notification_created"),
        domain_event("evt-600", 600, "report_created"),
    ]);

    let delivered = fx.pipeline.resync(fx.backend.as_ref()).await.unwrap();

    assert_eq!(fx.backend.catch_up_calls(), vec![400]);
    assert_eq!(delivered, 1);
    assert_eq!(fx.collector.ids(), vec!["evt-600", "evt-450"]);
}

#[tokio::test]
async fn failed_catch_up_is_reported() {
    let mut fx = PipelineFixture::leader();
    fx.backend.fail_catch_up(true);

    let result = fx.pipeline.resync(fx.backend.as_ref()).await;

    assert!(result.is_err());
    assert_eq!(fx.collector.len(), 0);
    assert_eq!(fx.stats.snapshot(&fx.acks).resync_failures, 1);
}

// ── Golden invariant ────────────────────────────────────────────

#[tokio::test]
async fn failed_persist_never_notifies_or_acks() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("processed.db");
    let log = Arc::new(ProcessedLog::open(&path).unwrap());
    let mut fx = PipelineFixture::build(log, true);

    // Break the store underneath the pipeline.
    let conn = rusqlite::Connection::open(&path).unwrap();
    conn.execute_batch("DROP TABLE processed_events;").unwrap();

    let outcome = fx
        .pipeline
        .process_raw_event(&to_message(&domain_event("evt-9", 900, "report_created")), None)
        .await;

    assert_eq!(outcome, Disposition::PersistFailed);
    assert_eq!(fx.collector.len(), 0);
    assert_eq!(fx.handler.applied_count(), 0);
    assert_eq!(fx.acks.submitted(), 0);
    assert_eq!(fx.stats.snapshot(&fx.acks).persist_failures, 1);
}

#[tokio::test]
async fn failed_persist_is_recovered_by_the_next_resync() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("processed.db");
    let log = Arc::new(ProcessedLog::open(&path).unwrap());
    let mut fx = PipelineFixture::build(log, true);
    let a = domain_event("evt-a", 100, "report_created");
    let b = domain_event("evt-b", 110, "report_created");

    let conn = rusqlite::Connection::open(&path).unwrap();
    conn.execute_batch("ALTER TABLE processed_events RENAME TO processed_events_off;")
        .unwrap();
    assert_eq!(
        fx.pipeline.process_raw_event(&to_message(&a), None).await,
        Disposition::PersistFailed
    );
    assert_eq!(fx.pipeline.resync_floor(), Some(99));

    conn.execute_batch("ALTER TABLE processed_events_off RENAME TO processed_events;")
        .unwrap();
    assert_eq!(
        fx.pipeline.process_raw_event(&to_message(&b), None).await,
        Disposition::Delivered
    );
    assert_eq!(fx.log.cursor(SUBJECT, "feed").unwrap(), Some(110));

    fx.backend.set_catch_up(vec![a, b]);
    let delivered = fx.pipeline.resync(fx.backend.as_ref()).await.unwrap();

    assert_eq!(delivered, 1);
    assert_eq!(fx.backend.catch_up_calls(), vec![99]);
    assert_eq!(fx.collector.ids(), vec!["evt-b", "evt-a"]);
    assert!(fx.log.is_processed("evt-a").unwrap());
    assert_eq!(fx.pipeline.resync_floor(), None);
}

#[tokio::test]
async fn acks_follow_delivery() {
    let mut fx = PipelineFixture::leader();
    let event = RealtimeEvent::new(
        "evt-chat-1",
        42,
        "chat_message_created",
        serde_json::json!({ "messageId": "msg-9", "roomId": "room-1" }),
    );

    let outcome = fx.pipeline.process_raw_event(&to_message(&event), None).await;
    assert_eq!(outcome, Disposition::Delivered);

    let backend = fx.backend.clone();
    assert!(wait_until(Duration::from_secs(2), || backend.acked() == vec!["evt-chat-1"]).await);
    assert!(wait_until(Duration::from_secs(2), || backend.delivered() == vec!["msg-9"]).await);
}

#[tokio::test]
async fn ack_failures_are_published_not_retried() {
    let mut fx = PipelineFixture::leader();
    fx.backend.fail_acks(true);
    let mut failures = fx.acks.subscribe_failures();

    fx.pipeline
        .process_raw_event(&to_message(&domain_event("evt-1", 1, "vote_cast")), None)
        .await;

    let failure = tokio::time::timeout(Duration::from_secs(2), failures.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(failure.job, vigil_realtime::ack::AckJob::Event("evt-1".into()));
    assert_eq!(fx.collector.len(), 1);
    assert_eq!(fx.acks.failed(), 1);
}

// ── Classification ──────────────────────────────────────────────

#[tokio::test]
async fn control_events_bypass_durability() {
    let mut fx = PipelineFixture::leader();
    let heartbeat = StreamMessage::new("message", r#"{"type":"heartbeat"}"#);

    let outcome = fx.pipeline.process_raw_event(&heartbeat, None).await;

    assert_eq!(outcome, Disposition::Delivered);
    assert_eq!(fx.collector.len(), 1);
    assert_eq!(fx.collector.deliveries()[0].kind, EventKind::Heartbeat);
    assert_eq!(fx.handler.applied_count(), 0);
    assert_eq!(fx.log.processed_count().unwrap(), 0);
    assert_eq!(fx.acks.submitted(), 0);
}

#[tokio::test]
async fn status_only_events_are_notified_but_never_logged() {
    let mut fx = PipelineFixture::leader();
    let read = StreamMessage::new(
        "message_read",
        r#"{"eventId":"tick-1","serverTimestamp":5,"payload":{"messageId":"m1"}}"#,
    );

    fx.pipeline.process_raw_event(&read, None).await;
    fx.pipeline.process_raw_event(&read, None).await;

    assert_eq!(fx.collector.len(), 2);
    assert_eq!(fx.handler.applied_count(), 2);
    assert_eq!(fx.log.processed_count().unwrap(), 0);
    assert_eq!(fx.acks.submitted(), 0);
}

#[tokio::test]
async fn domain_event_without_identity_is_dropped() {
    let mut fx = PipelineFixture::leader();
    let no_id = StreamMessage::new("message", r#"{"type":"report_created","serverTimestamp":1}"#);
    let no_ts = StreamMessage::new("message", r#"{"type":"report_created","eventId":"e1"}"#);

    assert_eq!(fx.pipeline.process_raw_event(&no_id, None).await, Disposition::Malformed);
    assert_eq!(fx.pipeline.process_raw_event(&no_ts, None).await, Disposition::Malformed);
    assert_eq!(fx.collector.len(), 0);
    assert_eq!(fx.log.processed_count().unwrap(), 0);
    assert_eq!(fx.stats.snapshot(&fx.acks).malformed, 2);
}

#[tokio::test]
async fn unknown_types_and_bad_json_are_dropped() {
    let mut fx = PipelineFixture::leader();
    let unknown = StreamMessage::new(
        "message",
        r#"{"type":"asteroid_impact","eventId":"e1","serverTimestamp":1}"#,
    );
    let garbage = StreamMessage::new("message", "{not json");

    assert_eq!(fx.pipeline.process_raw_event(&unknown, None).await, Disposition::Malformed);
    assert_eq!(fx.pipeline.process_raw_event(&garbage, None).await, Disposition::Malformed);
    assert_eq!(fx.collector.len(), 0);
}

#[tokio::test]
async fn subscription_hint_overrides_declared_channel() {
    let mut fx = PipelineFixture::leader();
    let event = domain_event("evt-c", 3, "comment_created").with_channel(Channel::User);

    fx.pipeline
        .process_raw_event(&to_message(&event), Some(Channel::Social))
        .await;

    assert_eq!(fx.collector.deliveries()[0].channel, Channel::Social);
    assert_eq!(fx.log.cursor(SUBJECT, "social").unwrap(), Some(3));
}

// ── Authority log ───────────────────────────────────────────────

#[tokio::test]
async fn repeated_badge_is_persisted_and_acked_but_not_renotified() {
    let mut fx = PipelineFixture::leader();
    let payload = serde_json::json!({ "badgeId": "first-report", "userId": "user-7" });
    let first = RealtimeEvent::new("evt-b1", 10, "badge_awarded", payload.clone());
    let second = RealtimeEvent::new("evt-b2", 11, "badge_awarded", payload);

    assert_eq!(
        fx.pipeline.process_raw_event(&to_message(&first), None).await,
        Disposition::Delivered
    );
    assert_eq!(
        fx.pipeline.process_raw_event(&to_message(&second), None).await,
        Disposition::Suppressed(SuppressReason::Semantic)
    );

    assert_eq!(fx.collector.ids(), vec!["evt-b1"]);
    assert_eq!(fx.log.processed_count().unwrap(), 2);
    assert_eq!(fx.acks.submitted(), 2);
}

#[tokio::test]
async fn own_echo_is_recorded_without_notifying() {
    let mut fx = PipelineFixture::leader();
    let echo = domain_event("evt-mine", 20, "comment_created").with_origin(ORIGIN);

    let outcome = fx.pipeline.process_raw_event(&to_message(&echo), None).await;

    assert_eq!(outcome, Disposition::Suppressed(SuppressReason::Echo));
    assert_eq!(fx.collector.len(), 0);
    assert!(fx.log.is_processed("evt-mine").unwrap());
    assert_eq!(fx.acks.submitted(), 1);
}

#[tokio::test]
async fn own_echo_is_still_mirrored_to_other_tabs() {
    let mut fx = PipelineFixture::leader();
    let mut rx = BusReceiver::new(TabId::from("tab-other"), fx.bus.subscribe());
    let echo = domain_event("evt-mine", 20, "comment_created").with_origin(ORIGIN);

    fx.pipeline.process_raw_event(&to_message(&echo), None).await;

    let envelope = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .unwrap()
        .unwrap();
    match envelope.message {
        BusMessage::EventMirror { event, .. } => assert_eq!(event.id(), Some("evt-mine")),
        other => panic!("expected EventMirror, got {other:?}"),
    }
}

#[tokio::test]
async fn deferred_follower_delivers_the_leaders_echo_from_its_mirror() {
    let log = Arc::new(ProcessedLog::open_in_memory().unwrap());
    let mut leader = PipelineFixture::build(log.clone(), true);
    let mut follower = PipelineFixture::build_with_origin(log, false, "client-origin-2");
    let mut rx = BusReceiver::new(TabId::from("tab-follower"), leader.bus.subscribe());
    let echo = domain_event("evt-mine", 20, "comment_created").with_origin(ORIGIN);

    assert_eq!(
        follower.pipeline.process_raw_event(&to_message(&echo), None).await,
        Disposition::Deferred
    );
    assert_eq!(
        leader.pipeline.process_raw_event(&to_message(&echo), None).await,
        Disposition::Suppressed(SuppressReason::Echo)
    );

    let envelope = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .unwrap()
        .unwrap();
    let BusMessage::EventMirror { event, channel } = envelope.message else {
        panic!("expected EventMirror");
    };
    let outcome = follower
        .pipeline
        .process_validated(event, EventKind::CommentCreated, channel, DeliverySource::Mirror)
        .await;

    assert_eq!(outcome, Disposition::Delivered);
    assert_eq!(follower.collector.ids(), vec!["evt-mine"]);
    assert_eq!(leader.collector.len(), 0);
}

// ── Leader / follower ───────────────────────────────────────────

#[tokio::test]
async fn leader_mirrors_delivered_events() {
    let mut fx = PipelineFixture::leader();
    let mut rx = BusReceiver::new(TabId::from("tab-other"), fx.bus.subscribe());
    let event = domain_event("evt-m", 77, "report_resolved");

    fx.pipeline.process_raw_event(&to_message(&event), None).await;

    let envelope = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(envelope.sender, TabId::from("tab-test"));
    match envelope.message {
        BusMessage::EventMirror { event: mirrored, channel } => {
            assert_eq!(mirrored.id(), Some("evt-m"));
            assert_eq!(channel, Channel::Feed);
        }
        other => panic!("expected EventMirror, got {other:?}"),
    }
}

#[tokio::test]
async fn follower_defers_until_the_mirror_arrives() {
    let mut fx = PipelineFixture::follower();
    let event = domain_event("evt-f", 5, "report_created");

    let live = fx.pipeline.process_raw_event(&to_message(&event), None).await;
    assert_eq!(live, Disposition::Deferred);
    assert_eq!(fx.collector.len(), 0);

    let mirrored = fx
        .pipeline
        .process_validated(
            event.clone(),
            EventKind::ReportCreated,
            Channel::Feed,
            DeliverySource::Mirror,
        )
        .await;
    assert_eq!(mirrored, Disposition::Delivered);

    let late = fx.pipeline.process_raw_event(&to_message(&event), None).await;
    assert_eq!(late, Disposition::Duplicate);

    assert_eq!(fx.collector.ids(), vec!["evt-f"]);
    assert_eq!(fx.log.processed_count().unwrap(), 0);
    assert_eq!(fx.acks.submitted(), 0);
}

#[tokio::test]
async fn follower_delivers_what_the_leader_already_persisted() {
    let mut fx = PipelineFixture::follower();
    fx.log
        .record(&vigil_storage::ProcessedEntry {
            event_id: "evt-p",
            subject_id: SUBJECT,
            channel: "feed",
            server_timestamp: 8,
            processed_at: chrono::Utc::now(),
        })
        .unwrap();

    let outcome = fx
        .pipeline
        .process_raw_event(&to_message(&domain_event("evt-p", 8, "report_created")), None)
        .await;

    assert_eq!(outcome, Disposition::Delivered);
    assert_eq!(fx.collector.ids(), vec!["evt-p"]);
    assert_eq!(fx.acks.submitted(), 0);
}
