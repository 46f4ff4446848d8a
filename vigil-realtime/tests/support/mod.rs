//! Shared fakes for the realtime integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use vigil_realtime::ack::{AckQueue, create_ack_worker};
use vigil_realtime::authority::AuthorityLog;
use vigil_realtime::backend::BackendApi;
use vigil_realtime::bus::{BroadcastBus, LocalBus};
use vigil_realtime::clock::TokioClock;
use vigil_realtime::handlers::{DomainHandler, HandlerRegistry, ListenerRegistry, Unsubscribe};
use vigil_realtime::orchestrator::{EngineStats, Pipeline, PipelineContext};
use vigil_realtime::sse::StreamMessage;
use vigil_realtime::transport::{MessageStream, StreamConnector};
use vigil_realtime::{Delivery, RealtimeError, RealtimeEvent, RealtimeResult, TabId};
use vigil_storage::ProcessedLog;

pub const SUBJECT: &str = "user-7";
pub const ORIGIN: &str = "client-origin-1";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// Polls `cond` every 10ms (tokio time) until it holds or `timeout` passes.
pub async fn wait_until<F: Fn() -> bool>(timeout: Duration, cond: F) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Like [`wait_until`] for an async condition.
pub async fn wait_until_async<F, Fut>(timeout: Duration, cond: F) -> bool
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if cond().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// ── Events ──────────────────────────────────────────────────────

pub fn domain_event(id: &str, ts: i64, event_type: &str) -> RealtimeEvent {
    RealtimeEvent::new(id, ts, event_type, serde_json::json!({ "reportId": "r-1" }))
}

pub fn to_message(event: &RealtimeEvent) -> StreamMessage {
    StreamMessage::new(
        "message",
        serde_json::to_string(event).expect("event serializes"),
    )
}

// ── Stream connector ────────────────────────────────────────────

type Feed = mpsc::UnboundedSender<RealtimeResult<StreamMessage>>;

#[derive(Default)]
struct ConnectorState {
    attempts: HashMap<String, u32>,
    fail_remaining: HashMap<String, u32>,
    open: HashMap<String, Feed>,
}

/// Scriptable push-stream connector. Each successful `connect` opens a fresh
/// channel the test can push into or sever.
#[derive(Default)]
pub struct MockConnector {
    state: Mutex<ConnectorState>,
}

impl MockConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The next `n` connects to `url` fail.
    pub fn fail_next(&self, url: &str, n: u32) {
        self.state
            .lock()
            .unwrap()
            .fail_remaining
            .insert(url.to_string(), n);
    }

    pub fn attempts(&self, url: &str) -> u32 {
        self.state
            .lock()
            .unwrap()
            .attempts
            .get(url)
            .copied()
            .unwrap_or(0)
    }

    /// True while a connection to `url` is open and its reader is alive.
    pub fn is_open(&self, url: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .open
            .get(url)
            .is_some_and(|tx| !tx.is_closed())
    }

    pub fn push(&self, url: &str, message: StreamMessage) -> bool {
        match self.state.lock().unwrap().open.get(url) {
            Some(tx) => tx.send(Ok(message)).is_ok(),
            None => false,
        }
    }

    pub fn push_event(&self, url: &str, event: &RealtimeEvent) -> bool {
        self.push(url, to_message(event))
    }

    /// Ends the open stream for `url` as if the server closed it.
    pub fn sever(&self, url: &str) {
        self.state.lock().unwrap().open.remove(url);
    }

    /// Fails the open stream for `url` with a transport error.
    pub fn fail_stream(&self, url: &str) {
        if let Some(tx) = self.state.lock().unwrap().open.remove(url) {
            let _ = tx.send(Err(RealtimeError::Stream("connection reset".into())));
        }
    }
}

#[async_trait]
impl StreamConnector for MockConnector {
    async fn connect(&self, url: &str) -> RealtimeResult<MessageStream> {
        let mut state = self.state.lock().unwrap();
        *state.attempts.entry(url.to_string()).or_default() += 1;

        if let Some(remaining) = state.fail_remaining.get_mut(url) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(RealtimeError::Stream("connection refused".into()));
            }
        }

        let (tx, rx) = mpsc::unbounded_channel();
        state.open.insert(url.to_string(), tx);
        let messages = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        Ok(messages.boxed())
    }
}

// ── Backend ─────────────────────────────────────────────────────

#[derive(Default)]
pub struct MockBackend {
    acked: Mutex<Vec<String>>,
    delivered: Mutex<Vec<String>>,
    catch_up_calls: Mutex<Vec<i64>>,
    catch_up_events: Mutex<Vec<RealtimeEvent>>,
    fail_catch_up: AtomicBool,
    fail_acks: AtomicBool,
}

impl MockBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_catch_up(&self, events: Vec<RealtimeEvent>) {
        *self.catch_up_events.lock().unwrap() = events;
    }

    pub fn fail_catch_up(&self, fail: bool) {
        self.fail_catch_up.store(fail, Ordering::SeqCst);
    }

    pub fn fail_acks(&self, fail: bool) {
        self.fail_acks.store(fail, Ordering::SeqCst);
    }

    pub fn acked(&self) -> Vec<String> {
        self.acked.lock().unwrap().clone()
    }

    pub fn delivered(&self) -> Vec<String> {
        self.delivered.lock().unwrap().clone()
    }

    pub fn catch_up_calls(&self) -> Vec<i64> {
        self.catch_up_calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl BackendApi for MockBackend {
    async fn ack_event(&self, event_id: &str) -> RealtimeResult<()> {
        if self.fail_acks.load(Ordering::SeqCst) {
            return Err(RealtimeError::Api {
                status: 503,
                message: "unavailable".into(),
            });
        }
        self.acked.lock().unwrap().push(event_id.to_string());
        Ok(())
    }

    async fn ack_delivered(&self, message_id: &str) -> RealtimeResult<()> {
        if self.fail_acks.load(Ordering::SeqCst) {
            return Err(RealtimeError::Api {
                status: 503,
                message: "unavailable".into(),
            });
        }
        self.delivered.lock().unwrap().push(message_id.to_string());
        Ok(())
    }

    async fn catch_up(&self, since: i64) -> RealtimeResult<Vec<RealtimeEvent>> {
        self.catch_up_calls.lock().unwrap().push(since);
        if self.fail_catch_up.load(Ordering::SeqCst) {
            return Err(RealtimeError::Api {
                status: 500,
                message: "catch-up failed".into(),
            });
        }
        Ok(self
            .catch_up_events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.server_timestamp.unwrap_or(0) > since)
            .cloned()
            .collect())
    }
}

// ── Handlers and listeners ──────────────────────────────────────

#[derive(Default)]
pub struct RecordingHandler {
    applied: Mutex<Vec<Delivery>>,
    invalidated: Mutex<Vec<String>>,
}

impl RecordingHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn applied_ids(&self) -> Vec<String> {
        self.applied
            .lock()
            .unwrap()
            .iter()
            .filter_map(|d| d.event.event_id.clone())
            .collect()
    }

    pub fn applied_count(&self) -> usize {
        self.applied.lock().unwrap().len()
    }

    pub fn invalidated(&self) -> Vec<String> {
        self.invalidated.lock().unwrap().clone()
    }
}

impl DomainHandler for RecordingHandler {
    fn apply(&self, delivery: &Delivery) {
        self.applied.lock().unwrap().push(delivery.clone());
    }

    fn invalidate(&self, subject_id: &str) {
        self.invalidated.lock().unwrap().push(subject_id.to_string());
    }
}

/// Collects every delivery a listener sees.
#[derive(Clone, Default)]
pub struct Collector {
    seen: Arc<Mutex<Vec<Delivery>>>,
}

impl Collector {
    pub fn attach(&self, listeners: &ListenerRegistry) -> Unsubscribe {
        let seen = self.seen.clone();
        listeners.add(Arc::new(move |d: &Delivery| {
            seen.lock().unwrap().push(d.clone());
        }))
    }

    pub fn callback(&self) -> impl Fn(&Delivery) + Send + Sync + 'static {
        let seen = self.seen.clone();
        move |d: &Delivery| seen.lock().unwrap().push(d.clone())
    }

    pub fn deliveries(&self) -> Vec<Delivery> {
        self.seen.lock().unwrap().clone()
    }

    pub fn ids(&self) -> Vec<String> {
        self.deliveries()
            .iter()
            .filter_map(|d| d.event.event_id.clone())
            .collect()
    }

    pub fn timestamps(&self) -> Vec<i64> {
        self.deliveries()
            .iter()
            .filter_map(|d| d.event.server_timestamp)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.seen.lock().unwrap().len()
    }
}

// ── Pipeline fixture ────────────────────────────────────────────

pub struct PipelineFixture {
    pub pipeline: Pipeline,
    pub log: Arc<ProcessedLog>,
    pub backend: Arc<MockBackend>,
    pub handler: Arc<RecordingHandler>,
    pub collector: Collector,
    pub acks: AckQueue,
    pub bus: Arc<LocalBus>,
    pub stats: Arc<EngineStats>,
    _listener: Unsubscribe,
}

impl PipelineFixture {
    /// Leader pipeline over an in-memory log. Must run inside a runtime.
    pub fn leader() -> Self {
        Self::build(Arc::new(ProcessedLog::open_in_memory().unwrap()), true)
    }

    pub fn follower() -> Self {
        Self::build(Arc::new(ProcessedLog::open_in_memory().unwrap()), false)
    }

    pub fn build(log: Arc<ProcessedLog>, leader: bool) -> Self {
        Self::build_with_origin(log, leader, ORIGIN)
    }

    /// A second client sharing `log` but stamping its own origin id.
    pub fn build_with_origin(log: Arc<ProcessedLog>, leader: bool, origin: &str) -> Self {
        let backend = MockBackend::new();
        let handler = RecordingHandler::new();
        let mut handlers = HandlerRegistry::new();
        handlers.register_all(handler.clone());

        let listeners = ListenerRegistry::new();
        let collector = Collector::default();
        let listener = collector.attach(&listeners);

        let (acks, worker) = create_ack_worker(backend.clone());
        tokio::spawn(worker.run());

        let bus = Arc::new(LocalBus::default());
        let stats = Arc::new(EngineStats::default());
        let dyn_bus: Arc<dyn BroadcastBus> = bus.clone();

        let mut pipeline = Pipeline::new(PipelineContext {
            subject_id: SUBJECT.to_string(),
            origin_id: origin.to_string(),
            tab_id: TabId::from("tab-test"),
            processed_log: log.clone(),
            authority: AuthorityLog::new(1024, 600_000),
            listeners,
            handlers,
            acks: acks.clone(),
            bus: dyn_bus,
            clock: Arc::new(TokioClock::new()),
            stats: stats.clone(),
        });
        pipeline.set_leader(leader);

        Self {
            pipeline,
            log,
            backend,
            handler,
            collector,
            acks,
            bus,
            stats,
            _listener: listener,
        }
    }
}
