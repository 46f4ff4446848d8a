//! The per-tab realtime engine actor and its handle.
//!
//! `create_engine` wires the pool, election, ack worker and pipeline together
//! and returns a cloneable [`RealtimeHandle`] plus the [`RealtimeEngine`] to
//! spawn. The engine owns the pipeline and processes one input at a time, so
//! events from every source are applied strictly in arrival order.

use crate::ack::{AckFailure, AckQueue, AckWorker, create_ack_worker};
use crate::authority::AuthorityLog;
use crate::backend::BackendApi;
use crate::bus::{BroadcastBus, BusMessage, BusReceiver};
use crate::clock::{Clock, SystemClock};
use crate::config::RealtimeConfig;
use crate::election::{ElectionHandle, LeaderElection, Role};
use crate::error::{RealtimeError, RealtimeResult};
use crate::handlers::{EventListener, HandlerRegistry, ListenerRegistry, Unsubscribe};
use crate::orchestrator::{Disposition, EngineStats, Pipeline, PipelineContext, StatsSnapshot};
use crate::pool::{ConnectionPool, MessageCallback, PoolDiagnostic, PoolSubscription};
use crate::routing::EventKind;
use crate::sse::{DEFAULT_EVENT, StreamMessage};
use crate::transport::StreamConnector;
use crate::types::{
    Channel, Delivery, DeliverySource, HealthStatus, RealtimeEvent, TabId, WatchTarget,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, info, warn};
use vigil_storage::{LeaseStore, ProcessedLog};

/// Everything the engine needs from the outside world.
pub struct EngineDeps {
    pub connector: Arc<dyn StreamConnector>,
    pub backend: Arc<dyn BackendApi>,
    pub bus: Arc<dyn BroadcastBus>,
    pub processed_log: Arc<ProcessedLog>,
    pub lease_store: Arc<LeaseStore>,
    pub clock: Arc<dyn Clock>,
    pub handlers: HandlerRegistry,
    pub tab_id: TabId,
    /// Tab creation time in ms; defaults to the clock's current time.
    pub created_at: Option<i64>,
    pub foreground: bool,
    /// Id stamped on events this client originates. Defaults to the tab id.
    pub origin_id: Option<String>,
}

impl EngineDeps {
    pub fn new(
        connector: Arc<dyn StreamConnector>,
        backend: Arc<dyn BackendApi>,
        bus: Arc<dyn BroadcastBus>,
        processed_log: Arc<ProcessedLog>,
        lease_store: Arc<LeaseStore>,
    ) -> Self {
        Self {
            connector,
            backend,
            bus,
            processed_log,
            lease_store,
            clock: Arc::new(SystemClock),
            handlers: HandlerRegistry::new(),
            tab_id: TabId::generate(),
            created_at: None,
            foreground: true,
            origin_id: None,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_handlers(mut self, handlers: HandlerRegistry) -> Self {
        self.handlers = handlers;
        self
    }

    pub fn with_tab(mut self, tab_id: TabId, created_at: i64) -> Self {
        self.tab_id = tab_id;
        self.created_at = Some(created_at);
        self
    }

    pub fn with_foreground(mut self, foreground: bool) -> Self {
        self.foreground = foreground;
        self
    }

    pub fn with_origin_id(mut self, origin_id: impl Into<String>) -> Self {
        self.origin_id = Some(origin_id.into());
        self
    }
}

#[derive(Debug)]
enum EngineCommand {
    Watch(WatchTarget),
    Unwatch(WatchTarget),
    Resync(oneshot::Sender<RealtimeResult<usize>>),
    Sleep,
    Wake,
    Shutdown,
}

/// Cloneable handle to a running engine.
#[derive(Clone)]
pub struct RealtimeHandle {
    command_tx: mpsc::UnboundedSender<EngineCommand>,
    listeners: ListenerRegistry,
    election: ElectionHandle,
    health_rx: watch::Receiver<HealthStatus>,
    stats: Arc<EngineStats>,
    acks: AckQueue,
    origin_id: String,
}

impl RealtimeHandle {
    /// Registers a listener invoked once per logically distinct event, after
    /// it was deduplicated and persisted. Dropping the guard unsubscribes.
    pub fn on_event<F>(&self, callback: F) -> Unsubscribe
    where
        F: Fn(&Delivery) + Send + Sync + 'static,
    {
        let listener: EventListener = Arc::new(callback);
        self.listeners.add(listener)
    }

    /// Opens (or adds a reference to) the stream for a dynamic resource.
    pub fn watch(&self, target: WatchTarget) -> RealtimeResult<()> {
        self.send(EngineCommand::Watch(target))
    }

    /// Drops one reference; the stream closes with the last one.
    pub fn unwatch(&self, target: WatchTarget) -> RealtimeResult<()> {
        self.send(EngineCommand::Unwatch(target))
    }

    pub fn is_leader(&self) -> bool {
        self.election.is_leader()
    }

    pub fn role(&self) -> Role {
        self.election.role()
    }

    pub fn tab_id(&self) -> &TabId {
        self.election.tab_id()
    }

    pub fn origin_id(&self) -> &str {
        &self.origin_id
    }

    pub fn health_status(&self) -> HealthStatus {
        *self.health_rx.borrow()
    }

    pub fn subscribe_health(&self) -> watch::Receiver<HealthStatus> {
        self.health_rx.clone()
    }

    /// Runs a gap-resync now and returns how many events it delivered.
    pub async fn resync(&self) -> RealtimeResult<usize> {
        let (tx, rx) = oneshot::channel();
        self.send(EngineCommand::Resync(tx))?;
        rx.await.map_err(|_| RealtimeError::ChannelClosed)?
    }

    /// Tab went to the background. Connections stay open.
    pub fn sleep(&self) -> RealtimeResult<()> {
        self.send(EngineCommand::Sleep)
    }

    /// Tab came back. Always resyncs.
    pub fn wake(&self) -> RealtimeResult<()> {
        self.send(EngineCommand::Wake)
    }

    pub fn set_foreground(&self, foreground: bool) -> RealtimeResult<()> {
        self.election.set_foreground(foreground)
    }

    pub fn ack_failures(&self) -> broadcast::Receiver<AckFailure> {
        self.acks.subscribe_failures()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot(&self.acks)
    }

    pub fn shutdown(&self) -> RealtimeResult<()> {
        self.send(EngineCommand::Shutdown)
    }

    fn send(&self, cmd: EngineCommand) -> RealtimeResult<()> {
        self.command_tx
            .send(cmd)
            .map_err(|_| RealtimeError::ChannelClosed)
    }
}

type Inbound = (StreamMessage, Option<Channel>);

struct WatchEntry {
    refs: usize,
    _subscription: PoolSubscription,
}

/// The engine actor. Spawn [`RealtimeEngine::run`].
pub struct RealtimeEngine {
    config: RealtimeConfig,
    pipeline: Pipeline,
    pool: ConnectionPool,
    backend: Arc<dyn BackendApi>,
    election: Option<LeaderElection>,
    election_handle: ElectionHandle,
    ack_worker: Option<AckWorker>,
    bus_rx: BusReceiver,
    inbound_tx: mpsc::UnboundedSender<Inbound>,
    inbound_rx: mpsc::UnboundedReceiver<Inbound>,
    command_rx: mpsc::UnboundedReceiver<EngineCommand>,
    health_tx: watch::Sender<HealthStatus>,
    streams: Vec<PoolSubscription>,
    watches: HashMap<WatchTarget, WatchEntry>,
    asleep: bool,
}

/// Builds an engine for one tab watching `subject_id`.
pub fn create_engine(
    config: RealtimeConfig,
    subject_id: impl Into<String>,
    deps: EngineDeps,
) -> RealtimeResult<(RealtimeHandle, RealtimeEngine)> {
    config.validate()?;
    let subject_id = subject_id.into();

    let created_at = deps.created_at.unwrap_or_else(|| deps.clock.now_ms());
    let origin_id = deps
        .origin_id
        .clone()
        .unwrap_or_else(|| deps.tab_id.to_string());

    let (election_handle, election) = LeaderElection::new(
        deps.tab_id.clone(),
        created_at,
        deps.foreground,
        config.election.clone(),
        deps.bus.clone(),
        deps.lease_store.clone(),
        deps.clock.clone(),
    );
    let (acks, ack_worker) = create_ack_worker(deps.backend.clone());
    let stats = Arc::new(EngineStats::default());
    let listeners = ListenerRegistry::new();

    let pipeline = Pipeline::new(PipelineContext {
        subject_id,
        origin_id: origin_id.clone(),
        tab_id: deps.tab_id.clone(),
        processed_log: deps.processed_log,
        authority: AuthorityLog::new(config.authority.capacity, config.authority.ttl_ms),
        listeners: listeners.clone(),
        handlers: deps.handlers,
        acks: acks.clone(),
        bus: deps.bus.clone(),
        clock: deps.clock,
        stats: stats.clone(),
    });

    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let (health_tx, health_rx) = watch::channel(HealthStatus::Disconnected);

    let handle = RealtimeHandle {
        command_tx,
        listeners,
        election: election_handle.clone(),
        health_rx,
        stats,
        acks,
        origin_id,
    };

    let engine = RealtimeEngine {
        pool: ConnectionPool::new(deps.connector, config.pool.clone()),
        config,
        pipeline,
        backend: deps.backend,
        election: Some(election),
        election_handle,
        ack_worker: Some(ack_worker),
        bus_rx: BusReceiver::new(deps.tab_id, deps.bus.subscribe()),
        inbound_tx,
        inbound_rx,
        command_rx,
        health_tx,
        streams: Vec::new(),
        watches: HashMap::new(),
        asleep: false,
    };

    Ok((handle, engine))
}

impl RealtimeEngine {
    /// Runs until [`RealtimeHandle::shutdown`] or every handle is dropped.
    pub async fn run(mut self) {
        if let Some(election) = self.election.take() {
            tokio::spawn(election.run());
        }
        if let Some(worker) = self.ack_worker.take() {
            tokio::spawn(worker.run());
        }

        let mut role_rx = self.election_handle.subscribe_role();
        let mut diagnostics = self.pool.subscribe_diagnostics();
        self.open_base_streams();
        info!(
            "engine: started for subject {} (tab {})",
            self.pipeline.subject_id(),
            self.election_handle.tab_id()
        );

        loop {
            tokio::select! {
                Some((message, hint)) = self.inbound_rx.recv() => {
                    let disposition = self.pipeline.process_raw_event(&message, hint).await;
                    if disposition == Disposition::PersistFailed {
                        self.set_health(HealthStatus::Degraded);
                        self.close_gap("persist failure").await;
                    }
                }
                Some(envelope) = self.bus_rx.recv() => {
                    let skipped = self.bus_rx.take_skipped();
                    if let BusMessage::EventMirror { event, channel } = envelope.message {
                        self.on_mirror(event, channel).await;
                    }
                    if skipped > 0 {
                        // Lost mirrors would leave deferred events undelivered.
                        self.close_gap("bus lag").await;
                    }
                }
                diag = diagnostics.recv() => {
                    match diag {
                        Ok(diag) => self.on_diagnostic(diag).await,
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!("engine: missed {n} pool diagnostics");
                            self.recompute_connectivity();
                        }
                        Err(broadcast::error::RecvError::Closed) => {}
                    }
                }
                Ok(()) = role_rx.changed() => {
                    let role = *role_rx.borrow_and_update();
                    self.on_role(role).await;
                }
                cmd = self.command_rx.recv() => {
                    match cmd {
                        Some(EngineCommand::Watch(target)) => self.watch(target),
                        Some(EngineCommand::Unwatch(target)) => self.unwatch(&target),
                        Some(EngineCommand::Resync(reply)) => {
                            let result = self.resync("requested").await;
                            let _ = reply.send(result);
                        }
                        Some(EngineCommand::Sleep) => self.sleep(),
                        Some(EngineCommand::Wake) => self.wake().await,
                        Some(EngineCommand::Shutdown) | None => break,
                    }
                }
            }
        }

        let _ = self.election_handle.shutdown();
        self.watches.clear();
        self.streams.clear();
        self.pool.shutdown();
        let _ = self.health_tx.send(HealthStatus::Disconnected);
        info!("engine: stopped");
    }

    fn stream_callback(&self, hint: Option<Channel>) -> MessageCallback {
        let tx = self.inbound_tx.clone();
        Arc::new(move |message: &StreamMessage| {
            let _ = tx.send((message.clone(), hint));
        })
    }

    fn open_base_streams(&mut self) {
        let subject_url = self.config.subject_stream_url(self.pipeline.subject_id());
        let feed_url = self.config.feed_stream_url();

        let subject = self
            .pool
            .subscribe(&subject_url, DEFAULT_EVENT, self.stream_callback(None));
        let feed = self
            .pool
            .subscribe(&feed_url, DEFAULT_EVENT, self.stream_callback(Some(Channel::Feed)));
        self.streams.push(subject);
        self.streams.push(feed);
    }

    fn watch(&mut self, target: WatchTarget) {
        if let Some(entry) = self.watches.get_mut(&target) {
            entry.refs += 1;
            debug!("engine: watch {target} refs -> {}", entry.refs);
            return;
        }

        let url = match &target {
            WatchTarget::Report(id) => self.config.report_stream_url(id),
            WatchTarget::ChatRoom(id) => self.config.chat_stream_url(id),
        };
        let subscription =
            self.pool
                .subscribe(&url, DEFAULT_EVENT, self.stream_callback(Some(target.channel())));
        info!("engine: watching {target}");
        self.watches.insert(
            target,
            WatchEntry {
                refs: 1,
                _subscription: subscription,
            },
        );
    }

    fn unwatch(&mut self, target: &WatchTarget) {
        let Some(entry) = self.watches.get_mut(target) else {
            debug!("engine: unwatch of unknown {target}");
            return;
        };
        entry.refs -= 1;
        if entry.refs == 0 {
            self.watches.remove(target);
            info!("engine: stopped watching {target}");
        }
    }

    async fn on_mirror(&mut self, event: RealtimeEvent, channel: Channel) {
        let Some(kind) = event.event_type.as_deref().and_then(EventKind::parse) else {
            warn!("engine: mirror with unknown type {:?}", event.event_type);
            return;
        };
        self.pipeline
            .process_validated(event, kind, channel, DeliverySource::Mirror)
            .await;
    }

    async fn on_role(&mut self, role: Role) {
        let leading = role == Role::Leading;
        let was_leading = self.pipeline.is_leader();
        self.pipeline.set_leader(leading);

        if leading && !was_leading {
            info!("engine: promoted to leader, closing gap");
            self.close_gap("promotion").await;
        }
    }

    async fn on_diagnostic(&mut self, diag: PoolDiagnostic) {
        match diag {
            PoolDiagnostic::Connected { url, after_failures } => {
                self.set_health(HealthStatus::Healthy);
                if after_failures > 0 {
                    info!("engine: {url} back after {after_failures} failures");
                    self.close_gap("reconnect").await;
                }
            }
            PoolDiagnostic::Degraded {
                url,
                consecutive_failures,
            } => {
                warn!("engine: {url} failing ({consecutive_failures} in a row)");
                self.set_health(HealthStatus::Degraded);
            }
            PoolDiagnostic::Disconnected { .. } | PoolDiagnostic::Closed { .. } => {
                self.recompute_connectivity();
            }
        }
    }

    fn recompute_connectivity(&mut self) {
        if !self.pool.any_connected() {
            self.set_health(HealthStatus::Disconnected);
        }
    }

    fn sleep(&mut self) {
        if self.asleep {
            return;
        }
        self.asleep = true;
        debug!("engine: sleeping, streams stay open");
        let _ = self.election_handle.set_foreground(false);
    }

    async fn wake(&mut self) {
        self.asleep = false;
        let _ = self.election_handle.set_foreground(true);
        self.close_gap("wake").await;
    }

    /// Resync nobody waits on. A failure has already degraded health and
    /// invalidated the handlers by the time it returns.
    async fn close_gap(&mut self, reason: &str) {
        if let Err(e) = self.resync(reason).await {
            debug!("engine: {reason} resync left health degraded: {e}");
        }
    }

    async fn resync(&mut self, reason: &str) -> RealtimeResult<usize> {
        debug!("engine: resync ({reason})");
        match self.pipeline.resync(self.backend.as_ref()).await {
            Ok(delivered) => {
                self.set_health(HealthStatus::Healthy);
                Ok(delivered)
            }
            Err(e) => {
                warn!("engine: resync ({reason}) failed: {e}");
                self.set_health(HealthStatus::Degraded);
                self.pipeline.invalidate();
                Err(e)
            }
        }
    }

    fn set_health(&mut self, status: HealthStatus) {
        self.health_tx.send_if_modified(|current| {
            if *current != status {
                info!("engine: health {current} -> {status}");
                *current = status;
                true
            } else {
                false
            }
        });
    }
}
