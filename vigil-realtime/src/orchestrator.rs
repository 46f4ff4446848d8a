//! The authoritative event pipeline.
//!
//! Every event, whether live, replayed by gap-resync or mirrored from the
//! leader, goes through [`Pipeline::process_validated`]. For domain events the
//! order is fixed: persist, route, notify, submit ack, mirror. Nothing is
//! routed or notified unless the durable write succeeded first.

use crate::ack::{AckJob, AckQueue};
use crate::authority::{AuthorityLog, SuppressReason, Verdict};
use crate::backend::BackendApi;
use crate::bus::{BroadcastBus, BusMessage, Envelope};
use crate::clock::Clock;
use crate::error::{RealtimeError, RealtimeResult};
use crate::handlers::{HandlerRegistry, ListenerRegistry};
use crate::routing::{EventClass, EventKind, resolve_channel};
use crate::sse::{DEFAULT_EVENT, StreamMessage};
use crate::types::{Channel, Delivery, DeliverySource, RealtimeEvent, TabId};
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, error, info, warn};
use vigil_storage::{ProcessedEntry, ProcessedLog};

/// What happened to one event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Disposition {
    /// Routed and handed to listeners.
    Delivered,
    /// Already applied; dropped without notifying.
    Duplicate,
    /// Business fact already reflected locally; persisted and acked by the
    /// leader but not notified.
    Suppressed(SuppressReason),
    /// Follower saw a domain event the leader has not persisted yet; the
    /// leader's mirror will deliver it.
    Deferred,
    /// Contract violation; dropped with a diagnostic.
    Malformed,
    /// Durable write failed; nothing was notified or acked.
    PersistFailed,
}

/// Pipeline counters. Shared with the engine handle.
#[derive(Debug, Default)]
pub struct EngineStats {
    received: AtomicU64,
    delivered: AtomicU64,
    duplicates: AtomicU64,
    suppressed: AtomicU64,
    deferred: AtomicU64,
    malformed: AtomicU64,
    persist_failures: AtomicU64,
    resyncs: AtomicU64,
    resync_failures: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub received: u64,
    pub delivered: u64,
    pub duplicates: u64,
    pub suppressed: u64,
    pub deferred: u64,
    pub malformed: u64,
    pub persist_failures: u64,
    pub resyncs: u64,
    pub resync_failures: u64,
    pub acks_submitted: u64,
    pub ack_failures: u64,
}

impl EngineStats {
    pub fn snapshot(&self, acks: &AckQueue) -> StatsSnapshot {
        StatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            suppressed: self.suppressed.load(Ordering::Relaxed),
            deferred: self.deferred.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            persist_failures: self.persist_failures.load(Ordering::Relaxed),
            resyncs: self.resyncs.load(Ordering::Relaxed),
            resync_failures: self.resync_failures.load(Ordering::Relaxed),
            acks_submitted: acks.submitted(),
            ack_failures: acks.failed(),
        }
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Collaborators a [`Pipeline`] is built from.
pub struct PipelineContext {
    pub subject_id: String,
    /// Id this client stamps on events it originates; used for echo checks.
    pub origin_id: String,
    pub tab_id: TabId,
    pub processed_log: Arc<ProcessedLog>,
    pub authority: AuthorityLog,
    pub listeners: ListenerRegistry,
    pub handlers: HandlerRegistry,
    pub acks: AckQueue,
    pub bus: Arc<dyn BroadcastBus>,
    pub clock: Arc<dyn Clock>,
    pub stats: Arc<EngineStats>,
}

/// Per-tab processing state.
pub struct Pipeline {
    subject_id: String,
    origin_id: String,
    tab_id: TabId,
    processed_log: Arc<ProcessedLog>,
    authority: AuthorityLog,
    listeners: ListenerRegistry,
    handlers: HandlerRegistry,
    acks: AckQueue,
    bus: Arc<dyn BroadcastBus>,
    clock: Arc<dyn Clock>,
    stats: Arc<EngineStats>,
    leader: bool,
    /// Just below the oldest event whose durable write failed. Holds the
    /// resync watermark down until a resync completes.
    resync_floor: Option<i64>,
}

impl Pipeline {
    pub fn new(ctx: PipelineContext) -> Self {
        Self {
            subject_id: ctx.subject_id,
            origin_id: ctx.origin_id,
            tab_id: ctx.tab_id,
            processed_log: ctx.processed_log,
            authority: ctx.authority,
            listeners: ctx.listeners,
            handlers: ctx.handlers,
            acks: ctx.acks,
            bus: ctx.bus,
            clock: ctx.clock,
            stats: ctx.stats,
            leader: false,
            resync_floor: None,
        }
    }

    pub fn subject_id(&self) -> &str {
        &self.subject_id
    }

    pub fn is_leader(&self) -> bool {
        self.leader
    }

    /// Watermark override left by a failed persist, if any.
    pub fn resync_floor(&self) -> Option<i64> {
        self.resync_floor
    }

    /// Only the leader persists, acknowledges and mirrors.
    pub fn set_leader(&mut self, leader: bool) {
        if self.leader != leader {
            debug!("pipeline: leader={leader}");
        }
        self.leader = leader;
    }

    /// Parses a raw stream message and hands it to [`Self::process_validated`].
    ///
    /// The wire `type` field wins; a named stream event (anything but the
    /// default `message`) stands in when the payload omits it.
    pub async fn process_raw_event(
        &mut self,
        message: &StreamMessage,
        hint: Option<Channel>,
    ) -> Disposition {
        match parse_event(message) {
            Ok((event, kind)) => {
                let channel = resolve_channel(hint, event.channel.as_deref(), kind);
                self.process_validated(event, kind, channel, DeliverySource::Live)
                    .await
            }
            Err(e) => {
                EngineStats::bump(&self.stats.received);
                EngineStats::bump(&self.stats.malformed);
                warn!("pipeline: dropping malformed '{}' message: {e}", message.event);
                Disposition::Malformed
            }
        }
    }

    /// Runs one typed event through the pipeline.
    pub async fn process_validated(
        &mut self,
        mut event: RealtimeEvent,
        kind: EventKind,
        channel: Channel,
        source: DeliverySource,
    ) -> Disposition {
        EngineStats::bump(&self.stats.received);
        if source == DeliverySource::Replay {
            event.is_replay = true;
        }

        match kind.class() {
            EventClass::Control => {
                self.listeners.notify(&Delivery {
                    event,
                    kind,
                    channel,
                    source,
                });
                return Disposition::Delivered;
            }
            EventClass::StatusOnly => {
                self.deliver(Delivery {
                    event,
                    kind,
                    channel,
                    source,
                });
                return Disposition::Delivered;
            }
            EventClass::Domain => {}
        }

        let (event_id, server_timestamp) = match (event.id(), event.server_timestamp) {
            (Some(id), Some(ts)) => (id.to_string(), ts),
            _ => {
                EngineStats::bump(&self.stats.malformed);
                warn!(
                    "pipeline: dropping {} without eventId/serverTimestamp",
                    kind.as_str()
                );
                return Disposition::Malformed;
            }
        };

        let semantic_key = kind.semantic_key(&event.payload);
        let is_echo = event
            .origin_id
            .as_deref()
            .is_some_and(|origin| origin == self.origin_id);
        let now = self.clock.now_ms();
        let verdict = self
            .authority
            .inspect(Some(event_id.as_str()), semantic_key.as_deref(), is_echo, now);

        if verdict == Verdict::Seen {
            EngineStats::bump(&self.stats.duplicates);
            debug!("pipeline: duplicate {event_id} (authority)");
            return Disposition::Duplicate;
        }

        let delivery = Delivery {
            event,
            kind,
            channel,
            source,
        };

        if source == DeliverySource::Mirror {
            return self.apply_mirror(delivery, &event_id, semantic_key.as_deref(), verdict);
        }
        if !self.leader {
            return self
                .apply_as_follower(delivery, &event_id, semantic_key.as_deref(), verdict)
                .await;
        }

        // Persist. On failure nothing downstream runs.
        match self.persist(&event_id, channel, server_timestamp).await {
            Ok(true) => {}
            Ok(false) => {
                self.authority
                    .record(Some(event_id.as_str()), semantic_key.as_deref(), now);
                EngineStats::bump(&self.stats.duplicates);
                debug!("pipeline: duplicate {event_id} (durable log)");
                return Disposition::Duplicate;
            }
            Err(e) => {
                EngineStats::bump(&self.stats.persist_failures);
                error!("pipeline: persist failed for {event_id}, not notifying: {e}");
                // The cursor may still move past this event; keep it reachable.
                let floor = server_timestamp.saturating_sub(1);
                self.resync_floor = Some(self.resync_floor.map_or(floor, |f| f.min(floor)));
                return Disposition::PersistFailed;
            }
        }
        self.authority
            .record(Some(event_id.as_str()), semantic_key.as_deref(), now);

        let disposition = match verdict {
            Verdict::Suppressed(reason) => {
                EngineStats::bump(&self.stats.suppressed);
                debug!("pipeline: {event_id} suppressed ({reason:?})");
                Disposition::Suppressed(reason)
            }
            _ => {
                self.deliver(delivery.clone());
                Disposition::Delivered
            }
        };

        self.acks.submit(AckJob::Event(event_id.clone()));
        if let Some(message_id) = kind.delivery_ack_target(&delivery.event.payload) {
            self.acks.submit(AckJob::Delivered(message_id));
        }

        // Followers run their own authority check, so a suppression here (our
        // echo, say) is not necessarily one there.
        self.bus.post(Envelope {
            sender: self.tab_id.clone(),
            message: BusMessage::EventMirror {
                event: delivery.event,
                channel,
            },
        });
        disposition
    }

    /// Replays everything missed since the oldest cursor for this subject.
    ///
    /// Events are applied in ascending `serverTimestamp` order through the same
    /// pipeline as live ones. Returns how many were delivered.
    pub async fn resync(&mut self, backend: &dyn BackendApi) -> RealtimeResult<usize> {
        let since = match self.resync_watermark().await {
            Ok(since) => since,
            Err(e) => {
                EngineStats::bump(&self.stats.resync_failures);
                return Err(e);
            }
        };

        let mut events = match backend.catch_up(since).await {
            Ok(events) => events,
            Err(e) => {
                EngineStats::bump(&self.stats.resync_failures);
                warn!("pipeline: catch-up since {since} failed: {e}");
                return Err(e);
            }
        };
        events.sort_by_key(|e| e.server_timestamp.unwrap_or(i64::MIN));

        let total = events.len();
        let mut delivered = 0;
        for event in events {
            let Some(kind) = event.event_type.as_deref().and_then(EventKind::parse) else {
                EngineStats::bump(&self.stats.received);
                EngineStats::bump(&self.stats.malformed);
                warn!("pipeline: catch-up event with unknown type {:?}", event.event_type);
                continue;
            };
            let channel = resolve_channel(None, event.channel.as_deref(), kind);
            let outcome = self
                .process_validated(event, kind, channel, DeliverySource::Replay)
                .await;
            if outcome == Disposition::PersistFailed {
                EngineStats::bump(&self.stats.resync_failures);
                return Err(RealtimeError::TaskFailed(
                    "resync aborted: persist failed".into(),
                ));
            }
            if outcome == Disposition::Delivered {
                delivered += 1;
            }
        }

        self.resync_floor = None;
        EngineStats::bump(&self.stats.resyncs);
        info!("pipeline: resync since {since} applied {delivered}/{total} events");
        Ok(delivered)
    }

    /// Last-resort recovery after a failed resync.
    pub fn invalidate(&self) {
        warn!("pipeline: invalidating domain caches for {}", self.subject_id);
        self.handlers.invalidate(&self.subject_id);
    }

    fn deliver(&self, delivery: Delivery) {
        self.handlers.route(&delivery);
        self.listeners.notify(&delivery);
        EngineStats::bump(&self.stats.delivered);
    }

    /// Route and notify a decision the leader already made durable.
    fn apply_mirror(
        &mut self,
        delivery: Delivery,
        event_id: &str,
        semantic_key: Option<&str>,
        verdict: Verdict,
    ) -> Disposition {
        self.authority
            .record(Some(event_id), semantic_key, self.clock.now_ms());
        match verdict {
            Verdict::Suppressed(reason) => {
                EngineStats::bump(&self.stats.suppressed);
                Disposition::Suppressed(reason)
            }
            _ => {
                self.deliver(delivery);
                Disposition::Delivered
            }
        }
    }

    /// Followers only deliver what the leader already persisted.
    async fn apply_as_follower(
        &mut self,
        delivery: Delivery,
        event_id: &str,
        semantic_key: Option<&str>,
        verdict: Verdict,
    ) -> Disposition {
        let log = self.processed_log.clone();
        let id = event_id.to_string();
        let persisted = match tokio::task::spawn_blocking(move || log.is_processed(&id)).await {
            Ok(Ok(persisted)) => persisted,
            Ok(Err(e)) => {
                warn!("pipeline: follower lookup failed for {event_id}: {e}");
                false
            }
            Err(e) => {
                warn!("pipeline: spawn_blocking panicked checking {event_id}: {e}");
                false
            }
        };

        if !persisted {
            EngineStats::bump(&self.stats.deferred);
            debug!("pipeline: follower defers {event_id} to leader");
            return Disposition::Deferred;
        }
        self.apply_mirror(delivery, event_id, semantic_key, verdict)
    }

    async fn persist(
        &self,
        event_id: &str,
        channel: Channel,
        server_timestamp: i64,
    ) -> RealtimeResult<bool> {
        let log = self.processed_log.clone();
        let event_id = event_id.to_string();
        let subject_id = self.subject_id.clone();
        let processed_at = self.clock.now();
        let inserted = tokio::task::spawn_blocking(move || {
            log.record(&ProcessedEntry {
                event_id: &event_id,
                subject_id: &subject_id,
                channel: channel.as_str(),
                server_timestamp,
                processed_at,
            })
        })
        .await
        .map_err(|e| RealtimeError::TaskFailed(e.to_string()))??;
        Ok(inserted)
    }

    /// Oldest cursor across this subject's channels (0 when none exist),
    /// lowered to the floor of any failed persist.
    async fn resync_watermark(&self) -> RealtimeResult<i64> {
        let log = self.processed_log.clone();
        let subject_id = self.subject_id.clone();
        let cursors = tokio::task::spawn_blocking(move || log.cursors_for(&subject_id))
            .await
            .map_err(|e| RealtimeError::TaskFailed(e.to_string()))??;
        let oldest = cursors
            .iter()
            .map(|c| c.last_processed_server_timestamp)
            .min()
            .unwrap_or(0);
        Ok(self.resync_floor.map_or(oldest, |floor| oldest.min(floor)))
    }
}

/// Decodes a stream message into a typed event.
pub fn parse_event(message: &StreamMessage) -> RealtimeResult<(RealtimeEvent, EventKind)> {
    let mut event: RealtimeEvent = serde_json::from_str(&message.data)
        .map_err(|e| RealtimeError::Malformed(format!("invalid JSON: {e}")))?;

    if event.event_type.as_deref().is_none_or(str::is_empty) && message.event != DEFAULT_EVENT {
        event.event_type = Some(message.event.clone());
    }
    let event_type = event
        .event_type
        .as_deref()
        .ok_or_else(|| RealtimeError::Malformed("missing type".into()))?;
    let kind = EventKind::parse(event_type)
        .ok_or_else(|| RealtimeError::UnknownEventType(event_type.to_string()))?;
    Ok((event, kind))
}
