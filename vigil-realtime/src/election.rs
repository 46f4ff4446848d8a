//! Leader election among tabs of one origin.
//!
//! There is no coordinator and no lock. Every tab evaluates the same pure
//! comparison ([`Claim::precedence`]) over the claims it sees on the bus, so
//! independent decisions converge. The shared lease only tells a tab that a
//! leader exists and is alive; it is advisory and re-read before every write.
//!
//! State machine: `Candidate -> Leading | Following`, `Following -> Candidate`
//! on lease expiry or surrender, `Leading -> Following` on surrender or when a
//! better claim shows up.

use crate::bus::{BroadcastBus, BusMessage, BusReceiver, Envelope};
use crate::clock::Clock;
use crate::config::ElectionConfig;
use crate::error::{RealtimeError, RealtimeResult};
use crate::types::TabId;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use vigil_storage::{LeaseRecord, LeaseStore};

pub const FOREGROUND_PRIORITY: u8 = 100;
pub const BACKGROUND_PRIORITY: u8 = 0;

/// `100` for a foreground tab, `0` otherwise.
pub fn priority_for(foreground: bool) -> u8 {
    if foreground {
        FOREGROUND_PRIORITY
    } else {
        BACKGROUND_PRIORITY
    }
}

/// A tab's bid for leadership.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claim {
    pub tab_id: TabId,
    pub priority: u8,
    /// Tab creation time in ms since the Unix epoch.
    pub created_at: i64,
}

impl Claim {
    /// Total order over claims; `Greater` means `self` wins.
    ///
    /// 1. higher priority
    /// 2. older creation timestamp
    /// 3. lexicographically smaller tab id
    pub fn precedence(&self, other: &Claim) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.created_at.cmp(&self.created_at))
            .then_with(|| other.tab_id.cmp(&self.tab_id))
    }

    pub fn outranks(&self, other: &Claim) -> bool {
        self.precedence(other) == Ordering::Greater
    }

    pub fn from_lease(lease: &LeaseRecord) -> Self {
        Self {
            tab_id: TabId::from(lease.leader_id.as_str()),
            priority: lease.priority,
            created_at: lease.created_at,
        }
    }
}

/// Picks the winner among any number of claims, independent of order.
pub fn winner<'a>(claims: impl IntoIterator<Item = &'a Claim>) -> Option<&'a Claim> {
    claims.into_iter().max_by(|a, b| a.precedence(b))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Candidate,
    Leading,
    Following,
}

#[derive(Debug)]
enum ElectionCommand {
    SetForeground(bool),
    Surrender,
    Shutdown,
}

/// Handle to query and steer one tab's election actor.
#[derive(Clone)]
pub struct ElectionHandle {
    tab_id: TabId,
    role_rx: watch::Receiver<Role>,
    leader_rx: watch::Receiver<Option<TabId>>,
    command_tx: mpsc::UnboundedSender<ElectionCommand>,
}

impl ElectionHandle {
    pub fn tab_id(&self) -> &TabId {
        &self.tab_id
    }

    pub fn role(&self) -> Role {
        *self.role_rx.borrow()
    }

    pub fn is_leader(&self) -> bool {
        self.role() == Role::Leading
    }

    /// The leader this tab currently believes in, itself included.
    pub fn leader(&self) -> Option<TabId> {
        self.leader_rx.borrow().clone()
    }

    pub fn subscribe_role(&self) -> watch::Receiver<Role> {
        self.role_rx.clone()
    }

    /// Visibility change. A signal, not a verdict: regaining the foreground
    /// asks the leader to surrender instead of claiming outright.
    pub fn set_foreground(&self, foreground: bool) -> RealtimeResult<()> {
        self.send(ElectionCommand::SetForeground(foreground))
    }

    /// Steps down if this tab is leading.
    pub fn surrender(&self) -> RealtimeResult<()> {
        self.send(ElectionCommand::Surrender)
    }

    /// Stops the actor, surrendering first if leading.
    pub fn shutdown(&self) -> RealtimeResult<()> {
        self.send(ElectionCommand::Shutdown)
    }

    fn send(&self, cmd: ElectionCommand) -> RealtimeResult<()> {
        self.command_tx
            .send(cmd)
            .map_err(|_| RealtimeError::ChannelClosed)
    }
}

/// Election actor for one tab. Drive it with [`LeaderElection::run`].
pub struct LeaderElection {
    me: TabId,
    created_at: i64,
    foreground: bool,
    role: Role,
    role_tx: watch::Sender<Role>,
    leader_tx: watch::Sender<Option<TabId>>,
    known_leader: Option<Claim>,
    /// Best rival candidacy seen while our election window is open.
    best_rival: Option<Claim>,
    window_deadline: Option<Instant>,
    config: ElectionConfig,
    bus: Arc<dyn BroadcastBus>,
    bus_rx: BusReceiver,
    lease_store: Arc<LeaseStore>,
    clock: Arc<dyn Clock>,
    command_rx: mpsc::UnboundedReceiver<ElectionCommand>,
}

impl LeaderElection {
    /// Creates the actor and its handle. The bus subscription starts here, so
    /// nothing posted between construction and `run` is missed.
    pub fn new(
        tab_id: TabId,
        created_at: i64,
        foreground: bool,
        config: ElectionConfig,
        bus: Arc<dyn BroadcastBus>,
        lease_store: Arc<LeaseStore>,
        clock: Arc<dyn Clock>,
    ) -> (ElectionHandle, LeaderElection) {
        let (role_tx, role_rx) = watch::channel(Role::Candidate);
        let (leader_tx, leader_rx) = watch::channel(None);
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let bus_rx = BusReceiver::new(tab_id.clone(), bus.subscribe());

        let handle = ElectionHandle {
            tab_id: tab_id.clone(),
            role_rx,
            leader_rx,
            command_tx,
        };

        let election = LeaderElection {
            me: tab_id,
            created_at,
            foreground,
            role: Role::Candidate,
            role_tx,
            leader_tx,
            known_leader: None,
            best_rival: None,
            window_deadline: None,
            config,
            bus,
            bus_rx,
            lease_store,
            clock,
            command_rx,
        };

        (handle, election)
    }

    /// Runs the election until shut down.
    pub async fn run(mut self) {
        info!("election: tab {} booting (priority {})", self.me, self.my_claim().priority);
        self.start_election();

        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval());
        let mut watchdog = tokio::time::interval(self.config.watchdog_interval());
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        watchdog.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // Skip first immediate tick
        heartbeat.tick().await;
        watchdog.tick().await;

        loop {
            let window_open = self.window_deadline.is_some();
            let deadline = self
                .window_deadline
                .unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

            tokio::select! {
                _ = tokio::time::sleep_until(deadline), if window_open => {
                    self.on_window_closed().await;
                }
                Some(envelope) = self.bus_rx.recv() => {
                    self.on_message(envelope).await;
                }
                _ = heartbeat.tick() => {
                    if self.role == Role::Leading {
                        self.heartbeat().await;
                    }
                }
                _ = watchdog.tick() => {
                    self.watchdog().await;
                }
                cmd = self.command_rx.recv() => {
                    match cmd {
                        Some(ElectionCommand::SetForeground(foreground)) => {
                            self.on_visibility(foreground);
                        }
                        Some(ElectionCommand::Surrender) => {
                            self.surrender(None).await;
                        }
                        Some(ElectionCommand::Shutdown) | None => {
                            if self.role == Role::Leading {
                                self.surrender(None).await;
                            }
                            info!("election: tab {} stopped", self.me);
                            break;
                        }
                    }
                }
            }
        }
    }

    fn my_claim(&self) -> Claim {
        Claim {
            tab_id: self.me.clone(),
            priority: priority_for(self.foreground),
            created_at: self.created_at,
        }
    }

    fn set_role(&mut self, role: Role) {
        if self.role != role {
            debug!("election: tab {} {:?} -> {:?}", self.me, self.role, role);
            self.role = role;
            let _ = self.role_tx.send(role);
        }
        if role != Role::Candidate {
            self.window_deadline = None;
            self.best_rival = None;
        }
    }

    fn set_known_leader(&mut self, leader: Option<Claim>) {
        let id = leader.as_ref().map(|c| c.tab_id.clone());
        self.known_leader = leader;
        self.leader_tx.send_if_modified(|current| {
            if *current != id {
                *current = id;
                true
            } else {
                false
            }
        });
    }

    fn post(&self, message: BusMessage) {
        self.bus.post(Envelope {
            sender: self.me.clone(),
            message,
        });
    }

    /// Enters `Candidate`, asks who leads and opens the election window.
    fn start_election(&mut self) {
        self.set_role(Role::Candidate);
        self.best_rival = None;
        self.window_deadline = Some(Instant::now() + self.config.election_window());
        self.post(BusMessage::WhoIsLeader {
            claim: self.my_claim(),
        });
    }

    async fn on_window_closed(&mut self) {
        self.window_deadline = None;
        if self.role != Role::Candidate {
            return;
        }

        let mine = self.my_claim();
        match self.best_rival.take() {
            Some(rival) if rival.outranks(&mine) => {
                debug!(
                    "election: tab {} defers to candidate {}",
                    self.me, rival.tab_id
                );
                self.set_role(Role::Following);
                self.set_known_leader(Some(rival));
            }
            _ => self.claim_leadership().await,
        }
    }

    async fn claim_leadership(&mut self) {
        if let Err(e) = self.write_lease().await {
            // The lease is advisory; the bus claim still settles the election.
            warn!("election: lease write failed for {}: {e}", self.me);
        }
        let mine = self.my_claim();
        self.set_role(Role::Leading);
        self.set_known_leader(Some(mine.clone()));
        self.post(BusMessage::IAmLeader { claim: mine });
        info!("election: tab {} is now leader", self.me);
    }

    fn step_down(&mut self, leader: Option<Claim>) {
        if self.role == Role::Leading {
            info!(
                "election: tab {} steps down for {:?}",
                self.me,
                leader.as_ref().map(|c| c.tab_id.to_string())
            );
        }
        self.set_role(Role::Following);
        self.set_known_leader(leader);
    }

    async fn surrender(&mut self, successor: Option<TabId>) {
        if self.role != Role::Leading {
            return;
        }
        self.step_down(None);

        let store = self.lease_store.clone();
        let me = self.me.as_str().to_string();
        match tokio::task::spawn_blocking(move || store.clear_if_held_by(&me)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!("election: failed to clear lease: {e}"),
            Err(e) => warn!("election: spawn_blocking panicked clearing lease: {e}"),
        }

        self.post(BusMessage::LeaderSurrendered {
            from: self.me.clone(),
            successor,
        });
    }

    async fn on_message(&mut self, envelope: Envelope) {
        match envelope.message {
            BusMessage::WhoIsLeader { claim } => match self.role {
                Role::Leading => self.post(BusMessage::IAmLeader {
                    claim: self.my_claim(),
                }),
                Role::Candidate => {
                    let better = self
                        .best_rival
                        .as_ref()
                        .is_none_or(|best| claim.outranks(best));
                    if better {
                        self.best_rival = Some(claim);
                    }
                }
                Role::Following => {}
            },
            BusMessage::IAmLeader { claim } => self.on_leader_claim(claim).await,
            BusMessage::LeaderSurrenderRequest { claim } => {
                let honored = self.role == Role::Leading
                    && !self.foreground
                    && claim.outranks(&self.my_claim());
                if honored {
                    info!(
                        "election: tab {} surrenders to foreground tab {}",
                        self.me, claim.tab_id
                    );
                    self.surrender(Some(claim.tab_id)).await;
                } else {
                    debug!(
                        "election: tab {} ignores surrender request from {}",
                        self.me, claim.tab_id
                    );
                }
            }
            BusMessage::LeaderSurrendered { from, successor } => {
                if self
                    .known_leader
                    .as_ref()
                    .is_some_and(|leader| leader.tab_id == from)
                {
                    self.set_known_leader(None);
                }
                if successor.as_ref() == Some(&self.me) {
                    self.claim_leadership().await;
                } else if self.role != Role::Leading {
                    self.start_election();
                }
            }
            BusMessage::EventMirror { .. } => {}
        }
    }

    async fn on_leader_claim(&mut self, claim: Claim) {
        let mine = self.my_claim();
        match self.role {
            Role::Leading => {
                if claim.outranks(&mine) {
                    self.step_down(Some(claim));
                } else {
                    warn!(
                        "election: dual leaders {} and {}; reasserting",
                        self.me, claim.tab_id
                    );
                    self.post(BusMessage::IAmLeader { claim: mine });
                }
            }
            Role::Candidate => {
                if claim.outranks(&mine) {
                    self.step_down(Some(claim));
                } else {
                    self.claim_leadership().await;
                }
            }
            Role::Following => {
                let replace = self.known_leader.as_ref().is_none_or(|known| {
                    known.tab_id == claim.tab_id || claim.outranks(known)
                });
                if replace {
                    self.set_known_leader(Some(claim));
                }
            }
        }
    }

    async fn heartbeat(&mut self) {
        let mine = self.my_claim();
        match self.read_lease().await {
            Ok(Some(lease))
                if !lease.is_held_by(self.me.as_str())
                    && !lease.is_expired(self.clock.now_ms())
                    && Claim::from_lease(&lease).outranks(&mine) =>
            {
                self.step_down(Some(Claim::from_lease(&lease)));
                return;
            }
            Ok(_) => {}
            Err(e) => warn!("election: lease read failed during heartbeat: {e}"),
        }

        if let Err(e) = self.write_lease().await {
            warn!("election: heartbeat lease write failed: {e}");
        }
        self.post(BusMessage::IAmLeader { claim: mine });
    }

    async fn watchdog(&mut self) {
        let lease = match self.read_lease().await {
            Ok(lease) => lease,
            Err(e) => {
                warn!("election: watchdog lease read failed: {e}");
                return;
            }
        };
        let now = self.clock.now_ms();

        match lease {
            None => {
                if self.role != Role::Leading {
                    info!("election: tab {} found no lease; claiming", self.me);
                    self.set_role(Role::Candidate);
                }
                self.claim_leadership().await;
            }
            Some(lease) if lease.is_expired(now) => {
                if self.role != Role::Leading {
                    info!(
                        "election: lease of {} expired; tab {} claiming",
                        lease.leader_id, self.me
                    );
                    self.set_role(Role::Candidate);
                }
                self.claim_leadership().await;
            }
            Some(lease) if lease.is_held_by(self.me.as_str()) => {}
            Some(lease) => {
                let holder = Claim::from_lease(&lease);
                match self.role {
                    Role::Leading => {
                        // Someone else wrote over our lease: settle by claim.
                        self.heartbeat().await;
                    }
                    Role::Candidate | Role::Following => {
                        if self.role == Role::Following {
                            self.on_leader_claim(holder.clone()).await;
                        }
                        let mine = self.my_claim();
                        if self.foreground && holder.priority < mine.priority {
                            debug!(
                                "election: tab {} asks backgrounded leader {} to surrender",
                                self.me, holder.tab_id
                            );
                            self.post(BusMessage::LeaderSurrenderRequest { claim: mine });
                        }
                    }
                }
            }
        }
    }

    fn on_visibility(&mut self, foreground: bool) {
        if self.foreground == foreground {
            return;
        }
        self.foreground = foreground;
        debug!("election: tab {} foreground={foreground}", self.me);

        if foreground && self.role != Role::Leading {
            let mine = self.my_claim();
            let leader_is_lower = self
                .known_leader
                .as_ref()
                .is_none_or(|leader| leader.priority < mine.priority);
            if leader_is_lower {
                self.post(BusMessage::LeaderSurrenderRequest { claim: mine });
            }
        }
    }

    async fn read_lease(&self) -> RealtimeResult<Option<LeaseRecord>> {
        let store = self.lease_store.clone();
        let lease = tokio::task::spawn_blocking(move || store.read())
            .await
            .map_err(|e| RealtimeError::TaskFailed(e.to_string()))??;
        Ok(lease)
    }

    async fn write_lease(&self) -> RealtimeResult<()> {
        let mine = self.my_claim();
        let record = LeaseRecord {
            leader_id: mine.tab_id.as_str().to_string(),
            priority: mine.priority,
            created_at: mine.created_at,
            expires_at: self.clock.now_ms() + self.config.lease_duration_ms as i64,
            version: 0,
        };
        let store = self.lease_store.clone();
        tokio::task::spawn_blocking(move || store.write(&record))
            .await
            .map_err(|e| RealtimeError::TaskFailed(e.to_string()))??;
        Ok(())
    }
}
