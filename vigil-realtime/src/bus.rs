//! Cross-tab broadcast bus.
//!
//! Message passing is the only coordination primitive tabs share besides the
//! durable store. Like a browser `BroadcastChannel`, a tab never receives its
//! own posts.

use crate::election::Claim;
use crate::types::{Channel, RealtimeEvent, TabId};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::warn;

/// Protocol messages exchanged between tabs.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BusMessage {
    /// Sent on boot and on re-election; carries the sender's own claim.
    WhoIsLeader { claim: Claim },
    /// Leader announcement and heartbeat.
    IAmLeader { claim: Claim },
    /// A foreground tab asking a backgrounded leader to step down.
    LeaderSurrenderRequest { claim: Claim },
    /// The leader stepped down.
    LeaderSurrendered {
        from: TabId,
        successor: Option<TabId>,
    },
    /// A domain event the leader validated and persisted. Receivers decide
    /// for themselves whether to notify it.
    EventMirror {
        event: RealtimeEvent,
        channel: Channel,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub sender: TabId,
    pub message: BusMessage,
}

pub trait BroadcastBus: Send + Sync {
    /// Posts to every other subscribed tab.
    fn post(&self, envelope: Envelope);

    /// Receives envelopes from all tabs, including this one; use
    /// [`BusReceiver`] to filter out self-posts.
    fn subscribe(&self) -> broadcast::Receiver<Envelope>;
}

/// In-process bus for tabs that share one runtime.
#[derive(Clone)]
pub struct LocalBus {
    tx: broadcast::Sender<Envelope>,
}

impl LocalBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl BroadcastBus for LocalBus {
    fn post(&self, envelope: Envelope) {
        // No receivers just means no other tab is alive.
        let _ = self.tx.send(envelope);
    }

    fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.tx.subscribe()
    }
}

/// One tab's view of the bus: self-posts are skipped, lag is logged.
pub struct BusReceiver {
    me: TabId,
    rx: broadcast::Receiver<Envelope>,
    skipped: u64,
}

impl BusReceiver {
    pub fn new(me: TabId, rx: broadcast::Receiver<Envelope>) -> Self {
        Self { me, rx, skipped: 0 }
    }

    /// Messages lost to lag since the last call; resets the count.
    pub fn take_skipped(&mut self) -> u64 {
        std::mem::take(&mut self.skipped)
    }

    /// Next envelope from another tab. `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<Envelope> {
        loop {
            match self.rx.recv().await {
                Ok(envelope) if envelope.sender == self.me => continue,
                Ok(envelope) => return Some(envelope),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("bus: tab {} lagged, skipped {skipped} messages", self.me);
                    self.skipped += skipped;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
