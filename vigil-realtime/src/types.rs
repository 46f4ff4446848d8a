//! Shared types for the realtime engine.

use crate::routing::EventKind;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A server-push event as it appears on the wire.
///
/// Identity and ordering fields are optional here because pure signaling
/// events (heartbeats, typing, presence) legitimately omit them; the pipeline
/// enforces the contract for domain events.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeEvent {
    #[serde(default)]
    pub event_id: Option<String>,
    #[serde(default)]
    pub server_timestamp: Option<i64>,
    #[serde(default, rename = "type")]
    pub event_type: Option<String>,
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Subject-scoped id of the client whose action produced this event.
    #[serde(default)]
    pub origin_id: Option<String>,
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub is_replay: bool,
}

impl RealtimeEvent {
    /// Builds a domain event carrying the full delivery contract.
    pub fn new(
        event_id: impl Into<String>,
        server_timestamp: i64,
        event_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            event_id: Some(event_id.into()),
            server_timestamp: Some(server_timestamp),
            event_type: Some(event_type.into()),
            payload,
            origin_id: None,
            channel: None,
            is_replay: false,
        }
    }

    /// Builds a signaling event with no identity.
    pub fn signal(event_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            event_id: None,
            server_timestamp: None,
            event_type: Some(event_type.into()),
            payload,
            origin_id: None,
            channel: None,
            is_replay: false,
        }
    }

    pub fn with_origin(mut self, origin_id: impl Into<String>) -> Self {
        self.origin_id = Some(origin_id.into());
        self
    }

    pub fn with_channel(mut self, channel: Channel) -> Self {
        self.channel = Some(channel.as_str().to_string());
        self
    }

    pub fn id(&self) -> Option<&str> {
        self.event_id.as_deref().filter(|id| !id.is_empty())
    }
}

/// Stable identifier of one tab (one engine instance).
///
/// Ordered lexicographically; the ordering is the last election tie-break.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TabId(String);

impl TabId {
    /// Time-ordered random id.
    pub fn generate() -> Self {
        Self(uuid::Uuid::now_v7().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TabId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for TabId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for TabId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Logical event domain used for routing and cursor tracking.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    /// Community-wide report feed.
    Feed,
    /// Events addressed to the subject (notifications, badges, points).
    User,
    /// Chat rooms.
    Chat,
    /// Per-report social thread (comments, votes).
    Social,
}

impl Channel {
    pub const ALL: [Channel; 4] = [Channel::Feed, Channel::User, Channel::Chat, Channel::Social];

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Feed => "feed",
            Channel::User => "user",
            Channel::Chat => "chat",
            Channel::Social => "social",
        }
    }
}

impl FromStr for Channel {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "feed" => Ok(Channel::Feed),
            "user" => Ok(Channel::User),
            "chat" => Ok(Channel::Chat),
            "social" => Ok(Channel::Social),
            _ => Err(()),
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connectivity health exposed to the UI.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Disconnected,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "HEALTHY"),
            HealthStatus::Degraded => write!(f, "DEGRADED"),
            HealthStatus::Disconnected => write!(f, "DISCONNECTED"),
        }
    }
}

/// Where a delivered event entered this tab.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeliverySource {
    /// This tab's own push stream.
    Live,
    /// Gap-resync catch-up.
    Replay,
    /// Decision mirrored from the leader tab.
    Mirror,
}

/// What listeners and domain handlers receive.
#[derive(Clone, Debug)]
pub struct Delivery {
    pub event: RealtimeEvent,
    pub kind: EventKind,
    pub channel: Channel,
    pub source: DeliverySource,
}

/// A dynamic resource whose stream can be watched.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum WatchTarget {
    Report(String),
    ChatRoom(String),
}

impl WatchTarget {
    /// Channel events on this resource's stream belong to.
    pub fn channel(&self) -> Channel {
        match self {
            WatchTarget::Report(_) => Channel::Social,
            WatchTarget::ChatRoom(_) => Channel::Chat,
        }
    }
}

impl fmt::Display for WatchTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WatchTarget::Report(id) => write!(f, "report:{id}"),
            WatchTarget::ChatRoom(id) => write!(f, "chat:{id}"),
        }
    }
}
