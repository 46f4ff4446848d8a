//! Closed set of event kinds and the total type -> channel routing table.
//!
//! Every wire `type` string the engine understands maps to exactly one
//! [`EventKind`]; adding a kind forces every `match` below to be updated.

use crate::types::Channel;
use serde_json::Value;

/// How the pipeline treats an event kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventClass {
    /// Pure signaling. Handed straight to listeners.
    Control,
    /// Idempotent UI reflection. Notified, never durably logged.
    StatusOnly,
    /// State transition. Full dedup -> persist -> notify -> ack treatment.
    Domain,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    // Control
    Heartbeat,
    Typing,
    Presence,
    // Status-only
    MessageDelivered,
    MessageRead,
    // Domain
    ReportCreated,
    ReportUpdated,
    ReportResolved,
    ReportDeleted,
    CommentCreated,
    CommentDeleted,
    VoteCast,
    ChatMessageCreated,
    NotificationCreated,
    BadgeAwarded,
    PointsAwarded,
}

impl EventKind {
    /// Parses a wire type string. `None` for types the engine does not know.
    pub fn parse(event_type: &str) -> Option<Self> {
        let kind = match event_type.trim().to_ascii_lowercase().as_str() {
            "heartbeat" | "ping" => EventKind::Heartbeat,
            "typing" | "typing_started" | "typing_stopped" => EventKind::Typing,
            "presence" | "presence_updated" => EventKind::Presence,
            "message_delivered" => EventKind::MessageDelivered,
            "message_read" => EventKind::MessageRead,
            "report_created" => EventKind::ReportCreated,
            "report_updated" => EventKind::ReportUpdated,
            "report_resolved" => EventKind::ReportResolved,
            "report_deleted" => EventKind::ReportDeleted,
            "comment_created" => EventKind::CommentCreated,
            "comment_deleted" => EventKind::CommentDeleted,
            "vote_cast" => EventKind::VoteCast,
            "chat_message_created" | "new_message" => EventKind::ChatMessageCreated,
            "notification_created" => EventKind::NotificationCreated,
            "badge_awarded" => EventKind::BadgeAwarded,
            "points_awarded" => EventKind::PointsAwarded,
            _ => return None,
        };
        Some(kind)
    }

    /// Canonical wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Heartbeat => "heartbeat",
            EventKind::Typing => "typing",
            EventKind::Presence => "presence",
            EventKind::MessageDelivered => "message_delivered",
            EventKind::MessageRead => "message_read",
            EventKind::ReportCreated => "report_created",
            EventKind::ReportUpdated => "report_updated",
            EventKind::ReportResolved => "report_resolved",
            EventKind::ReportDeleted => "report_deleted",
            EventKind::CommentCreated => "comment_created",
            EventKind::CommentDeleted => "comment_deleted",
            EventKind::VoteCast => "vote_cast",
            EventKind::ChatMessageCreated => "chat_message_created",
            EventKind::NotificationCreated => "notification_created",
            EventKind::BadgeAwarded => "badge_awarded",
            EventKind::PointsAwarded => "points_awarded",
        }
    }

    pub fn class(&self) -> EventClass {
        match self {
            EventKind::Heartbeat | EventKind::Typing | EventKind::Presence => EventClass::Control,
            EventKind::MessageDelivered | EventKind::MessageRead => EventClass::StatusOnly,
            EventKind::ReportCreated
            | EventKind::ReportUpdated
            | EventKind::ReportResolved
            | EventKind::ReportDeleted
            | EventKind::CommentCreated
            | EventKind::CommentDeleted
            | EventKind::VoteCast
            | EventKind::ChatMessageCreated
            | EventKind::NotificationCreated
            | EventKind::BadgeAwarded
            | EventKind::PointsAwarded => EventClass::Domain,
        }
    }

    /// Static type -> channel table, used when the subscription is ambiguous.
    pub fn default_channel(&self) -> Channel {
        match self {
            EventKind::ReportCreated
            | EventKind::ReportUpdated
            | EventKind::ReportResolved
            | EventKind::ReportDeleted => Channel::Feed,
            EventKind::CommentCreated | EventKind::CommentDeleted | EventKind::VoteCast => {
                Channel::Social
            }
            EventKind::ChatMessageCreated
            | EventKind::MessageDelivered
            | EventKind::MessageRead
            | EventKind::Typing => Channel::Chat,
            EventKind::NotificationCreated
            | EventKind::BadgeAwarded
            | EventKind::PointsAwarded
            | EventKind::Heartbeat
            | EventKind::Presence => Channel::User,
        }
    }

    /// Business-level idempotence key, independent of the transport event id.
    ///
    /// A badge is granted to a user once no matter how many distinct events
    /// announce it.
    pub fn semantic_key(&self, payload: &Value) -> Option<String> {
        match self {
            EventKind::BadgeAwarded => {
                let badge = field(payload, &["badgeId", "badge_id"])?;
                let user = field(payload, &["userId", "user_id"])?;
                Some(format!("badge:{badge}:{user}"))
            }
            _ => None,
        }
    }

    /// Message id that needs the domain-specific delivery acknowledgment.
    pub fn delivery_ack_target(&self, payload: &Value) -> Option<String> {
        match self {
            EventKind::ChatMessageCreated => field(payload, &["messageId", "message_id", "id"]),
            _ => None,
        }
    }
}

/// Picks the effective channel for an event.
///
/// An explicit subscription hint wins; otherwise the event's own `channel`
/// field; otherwise the static table.
pub fn resolve_channel(hint: Option<Channel>, declared: Option<&str>, kind: EventKind) -> Channel {
    if let Some(channel) = hint {
        return channel;
    }
    declared
        .and_then(|c| c.parse::<Channel>().ok())
        .unwrap_or_else(|| kind.default_channel())
}

fn field(payload: &Value, names: &[&str]) -> Option<String> {
    names.iter().find_map(|name| match payload.get(*name)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}
