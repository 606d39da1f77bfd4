//! Payload builders

use chrono::{DateTime, TimeZone, Utc};
use livesync::shared::{EntityId, Message, MessageKind, Notification, UserId};

/// Deterministic timestamp `offset` seconds after a fixed epoch
pub fn at(offset: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + offset, 0).unwrap()
}

/// Message `id` created `id` seconds after the epoch
pub fn message(room: &str, id: EntityId) -> Message {
    message_from(room, id, 1, "user")
}

pub fn message_from(room: &str, id: EntityId, sender_id: UserId, name: &str) -> Message {
    Message {
        id,
        topic_id: room.to_string(),
        sender_id,
        sender_display_name: name.to_string(),
        body: format!("message {id}"),
        created_at: at(id as i64),
        target_user_id: None,
        kind: MessageKind::Normal,
    }
}

/// History page for `ids`, most-recent-first as the server sends it
pub fn page(room: &str, ids: impl DoubleEndedIterator<Item = EntityId>) -> Vec<Message> {
    ids.rev().map(|id| message(room, id)).collect()
}

pub fn notification(recipient: UserId, id: EntityId, read: bool) -> Notification {
    Notification {
        id,
        recipient_id: recipient,
        sender_id: Some(2),
        sender_display_name: "bob".to_string(),
        body: format!("notification {id}"),
        created_at: at(id as i64),
        category: "mention".to_string(),
        read,
    }
}

pub fn json<T: serde::Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap()
}
