/**
 * Message Data Structures
 *
 * This module defines the payloads that travel over both the history REST
 * endpoints and the live broker feed: chat `Message`s, push `Notification`s
 * and the `OutgoingMessage` a client publishes into a room.
 *
 * Every payload that can be merged into a topic sequence implements
 * `StreamItem`, which gives the merger a stable id and the
 * `(created_at, id)` ordering key.
 */
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::hash::Hash;

/// Stable user identifier assigned by the server.
pub type UserId = u64;

/// Stable entity identifier (message, notification, post).
pub type EntityId = u64;

/// Anything that can be merged into an ordered, deduplicated topic sequence.
pub trait StreamItem: Clone + Debug + Send + Sync + 'static {
    /// Identifier type; must be stable across history and live delivery.
    type Id: Clone + Debug + Eq + Hash + Ord + Send + Sync;

    /// Stable identifier used for deduplication.
    fn id(&self) -> Self::Id;

    /// Creation time used as the primary ordering key.
    fn created_at(&self) -> DateTime<Utc>;

    /// Full ordering key: creation time, ties broken by id.
    fn order_key(&self) -> (DateTime<Utc>, Self::Id) {
        (self.created_at(), self.id())
    }
}

/// Role tag attached to a sender in a room.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Regular participant
    #[default]
    Normal,
    /// Official account of the venue or artist
    Official,
    /// Delegate of an official account
    Delegate,
    /// Room moderator
    Moderator,
}

/// Represents a single chat message in a room.
///
/// Once merged into a topic sequence a message is never edited in place.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Server-assigned id, identical in history pages and live frames
    pub id: EntityId,
    /// Room the message belongs to
    pub topic_id: String,
    /// Author's user id
    pub sender_id: UserId,
    /// Author's display name at the time of sending
    pub sender_display_name: String,
    /// Message text
    pub body: String,
    /// Server timestamp
    pub created_at: DateTime<Utc>,
    /// Mention target, if the author addressed someone
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_user_id: Option<UserId>,
    /// Sender role
    #[serde(default)]
    pub kind: MessageKind,
}

impl StreamItem for Message {
    type Id = EntityId;

    fn id(&self) -> EntityId {
        self.id
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

/// Push notification delivered on a per-user queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    /// Server-assigned id
    pub id: EntityId,
    /// Recipient
    pub recipient_id: UserId,
    /// User who triggered the notification, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<UserId>,
    /// Display name of the triggering user
    #[serde(default)]
    pub sender_display_name: String,
    /// Notification text
    pub body: String,
    /// Server timestamp
    pub created_at: DateTime<Utc>,
    /// Category tag (mention, comment, like, ...)
    #[serde(default)]
    pub category: String,
    /// Read flag as last reported by the server
    #[serde(default)]
    pub read: bool,
}

impl StreamItem for Notification {
    type Id = EntityId;

    fn id(&self) -> EntityId {
        self.id
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

/// Message body a client publishes into a room.
///
/// The server assigns the id and timestamp and echoes the stored
/// `Message` back on the room topic.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingMessage {
    /// Room to publish into
    pub topic_id: String,
    /// Author, when known locally
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<UserId>,
    /// Message text
    pub body: String,
    /// Resolved mention target
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_user_id: Option<UserId>,
}
