/**
 * Topic Routing
 *
 * A topic is a named broker channel: either a chat room or the private
 * notification queue of one user. The user id is always an explicit part of
 * the topic value, never ambient state, so several sessions (tests, several
 * windows) can coexist without colliding.
 *
 * # Destinations
 *
 * - Room feed: `/topic/chat/{room}`
 * - Room publish target: `/app/chat/{room}`
 * - Notification queue: `/queue/notifications/{user}`
 */
use crate::shared::message::UserId;
use serde::{Deserialize, Serialize};
use std::fmt;

const ROOM_PREFIX: &str = "/topic/chat/";
const ROOM_PUBLISH_PREFIX: &str = "/app/chat/";
const NOTIFICATION_PREFIX: &str = "/queue/notifications/";

/// A subscribable channel on the broker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "id")]
pub enum Topic {
    /// Chat room feed
    Room(String),
    /// Per-user notification queue
    Notifications(UserId),
}

impl Topic {
    /// Topic for a chat room
    pub fn room(room_id: impl Into<String>) -> Self {
        Self::Room(room_id.into())
    }

    /// Topic for a user's private notification queue
    pub fn notifications(user_id: UserId) -> Self {
        Self::Notifications(user_id)
    }

    /// Broker destination to subscribe to
    pub fn destination(&self) -> String {
        match self {
            Self::Room(room) => format!("{ROOM_PREFIX}{room}"),
            Self::Notifications(user) => format!("{NOTIFICATION_PREFIX}{user}"),
        }
    }

    /// Broker destination clients publish into, if the topic accepts publishes
    pub fn publish_destination(&self) -> Option<String> {
        match self {
            Self::Room(room) => Some(format!("{ROOM_PUBLISH_PREFIX}{room}")),
            Self::Notifications(_) => None,
        }
    }

    /// Parse a broker destination back into a topic.
    pub fn from_destination(destination: &str) -> Option<Self> {
        if let Some(room) = destination.strip_prefix(ROOM_PREFIX) {
            return (!room.is_empty()).then(|| Self::Room(room.to_string()));
        }
        destination
            .strip_prefix(NOTIFICATION_PREFIX)
            .and_then(|user| user.parse().ok())
            .map(Self::Notifications)
    }

    /// Room id for room topics
    pub fn room_id(&self) -> Option<&str> {
        match self {
            Self::Room(room) => Some(room),
            Self::Notifications(_) => None,
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.destination())
    }
}
