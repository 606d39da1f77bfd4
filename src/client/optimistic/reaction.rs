//! Like/dislike state.
//!
//! The boolean and the count come from different sources of truth and are
//! kept as separate fields. The flag is trusted locally because the server
//! only answers with a count. The count is advisory until a server response
//! replaces it.

use serde::{Deserialize, Serialize};

/// Where a count came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trust {
    /// Computed locally, to be superseded
    Advisory,
    /// Reported by the server
    #[default]
    Authoritative,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reaction {
    /// Whether the current user has reacted
    pub active: bool,
    pub count: u64,
    pub count_trust: Trust,
}

impl Reaction {
    /// Server-known state
    pub fn new(active: bool, count: u64) -> Self {
        Self {
            active,
            count,
            count_trust: Trust::Authoritative,
        }
    }

    /// Flip the flag and adjust the count locally.
    pub fn toggled(self) -> Self {
        let active = !self.active;
        let count = if active {
            self.count.saturating_add(1)
        } else {
            self.count.saturating_sub(1)
        };
        Self {
            active,
            count,
            count_trust: Trust::Advisory,
        }
    }

    /// Take the server's count, keep the local flag.
    pub fn confirmed(self, count: u64) -> Self {
        Self {
            active: self.active,
            count,
            count_trust: Trust::Authoritative,
        }
    }
}
