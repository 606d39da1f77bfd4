//! # Identity Resolver
//!
//! Resolves the first `@name` token of an outgoing body to a user id, using
//! only senders already visible in the open topic. There is no directory
//! lookup.
//!
//! Display names are not unique. When several senders share a name the
//! configured [`TieBreak`] decides; the default keeps the sender seen most
//! recently. An unknown name is a [`IdentityResolutionMiss`], which is a
//! warning: the message is still sent, just without a target.

use crate::shared::{Message, UserId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Rule for display names shared by several senders
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TieBreak {
    /// Latest message with that name wins
    #[default]
    MostRecent,
    /// Earliest message with that name wins
    FirstSeen,
}

/// Mention that matched no observed sender
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityResolutionMiss {
    pub name: String,
}

impl fmt::Display for IdentityResolutionMiss {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "no sender named @{} has been seen in this topic", self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MentionResolution {
    /// Body contains no mention
    NoMention,
    Resolved { name: String, user_id: UserId },
    Unresolved(IdentityResolutionMiss),
}

impl MentionResolution {
    pub fn target(&self) -> Option<UserId> {
        match self {
            MentionResolution::Resolved { user_id, .. } => Some(*user_id),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MentionResolver {
    tie_break: TieBreak,
}

impl MentionResolver {
    pub fn new(tie_break: TieBreak) -> Self {
        Self { tie_break }
    }

    pub fn tie_break(&self) -> TieBreak {
        self.tie_break
    }

    /// First `@name` token. The `@` must start the body or follow
    /// whitespace; the name runs to the next whitespace.
    pub fn extract_mention(body: &str) -> Option<&str> {
        let mut previous: Option<char> = None;
        for (at, c) in body.char_indices() {
            let starts_token = previous.map_or(true, char::is_whitespace);
            previous = Some(c);
            if c != '@' || !starts_token {
                continue;
            }
            let rest = &body[at + c.len_utf8()..];
            let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
            if end > 0 {
                return Some(&rest[..end]);
            }
        }
        None
    }

    /// Display name to sender id, for `messages` in ascending order
    pub fn directory<'a>(&self, messages: &'a [Message]) -> HashMap<&'a str, UserId> {
        let mut names = HashMap::new();
        for message in messages.iter().filter(|m| !m.sender_display_name.is_empty()) {
            let name = message.sender_display_name.as_str();
            match self.tie_break {
                TieBreak::MostRecent => {
                    names.insert(name, message.sender_id);
                }
                TieBreak::FirstSeen => {
                    names.entry(name).or_insert(message.sender_id);
                }
            }
        }
        names
    }

    pub fn resolve(&self, body: &str, messages: &[Message]) -> MentionResolution {
        let Some(name) = Self::extract_mention(body) else {
            return MentionResolution::NoMention;
        };
        match self.directory(messages).get(name) {
            Some(user_id) => MentionResolution::Resolved {
                name: name.to_string(),
                user_id: *user_id,
            },
            None => {
                let miss = IdentityResolutionMiss { name: name.to_string() };
                tracing::warn!(mention = %name, "{}", miss);
                MentionResolution::Unresolved(miss)
            }
        }
    }
}
