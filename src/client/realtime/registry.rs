//! # Subscription Registry
//!
//! The only place that knows which handler serves which topic. At most one
//! handler is active per topic: registering again replaces the previous
//! handler and hands it back to the caller.
//!
//! The registry is owned by the session task and is only touched from that
//! task's sequential dispatch path, so it needs no lock of its own.

use crate::shared::Topic;
use std::collections::HashMap;

/// Callback invoked once per inbound payload for a topic
pub type Handler = Box<dyn FnMut(&str) + Send>;

/// Token identifying one registration; used to unsubscribe.
///
/// A handle only removes the registration it was issued for, so a stale
/// handle from a replaced registration is harmless.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    topic: Topic,
    id: u64,
}

impl SubscriptionHandle {
    pub fn topic(&self) -> &Topic {
        &self.topic
    }
}

struct Subscription {
    id: u64,
    handler: Handler,
}

/// Topic to handler map
#[derive(Default)]
pub struct SubscriptionRegistry {
    entries: HashMap<Topic, Subscription>,
    next_id: u64,
}

impl std::fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionRegistry")
            .field("topics", &self.entries.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `topic`, returning the new handle and the
    /// handler it replaced, if any.
    pub fn register(&mut self, topic: Topic, handler: Handler) -> (SubscriptionHandle, Option<Handler>) {
        self.next_id += 1;
        let id = self.next_id;
        let previous = self
            .entries
            .insert(topic.clone(), Subscription { id, handler })
            .map(|old| old.handler);
        if previous.is_some() {
            tracing::debug!(%topic, "Replaced existing handler");
        }
        (SubscriptionHandle { topic, id }, previous)
    }

    /// Remove the registration `handle` was issued for.
    ///
    /// Returns `false` when the handle is stale or already removed.
    pub fn remove(&mut self, handle: &SubscriptionHandle) -> bool {
        match self.entries.get(&handle.topic) {
            Some(entry) if entry.id == handle.id => {
                self.entries.remove(&handle.topic);
                true
            }
            _ => false,
        }
    }

    /// Remove whatever is registered for `topic`.
    pub fn remove_topic(&mut self, topic: &Topic) -> Option<Handler> {
        self.entries.remove(topic).map(|entry| entry.handler)
    }

    /// Invoke the handler for `topic`. Payloads for topics without a handler
    /// are dropped, never buffered.
    pub fn dispatch(&mut self, topic: &Topic, raw: &str) -> bool {
        match self.entries.get_mut(topic) {
            Some(entry) => {
                (entry.handler)(raw);
                true
            }
            None => {
                tracing::warn!(%topic, "Dropping message for topic without a handler");
                false
            }
        }
    }

    /// Topics with an active handler, in stable order
    pub fn topics(&self) -> Vec<Topic> {
        let mut topics: Vec<Topic> = self.entries.keys().cloned().collect();
        topics.sort();
        topics
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
