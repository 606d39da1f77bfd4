//! # Optimistic Mutation Coordinator
//!
//! One apply/confirm/rollback state machine shared by every
//! toggle-and-reconcile action (like, dislike, mark-read).
//!
//! ## States
//!
//! ```text
//! Idle -> Pending -> Confirmed  -> Idle
//!                 \-> RolledBack -> Idle
//! ```
//!
//! - `apply` commits the optimistic value synchronously. No request has
//!   started when it returns, so the UI sees the change first.
//! - Only one mutation per `(entity, kind)` may be pending. A second
//!   `apply` for the same key is ignored and changes nothing.
//! - `confirm` reconciles the local value with the server response.
//! - `rollback` restores the pre-apply value exactly. If there was no value
//!   before, the slot is removed again. Nothing is retried.

use crate::client::error::MutationError;
use crate::shared::EntityId;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt::Debug;
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// What is being mutated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MutationKind {
    Like,
    Dislike,
    MarkRead,
}

/// Pending-guard key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MutationKey {
    pub entity_id: EntityId,
    pub kind: MutationKind,
}

impl MutationKey {
    pub fn new(entity_id: EntityId, kind: MutationKind) -> Self {
        Self { entity_id, kind }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationStatus {
    Pending,
    Confirmed,
    RolledBack,
}

/// A mutation in flight, or the record of one that just finished
#[derive(Debug, Clone, PartialEq)]
pub struct OptimisticMutation<V> {
    pub key: MutationKey,
    /// Value before apply; `None` if the slot did not exist
    pub before: Option<V>,
    /// Optimistic value, or the reconciled value once confirmed
    pub after: V,
    pub status: MutationStatus,
    pub applied_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome<V> {
    /// Committed; carries the optimistic value
    Applied(V),
    /// A mutation for this key is already pending
    Ignored,
}

impl<V> ApplyOutcome<V> {
    pub fn is_applied(&self) -> bool {
        matches!(self, ApplyOutcome::Applied(_))
    }
}

struct Inner<V> {
    values: HashMap<MutationKey, V>,
    pending: HashMap<MutationKey, OptimisticMutation<V>>,
}

/// Local values plus their pending mutations
pub struct MutationCoordinator<V> {
    inner: Mutex<Inner<V>>,
}

impl<V: Clone + Debug> Debug for MutationCoordinator<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("MutationCoordinator")
            .field("values", &inner.values.len())
            .field("pending", &inner.pending.len())
            .finish()
    }
}

/// Rolls a pending mutation back if `run` is dropped before it settles.
struct SettleGuard<'a, V: Clone + Debug> {
    coordinator: &'a MutationCoordinator<V>,
    key: MutationKey,
    armed: bool,
}

impl<V: Clone + Debug> SettleGuard<'_, V> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl<V: Clone + Debug> Drop for SettleGuard<'_, V> {
    fn drop(&mut self) {
        if self.armed {
            tracing::debug!(entity_id = self.key.entity_id, kind = ?self.key.kind, "Mutation abandoned before settling");
            self.coordinator.rollback(self.key);
        }
    }
}

impl<V> Default for MutationCoordinator<V> {
    fn default() -> Self {
        Self {
            inner: Mutex::new(Inner {
                values: HashMap::new(),
                pending: HashMap::new(),
            }),
        }
    }
}

impl<V: Clone + Debug> MutationCoordinator<V> {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner<V>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a server-known value. Ignored while a mutation is pending.
    pub fn seed(&self, key: MutationKey, value: V) -> bool {
        let mut inner = self.lock();
        if inner.pending.contains_key(&key) {
            return false;
        }
        inner.values.insert(key, value);
        true
    }

    /// Replace a settled value. Ignored while a mutation for `key` is pending.
    pub fn amend(&self, key: MutationKey, update: impl FnOnce(Option<&V>) -> V) -> bool {
        let mut inner = self.lock();
        if inner.pending.contains_key(&key) {
            return false;
        }
        let updated = update(inner.values.get(&key));
        inner.values.insert(key, updated);
        true
    }

    /// Compute and commit the optimistic value.
    pub fn apply(&self, key: MutationKey, compute: impl FnOnce(Option<&V>) -> V) -> ApplyOutcome<V> {
        let mut inner = self.lock();
        if inner.pending.contains_key(&key) {
            tracing::debug!(entity_id = key.entity_id, kind = ?key.kind, "Mutation already pending, ignoring");
            return ApplyOutcome::Ignored;
        }
        let before = inner.values.get(&key).cloned();
        let after = compute(before.as_ref());
        inner.values.insert(key, after.clone());
        inner.pending.insert(
            key,
            OptimisticMutation {
                key,
                before,
                after: after.clone(),
                status: MutationStatus::Pending,
                applied_at: Utc::now(),
            },
        );
        ApplyOutcome::Applied(after)
    }

    /// Overwrite the local value with the server's.
    pub fn confirm(&self, key: MutationKey, authoritative: V) -> Option<OptimisticMutation<V>> {
        self.confirm_with(key, |_| authoritative)
    }

    /// Reconcile the local value with the server response.
    pub fn confirm_with(&self, key: MutationKey, reconcile: impl FnOnce(V) -> V) -> Option<OptimisticMutation<V>> {
        let mut inner = self.lock();
        let mut mutation = inner.pending.remove(&key)?;
        let local = inner.values.remove(&key).unwrap_or_else(|| mutation.after.clone());
        let reconciled = reconcile(local);
        inner.values.insert(key, reconciled.clone());
        mutation.after = reconciled;
        mutation.status = MutationStatus::Confirmed;
        Some(mutation)
    }

    /// Restore the value from before `apply`.
    pub fn rollback(&self, key: MutationKey) -> Option<OptimisticMutation<V>> {
        let mut inner = self.lock();
        let mut mutation = inner.pending.remove(&key)?;
        match &mutation.before {
            Some(before) => {
                inner.values.insert(key, before.clone());
            }
            None => {
                inner.values.remove(&key);
            }
        }
        mutation.status = MutationStatus::RolledBack;
        tracing::warn!(entity_id = key.entity_id, kind = ?key.kind, "Rolled back optimistic mutation");
        Some(mutation)
    }

    /// Apply, run `request`, then confirm or roll back.
    ///
    /// Returns `Ok(None)` when the apply was ignored because a mutation for
    /// the same key is still pending.
    pub async fn run<R, Fut>(
        &self,
        key: MutationKey,
        compute: impl FnOnce(Option<&V>) -> V,
        request: impl FnOnce() -> Fut,
        reconcile: impl FnOnce(V, R) -> V,
    ) -> Result<Option<V>, MutationError>
    where
        Fut: Future<Output = Result<R, MutationError>>,
    {
        if !self.apply(key, compute).is_applied() {
            return Ok(None);
        }
        let guard = SettleGuard {
            coordinator: self,
            key,
            armed: true,
        };
        let result = request().await;
        guard.disarm();
        match result {
            Ok(response) => Ok(self
                .confirm_with(key, |local| reconcile(local, response))
                .map(|mutation| mutation.after)),
            Err(e) => {
                tracing::warn!(entity_id = key.entity_id, kind = ?key.kind, "Mutation failed: {}", e);
                self.rollback(key);
                Err(e)
            }
        }
    }

    pub fn value(&self, key: MutationKey) -> Option<V> {
        self.lock().values.get(&key).cloned()
    }

    pub fn is_pending(&self, key: MutationKey) -> bool {
        self.lock().pending.contains_key(&key)
    }

    pub fn pending(&self) -> Vec<OptimisticMutation<V>> {
        let mut pending: Vec<_> = self.lock().pending.values().cloned().collect();
        pending.sort_by_key(|mutation| mutation.key);
        pending
    }

    /// Current values for every key of `kind`
    pub fn values_of(&self, kind: MutationKind) -> Vec<(EntityId, V)> {
        let mut values: Vec<_> = self
            .lock()
            .values
            .iter()
            .filter(|(key, _)| key.kind == kind)
            .map(|(key, value)| (key.entity_id, value.clone()))
            .collect();
        values.sort_by_key(|(id, _)| *id);
        values
    }
}
