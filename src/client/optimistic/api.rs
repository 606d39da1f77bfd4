//! Mutation endpoints the coordinator reconciles against.

use crate::client::error::MutationError;
use crate::shared::EntityId;
use async_trait::async_trait;

#[async_trait]
pub trait MutationApi: Send + Sync + 'static {
    /// Toggle the current user's like; returns the authoritative like count.
    async fn like(&self, entity_id: EntityId) -> Result<u64, MutationError>;

    /// Toggle the current user's dislike. The server answers with the
    /// entity's like count, not a dislike count.
    async fn dislike(&self, entity_id: EntityId) -> Result<u64, MutationError>;

    /// Mark a notification read.
    async fn mark_read(&self, notification_id: EntityId) -> Result<(), MutationError>;
}
