//! History source seam.

use crate::client::error::HistoryFetchError;
use crate::shared::{StreamItem, Topic};
use async_trait::async_trait;

/// Paginated, most-recent-first history for a topic.
///
/// Page `0` is the newest page; higher indexes go further back.
#[async_trait]
pub trait HistorySource<T: StreamItem>: Send + Sync + 'static {
    async fn fetch_page(&self, topic: &Topic, page: u32, size: u32) -> Result<Vec<T>, HistoryFetchError>;
}
