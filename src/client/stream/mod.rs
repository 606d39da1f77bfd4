//! Stream Module
//!
//! History plus live merging per topic: the pure merger, the feed
//! coordinator that sequences history against live delivery, and the
//! history source seam.

pub mod feed;
pub mod history;
pub mod merger;

pub use feed::{FeedSet, StreamSnapshot};
pub use history::HistorySource;
pub use merger::{InsertOutcome, MergedStream};
