//! # Stream Merger
//!
//! Combines pulled history pages and pushed live items into one sequence
//! per topic.
//!
//! ## Guarantees
//!
//! - **No duplicates**: every id appears at most once, checked in O(1)
//!   through an id index.
//! - **Ordered**: items are non-decreasing by `(created_at, id)`. Live items
//!   that arrive out of order are inserted at their sorted position instead
//!   of being rejected.
//! - **Append-only**: merged items are never edited or removed, only the
//!   whole stream can be cleared when a topic is reopened.
//!
//! The merger is pure state; sequencing (history first, then queued live
//! items) is the job of [`crate::client::stream::FeedSet`].

use crate::shared::StreamItem;
use std::collections::HashSet;

/// Result of merging one item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// Added at the tail
    Appended,
    /// Added before the tail to keep order
    Inserted,
    /// Id already present; nothing changed
    Duplicate,
}

impl InsertOutcome {
    pub fn is_new(self) -> bool {
        !matches!(self, InsertOutcome::Duplicate)
    }
}

/// Ordered, deduplicated sequence for one topic
#[derive(Debug, Clone)]
pub struct MergedStream<T: StreamItem> {
    items: Vec<T>,
    index: HashSet<T::Id>,
    /// Highest history page index merged so far
    cursor: Option<u32>,
    is_live: bool,
}

impl<T: StreamItem> Default for MergedStream<T> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            index: HashSet::new(),
            cursor: None,
            is_live: false,
        }
    }
}

impl<T: StreamItem> MergedStream<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge a single item.
    pub fn insert(&mut self, item: T) -> InsertOutcome {
        if self.index.contains(&item.id()) {
            return InsertOutcome::Duplicate;
        }
        let key = item.order_key();
        self.index.insert(item.id());

        let in_order = self.items.last().map_or(true, |last| last.order_key() <= key);
        if in_order {
            self.items.push(item);
            InsertOutcome::Appended
        } else {
            let at = self.items.partition_point(|existing| existing.order_key() < key);
            self.items.insert(at, item);
            InsertOutcome::Inserted
        }
    }

    /// Merge a history page delivered most-recent-first.
    ///
    /// Returns how many items were new.
    pub fn merge_page(&mut self, page: Vec<T>) -> usize {
        page.into_iter()
            .rev()
            .map(|item| self.insert(item))
            .filter(|outcome| outcome.is_new())
            .count()
    }

    /// Record that history page `page` has been consumed.
    pub fn mark_page_loaded(&mut self, page: u32) {
        self.cursor = Some(self.cursor.map_or(page, |current| current.max(page)));
    }

    /// Index of the next older page to request
    pub fn next_page(&self) -> u32 {
        self.cursor.map_or(0, |page| page + 1)
    }

    pub fn cursor(&self) -> Option<u32> {
        self.cursor
    }

    pub fn set_live(&mut self, live: bool) {
        self.is_live = live;
    }

    pub fn is_live(&self) -> bool {
        self.is_live
    }

    pub fn items(&self) -> &[T] {
        &self.items
    }

    pub fn contains(&self, id: &T::Id) -> bool {
        self.index.contains(id)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
