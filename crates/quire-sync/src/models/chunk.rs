//! Sync chunk and server sync state

use serde::{Deserialize, Serialize};

use super::entity::SyncEntity;
use super::ids::{Guid, Usn};
use super::{LinkedNotebook, Note, Notebook, Resource, SavedSearch, Tag};

/// Server-side summary used to decide whether and how to pull.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncState {
    /// Server clock (Unix ms)
    pub current_time: i64,
    /// Clients whose last sync predates this (Unix ms) must resync from scratch
    #[serde(default)]
    pub full_sync_before: i64,
    /// Highest USN assigned in the account
    pub update_count: Usn,
}

/// A paginated batch of remote changes in ascending USN order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncChunk {
    pub current_time: i64,
    /// Highest USN covered by this chunk; `None` when nothing is left
    pub chunk_high_usn: Option<Usn>,
    pub update_count: Usn,
    pub notebooks: Vec<Notebook>,
    pub tags: Vec<Tag>,
    pub searches: Vec<SavedSearch>,
    pub notes: Vec<Note>,
    pub resources: Vec<Resource>,
    pub linked_notebooks: Vec<LinkedNotebook>,
    pub expunged_notebooks: Vec<Guid>,
    pub expunged_tags: Vec<Guid>,
    pub expunged_searches: Vec<Guid>,
    pub expunged_notes: Vec<Guid>,
    pub expunged_linked_notebooks: Vec<Guid>,
}

impl SyncChunk {
    pub fn item_count(&self) -> usize {
        self.notebooks.len()
            + self.tags.len()
            + self.searches.len()
            + self.notes.len()
            + self.resources.len()
            + self.linked_notebooks.len()
            + self.expunged_notebooks.len()
            + self.expunged_tags.len()
            + self.expunged_searches.len()
            + self.expunged_notes.len()
            + self.expunged_linked_notebooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.item_count() == 0
    }

    /// Highest USN among the items, for servers that omit `chunk_high_usn`.
    pub fn max_item_usn(&self) -> Option<Usn> {
        fn max_of<T: SyncEntity>(items: &[T]) -> Option<Usn> {
            items.iter().filter_map(|item| item.meta().usn).max()
        }

        [
            max_of(&self.notebooks),
            max_of(&self.tags),
            max_of(&self.searches),
            max_of(&self.notes),
            max_of(&self.resources),
            max_of(&self.linked_notebooks),
        ]
        .into_iter()
        .flatten()
        .max()
    }

    /// Cursor value to persist once this chunk is applied.
    pub fn high_usn(&self) -> Option<Usn> {
        match (self.chunk_high_usn, self.max_item_usn()) {
            (Some(reported), Some(items)) => Some(reported.max(items)),
            (reported, items) => reported.or(items),
        }
    }
}
