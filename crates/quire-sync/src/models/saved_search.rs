//! Saved search model

use serde::{Deserialize, Serialize};

use super::entity::{entity_conversions, fingerprint_of, Entity, EntityKind, SyncEntity, SyncMeta};

/// A named search query
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedSearch {
    #[serde(flatten)]
    pub meta: SyncMeta,
    pub name: String,
    pub query: String,
}

impl SavedSearch {
    #[must_use]
    pub fn new(name: impl Into<String>, query: impl Into<String>) -> Self {
        Self {
            meta: SyncMeta::new_local(),
            name: name.into(),
            query: query.into(),
        }
    }
}

impl SyncEntity for SavedSearch {
    const KIND: EntityKind = EntityKind::SavedSearch;

    fn meta(&self) -> &SyncMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut SyncMeta {
        &mut self.meta
    }

    fn name(&self) -> Option<&str> {
        Some(&self.name)
    }

    fn set_name(&mut self, name: String) {
        self.name = name;
    }

    fn fingerprint(&self) -> String {
        fingerprint_of(&(&self.name, &self.query))
    }

    entity_conversions!(SavedSearch);
}
