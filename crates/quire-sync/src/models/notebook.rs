//! Notebook model

use serde::{Deserialize, Serialize};

use super::entity::{entity_conversions, fingerprint_of, Entity, EntityKind, SyncEntity, SyncMeta};

/// A notebook holding notes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notebook {
    #[serde(flatten)]
    pub meta: SyncMeta,
    /// Display name, unique within the account
    pub name: String,
    /// Optional stack grouping several notebooks
    #[serde(default)]
    pub stack: Option<String>,
    /// Notebook receiving notes created without an explicit target
    #[serde(default)]
    pub default_notebook: bool,
}

impl Notebook {
    /// Create a new local notebook, dirty and without a guid
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            meta: SyncMeta::new_local(),
            name: name.into(),
            stack: None,
            default_notebook: false,
        }
    }
}

impl SyncEntity for Notebook {
    const KIND: EntityKind = EntityKind::Notebook;

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
        fingerprint_of(&(&self.name, &self.stack, self.default_notebook))
    }

    entity_conversions!(Notebook);
}
