//! Linked notebook model

use serde::{Deserialize, Serialize};

use super::entity::{entity_conversions, fingerprint_of, Entity, EntityKind, SyncEntity, SyncMeta};

/// A notebook owned by another account and shared into this one.
///
/// Synced through its own note-store endpoint, credential and checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkedNotebook {
    #[serde(flatten)]
    pub meta: SyncMeta,
    /// Name the share appears under in this account
    pub share_name: String,
    /// Owner of the shared notebook
    pub username: String,
    /// Shard hosting the owner's data
    #[serde(default)]
    pub shard_id: Option<String>,
    /// Note-store endpoint of the owner's account
    pub note_store_url: String,
    /// Identifier used to authenticate to the shared notebook
    #[serde(default)]
    pub shared_notebook_global_id: Option<String>,
}

impl SyncEntity for LinkedNotebook {
    const KIND: EntityKind = EntityKind::LinkedNotebook;

    fn meta(&self) -> &SyncMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut SyncMeta {
        &mut self.meta
    }

    fn name(&self) -> Option<&str> {
        Some(&self.share_name)
    }

    fn set_name(&mut self, name: String) {
        self.share_name = name;
    }

    fn fingerprint(&self) -> String {
        fingerprint_of(&(
            &self.share_name,
            &self.username,
            &self.shard_id,
            &self.note_store_url,
            &self.shared_notebook_global_id,
        ))
    }

    entity_conversions!(LinkedNotebook);
}
