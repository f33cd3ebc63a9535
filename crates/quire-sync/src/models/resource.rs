//! Resource (attachment) model

use serde::{Deserialize, Serialize};

use super::entity::{
    entity_conversions, fingerprint_of, Entity, EntityKind, Link, SyncEntity, SyncMeta,
};
use super::ids::LocalId;

/// Binary attachment belonging to a note
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    #[serde(flatten)]
    pub meta: SyncMeta,
    /// Owning note
    #[serde(rename = "note_guid")]
    pub note: Link,
    /// Content MIME type
    pub mime: String,
    /// Original file name, when known
    #[serde(default)]
    pub file_name: Option<String>,
    /// Hex digest of the body, as reported by the server
    pub data_hash: String,
    /// Body size in bytes
    #[serde(default)]
    pub size: i64,
    /// Body bytes; absent in sync chunks until fetched in full
    #[serde(default)]
    pub data: Option<Vec<u8>>,
}

impl Resource {
    /// Create a new local attachment for the note with the given local id
    #[must_use]
    pub fn new(note: LocalId, mime: impl Into<String>, data: Vec<u8>) -> Self {
        let data_hash = blake3::hash(&data).to_hex().to_string();
        Self {
            meta: SyncMeta::new_local(),
            note: Link::local(note),
            mime: mime.into(),
            file_name: None,
            data_hash,
            size: i64::try_from(data.len()).unwrap_or(i64::MAX),
            data: Some(data),
        }
    }
}

impl SyncEntity for Resource {
    const KIND: EntityKind = EntityKind::Resource;

    fn meta(&self) -> &SyncMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut SyncMeta {
        &mut self.meta
    }

    fn name(&self) -> Option<&str> {
        self.file_name.as_deref()
    }

    fn set_name(&mut self, name: String) {
        self.file_name = Some(name);
    }

    fn links(&self) -> Vec<(EntityKind, &Link)> {
        if self.note.is_empty() {
            Vec::new()
        } else {
            vec![(EntityKind::Note, &self.note)]
        }
    }

    fn links_mut(&mut self) -> Vec<(EntityKind, &mut Link)> {
        if self.note.is_empty() {
            Vec::new()
        } else {
            vec![(EntityKind::Note, &mut self.note)]
        }
    }

    fn fingerprint(&self) -> String {
        fingerprint_of(&(
            self.note.fingerprint_key(),
            &self.mime,
            &self.file_name,
            &self.data_hash,
        ))
    }

    entity_conversions!(Resource);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_new_hashes_body() {
        let resource = Resource::new(LocalId::new(), "image/png", vec![1, 2, 3]);
        assert_eq!(resource.size, 3);
        assert_eq!(resource.data_hash.len(), 64);
        assert!(resource.name().is_none());
    }

    #[test]
    fn test_fingerprint_ignores_body_bytes() {
        let mut resource = Resource::new(LocalId::new(), "image/png", vec![1, 2, 3]);
        let before = resource.fingerprint();
        resource.data = None;
        assert_eq!(before, resource.fingerprint());
    }
}
