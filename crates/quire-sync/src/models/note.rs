//! Note model

use serde::{Deserialize, Serialize};

use super::entity::{
    entity_conversions, fingerprint_of, Entity, EntityKind, Link, SyncEntity, SyncMeta,
};
use super::ids::LocalId;

/// A note in a notebook
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Note {
    #[serde(flatten)]
    pub meta: SyncMeta,
    /// Note title (not required to be unique)
    pub title: String,
    /// Note body in the service's markup; empty until fetched in full
    #[serde(default)]
    pub content: String,
    /// Notebook containing this note
    #[serde(rename = "notebook_guid")]
    pub notebook: Link,
    /// Tags applied to this note
    #[serde(default, rename = "tag_guids")]
    pub tags: Vec<Link>,
    /// `false` while the note sits in the trash
    #[serde(default = "default_active")]
    pub active: bool,
    /// Creation timestamp (Unix ms)
    #[serde(default)]
    pub created: i64,
    /// Last update timestamp (Unix ms)
    #[serde(default)]
    pub updated: i64,
}

const fn default_active() -> bool {
    true
}

impl Note {
    /// Create a new local note in the notebook with the given local id
    #[must_use]
    pub fn new(title: impl Into<String>, content: impl Into<String>, notebook: LocalId) -> Self {
        let now = chrono::Utc::now().timestamp_millis();
        Self {
            meta: SyncMeta::new_local(),
            title: title.into(),
            content: content.into(),
            notebook: Link::local(notebook),
            tags: Vec::new(),
            active: true,
            created: now,
            updated: now,
        }
    }

    /// Attach a tag by its local id
    #[must_use]
    pub fn with_tag(mut self, tag: LocalId) -> Self {
        self.tags.push(Link::local(tag));
        self
    }
}

impl SyncEntity for Note {
    const KIND: EntityKind = EntityKind::Note;

    fn meta(&self) -> &SyncMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut SyncMeta {
        &mut self.meta
    }

    fn name(&self) -> Option<&str> {
        Some(&self.title)
    }

    fn set_name(&mut self, name: String) {
        self.title = name;
    }

    fn links(&self) -> Vec<(EntityKind, &Link)> {
        std::iter::once((EntityKind::Notebook, &self.notebook))
            .chain(self.tags.iter().map(|tag| (EntityKind::Tag, tag)))
            .filter(|(_, link)| !link.is_empty())
            .collect()
    }

    fn links_mut(&mut self) -> Vec<(EntityKind, &mut Link)> {
        std::iter::once((EntityKind::Notebook, &mut self.notebook))
            .chain(self.tags.iter_mut().map(|tag| (EntityKind::Tag, tag)))
            .filter(|(_, link)| !link.is_empty())
            .collect()
    }

    fn fingerprint(&self) -> String {
        let mut tags: Vec<String> = self.tags.iter().map(Link::fingerprint_key).collect();
        tags.sort();
        fingerprint_of(&(
            &self.title,
            &self.content,
            self.notebook.fingerprint_key(),
            tags,
            self.active,
        ))
    }

    entity_conversions!(Note);
}
