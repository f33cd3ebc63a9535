//! Tag model

use serde::{Deserialize, Serialize};

use super::entity::{
    entity_conversions, fingerprint_of, Entity, EntityKind, Link, SyncEntity, SyncMeta,
};

/// A tag, optionally nested under a parent tag
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    #[serde(flatten)]
    pub meta: SyncMeta,
    /// Tag name, unique within its scope regardless of case
    pub name: String,
    /// Parent tag, if nested
    #[serde(default, rename = "parent_guid")]
    pub parent: Option<Link>,
}

impl Tag {
    /// Create a new local tag
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            meta: SyncMeta::new_local(),
            name: name.into(),
            parent: None,
        }
    }
}

impl SyncEntity for Tag {
    const KIND: EntityKind = EntityKind::Tag;

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

    fn links(&self) -> Vec<(EntityKind, &Link)> {
        self.parent
            .iter()
            .filter(|link| !link.is_empty())
            .map(|link| (EntityKind::Tag, link))
            .collect()
    }

    fn links_mut(&mut self) -> Vec<(EntityKind, &mut Link)> {
        self.parent
            .iter_mut()
            .filter(|link| !link.is_empty())
            .map(|link| (EntityKind::Tag, link))
            .collect()
    }

    fn fingerprint(&self) -> String {
        let parent = self.parent.as_ref().map(Link::fingerprint_key);
        fingerprint_of(&(&self.name, parent))
    }

    entity_conversions!(Tag);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Guid, LocalId};

    #[test]
    fn test_tag_without_parent_has_no_links() {
        let tag = Tag::new("rust");
        assert!(tag.links().is_empty());
    }

    #[test]
    fn test_tag_parent_is_a_tag_link() {
        let mut tag = Tag::new("async");
        tag.parent = Some(Link::local(LocalId::new()));
        let links = tag.links();
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].0, EntityKind::Tag);
    }

    #[test]
    fn test_parent_guid_round_trips_through_wire_form() {
        let json = r#"{"guid":"t-2","usn":7,"name":"child","parent_guid":"t-1"}"#;
        let tag: Tag = serde_json::from_str(json).unwrap();
        assert_eq!(tag.parent.unwrap().guid, Some(Guid::new("t-1")));
        assert_eq!(tag.meta.usn, Some(7));
        assert!(!tag.meta.dirty);
    }
}
