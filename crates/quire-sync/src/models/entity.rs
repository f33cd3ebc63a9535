//! Capabilities shared by every synchronized entity kind.
//!
//! The applier, resolver and sender are written once against [`SyncEntity`]
//! and the [`KindDescriptor`] table instead of per-kind copies.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::ids::{Guid, LocalId, Usn};
use super::{LinkedNotebook, Note, Notebook, Resource, SavedSearch, Tag};

/// The kinds of entity the sync core knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Notebook,
    Tag,
    SavedSearch,
    Note,
    Resource,
    LinkedNotebook,
}

/// Static facts about one entity kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KindDescriptor {
    pub kind: EntityKind,
    /// Names must be unique (case-insensitively) within a scope.
    pub unique_names: bool,
    /// Kinds this one references and which must be synced first.
    pub depends_on: &'static [EntityKind],
    /// Send tier; every tier completes before the next begins.
    pub tier: u8,
}

/// Descriptor table, in dependency order.
pub const KIND_DESCRIPTORS: [KindDescriptor; 6] = [
    KindDescriptor {
        kind: EntityKind::LinkedNotebook,
        unique_names: false,
        depends_on: &[],
        tier: 0,
    },
    KindDescriptor {
        kind: EntityKind::Notebook,
        unique_names: true,
        depends_on: &[],
        tier: 0,
    },
    KindDescriptor {
        kind: EntityKind::SavedSearch,
        unique_names: true,
        depends_on: &[],
        tier: 0,
    },
    KindDescriptor {
        kind: EntityKind::Tag,
        unique_names: true,
        depends_on: &[EntityKind::Tag],
        tier: 1,
    },
    KindDescriptor {
        kind: EntityKind::Note,
        unique_names: false,
        depends_on: &[EntityKind::Notebook, EntityKind::Tag],
        tier: 2,
    },
    KindDescriptor {
        kind: EntityKind::Resource,
        unique_names: false,
        depends_on: &[EntityKind::Note],
        tier: 3,
    },
];

impl EntityKind {
    pub const fn label(self) -> &'static str {
        match self {
            Self::Notebook => "notebook",
            Self::Tag => "tag",
            Self::SavedSearch => "saved_search",
            Self::Note => "note",
            Self::Resource => "resource",
            Self::LinkedNotebook => "linked_notebook",
        }
    }

    pub fn descriptor(self) -> &'static KindDescriptor {
        KIND_DESCRIPTORS
            .iter()
            .find(|descriptor| descriptor.kind == self)
            .unwrap_or(&KIND_DESCRIPTORS[0])
    }

    pub fn has_unique_names(self) -> bool {
        self.descriptor().unique_names
    }

    /// Kinds in the order their upserts are applied or sent.
    pub fn dependency_order() -> impl Iterator<Item = Self> {
        KIND_DESCRIPTORS.iter().map(|descriptor| descriptor.kind)
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Sync bookkeeping carried by every entity.
///
/// Only `guid` and `usn` travel over the wire; everything else is local.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMeta {
    #[serde(skip)]
    pub local_id: LocalId,
    #[serde(default)]
    pub guid: Option<Guid>,
    #[serde(default)]
    pub usn: Option<Usn>,
    /// Modified locally since the last reconciliation with the server.
    #[serde(skip)]
    pub dirty: bool,
    /// Deleted locally, kept until the deletion reaches the server.
    #[serde(skip)]
    pub deleted: bool,
    /// Linked notebook this entity was reached through; `None` for the own account.
    #[serde(skip)]
    pub linked_notebook: Option<Guid>,
    /// Content fingerprint at the last reconciliation with the server.
    #[serde(skip)]
    pub synced_fingerprint: Option<String>,
}

impl SyncMeta {
    /// Metadata for an entity created on this device.
    pub fn new_local() -> Self {
        Self {
            dirty: true,
            ..Self::default()
        }
    }

    /// Metadata for an entity materialized from the server.
    pub fn from_remote(guid: Guid, usn: Usn) -> Self {
        Self {
            guid: Some(guid),
            usn: Some(usn),
            ..Self::default()
        }
    }

    pub const fn has_guid(&self) -> bool {
        self.guid.is_some()
    }
}

/// Reference from one entity to another, by local id and/or guid.
///
/// Only the guid is serialized; the local id is resolved against the local
/// store when an entity is applied.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Option<Guid>", into = "Option<Guid>")]
pub struct Link {
    pub local_id: Option<LocalId>,
    pub guid: Option<Guid>,
}

impl Link {
    pub const fn local(local_id: LocalId) -> Self {
        Self {
            local_id: Some(local_id),
            guid: None,
        }
    }

    pub const fn remote(guid: Guid) -> Self {
        Self {
            local_id: None,
            guid: Some(guid),
        }
    }

    pub const fn is_empty(&self) -> bool {
        self.local_id.is_none() && self.guid.is_none()
    }

    /// Stable key used in content fingerprints.
    pub fn fingerprint_key(&self) -> String {
        match (&self.guid, &self.local_id) {
            (Some(guid), _) => format!("g:{guid}"),
            (None, Some(local_id)) => format!("l:{local_id}"),
            (None, None) => String::new(),
        }
    }
}

impl From<Option<Guid>> for Link {
    fn from(guid: Option<Guid>) -> Self {
        Self {
            local_id: None,
            guid,
        }
    }
}

impl From<Link> for Option<Guid> {
    fn from(link: Link) -> Self {
        link.guid
    }
}

/// Hash of a serializable content view.
pub fn fingerprint_of<V: Serialize>(view: &V) -> String {
    let bytes = serde_json::to_vec(view).unwrap_or_default();
    blake3::hash(&bytes).to_hex().to_string()
}

/// Capability set shared by every entity kind.
pub trait SyncEntity: Clone + fmt::Debug + Sized + 'static {
    const KIND: EntityKind;

    fn meta(&self) -> &SyncMeta;
    fn meta_mut(&mut self) -> &mut SyncMeta;

    /// Display name, when the kind has one.
    fn name(&self) -> Option<&str> {
        None
    }

    fn set_name(&mut self, _name: String) {}

    /// Outgoing references to other entities.
    fn links(&self) -> Vec<(EntityKind, &Link)> {
        Vec::new()
    }

    fn links_mut(&mut self) -> Vec<(EntityKind, &mut Link)> {
        Vec::new()
    }

    /// Hash of the user-visible content, excluding sync bookkeeping.
    fn fingerprint(&self) -> String;

    fn into_entity(self) -> Entity;
    fn from_entity(entity: Entity) -> Option<Self>;
    fn from_entity_ref(entity: &Entity) -> Option<&Self>;

    fn local_id(&self) -> LocalId {
        self.meta().local_id
    }

    fn guid(&self) -> Option<&Guid> {
        self.meta().guid.as_ref()
    }

    fn is_dirty(&self) -> bool {
        self.meta().dirty
    }

    /// Content still matches what was last reconciled with the server.
    fn is_unchanged_since_sync(&self) -> bool {
        self.meta()
            .synced_fingerprint
            .as_deref()
            .is_some_and(|synced| synced == self.fingerprint())
    }

    /// Record the current content as reconciled with the server.
    fn mark_synced(&mut self) {
        let fingerprint = self.fingerprint();
        let meta = self.meta_mut();
        meta.dirty = false;
        meta.synced_fingerprint = Some(fingerprint);
    }
}

/// Any entity, for heterogeneous storage and transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entity {
    Notebook(Notebook),
    Tag(Tag),
    SavedSearch(SavedSearch),
    Note(Note),
    Resource(Resource),
    LinkedNotebook(LinkedNotebook),
}

impl Entity {
    pub const fn kind(&self) -> EntityKind {
        match self {
            Self::Notebook(_) => EntityKind::Notebook,
            Self::Tag(_) => EntityKind::Tag,
            Self::SavedSearch(_) => EntityKind::SavedSearch,
            Self::Note(_) => EntityKind::Note,
            Self::Resource(_) => EntityKind::Resource,
            Self::LinkedNotebook(_) => EntityKind::LinkedNotebook,
        }
    }

    pub const fn meta(&self) -> &SyncMeta {
        match self {
            Self::Notebook(entity) => &entity.meta,
            Self::Tag(entity) => &entity.meta,
            Self::SavedSearch(entity) => &entity.meta,
            Self::Note(entity) => &entity.meta,
            Self::Resource(entity) => &entity.meta,
            Self::LinkedNotebook(entity) => &entity.meta,
        }
    }

    pub fn meta_mut(&mut self) -> &mut SyncMeta {
        match self {
            Self::Notebook(entity) => &mut entity.meta,
            Self::Tag(entity) => &mut entity.meta,
            Self::SavedSearch(entity) => &mut entity.meta,
            Self::Note(entity) => &mut entity.meta,
            Self::Resource(entity) => &mut entity.meta,
            Self::LinkedNotebook(entity) => &mut entity.meta,
        }
    }

    pub fn name(&self) -> Option<&str> {
        match self {
            Self::Notebook(entity) => entity.name(),
            Self::Tag(entity) => entity.name(),
            Self::SavedSearch(entity) => entity.name(),
            Self::Note(entity) => entity.name(),
            Self::Resource(entity) => entity.name(),
            Self::LinkedNotebook(entity) => entity.name(),
        }
    }
}

macro_rules! entity_conversions {
    ($ty:ident) => {
        fn into_entity(self) -> Entity {
            Entity::$ty(self)
        }

        fn from_entity(entity: Entity) -> Option<Self> {
            match entity {
                Entity::$ty(inner) => Some(inner),
                _ => None,
            }
        }

        fn from_entity_ref(entity: &Entity) -> Option<&Self> {
            match entity {
                Entity::$ty(inner) => Some(inner),
                _ => None,
            }
        }
    };
}

pub(crate) use entity_conversions;
