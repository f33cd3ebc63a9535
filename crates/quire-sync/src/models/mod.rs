//! Data models for Quire sync

mod chunk;
mod entity;
mod ids;
mod linked_notebook;
mod note;
mod notebook;
mod resource;
mod saved_search;
mod scope;
mod tag;

pub use chunk::{SyncChunk, SyncState};
pub use entity::{
    fingerprint_of, Entity, EntityKind, KindDescriptor, Link, SyncEntity, SyncMeta,
    KIND_DESCRIPTORS,
};
pub use ids::{AccountId, Guid, LocalId, Usn};
pub use linked_notebook::LinkedNotebook;
pub use note::Note;
pub use notebook::Notebook;
pub use resource::Resource;
pub use saved_search::SavedSearch;
pub use scope::Scope;
pub use tag::Tag;
