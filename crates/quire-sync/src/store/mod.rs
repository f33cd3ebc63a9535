//! Local store interface consumed by the sync core.
//!
//! The storage engine itself lives outside this crate; the core only needs
//! transactional CRUD plus a few lookups. [`MemoryStore`] is a complete
//! in-process implementation.

mod memory;

pub use memory::{MemoryStore, MemoryTransaction};

use crate::error::Result;
use crate::models::{Guid, LocalId, SyncEntity};

/// Entry point to the local store.
#[allow(async_fn_in_trait)]
pub trait LocalStore {
    type Transaction: StoreTransaction;

    /// Open a transaction. Dropping it without `commit` discards its writes.
    async fn begin(&self) -> Result<Self::Transaction>;
}

/// Reads and writes performed inside one storage transaction.
///
/// `scope` is the guid of the linked notebook an entity belongs to, or
/// `None` for the own account. Name lookups are case-insensitive.
#[allow(async_fn_in_trait)]
pub trait StoreTransaction {
    /// Entities modified locally since their last sync, in local-id order.
    async fn list_dirty<T: SyncEntity>(&mut self) -> Result<Vec<T>>;

    /// Every entity of a kind within a scope, in local-id order.
    async fn list<T: SyncEntity>(&mut self, scope: Option<&Guid>) -> Result<Vec<T>>;

    async fn find_by_local_id<T: SyncEntity>(&mut self, local_id: LocalId) -> Result<Option<T>>;

    async fn find_by_guid<T: SyncEntity>(&mut self, guid: &Guid) -> Result<Option<T>>;

    async fn find_by_name<T: SyncEntity>(
        &mut self,
        name: &str,
        scope: Option<&Guid>,
    ) -> Result<Option<T>>;

    /// Insert a new entity. Fails when the local id or guid is already taken.
    async fn insert<T: SyncEntity>(&mut self, entity: &T) -> Result<()>;

    /// Replace the entity with the same local id.
    async fn update<T: SyncEntity>(&mut self, entity: &T) -> Result<()>;

    /// Remove an entity; removing a missing entity is not an error.
    async fn delete<T: SyncEntity>(&mut self, local_id: LocalId) -> Result<()>;

    async fn commit(self) -> Result<()>;
}
