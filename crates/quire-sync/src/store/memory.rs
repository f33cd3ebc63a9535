//! In-memory local store

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

use super::{LocalStore, StoreTransaction};
use crate::error::{Error, ErrorContext, Result};
use crate::models::{Entity, EntityKind, Guid, LocalId, SyncEntity};

#[derive(Debug, Clone, Default)]
struct Tables {
    rows: HashMap<EntityKind, BTreeMap<LocalId, Entity>>,
}

impl Tables {
    fn table(&self, kind: EntityKind) -> impl Iterator<Item = &Entity> {
        self.rows.get(&kind).into_iter().flat_map(BTreeMap::values)
    }

    fn typed<T: SyncEntity>(&self) -> impl Iterator<Item = &T> {
        self.table(T::KIND).filter_map(T::from_entity_ref)
    }

    fn guid_owner(&self, kind: EntityKind, guid: &Guid) -> Option<LocalId> {
        self.table(kind)
            .find(|entity| entity.meta().guid.as_ref() == Some(guid))
            .map(|entity| entity.meta().local_id)
    }
}

/// Local store kept entirely in memory.
///
/// Transactions are serialized: a transaction holds the store lock from
/// `begin` until it is committed or dropped.
#[derive(Clone, Default)]
pub struct MemoryStore {
    tables: Arc<Mutex<Tables>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every entity of a kind, in local-id order.
    pub async fn all<T: SyncEntity>(&self) -> Vec<T> {
        self.tables.lock().await.typed::<T>().cloned().collect()
    }

    /// Insert or replace entities outside of a transaction, for seeding.
    pub async fn seed<T: SyncEntity>(&self, entities: impl IntoIterator<Item = T>) {
        let mut tables = self.tables.lock().await;
        for entity in entities {
            let local_id = entity.local_id();
            tables
                .rows
                .entry(T::KIND)
                .or_default()
                .insert(local_id, entity.into_entity());
        }
    }
}

impl LocalStore for MemoryStore {
    type Transaction = MemoryTransaction;

    async fn begin(&self) -> Result<Self::Transaction> {
        let guard = Arc::clone(&self.tables).lock_owned().await;
        let staged = Tables::clone(&guard);
        Ok(MemoryTransaction { guard, staged })
    }
}

/// Staged copy of the tables, written back on commit.
pub struct MemoryTransaction {
    guard: OwnedMutexGuard<Tables>,
    staged: Tables,
}

impl MemoryTransaction {
    fn check_guid_free<T: SyncEntity>(&self, entity: &T, operation: &'static str) -> Result<()> {
        let Some(guid) = entity.guid() else {
            return Ok(());
        };
        match self.staged.guid_owner(T::KIND, guid) {
            Some(owner) if owner != entity.local_id() => Err(Error::integrity(
                "guid already belongs to another local entity",
                ErrorContext::new(operation)
                    .kind(T::KIND)
                    .guid(Some(guid))
                    .local_id(entity.local_id()),
            )),
            _ => Ok(()),
        }
    }
}

impl StoreTransaction for MemoryTransaction {
    async fn list_dirty<T: SyncEntity>(&mut self) -> Result<Vec<T>> {
        Ok(self
            .staged
            .typed::<T>()
            .filter(|entity| entity.is_dirty())
            .cloned()
            .collect())
    }

    async fn list<T: SyncEntity>(&mut self, scope: Option<&Guid>) -> Result<Vec<T>> {
        Ok(self
            .staged
            .typed::<T>()
            .filter(|entity| entity.meta().linked_notebook.as_ref() == scope)
            .cloned()
            .collect())
    }

    async fn find_by_local_id<T: SyncEntity>(&mut self, local_id: LocalId) -> Result<Option<T>> {
        Ok(self
            .staged
            .rows
            .get(&T::KIND)
            .and_then(|table| table.get(&local_id))
            .and_then(T::from_entity_ref)
            .cloned())
    }

    async fn find_by_guid<T: SyncEntity>(&mut self, guid: &Guid) -> Result<Option<T>> {
        Ok(self
            .staged
            .typed::<T>()
            .find(|entity| entity.guid() == Some(guid))
            .cloned())
    }

    async fn find_by_name<T: SyncEntity>(
        &mut self,
        name: &str,
        scope: Option<&Guid>,
    ) -> Result<Option<T>> {
        let wanted = name.to_lowercase();
        Ok(self
            .staged
            .typed::<T>()
            .filter(|entity| entity.meta().linked_notebook.as_ref() == scope)
            .find(|entity| {
                entity
                    .name()
                    .is_some_and(|candidate| candidate.to_lowercase() == wanted)
            })
            .cloned())
    }

    async fn insert<T: SyncEntity>(&mut self, entity: &T) -> Result<()> {
        let local_id = entity.local_id();
        let exists = self
            .staged
            .rows
            .get(&T::KIND)
            .is_some_and(|table| table.contains_key(&local_id));
        if exists {
            return Err(Error::Storage(format!(
                "{} with local id {local_id} already exists",
                T::KIND
            )));
        }
        self.check_guid_free(entity, "insert")?;
        self.staged
            .rows
            .entry(T::KIND)
            .or_default()
            .insert(local_id, entity.clone().into_entity());
        Ok(())
    }

    async fn update<T: SyncEntity>(&mut self, entity: &T) -> Result<()> {
        self.check_guid_free(entity, "update")?;
        let local_id = entity.local_id();
        let slot = self
            .staged
            .rows
            .get_mut(&T::KIND)
            .and_then(|table| table.get_mut(&local_id))
            .ok_or_else(|| {
                Error::Storage(format!("{} with local id {local_id} not found", T::KIND))
            })?;
        *slot = entity.clone().into_entity();
        Ok(())
    }

    async fn delete<T: SyncEntity>(&mut self, local_id: LocalId) -> Result<()> {
        if let Some(table) = self.staged.rows.get_mut(&T::KIND) {
            table.remove(&local_id);
        }
        Ok(())
    }

    async fn commit(mut self) -> Result<()> {
        *self.guard = std::mem::take(&mut self.staged);
        Ok(())
    }
}
