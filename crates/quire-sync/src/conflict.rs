//! Reconciliation of a remote entity with a colliding local one.
//!
//! One algorithm serves every kind; the kind only contributes its
//! [`SyncEntity`] capabilities (guid, name, dirty flag, fingerprint).

use std::marker::PhantomData;

use crate::error::{Error, ErrorContext, Result};
use crate::models::{Guid, LocalId, SyncEntity, SyncMeta};
use crate::store::StoreTransaction;

/// A remote entity meeting a local one.
#[derive(Debug, Clone, Copy)]
pub enum Conflict<'a, T> {
    /// Both carry the same guid.
    Guid { remote: &'a T, local: &'a T },
    /// Same name within a scope, different (or no) guid.
    Name { remote: &'a T, local: &'a T },
}

/// How a conflict is settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Overwrite the local entity with the remote one.
    AcceptRemote,
    /// Rename the local entity, then insert the remote one.
    KeepLocalRenamed,
    /// Keep the local edit under the guid and store the remote version as a
    /// renamed second entity.
    KeepLocalAndDuplicateRemote,
}

pub struct ConflictResolver<T> {
    marker: String,
    _kind: PhantomData<fn() -> T>,
}

impl<T: SyncEntity> ConflictResolver<T> {
    pub fn new(marker: impl Into<String>) -> Self {
        Self {
            marker: marker.into(),
            _kind: PhantomData,
        }
    }

    pub fn decide(&self, conflict: Conflict<'_, T>) -> Result<Resolution> {
        match conflict {
            Conflict::Guid { remote, local } => {
                let (Some(remote_guid), Some(local_guid)) = (remote.guid(), local.guid()) else {
                    return Err(precondition("guid conflict without a guid on both sides", local));
                };
                if remote_guid != local_guid {
                    return Err(precondition("guid conflict between different guids", local));
                }

                let resolution = if local.meta().deleted
                    || !local.is_dirty()
                    || local.is_unchanged_since_sync()
                    || local.fingerprint() == remote.fingerprint()
                {
                    Resolution::AcceptRemote
                } else {
                    Resolution::KeepLocalAndDuplicateRemote
                };
                tracing::debug!(
                    kind = %T::KIND,
                    guid = %remote_guid,
                    ?resolution,
                    "Resolved guid conflict"
                );
                Ok(resolution)
            }
            Conflict::Name { remote, local } => {
                if !has_name(remote) || !has_name(local) {
                    return Err(precondition("name collision without a name on both sides", local));
                }
                tracing::debug!(
                    kind = %T::KIND,
                    name = local.name().unwrap_or_default(),
                    "Resolved name collision by renaming the local entity"
                );
                Ok(Resolution::KeepLocalRenamed)
            }
        }
    }

    /// `"<base> (conflicting)"` for the first attempt, `"<base> (conflicting N)"` after.
    pub fn conflict_name(&self, base: &str, attempt: usize) -> String {
        if attempt <= 1 {
            format!("{base} ({})", self.marker)
        } else {
            format!("{base} ({} {attempt})", self.marker)
        }
    }

    /// First conflict name not already used in the scope.
    pub async fn free_name<X: StoreTransaction>(
        &self,
        tx: &mut X,
        base: &str,
        scope: Option<&Guid>,
    ) -> Result<String> {
        for attempt in 1.. {
            let candidate = self.conflict_name(base, attempt);
            if tx.find_by_name::<T>(&candidate, scope).await?.is_none() {
                return Ok(candidate);
            }
        }
        Err(Error::internal(
            "ran out of conflict names",
            ErrorContext::new("resolve_conflict").kind(T::KIND),
        ))
    }

    /// Rename `local` to a free conflict name and mark it for sending.
    pub async fn rename_local<X: StoreTransaction>(&self, tx: &mut X, local: &mut T) -> Result<()> {
        let Some(base) = local.name().map(str::to_string) else {
            return Err(precondition("cannot rename an entity without a name", local));
        };
        let scope = local.meta().linked_notebook.clone();
        let name = self.free_name(tx, &base, scope.as_ref()).await?;
        tracing::info!(kind = %T::KIND, from = %base, to = %name, "Renamed conflicting local entity");
        local.set_name(name);
        local.meta_mut().dirty = true;
        Ok(())
    }

    /// A new local entity carrying the remote content under a conflict name.
    ///
    /// It has no guid and is dirty, so the send phase creates it remotely.
    pub async fn duplicate_remote<X: StoreTransaction>(&self, tx: &mut X, remote: &T) -> Result<T> {
        let scope = remote.meta().linked_notebook.clone();
        let mut duplicate = remote.clone();
        *duplicate.meta_mut() = SyncMeta {
            local_id: LocalId::new(),
            linked_notebook: scope.clone(),
            ..SyncMeta::new_local()
        };
        if let Some(base) = remote.name().map(str::to_string) {
            let name = self.free_name(tx, &base, scope.as_ref()).await?;
            duplicate.set_name(name);
        }
        Ok(duplicate)
    }
}

fn has_name<T: SyncEntity>(entity: &T) -> bool {
    entity.name().is_some_and(|name| !name.trim().is_empty())
}

fn precondition<T: SyncEntity>(message: &str, local: &T) -> Error {
    Error::internal(
        message,
        ErrorContext::new("resolve_conflict")
            .kind(T::KIND)
            .guid(local.guid())
            .local_id(local.local_id()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Notebook, Tag};
    use crate::store::{LocalStore, MemoryStore};
    use pretty_assertions::assert_eq;

    fn resolver() -> ConflictResolver<Notebook> {
        ConflictResolver::new("conflicting")
    }

    fn synced_notebook(guid: &str, name: &str) -> Notebook {
        let mut notebook = Notebook {
            meta: SyncMeta::from_remote(Guid::new(guid), 10),
            ..Notebook::new(name)
        };
        notebook.mark_synced();
        notebook
    }

    #[test]
    fn clean_local_accepts_remote() {
        let local = synced_notebook("g", "Work");
        let remote = synced_notebook("g", "Work renamed");
        assert_eq!(
            resolver()
                .decide(Conflict::Guid {
                    remote: &remote,
                    local: &local
                })
                .unwrap(),
            Resolution::AcceptRemote
        );
    }

    #[test]
    fn dirty_but_unchanged_local_accepts_remote() {
        let mut local = synced_notebook("g", "Work");
        local.meta.dirty = true;
        let remote = synced_notebook("g", "Work renamed");
        assert_eq!(
            resolver()
                .decide(Conflict::Guid {
                    remote: &remote,
                    local: &local
                })
                .unwrap(),
            Resolution::AcceptRemote
        );
    }

    #[test]
    fn edited_local_is_preserved() {
        let mut local = synced_notebook("g", "Work");
        local.name = "Work (mine)".to_string();
        local.meta.dirty = true;
        let remote = synced_notebook("g", "Work (theirs)");
        assert_eq!(
            resolver()
                .decide(Conflict::Guid {
                    remote: &remote,
                    local: &local
                })
                .unwrap(),
            Resolution::KeepLocalAndDuplicateRemote
        );
    }

    #[test]
    fn identical_edit_accepts_remote() {
        let mut local = synced_notebook("g", "Work");
        local.name = "Same".to_string();
        local.meta.dirty = true;
        let remote = synced_notebook("g", "Same");
        assert_eq!(
            resolver()
                .decide(Conflict::Guid {
                    remote: &remote,
                    local: &local
                })
                .unwrap(),
            Resolution::AcceptRemote
        );
    }

    #[test]
    fn local_tombstone_accepts_remote() {
        let mut local = synced_notebook("g", "Work");
        local.name = "Edited then deleted".to_string();
        local.meta.dirty = true;
        local.meta.deleted = true;
        let remote = synced_notebook("g", "Work");
        assert_eq!(
            resolver()
                .decide(Conflict::Guid {
                    remote: &remote,
                    local: &local
                })
                .unwrap(),
            Resolution::AcceptRemote
        );
    }

    #[test]
    fn name_collision_renames_local() {
        let local = Notebook::new("Work");
        let remote = synced_notebook("g", "Work");
        assert_eq!(
            resolver()
                .decide(Conflict::Name {
                    remote: &remote,
                    local: &local
                })
                .unwrap(),
            Resolution::KeepLocalRenamed
        );
    }

    #[test]
    fn missing_identifiers_fail_fast() {
        let local = Notebook::new("Work");
        let remote = synced_notebook("g", "Work");
        let error = resolver()
            .decide(Conflict::Guid {
                remote: &remote,
                local: &local,
            })
            .unwrap_err();
        assert!(matches!(error, Error::Internal { .. }));

        let unnamed = Notebook::new("  ");
        let error = resolver()
            .decide(Conflict::Name {
                remote: &remote,
                local: &unnamed,
            })
            .unwrap_err();
        assert!(error.to_string().contains("operation=resolve_conflict"));
    }

    #[test]
    fn conflict_names_count_up() {
        let resolver = resolver();
        assert_eq!(resolver.conflict_name("Work", 1), "Work (conflicting)");
        assert_eq!(resolver.conflict_name("Work", 2), "Work (conflicting 2)");
        assert_eq!(
            ConflictResolver::<Tag>::new("copy").conflict_name("x", 3),
            "x (copy 3)"
        );
    }

    #[tokio::test]
    async fn free_name_skips_taken_names() {
        let store = MemoryStore::new();
        store
            .seed([Notebook::new("Work (conflicting)"), Notebook::new("work (CONFLICTING 2)")])
            .await;
        let mut tx = store.begin().await.unwrap();
        let name = resolver().free_name(&mut tx, "Work", None).await.unwrap();
        assert_eq!(name, "Work (conflicting 3)");
    }

    #[tokio::test]
    async fn duplicate_remote_is_new_and_dirty() {
        let store = MemoryStore::new();
        let remote = synced_notebook("g", "Work");
        let mut tx = store.begin().await.unwrap();
        let duplicate = resolver().duplicate_remote(&mut tx, &remote).await.unwrap();

        assert_eq!(duplicate.name, "Work (conflicting)");
        assert_eq!(duplicate.meta.guid, None);
        assert_eq!(duplicate.meta.usn, None);
        assert!(duplicate.meta.dirty);
        assert_ne!(duplicate.meta.local_id, remote.meta.local_id);
    }

    #[tokio::test]
    async fn rename_local_marks_dirty() {
        let store = MemoryStore::new();
        let mut local = synced_notebook("g-local", "Work");
        let mut tx = store.begin().await.unwrap();
        resolver().rename_local(&mut tx, &mut local).await.unwrap();
        assert_eq!(local.name, "Work (conflicting)");
        assert!(local.is_dirty());
    }
}
