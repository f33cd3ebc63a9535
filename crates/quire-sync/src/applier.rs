//! Pulling remote changes into the local store.
//!
//! A scope's changes arrive as sync chunks in ascending USN order. Each chunk
//! is prepared without holding a transaction (full note and resource bodies,
//! out-of-band fetches of missing dependencies), then applied in a single
//! storage transaction. The checkpoint advances only after that transaction
//! commits, so an interrupted chunk is replayed in full.

use std::collections::{BTreeSet, HashSet};

use futures::stream::{self, StreamExt};

use crate::conflict::{Conflict, ConflictResolver, Resolution};
use crate::error::{Error, ErrorContext, Result};
use crate::models::{
    EntityKind, Guid, LinkedNotebook, LocalId, Note, Notebook, Resource, SavedSearch, Scope,
    SyncChunk, SyncEntity, SyncState, Tag, Usn,
};
use crate::remote::RemoteService;
use crate::session::SyncSession;
use crate::state::SyncStateRepository;
use crate::store::{LocalStore, StoreTransaction};

type KindGuid = (EntityKind, Guid);

/// Summary of one scope's pull.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PullOutcome {
    pub chunks: usize,
    /// Stored checkpoint after the pull
    pub checkpoint: Usn,
    pub full_sync: bool,
}

#[derive(Default)]
struct Tally {
    applied: usize,
    expunged: usize,
    conflicts: usize,
    errors: Vec<Error>,
}

impl Tally {
    fn absorb(&mut self, result: Result<()>) -> Result<()> {
        match result {
            Ok(()) => Ok(()),
            Err(error) if error.is_item_level() => {
                self.errors.push(error);
                Ok(())
            }
            Err(error) => Err(error),
        }
    }
}

pub struct RemoteChangeApplier<'a, S, R, P> {
    session: &'a SyncSession<S, R, P>,
}

impl<'a, S, R, P> RemoteChangeApplier<'a, S, R, P>
where
    S: LocalStore,
    R: RemoteService,
    P: SyncStateRepository,
{
    pub const fn new(session: &'a SyncSession<S, R, P>) -> Self {
        Self { session }
    }

    /// Pull every change of `scope` newer than its checkpoint.
    pub async fn pull(&self, scope: &Scope) -> Result<PullOutcome> {
        let account = &self.session.account;
        let checkpoint = self.session.state.checkpoint(account, scope.guid()).await?;
        let server = self.sync_state(scope).await?;

        // A scope that never finished a pull has nothing stale to resync
        let full_sync = checkpoint.usn > 0
            && checkpoint.last_sync_time > 0
            && server.full_sync_before > checkpoint.last_sync_time;
        if !full_sync && server.update_count <= checkpoint.usn {
            tracing::debug!(
                account = %account,
                scope = %scope,
                usn = checkpoint.usn,
                "Scope is up to date"
            );
            self.session
                .state
                .record_sync_time(account, scope.guid(), server.current_time)
                .await?;
            return Ok(PullOutcome {
                chunks: 0,
                checkpoint: checkpoint.usn,
                full_sync: false,
            });
        }

        let mut after = if full_sync {
            tracing::warn!(
                account = %account,
                scope = %scope,
                full_sync_before = server.full_sync_before,
                last_sync_time = checkpoint.last_sync_time,
                "Server requires a full resync"
            );
            0
        } else {
            checkpoint.usn
        };
        self.session
            .add_estimate(u64::try_from(server.update_count - after).unwrap_or(0));

        let mut seen: HashSet<KindGuid> = HashSet::new();
        let mut chunks = 0;
        let mut stored = checkpoint.usn;
        loop {
            self.session.cancel.check()?;
            let chunk = self.sync_chunk(scope, after).await?;
            let Some(high) = chunk.high_usn().filter(|high| *high > after) else {
                break;
            };
            let update_count = chunk.update_count;
            let items = chunk.item_count();

            stored = self.apply_chunk(scope, chunk, high, &mut seen).await?;
            chunks += 1;
            self.session
                .items_processed(u64::try_from(items).unwrap_or(u64::MAX));
            tracing::debug!(
                account = %account,
                scope = %scope,
                usn = high,
                items,
                "Applied sync chunk"
            );

            after = high;
            if update_count > 0 && after >= update_count {
                break;
            }
        }

        if full_sync {
            self.expunge_stale(scope, &seen).await?;
        }
        self.session
            .state
            .record_sync_time(account, scope.guid(), server.current_time)
            .await?;

        Ok(PullOutcome {
            chunks,
            checkpoint: stored,
            full_sync,
        })
    }

    async fn sync_state(&self, scope: &Scope) -> Result<SyncState> {
        self.session
            .caller
            .call(
                scope,
                ErrorContext::new("get_sync_state"),
                |store, credential| async move {
                    match scope.linked_notebook() {
                        None => store.get_sync_state(&credential.token).await,
                        Some(linked) => {
                            store
                                .get_linked_notebook_sync_state(&credential.token, linked)
                                .await
                        }
                    }
                },
            )
            .await
    }

    async fn sync_chunk(&self, scope: &Scope, after: Usn) -> Result<SyncChunk> {
        let max_entries = self.session.config.max_chunk_entries;
        self.session
            .caller
            .call(
                scope,
                ErrorContext::new("get_sync_chunk"),
                |store, credential| async move {
                    match scope.linked_notebook() {
                        None => {
                            store
                                .get_sync_chunk(&credential.token, after, max_entries)
                                .await
                        }
                        Some(linked) => {
                            store
                                .get_linked_notebook_sync_chunk(
                                    &credential.token,
                                    linked,
                                    after,
                                    max_entries,
                                )
                                .await
                        }
                    }
                },
            )
            .await
    }

    /// Apply one chunk and advance the checkpoint to `high`; returns the
    /// stored checkpoint.
    async fn apply_chunk(
        &self,
        scope: &Scope,
        mut chunk: SyncChunk,
        high: Usn,
        seen: &mut HashSet<KindGuid>,
    ) -> Result<Usn> {
        let context = ErrorContext::new("apply_chunk");
        let mut tally = Tally::default();

        self.fetch_full_content(scope, &mut chunk, &mut tally).await?;
        self.fetch_missing_dependencies(scope, &mut chunk).await?;
        remember_seen(&chunk, seen);

        let mut tx = self
            .session
            .store
            .begin()
            .await
            .map_err(|error| error.with_context(&context))?;
        let expunged_scopes = apply_expunges(&mut tx, &chunk, &mut tally).await?;
        self.apply_upserts(&mut tx, scope, chunk, &mut tally).await?;
        tx.commit()
            .await
            .map_err(|error| error.with_context(&context))?;

        for guid in &expunged_scopes {
            self.session
                .state
                .forget_scope(&self.session.account, guid)
                .await?;
            self.session.caller.auth().forget_linked(guid);
        }

        self.session.update_report(|report| {
            report.applied += tally.applied;
            report.expunged += tally.expunged;
            report.conflicts += tally.conflicts;
        });
        for error in &tally.errors {
            self.session.record_item_error(error);
        }

        self.session
            .state
            .advance_checkpoint(&self.session.account, scope.guid(), high)
            .await
    }

    /// Replace chunk notes and resources with their full versions.
    async fn fetch_full_content(
        &self,
        scope: &Scope,
        chunk: &mut SyncChunk,
        tally: &mut Tally,
    ) -> Result<()> {
        let limit = self.session.config.worker_limit;
        let caller = &self.session.caller;

        let notes: Vec<Result<Note>> = stream::iter(std::mem::take(&mut chunk.notes))
            .map(|note| async move {
                let Some(guid) = note.meta.guid.clone() else {
                    return Ok(note);
                };
                let usn = note.meta.usn;
                caller
                    .call(
                        scope,
                        ErrorContext::new("get_note")
                            .kind(EntityKind::Note)
                            .guid(Some(&guid)),
                        |store, credential| {
                            let guid = &guid;
                            async move { store.get_full_note(&credential.token, guid).await }
                        },
                    )
                    .await
                    .map(|mut full| {
                        full.meta.usn = full.meta.usn.or(usn);
                        full
                    })
            })
            .buffered(limit)
            .collect()
            .await;
        for note in notes {
            match note {
                Ok(note) => chunk.notes.push(note),
                Err(error) => tally.absorb(Err(error))?,
            }
        }

        let resources: Vec<Result<Resource>> =
            stream::iter(std::mem::take(&mut chunk.resources))
                .map(|resource| async move {
                    let Some(guid) = resource.meta.guid.clone() else {
                        return Ok(resource);
                    };
                    let usn = resource.meta.usn;
                    caller
                        .call(
                            scope,
                            ErrorContext::new("get_resource")
                                .kind(EntityKind::Resource)
                                .guid(Some(&guid)),
                            |store, credential| {
                                let guid = &guid;
                                async move {
                                    store.get_full_resource(&credential.token, guid).await
                                }
                            },
                        )
                        .await
                        .map(|mut full| {
                            full.meta.usn = full.meta.usn.or(usn);
                            full
                        })
                })
                .buffered(limit)
                .collect()
                .await;
        for resource in resources {
            match resource {
                Ok(resource) => chunk.resources.push(resource),
                Err(error) => tally.absorb(Err(error))?,
            }
        }
        Ok(())
    }

    /// Fetch referenced entities that are neither in the chunk nor stored
    /// locally. Items whose reference still cannot be resolved fail later,
    /// individually, with an integrity error.
    async fn fetch_missing_dependencies(&self, scope: &Scope, chunk: &mut SyncChunk) -> Result<()> {
        let mut requested: HashSet<KindGuid> = HashSet::new();
        loop {
            let wanted = self.missing_references(chunk, &requested).await?;
            if wanted.is_empty() {
                return Ok(());
            }

            for (kind, guid) in wanted {
                requested.insert((kind, guid.clone()));
                let context = ErrorContext::new("fetch_dependency")
                    .kind(kind)
                    .guid(Some(&guid));
                let guid = &guid;
                let fetched = match kind {
                    EntityKind::Notebook => self
                        .session
                        .caller
                        .call(scope, context, |store, credential| async move {
                            store.get_notebook(&credential.token, guid).await
                        })
                        .await
                        .map(|notebook| chunk.notebooks.push(notebook)),
                    EntityKind::Tag => self
                        .session
                        .caller
                        .call(scope, context, |store, credential| async move {
                            store.get_tag(&credential.token, guid).await
                        })
                        .await
                        .map(|tag| chunk.tags.push(tag)),
                    EntityKind::Note => self
                        .session
                        .caller
                        .call(scope, context, |store, credential| async move {
                            store.get_full_note(&credential.token, guid).await
                        })
                        .await
                        .map(|note| chunk.notes.push(note)),
                    EntityKind::SavedSearch | EntityKind::Resource | EntityKind::LinkedNotebook => {
                        Ok(())
                    }
                };

                match fetched {
                    Ok(()) => {
                        tracing::debug!(kind = %kind, guid = %guid, "Fetched missing dependency");
                    }
                    Err(error) if error.is_item_level() => {
                        tracing::warn!(
                            kind = %kind,
                            guid = %guid,
                            error = %error,
                            "Dependency could not be fetched"
                        );
                    }
                    Err(error) => return Err(error),
                }
            }
        }
    }

    async fn missing_references(
        &self,
        chunk: &SyncChunk,
        requested: &HashSet<KindGuid>,
    ) -> Result<Vec<KindGuid>> {
        let mut present: HashSet<KindGuid> = HashSet::new();
        remember_seen(chunk, &mut present);

        let mut references: BTreeSet<KindGuid> = BTreeSet::new();
        collect_references(&chunk.tags, &mut references);
        collect_references(&chunk.notes, &mut references);
        collect_references(&chunk.resources, &mut references);

        let candidates: Vec<KindGuid> = references
            .into_iter()
            .filter(|reference| !present.contains(reference) && !requested.contains(reference))
            .collect();
        if candidates.is_empty() {
            return Ok(candidates);
        }

        let mut tx = self.session.store.begin().await?;
        let mut missing = Vec::new();
        for (kind, guid) in candidates {
            if local_id_for(&mut tx, kind, &guid).await?.is_none() {
                missing.push((kind, guid));
            }
        }
        Ok(missing)
    }

    async fn apply_upserts<X: StoreTransaction>(
        &self,
        tx: &mut X,
        scope: &Scope,
        chunk: SyncChunk,
        tally: &mut Tally,
    ) -> Result<()> {
        let SyncChunk {
            notebooks,
            tags,
            searches,
            notes,
            resources,
            linked_notebooks,
            ..
        } = chunk;
        let scope = scope.guid();

        // Linked notebook records belong to the own account
        self.upsert_all(tx, None, by_usn(linked_notebooks), tally)
            .await?;
        self.upsert_all(tx, scope, by_usn(notebooks), tally).await?;
        self.upsert_all(tx, scope, parents_first(by_usn(tags)), tally)
            .await?;
        self.upsert_all(tx, scope, by_usn(searches), tally).await?;
        self.upsert_all(tx, scope, by_usn(notes), tally).await?;
        self.upsert_all(tx, scope, by_usn(resources), tally).await
    }

    async fn upsert_all<T: SyncEntity, X: StoreTransaction>(
        &self,
        tx: &mut X,
        scope: Option<&Guid>,
        items: Vec<T>,
        tally: &mut Tally,
    ) -> Result<()> {
        let resolver = ConflictResolver::<T>::new(self.session.config.conflict_marker.as_str());
        for item in items {
            let result = upsert(tx, &resolver, scope, item, tally).await;
            tally.absorb(result)?;
        }
        Ok(())
    }

    /// After a forced full sync, drop clean local entities of the scope the
    /// server no longer reported. Dirty ones lose their guid and are sent as
    /// new entities.
    async fn expunge_stale(&self, scope: &Scope, seen: &HashSet<KindGuid>) -> Result<()> {
        let context = ErrorContext::new("expunge_stale");
        let scope_guid = scope.guid();
        let mut tx = self
            .session
            .store
            .begin()
            .await
            .map_err(|error| error.with_context(&context))?;

        let mut removed = Vec::new();
        removed.extend(stale::<Resource, _>(&mut tx, scope_guid, seen).await?);
        removed.extend(stale::<Note, _>(&mut tx, scope_guid, seen).await?);
        removed.extend(stale::<SavedSearch, _>(&mut tx, scope_guid, seen).await?);
        removed.extend(stale::<Tag, _>(&mut tx, scope_guid, seen).await?);
        removed.extend(stale::<Notebook, _>(&mut tx, scope_guid, seen).await?);
        let mut dropped_scopes = Vec::new();
        if scope_guid.is_none() {
            for guid in stale::<LinkedNotebook, _>(&mut tx, None, seen).await? {
                expunge_scope_contents(&mut tx, &guid).await?;
                dropped_scopes.push(guid.clone());
                removed.push(guid);
            }
        }
        tx.commit()
            .await
            .map_err(|error| error.with_context(&context))?;

        for guid in &dropped_scopes {
            self.session
                .state
                .forget_scope(&self.session.account, guid)
                .await?;
            self.session.caller.auth().forget_linked(guid);
        }
        if !removed.is_empty() {
            tracing::info!(
                account = %self.session.account,
                scope = %scope,
                removed = removed.len(),
                "Removed entities missing from full resync"
            );
        }
        self.session
            .update_report(|report| report.expunged += removed.len());
        Ok(())
    }
}

/// Insert, overwrite or reconcile one remote entity.
async fn upsert<T: SyncEntity, X: StoreTransaction>(
    tx: &mut X,
    resolver: &ConflictResolver<T>,
    scope: Option<&Guid>,
    mut remote: T,
    tally: &mut Tally,
) -> Result<()> {
    let context = ErrorContext::new("apply_remote")
        .kind(T::KIND)
        .guid(remote.guid());
    let (Some(guid), Some(usn)) = (remote.guid().cloned(), remote.meta().usn) else {
        return Err(Error::internal(
            "remote entity without guid or usn",
            context,
        ));
    };
    remote.meta_mut().linked_notebook = scope.cloned();
    resolve_links(tx, &mut remote, &context).await?;

    let Some(mut local) = tx.find_by_guid::<T>(&guid).await? else {
        remote.meta_mut().local_id = LocalId::new();
        let displaced = clear_name_collision(tx, resolver, &remote).await?;
        accept(&mut remote);
        let written = tx.insert(&remote).await;
        settle_rename(tx, displaced, written, tally).await?;
        tally.applied += 1;
        return Ok(());
    };

    remote.meta_mut().local_id = local.local_id();
    if local.is_dirty() && local.meta().usn.is_some_and(|known| known >= usn) {
        // This remote version was already reconciled with the local edit
        return Ok(());
    }

    let resolution = if local.is_dirty() {
        resolver.decide(Conflict::Guid {
            remote: &remote,
            local: &local,
        })?
    } else {
        Resolution::AcceptRemote
    };

    match resolution {
        Resolution::AcceptRemote => {
            let displaced = clear_name_collision(tx, resolver, &remote).await?;
            accept(&mut remote);
            let written = tx.update(&remote).await;
            settle_rename(tx, displaced, written, tally).await?;
            tally.applied += 1;
        }
        Resolution::KeepLocalAndDuplicateRemote | Resolution::KeepLocalRenamed => {
            let duplicate = resolver.duplicate_remote(tx, &remote).await?;
            tx.insert(&duplicate).await?;
            local.meta_mut().usn = Some(usn);
            tx.update(&local).await?;
            tally.conflicts += 1;
            tracing::info!(
                kind = %T::KIND,
                guid = %guid,
                duplicate = %duplicate.local_id(),
                "Kept local edit, stored remote version as a copy"
            );
        }
    }
    Ok(())
}

fn accept<T: SyncEntity>(remote: &mut T) {
    remote.meta_mut().deleted = false;
    remote.mark_synced();
}

/// Rename a different local entity already using the remote entity's name.
/// Returns that entity as it was before the rename.
async fn clear_name_collision<T: SyncEntity, X: StoreTransaction>(
    tx: &mut X,
    resolver: &ConflictResolver<T>,
    remote: &T,
) -> Result<Option<T>> {
    if !T::KIND.has_unique_names() {
        return Ok(None);
    }
    let Some(name) = remote.name() else {
        return Ok(None);
    };
    let scope = remote.meta().linked_notebook.as_ref();
    let Some(mut other) = tx.find_by_name::<T>(name, scope).await? else {
        return Ok(None);
    };
    if other.local_id() == remote.local_id() {
        return Ok(None);
    }

    let resolution = resolver.decide(Conflict::Name {
        remote,
        local: &other,
    })?;
    if resolution != Resolution::KeepLocalRenamed {
        return Ok(None);
    }
    let original = other.clone();
    resolver.rename_local(tx, &mut other).await?;
    tx.update(&other).await?;
    Ok(Some(original))
}

/// Keep a collision rename only if the write it made room for went through.
async fn settle_rename<T: SyncEntity, X: StoreTransaction>(
    tx: &mut X,
    displaced: Option<T>,
    written: Result<()>,
    tally: &mut Tally,
) -> Result<()> {
    match (written, displaced) {
        (Ok(()), Some(_)) => {
            tally.conflicts += 1;
            Ok(())
        }
        (Ok(()), None) => Ok(()),
        (Err(error), Some(original)) => {
            tx.update(&original).await?;
            Err(error)
        }
        (Err(error), None) => Err(error),
    }
}

/// Point every guid link of `entity` at the matching local entity.
async fn resolve_links<T: SyncEntity, X: StoreTransaction>(
    tx: &mut X,
    entity: &mut T,
    context: &ErrorContext,
) -> Result<()> {
    for (kind, link) in entity.links_mut() {
        let Some(guid) = link.guid.clone() else {
            continue;
        };
        match local_id_for(tx, kind, &guid).await? {
            Some(local_id) => link.local_id = Some(local_id),
            None => {
                return Err(Error::integrity(
                    format!("unresolved {kind} reference {guid}"),
                    context.clone(),
                ))
            }
        }
    }
    Ok(())
}

pub(crate) async fn local_id_for<X: StoreTransaction>(
    tx: &mut X,
    kind: EntityKind,
    guid: &Guid,
) -> Result<Option<LocalId>> {
    Ok(match kind {
        EntityKind::Notebook => tx
            .find_by_guid::<Notebook>(guid)
            .await?
            .map(|entity| entity.local_id()),
        EntityKind::Tag => tx
            .find_by_guid::<Tag>(guid)
            .await?
            .map(|entity| entity.local_id()),
        EntityKind::SavedSearch => tx
            .find_by_guid::<SavedSearch>(guid)
            .await?
            .map(|entity| entity.local_id()),
        EntityKind::Note => tx
            .find_by_guid::<Note>(guid)
            .await?
            .map(|entity| entity.local_id()),
        EntityKind::Resource => tx
            .find_by_guid::<Resource>(guid)
            .await?
            .map(|entity| entity.local_id()),
        EntityKind::LinkedNotebook => tx
            .find_by_guid::<LinkedNotebook>(guid)
            .await?
            .map(|entity| entity.local_id()),
    })
}

/// Expunges run before upserts, dependents first. Returns the linked
/// notebooks whose scope was dropped.
async fn apply_expunges<X: StoreTransaction>(
    tx: &mut X,
    chunk: &SyncChunk,
    tally: &mut Tally,
) -> Result<Vec<Guid>> {
    for guid in &chunk.expunged_notes {
        if let Some(note) = delete_by_guid::<Note, _>(tx, guid).await? {
            delete_resources_of(tx, &note).await?;
            tally.expunged += 1;
        }
    }
    for guid in &chunk.expunged_searches {
        if delete_by_guid::<SavedSearch, _>(tx, guid).await?.is_some() {
            tally.expunged += 1;
        }
    }
    for guid in &chunk.expunged_tags {
        if let Some(tag) = delete_by_guid::<Tag, _>(tx, guid).await? {
            detach_tag(tx, &tag).await?;
            tally.expunged += 1;
        }
    }
    for guid in &chunk.expunged_notebooks {
        if let Some(notebook) = delete_by_guid::<Notebook, _>(tx, guid).await? {
            let scope = notebook.meta.linked_notebook.clone();
            for note in tx.list::<Note>(scope.as_ref()).await? {
                if note.notebook.local_id == Some(notebook.meta.local_id) {
                    tx.delete::<Note>(note.local_id()).await?;
                    delete_resources_of(tx, &note).await?;
                }
            }
            tally.expunged += 1;
        }
    }

    let mut dropped_scopes = Vec::new();
    for guid in &chunk.expunged_linked_notebooks {
        if delete_by_guid::<LinkedNotebook, _>(tx, guid).await?.is_some() {
            tally.expunged += 1;
        }
        expunge_scope_contents(tx, guid).await?;
        dropped_scopes.push(guid.clone());
    }
    Ok(dropped_scopes)
}

async fn delete_by_guid<T: SyncEntity, X: StoreTransaction>(
    tx: &mut X,
    guid: &Guid,
) -> Result<Option<T>> {
    let Some(entity) = tx.find_by_guid::<T>(guid).await? else {
        return Ok(None);
    };
    tx.delete::<T>(entity.local_id()).await?;
    tracing::debug!(kind = %T::KIND, guid = %guid, "Expunged local entity");
    Ok(Some(entity))
}

async fn delete_resources_of<X: StoreTransaction>(tx: &mut X, note: &Note) -> Result<()> {
    for resource in tx.list::<Resource>(note.meta.linked_notebook.as_ref()).await? {
        if resource.note.local_id == Some(note.meta.local_id) {
            tx.delete::<Resource>(resource.local_id()).await?;
        }
    }
    Ok(())
}

/// Remove links to an expunged tag from notes and child tags.
async fn detach_tag<X: StoreTransaction>(tx: &mut X, tag: &Tag) -> Result<()> {
    let scope = tag.meta.linked_notebook.clone();
    let target = Some(tag.meta.local_id);

    for mut note in tx.list::<Note>(scope.as_ref()).await? {
        let before = note.tags.len();
        note.tags.retain(|link| link.local_id != target);
        if note.tags.len() != before {
            refresh_synced(&mut note);
            tx.update(&note).await?;
        }
    }
    for mut child in tx.list::<Tag>(scope.as_ref()).await? {
        if child.parent.as_ref().is_some_and(|link| link.local_id == target) {
            child.parent = None;
            refresh_synced(&mut child);
            tx.update(&child).await?;
        }
    }
    Ok(())
}

/// Keep a clean entity clean after a server-driven edit.
fn refresh_synced<T: SyncEntity>(entity: &mut T) {
    if !entity.is_dirty() {
        entity.mark_synced();
    }
}

/// Delete every entity reached through a linked notebook.
async fn expunge_scope_contents<X: StoreTransaction>(tx: &mut X, scope: &Guid) -> Result<()> {
    async fn clear<T: SyncEntity, X: StoreTransaction>(tx: &mut X, scope: &Guid) -> Result<()> {
        for entity in tx.list::<T>(Some(scope)).await? {
            tx.delete::<T>(entity.local_id()).await?;
        }
        Ok(())
    }

    clear::<Resource, _>(tx, scope).await?;
    clear::<Note, _>(tx, scope).await?;
    clear::<SavedSearch, _>(tx, scope).await?;
    clear::<Tag, _>(tx, scope).await?;
    clear::<Notebook, _>(tx, scope).await?;
    tracing::info!(scope = %scope, "Removed linked notebook contents");
    Ok(())
}

/// Entities of a scope carrying a guid the full resync did not report.
/// Clean ones are deleted and returned; dirty ones lose their guid.
async fn stale<T: SyncEntity, X: StoreTransaction>(
    tx: &mut X,
    scope: Option<&Guid>,
    seen: &HashSet<KindGuid>,
) -> Result<Vec<Guid>> {
    let mut removed = Vec::new();
    for mut entity in tx.list::<T>(scope).await? {
        let Some(guid) = entity.guid().cloned() else {
            continue;
        };
        if seen.contains(&(T::KIND, guid.clone())) {
            continue;
        }
        if entity.is_dirty() && !entity.meta().deleted {
            let meta = entity.meta_mut();
            meta.guid = None;
            meta.usn = None;
            tx.update(&entity).await?;
        } else {
            tx.delete::<T>(entity.local_id()).await?;
            removed.push(guid);
        }
    }
    Ok(removed)
}

fn remember_seen(chunk: &SyncChunk, seen: &mut HashSet<KindGuid>) {
    fn add<T: SyncEntity>(items: &[T], seen: &mut HashSet<KindGuid>) {
        seen.extend(
            items
                .iter()
                .filter_map(|item| item.guid().map(|guid| (T::KIND, guid.clone()))),
        );
    }

    add(&chunk.notebooks, seen);
    add(&chunk.tags, seen);
    add(&chunk.searches, seen);
    add(&chunk.notes, seen);
    add(&chunk.resources, seen);
    add(&chunk.linked_notebooks, seen);
}

fn collect_references<T: SyncEntity>(items: &[T], out: &mut BTreeSet<KindGuid>) {
    for item in items {
        for (kind, link) in item.links() {
            if let Some(guid) = &link.guid {
                out.insert((kind, guid.clone()));
            }
        }
    }
}

fn by_usn<T: SyncEntity>(mut items: Vec<T>) -> Vec<T> {
    items.sort_by_key(|item| item.meta().usn);
    items
}

/// Order tags so a parent present in the same batch precedes its children.
fn parents_first(tags: Vec<Tag>) -> Vec<Tag> {
    let in_batch: HashSet<Guid> = tags.iter().filter_map(|tag| tag.guid().cloned()).collect();
    let mut placed: HashSet<Guid> = HashSet::new();
    let mut ordered = Vec::with_capacity(tags.len());
    let mut pending = tags;

    while !pending.is_empty() {
        let (ready, waiting): (Vec<Tag>, Vec<Tag>) = pending.into_iter().partition(|tag| {
            tag.parent
                .as_ref()
                .and_then(|link| link.guid.as_ref())
                .is_none_or(|parent| !in_batch.contains(parent) || placed.contains(parent))
        });
        if ready.is_empty() {
            // Cyclic parents; keep USN order for the rest
            ordered.extend(waiting);
            break;
        }
        placed.extend(ready.iter().filter_map(|tag| tag.guid().cloned()));
        ordered.extend(ready);
        pending = waiting;
    }
    ordered
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Link, SyncMeta};
    use crate::store::{MemoryStore, MemoryTransaction};
    use pretty_assertions::assert_eq;

    /// Memory transaction whose inserts of one name fail validation.
    struct RejectingInserts {
        inner: MemoryTransaction,
        rejected: &'static str,
    }

    impl StoreTransaction for RejectingInserts {
        async fn list_dirty<T: SyncEntity>(&mut self) -> Result<Vec<T>> {
            self.inner.list_dirty().await
        }

        async fn list<T: SyncEntity>(&mut self, scope: Option<&Guid>) -> Result<Vec<T>> {
            self.inner.list(scope).await
        }

        async fn find_by_local_id<T: SyncEntity>(&mut self, local_id: LocalId) -> Result<Option<T>> {
            self.inner.find_by_local_id(local_id).await
        }

        async fn find_by_guid<T: SyncEntity>(&mut self, guid: &Guid) -> Result<Option<T>> {
            self.inner.find_by_guid(guid).await
        }

        async fn find_by_name<T: SyncEntity>(
            &mut self,
            name: &str,
            scope: Option<&Guid>,
        ) -> Result<Option<T>> {
            self.inner.find_by_name(name, scope).await
        }

        async fn insert<T: SyncEntity>(&mut self, entity: &T) -> Result<()> {
            if entity.name() == Some(self.rejected) {
                return Err(Error::validation(
                    "rejected by store",
                    ErrorContext::new("insert").kind(T::KIND),
                ));
            }
            self.inner.insert(entity).await
        }

        async fn update<T: SyncEntity>(&mut self, entity: &T) -> Result<()> {
            self.inner.update(entity).await
        }

        async fn delete<T: SyncEntity>(&mut self, local_id: LocalId) -> Result<()> {
            self.inner.delete::<T>(local_id).await
        }

        async fn commit(self) -> Result<()> {
            self.inner.commit().await
        }
    }

    fn tag(guid: &str, usn: Usn, parent: Option<&str>) -> Tag {
        Tag {
            meta: SyncMeta::from_remote(Guid::new(guid), usn),
            name: guid.to_string(),
            parent: parent.map(|parent| Link::remote(Guid::new(parent))),
        }
    }

    fn guids(tags: &[Tag]) -> Vec<&str> {
        tags.iter()
            .map(|tag| tag.guid().map_or("", Guid::as_str))
            .collect()
    }

    #[test]
    fn parents_precede_children() {
        let ordered = parents_first(by_usn(vec![
            tag("child", 3, Some("parent")),
            tag("grandchild", 1, Some("child")),
            tag("parent", 5, None),
            tag("orphan", 2, Some("elsewhere")),
        ]));
        assert_eq!(guids(&ordered), vec!["orphan", "parent", "child", "grandchild"]);
    }

    #[test]
    fn cyclic_parents_do_not_loop() {
        let ordered = parents_first(vec![tag("a", 1, Some("b")), tag("b", 2, Some("a"))]);
        assert_eq!(ordered.len(), 2);
    }

    #[test]
    fn references_skip_local_only_links() {
        let mut note = Note::new("n", "", LocalId::new());
        note.tags.push(Link::remote(Guid::new("t-1")));
        let mut references = BTreeSet::new();
        collect_references(&[note], &mut references);
        assert_eq!(
            references.into_iter().collect::<Vec<_>>(),
            vec![(EntityKind::Tag, Guid::new("t-1"))]
        );
    }

    #[tokio::test]
    async fn failed_insert_undoes_collision_rename() {
        let store = MemoryStore::new();
        let local = Notebook::new("Work");
        let mut tx = store.begin().await.unwrap();
        tx.insert(&local).await.unwrap();
        tx.commit().await.unwrap();

        let remote = Notebook {
            meta: SyncMeta::from_remote(Guid::new("nb-1"), 1),
            ..Notebook::new("Work")
        };
        let resolver = ConflictResolver::<Notebook>::new("conflicting");
        let mut tally = Tally::default();
        let mut tx = RejectingInserts {
            inner: store.begin().await.unwrap(),
            rejected: "Work",
        };
        let result = upsert(&mut tx, &resolver, None, remote, &mut tally).await;
        tally.absorb(result).unwrap();
        tx.commit().await.unwrap();

        assert_eq!(tally.errors.len(), 1);
        assert_eq!(tally.conflicts, 0);
        let mut tx = store.begin().await.unwrap();
        let kept: Notebook = tx.find_by_local_id(local.meta.local_id).await.unwrap().unwrap();
        assert_eq!(kept.name, "Work");
        assert!(tx.find_by_guid::<Notebook>(&Guid::new("nb-1")).await.unwrap().is_none());
    }
}
