//! Sending local changes to the server.
//!
//! Dirty entities go out in dependency tiers: notebooks, saved searches and
//! linked notebooks first, then tags (parents before children), then notes,
//! then resources. Within a tier up to `worker_limit` requests are in flight.
//! A tier finishes before the next one starts, so every reference a note or
//! resource carries already has a guid when it is sent.

use std::collections::{BTreeSet, HashMap, HashSet};

use futures::stream::{self, StreamExt};

use crate::conflict::ConflictResolver;
use crate::error::{Error, ErrorContext, Result};
use crate::models::{
    EntityKind, Guid, LinkedNotebook, LocalId, Note, Notebook, Resource, SavedSearch, Scope,
    SyncEntity, Tag, Usn,
};
use crate::remote::{PushAck, RemoteService};
use crate::session::SyncSession;
use crate::state::SyncStateRepository;
use crate::store::{LocalStore, StoreTransaction};

/// USNs acknowledged by the server, per scope.
type Acks = HashMap<Option<Guid>, BTreeSet<Usn>>;

pub struct LocalChangeSender<'a, S, R, P> {
    session: &'a SyncSession<S, R, P>,
}

impl<'a, S, R, P> LocalChangeSender<'a, S, R, P>
where
    S: LocalStore,
    R: RemoteService,
    P: SyncStateRepository,
{
    pub const fn new(session: &'a SyncSession<S, R, P>) -> Self {
        Self { session }
    }

    /// Send every dirty entity; returns how many the server acknowledged.
    pub async fn send(&self) -> Result<usize> {
        let mut acks = Acks::new();
        let mut sent = 0;

        sent += self.send_kind::<LinkedNotebook>(&mut acks).await?;
        sent += self.send_kind::<Notebook>(&mut acks).await?;
        sent += self.send_kind::<SavedSearch>(&mut acks).await?;
        sent += self.send_tags(&mut acks).await?;
        sent += self.send_kind::<Note>(&mut acks).await?;
        sent += self.send_kind::<Resource>(&mut acks).await?;

        self.advance_checkpoints(&acks).await?;
        Ok(sent)
    }

    async fn dirty<T: SyncEntity>(&self) -> Result<Vec<T>> {
        let mut tx = self.session.store.begin().await?;
        let dirty = tx.list_dirty::<T>().await?;
        Ok(dirty)
    }

    async fn send_kind<T: SyncEntity>(&self, acks: &mut Acks) -> Result<usize> {
        let dirty = self.dirty::<T>().await?;
        self.send_batch(dirty, acks).await
    }

    /// Tags go out in waves so a parent always has a guid before its
    /// children are sent.
    async fn send_tags(&self, acks: &mut Acks) -> Result<usize> {
        let mut pending = self.dirty::<Tag>().await?;
        let mut sent = 0;

        while !pending.is_empty() {
            let waiting: HashSet<LocalId> = pending.iter().map(SyncEntity::local_id).collect();
            let (mut wave, mut rest): (Vec<Tag>, Vec<Tag>) =
                pending.into_iter().partition(|tag| {
                    tag.parent
                        .as_ref()
                        .and_then(|link| link.local_id)
                        .is_none_or(|parent| parent == tag.meta.local_id || !waiting.contains(&parent))
                });
            if wave.is_empty() {
                // Cyclic parents; the members fail individually on their links
                wave = std::mem::take(&mut rest);
            }
            sent += self.send_batch(wave, acks).await?;
            pending = rest;
        }
        Ok(sent)
    }

    async fn send_batch<T: SyncEntity>(&self, items: Vec<T>, acks: &mut Acks) -> Result<usize> {
        if items.is_empty() {
            return Ok(0);
        }
        self.session
            .add_estimate(u64::try_from(items.len()).unwrap_or(u64::MAX));

        let results: Vec<(Option<Guid>, Result<Option<Usn>>)> = stream::iter(items)
            .map(|item| async move {
                let scope = item.meta().linked_notebook.clone();
                (scope, self.send_one(item).await)
            })
            .buffer_unordered(self.session.config.worker_limit)
            .collect()
            .await;

        let mut sent = 0;
        let mut fatal = None;
        for (scope, result) in results {
            match result {
                Ok(Some(usn)) => {
                    acks.entry(scope).or_default().insert(usn);
                    sent += 1;
                }
                Ok(None) => {}
                Err(error) if error.is_item_level() => self.session.record_item_error(&error),
                Err(error) => {
                    fatal.get_or_insert(error);
                }
            }
            self.session.items_processed(1);
        }
        self.session.update_report(|report| report.sent += sent);

        match fatal {
            Some(error) => Err(error),
            None => Ok(sent),
        }
    }

    /// Send one entity. Returns the USN the server assigned, or `None` when
    /// nothing reached the server.
    async fn send_one<T: SyncEntity>(&self, entity: T) -> Result<Option<Usn>> {
        self.session.cancel.check()?;
        let context = ErrorContext::new("send")
            .kind(T::KIND)
            .guid(entity.guid())
            .local_id(entity.local_id());
        let scope = self.scope_of(&entity, &context).await?;

        if entity.meta().deleted {
            return self.send_tombstone(&entity, &scope, &context).await;
        }

        let mut snapshot = entity;
        let mut renamed = false;
        loop {
            let outgoing = self.with_remote_links(&snapshot, &context).await?;
            let payload = outgoing.clone().into_entity();
            let result = self
                .session
                .caller
                .call(&scope, context.clone(), |store, credential| {
                    let payload = &payload;
                    async move { store.create_or_update(&credential.token, payload).await }
                })
                .await;

            match result {
                Ok(ack) => {
                    let usn = ack.usn;
                    self.confirm(&snapshot, outgoing, ack, &context).await?;
                    return Ok(Some(usn));
                }
                Err(Error::DataConflict { .. }) if T::KIND.has_unique_names() && !renamed => {
                    renamed = true;
                    let Some(current) = self.rename_after_conflict(&snapshot).await? else {
                        return Ok(None);
                    };
                    snapshot = current;
                }
                Err(Error::DataConflict { message, .. }) => {
                    // Stays dirty; the next pull hands the server's version
                    // to the conflict resolver.
                    tracing::warn!(
                        kind = %T::KIND,
                        local_id = %snapshot.local_id(),
                        guid = ?snapshot.guid(),
                        message = %message,
                        "Server reported a conflict, leaving entity for the next pull"
                    );
                    return Ok(None);
                }
                Err(error) => return Err(error),
            }
        }
    }

    async fn send_tombstone<T: SyncEntity>(
        &self,
        entity: &T,
        scope: &Scope,
        context: &ErrorContext,
    ) -> Result<Option<Usn>> {
        let usn = match entity.guid() {
            None => None,
            Some(guid) => {
                let expunged = self
                    .session
                    .caller
                    .call(scope, context.clone(), |store, credential| async move {
                        store.expunge(&credential.token, T::KIND, guid).await
                    })
                    .await;
                match expunged {
                    Ok(usn) => Some(usn),
                    Err(Error::DataConflict { message, .. }) => {
                        tracing::warn!(
                            kind = %T::KIND,
                            guid = %guid,
                            message = %message,
                            "Server refused the expunge, keeping the tombstone"
                        );
                        return Ok(None);
                    }
                    Err(error) => return Err(error),
                }
            }
        };

        let mut tx = self.session.store.begin().await?;
        tx.delete::<T>(entity.local_id()).await?;
        tx.commit().await?;

        if T::KIND == EntityKind::LinkedNotebook {
            if let Some(guid) = entity.guid() {
                self.session
                    .state
                    .forget_scope(&self.session.account, guid)
                    .await?;
                self.session.caller.auth().forget_linked(guid);
            }
        }
        tracing::debug!(
            kind = %T::KIND,
            local_id = %entity.local_id(),
            remote = usn.is_some(),
            "Deleted entity"
        );
        Ok(usn)
    }

    /// The update stream an entity is sent through.
    async fn scope_of<T: SyncEntity>(&self, entity: &T, context: &ErrorContext) -> Result<Scope> {
        let Some(guid) = &entity.meta().linked_notebook else {
            return Ok(Scope::Own);
        };
        let mut tx = self.session.store.begin().await?;
        match tx.find_by_guid::<LinkedNotebook>(guid).await? {
            Some(linked) => Ok(Scope::linked(linked)),
            None => Err(Error::integrity(
                format!("linked notebook {guid} is not stored locally"),
                context.clone(),
            )),
        }
    }

    /// Copy of `entity` whose links all carry guids.
    async fn with_remote_links<T: SyncEntity>(
        &self,
        entity: &T,
        context: &ErrorContext,
    ) -> Result<T> {
        let mut outgoing = entity.clone();
        let mut tx = self.session.store.begin().await?;
        for (kind, link) in outgoing.links_mut() {
            if link.guid.is_some() {
                continue;
            }
            let Some(local_id) = link.local_id else {
                continue;
            };
            match guid_for(&mut tx, kind, local_id).await? {
                Some(guid) => link.guid = Some(guid),
                None => {
                    return Err(Error::integrity(
                        format!("{kind} {local_id} has not been sent yet"),
                        context.clone(),
                    ))
                }
            }
        }
        Ok(outgoing)
    }

    /// Store the server's guid and USN. The entity becomes clean only when
    /// it was not edited again while the request was in flight.
    async fn confirm<T: SyncEntity>(
        &self,
        snapshot: &T,
        outgoing: T,
        ack: PushAck,
        context: &ErrorContext,
    ) -> Result<()> {
        let mut tx = self.session.store.begin().await?;
        let Some(mut current) = tx.find_by_local_id::<T>(snapshot.local_id()).await? else {
            return Ok(());
        };
        if let Some(existing) = current.guid() {
            if *existing != ack.guid {
                return Err(Error::integrity(
                    format!("server answered with guid {} for {existing}", ack.guid),
                    context.clone(),
                ));
            }
        }

        let mut meta = current.meta().clone();
        meta.guid = Some(ack.guid);
        meta.usn = Some(ack.usn);
        if current.fingerprint() == snapshot.fingerprint() {
            current = outgoing;
            *current.meta_mut() = meta;
            current.mark_synced();
        } else {
            *current.meta_mut() = meta;
            tracing::debug!(
                kind = %T::KIND,
                local_id = %current.local_id(),
                "Entity changed while sending, keeping it dirty"
            );
        }
        tx.update(&current).await?;
        tx.commit().await
    }

    async fn rename_after_conflict<T: SyncEntity>(&self, snapshot: &T) -> Result<Option<T>> {
        let resolver = ConflictResolver::<T>::new(self.session.config.conflict_marker.as_str());
        let mut tx = self.session.store.begin().await?;
        let Some(mut current) = tx.find_by_local_id::<T>(snapshot.local_id()).await? else {
            return Ok(None);
        };
        resolver.rename_local(&mut tx, &mut current).await?;
        tx.update(&current).await?;
        tx.commit().await?;
        Ok(Some(current))
    }

    /// Move each scope's checkpoint over the contiguous run of USNs this
    /// run was assigned. A gap means another client wrote in between and
    /// the next pull has to see it.
    async fn advance_checkpoints(&self, acks: &Acks) -> Result<()> {
        let account = &self.session.account;
        for (scope, usns) in acks {
            let checkpoint = self.session.state.checkpoint(account, scope.as_ref()).await?;
            let reached = contiguous_end(checkpoint.usn, usns);
            if reached > checkpoint.usn {
                self.session
                    .state
                    .advance_checkpoint(account, scope.as_ref(), reached)
                    .await?;
                tracing::debug!(
                    account = %account,
                    scope = scope.as_ref().map_or("own", Guid::as_str),
                    usn = reached,
                    "Advanced checkpoint over own changes"
                );
            }
        }
        Ok(())
    }
}

fn contiguous_end(start: Usn, usns: &BTreeSet<Usn>) -> Usn {
    let mut reached = start;
    while usns.contains(&(reached + 1)) {
        reached += 1;
    }
    reached
}

async fn guid_for<X: StoreTransaction>(
    tx: &mut X,
    kind: EntityKind,
    local_id: LocalId,
) -> Result<Option<Guid>> {
    async fn lookup<T: SyncEntity, X: StoreTransaction>(
        tx: &mut X,
        local_id: LocalId,
    ) -> Result<Option<Guid>> {
        Ok(tx
            .find_by_local_id::<T>(local_id)
            .await?
            .and_then(|entity| entity.meta().guid.clone()))
    }

    match kind {
        EntityKind::Notebook => lookup::<Notebook, _>(tx, local_id).await,
        EntityKind::Tag => lookup::<Tag, _>(tx, local_id).await,
        EntityKind::SavedSearch => lookup::<SavedSearch, _>(tx, local_id).await,
        EntityKind::Note => lookup::<Note, _>(tx, local_id).await,
        EntityKind::Resource => lookup::<Resource, _>(tx, local_id).await,
        EntityKind::LinkedNotebook => lookup::<LinkedNotebook, _>(tx, local_id).await,
    }
}
