//! In-process fakes shared by the unit and scenario tests.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::time::Instant;

use crate::auth::{Credential, CredentialKey, CredentialStore};
use crate::error::Result;
use crate::models::{
    AccountId, Entity, EntityKind, Guid, LinkedNotebook, Note, Notebook, Resource, SyncChunk,
    SyncEntity, SyncMeta, SyncState, Tag, Usn,
};
use crate::remote::{
    AuthenticationResult, NoteStoreTransport, PushAck, RemoteService, RpcError, RpcErrorCode,
    RpcResult,
};
use crate::state::{Checkpoint, EndpointRecord, SyncStateRepository};
use crate::util::{unix_timestamp_millis_now, unix_timestamp_now};

pub const OWN_NOTE_STORE: &str = "https://fake.test/shard/s1/notestore";

/// A credential for the own note store valid for `ttl_secs`.
pub fn credential(token: &str, ttl_secs: i64) -> Credential {
    Credential {
        token: token.to_string(),
        expires_at: unix_timestamp_now() + ttl_secs,
        note_store_url: OWN_NOTE_STORE.to_string(),
        shard_id: Some("s1".to_string()),
    }
}

#[derive(Default)]
pub struct MemoryCredentialStore {
    entries: Mutex<HashMap<String, Credential>>,
}

impl MemoryCredentialStore {
    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, Credential>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn read(&self, key: &CredentialKey) -> Result<Option<Credential>> {
        Ok(self.entries().get(&key.storage_key()).cloned())
    }

    fn write(&self, key: &CredentialKey, credential: &Credential) -> Result<()> {
        self.entries().insert(key.storage_key(), credential.clone());
        Ok(())
    }

    fn delete(&self, key: &CredentialKey) -> Result<()> {
        self.entries().remove(&key.storage_key());
        Ok(())
    }
}

type StreamKey = (AccountId, Option<Guid>);

#[derive(Default)]
pub struct MemorySyncStateRepository {
    checkpoints: Mutex<HashMap<StreamKey, Checkpoint>>,
    endpoints: Mutex<HashMap<StreamKey, EndpointRecord>>,
}

impl MemorySyncStateRepository {
    fn key(account: &AccountId, scope: Option<&Guid>) -> StreamKey {
        (account.clone(), scope.cloned())
    }
}

impl SyncStateRepository for MemorySyncStateRepository {
    async fn checkpoint(&self, account: &AccountId, scope: Option<&Guid>) -> Result<Checkpoint> {
        Ok(self
            .checkpoints
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&Self::key(account, scope))
            .copied()
            .unwrap_or_default())
    }

    async fn advance_checkpoint(
        &self,
        account: &AccountId,
        scope: Option<&Guid>,
        usn: Usn,
    ) -> Result<Usn> {
        let mut checkpoints = self.checkpoints.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = checkpoints.entry(Self::key(account, scope)).or_default();
        entry.usn = entry.usn.max(usn);
        Ok(entry.usn)
    }

    async fn record_sync_time(
        &self,
        account: &AccountId,
        scope: Option<&Guid>,
        time: i64,
    ) -> Result<()> {
        self.checkpoints
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(Self::key(account, scope))
            .or_default()
            .last_sync_time = time;
        Ok(())
    }

    async fn endpoint(
        &self,
        account: &AccountId,
        scope: Option<&Guid>,
    ) -> Result<Option<EndpointRecord>> {
        Ok(self
            .endpoints
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&Self::key(account, scope))
            .cloned())
    }

    async fn save_endpoint(
        &self,
        account: &AccountId,
        scope: Option<&Guid>,
        record: &EndpointRecord,
    ) -> Result<()> {
        self.endpoints
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(Self::key(account, scope), record.clone());
        Ok(())
    }

    async fn forget_scope(&self, account: &AccountId, scope: &Guid) -> Result<()> {
        let key = Self::key(account, Some(scope));
        self.checkpoints
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&key);
        self.endpoints
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&key);
        Ok(())
    }
}

/// One update stream on the fake server.
#[derive(Default)]
struct Stream {
    usn: Usn,
    full_sync_before: i64,
    entities: BTreeMap<(EntityKind, Guid), Entity>,
    expunged: Vec<(Usn, EntityKind, Guid)>,
}

impl Stream {
    fn sync_state(&self) -> SyncState {
        SyncState {
            current_time: unix_timestamp_millis_now(),
            full_sync_before: self.full_sync_before,
            update_count: self.usn,
        }
    }

    fn chunk(&self, after: Usn, max_entries: i32) -> SyncChunk {
        enum Change<'a> {
            Upsert(&'a Entity),
            Expunge(EntityKind, &'a Guid),
        }

        let mut changes: Vec<(Usn, Change<'_>)> = self
            .entities
            .values()
            .filter_map(|entity| entity.meta().usn.map(|usn| (usn, Change::Upsert(entity))))
            .chain(
                self.expunged
                    .iter()
                    .map(|(usn, kind, guid)| (*usn, Change::Expunge(*kind, guid))),
            )
            .filter(|(usn, _)| *usn > after)
            .collect();
        changes.sort_by_key(|(usn, _)| *usn);
        changes.truncate(usize::try_from(max_entries).unwrap_or(0));

        let mut chunk = SyncChunk {
            current_time: unix_timestamp_millis_now(),
            chunk_high_usn: changes.last().map(|(usn, _)| *usn),
            update_count: self.usn,
            ..SyncChunk::default()
        };
        for (_, change) in changes {
            match change {
                Change::Upsert(Entity::Notebook(notebook)) => chunk.notebooks.push(notebook.clone()),
                Change::Upsert(Entity::Tag(tag)) => chunk.tags.push(tag.clone()),
                Change::Upsert(Entity::SavedSearch(search)) => chunk.searches.push(search.clone()),
                Change::Upsert(Entity::Note(note)) => {
                    // Chunks carry note metadata only
                    let mut note = note.clone();
                    note.content.clear();
                    chunk.notes.push(note);
                }
                Change::Upsert(Entity::Resource(resource)) => {
                    let mut resource = resource.clone();
                    resource.data = None;
                    chunk.resources.push(resource);
                }
                Change::Upsert(Entity::LinkedNotebook(linked)) => {
                    chunk.linked_notebooks.push(linked.clone());
                }
                Change::Expunge(EntityKind::Notebook, guid) => {
                    chunk.expunged_notebooks.push(guid.clone());
                }
                Change::Expunge(EntityKind::Tag, guid) => chunk.expunged_tags.push(guid.clone()),
                Change::Expunge(EntityKind::SavedSearch, guid) => {
                    chunk.expunged_searches.push(guid.clone());
                }
                Change::Expunge(EntityKind::Note, guid) => chunk.expunged_notes.push(guid.clone()),
                Change::Expunge(EntityKind::LinkedNotebook, guid) => {
                    chunk.expunged_linked_notebooks.push(guid.clone());
                }
                Change::Expunge(EntityKind::Resource, _) => {}
            }
        }
        chunk
    }

    fn get<T: SyncEntity>(&self, guid: &Guid) -> RpcResult<T> {
        self.entities
            .get(&(T::KIND, guid.clone()))
            .cloned()
            .and_then(T::from_entity)
            .ok_or_else(|| RpcError::NotFound {
                identifier: Some(format!("{}.guid", T::KIND)),
                key: Some(guid.to_string()),
            })
    }
}

#[derive(Default)]
struct Server {
    streams: HashMap<Option<Guid>, Stream>,
    endpoints: HashMap<String, Option<Guid>>,
    next_guid: u64,
    failures: HashMap<String, VecDeque<Option<RpcError>>>,
    rejected_names: HashMap<String, RpcError>,
    calls: HashMap<String, Vec<Instant>>,
}

impl Server {
    fn record(&mut self, method: &str) -> RpcResult<()> {
        self.calls
            .entry(method.to_string())
            .or_default()
            .push(Instant::now());
        match self.failures.get_mut(method).and_then(VecDeque::pop_front) {
            Some(Some(error)) => Err(error),
            _ => Ok(()),
        }
    }

    fn stream(&mut self, scope: Option<&Guid>) -> &mut Stream {
        self.streams.entry(scope.cloned()).or_default()
    }

    fn stream_for_url(&self, url: &str) -> Option<Guid> {
        self.endpoints.get(url).cloned().flatten()
    }

    /// Create or update as the service would, enforcing unique names.
    fn store(&mut self, scope: Option<&Guid>, entity: &Entity) -> RpcResult<Entity> {
        if let Some(error) = entity.name().and_then(|name| self.rejected_names.get(name)) {
            return Err(error.clone());
        }
        let mut stored = wire_form(entity);
        let kind = stored.kind();

        let guid = match stored.meta().guid.clone() {
            Some(guid) => {
                if !self.stream(scope).entities.contains_key(&(kind, guid.clone())) {
                    return Err(RpcError::NotFound {
                        identifier: Some(format!("{kind}.guid")),
                        key: Some(guid.to_string()),
                    });
                }
                guid
            }
            None => {
                self.next_guid += 1;
                Guid::new(format!("{kind}-{}", self.next_guid))
            }
        };

        let stream = self.stream(scope);
        if kind.has_unique_names() {
            let name = stored.name().map(str::to_lowercase);
            let taken = stream.entities.iter().any(|((other_kind, other_guid), other)| {
                *other_kind == kind
                    && *other_guid != guid
                    && other.name().map(str::to_lowercase) == name
            });
            if taken {
                return Err(RpcError::User {
                    code: RpcErrorCode::DataConflict,
                    parameter: Some(format!("{kind}.name")),
                });
            }
        }

        stream.usn += 1;
        let meta = stored.meta_mut();
        meta.guid = Some(guid.clone());
        meta.usn = Some(stream.usn);
        stream.entities.insert((kind, guid), stored.clone());
        Ok(stored)
    }

    fn expunge(&mut self, scope: Option<&Guid>, kind: EntityKind, guid: &Guid) -> RpcResult<Usn> {
        let stream = self.stream(scope);
        if stream.entities.remove(&(kind, guid.clone())).is_none() {
            return Err(RpcError::NotFound {
                identifier: Some(format!("{kind}.guid")),
                key: Some(guid.to_string()),
            });
        }
        stream.usn += 1;
        stream.expunged.push((stream.usn, kind, guid.clone()));
        Ok(stream.usn)
    }
}

fn wire<T: Serialize + DeserializeOwned>(entity: &T) -> T {
    serde_json::to_value(entity)
        .and_then(serde_json::from_value)
        .expect("model round-trips through its wire form")
}

/// Drop local bookkeeping, as a trip over the wire would.
fn wire_form(entity: &Entity) -> Entity {
    match entity {
        Entity::Notebook(inner) => Entity::Notebook(wire(inner)),
        Entity::Tag(inner) => Entity::Tag(wire(inner)),
        Entity::SavedSearch(inner) => Entity::SavedSearch(wire(inner)),
        Entity::Note(inner) => Entity::Note(wire(inner)),
        Entity::Resource(inner) => Entity::Resource(wire(inner)),
        Entity::LinkedNotebook(inner) => Entity::LinkedNotebook(wire(inner)),
    }
}

/// Scriptable in-process note service.
#[derive(Clone, Default)]
pub struct FakeRemote {
    server: Arc<Mutex<Server>>,
}

impl FakeRemote {
    pub fn new() -> Self {
        let remote = Self::default();
        remote
            .server()
            .endpoints
            .insert(OWN_NOTE_STORE.to_string(), None);
        remote
    }

    fn server(&self) -> std::sync::MutexGuard<'_, Server> {
        self.server.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn account_token(&self) -> String {
        "account-token".to_string()
    }

    pub fn shared_token(&self) -> String {
        "shared-token".to_string()
    }

    /// Fail the next call of `method` with `error`. Queued failures are
    /// consumed in order.
    pub fn fail_next(&self, method: &str, error: RpcError) {
        self.fail_after(method, 0, error);
    }

    /// Let `successes` further calls of `method` through, then fail one.
    pub fn fail_after(&self, method: &str, successes: usize, error: RpcError) {
        let mut server = self.server();
        let queue = server.failures.entry(method.to_string()).or_default();
        queue.extend(std::iter::repeat_n(None, successes));
        queue.push_back(Some(error));
    }

    /// Reject every push of an entity with this name.
    pub fn reject_name(&self, name: &str, error: RpcError) {
        self.server().rejected_names.insert(name.to_string(), error);
    }

    pub fn calls(&self, method: &str) -> usize {
        self.server().calls.get(method).map_or(0, Vec::len)
    }

    pub fn call_times(&self, method: &str) -> Vec<Instant> {
        self.server().calls.get(method).cloned().unwrap_or_default()
    }

    /// Create or update an entity as another client would.
    pub fn put<T: SyncEntity>(&self, scope: Option<&Guid>, entity: T) -> T {
        let stored = self
            .server()
            .store(scope, &entity.into_entity())
            .expect("server accepts the entity");
        T::from_entity(stored).expect("kind is preserved")
    }

    pub fn expunge<T: SyncEntity>(&self, scope: Option<&Guid>, guid: &Guid) -> Usn {
        self.server()
            .expunge(scope, T::KIND, guid)
            .expect("entity exists on the server")
    }

    /// Remove an entity without recording an expunge, as a server-side
    /// purge before a forced full sync would.
    pub fn purge<T: SyncEntity>(&self, scope: Option<&Guid>, guid: &Guid) {
        self.server()
            .stream(scope)
            .entities
            .remove(&(T::KIND, guid.clone()));
    }

    pub fn get<T: SyncEntity>(&self, scope: Option<&Guid>, guid: &Guid) -> Option<T> {
        self.server().stream(scope).get(guid).ok()
    }

    pub fn all<T: SyncEntity>(&self, scope: Option<&Guid>) -> Vec<T> {
        self.server()
            .stream(scope)
            .entities
            .values()
            .filter_map(|entity| T::from_entity_ref(entity).cloned())
            .collect()
    }

    pub fn update_count(&self, scope: Option<&Guid>) -> Usn {
        self.server().stream(scope).usn
    }

    pub fn set_full_sync_before(&self, scope: Option<&Guid>, time: i64) {
        self.server().stream(scope).full_sync_before = time;
    }

    /// Share a notebook from another account into this one. The owner's
    /// stream starts with the shared notebook itself.
    pub fn share_notebook(&self, share_name: &str, notebook_name: &str) -> LinkedNotebook {
        let url = format!("https://fake.test/shard/s2/{share_name}");
        let linked = self.put(
            None,
            LinkedNotebook {
                meta: SyncMeta::default(),
                share_name: share_name.to_string(),
                username: "owner".to_string(),
                shard_id: Some("s2".to_string()),
                note_store_url: url.clone(),
                shared_notebook_global_id: Some(format!("{share_name}-key")),
            },
        );
        let scope = linked.meta.guid.clone();
        self.server().endpoints.insert(url, scope.clone());
        self.put(scope.as_ref(), Notebook::new(notebook_name));
        linked
    }
}

impl RemoteService for FakeRemote {
    type NoteStore = FakeNoteStore;

    fn note_store(&self, url: &str) -> FakeNoteStore {
        FakeNoteStore {
            remote: self.clone(),
            url: url.to_string(),
        }
    }

    async fn refresh_account_auth(&self, _account: &AccountId) -> RpcResult<AuthenticationResult> {
        self.server().record("refresh_account_auth")?;
        Ok(AuthenticationResult {
            token: self.account_token(),
            expires_at: unix_timestamp_now() + 3600,
            note_store_url: OWN_NOTE_STORE.to_string(),
            shard_id: Some("s1".to_string()),
        })
    }
}

/// Transport bound to one endpoint of a [`FakeRemote`].
pub struct FakeNoteStore {
    remote: FakeRemote,
    url: String,
}

impl FakeNoteStore {
    fn call<T>(&self, method: &str, run: impl FnOnce(&mut Server, Option<Guid>) -> RpcResult<T>) -> RpcResult<T> {
        let mut server = self.remote.server();
        server.record(method)?;
        let scope = server.stream_for_url(&self.url);
        run(&mut *server, scope)
    }
}

impl NoteStoreTransport for FakeNoteStore {
    async fn get_sync_state(&self, _token: &str) -> RpcResult<SyncState> {
        self.call("get_sync_state", |server, scope| {
            Ok(server.stream(scope.as_ref()).sync_state())
        })
    }

    async fn get_sync_chunk(
        &self,
        _token: &str,
        after_usn: Usn,
        max_entries: i32,
    ) -> RpcResult<SyncChunk> {
        self.call("get_sync_chunk", |server, scope| {
            Ok(server.stream(scope.as_ref()).chunk(after_usn, max_entries))
        })
    }

    async fn get_linked_notebook_sync_state(
        &self,
        _token: &str,
        linked: &LinkedNotebook,
    ) -> RpcResult<SyncState> {
        self.call("get_linked_notebook_sync_state", |server, _| {
            Ok(server.stream(linked.meta.guid.as_ref()).sync_state())
        })
    }

    async fn get_linked_notebook_sync_chunk(
        &self,
        _token: &str,
        linked: &LinkedNotebook,
        after_usn: Usn,
        max_entries: i32,
    ) -> RpcResult<SyncChunk> {
        self.call("get_linked_notebook_sync_chunk", |server, _| {
            Ok(server
                .stream(linked.meta.guid.as_ref())
                .chunk(after_usn, max_entries))
        })
    }

    async fn get_note(&self, _token: &str, guid: &Guid) -> RpcResult<Note> {
        self.call("get_note", |server, scope| server.stream(scope.as_ref()).get(guid))
    }

    async fn get_resource(&self, _token: &str, guid: &Guid) -> RpcResult<Resource> {
        self.call("get_resource", |server, scope| {
            server.stream(scope.as_ref()).get(guid)
        })
    }

    async fn get_notebook(&self, _token: &str, guid: &Guid) -> RpcResult<Notebook> {
        self.call("get_notebook", |server, scope| {
            server.stream(scope.as_ref()).get(guid)
        })
    }

    async fn get_tag(&self, _token: &str, guid: &Guid) -> RpcResult<Tag> {
        self.call("get_tag", |server, scope| server.stream(scope.as_ref()).get(guid))
    }

    async fn create_or_update(&self, _token: &str, entity: &Entity) -> RpcResult<PushAck> {
        self.call("create_or_update", |server, scope| {
            let stored = server.store(scope.as_ref(), entity)?;
            let meta = stored.meta();
            Ok(PushAck {
                guid: meta.guid.clone().unwrap_or_else(|| Guid::new("")),
                usn: meta.usn.unwrap_or_default(),
            })
        })
    }

    async fn expunge(&self, _token: &str, kind: EntityKind, guid: &Guid) -> RpcResult<Usn> {
        self.call("expunge", |server, scope| {
            server.expunge(scope.as_ref(), kind, guid)
        })
    }

    async fn authenticate_to_shared_notebook(
        &self,
        _token: &str,
        linked: &LinkedNotebook,
    ) -> RpcResult<AuthenticationResult> {
        self.call("authenticate_to_shared_notebook", |_, _| {
            Ok(AuthenticationResult {
                token: self.remote.shared_token(),
                expires_at: unix_timestamp_now() + 3600,
                note_store_url: linked.note_store_url.clone(),
                shard_id: linked.shard_id.clone(),
            })
        })
    }
}
