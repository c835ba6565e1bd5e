//! Synchronization controller
//!
//! One create/read/update/delete contract per record type, resilient to the
//! remote API being down:
//!
//! - Writes are staged in memory and persisted to the local cache first, then
//!   sent to the server. A server failure is logged and absorbed; the local
//!   copy stands and the caller gets a normal result.
//! - Records created while the server is unreachable keep a pending id. When a
//!   create does succeed, the pending id is aliased to the server id and every
//!   reference to it is rewritten.
//! - Operations on a pending id whose create is still in flight wait for that
//!   create to finish and then target the confirmed id.
//! - The last write issued for a record wins. Each write is staged locally
//!   with a sequence number, and a server response for an older write is
//!   dropped once a newer one has been staged.
//!
//! The state lock is never held across an `.await`; the only suspension
//! points are remote calls.

use chrono::Utc;
use logger_redacted::PiiRedactor;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;

use crate::error::{SyncError, SyncResult};
use crate::events::{EventSink, SyncEvent};
use crate::ids::{EntityKind, LocalId, RecordId};
use crate::local_cache::{CacheKey, LocalCacheStore};
use crate::model::{
    Amendment, Encounter, EncounterPatch, EncounterStatus, EncounterType, Episode, EpisodeStatus, Patient,
    SectionUpdate, SoapSection,
};
use crate::record::{Collections, CurrentSelection, Record, RecordPatch};
use crate::remote::{RemoteApi, RemoteError};
use crate::transform;

/// Whether a write may undo an irreversible transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WritePolicy {
    /// Refuse writes that would unsign, unresolve or drop amendments
    Guarded,
    /// The caller asked for the transition (reopening an episode)
    Explicit,
}

#[derive(Default)]
struct SyncState {
    collections: Collections,
    aliases: HashMap<LocalId, String>,
    in_flight: HashMap<LocalId, watch::Receiver<Option<RecordId>>>,
    current: CurrentSelection,
    /// Sequence number of the newest staged write per record
    writes: HashMap<RecordId, u64>,
    write_seq: u64,
}

/// What a create did with the record it was given
enum Staged<T> {
    Created(T),
    /// An equivalent record was already stored; nothing was written
    Existing { existing: T, incoming: T },
}

impl SyncState {
    fn canonical(&self, id: &RecordId) -> RecordId {
        match id.as_pending().and_then(|local| self.aliases.get(local)) {
            Some(server_id) => RecordId::Confirmed(server_id.clone()),
            None => id.clone(),
        }
    }

    fn begin_write(&mut self, id: &RecordId) -> u64 {
        self.write_seq += 1;
        self.writes.insert(id.clone(), self.write_seq);
        self.write_seq
    }

    fn is_superseded(&self, id: &RecordId, seq: u64) -> bool {
        self.writes.get(id).is_some_and(|latest| *latest > seq)
    }

    fn rewrite_everywhere(&mut self, from: &RecordId, to: &RecordId) {
        let collections = &mut self.collections;
        let rewritten = collections
            .patients
            .iter_mut()
            .map(|r| r.rewrite_reference(from, to))
            .chain(collections.episodes.iter_mut().map(|r| r.rewrite_reference(from, to)))
            .chain(collections.encounters.iter_mut().map(|r| r.rewrite_reference(from, to)))
            .filter(|changed| *changed)
            .count();

        for slot in [
            &mut self.current.patient,
            &mut self.current.episode,
            &mut self.current.encounter,
        ] {
            if slot.as_ref() == Some(from) {
                *slot = Some(to.clone());
            }
        }

        if rewritten > 0 {
            tracing::debug!(from = %from, to = %to, records = rewritten, "Rewrote references to confirmed id");
        }
    }

    /// Remove a record and everything it owns. Returns what was removed,
    /// root first; empty if the record is not held locally.
    fn remove_cascade(&mut self, kind: EntityKind, id: &RecordId) -> Vec<(EntityKind, RecordId)> {
        let collections = &mut self.collections;
        let mut patients = BTreeSet::new();
        let mut episodes = BTreeSet::new();
        let mut encounters = BTreeSet::new();

        let present = match kind {
            EntityKind::Patient => collections.contains::<Patient>(id) && patients.insert(id.clone()),
            EntityKind::Episode => collections.contains::<Episode>(id) && episodes.insert(id.clone()),
            EntityKind::Encounter => collections.contains::<Encounter>(id) && encounters.insert(id.clone()),
        };
        if !present {
            return Vec::new();
        }

        for episode in &collections.episodes {
            if patients.contains(&episode.patient_id) {
                episodes.insert(episode.id.clone());
            }
        }
        for encounter in &collections.encounters {
            if episodes.contains(&encounter.episode_id) || patients.contains(&encounter.patient_id) {
                encounters.insert(encounter.id.clone());
            }
        }

        collections.patients.retain(|p| !patients.contains(&p.id));
        collections.episodes.retain(|e| !episodes.contains(&e.id));
        collections.encounters.retain(|e| !encounters.contains(&e.id));
        for episode in &mut collections.episodes {
            episode.related_episode_ids.retain(|related| !episodes.contains(related));
        }

        let selection = &mut self.current;
        if selection.patient.as_ref().is_some_and(|p| patients.contains(p)) {
            selection.patient = None;
        }
        if selection.episode.as_ref().is_some_and(|e| episodes.contains(e)) {
            selection.episode = None;
        }
        if selection.encounter.as_ref().is_some_and(|e| encounters.contains(e)) {
            selection.encounter = None;
        }
        self.writes
            .retain(|id, _| !patients.contains(id) && !episodes.contains(id) && !encounters.contains(id));

        let mut removed = vec![(kind, id.clone())];
        let owned = patients
            .into_iter()
            .map(|p| (EntityKind::Patient, p))
            .chain(episodes.into_iter().map(|e| (EntityKind::Episode, e)))
            .chain(encounters.into_iter().map(|e| (EntityKind::Encounter, e)));
        removed.extend(owned.filter(|(k, r)| !(*k == kind && r == id)));
        removed
    }
}

pub struct SyncController {
    remote: Arc<dyn RemoteApi>,
    cache: LocalCacheStore,
    events: Arc<dyn EventSink>,
    redactor: PiiRedactor,
    state: Mutex<SyncState>,
}

impl fmt::Debug for SyncController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncController")
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}

impl SyncController {
    /// Build a controller over whatever the cache already holds.
    ///
    /// # Errors
    ///
    /// `Cache` if a cached collection cannot be read or parsed.
    pub fn new(remote: Arc<dyn RemoteApi>, cache: LocalCacheStore, events: Arc<dyn EventSink>) -> SyncResult<Self> {
        let collections = Collections {
            patients: cache.load_collection(CacheKey::Patients)?,
            episodes: cache.load_collection(CacheKey::Episodes)?,
            encounters: cache.load_collection(CacheKey::Encounters)?,
        };

        let mut aliases = HashMap::new();
        for (local, server_id) in cache.load_map::<String>(CacheKey::Aliases)? {
            match local.parse::<LocalId>() {
                Ok(local) => {
                    aliases.insert(local, server_id);
                }
                Err(reason) => tracing::warn!(alias = %local, reason = %reason, "Skipping malformed cached alias"),
            }
        }

        tracing::info!(
            patients = collections.patients.len(),
            episodes = collections.episodes.len(),
            encounters = collections.encounters.len(),
            aliases = aliases.len(),
            "Loaded local record cache"
        );

        Ok(Self {
            remote,
            cache,
            events,
            redactor: PiiRedactor::default(),
            state: Mutex::new(SyncState {
                collections,
                aliases,
                ..SyncState::default()
            }),
        })
    }

    pub fn with_redactor(mut self, redactor: PiiRedactor) -> Self {
        self.redactor = redactor;
        self
    }

    pub fn cache(&self) -> &LocalCacheStore {
        &self.cache
    }

    // ------------------------------------------------------------------------
    // Generic CRUD
    // ------------------------------------------------------------------------

    /// Validate, stage locally, then try the server.
    ///
    /// Remote failures never fail the call; the record stays local-only.
    ///
    /// A record that duplicates a stored one (a second draft for the same
    /// encounter slot) is not created; whatever content it carries is merged
    /// into the stored record instead.
    ///
    /// # Errors
    ///
    /// `Validation` for invalid records or unknown parents (nothing is
    /// written), `Cache` if the local store cannot be written.
    pub async fn create<T: Record>(&self, entity: T) -> SyncResult<T> {
        match self.create_inner(entity).await? {
            Staged::Created(saved) => Ok(saved),
            Staged::Existing { existing, incoming } => match T::merge_duplicate(&existing, &incoming) {
                Some(patch) => self.update::<T>(existing.id(), patch).await,
                None => Ok(existing),
            },
        }
    }

    /// The duplicate check runs under the same lock that stages the record,
    /// so a concurrent caller always sees the first caller's staged copy.
    async fn create_inner<T: Record>(&self, mut entity: T) -> SyncResult<Staged<T>> {
        entity.validate()?;

        // Parents created moments ago may still be in flight
        let references: Vec<RecordId> = entity.references().into_iter().cloned().collect();
        for reference in references {
            let resolved = self.resolve_id(&reference).await;
            if resolved != reference {
                entity.rewrite_reference(&reference, &resolved);
            }
        }

        let local = LocalId::new(T::KIND);
        let pending_id = RecordId::Pending(local);
        entity.set_id(pending_id.clone());

        let sender = {
            let mut state = self.state.lock();
            if let Some(existing) = entity.duplicate_in(&state.collections) {
                tracing::debug!(
                    entity_type = T::KIND.as_str(),
                    entity_id = %existing.id(),
                    "Using existing record instead of creating a duplicate"
                );
                return Ok(Staged::Existing {
                    existing,
                    incoming: entity,
                });
            }
            entity.check_references(&state.collections)?;

            T::collection_mut(&mut state.collections).push(entity.clone());
            if let Err(err) = self.persist::<T>(&state) {
                T::collection_mut(&mut state.collections).pop();
                return Err(err);
            }

            let (sender, receiver) = watch::channel(None);
            state.in_flight.insert(local, receiver);
            sender
        };

        let confirmed = self.remote_create(&entity).await;

        let saved = {
            let mut state = self.state.lock();
            state.in_flight.remove(&local);

            match confirmed {
                Some(confirmed) => {
                    let confirmed_id = confirmed.id().clone();
                    if let Some(server_id) = confirmed_id.as_confirmed() {
                        state.aliases.insert(local, server_id.to_string());
                    }

                    let slot = T::collection_mut(&mut state.collections)
                        .iter_mut()
                        .find(|record| record.id() == &pending_id);
                    match slot {
                        Some(slot) => *slot = confirmed.clone(),
                        None => tracing::debug!(
                            entity_type = T::KIND.as_str(),
                            entity_id = %confirmed_id,
                            "Record was removed locally while its create was in flight"
                        ),
                    }
                    state.rewrite_everywhere(&pending_id, &confirmed_id);

                    let persisted = self.persist_all(&state);
                    sender.send_replace(Some(confirmed_id));
                    persisted.map(|()| confirmed)
                }
                None => {
                    sender.send_replace(Some(pending_id));
                    Ok(entity)
                }
            }
        }?;

        tracing::info!(
            entity_type = T::KIND.as_str(),
            entity_id = %saved.id(),
            local_only = saved.id().is_pending(),
            "Created record"
        );
        self.events.emit(SyncEvent::Saved {
            kind: T::KIND,
            id: saved.id().clone(),
        });
        Ok(Staged::Created(saved))
    }

    async fn remote_create<T: Record>(&self, entity: &T) -> Option<T> {
        let body = match transform::encode(entity) {
            Ok(Some(body)) => body,
            Ok(None) => {
                tracing::debug!(
                    entity_type = T::KIND.as_str(),
                    entity_id = %entity.id(),
                    "References a local-only record; keeping it local"
                );
                return None;
            }
            Err(err) => {
                tracing::warn!(entity_type = T::KIND.as_str(), error = %err, "Could not encode record");
                return None;
            }
        };

        match self.remote.create(T::KIND, body).await.and_then(transform::decode::<T>) {
            Ok(confirmed) => Some(confirmed),
            Err(err) => {
                self.remote_failed(T::KIND, entity.id(), "create", &err);
                None
            }
        }
    }

    /// Map a pending id to the id operations should target now: the server
    /// id once known, waiting for an in-flight create if there is one.
    pub async fn resolve_id(&self, id: &RecordId) -> RecordId {
        let Some(local) = id.as_pending().copied() else {
            return id.clone();
        };

        let waiter = {
            let state = self.state.lock();
            if let Some(server_id) = state.aliases.get(&local) {
                return RecordId::Confirmed(server_id.clone());
            }
            state.in_flight.get(&local).cloned()
        };
        let Some(mut receiver) = waiter else {
            return id.clone();
        };

        let resolved = match receiver.wait_for(Option::is_some).await {
            Ok(value) => (*value).clone(),
            Err(_) => None,
        };
        resolved.unwrap_or_else(|| self.state.lock().canonical(id))
    }

    /// Merge `patch` into the stored record, stage the result locally and
    /// push it. The patch is merged into the newest staged copy, so updates
    /// issued back to back all land even when their responses arrive out of
    /// order.
    ///
    /// # Errors
    ///
    /// `NotFound` if the record is not held locally, `InvalidTransition` or
    /// `Validation` if the patch is rejected (including a change that would
    /// make the record a duplicate), `Cache` on local store failure.
    pub async fn update<T: Record>(&self, id: &RecordId, patch: T::Patch) -> SyncResult<T> {
        let id = self.resolve_id(id).await;
        let (merged, seq) = {
            let mut state = self.state.lock();
            let current = state
                .collections
                .find::<T>(&id)
                .cloned()
                .ok_or_else(|| SyncError::not_found(T::KIND, &id))?;
            let mut merged = current.clone();
            patch.apply(&mut merged)?;
            merged.validate()?;

            if current.duplicate_in(&state.collections).is_none() {
                if let Some(other) = merged.duplicate_in(&state.collections) {
                    return Err(SyncError::InvalidTransition(format!(
                        "{} {id} would duplicate {}",
                        T::KIND,
                        other.id()
                    )));
                }
            }

            let seq = self.stage_locked(&mut state, &merged, WritePolicy::Guarded)?;
            (merged, seq)
        };
        self.send_update(merged, WritePolicy::Guarded, seq).await
    }

    async fn push_update<T: Record>(&self, entity: T, policy: WritePolicy) -> SyncResult<T> {
        let seq = {
            let mut state = self.state.lock();
            self.stage_locked(&mut state, &entity, policy)?
        };
        self.send_update(entity, policy, seq).await
    }

    async fn send_update<T: Record>(&self, entity: T, policy: WritePolicy, seq: u64) -> SyncResult<T> {
        let server_id = entity.id().as_confirmed().map(str::to_string);
        let stored = match server_id {
            Some(server_id) => self.remote_replace(&entity, &server_id).await.unwrap_or(entity),
            None => entity,
        };
        self.store_outcome(stored, policy, seq)
    }

    /// Make `entity` the newest local copy of its record and persist it.
    /// Returns the write's sequence number.
    fn stage_locked<T: Record>(&self, state: &mut SyncState, entity: &T, policy: WritePolicy) -> SyncResult<u64> {
        let slot = T::collection_mut(&mut state.collections)
            .iter_mut()
            .find(|record| record.id() == entity.id())
            .ok_or_else(|| SyncError::not_found(T::KIND, entity.id()))?;
        if policy == WritePolicy::Guarded && !T::accept_overwrite(slot, entity) {
            return Err(SyncError::InvalidTransition(format!(
                "{} {} changed while this write was prepared",
                T::KIND,
                entity.id()
            )));
        }
        let previous = std::mem::replace(slot, entity.clone());

        if let Err(err) = self.persist::<T>(state) {
            if let Some(slot) = T::collection_mut(&mut state.collections)
                .iter_mut()
                .find(|record| record.id() == entity.id())
            {
                *slot = previous;
            }
            return Err(err);
        }
        Ok(state.begin_write(entity.id()))
    }

    async fn remote_replace<T: Record>(&self, entity: &T, server_id: &str) -> Option<T> {
        let body = match transform::encode(entity) {
            Ok(Some(body)) => body,
            Ok(None) => return None,
            Err(err) => {
                tracing::warn!(entity_type = T::KIND.as_str(), error = %err, "Could not encode record");
                return None;
            }
        };

        match self
            .remote
            .replace(T::KIND, server_id, body)
            .await
            .and_then(transform::decode::<T>)
        {
            Ok(mut updated) => {
                updated.set_id(entity.id().clone());
                Some(updated)
            }
            Err(err) => {
                self.remote_failed(T::KIND, entity.id(), "update", &err);
                None
            }
        }
    }

    /// Settle write `seq` with what the server returned (or the staged copy
    /// when the server could not be reached).
    fn store_outcome<T: Record>(&self, entity: T, policy: WritePolicy, seq: u64) -> SyncResult<T> {
        let stored = {
            let mut state = self.state.lock();
            let superseded = state.is_superseded(entity.id(), seq);
            let slot = T::collection_mut(&mut state.collections)
                .iter_mut()
                .find(|record| record.id() == entity.id())
                .ok_or_else(|| SyncError::not_found(T::KIND, entity.id()))?;

            if superseded {
                tracing::debug!(
                    entity_type = T::KIND.as_str(),
                    entity_id = %entity.id(),
                    write = seq,
                    "Ignoring response to a superseded write"
                );
                return Ok(slot.clone());
            }
            if policy == WritePolicy::Guarded && !T::accept_overwrite(slot, &entity) {
                tracing::debug!(
                    entity_type = T::KIND.as_str(),
                    entity_id = %entity.id(),
                    "Ignoring write that would undo an irreversible transition"
                );
                return Ok(slot.clone());
            }

            *slot = entity;
            let stored = slot.clone();
            self.persist::<T>(&state)?;
            stored
        };

        self.events.emit(SyncEvent::Saved {
            kind: T::KIND,
            id: stored.id().clone(),
        });
        Ok(stored)
    }

    /// Delete a record and, for patients and episodes, everything they own.
    ///
    /// The local removal happens whether or not the server could be reached.
    ///
    /// # Errors
    ///
    /// `NotFound` if neither the local store nor the server held the record,
    /// `Cache` on local store failure.
    pub async fn delete<T: Record>(&self, id: &RecordId) -> SyncResult<()> {
        let id = self.resolve_id(id).await;

        let remote_deleted = match id.as_confirmed() {
            Some(server_id) => match self.remote.delete(T::KIND, server_id).await {
                Ok(()) => true,
                Err(RemoteError::NotFound) => false,
                Err(err) => {
                    self.remote_failed(T::KIND, &id, "delete", &err);
                    false
                }
            },
            None => false,
        };

        let removed = {
            let mut state = self.state.lock();
            let removed = state.remove_cascade(T::KIND, &id);
            if removed.is_empty() {
                if !remote_deleted {
                    return Err(SyncError::not_found(T::KIND, &id));
                }
                vec![(T::KIND, id.clone())]
            } else {
                self.persist_all(&state)?;
                removed
            }
        };

        tracing::info!(
            entity_type = T::KIND.as_str(),
            entity_id = %id,
            cascaded = removed.len().saturating_sub(1),
            "Deleted record"
        );
        for (kind, id) in removed {
            self.events.emit(SyncEvent::Deleted { kind, id });
        }
        Ok(())
    }

    /// Local copy first, then the server (caching what it returns).
    ///
    /// # Errors
    ///
    /// `NotFound` when neither has the record, `Cache` if a fetched record
    /// cannot be persisted.
    pub async fn get<T: Record>(&self, id: &RecordId) -> SyncResult<T> {
        let id = self.resolve_id(id).await;
        let cached = self.state.lock().collections.find::<T>(&id).cloned();
        if let Some(found) = cached {
            return Ok(found);
        }

        let Some(server_id) = id.as_confirmed() else {
            return Err(SyncError::not_found(T::KIND, &id));
        };

        match self
            .remote
            .fetch(T::KIND, server_id)
            .await
            .and_then(transform::decode::<T>)
        {
            Ok(fetched) => {
                let mut state = self.state.lock();
                if !state.collections.contains::<T>(fetched.id()) {
                    T::collection_mut(&mut state.collections).push(fetched.clone());
                    self.persist::<T>(&state)?;
                }
                Ok(fetched)
            }
            Err(RemoteError::NotFound) => Err(SyncError::not_found(T::KIND, &id)),
            Err(err) => {
                self.remote_failed(T::KIND, &id, "fetch", &err);
                Err(SyncError::not_found(T::KIND, &id))
            }
        }
    }

    /// The server's collection plus records still pending locally; the cached
    /// collection when the server cannot be reached.
    ///
    /// # Errors
    ///
    /// `Cache` if the refreshed collection cannot be persisted.
    pub async fn list<T: Record>(&self) -> SyncResult<Vec<T>> {
        let fetched = self
            .remote
            .list(T::KIND)
            .await
            .and_then(transform::decode_list::<T>);

        let remote_records = match fetched {
            Ok(records) => records,
            Err(err) => {
                tracing::warn!(
                    entity_type = T::KIND.as_str(),
                    operation = "list",
                    error = %self.redactor.redact(&err.to_string()),
                    "Remote list failed; serving cached collection"
                );
                return Ok(self.collection::<T>());
            }
        };

        let mut state = self.state.lock();
        let local = T::collection(&state.collections).clone();
        let mut merged: Vec<T> = remote_records
            .into_iter()
            .map(|incoming| match local.iter().find(|held| held.id() == incoming.id()) {
                Some(held) if !T::accept_overwrite(held, &incoming) => held.clone(),
                _ => incoming,
            })
            .collect();
        merged.extend(local.into_iter().filter(|held| held.id().is_pending()));

        *T::collection_mut(&mut state.collections) = merged.clone();
        self.persist::<T>(&state)?;
        Ok(merged)
    }

    /// Refresh every collection from the server, parents first.
    ///
    /// # Errors
    ///
    /// See [`Self::list`].
    pub async fn load(&self) -> SyncResult<()> {
        self.list::<Patient>().await?;
        self.list::<Episode>().await?;
        self.list::<Encounter>().await?;
        Ok(())
    }

    /// Snapshot of the in-memory collection, in creation order
    pub fn collection<T: Record>(&self) -> Vec<T> {
        T::collection(&self.state.lock().collections).clone()
    }

    pub fn get_episode_encounters(&self, episode_id: &RecordId) -> Vec<Encounter> {
        let state = self.state.lock();
        let episode_id = state.canonical(episode_id);
        state
            .collections
            .encounters
            .iter()
            .filter(|encounter| encounter.episode_id == episode_id)
            .cloned()
            .collect()
    }

    pub fn get_patient_episodes(&self, patient_id: &RecordId) -> Vec<Episode> {
        let state = self.state.lock();
        let patient_id = state.canonical(patient_id);
        state
            .collections
            .episodes
            .iter()
            .filter(|episode| episode.patient_id == patient_id)
            .cloned()
            .collect()
    }

    /// Local-only records, i.e. those no server has confirmed
    pub fn pending_records(&self) -> Vec<LocalId> {
        let state = self.state.lock();
        let collections = &state.collections;
        collections
            .patients
            .iter()
            .map(|p| &p.id)
            .chain(collections.episodes.iter().map(|e| &e.id))
            .chain(collections.encounters.iter().map(|e| &e.id))
            .filter_map(|id| id.as_pending().copied())
            .collect()
    }

    // ------------------------------------------------------------------------
    // Current selection
    // ------------------------------------------------------------------------

    /// # Errors
    ///
    /// `NotFound` if the record is not held locally.
    pub fn set_current<T: Record>(&self, id: &RecordId) -> SyncResult<()> {
        let mut state = self.state.lock();
        let id = state.canonical(id);
        if !state.collections.contains::<T>(&id) {
            return Err(SyncError::not_found(T::KIND, &id));
        }
        *T::current_slot(&mut state.current) = Some(id);
        Ok(())
    }

    pub fn clear_current<T: Record>(&self) {
        *T::current_slot(&mut self.state.lock().current) = None;
    }

    pub fn current<T: Record>(&self) -> Option<T> {
        let mut state = self.state.lock();
        let id = T::current_slot(&mut state.current).clone()?;
        state.collections.find::<T>(&id).cloned()
    }

    // ------------------------------------------------------------------------
    // Encounter actions
    // ------------------------------------------------------------------------

    /// The unsigned encounter for this (episode, patient, type), creating it
    /// if there is none. A draft whose create is still in flight counts.
    ///
    /// # Errors
    ///
    /// As [`Self::create`].
    pub async fn create_draft_encounter(
        &self,
        episode_id: &RecordId,
        patient_id: &RecordId,
        encounter_type: EncounterType,
    ) -> SyncResult<Encounter> {
        let draft = Encounter::draft(episode_id.clone(), patient_id.clone(), encounter_type);
        match self.create_inner(draft).await? {
            Staged::Created(draft) | Staged::Existing { existing: draft, .. } => Ok(draft),
        }
    }

    /// Save a whole draft: update if the store holds it, create otherwise.
    /// When another entry point stored a draft for the same slot first, this
    /// draft's content is written into that one and the stored draft is
    /// returned.
    ///
    /// # Errors
    ///
    /// `InvalidTransition` if the stored encounter is signed and the draft
    /// differs; otherwise as [`Self::create`] and [`Self::update`].
    pub async fn save_encounter(&self, draft: Encounter) -> SyncResult<Encounter> {
        let id = self.resolve_id(&draft.id).await;
        let exists = self.state.lock().collections.contains::<Encounter>(&id);
        if exists {
            self.update::<Encounter>(&id, EncounterPatch::from_draft(&draft)).await
        } else {
            match self.create_inner(draft).await? {
                Staged::Created(saved) => Ok(saved),
                Staged::Existing { existing, incoming } => {
                    tracing::debug!(
                        entity_type = "encounter",
                        entity_id = %existing.id,
                        "Saving into the draft already stored for this slot"
                    );
                    self.update::<Encounter>(&existing.id, EncounterPatch::from_draft(&incoming))
                        .await
                }
            }
        }
    }

    /// Replace one SOAP section (`PATCH /encounters/{id}/soap`).
    ///
    /// # Errors
    ///
    /// `InvalidTransition` on a signed encounter, `NotFound`, `Cache`.
    pub async fn update_soap_section(&self, id: &RecordId, update: SectionUpdate) -> SyncResult<Encounter> {
        let id = self.resolve_id(id).await;
        let section = update.section();
        let (merged, seq) = {
            let mut state = self.state.lock();
            let mut encounter = state
                .collections
                .find::<Encounter>(&id)
                .cloned()
                .ok_or_else(|| SyncError::not_found(EntityKind::Encounter, &id))?;
            if encounter.is_signed() {
                return Err(SyncError::InvalidTransition(format!(
                    "encounter {id} is signed; {section} can only be amended"
                )));
            }
            let now = Utc::now();
            update.apply_to(&mut encounter.soap, now);
            encounter.updated_at = now;
            let seq = self.stage_locked(&mut state, &encounter, WritePolicy::Guarded)?;
            (encounter, seq)
        };

        let server_id = merged.id.as_confirmed().map(str::to_string);
        let stored = match (server_id, transform::to_encounter_wire(&merged)) {
            (Some(server_id), Some(wire)) => {
                let body = transform::soap_section_patch(&wire, section)?;
                match self
                    .remote
                    .patch_soap(&server_id, body)
                    .await
                    .and_then(transform::decode::<Encounter>)
                {
                    Ok(mut updated) => {
                        updated.id = merged.id.clone();
                        updated
                    }
                    Err(err) => {
                        self.remote_failed(EntityKind::Encounter, &merged.id, "patch_soap", &err);
                        merged
                    }
                }
            }
            _ => merged,
        };
        self.store_outcome(stored, WritePolicy::Guarded, seq)
    }

    /// Sign an encounter. Signing is irreversible; signing an already signed
    /// encounter returns it unchanged.
    ///
    /// # Errors
    ///
    /// `Validation` for an empty signer, `NotFound`, `Cache`.
    pub async fn sign_encounter(&self, id: &RecordId, signer: &str) -> SyncResult<Encounter> {
        let signer = signer.trim();
        if signer.is_empty() {
            return Err(SyncError::Validation("a signer is required".into()));
        }

        let id = self.resolve_id(id).await;
        let current = self.find::<Encounter>(&id)?;
        if current.is_signed() {
            tracing::debug!(entity_type = "encounter", entity_id = %id, "Encounter already signed");
            return Ok(current);
        }

        let now = Utc::now();
        let mut signed = current;
        signed.status = EncounterStatus::Signed;
        signed.signed_at = Some(now);
        signed.signed_by = Some(signer.to_string());
        signed.updated_at = now;
        let seq = {
            let mut state = self.state.lock();
            self.stage_locked(&mut state, &signed, WritePolicy::Guarded)?
        };

        let stored = match id.as_confirmed() {
            Some(server_id) => {
                let body = json!({ "signed_by": signer, "signed_at": now });
                match self
                    .remote
                    .sign(server_id, body)
                    .await
                    .and_then(transform::decode::<Encounter>)
                {
                    Ok(mut confirmed) if confirmed.is_signed() => {
                        confirmed.id = id.clone();
                        confirmed
                    }
                    Ok(_) => {
                        tracing::warn!(entity_type = "encounter", entity_id = %id, "Server did not record the signature");
                        signed
                    }
                    Err(err) => {
                        self.remote_failed(EntityKind::Encounter, &id, "sign", &err);
                        signed
                    }
                }
            }
            None => signed,
        };

        let stored = self.store_outcome(stored, WritePolicy::Guarded, seq)?;
        self.events.emit(SyncEvent::Signed {
            encounter_id: stored.id.clone(),
            signed_by: signer.to_string(),
        });
        Ok(stored)
    }

    /// Append a correction to a signed encounter.
    ///
    /// # Errors
    ///
    /// `InvalidTransition` on an unsigned encounter, `Validation` for empty
    /// text or author, `NotFound`, `Cache`.
    pub async fn amend_encounter(
        &self,
        id: &RecordId,
        section: SoapSection,
        text: &str,
        author: &str,
    ) -> SyncResult<Encounter> {
        if text.trim().is_empty() || author.trim().is_empty() {
            return Err(SyncError::Validation("an amendment needs text and an author".into()));
        }

        let id = self.resolve_id(id).await;
        let mut encounter = self.find::<Encounter>(&id)?;
        if !encounter.is_signed() {
            return Err(SyncError::InvalidTransition(format!(
                "encounter {id} is a draft; edit it instead of amending"
            )));
        }

        encounter.amendments.push(Amendment::new(section, text.trim(), author.trim()));
        encounter.updated_at = Utc::now();
        self.push_update(encounter, WritePolicy::Guarded).await
    }

    // ------------------------------------------------------------------------
    // Episode actions
    // ------------------------------------------------------------------------

    /// Mark an episode resolved. Already resolved episodes are returned as
    /// they are, keeping their original resolution time.
    ///
    /// # Errors
    ///
    /// `NotFound`, `Cache`.
    pub async fn resolve_episode(&self, id: &RecordId) -> SyncResult<Episode> {
        let id = self.resolve_id(id).await;
        let mut episode = self.find::<Episode>(&id)?;
        if episode.is_resolved() {
            return Ok(episode);
        }

        let now = Utc::now();
        episode.status = EpisodeStatus::Resolved;
        episode.resolved_at = Some(now);
        episode.updated_at = now;
        self.push_update(episode, WritePolicy::Guarded).await
    }

    /// The only way out of `resolved`.
    ///
    /// # Errors
    ///
    /// `NotFound`, `Cache`.
    pub async fn reopen_episode(&self, id: &RecordId) -> SyncResult<Episode> {
        let id = self.resolve_id(id).await;
        let mut episode = self.find::<Episode>(&id)?;
        if !episode.is_resolved() {
            return Ok(episode);
        }

        episode.status = EpisodeStatus::Active;
        episode.resolved_at = None;
        episode.updated_at = Utc::now();
        self.push_update(episode, WritePolicy::Explicit).await
    }

    /// Record that two episodes of the same patient are related. The link is
    /// stored on both sides.
    ///
    /// # Errors
    ///
    /// `Validation` for self links or episodes of different patients,
    /// `NotFound`, `Cache`.
    pub async fn link_episodes(&self, a: &RecordId, b: &RecordId) -> SyncResult<(Episode, Episode)> {
        self.relink(a, b, true).await
    }

    /// # Errors
    ///
    /// As [`Self::link_episodes`].
    pub async fn unlink_episodes(&self, a: &RecordId, b: &RecordId) -> SyncResult<(Episode, Episode)> {
        self.relink(a, b, false).await
    }

    async fn relink(&self, a: &RecordId, b: &RecordId, link: bool) -> SyncResult<(Episode, Episode)> {
        let a = self.resolve_id(a).await;
        let b = self.resolve_id(b).await;
        if a == b {
            return Err(SyncError::Validation("an episode cannot be related to itself".into()));
        }

        let mut first = self.find::<Episode>(&a)?;
        let mut second = self.find::<Episode>(&b)?;
        if first.patient_id != second.patient_id {
            return Err(SyncError::Validation(format!(
                "episodes {a} and {b} belong to different patients"
            )));
        }

        let changed = if link {
            let added_a = first.related_episode_ids.insert(b.clone());
            let added_b = second.related_episode_ids.insert(a.clone());
            added_a || added_b
        } else {
            let removed_a = first.related_episode_ids.remove(&b);
            let removed_b = second.related_episode_ids.remove(&a);
            removed_a || removed_b
        };
        if !changed {
            return Ok((first, second));
        }

        let now = Utc::now();
        first.updated_at = now;
        second.updated_at = now;
        let first = self.push_update(first, WritePolicy::Guarded).await?;
        let second = self.push_update(second, WritePolicy::Guarded).await?;
        Ok((first, second))
    }

    // ------------------------------------------------------------------------
    // Auxiliary cache-only blobs
    // ------------------------------------------------------------------------

    /// # Errors
    ///
    /// `Cache` on local store failure.
    pub fn save_note(&self, key: &str, value: Value) -> SyncResult<()> {
        self.put_entry(CacheKey::Notes, key, value)
    }

    /// # Errors
    ///
    /// `Cache` on local store failure.
    pub fn notes(&self) -> SyncResult<BTreeMap<String, Value>> {
        let _guard = self.state.lock();
        self.cache.load_map(CacheKey::Notes)
    }

    /// # Errors
    ///
    /// `Cache` on local store failure.
    pub fn save_profile(&self, value: Value) -> SyncResult<()> {
        let _guard = self.state.lock();
        self.cache.save_blob(CacheKey::Profile, &value)
    }

    /// # Errors
    ///
    /// `Cache` on local store failure.
    pub fn profile(&self) -> SyncResult<Option<Value>> {
        let _guard = self.state.lock();
        self.cache.load_blob(CacheKey::Profile)
    }

    /// # Errors
    ///
    /// `Cache` on local store failure.
    pub fn save_report(&self, key: &str, value: Value) -> SyncResult<()> {
        self.put_entry(CacheKey::Reports, key, value)
    }

    /// # Errors
    ///
    /// `Cache` on local store failure.
    pub fn reports(&self) -> SyncResult<BTreeMap<String, Value>> {
        let _guard = self.state.lock();
        self.cache.load_map(CacheKey::Reports)
    }

    fn put_entry(&self, partition: CacheKey, key: &str, value: Value) -> SyncResult<()> {
        // The state lock serializes read-modify-write on the map
        let _guard = self.state.lock();
        let mut entries: BTreeMap<String, Value> = self.cache.load_map(partition)?;
        entries.insert(key.to_string(), value);
        self.cache.save_map(partition, &entries)
    }

    // ------------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------------

    fn find<T: Record>(&self, id: &RecordId) -> SyncResult<T> {
        self.state
            .lock()
            .collections
            .find::<T>(id)
            .cloned()
            .ok_or_else(|| SyncError::not_found(T::KIND, id))
    }

    fn persist<T: Record>(&self, state: &SyncState) -> SyncResult<()> {
        self.cache
            .save_collection(T::CACHE_KEY, T::collection(&state.collections))
    }

    fn persist_all(&self, state: &SyncState) -> SyncResult<()> {
        self.persist::<Patient>(state)?;
        self.persist::<Episode>(state)?;
        self.persist::<Encounter>(state)?;

        let aliases: BTreeMap<String, String> = state
            .aliases
            .iter()
            .map(|(local, server_id)| (local.to_string(), server_id.clone()))
            .collect();
        self.cache.save_map(CacheKey::Aliases, &aliases)
    }

    fn remote_failed(&self, kind: EntityKind, id: &RecordId, operation: &'static str, err: &RemoteError) {
        tracing::warn!(
            entity_type = kind.as_str(),
            entity_id = %id,
            operation,
            error = %self.redactor.redact(&err.to_string()),
            "Remote request failed; keeping local copy"
        );
    }
}
