//! The `Record` seam the controller is generic over

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{SyncError, SyncResult};
use crate::ids::{EntityKind, RecordId};
use crate::local_cache::CacheKey;
use crate::model::{Encounter, EncounterPatch, Episode, EpisodePatch, EpisodeStatus, Patient, PatientPatch};
use crate::transform;

/// A partial change merged into a clone of the stored record
pub trait RecordPatch: Send {
    type Target;

    /// # Errors
    ///
    /// `InvalidTransition` when the change is not allowed in the target's
    /// current state.
    fn apply(self, target: &mut Self::Target) -> SyncResult<()>;
}

/// In-memory collections, in creation order
#[derive(Debug, Clone, Default)]
pub struct Collections {
    pub patients: Vec<Patient>,
    pub episodes: Vec<Episode>,
    pub encounters: Vec<Encounter>,
}

impl Collections {
    pub fn contains<T: Record>(&self, id: &RecordId) -> bool {
        T::collection(self).iter().any(|record| record.id() == id)
    }

    pub fn find<T: Record>(&self, id: &RecordId) -> Option<&T> {
        T::collection(self).iter().find(|record| record.id() == id)
    }
}

/// Ids of the records the UI is currently viewing
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CurrentSelection {
    pub patient: Option<RecordId>,
    pub episode: Option<RecordId>,
    pub encounter: Option<RecordId>,
}

pub trait Record: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {
    const KIND: EntityKind;
    const CACHE_KEY: CacheKey;

    type Wire: Serialize + DeserializeOwned;
    type Patch: RecordPatch<Target = Self>;

    fn id(&self) -> &RecordId;
    fn set_id(&mut self, id: RecordId);

    /// # Errors
    ///
    /// `Validation` describing the first violated rule.
    fn validate(&self) -> SyncResult<()>;

    /// Parents must exist locally when a record is created.
    ///
    /// # Errors
    ///
    /// `Validation` naming the missing or mismatched parent.
    fn check_references(&self, _collections: &Collections) -> SyncResult<()> {
        Ok(())
    }

    /// Foreign keys held by this record
    fn references(&self) -> Vec<&RecordId> {
        Vec::new()
    }

    /// Replace every foreign key equal to `from`. Returns whether anything changed.
    fn rewrite_reference(&mut self, _from: &RecordId, _to: &RecordId) -> bool {
        false
    }

    fn to_remote(&self) -> Option<Self::Wire>;
    fn from_remote(wire: Self::Wire) -> Self;

    fn collection(collections: &Collections) -> &Vec<Self>;
    fn collection_mut(collections: &mut Collections) -> &mut Vec<Self>;
    fn current_slot(selection: &mut CurrentSelection) -> &mut Option<RecordId>;

    /// Whether `incoming` may replace `current` without an explicit transition.
    /// Guards irreversible state against late or stale responses.
    fn accept_overwrite(_current: &Self, _incoming: &Self) -> bool {
        true
    }

    /// Another stored record this one may not coexist with
    fn duplicate_in(&self, _collections: &Collections) -> Option<Self> {
        None
    }

    /// What a create for `incoming` still has to contribute once it turned
    /// out to duplicate `existing`. `None` keeps `existing` as it is.
    fn merge_duplicate(_existing: &Self, _incoming: &Self) -> Option<Self::Patch> {
        None
    }
}

fn require(condition: bool, message: impl FnOnce() -> String) -> SyncResult<()> {
    if condition {
        Ok(())
    } else {
        Err(SyncError::Validation(message()))
    }
}

fn swap(slot: &mut RecordId, from: &RecordId, to: &RecordId) -> bool {
    if slot == from {
        *slot = to.clone();
        true
    } else {
        false
    }
}

impl Record for Patient {
    const KIND: EntityKind = EntityKind::Patient;
    const CACHE_KEY: CacheKey = CacheKey::Patients;

    type Wire = transform::PatientWire;
    type Patch = PatientPatch;

    fn id(&self) -> &RecordId {
        &self.id
    }

    fn set_id(&mut self, id: RecordId) {
        self.id = id;
    }

    fn validate(&self) -> SyncResult<()> {
        require(!self.first_name.trim().is_empty(), || "first name is required".into())?;
        require(!self.last_name.trim().is_empty(), || "last name is required".into())
    }

    fn to_remote(&self) -> Option<Self::Wire> {
        transform::to_patient_wire(self)
    }

    fn from_remote(wire: Self::Wire) -> Self {
        transform::from_patient_wire(wire)
    }

    fn collection(collections: &Collections) -> &Vec<Self> {
        &collections.patients
    }

    fn collection_mut(collections: &mut Collections) -> &mut Vec<Self> {
        &mut collections.patients
    }

    fn current_slot(selection: &mut CurrentSelection) -> &mut Option<RecordId> {
        &mut selection.patient
    }
}

impl Record for Episode {
    const KIND: EntityKind = EntityKind::Episode;
    const CACHE_KEY: CacheKey = CacheKey::Episodes;

    type Wire = transform::EpisodeWire;
    type Patch = EpisodePatch;

    fn id(&self) -> &RecordId {
        &self.id
    }

    fn set_id(&mut self, id: RecordId) {
        self.id = id;
    }

    fn validate(&self) -> SyncResult<()> {
        require(!self.chief_complaint.trim().is_empty(), || {
            "chief complaint is required".into()
        })?;
        require(!self.is_resolved() || self.resolved_at.is_some(), || {
            "a resolved episode needs a resolution time".into()
        })
    }

    fn check_references(&self, collections: &Collections) -> SyncResult<()> {
        require(collections.contains::<Patient>(&self.patient_id), || {
            format!("patient {} is not known locally", self.patient_id)
        })
    }

    fn references(&self) -> Vec<&RecordId> {
        std::iter::once(&self.patient_id)
            .chain(self.related_episode_ids.iter())
            .collect()
    }

    fn rewrite_reference(&mut self, from: &RecordId, to: &RecordId) -> bool {
        let mut changed = swap(&mut self.patient_id, from, to);
        if self.related_episode_ids.remove(from) {
            self.related_episode_ids.insert(to.clone());
            changed = true;
        }
        changed
    }

    fn to_remote(&self) -> Option<Self::Wire> {
        transform::to_episode_wire(self)
    }

    fn from_remote(wire: Self::Wire) -> Self {
        transform::from_episode_wire(wire)
    }

    fn collection(collections: &Collections) -> &Vec<Self> {
        &collections.episodes
    }

    fn collection_mut(collections: &mut Collections) -> &mut Vec<Self> {
        &mut collections.episodes
    }

    fn current_slot(selection: &mut CurrentSelection) -> &mut Option<RecordId> {
        &mut selection.episode
    }

    fn accept_overwrite(current: &Self, incoming: &Self) -> bool {
        match current.status {
            EpisodeStatus::Resolved => {
                incoming.status == EpisodeStatus::Resolved && incoming.resolved_at == current.resolved_at
            }
            _ => true,
        }
    }
}

impl Record for Encounter {
    const KIND: EntityKind = EntityKind::Encounter;
    const CACHE_KEY: CacheKey = CacheKey::Encounters;

    type Wire = transform::EncounterWire;
    type Patch = EncounterPatch;

    fn id(&self) -> &RecordId {
        &self.id
    }

    fn set_id(&mut self, id: RecordId) {
        self.id = id;
    }

    fn validate(&self) -> SyncResult<()> {
        require(!self.is_signed() || (self.signed_at.is_some() && self.signed_by.is_some()), || {
            "a signed encounter needs a signer and a signing time".into()
        })
    }

    fn check_references(&self, collections: &Collections) -> SyncResult<()> {
        let episode = collections.find::<Episode>(&self.episode_id).ok_or_else(|| {
            SyncError::Validation(format!("episode {} is not known locally", self.episode_id))
        })?;
        require(episode.patient_id == self.patient_id, || {
            format!(
                "episode {} belongs to patient {}, not {}",
                self.episode_id, episode.patient_id, self.patient_id
            )
        })
    }

    fn references(&self) -> Vec<&RecordId> {
        vec![&self.episode_id, &self.patient_id]
    }

    fn rewrite_reference(&mut self, from: &RecordId, to: &RecordId) -> bool {
        let episode = swap(&mut self.episode_id, from, to);
        let patient = swap(&mut self.patient_id, from, to);
        episode || patient
    }

    fn to_remote(&self) -> Option<Self::Wire> {
        transform::to_encounter_wire(self)
    }

    fn from_remote(wire: Self::Wire) -> Self {
        transform::from_encounter_wire(wire)
    }

    fn collection(collections: &Collections) -> &Vec<Self> {
        &collections.encounters
    }

    fn collection_mut(collections: &mut Collections) -> &mut Vec<Self> {
        &mut collections.encounters
    }

    fn current_slot(selection: &mut CurrentSelection) -> &mut Option<RecordId> {
        &mut selection.encounter
    }

    fn accept_overwrite(current: &Self, incoming: &Self) -> bool {
        let unsigns = current.is_signed() && !incoming.is_signed();
        let drops_amendments = incoming.amendments.len() < current.amendments.len();
        !unsigns && !drops_amendments
    }

    /// Drafts are unique per (episode, patient, type); signed encounters
    /// never conflict.
    fn duplicate_in(&self, collections: &Collections) -> Option<Self> {
        if self.is_signed() {
            return None;
        }
        collections
            .encounters
            .iter()
            .find(|other| {
                other.id != self.id && other.is_draft_for(&self.episode_id, &self.patient_id, self.encounter_type)
            })
            .cloned()
    }

    fn merge_duplicate(_existing: &Self, incoming: &Self) -> Option<EncounterPatch> {
        (incoming.soap.populated_fields() > 0).then(|| EncounterPatch {
            encounter_type: None,
            soap: Some(incoming.soap.clone()),
        })
    }
}
