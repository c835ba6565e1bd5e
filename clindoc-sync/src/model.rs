//! Local canonical shapes of patients, episodes and encounters
//!
//! These are what the local cache persists (camelCase JSON). The remote wire
//! shapes live in [`crate::transform`].

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use uuid::Uuid;

use crate::error::{SyncError, SyncResult};
use crate::ids::{EntityKind, RecordId};
use crate::record::RecordPatch;

// ============================================================================
// Patient
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Gender {
    Male,
    Female,
    Other,
    #[default]
    Unknown,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ContactInfo {
    pub phone: Option<String>,
    pub email: Option<String>,
    pub address: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MedicalBackground {
    pub allergies: Vec<String>,
    pub medications: Vec<String>,
    pub chronic_conditions: Vec<String>,
    pub past_medical_history: Option<String>,
    pub family_history: Option<String>,
    pub social_history: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Patient {
    pub id: RecordId,
    pub first_name: String,
    pub last_name: String,
    pub date_of_birth: Option<NaiveDate>,
    #[serde(default)]
    pub gender: Gender,
    #[serde(default)]
    pub contact: ContactInfo,
    #[serde(default)]
    pub background: MedicalBackground,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Patient {
    /// A new patient as captured at intake, not yet known to any store
    pub fn intake(first_name: impl Into<String>, last_name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: RecordId::pending(EntityKind::Patient),
            first_name: first_name.into(),
            last_name: last_name.into(),
            date_of_birth: None,
            gender: Gender::Unknown,
            contact: ContactInfo::default(),
            background: MedicalBackground::default(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }
}

/// Demographic and background changes; `None` leaves a field as it is
#[derive(Debug, Clone, Default)]
pub struct PatientPatch {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub date_of_birth: Option<NaiveDate>,
    pub gender: Option<Gender>,
    pub contact: Option<ContactInfo>,
    pub background: Option<MedicalBackground>,
}

impl RecordPatch for PatientPatch {
    type Target = Patient;

    fn apply(self, patient: &mut Patient) -> SyncResult<()> {
        if let Some(first_name) = self.first_name {
            patient.first_name = first_name;
        }
        if let Some(last_name) = self.last_name {
            patient.last_name = last_name;
        }
        if let Some(date_of_birth) = self.date_of_birth {
            patient.date_of_birth = Some(date_of_birth);
        }
        if let Some(gender) = self.gender {
            patient.gender = gender;
        }
        if let Some(contact) = self.contact {
            patient.contact = contact;
        }
        if let Some(background) = self.background {
            patient.background = background;
        }
        patient.updated_at = Utc::now();
        Ok(())
    }
}

// ============================================================================
// Episode
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EpisodeCategory {
    Acute,
    Chronic,
    Preventive,
    FollowUp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EpisodeStatus {
    Active,
    Resolved,
    ChronicManagement,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Episode {
    pub id: RecordId,
    pub patient_id: RecordId,
    pub chief_complaint: String,
    pub category: EpisodeCategory,
    pub status: EpisodeStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    /// Symmetric, non-owning links to other episodes of the same patient
    #[serde(default)]
    pub related_episode_ids: BTreeSet<RecordId>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl Episode {
    pub fn open(
        patient_id: RecordId,
        chief_complaint: impl Into<String>,
        category: EpisodeCategory,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: RecordId::pending(EntityKind::Episode),
            patient_id,
            chief_complaint: chief_complaint.into(),
            category,
            status: EpisodeStatus::Active,
            created_at: now,
            updated_at: now,
            resolved_at: None,
            related_episode_ids: BTreeSet::new(),
            tags: Vec::new(),
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.status == EpisodeStatus::Resolved
    }
}

/// Ordinary episode edits. Resolution goes through the controller's
/// `resolve_episode`/`reopen_episode`, never through a patch.
#[derive(Debug, Clone, Default)]
pub struct EpisodePatch {
    pub chief_complaint: Option<String>,
    pub category: Option<EpisodeCategory>,
    pub status: Option<EpisodeStatus>,
    pub tags: Option<Vec<String>>,
}

impl RecordPatch for EpisodePatch {
    type Target = Episode;

    fn apply(self, episode: &mut Episode) -> SyncResult<()> {
        if let Some(status) = self.status {
            let crosses_resolution = status != episode.status
                && (status == EpisodeStatus::Resolved || episode.status == EpisodeStatus::Resolved);
            if crosses_resolution {
                return Err(SyncError::InvalidTransition(format!(
                    "episode {} cannot move from {:?} to {:?} through an edit",
                    episode.id, episode.status, status
                )));
            }
            episode.status = status;
        }
        if let Some(chief_complaint) = self.chief_complaint {
            episode.chief_complaint = chief_complaint;
        }
        if let Some(category) = self.category {
            episode.category = category;
        }
        if let Some(tags) = self.tags {
            episode.tags = tags;
        }
        episode.updated_at = Utc::now();
        Ok(())
    }
}

// ============================================================================
// Encounter
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EncounterType {
    Initial,
    FollowUp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EncounterStatus {
    Draft,
    Signed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SoapSection {
    Subjective,
    Objective,
    Assessment,
    Plan,
}

impl SoapSection {
    pub fn as_str(&self) -> &'static str {
        match self {
            SoapSection::Subjective => "subjective",
            SoapSection::Objective => "objective",
            SoapSection::Assessment => "assessment",
            SoapSection::Plan => "plan",
        }
    }
}

impl fmt::Display for SoapSection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Subjective {
    pub chief_complaint: String,
    pub history_of_present_illness: String,
    pub review_of_systems: String,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VitalSigns {
    pub blood_pressure: Option<String>,
    pub heart_rate: Option<String>,
    pub temperature: Option<String>,
    pub respiratory_rate: Option<String>,
    pub oxygen_saturation: Option<String>,
}

impl VitalSigns {
    pub fn is_empty(&self) -> bool {
        [
            &self.blood_pressure,
            &self.heart_rate,
            &self.temperature,
            &self.respiratory_rate,
            &self.oxygen_saturation,
        ]
        .iter()
        .all(|value| value.as_deref().map_or(true, |v| v.trim().is_empty()))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Objective {
    pub vital_signs: VitalSigns,
    pub physical_exam: String,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Assessment {
    pub clinical_impression: String,
    pub differential_diagnoses: Vec<String>,
    pub working_diagnosis: String,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Plan {
    pub treatment: String,
    pub tests_ordered: Vec<String>,
    pub follow_up: String,
    pub patient_education: String,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SoapNote {
    pub subjective: Subjective,
    pub objective: Objective,
    pub assessment: Assessment,
    pub plan: Plan,
}

/// Number of SOAP fields that count towards completion
pub const TRACKED_SOAP_FIELDS: usize = 12;

fn filled(text: &str) -> bool {
    !text.trim().is_empty()
}

impl SoapNote {
    pub fn populated_fields(&self) -> usize {
        let s = &self.subjective;
        let o = &self.objective;
        let a = &self.assessment;
        let p = &self.plan;
        [
            filled(&s.chief_complaint),
            filled(&s.history_of_present_illness),
            filled(&s.review_of_systems),
            !o.vital_signs.is_empty(),
            filled(&o.physical_exam),
            filled(&a.clinical_impression),
            !a.differential_diagnoses.is_empty(),
            filled(&a.working_diagnosis),
            filled(&p.treatment),
            !p.tests_ordered.is_empty(),
            filled(&p.follow_up),
            filled(&p.patient_education),
        ]
        .into_iter()
        .filter(|populated| *populated)
        .count()
    }

    /// Stamp `updatedAt` on every section that differs from `before`.
    pub fn stamp_changed(&mut self, before: &SoapNote, now: DateTime<Utc>) {
        if self.subjective != before.subjective {
            self.subjective.updated_at = Some(now);
        }
        if self.objective != before.objective {
            self.objective.updated_at = Some(now);
        }
        if self.assessment != before.assessment {
            self.assessment.updated_at = Some(now);
        }
        if self.plan != before.plan {
            self.plan.updated_at = Some(now);
        }
    }
}

/// Replacement content for one SOAP section
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SectionUpdate {
    Subjective(Subjective),
    Objective(Objective),
    Assessment(Assessment),
    Plan(Plan),
}

impl SectionUpdate {
    pub fn section(&self) -> SoapSection {
        match self {
            SectionUpdate::Subjective(_) => SoapSection::Subjective,
            SectionUpdate::Objective(_) => SoapSection::Objective,
            SectionUpdate::Assessment(_) => SoapSection::Assessment,
            SectionUpdate::Plan(_) => SoapSection::Plan,
        }
    }

    pub fn apply_to(self, soap: &mut SoapNote, now: DateTime<Utc>) {
        match self {
            SectionUpdate::Subjective(mut subjective) => {
                subjective.updated_at = Some(now);
                soap.subjective = subjective;
            }
            SectionUpdate::Objective(mut objective) => {
                objective.updated_at = Some(now);
                soap.objective = objective;
            }
            SectionUpdate::Assessment(mut assessment) => {
                assessment.updated_at = Some(now);
                soap.assessment = assessment;
            }
            SectionUpdate::Plan(mut plan) => {
                plan.updated_at = Some(now);
                soap.plan = plan;
            }
        }
    }
}

/// Post-signature correction; amendments are only ever appended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Amendment {
    pub id: Uuid,
    pub section: SoapSection,
    pub text: String,
    pub author: String,
    pub created_at: DateTime<Utc>,
}

impl Amendment {
    pub fn new(section: SoapSection, text: impl Into<String>, author: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            section,
            text: text.into(),
            author: author.into(),
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Encounter {
    pub id: RecordId,
    pub episode_id: RecordId,
    /// Denormalized from the owning episode
    pub patient_id: RecordId,
    #[serde(rename = "type")]
    pub encounter_type: EncounterType,
    pub status: EncounterStatus,
    #[serde(default)]
    pub soap: SoapNote,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub signed_at: Option<DateTime<Utc>>,
    pub signed_by: Option<String>,
    #[serde(default)]
    pub amendments: Vec<Amendment>,
}

impl Encounter {
    pub fn draft(episode_id: RecordId, patient_id: RecordId, encounter_type: EncounterType) -> Self {
        let now = Utc::now();
        Self {
            id: RecordId::pending(EntityKind::Encounter),
            episode_id,
            patient_id,
            encounter_type,
            status: EncounterStatus::Draft,
            soap: SoapNote::default(),
            created_at: now,
            updated_at: now,
            signed_at: None,
            signed_by: None,
            amendments: Vec::new(),
        }
    }

    pub fn is_signed(&self) -> bool {
        self.status == EncounterStatus::Signed
    }

    /// Share of the tracked SOAP fields that hold content, rounded down
    pub fn completion_percentage(&self) -> u8 {
        let percent = self.soap.populated_fields() * 100 / TRACKED_SOAP_FIELDS;
        u8::try_from(percent).unwrap_or(100)
    }

    /// Same draft slot: one unsigned encounter per (episode, patient, type)
    pub fn is_draft_for(&self, episode_id: &RecordId, patient_id: &RecordId, encounter_type: EncounterType) -> bool {
        !self.is_signed()
            && &self.episode_id == episode_id
            && &self.patient_id == patient_id
            && self.encounter_type == encounter_type
    }
}

/// Whole-draft save. Rejected on a signed encounter if it would change
/// anything; amendments are the only way to correct signed content.
#[derive(Debug, Clone, Default)]
pub struct EncounterPatch {
    pub encounter_type: Option<EncounterType>,
    pub soap: Option<SoapNote>,
}

impl EncounterPatch {
    pub fn from_draft(draft: &Encounter) -> Self {
        Self {
            encounter_type: Some(draft.encounter_type),
            soap: Some(draft.soap.clone()),
        }
    }
}

impl RecordPatch for EncounterPatch {
    type Target = Encounter;

    fn apply(self, encounter: &mut Encounter) -> SyncResult<()> {
        let changes_type = self
            .encounter_type
            .is_some_and(|encounter_type| encounter_type != encounter.encounter_type);
        let changes_soap = self.soap.as_ref().is_some_and(|soap| soap != &encounter.soap);

        if !changes_type && !changes_soap {
            return Ok(());
        }
        if encounter.is_signed() {
            return Err(SyncError::InvalidTransition(format!(
                "encounter {} is signed; corrections must be amendments",
                encounter.id
            )));
        }

        if let Some(encounter_type) = self.encounter_type {
            encounter.encounter_type = encounter_type;
        }
        if let Some(soap) = self.soap {
            encounter.soap = soap;
        }
        encounter.updated_at = Utc::now();
        Ok(())
    }
}
