//! Remote wire shapes and the mapping to and from the local shapes
//!
//! The server speaks snake_case with the SOAP note flattened into
//! `<section>_<field>` columns. Every local field survives a round trip for
//! records whose ids are confirmed. Server-only columns are listed in the
//! `*_DROPPED_FIELDS` constants and discarded on the way in.
//!
//! `to_*_wire` returns `None` while any referenced record is still local-only:
//! the server has no way to resolve a pending id, so the request is not sent.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use uuid::Uuid;

use crate::error::{SyncError, SyncResult};
use crate::ids::RecordId;
use crate::model::{
    Amendment, Assessment, ContactInfo, Encounter, EncounterStatus, EncounterType, Episode, EpisodeCategory,
    EpisodeStatus, Gender, MedicalBackground, Objective, Patient, Plan, SoapNote, SoapSection, Subjective,
    VitalSigns,
};
use crate::record::Record;
use crate::remote::RemoteError;

/// Columns the server adds to every record
pub const BOOKKEEPING_FIELDS: [&str; 4] = ["organization_id", "created_by", "updated_by", "row_version"];

pub const PATIENT_DROPPED_FIELDS: &[&str] = &BOOKKEEPING_FIELDS;
pub const EPISODE_DROPPED_FIELDS: &[&str] = &BOOKKEEPING_FIELDS;
/// `completion_percentage` is recomputed from content on every read
pub const ENCOUNTER_DROPPED_FIELDS: &[&str] = &[
    "organization_id",
    "created_by",
    "updated_by",
    "row_version",
    "completion_percentage",
];

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerBookkeeping {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub organization_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub row_version: Option<i64>,
}

fn confirmed(id: &RecordId) -> Option<String> {
    id.as_confirmed().map(str::to_string)
}

/// Own id: empty on create, so the server assigns one
fn own_id(id: &RecordId) -> String {
    id.as_confirmed().map(str::to_string).unwrap_or_default()
}

// ============================================================================
// Patient
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatientWire {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    pub first_name: String,
    pub last_name: String,
    #[serde(default)]
    pub date_of_birth: Option<NaiveDate>,
    #[serde(default)]
    pub gender: Gender,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub allergies: Vec<String>,
    #[serde(default)]
    pub medications: Vec<String>,
    #[serde(default)]
    pub chronic_conditions: Vec<String>,
    #[serde(default)]
    pub past_medical_history: Option<String>,
    #[serde(default)]
    pub family_history: Option<String>,
    #[serde(default)]
    pub social_history: Option<String>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
    #[serde(flatten)]
    pub bookkeeping: ServerBookkeeping,
}

pub fn to_patient_wire(patient: &Patient) -> Option<PatientWire> {
    let contact = patient.contact.clone();
    let background = patient.background.clone();
    Some(PatientWire {
        id: own_id(&patient.id),
        first_name: patient.first_name.clone(),
        last_name: patient.last_name.clone(),
        date_of_birth: patient.date_of_birth,
        gender: patient.gender,
        phone: contact.phone,
        email: contact.email,
        address: contact.address,
        allergies: background.allergies,
        medications: background.medications,
        chronic_conditions: background.chronic_conditions,
        past_medical_history: background.past_medical_history,
        family_history: background.family_history,
        social_history: background.social_history,
        created_at: patient.created_at,
        updated_at: patient.updated_at,
        bookkeeping: ServerBookkeeping::default(),
    })
}

pub fn from_patient_wire(wire: PatientWire) -> Patient {
    let PatientWire {
        id,
        first_name,
        last_name,
        date_of_birth,
        gender,
        phone,
        email,
        address,
        allergies,
        medications,
        chronic_conditions,
        past_medical_history,
        family_history,
        social_history,
        created_at,
        updated_at,
        bookkeeping: _,
    } = wire;

    Patient {
        id: RecordId::Confirmed(id),
        first_name,
        last_name,
        date_of_birth,
        gender,
        contact: ContactInfo { phone, email, address },
        background: MedicalBackground {
            allergies,
            medications,
            chronic_conditions,
            past_medical_history,
            family_history,
            social_history,
        },
        created_at,
        updated_at,
    }
}

// ============================================================================
// Episode
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpisodeWire {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    pub patient_id: String,
    pub chief_complaint: String,
    pub category: EpisodeCategory,
    pub status: EpisodeStatus,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub related_episode_ids: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(flatten)]
    pub bookkeeping: ServerBookkeeping,
}

pub fn to_episode_wire(episode: &Episode) -> Option<EpisodeWire> {
    let related_episode_ids = episode
        .related_episode_ids
        .iter()
        .map(confirmed)
        .collect::<Option<Vec<_>>>()?;

    Some(EpisodeWire {
        id: own_id(&episode.id),
        patient_id: confirmed(&episode.patient_id)?,
        chief_complaint: episode.chief_complaint.clone(),
        category: episode.category,
        status: episode.status,
        created_at: episode.created_at,
        updated_at: episode.updated_at,
        resolved_at: episode.resolved_at,
        related_episode_ids,
        tags: episode.tags.clone(),
        bookkeeping: ServerBookkeeping::default(),
    })
}

pub fn from_episode_wire(wire: EpisodeWire) -> Episode {
    let EpisodeWire {
        id,
        patient_id,
        chief_complaint,
        category,
        status,
        created_at,
        updated_at,
        resolved_at,
        related_episode_ids,
        tags,
        bookkeeping: _,
    } = wire;

    Episode {
        id: RecordId::Confirmed(id),
        patient_id: RecordId::Confirmed(patient_id),
        chief_complaint,
        category,
        status,
        created_at,
        updated_at,
        resolved_at,
        related_episode_ids: related_episode_ids
            .into_iter()
            .map(RecordId::Confirmed)
            .collect::<BTreeSet<_>>(),
        tags,
    }
}

// ============================================================================
// Encounter
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AmendmentWire {
    pub id: Uuid,
    pub section: SoapSection,
    pub text: String,
    pub author: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncounterWire {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    pub episode_id: String,
    pub patient_id: String,
    pub encounter_type: EncounterType,
    pub status: EncounterStatus,

    #[serde(default)]
    pub subjective_chief_complaint: String,
    #[serde(default)]
    pub subjective_history_of_present_illness: String,
    #[serde(default)]
    pub subjective_review_of_systems: String,
    #[serde(default)]
    pub subjective_updated_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub objective_blood_pressure: Option<String>,
    #[serde(default)]
    pub objective_heart_rate: Option<String>,
    #[serde(default)]
    pub objective_temperature: Option<String>,
    #[serde(default)]
    pub objective_respiratory_rate: Option<String>,
    #[serde(default)]
    pub objective_oxygen_saturation: Option<String>,
    #[serde(default)]
    pub objective_physical_exam: String,
    #[serde(default)]
    pub objective_updated_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub assessment_clinical_impression: String,
    #[serde(default)]
    pub assessment_differential_diagnoses: Vec<String>,
    #[serde(default)]
    pub assessment_working_diagnosis: String,
    #[serde(default)]
    pub assessment_updated_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub plan_treatment: String,
    #[serde(default)]
    pub plan_tests_ordered: Vec<String>,
    #[serde(default)]
    pub plan_follow_up: String,
    #[serde(default)]
    pub plan_patient_education: String,
    #[serde(default)]
    pub plan_updated_at: Option<DateTime<Utc>>,

    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub signed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub signed_by: Option<String>,
    #[serde(default)]
    pub amendments: Vec<AmendmentWire>,

    /// Informational for the server's list views; never read back
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_percentage: Option<u8>,
    #[serde(flatten)]
    pub bookkeeping: ServerBookkeeping,
}

pub fn to_encounter_wire(encounter: &Encounter) -> Option<EncounterWire> {
    let SoapNote {
        subjective,
        objective,
        assessment,
        plan,
    } = encounter.soap.clone();
    let vitals = objective.vital_signs;

    Some(EncounterWire {
        id: own_id(&encounter.id),
        episode_id: confirmed(&encounter.episode_id)?,
        patient_id: confirmed(&encounter.patient_id)?,
        encounter_type: encounter.encounter_type,
        status: encounter.status,
        subjective_chief_complaint: subjective.chief_complaint,
        subjective_history_of_present_illness: subjective.history_of_present_illness,
        subjective_review_of_systems: subjective.review_of_systems,
        subjective_updated_at: subjective.updated_at,
        objective_blood_pressure: vitals.blood_pressure,
        objective_heart_rate: vitals.heart_rate,
        objective_temperature: vitals.temperature,
        objective_respiratory_rate: vitals.respiratory_rate,
        objective_oxygen_saturation: vitals.oxygen_saturation,
        objective_physical_exam: objective.physical_exam,
        objective_updated_at: objective.updated_at,
        assessment_clinical_impression: assessment.clinical_impression,
        assessment_differential_diagnoses: assessment.differential_diagnoses,
        assessment_working_diagnosis: assessment.working_diagnosis,
        assessment_updated_at: assessment.updated_at,
        plan_treatment: plan.treatment,
        plan_tests_ordered: plan.tests_ordered,
        plan_follow_up: plan.follow_up,
        plan_patient_education: plan.patient_education,
        plan_updated_at: plan.updated_at,
        created_at: encounter.created_at,
        updated_at: encounter.updated_at,
        signed_at: encounter.signed_at,
        signed_by: encounter.signed_by.clone(),
        amendments: encounter
            .amendments
            .iter()
            .map(|amendment| AmendmentWire {
                id: amendment.id,
                section: amendment.section,
                text: amendment.text.clone(),
                author: amendment.author.clone(),
                created_at: amendment.created_at,
            })
            .collect(),
        completion_percentage: Some(encounter.completion_percentage()),
        bookkeeping: ServerBookkeeping::default(),
    })
}

pub fn from_encounter_wire(wire: EncounterWire) -> Encounter {
    let EncounterWire {
        id,
        episode_id,
        patient_id,
        encounter_type,
        status,
        subjective_chief_complaint,
        subjective_history_of_present_illness,
        subjective_review_of_systems,
        subjective_updated_at,
        objective_blood_pressure,
        objective_heart_rate,
        objective_temperature,
        objective_respiratory_rate,
        objective_oxygen_saturation,
        objective_physical_exam,
        objective_updated_at,
        assessment_clinical_impression,
        assessment_differential_diagnoses,
        assessment_working_diagnosis,
        assessment_updated_at,
        plan_treatment,
        plan_tests_ordered,
        plan_follow_up,
        plan_patient_education,
        plan_updated_at,
        created_at,
        updated_at,
        signed_at,
        signed_by,
        amendments,
        completion_percentage: _,
        bookkeeping: _,
    } = wire;

    Encounter {
        id: RecordId::Confirmed(id),
        episode_id: RecordId::Confirmed(episode_id),
        patient_id: RecordId::Confirmed(patient_id),
        encounter_type,
        status,
        soap: SoapNote {
            subjective: Subjective {
                chief_complaint: subjective_chief_complaint,
                history_of_present_illness: subjective_history_of_present_illness,
                review_of_systems: subjective_review_of_systems,
                updated_at: subjective_updated_at,
            },
            objective: Objective {
                vital_signs: VitalSigns {
                    blood_pressure: objective_blood_pressure,
                    heart_rate: objective_heart_rate,
                    temperature: objective_temperature,
                    respiratory_rate: objective_respiratory_rate,
                    oxygen_saturation: objective_oxygen_saturation,
                },
                physical_exam: objective_physical_exam,
                updated_at: objective_updated_at,
            },
            assessment: Assessment {
                clinical_impression: assessment_clinical_impression,
                differential_diagnoses: assessment_differential_diagnoses,
                working_diagnosis: assessment_working_diagnosis,
                updated_at: assessment_updated_at,
            },
            plan: Plan {
                treatment: plan_treatment,
                tests_ordered: plan_tests_ordered,
                follow_up: plan_follow_up,
                patient_education: plan_patient_education,
                updated_at: plan_updated_at,
            },
        },
        created_at,
        updated_at,
        signed_at,
        signed_by,
        amendments: amendments
            .into_iter()
            .map(|amendment| Amendment {
                id: amendment.id,
                section: amendment.section,
                text: amendment.text,
                author: amendment.author,
                created_at: amendment.created_at,
            })
            .collect(),
    }
}

/// Body for `PATCH /encounters/{id}/soap`: the `<section>_*` columns plus a
/// `section` discriminator.
///
/// # Errors
///
/// Fails only if the wire shape does not serialize to a JSON object.
pub fn soap_section_patch(wire: &EncounterWire, section: SoapSection) -> SyncResult<Value> {
    let Value::Object(columns) = serde_json::to_value(wire)? else {
        return Err(SyncError::Serialization("encounter wire shape is not an object".into()));
    };

    let prefix = format!("{}_", section.as_str());
    let mut body: Map<String, Value> = columns
        .into_iter()
        .filter(|(column, _)| column.starts_with(&prefix))
        .collect();
    body.insert("section".into(), Value::from(section.as_str()));
    Ok(Value::Object(body))
}

// ============================================================================
// Generic helpers used by the controller
// ============================================================================

/// Wire JSON for `record`, or `None` while it references a local-only record.
///
/// # Errors
///
/// Serialization failures only.
pub fn encode<T: Record>(record: &T) -> SyncResult<Option<Value>> {
    record
        .to_remote()
        .map(|wire| serde_json::to_value(&wire))
        .transpose()
        .map_err(Into::into)
}

/// Decode one server record. A record without an id is rejected.
///
/// # Errors
///
/// [`RemoteError::Decode`] when the body does not match the wire shape.
pub fn decode<T: Record>(body: Value) -> Result<T, RemoteError> {
    let wire: T::Wire = serde_json::from_value(body).map_err(|e| RemoteError::Decode(e.to_string()))?;
    let record = T::from_remote(wire);
    match record.id().as_confirmed() {
        Some(id) if !id.is_empty() => Ok(record),
        _ => Err(RemoteError::Decode(format!("{} response carries no id", T::KIND))),
    }
}

/// # Errors
///
/// [`RemoteError::Decode`] when the body is not an array of records.
pub fn decode_list<T: Record>(body: Value) -> Result<Vec<T>, RemoteError> {
    match body {
        Value::Array(items) => items.into_iter().map(decode::<T>).collect(),
        other => Err(RemoteError::Decode(format!(
            "expected a {} list, got {}",
            T::KIND,
            json_type(&other)
        ))),
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::EncounterType;
    use serde_json::json;

    fn signed_encounter() -> Encounter {
        let mut encounter = Encounter::draft(
            RecordId::confirmed("epi-2"),
            RecordId::confirmed("pat-1"),
            EncounterType::FollowUp,
        );
        encounter.id = RecordId::confirmed("enc-3");
        encounter.soap.subjective.chief_complaint = "dizziness".into();
        encounter.soap.objective.vital_signs.blood_pressure = Some("150/95".into());
        encounter.soap.plan.tests_ordered = vec!["ECG".into()];
        encounter.status = EncounterStatus::Signed;
        encounter.signed_by = Some("dr.kim".into());
        encounter.signed_at = Some(Utc::now());
        encounter
            .amendments
            .push(Amendment::new(SoapSection::Plan, "add Holter", "dr.kim"));
        encounter
    }

    #[test]
    fn test_encounter_is_flattened_on_the_wire() {
        let wire = to_encounter_wire(&signed_encounter()).unwrap();
        let json = serde_json::to_value(&wire).unwrap();
        assert_eq!(json["subjective_chief_complaint"], "dizziness");
        assert_eq!(json["objective_blood_pressure"], "150/95");
        assert_eq!(json["encounter_type"], "follow-up");
        assert_eq!(json["completion_percentage"], 25);
        assert!(json.get("soap").is_none());
        assert!(json.get("organization_id").is_none());
    }

    #[test]
    fn test_dropped_fields_are_discarded() {
        let encounter = signed_encounter();
        let mut json = serde_json::to_value(to_encounter_wire(&encounter).unwrap()).unwrap();
        for field in ENCOUNTER_DROPPED_FIELDS {
            json[*field] = json!(7);
        }
        json["organization_id"] = json!("org-1");
        json["created_by"] = json!("u-1");
        json["updated_by"] = json!("u-2");

        let back: Encounter = decode(json).unwrap();
        assert_eq!(back, encounter);
    }

    #[test]
    fn test_pending_reference_blocks_the_wire_shape() {
        let episode = Episode::open(
            RecordId::pending(crate::ids::EntityKind::Patient),
            "fatigue",
            EpisodeCategory::Chronic,
        );
        assert!(to_episode_wire(&episode).is_none());
    }

    #[test]
    fn test_pending_own_id_is_omitted() {
        let patient = Patient::intake("Mary", "Seacole");
        let json = serde_json::to_value(to_patient_wire(&patient).unwrap()).unwrap();
        assert!(json.get("id").is_none());
        assert_eq!(json["first_name"], "Mary");
    }

    #[test]
    fn test_soap_section_patch_only_carries_that_section() {
        let wire = to_encounter_wire(&signed_encounter()).unwrap();
        let body = soap_section_patch(&wire, SoapSection::Objective).unwrap();
        let keys: Vec<&String> = body.as_object().unwrap().keys().collect();
        assert!(keys.iter().all(|k| k.starts_with("objective_") || k.as_str() == "section"));
        assert_eq!(body["section"], "objective");
        assert_eq!(body["objective_blood_pressure"], "150/95");
        assert_eq!(keys.len(), 8);
    }

    #[test]
    fn test_decode_rejects_missing_id() {
        let patient = Patient::intake("Mary", "Seacole");
        let body = serde_json::to_value(to_patient_wire(&patient).unwrap()).unwrap();
        assert!(matches!(decode::<Patient>(body), Err(RemoteError::Decode(_))));
        assert!(matches!(decode_list::<Patient>(json!({})), Err(RemoteError::Decode(_))));
    }
}
