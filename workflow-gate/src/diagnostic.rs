//! The diagnostic documentation workflow used by the clinical UI.
//!
//! patient-info → clinical-assessment → physical-exam → diagnostic-analysis →
//! recommended-tests → test-results → final-diagnosis

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::Result;
use crate::gate::WorkflowGate;
use crate::step::{StepDefinition, StepTable};

pub const PATIENT_INFO: &str = "patient-info";
pub const CLINICAL_ASSESSMENT: &str = "clinical-assessment";
pub const PHYSICAL_EXAM: &str = "physical-exam";
pub const DIAGNOSTIC_ANALYSIS: &str = "diagnostic-analysis";
pub const RECOMMENDED_TESTS: &str = "recommended-tests";
pub const TEST_RESULTS: &str = "test-results";
pub const FINAL_DIAGNOSIS: &str = "final-diagnosis";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatientInfo {
    pub name: String,
    pub age: Option<u8>,
    pub gender: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComplaintDetail {
    pub symptom: String,
    pub duration: Option<String>,
    /// 0–10 patient-reported
    pub severity: Option<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhysicalExam {
    pub vital_signs: BTreeMap<String, String>,
    pub findings: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Differential {
    pub condition: String,
    pub rationale: Option<String>,
}

/// Data collected while walking the diagnostic workflow
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DiagnosticRecord {
    pub patient: PatientInfo,
    pub complaint_details: Vec<ComplaintDetail>,
    pub physical_exam: PhysicalExam,
    pub differential_diagnoses: Vec<Differential>,
    pub recommended_tests: Vec<String>,
    /// Test name → result text
    pub test_results: BTreeMap<String, String>,
    pub final_diagnosis: Option<String>,
}

impl DiagnosticRecord {
    fn has_patient_info(&self) -> bool {
        !self.patient.name.trim().is_empty()
    }

    fn patient_info_complete(&self) -> bool {
        self.has_patient_info() && self.patient.age.is_some()
    }

    fn has_complaints(&self) -> bool {
        !self.complaint_details.is_empty()
    }

    fn has_exam(&self) -> bool {
        !self.physical_exam.findings.is_empty() || !self.physical_exam.vital_signs.is_empty()
    }

    fn has_differentials(&self) -> bool {
        !self.differential_diagnoses.is_empty()
    }

    fn has_recommended_tests(&self) -> bool {
        !self.recommended_tests.is_empty()
    }

    fn has_test_results(&self) -> bool {
        !self.test_results.is_empty()
    }

    fn all_results_in(&self) -> bool {
        self.has_recommended_tests()
            && self
                .recommended_tests
                .iter()
                .all(|test| self.test_results.contains_key(test))
    }

    fn has_final_diagnosis(&self) -> bool {
        self.final_diagnosis
            .as_deref()
            .is_some_and(|dx| !dx.trim().is_empty())
    }
}

/// The default seven-step diagnostic table.
pub fn diagnostic_table() -> StepTable<DiagnosticRecord> {
    let steps: Vec<StepDefinition<DiagnosticRecord>> = vec![
        StepDefinition::new(PATIENT_INFO, "Patient information")
            .complete_when(DiagnosticRecord::patient_info_complete)
            .has_data_when(DiagnosticRecord::has_patient_info)
            .clears_with(|r: &mut DiagnosticRecord| r.patient = PatientInfo::default()),
        StepDefinition::new(CLINICAL_ASSESSMENT, "Clinical assessment")
            .complete_when(DiagnosticRecord::has_complaints)
            .has_data_when(DiagnosticRecord::has_complaints)
            .clears_with(|r: &mut DiagnosticRecord| r.complaint_details.clear()),
        StepDefinition::new(PHYSICAL_EXAM, "Physical examination")
            .complete_when(DiagnosticRecord::has_exam)
            .has_data_when(DiagnosticRecord::has_exam)
            .clears_with(|r: &mut DiagnosticRecord| r.physical_exam = PhysicalExam::default()),
        StepDefinition::new(DIAGNOSTIC_ANALYSIS, "Diagnostic analysis")
            .complete_when(DiagnosticRecord::has_differentials)
            .has_data_when(DiagnosticRecord::has_differentials)
            .clears_with(|r: &mut DiagnosticRecord| r.differential_diagnoses.clear()),
        StepDefinition::new(RECOMMENDED_TESTS, "Recommended tests")
            .complete_when(DiagnosticRecord::has_recommended_tests)
            .has_data_when(DiagnosticRecord::has_recommended_tests)
            .clears_with(|r: &mut DiagnosticRecord| r.recommended_tests.clear()),
        StepDefinition::new(TEST_RESULTS, "Test results")
            .complete_when(DiagnosticRecord::all_results_in)
            .has_data_when(DiagnosticRecord::has_test_results)
            .clears_with(|r: &mut DiagnosticRecord| r.test_results.clear()),
        StepDefinition::new(FINAL_DIAGNOSIS, "Final diagnosis")
            .complete_when(DiagnosticRecord::has_final_diagnosis)
            .has_data_when(DiagnosticRecord::has_final_diagnosis)
            .clears_with(|r: &mut DiagnosticRecord| r.final_diagnosis = None),
    ];

    StepTable::from_trusted(steps)
}

/// Gate over [`diagnostic_table`], starting at patient-info.
pub fn diagnostic_gate() -> WorkflowGate<DiagnosticRecord> {
    WorkflowGate::new(diagnostic_table())
}

/// Rebuild a diagnostic gate from saved progress.
///
/// # Errors
///
/// Fails if the saved state names steps outside the diagnostic table.
pub fn restore_diagnostic_gate(state: &crate::gate::GateState) -> Result<WorkflowGate<DiagnosticRecord>> {
    WorkflowGate::restore(diagnostic_table(), state)
}
