//! Diagnostic workflow scenarios
//!
//! Walks the seven-step diagnostic table the way a clinician would: forward
//! through the steps, back to an earlier step to correct it, and forward again.

use workflow_gate::diagnostic::*;
use workflow_gate::*;

fn complete_record() -> DiagnosticRecord {
    let mut record = DiagnosticRecord::default();
    record.patient = PatientInfo {
        name: "Grace Hopper".into(),
        age: Some(52),
        gender: Some("female".into()),
    };
    record.complaint_details.push(ComplaintDetail {
        symptom: "productive cough".into(),
        duration: Some("5 days".into()),
        severity: Some(4),
    });
    record
        .physical_exam
        .vital_signs
        .insert("temperature".into(), "38.4 C".into());
    record.physical_exam.findings.push("crackles right base".into());
    record.differential_diagnoses.push(Differential {
        condition: "community acquired pneumonia".into(),
        rationale: None,
    });
    record.recommended_tests = vec!["chest x-ray".into(), "CBC".into()];
    record.test_results.insert("chest x-ray".into(), "RLL consolidation".into());
    record.test_results.insert("CBC".into(), "WBC 14.2".into());
    record.final_diagnosis = Some("Right lower lobe pneumonia".into());
    record
}

fn walk_to_end(gate: &mut WorkflowGate<DiagnosticRecord>, record: &DiagnosticRecord) {
    while !gate.is_terminal() {
        gate.advance(record).unwrap();
    }
}

#[test]
fn test_fresh_gate_only_opens_patient_info() {
    let gate = diagnostic_gate();
    let record = DiagnosticRecord::default();
    assert_eq!(gate.current_step().as_str(), PATIENT_INFO);
    assert_eq!(gate.accessible_steps(&record), vec![StepId::from(PATIENT_INFO)]);
}

#[test]
fn test_physical_exam_opens_once_a_complaint_is_recorded() {
    let mut gate = diagnostic_gate();
    let mut record = DiagnosticRecord::default();
    record.patient.name = "Grace Hopper".into();
    record.patient.age = Some(52);

    gate.navigate_to_step(CLINICAL_ASSESSMENT, &record).unwrap();
    let err = gate.navigate_to_step(PHYSICAL_EXAM, &record).unwrap_err();
    assert_eq!(
        err,
        WorkflowError::StepNotAccessible {
            step: PHYSICAL_EXAM.into(),
            current: CLINICAL_ASSESSMENT.into(),
        }
    );

    record.complaint_details.push(ComplaintDetail {
        symptom: "headache".into(),
        ..Default::default()
    });
    let nav = gate.navigate_to_step(PHYSICAL_EXAM, &record).unwrap();
    assert_eq!(nav.from.as_str(), CLINICAL_ASSESSMENT);
    assert_eq!(nav.highest_step_reached.as_str(), PHYSICAL_EXAM);
}

#[test]
fn test_patient_info_needs_an_age() {
    let gate = diagnostic_gate();
    let mut record = DiagnosticRecord::default();
    record.patient.name = "Grace Hopper".into();
    assert!(!gate.is_step_accessible(CLINICAL_ASSESSMENT, &record));
}

#[test]
fn test_going_back_keeps_later_steps_reachable() {
    let mut gate = diagnostic_gate();
    let record = complete_record();
    walk_to_end(&mut gate, &record);

    gate.navigate_to_step(PATIENT_INFO, &record).unwrap();
    assert_eq!(gate.highest_step_reached().as_str(), FINAL_DIAGNOSIS);

    // Even with everything downstream emptied, reached steps stay open
    let empty = DiagnosticRecord::default();
    assert!(gate.is_step_accessible(FINAL_DIAGNOSIS, &empty));
    assert_eq!(gate.accessible_steps(&empty).len(), 7);
}

#[test]
fn test_editing_an_earlier_step_flags_populated_downstream_steps() {
    let mut gate = diagnostic_gate();
    let mut record = complete_record();
    record.final_diagnosis = None;
    walk_to_end(&mut gate, &record);

    gate.navigate_to_step(CLINICAL_ASSESSMENT, &record).unwrap();
    record.complaint_details[0].severity = Some(8);
    let flagged = gate.record_edit(CLINICAL_ASSESSMENT, &record).unwrap();

    let flagged: Vec<&str> = flagged.iter().map(StepId::as_str).collect();
    assert_eq!(
        flagged,
        vec![PHYSICAL_EXAM, DIAGNOSTIC_ANALYSIS, RECOMMENDED_TESTS, TEST_RESULTS]
    );

    // Data is untouched until the caller opts in
    assert_eq!(record.recommended_tests.len(), 2);

    let nav = gate.navigate_to_step(DIAGNOSTIC_ANALYSIS, &record).unwrap();
    assert_eq!(nav.possibly_stale.len(), 4);

    gate.acknowledge_regenerated(PHYSICAL_EXAM).unwrap();
    assert!(!gate.stale_steps().contains(&StepId::from(PHYSICAL_EXAM)));
}

#[test]
fn test_discard_downstream_clears_data_but_not_reach() {
    let mut gate = diagnostic_gate();
    let mut record = complete_record();
    walk_to_end(&mut gate, &record);
    gate.navigate_to_step(PHYSICAL_EXAM, &record).unwrap();
    gate.record_edit(PHYSICAL_EXAM, &record).unwrap();

    let cleared = gate.discard_downstream(PHYSICAL_EXAM, &mut record).unwrap();
    assert_eq!(cleared.len(), 4);
    assert!(record.differential_diagnoses.is_empty());
    assert!(record.recommended_tests.is_empty());
    assert!(record.test_results.is_empty());
    assert!(record.final_diagnosis.is_none());
    assert!(!record.physical_exam.findings.is_empty());

    assert!(gate.stale_steps().is_empty());
    assert_eq!(gate.highest_step_reached().as_str(), FINAL_DIAGNOSIS);
}

#[test]
fn test_test_results_gate_final_diagnosis() {
    let mut gate = diagnostic_gate();
    let mut record = complete_record();
    record.test_results.remove("CBC");

    for _ in 0..5 {
        gate.advance(&record).unwrap();
    }
    assert_eq!(gate.current_step().as_str(), TEST_RESULTS);
    assert!(gate.advance(&record).is_err());

    record.test_results.insert("CBC".into(), "WBC 9.1".into());
    gate.advance(&record).unwrap();
    assert!(gate.is_terminal());
}

#[test]
fn test_gate_state_survives_a_cache_round_trip() {
    let mut gate = diagnostic_gate();
    let record = complete_record();
    gate.advance(&record).unwrap();
    gate.advance(&record).unwrap();
    gate.navigate_to_step(PATIENT_INFO, &record).unwrap();
    gate.record_edit(PATIENT_INFO, &record).unwrap();

    let json = serde_json::to_string(&gate.snapshot()).unwrap();
    assert!(json.contains("\"highestStepReached\":\"physical-exam\""));

    let state: GateState = serde_json::from_str(&json).unwrap();
    let restored = restore_diagnostic_gate(&state).unwrap();
    assert_eq!(restored.current_step().as_str(), PATIENT_INFO);
    assert_eq!(restored.highest_step_reached().as_str(), PHYSICAL_EXAM);
    assert_eq!(
        restored.stale_steps(),
        vec![StepId::from(CLINICAL_ASSESSMENT), StepId::from(PHYSICAL_EXAM)]
    );
}

#[test]
fn test_restore_rejects_unknown_steps() {
    let state = GateState {
        current_step: StepId::from("triage"),
        highest_step_reached: StepId::from(PATIENT_INFO),
        stale_steps: Vec::new(),
    };
    assert_eq!(
        restore_diagnostic_gate(&state).unwrap_err(),
        WorkflowError::UnknownStep("triage".into())
    );
}
