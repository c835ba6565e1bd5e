//! Step gating for multi-step clinical documentation workflows
//!
//! A workflow is declared as a [`StepTable`]: an ordered list of steps, each
//! carrying three plain functions over the in-progress record (is the step
//! complete, does it hold data, how to clear it). A [`WorkflowGate`] walks that
//! table and answers one question: which steps may the user open right now?
//!
//! - Every step up to the furthest one reached stays open for review.
//! - The step right after the current one opens once the current step is
//!   complete.
//! - Editing an earlier step flags later steps that hold data as possibly
//!   stale; nothing downstream is wiped unless the caller asks for it.
//!
//! # Example
//!
//! ```rust
//! use workflow_gate::diagnostic::{diagnostic_gate, DiagnosticRecord, ComplaintDetail};
//!
//! let mut gate = diagnostic_gate();
//! let mut record = DiagnosticRecord::default();
//! record.patient.name = "Ada Lovelace".into();
//! record.patient.age = Some(36);
//!
//! gate.advance(&record).unwrap();
//! assert!(!gate.is_step_accessible("physical-exam", &record));
//!
//! record.complaint_details.push(ComplaintDetail {
//!     symptom: "sore throat".into(),
//!     ..Default::default()
//! });
//! assert!(gate.is_step_accessible("physical-exam", &record));
//! ```

pub mod diagnostic;
pub mod error;
pub mod gate;
pub mod step;

pub use error::{Result, WorkflowError};
pub use gate::{GateState, Navigation, WorkflowGate};
pub use step::{StepDefinition, StepId, StepTable, StepTableBuilder};
