use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WorkflowError {
    #[error("Unknown workflow step: {0}")]
    UnknownStep(String),

    #[error("Step '{step}' is not accessible from '{current}'")]
    StepNotAccessible { step: String, current: String },

    #[error("Step '{0}' is terminal; no forward transition exists")]
    Terminal(String),

    #[error("Duplicate step id in workflow table: {0}")]
    DuplicateStep(String),

    #[error("Workflow table has no steps")]
    EmptyTable,
}

pub type Result<T> = std::result::Result<T, WorkflowError>;
