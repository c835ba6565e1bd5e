// Step definitions and the ordered step table
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

use crate::error::{Result, WorkflowError};

/// Stable identifier of a workflow step (e.g. `physical-exam`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepId(String);

impl StepId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StepId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

pub type Predicate<R> = fn(&R) -> bool;
pub type Clear<R> = fn(&mut R);

fn always<R>(_: &R) -> bool {
    true
}

fn never<R>(_: &R) -> bool {
    false
}

fn keep<R>(_: &mut R) {}

/// One row of a workflow table.
///
/// `complete` gates the transition to the next step, `has_data` decides
/// whether the step can go stale when an earlier step is edited, and `clear`
/// wipes the step's data when the caller explicitly asks for it.
pub struct StepDefinition<R> {
    id: StepId,
    label: String,
    complete: Predicate<R>,
    has_data: Predicate<R>,
    clear: Clear<R>,
}

impl<R> StepDefinition<R> {
    pub fn new(id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            id: StepId::new(id),
            label: label.into(),
            complete: always::<R>,
            has_data: never::<R>,
            clear: keep::<R>,
        }
    }

    pub fn complete_when(mut self, predicate: Predicate<R>) -> Self {
        self.complete = predicate;
        self
    }

    pub fn has_data_when(mut self, predicate: Predicate<R>) -> Self {
        self.has_data = predicate;
        self
    }

    pub fn clears_with(mut self, clear: Clear<R>) -> Self {
        self.clear = clear;
        self
    }

    pub fn id(&self) -> &StepId {
        &self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn is_complete(&self, record: &R) -> bool {
        (self.complete)(record)
    }

    pub fn has_data(&self, record: &R) -> bool {
        (self.has_data)(record)
    }

    pub fn clear(&self, record: &mut R) {
        (self.clear)(record);
    }
}

impl<R> fmt::Debug for StepDefinition<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepDefinition")
            .field("id", &self.id)
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

/// Ordered, non-empty list of steps with unique ids
#[derive(Debug)]
pub struct StepTable<R> {
    steps: Vec<StepDefinition<R>>,
}

impl<R> StepTable<R> {
    /// # Errors
    ///
    /// Rejects an empty table and duplicate step ids.
    pub fn new(steps: Vec<StepDefinition<R>>) -> Result<Self> {
        if steps.is_empty() {
            return Err(WorkflowError::EmptyTable);
        }

        let mut seen = HashSet::new();
        for step in &steps {
            if !seen.insert(step.id.as_str()) {
                return Err(WorkflowError::DuplicateStep(step.id.to_string()));
            }
        }

        Ok(Self { steps })
    }

    /// For tables declared as literals inside this crate.
    pub(crate) fn from_trusted(steps: Vec<StepDefinition<R>>) -> Self {
        debug_assert!(!steps.is_empty());
        Self { steps }
    }

    pub fn builder() -> StepTableBuilder<R> {
        StepTableBuilder { steps: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.steps.iter().position(|step| step.id.as_str() == id)
    }

    pub fn get(&self, index: usize) -> Option<&StepDefinition<R>> {
        self.steps.get(index)
    }

    pub fn last_index(&self) -> usize {
        self.steps.len().saturating_sub(1)
    }

    pub fn ids(&self) -> impl Iterator<Item = &StepId> {
        self.steps.iter().map(|step| &step.id)
    }
}

pub struct StepTableBuilder<R> {
    steps: Vec<StepDefinition<R>>,
}

impl<R> StepTableBuilder<R> {
    pub fn step(mut self, step: StepDefinition<R>) -> Self {
        self.steps.push(step);
        self
    }

    /// # Errors
    ///
    /// See [`StepTable::new`].
    pub fn build(self) -> Result<StepTable<R>> {
        StepTable::new(self.steps)
    }
}
