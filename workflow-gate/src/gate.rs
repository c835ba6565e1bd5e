//! Reachability state machine over a [`StepTable`]
//!
//! The gate tracks two pointers into the table: the step currently displayed
//! and the furthest step ever reached. Any step up to the furthest one stays
//! reachable so earlier steps can be reviewed and edited; the step right after
//! the current one opens only once the current step's completeness predicate
//! holds for the in-progress record.
//!
//! Editing an earlier step never rewinds the furthest pointer. Instead the
//! later steps that already hold data are flagged as possibly stale so the
//! caller can ask the user whether to regenerate them. Downstream data is only
//! wiped through [`WorkflowGate::discard_downstream`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::debug;

use crate::error::{Result, WorkflowError};
use crate::step::{StepId, StepTable};

/// Outcome of a successful navigation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Navigation {
    pub from: StepId,
    pub to: StepId,
    pub highest_step_reached: StepId,
    /// Steps flagged by earlier edits that have not been regenerated yet
    pub possibly_stale: Vec<StepId>,
}

/// Serializable gate position, suitable for the auxiliary cache blobs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GateState {
    pub current_step: StepId,
    pub highest_step_reached: StepId,
    #[serde(default)]
    pub stale_steps: Vec<StepId>,
}

#[derive(Debug)]
pub struct WorkflowGate<R> {
    table: StepTable<R>,
    current: usize,
    highest: usize,
    stale: BTreeSet<usize>,
}

impl<R> WorkflowGate<R> {
    pub fn new(table: StepTable<R>) -> Self {
        Self {
            table,
            current: 0,
            highest: 0,
            stale: BTreeSet::new(),
        }
    }

    /// Rebuild a gate from a saved [`GateState`].
    ///
    /// # Errors
    ///
    /// Fails if a saved step id is not in `table`.
    pub fn restore(table: StepTable<R>, state: &GateState) -> Result<Self> {
        let current = Self::lookup(&table, state.current_step.as_str())?;
        let highest = Self::lookup(&table, state.highest_step_reached.as_str())?;
        let stale = state
            .stale_steps
            .iter()
            .map(|id| Self::lookup(&table, id.as_str()))
            .collect::<Result<BTreeSet<_>>>()?;

        Ok(Self {
            table,
            current,
            highest: highest.max(current),
            stale,
        })
    }

    pub fn snapshot(&self) -> GateState {
        GateState {
            current_step: self.step_id(self.current),
            highest_step_reached: self.step_id(self.highest),
            stale_steps: self.stale_steps(),
        }
    }

    pub fn table(&self) -> &StepTable<R> {
        &self.table
    }

    pub fn current_step(&self) -> StepId {
        self.step_id(self.current)
    }

    pub fn highest_step_reached(&self) -> StepId {
        self.step_id(self.highest)
    }

    pub fn is_terminal(&self) -> bool {
        self.current == self.table.last_index()
    }

    pub fn is_step_accessible(&self, step: &str, record: &R) -> bool {
        self.table
            .index_of(step)
            .is_some_and(|index| self.index_accessible(index, record))
    }

    pub fn accessible_steps(&self, record: &R) -> Vec<StepId> {
        (0..self.table.len())
            .filter(|&index| self.index_accessible(index, record))
            .map(|index| self.step_id(index))
            .collect()
    }

    /// # Errors
    ///
    /// `UnknownStep` for ids outside the table, `StepNotAccessible` when the
    /// target is beyond the reachable frontier.
    pub fn navigate_to_step(&mut self, step: &str, record: &R) -> Result<Navigation> {
        let target = Self::lookup(&self.table, step)?;
        if !self.index_accessible(target, record) {
            return Err(WorkflowError::StepNotAccessible {
                step: step.to_string(),
                current: self.current_step().to_string(),
            });
        }

        let from = self.current_step();
        self.current = target;
        self.highest = self.highest.max(target);

        debug!(
            from = %from,
            to = step,
            highest = %self.highest_step_reached(),
            "Workflow step changed"
        );

        Ok(Navigation {
            from,
            to: self.current_step(),
            highest_step_reached: self.highest_step_reached(),
            possibly_stale: self.stale_steps(),
        })
    }

    /// Move to the step after the current one.
    ///
    /// # Errors
    ///
    /// `Terminal` on the last step, otherwise as [`Self::navigate_to_step`].
    pub fn advance(&mut self, record: &R) -> Result<Navigation> {
        if self.is_terminal() {
            return Err(WorkflowError::Terminal(self.current_step().to_string()));
        }
        let next = self.step_id(self.current.saturating_add(1));
        self.navigate_to_step(next.as_str(), record)
    }

    /// Note that `step` was edited. Returns the later, already reached steps
    /// whose data may now be out of date; they stay flagged until
    /// [`Self::acknowledge_regenerated`] or [`Self::discard_downstream`].
    ///
    /// # Errors
    ///
    /// `UnknownStep` for ids outside the table.
    pub fn record_edit(&mut self, step: &str, record: &R) -> Result<Vec<StepId>> {
        let edited = Self::lookup(&self.table, step)?;
        let flagged: Vec<usize> = (edited.saturating_add(1)..=self.highest)
            .filter(|&index| self.table.get(index).is_some_and(|def| def.has_data(record)))
            .collect();

        self.stale.extend(flagged.iter().copied());
        if !flagged.is_empty() {
            debug!(edited = step, count = flagged.len(), "Downstream steps flagged as possibly stale");
        }

        Ok(flagged.into_iter().map(|index| self.step_id(index)).collect())
    }

    pub fn stale_steps(&self) -> Vec<StepId> {
        self.stale.iter().map(|&index| self.step_id(index)).collect()
    }

    /// # Errors
    ///
    /// `UnknownStep` for ids outside the table.
    pub fn acknowledge_regenerated(&mut self, step: &str) -> Result<()> {
        let index = Self::lookup(&self.table, step)?;
        self.stale.remove(&index);
        Ok(())
    }

    /// Clear every step after `step` in `record`, using each step's declared
    /// clear function. The furthest reached step is left untouched.
    ///
    /// # Errors
    ///
    /// `UnknownStep` for ids outside the table.
    pub fn discard_downstream(&mut self, step: &str, record: &mut R) -> Result<Vec<StepId>> {
        let edited = Self::lookup(&self.table, step)?;
        let mut cleared = Vec::new();
        for index in edited.saturating_add(1)..self.table.len() {
            if let Some(def) = self.table.get(index) {
                def.clear(record);
                cleared.push(def.id().clone());
            }
            self.stale.remove(&index);
        }
        Ok(cleared)
    }

    fn index_accessible(&self, index: usize, record: &R) -> bool {
        if index <= self.highest {
            return true;
        }
        index == self.current.saturating_add(1)
            && self
                .table
                .get(self.current)
                .is_some_and(|current| current.is_complete(record))
    }

    fn lookup(table: &StepTable<R>, step: &str) -> Result<usize> {
        table
            .index_of(step)
            .ok_or_else(|| WorkflowError::UnknownStep(step.to_string()))
    }

    fn step_id(&self, index: usize) -> StepId {
        self.table
            .get(index)
            .map(|def| def.id().clone())
            .unwrap_or_else(|| StepId::new(""))
    }
}
