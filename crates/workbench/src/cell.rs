//! Per-cell execution lifecycle.
//!
//! A cell is `Idle` until an execution begins, collects outputs while
//! `Executing`, and returns to `Idle` when the execution completes or fails.
//! Re-entrant execution is rejected rather than queued.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::output::OutputRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    #[default]
    Idle,
    Executing,
}

/// Whether a failed run consumes an execution count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailedRunCount {
    /// A failed run leaves the count where it was.
    #[default]
    Unchanged,
    /// A failed run bumps the count, as Jupyter kernels do.
    Increment,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CellError {
    #[error("cell {0} is already executing")]
    AlreadyExecuting(String),

    #[error("cell {0} is not executing")]
    NotExecuting(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Cell {
    pub id: String,
    pub source: String,
    /// Shared so snapshots of a busy cell do not copy its earlier output.
    outputs: Vec<Arc<OutputRecord>>,
    state: ExecutionState,
    execution_count: Option<u32>,
}

impl Default for Cell {
    fn default() -> Self {
        Self::new()
    }
}

impl Cell {
    /// An empty cell with a fresh id.
    pub fn new() -> Self {
        Self::with_source(Uuid::new_v4().to_string(), "")
    }

    pub fn with_source(id: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            outputs: Vec::new(),
            state: ExecutionState::Idle,
            execution_count: None,
        }
    }

    /// A cell loaded from a saved document, keeping its last count.
    pub fn restored(
        id: impl Into<String>,
        source: impl Into<String>,
        execution_count: Option<u32>,
    ) -> Self {
        Self {
            execution_count,
            ..Self::with_source(id, source)
        }
    }

    pub fn outputs(&self) -> &[Arc<OutputRecord>] {
        &self.outputs
    }

    pub fn state(&self) -> ExecutionState {
        self.state
    }

    pub fn is_executing(&self) -> bool {
        self.state == ExecutionState::Executing
    }

    pub fn execution_count(&self) -> Option<u32> {
        self.execution_count
    }

    /// Count the next successful run will carry.
    pub fn next_execution_count(&self) -> u32 {
        self.execution_count.unwrap_or(0).saturating_add(1)
    }

    pub fn begin_execution(&mut self) -> Result<(), CellError> {
        if self.is_executing() {
            return Err(CellError::AlreadyExecuting(self.id.clone()));
        }
        self.outputs.clear();
        self.state = ExecutionState::Executing;
        Ok(())
    }

    pub fn append_output(&mut self, output: OutputRecord) -> Result<(), CellError> {
        self.ensure_executing()?;
        self.outputs.push(Arc::new(output));
        Ok(())
    }

    pub fn complete_execution(&mut self, execution_count: u32) -> Result<(), CellError> {
        self.ensure_executing()?;
        self.execution_count = Some(execution_count);
        self.state = ExecutionState::Idle;
        Ok(())
    }

    /// End a failed run. `error` is appended as the final output; pass
    /// `None` when the kernel already streamed its own error.
    pub fn fail_execution(
        &mut self,
        error: Option<OutputRecord>,
        policy: FailedRunCount,
    ) -> Result<(), CellError> {
        self.ensure_executing()?;
        if let Some(error) = error {
            self.outputs.push(Arc::new(error));
        }
        if policy == FailedRunCount::Increment {
            self.execution_count = Some(self.next_execution_count());
        }
        self.state = ExecutionState::Idle;
        Ok(())
    }

    fn ensure_executing(&self) -> Result<(), CellError> {
        if self.is_executing() {
            Ok(())
        } else {
            Err(CellError::NotExecuting(self.id.clone()))
        }
    }
}
