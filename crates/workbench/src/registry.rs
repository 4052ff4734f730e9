//! The notebook registry: single source of truth for notebook and cell data.
//!
//! Every change goes through [`NotebookStore::apply`]. A mutation is applied
//! to a copy of the current snapshot under one lock, and the resulting
//! snapshot is swapped in and broadcast to subscribers. Readers never see a
//! half-applied mutation.
//!
//! Notebooks, cells and output records are behind `Arc`s, so the copy only
//! duplicates the path to what the mutation touches.

use log::{debug, info};
use serde::Serialize;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::broadcast;

use crate::cell::{Cell, CellError, FailedRunCount};
use crate::notebook_state::Notebook;
use crate::output::OutputRecord;

/// Snapshot channel capacity; lagging subscribers skip to the newest state.
const SNAPSHOT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("notebook {0} not found")]
    NotebookNotFound(String),

    #[error("cell {cell_id} not found in notebook {notebook_id}")]
    CellNotFound {
        notebook_id: String,
        cell_id: String,
    },

    #[error(transparent)]
    Cell(#[from] CellError),
}

/// Immutable view of the registry at one point in time.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RegistrySnapshot {
    pub notebooks: Vec<Arc<Notebook>>,
    pub active_notebook_id: Option<String>,
    pub is_loading: bool,
    pub last_error: Option<String>,
}

impl RegistrySnapshot {
    pub fn notebook(&self, notebook_id: &str) -> Option<&Notebook> {
        self.notebooks
            .iter()
            .find(|n| n.id == notebook_id)
            .map(Arc::as_ref)
    }

    /// The active notebook, if the active id still resolves.
    pub fn active_notebook(&self) -> Option<&Notebook> {
        self.active_notebook_id
            .as_deref()
            .and_then(|id| self.notebook(id))
    }

    pub fn cell(&self, notebook_id: &str, cell_id: &str) -> Option<&Cell> {
        self.notebook(notebook_id).and_then(|n| n.cell(cell_id))
    }

    fn notebook_mut(&mut self, notebook_id: &str) -> Option<&mut Notebook> {
        self.notebooks
            .iter_mut()
            .find(|n| n.id == notebook_id)
            .map(Arc::make_mut)
    }

    fn executing_cell(&mut self, notebook_id: &str, cell_id: &str) -> Result<&mut Cell, StoreError> {
        self.notebook_mut(notebook_id)
            .and_then(|n| n.cell_mut(cell_id))
            .ok_or_else(|| StoreError::CellNotFound {
                notebook_id: notebook_id.to_string(),
                cell_id: cell_id.to_string(),
            })
    }

    fn apply(&mut self, mutation: Mutation) -> Result<Outcome, StoreError> {
        match mutation {
            Mutation::AddNotebook(notebook) => {
                let id = notebook.id.clone();
                let notebook = Arc::new(notebook);
                match self.notebooks.iter().position(|n| n.id == id) {
                    Some(idx) => self.notebooks[idx] = notebook,
                    None => self.notebooks.push(notebook),
                }
                self.active_notebook_id = Some(id);
            }
            Mutation::RemoveNotebook { notebook_id } => {
                self.notebooks.retain(|n| n.id != notebook_id);
                if self.active_notebook_id.as_deref() == Some(notebook_id.as_str()) {
                    self.active_notebook_id = self.notebooks.first().map(|n| n.id.clone());
                }
            }
            Mutation::SetActive { notebook_id } => {
                self.active_notebook_id = notebook_id;
            }
            Mutation::RenameNotebook { notebook_id, name } => {
                if let Some(nb) = self.notebook_mut(&notebook_id) {
                    nb.rename(&name);
                }
            }
            Mutation::SetKernel {
                notebook_id,
                kernel_id,
            } => {
                if let Some(nb) = self.notebook_mut(&notebook_id) {
                    nb.set_kernel(kernel_id);
                }
            }
            Mutation::AddCell {
                notebook_id,
                after_cell_id,
            } => {
                let Some(nb) = self.notebook_mut(&notebook_id) else {
                    return Ok(Outcome::Applied);
                };
                let cell_id = match after_cell_id {
                    Some(after) => {
                        let cell = Cell::new();
                        let id = cell.id.clone();
                        nb.insert_cell_after(&after, cell);
                        id
                    }
                    None => nb.add_cell(),
                };
                return Ok(Outcome::CellAdded(cell_id));
            }
            Mutation::RemoveCell {
                notebook_id,
                cell_id,
            } => {
                if let Some(nb) = self.notebook_mut(&notebook_id) {
                    nb.remove_cell(&cell_id);
                }
            }
            Mutation::UpdateCellSource {
                notebook_id,
                cell_id,
                source,
            } => {
                if let Some(nb) = self.notebook_mut(&notebook_id) {
                    nb.update_cell_source(&cell_id, &source);
                }
            }
            Mutation::ReorderCells {
                notebook_id,
                cell_ids,
            } => {
                if let Some(nb) = self.notebook_mut(&notebook_id) {
                    nb.reorder(&cell_ids);
                }
            }
            Mutation::BeginExecution {
                notebook_id,
                cell_id,
            } => {
                self.executing_cell(&notebook_id, &cell_id)?.begin_execution()?;
            }
            Mutation::AppendOutput {
                notebook_id,
                cell_id,
                output,
            } => {
                self.executing_cell(&notebook_id, &cell_id)?
                    .append_output(output)?;
            }
            Mutation::CompleteExecution {
                notebook_id,
                cell_id,
            } => {
                let cell = self.executing_cell(&notebook_id, &cell_id)?;
                let count = cell.next_execution_count();
                cell.complete_execution(count)?;
            }
            Mutation::FailExecution {
                notebook_id,
                cell_id,
                error,
                policy,
            } => {
                self.executing_cell(&notebook_id, &cell_id)?
                    .fail_execution(error, policy)?;
            }
            Mutation::InterruptExecutions {
                notebook_id,
                reason,
            } => {
                let interrupted = self
                    .notebook_mut(&notebook_id)
                    .map(|nb| nb.interrupt_all(&reason))
                    .unwrap_or_default();
                return Ok(Outcome::Interrupted(interrupted));
            }
            Mutation::SetLoading(loading) => {
                self.is_loading = loading;
            }
            Mutation::SetError(message) => {
                self.last_error = Some(message);
            }
            Mutation::ClearError => {
                self.last_error = None;
            }
        }
        Ok(Outcome::Applied)
    }
}

/// A single change to the registry.
#[derive(Debug, Clone)]
pub enum Mutation {
    /// Add (or replace by id) a notebook and make it active.
    AddNotebook(Notebook),
    RemoveNotebook {
        notebook_id: String,
    },
    /// Switch the active pointer. The id is not validated.
    SetActive {
        notebook_id: Option<String>,
    },
    RenameNotebook {
        notebook_id: String,
        name: String,
    },
    SetKernel {
        notebook_id: String,
        kernel_id: Option<String>,
    },
    /// Append an empty cell, or insert it after `after_cell_id`.
    AddCell {
        notebook_id: String,
        after_cell_id: Option<String>,
    },
    RemoveCell {
        notebook_id: String,
        cell_id: String,
    },
    UpdateCellSource {
        notebook_id: String,
        cell_id: String,
        source: String,
    },
    ReorderCells {
        notebook_id: String,
        cell_ids: Vec<String>,
    },
    BeginExecution {
        notebook_id: String,
        cell_id: String,
    },
    AppendOutput {
        notebook_id: String,
        cell_id: String,
        output: OutputRecord,
    },
    /// Successful run; the cell's count advances by one.
    CompleteExecution {
        notebook_id: String,
        cell_id: String,
    },
    FailExecution {
        notebook_id: String,
        cell_id: String,
        error: Option<OutputRecord>,
        policy: FailedRunCount,
    },
    /// Force every executing cell in the notebook back to idle.
    InterruptExecutions {
        notebook_id: String,
        reason: String,
    },
    SetLoading(bool),
    SetError(String),
    ClearError,
}

impl Mutation {
    fn name(&self) -> &'static str {
        match self {
            Mutation::AddNotebook(_) => "add_notebook",
            Mutation::RemoveNotebook { .. } => "remove_notebook",
            Mutation::SetActive { .. } => "set_active",
            Mutation::RenameNotebook { .. } => "rename_notebook",
            Mutation::SetKernel { .. } => "set_kernel",
            Mutation::AddCell { .. } => "add_cell",
            Mutation::RemoveCell { .. } => "remove_cell",
            Mutation::UpdateCellSource { .. } => "update_cell_source",
            Mutation::ReorderCells { .. } => "reorder_cells",
            Mutation::BeginExecution { .. } => "begin_execution",
            Mutation::AppendOutput { .. } => "append_output",
            Mutation::CompleteExecution { .. } => "complete_execution",
            Mutation::FailExecution { .. } => "fail_execution",
            Mutation::InterruptExecutions { .. } => "interrupt_executions",
            Mutation::SetLoading(_) => "set_loading",
            Mutation::SetError(_) => "set_error",
            Mutation::ClearError => "clear_error",
        }
    }
}

/// What a successful mutation produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Applied,
    /// Id of the cell created by `AddCell`.
    CellAdded(String),
    /// Ids of the cells forced back to idle by `InterruptExecutions`.
    Interrupted(Vec<String>),
}

/// Shared, serialized owner of the registry state.
pub struct NotebookStore {
    state: StdMutex<Arc<RegistrySnapshot>>,
    changes: broadcast::Sender<Arc<RegistrySnapshot>>,
}

impl Default for NotebookStore {
    fn default() -> Self {
        Self::new()
    }
}

impl NotebookStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(SNAPSHOT_CHANNEL_CAPACITY);
        Self {
            state: StdMutex::new(Arc::new(RegistrySnapshot::default())),
            changes,
        }
    }

    /// Apply one mutation. On error the state is left untouched and no
    /// snapshot is published.
    pub fn apply(&self, mutation: Mutation) -> Result<Outcome, StoreError> {
        let name = mutation.name();
        let mut guard = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let mut next = RegistrySnapshot::clone(&guard);
        let outcome = next.apply(mutation)?;
        let next = Arc::new(next);
        *guard = Arc::clone(&next);
        debug!("[registry] Applied {}", name);

        // No subscribers is fine.
        let _ = self.changes.send(next);
        Ok(outcome)
    }

    /// Latest snapshot.
    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        let guard = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(&guard)
    }

    /// Receive every snapshot published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<RegistrySnapshot>> {
        self.changes.subscribe()
    }

    /// Record a user-visible error in the last-error slot.
    pub fn set_error(&self, message: impl Into<String>) {
        let message = message.into();
        info!("[registry] Last error: {}", message);
        // SetError cannot fail.
        let _ = self.apply(Mutation::SetError(message));
    }
}
