//! Notebook client for kernels behind a Jupyter server.
//!
//! [`kernel::KernelSession`] owns the websocket to one kernel and routes its
//! messages by request. [`registry::NotebookStore`] owns every notebook and
//! cell; [`execution::execute_cell`] connects the two. Contents and kernel
//! lifecycle go through [`jupyter_api::JupyterClient`].

pub mod cell;
pub mod credentials;
pub mod execution;
pub mod jupyter_api;
pub mod kernel;
pub mod notebook_state;
pub mod output;
pub mod registry;
pub mod settings;

pub use cell::{Cell, CellError, ExecutionState, FailedRunCount};
pub use execution::{execute_cell, ExecuteError, ExecutionSummary};
pub use jupyter_api::{ApiError, ContentStore, JupyterClient};
pub use kernel::{KernelSession, SessionError, SessionState};
pub use notebook_state::Notebook;
pub use output::OutputRecord;
pub use registry::{Mutation, NotebookStore, Outcome, RegistrySnapshot, StoreError};
