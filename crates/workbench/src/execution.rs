//! Runs one cell against a kernel session and folds the results into the
//! registry.

use kernel_wire::{Content, Envelope, ExecuteReply, ReplyStatus};
use log::{info, warn};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::cell::FailedRunCount;
use crate::jupyter_api::ContentStore;
use crate::kernel::{KernelSession, OutputSink, ReplyCallback, SessionError};
use crate::output::OutputRecord;
use crate::registry::{Mutation, NotebookStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum ExecuteError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Session(#[from] SessionError),
}

/// How an execution ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionSummary {
    pub request_id: String,
    pub status: ReplyStatus,
    /// Cell count after the run.
    pub execution_count: Option<u32>,
}

/// Events from the reader task, in arrival order.
enum ExecutionEvent {
    Output(OutputRecord),
    Reply(ExecuteReply),
    /// An `execute_reply` whose content did not parse.
    UnreadableReply(Value),
    Idle,
}

/// Execute a cell: mark it executing, snapshot the notebook, send the code
/// and apply outputs until both the shell reply and the idle status for the
/// request have arrived.
pub async fn execute_cell<C: ContentStore>(
    store: &NotebookStore,
    session: &KernelSession,
    content_store: &C,
    notebook_id: &str,
    cell_id: &str,
    policy: FailedRunCount,
) -> Result<ExecutionSummary, ExecuteError> {
    if let Err(e) = store.apply(Mutation::BeginExecution {
        notebook_id: notebook_id.to_string(),
        cell_id: cell_id.to_string(),
    }) {
        if matches!(e, StoreError::Cell(_)) {
            store.set_error(e.to_string());
        }
        return Err(e.into());
    }

    let snapshot = store.snapshot();
    let Some(notebook) = snapshot.notebook(notebook_id) else {
        return Err(StoreError::NotebookNotFound(notebook_id.to_string()).into());
    };
    let source = notebook
        .cell(cell_id)
        .map(|c| c.source.clone())
        .unwrap_or_default();

    if let Err(e) = content_store
        .save_notebook(&notebook.path, notebook.to_document())
        .await
    {
        warn!("[execute] Snapshot of {} failed: {}", notebook.path, e);
    }

    let (tx, mut rx) = mpsc::unbounded_channel();
    let output_tx = tx.clone();
    let sink: OutputSink = Box::new(move |record| {
        let _ = output_tx.send(ExecutionEvent::Output(record));
    });
    let callback: ReplyCallback = Box::new(move |envelope: &Envelope| match &envelope.content {
        Content::ExecuteReply(reply) => {
            let _ = tx.send(ExecutionEvent::Reply(reply.clone()));
        }
        Content::Other { msg_type, payload } if msg_type == "execute_reply" => {
            let _ = tx.send(ExecutionEvent::UnreadableReply(payload.clone()));
        }
        Content::Status(status) if status.is_idle() => {
            let _ = tx.send(ExecutionEvent::Idle);
        }
        _ => {}
    });

    let request_id = match session.execute(&source, sink, callback) {
        Ok(id) => id,
        Err(e) => {
            // Nothing reached the kernel, so no count is consumed.
            store.apply(Mutation::FailExecution {
                notebook_id: notebook_id.to_string(),
                cell_id: cell_id.to_string(),
                error: Some(OutputRecord::error(e.to_string())),
                policy: FailedRunCount::Unchanged,
            })?;
            store.set_error(e.to_string());
            return Err(e.into());
        }
    };
    info!("[execute] Cell {} running as {}", cell_id, request_id);

    let result = drive(store, &mut rx, notebook_id, cell_id, &request_id, policy).await;
    session.unregister(&request_id);
    result
}

async fn drive(
    store: &NotebookStore,
    rx: &mut mpsc::UnboundedReceiver<ExecutionEvent>,
    notebook_id: &str,
    cell_id: &str,
    request_id: &str,
    policy: FailedRunCount,
) -> Result<ExecutionSummary, ExecuteError> {
    let mut reply: Option<Result<ExecuteReply, Value>> = None;
    let mut idle = false;
    let mut streamed_error = false;

    let reply = loop {
        if idle {
            if let Some(reply) = reply.take() {
                break reply;
            }
        }
        match rx.recv().await {
            Some(ExecutionEvent::Output(record)) => {
                streamed_error |= record.is_error();
                store.apply(Mutation::AppendOutput {
                    notebook_id: notebook_id.to_string(),
                    cell_id: cell_id.to_string(),
                    output: record,
                })?;
            }
            Some(ExecutionEvent::Reply(r)) => reply = Some(Ok(r)),
            Some(ExecutionEvent::UnreadableReply(payload)) => reply = Some(Err(payload)),
            Some(ExecutionEvent::Idle) => idle = true,
            None => {
                // Routes were cleared: the socket closed under us. The run
                // never finished, so it consumes no count.
                warn!("[execute] Connection lost while running {}", request_id);
                if let Err(e) = store.apply(Mutation::FailExecution {
                    notebook_id: notebook_id.to_string(),
                    cell_id: cell_id.to_string(),
                    error: Some(OutputRecord::error("connection lost")),
                    policy: FailedRunCount::Unchanged,
                }) {
                    warn!("[execute] Could not reset cell {}: {}", cell_id, e);
                }
                store.set_error("connection to the kernel was lost");
                return Err(SessionError::ConnectionError("connection lost".into()).into());
            }
        }
    };

    let (status, failure) = match reply {
        Ok(reply) => {
            let failure = match reply.status {
                ReplyStatus::Ok => None,
                // The kernel streams its own error output before replying.
                ReplyStatus::Error if streamed_error => Some(None),
                ReplyStatus::Error => Some(Some(OutputRecord::from_error(
                    &reply.error().unwrap_or_default(),
                ))),
                ReplyStatus::Aborted => Some(Some(OutputRecord::error("execution aborted"))),
            };
            (reply.status, failure)
        }
        Err(payload) => {
            warn!("[execute] Unrecognized reply to {}: {}", request_id, payload);
            let status = payload
                .get("status")
                .and_then(Value::as_str)
                .unwrap_or("missing");
            let error = (!streamed_error)
                .then(|| OutputRecord::error(format!("unrecognized reply status: {status}")));
            (ReplyStatus::Error, Some(error))
        }
    };

    match failure {
        None => {
            store.apply(Mutation::CompleteExecution {
                notebook_id: notebook_id.to_string(),
                cell_id: cell_id.to_string(),
            })?;
        }
        Some(error) => {
            store.apply(Mutation::FailExecution {
                notebook_id: notebook_id.to_string(),
                cell_id: cell_id.to_string(),
                error,
                policy,
            })?;
        }
    }

    let execution_count = store
        .snapshot()
        .cell(notebook_id, cell_id)
        .and_then(|c| c.execution_count());
    info!(
        "[execute] Cell {} finished: {:?} count={:?}",
        cell_id, status, execution_count
    );

    Ok(ExecutionSummary {
        request_id: request_id.to_string(),
        status,
        execution_count,
    })
}
