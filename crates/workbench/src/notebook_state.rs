//! Notebook aggregate: ordered cells plus nbformat conversion.

use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;

use crate::cell::Cell;
use crate::output::OutputRecord;

/// A notebook and its cells, in presentation order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notebook {
    pub id: String,
    pub name: String,
    /// Path of the notebook in the server's content store.
    pub path: String,
    pub kernel_id: Option<String>,
    cells: Vec<Arc<Cell>>,
}

/// nbformat source: either one string or a list of lines.
#[derive(Deserialize)]
#[serde(untagged)]
enum DocumentSource {
    Text(String),
    Lines(Vec<String>),
}

impl DocumentSource {
    fn into_text(self) -> String {
        match self {
            DocumentSource::Text(s) => s,
            DocumentSource::Lines(lines) => lines.concat(),
        }
    }
}

#[derive(Deserialize)]
struct DocumentCell {
    cell_type: String,
    #[serde(default)]
    id: Option<String>,
    source: DocumentSource,
    #[serde(default)]
    execution_count: Option<u32>,
}

#[derive(Deserialize)]
struct Document {
    #[serde(default)]
    cells: Vec<DocumentCell>,
}

/// Convert source string to nbformat's list of lines, newlines kept.
fn source_to_lines(source: &str) -> Vec<String> {
    if source.is_empty() {
        return Vec::new();
    }
    source.split_inclusive('\n').map(|s| s.to_string()).collect()
}

impl Notebook {
    pub fn new(name: impl Into<String>, path: impl Into<String>) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), name, path)
    }

    pub fn with_id(
        id: impl Into<String>,
        name: impl Into<String>,
        path: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            path: path.into(),
            kernel_id: None,
            cells: Vec::new(),
        }
    }

    /// Build a notebook from an nbformat v4 document. Only code cells are
    /// kept; outputs are dropped and execution counts preserved.
    pub fn from_document(
        name: impl Into<String>,
        path: impl Into<String>,
        document: &Value,
    ) -> serde_json::Result<Self> {
        let document = Document::deserialize(document)?;
        let mut notebook = Self::new(name, path);
        for cell in document.cells {
            if cell.cell_type != "code" {
                debug!("Skipping {} cell", cell.cell_type);
                continue;
            }
            let id = cell
                .id
                .filter(|id| !id.is_empty())
                .unwrap_or_else(|| Uuid::new_v4().to_string());
            notebook.cells.push(Arc::new(Cell::restored(
                id,
                cell.source.into_text(),
                cell.execution_count,
            )));
        }
        Ok(notebook)
    }

    /// nbformat v4 document with current sources; the snapshot handed to
    /// the content store before each execution.
    pub fn to_document(&self) -> Value {
        let cells: Vec<Value> = self
            .cells
            .iter()
            .map(|cell| {
                json!({
                    "id": cell.id,
                    "cell_type": "code",
                    "execution_count": cell.execution_count(),
                    "metadata": {},
                    "outputs": [],
                    "source": source_to_lines(&cell.source),
                })
            })
            .collect();

        json!({
            "cells": cells,
            "metadata": {},
            "nbformat": 4,
            "nbformat_minor": 5,
        })
    }

    pub fn cells(&self) -> &[Arc<Cell>] {
        &self.cells
    }

    pub fn find_cell_index(&self, cell_id: &str) -> Option<usize> {
        self.cells.iter().position(|c| c.id == cell_id)
    }

    pub fn cell(&self, cell_id: &str) -> Option<&Cell> {
        self.cells.iter().find(|c| c.id == cell_id).map(Arc::as_ref)
    }

    /// Copies the cell first if an older snapshot still shares it.
    pub fn cell_mut(&mut self, cell_id: &str) -> Option<&mut Cell> {
        self.cells
            .iter_mut()
            .find(|c| c.id == cell_id)
            .map(Arc::make_mut)
    }

    /// Append an empty cell and return its id.
    pub fn add_cell(&mut self) -> String {
        let cell = Cell::new();
        let id = cell.id.clone();
        self.cells.push(Arc::new(cell));
        id
    }

    pub fn push_cell(&mut self, cell: Cell) {
        self.cells.push(Arc::new(cell));
    }

    /// Insert after `after_cell_id`, or append if that cell is gone.
    pub fn insert_cell_after(&mut self, after_cell_id: &str, cell: Cell) {
        let cell = Arc::new(cell);
        match self.find_cell_index(after_cell_id) {
            Some(idx) => self.cells.insert(idx + 1, cell),
            None => self.cells.push(cell),
        }
    }

    pub fn remove_cell(&mut self, cell_id: &str) {
        if let Some(idx) = self.find_cell_index(cell_id) {
            self.cells.remove(idx);
        }
    }

    pub fn update_cell_source(&mut self, cell_id: &str, source: &str) {
        if let Some(cell) = self.cell_mut(cell_id) {
            cell.source = source.to_string();
        }
    }

    /// Re-project the cells onto `cell_ids`. Cells missing from the list
    /// are dropped; ids with no matching cell are ignored.
    pub fn reorder(&mut self, cell_ids: &[String]) {
        let mut remaining = std::mem::take(&mut self.cells);
        for id in cell_ids {
            if let Some(idx) = remaining.iter().position(|c| &c.id == id) {
                self.cells.push(remaining.swap_remove(idx));
            }
        }
    }

    pub fn set_kernel(&mut self, kernel_id: Option<String>) {
        self.kernel_id = kernel_id;
    }

    pub fn rename(&mut self, name: &str) {
        self.name = name.to_string();
    }

    /// Force every executing cell back to idle with `reason` as an error
    /// output. Returns the ids of the affected cells.
    pub fn interrupt_all(&mut self, reason: &str) -> Vec<String> {
        let mut interrupted = Vec::new();
        for cell in self.cells.iter_mut().filter(|c| c.is_executing()) {
            let cell = Arc::make_mut(cell);
            // Cannot fail: the cell is executing.
            let _ = cell.fail_execution(
                Some(OutputRecord::error(reason)),
                crate::cell::FailedRunCount::Unchanged,
            );
            interrupted.push(cell.id.clone());
        }
        interrupted
    }
}
