//! Notebook store
//!
//! Ordered cells with per-cell outputs. Pure data, no external calls.
//! Every operation is total: it either applies completely or returns an
//! error and leaves the notebook untouched.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

use crate::{Error, Result};

/// Symbolic target resolving to the most recently added cell.
pub const LAST_ADDED_ALIAS: &str = "last-added-cell";

/// Kind of cell
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CellType {
    /// Markdown / prose
    Text,
    /// Executable code
    Code,
}

impl fmt::Display for CellType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CellType::Text => write!(f, "text"),
            CellType::Code => write!(f, "code"),
        }
    }
}

impl std::str::FromStr for CellType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "text" | "markdown" => Ok(CellType::Text),
            "code" => Ok(CellType::Code),
            _ => Err(Error::Execution(format!("Unknown cell type: {}", s))),
        }
    }
}

/// Kind of execution output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputKind {
    /// stdout/stderr text
    Stream,
    /// Value of the last expression
    ExecuteResult,
    /// Rich display payload
    DisplayData,
    /// Failure raised by the executed code or the executor
    Error,
}

/// One unit of output attached to a cell
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Output {
    pub kind: OutputKind,
    /// Text or structured payload
    pub payload: Value,
    pub success: bool,
    /// Error detail when `success` is false
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Output {
    /// Successful stream output
    pub fn stream(text: impl Into<String>) -> Self {
        Self {
            kind: OutputKind::Stream,
            payload: Value::String(text.into()),
            success: true,
            error: None,
        }
    }

    /// Successful structured result
    pub fn result(payload: Value) -> Self {
        Self {
            kind: OutputKind::ExecuteResult,
            payload,
            success: true,
            error: None,
        }
    }

    /// Failed output carrying an error detail
    pub fn failure(detail: impl Into<String>) -> Self {
        let detail = detail.into();
        Self {
            kind: OutputKind::Error,
            payload: Value::String(detail.clone()),
            success: false,
            error: Some(detail),
        }
    }
}

/// A notebook cell
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cell {
    pub id: String,
    #[serde(rename = "type")]
    pub cell_type: CellType,
    pub content: String,
    #[serde(default)]
    pub outputs: Vec<Output>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl Cell {
    /// Structural marker kind (`chapter`, `section`), if this is a marker cell
    pub fn marker(&self) -> Option<&str> {
        self.metadata.get("marker").and_then(|m| m.as_str())
    }
}

/// Partial update for a cell. `None` leaves the field unchanged.
#[derive(Debug, Clone, Default)]
pub struct CellUpdate {
    pub content: Option<String>,
    pub cell_type: Option<CellType>,
    /// Keys merged into the cell's metadata
    pub metadata: Option<Map<String, Value>>,
}

/// Ordered collection of cells
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotebookStore {
    cells: Vec<Cell>,
    next_id: u64,
    last_added: Option<String>,
}

impl NotebookStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a cell and make it the "last added" cell
    pub fn add_cell(&mut self, cell_type: CellType, content: impl Into<String>) -> String {
        self.add_cell_with_metadata(cell_type, content, Map::new())
    }

    /// Append a cell carrying metadata
    pub fn add_cell_with_metadata(
        &mut self,
        cell_type: CellType,
        content: impl Into<String>,
        metadata: Map<String, Value>,
    ) -> String {
        self.next_id += 1;
        let id = format!("c{}", self.next_id);
        self.cells.push(Cell {
            id: id.clone(),
            cell_type,
            content: content.into(),
            outputs: Vec::new(),
            metadata,
        });
        self.last_added = Some(id.clone());
        id
    }

    pub fn get_cell(&self, id: &str) -> Option<&Cell> {
        self.cells.iter().find(|c| c.id == id)
    }

    fn cell_mut(&mut self, id: &str) -> Result<&mut Cell> {
        self.cells
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| Error::CellNotFound(id.to_string()))
    }

    pub fn update_cell(&mut self, id: &str, update: CellUpdate) -> Result<()> {
        let cell = self.cell_mut(id)?;
        if let Some(content) = update.content {
            cell.content = content;
        }
        if let Some(cell_type) = update.cell_type {
            cell.cell_type = cell_type;
        }
        if let Some(metadata) = update.metadata {
            cell.metadata.extend(metadata);
        }
        Ok(())
    }

    /// Remove a cell. Clears the alias if it pointed at the removed cell.
    pub fn delete_cell(&mut self, id: &str) -> Result<Cell> {
        let idx = self
            .cells
            .iter()
            .position(|c| c.id == id)
            .ok_or_else(|| Error::CellNotFound(id.to_string()))?;
        if self.last_added.as_deref() == Some(id) {
            self.last_added = None;
        }
        Ok(self.cells.remove(idx))
    }

    pub fn list_cells_by_type(&self, cell_type: CellType) -> Vec<&Cell> {
        self.cells
            .iter()
            .filter(|c| c.cell_type == cell_type)
            .collect()
    }

    pub fn clear_outputs(&mut self, id: &str) -> Result<()> {
        self.cell_mut(id)?.outputs.clear();
        Ok(())
    }

    pub fn append_output(&mut self, id: &str, output: Output) -> Result<()> {
        self.cell_mut(id)?.outputs.push(output);
        Ok(())
    }

    /// Id of the most recently added cell
    pub fn last_added(&self) -> Option<&str> {
        self.last_added.as_deref()
    }

    /// Resolve a target reference to a concrete cell id.
    ///
    /// `None` and [`LAST_ADDED_ALIAS`] both mean the last added cell.
    pub fn resolve(&self, target: Option<&str>) -> Result<String> {
        match target {
            None | Some(LAST_ADDED_ALIAS) => self
                .last_added
                .clone()
                .ok_or_else(|| Error::CellNotFound(LAST_ADDED_ALIAS.to_string())),
            Some(id) => self
                .get_cell(id)
                .map(|c| c.id.clone())
                .ok_or_else(|| Error::CellNotFound(id.to_string())),
        }
    }

    pub fn cells(&self) -> &[Cell] {
        &self.cells
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}
