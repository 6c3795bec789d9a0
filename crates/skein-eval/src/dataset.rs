//! Datasets: ordered rows of named columns.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use skein_trace::Attributes;

use crate::error::{EvalError, Result};

/// An ordered collection of rows to evaluate against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub rows: Vec<Attributes>,
}

impl Dataset {
    pub fn new(id: impl Into<String>, rows: impl IntoIterator<Item = Attributes>) -> Self {
        Self {
            id: id.into(),
            description: None,
            rows: rows.into_iter().collect(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Load rows from a JSONL file, one object per line.
    ///
    /// The dataset id is the file stem. Blank lines are skipped.
    pub fn from_jsonl(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let mut rows = Vec::new();

        for (i, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let value: Value =
                serde_json::from_str(line).map_err(|source| EvalError::Json { line: i + 1, source })?;
            match value {
                Value::Object(row) => rows.push(row),
                _ => return Err(EvalError::NotAnObject { line: i + 1 }),
            }
        }

        let id = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "dataset".to_string());

        tracing::debug!(dataset = %id, rows = rows.len(), "Loaded dataset");
        Ok(Self::new(id, rows))
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}
