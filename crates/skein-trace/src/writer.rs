//! Call log writer for JSONL file persistence.
//!
//! Each line is one [`CallOp`]. Supports two modes:
//! - **Session mode**: Writes to a single file (e.g., `session_dir/calls.jsonl`)
//! - **Daily rotation**: Writes to dated files (e.g., `calls/2026-01-11.jsonl`)

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Utc;

use crate::types::CallOp;

/// Error type for call log operations.
#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Configuration for the call log writer.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Path for call log output.
    /// - Session mode: Full path to the log file
    /// - Daily rotation: Directory for dated files
    pub log_path: PathBuf,

    /// Whether writing is enabled.
    pub enabled: bool,

    /// Session mode writes to a single file; daily rotation writes to dated files.
    pub session_mode: bool,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self::daily_rotation(".skein/calls")
    }
}

impl WriterConfig {
    /// Log to a single file.
    pub fn session(log_file: impl Into<PathBuf>) -> Self {
        Self {
            log_path: log_file.into(),
            enabled: true,
            session_mode: true,
        }
    }

    /// Log to one file per day inside `log_dir`.
    pub fn daily_rotation(log_dir: impl Into<PathBuf>) -> Self {
        Self {
            log_path: log_dir.into(),
            enabled: true,
            session_mode: false,
        }
    }

    pub fn disabled() -> Self {
        Self {
            log_path: PathBuf::new(),
            enabled: false,
            session_mode: false,
        }
    }
}

/// Appends call mutations to JSONL files.
///
/// Thread-safe via internal mutex.
#[derive(Debug)]
pub struct CallLogWriter {
    config: WriterConfig,
    current_file: Mutex<Option<CurrentFile>>,
}

#[derive(Debug)]
struct CurrentFile {
    /// For daily rotation: the date string. For session mode: "session".
    key: String,
    writer: BufWriter<File>,
}

impl CallLogWriter {
    pub fn new(config: WriterConfig) -> Result<Self, WriteError> {
        if config.enabled {
            if config.session_mode {
                if let Some(parent) = config.log_path.parent() {
                    fs::create_dir_all(parent)?;
                }
            } else {
                fs::create_dir_all(&config.log_path)?;
            }
        }

        Ok(Self {
            config,
            current_file: Mutex::new(None),
        })
    }

    /// Append a batch of mutations and flush.
    pub fn write_batch(&self, ops: &[CallOp]) -> Result<(), WriteError> {
        if !self.config.enabled || ops.is_empty() {
            return Ok(());
        }

        let mut guard = self.current_file.lock().unwrap_or_else(|e| e.into_inner());
        let key = if self.config.session_mode {
            "session".to_string()
        } else {
            Utc::now().format("%Y-%m-%d").to_string()
        };

        let needs_new_file = match &*guard {
            None => true,
            Some(cf) => cf.key != key,
        };
        if needs_new_file {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.path_for(&key))?;
            *guard = Some(CurrentFile {
                key,
                writer: BufWriter::new(file),
            });
        }

        if let Some(ref mut cf) = *guard {
            for op in ops {
                let line = serde_json::to_string(op)?;
                writeln!(cf.writer, "{}", line)?;
            }
            cf.writer.flush()?;
        }

        Ok(())
    }

    fn path_for(&self, key: &str) -> PathBuf {
        if self.config.session_mode {
            self.config.log_path.clone()
        } else {
            self.config.log_path.join(format!("{}.jsonl", key))
        }
    }

    /// Path of the file the next batch will be written to.
    pub fn current_file_path(&self) -> PathBuf {
        if self.config.session_mode {
            self.config.log_path.clone()
        } else {
            self.path_for(&Utc::now().format("%Y-%m-%d").to_string())
        }
    }

    /// List all call log files, oldest first.
    pub fn list_log_files(&self) -> Result<Vec<PathBuf>, WriteError> {
        if !self.config.enabled {
            return Ok(Vec::new());
        }

        if self.config.session_mode {
            if self.config.log_path.exists() {
                return Ok(vec![self.config.log_path.clone()]);
            }
            return Ok(Vec::new());
        }

        let mut files: Vec<PathBuf> = fs::read_dir(&self.config.log_path)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "jsonl"))
            .collect();

        files.sort();
        Ok(files)
    }

    /// Read every mutation from a log file.
    pub fn read_ops(path: &Path) -> Result<Vec<CallOp>, WriteError> {
        let content = fs::read_to_string(path)?;
        let ops: Result<Vec<CallOp>, _> = content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(serde_json::from_str)
            .collect();
        Ok(ops?)
    }
}
