//! Append-only operation log (`.planner/operations.jsonl`).
//!
//! Records every side effect the build runtime performs: setup commands
//! (run or refused), file writes, generation calls and errors. One JSON
//! object per line.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpEvent {
    Command,
    FileWrite,
    GenerationCall,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpRecord {
    pub timestamp: DateTime<Utc>,
    pub event: OpEvent,
    pub payload: Value,
}

/// Shared JSONL sink. The file lock is held only for a single write.
#[derive(Debug)]
pub struct OperationLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl OperationLog {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create log dir {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open operation log {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record(&self, event: OpEvent, payload: Value) -> Result<()> {
        let record = OpRecord {
            timestamp: Utc::now(),
            event,
            payload,
        };
        let mut line = serde_json::to_string(&record).context("serialize operation record")?;
        line.push('\n');
        let mut file = self
            .file
            .lock()
            .map_err(|_| anyhow!("operation log lock poisoned"))?;
        file.write_all(line.as_bytes())
            .with_context(|| format!("append {}", self.path.display()))
    }

    pub fn command(&self, node_path: &str, command: &str, outcome: &str) -> Result<()> {
        self.record(
            OpEvent::Command,
            json!({ "node_path": node_path, "command": command, "outcome": outcome }),
        )
    }

    pub fn file_write(&self, node_path: &str, path: &str, bytes: usize) -> Result<()> {
        self.record(
            OpEvent::FileWrite,
            json!({ "node_path": node_path, "path": path, "bytes": bytes }),
        )
    }

    pub fn generation_call(&self, node_path: &str, files: usize) -> Result<()> {
        self.record(
            OpEvent::GenerationCall,
            json!({ "node_path": node_path, "files": files }),
        )
    }

    pub fn error(&self, node_path: &str, message: &str) -> Result<()> {
        self.record(
            OpEvent::Error,
            json!({ "node_path": node_path, "message": message }),
        )
    }
}

/// Read every record back (tests, diagnostics).
pub fn read_operation_log(path: &Path) -> Result<Vec<OpRecord>> {
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    contents
        .lines()
        .filter(|line| !line.trim().is_empty())
        .enumerate()
        .map(|(idx, line)| {
            serde_json::from_str(line)
                .with_context(|| format!("parse {} line {}", path.display(), idx + 1))
        })
        .collect()
}
