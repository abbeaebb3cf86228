//! Session state persistence
//!
//! A session is the durable record of one workflow run:
//! - Per-task status, logs, pending inputs and keep-alive flags
//! - Every input ever sent, in order
//! - The definition itself, so the run can be resumed
//!
//! Snapshots are JSON files written atomically (temp file + rename), so the
//! canonical file always holds one complete generation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;
use uuid::Uuid;

use super::definition::WorkflowDefinition;
use crate::{Config, Error, Result};

/// Log lines kept per task; older lines are dropped first
pub const MAX_LOG_LINES: usize = 2000;

/// Status of a single task
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// Not started yet
    #[default]
    Pending,
    /// Process running
    Running,
    /// Blocked on a human answer
    WaitingForUser,
    /// Finished
    Done,
    /// Failed to launch or crashed
    Error,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "PENDING"),
            TaskStatus::Running => write!(f, "RUNNING"),
            TaskStatus::WaitingForUser => write!(f, "WAITING_FOR_USER"),
            TaskStatus::Done => write!(f, "DONE"),
            TaskStatus::Error => write!(f, "ERROR"),
        }
    }
}

/// One input sent to a task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct HistoryEntry {
    pub task_id: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    /// Sent by an approval handler rather than a human
    #[serde(default)]
    pub auto: bool,
}

/// Durable record of a workflow run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Session {
    pub id: String,
    #[serde(default)]
    pub goal: Option<String>,
    pub start_time: DateTime<Utc>,
    /// Index of the first stage not yet completed
    pub current_stage_index: i64,
    #[serde(default)]
    pub task_status: BTreeMap<String, TaskStatus>,
    #[serde(default)]
    pub pending_inputs: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub keep_alive: BTreeMap<String, bool>,
    #[serde(default)]
    pub logs: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_definition: Option<WorkflowDefinition>,
}

impl Session {
    /// Create a fresh session
    pub fn new(id: impl Into<String>, goal: Option<String>) -> Self {
        Self {
            id: id.into(),
            goal,
            start_time: Utc::now(),
            current_stage_index: 0,
            task_status: BTreeMap::new(),
            pending_inputs: BTreeMap::new(),
            keep_alive: BTreeMap::new(),
            logs: BTreeMap::new(),
            history: Vec::new(),
            workflow_definition: None,
        }
    }

    /// Status of a task (PENDING if never seen)
    pub fn status(&self, task_id: &str) -> TaskStatus {
        self.task_status.get(task_id).copied().unwrap_or_default()
    }

    /// Set a task's status, returning the previous one
    pub fn set_status(&mut self, task_id: &str, status: TaskStatus) -> TaskStatus {
        self.task_status
            .insert(task_id.to_string(), status)
            .unwrap_or_default()
    }

    /// Append a chunk of clean output to a task's log.
    ///
    /// The chunk is split on CRLF, CR and LF; blank lines are dropped.
    pub fn append_log(&mut self, task_id: &str, chunk: &str) {
        let lines: Vec<String> = chunk
            .split(|c| c == '\r' || c == '\n')
            .filter(|line| !line.trim().is_empty())
            .map(str::to_string)
            .collect();
        if lines.is_empty() {
            return;
        }

        let log = self.logs.entry(task_id.to_string()).or_default();
        log.extend(lines);
        if log.len() > MAX_LOG_LINES {
            let excess = log.len() - MAX_LOG_LINES;
            log.drain(..excess);
        }
    }

    /// Record an input sent to a task
    pub fn record_input(&mut self, task_id: &str, text: &str, auto: bool) {
        self.history.push(HistoryEntry {
            task_id: task_id.to_string(),
            text: text.to_string(),
            timestamp: Utc::now(),
            auto,
        });
    }

    /// Queue input for delivery once the task is ready
    pub fn queue_input(&mut self, task_id: &str, text: &str) {
        self.pending_inputs
            .entry(task_id.to_string())
            .or_default()
            .push(text.to_string());
    }

    /// Remove and return a task's queued inputs
    pub fn take_pending(&mut self, task_id: &str) -> Vec<String> {
        self.pending_inputs.remove(task_id).unwrap_or_default()
    }

    /// Whether every task in `ids` is DONE
    pub fn all_done<'a>(&self, mut ids: impl Iterator<Item = &'a str>) -> bool {
        ids.all(|id| self.status(id) == TaskStatus::Done)
    }

    /// Human-readable progress summary
    pub fn summary(&self) -> String {
        let mut lines = vec![
            format!("Session: {}", self.id),
            format!("Started: {}", self.start_time.format("%Y-%m-%d %H:%M:%S UTC")),
        ];
        if let Some(goal) = &self.goal {
            lines.push(format!("Goal: {}", goal));
        }

        let total_stages = self
            .workflow_definition
            .as_ref()
            .map(|d| d.stages.len().to_string())
            .unwrap_or_else(|| "?".to_string());
        lines.push(format!(
            "Stage: {}/{}",
            self.current_stage_index.max(0),
            total_stages
        ));
        lines.push(String::new());
        lines.push("Tasks:".to_string());

        for (task_id, status) in &self.task_status {
            let icon = match status {
                TaskStatus::Pending => "⬜",
                TaskStatus::Running => "🔄",
                TaskStatus::WaitingForUser => "⏸️",
                TaskStatus::Done => "✅",
                TaskStatus::Error => "❌",
            };
            let lines_logged = self.logs.get(task_id).map_or(0, Vec::len);
            lines.push(format!(
                "  {} {}: {} ({} log lines)",
                icon, task_id, status, lines_logged
            ));
        }

        lines.push(String::new());
        lines.push(format!("Inputs sent: {}", self.history.len()));
        lines.join("\n")
    }
}

/// Reads and writes session snapshots under one directory
#[derive(Debug, Clone)]
pub struct SessionStore {
    dir: PathBuf,
}

impl SessionStore {
    /// Store rooted at `dir` (the `<baseDir>/<namespace>/sessions` directory)
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Store at the configured location
    pub fn from_config(config: &Config) -> Self {
        Self::new(config.sessions_dir())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Canonical snapshot path for a session id
    pub fn path(&self, id: &str) -> Result<PathBuf> {
        if id.is_empty()
            || id.starts_with('.')
            || id.contains(|c: char| c == '/' || c == '\\' || c.is_control())
        {
            return Err(Error::Validation(format!("Invalid session id: {:?}", id)));
        }
        Ok(self.dir.join(format!("{}.json", id)))
    }

    /// Fresh in-memory session (not yet persisted)
    pub fn create(&self, id: &str, goal: Option<String>) -> Session {
        Session::new(id, goal)
    }

    pub fn exists(&self, id: &str) -> bool {
        self.path(id).map(|p| p.exists()).unwrap_or(false)
    }

    /// Load and validate a snapshot
    pub fn load(&self, id: &str) -> Result<Session> {
        let path = self.path(id)?;
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::SessionNotFound(id.to_string()))
            }
            Err(e) => return Err(Error::Io(e)),
        };

        let session: Session =
            serde_json::from_str(&content).map_err(|e| Error::Persistence {
                session_id: id.to_string(),
                message: format!("invalid snapshot {}: {}", path.display(), e),
            })?;

        if session.id != id {
            return Err(Error::Persistence {
                session_id: id.to_string(),
                message: format!("snapshot {} holds session {}", path.display(), session.id),
            });
        }
        Ok(session)
    }

    /// Load the session if a snapshot exists, otherwise create it
    pub fn load_or_create(&self, id: &str, goal: Option<String>) -> Result<Session> {
        if self.exists(id) {
            self.load(id)
        } else {
            Ok(self.create(id, goal))
        }
    }

    /// Atomically write a snapshot (temp file, fsync, rename)
    pub fn persist(&self, session: &Session) -> Result<PathBuf> {
        let path = self.path(&session.id)?;
        let persistence = |message: String| Error::Persistence {
            session_id: session.id.clone(),
            message,
        };

        std::fs::create_dir_all(&self.dir)
            .map_err(|e| persistence(format!("create {}: {}", self.dir.display(), e)))?;

        let json = serde_json::to_vec_pretty(session)?;
        let tmp = self
            .dir
            .join(format!(".{}.{}.tmp", session.id, Uuid::new_v4()));

        let written = std::fs::File::create(&tmp).and_then(|mut file| {
            file.write_all(&json)?;
            file.sync_all()
        });
        if let Err(e) = written.and_then(|_| std::fs::rename(&tmp, &path)) {
            let _ = std::fs::remove_file(&tmp);
            return Err(persistence(format!("write {}: {}", path.display(), e)));
        }

        debug!("Persisted session {} to {}", session.id, path.display());
        Ok(path)
    }

    /// All readable sessions, newest first
    pub fn list(&self) -> Result<Vec<Session>> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::Io(e)),
        };

        let mut sessions = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().map_or(true, |ext| ext != "json") {
                continue;
            }
            let Some(id) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match self.load(id) {
                Ok(session) => sessions.push(session),
                Err(e) => debug!("Skipping unreadable session {}: {}", path.display(), e),
            }
        }

        sessions.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        Ok(sessions)
    }

    /// Delete a snapshot
    pub fn delete(&self, id: &str) -> Result<()> {
        match std::fs::remove_file(self.path(id)?) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::SessionNotFound(id.to_string()))
            }
            Err(e) => Err(Error::Io(e)),
        }
    }
}
