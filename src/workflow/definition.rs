//! Workflow definitions: stages of concurrently running tasks
//!
//! ```toml
//! id = "feature-x"
//! goal = "Ship feature X"
//!
//! [[stages]]
//! id = "research"
//!
//! [[stages.tasks]]
//! id = "survey"
//! adapter = "claude"
//! mode = "headless"
//! prompt = "Summarise how auth works in this repo"
//!
//! [[stages]]
//! id = "implement"
//!
//! [[stages.tasks]]
//! id = "build"
//! adapter = "codex"
//! prompt = "Implement feature X"
//! keepAlive = true
//! ```

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use crate::adapter::ExecutionMode;
use crate::{Error, Result};

/// A complete workflow: ordered stages of tasks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct WorkflowDefinition {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goal: Option<String>,
    #[serde(default)]
    pub stages: Vec<Stage>,
}

/// Tasks that run concurrently
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Stage {
    pub id: String,
    #[serde(default)]
    pub tasks: Vec<Task>,
}

/// One unit of work bound to one agent process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Task {
    pub id: String,
    /// Adapter type key
    #[serde(alias = "type")]
    pub adapter: String,
    #[serde(default)]
    pub mode: ExecutionMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    /// Extra CLI arguments appended to the adapter's
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    /// Leave the process running after the task is marked complete
    #[serde(default, alias = "keep_alive")]
    pub keep_alive: bool,
}

impl Task {
    /// Minimal interactive task
    pub fn new(id: impl Into<String>, adapter: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            adapter: adapter.into(),
            mode: ExecutionMode::Interactive,
            prompt: None,
            args: Vec::new(),
            cwd: None,
            env: BTreeMap::new(),
            keep_alive: false,
        }
    }

    pub fn headless(mut self, prompt: impl Into<String>) -> Self {
        self.mode = ExecutionMode::Headless;
        self.prompt = Some(prompt.into());
        self
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = Some(prompt.into());
        self
    }

    pub fn keep_alive(mut self) -> Self {
        self.keep_alive = true;
        self
    }
}

impl WorkflowDefinition {
    /// Load a definition from TOML, YAML or JSON (chosen by extension)
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Ok(serde_json::from_str(&content)?),
            Some("yaml") | Some("yml") => Ok(serde_yaml::from_str(&content)?),
            Some("toml") => Ok(toml::from_str(&content)?),
            other => Err(Error::Validation(format!(
                "Unsupported workflow file type: {}",
                other.unwrap_or("(none)")
            ))),
        }
    }

    /// All tasks in stage order
    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.stages.iter().flat_map(|s| s.tasks.iter())
    }

    /// Structural checks that need no adapter registry
    pub fn validate(&self) -> Result<()> {
        if self.stages.is_empty() {
            return Err(Error::Validation(format!(
                "Workflow {} has no stages",
                self.id
            )));
        }

        let mut seen = HashSet::new();
        for (index, stage) in self.stages.iter().enumerate() {
            if stage.tasks.is_empty() {
                return Err(Error::Validation(format!(
                    "Stage {} ({}) has no tasks",
                    index, stage.id
                )));
            }

            for task in &stage.tasks {
                if task.id.trim().is_empty() {
                    return Err(Error::Validation(format!(
                        "Stage {} has a task without an id",
                        stage.id
                    )));
                }
                if !seen.insert(task.id.as_str()) {
                    return Err(Error::Validation(format!("Duplicate task id: {}", task.id)));
                }
                if task.mode == ExecutionMode::Headless
                    && task.prompt.as_deref().map_or(true, |p| p.trim().is_empty())
                {
                    return Err(Error::Validation(format!(
                        "Headless task {} requires a prompt",
                        task.id
                    )));
                }
            }
        }

        Ok(())
    }
}
