//! Cadence: staged orchestration of CLI agents
//!
//! Runs external command-line agents as a resumable workflow:
//! - **Stages** run one after another
//! - **Tasks** inside a stage run concurrently, one OS process each
//! - **Prompts** the agents print are detected, auto-answered when policy
//!   allows, or surfaced to a human
//! - **Sessions** record every status change so an interrupted run resumes
//!   at the last stage boundary
//!
//! # Architecture
//!
//! ```text
//! WorkflowExecutor ──▶ TaskRunner ──▶ Spawner (pty | headless)
//!        │                 │                 │ data / exit / error
//!        │                 ▼                 ▼
//!        │           OutputClassifier ◀── output chunks
//!        │                 │ detected prompt
//!        │                 ▼
//!        │           approval::resolve ──▶ write reply | interactionNeeded
//!        ▼
//!   SessionStore (atomic JSON snapshots)
//! ```

pub mod adapter;
pub mod approval;
pub mod catalog;
pub mod classifier;
pub mod config;
pub mod host;
pub mod process;
pub mod workflow;

// Re-exports for convenience
pub use adapter::{Adapter, AdapterRegistry, ExecutionMode, LaunchConfig};
pub use approval::{ApprovalHandler, AutoPolicy};
pub use catalog::{Catalog, CompiledPattern};
pub use classifier::OutputClassifier;
pub use config::Config;
pub use workflow::{
    EngineEvent, OrchestratorState, Session, SessionStore, TaskRunner, TaskStatus,
    WorkflowDefinition, WorkflowExecutor,
};

/// Crate-level error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid workflow definition: {0}")]
    Validation(String),

    #[error("Failed to launch task {task_id}: {message}")]
    Launch { task_id: String, message: String },

    #[error("Task {task_id} failed: {message}")]
    Runtime { task_id: String, message: String },

    #[error("Task {task_id} is {status}, not waiting for user input")]
    InteractionProtocol {
        task_id: String,
        status: workflow::TaskStatus,
    },

    #[error("Invalid pattern {name:?} for adapter {adapter}: {message}")]
    PatternLoad {
        adapter: String,
        name: String,
        message: String,
    },

    #[error("Failed to persist session {session_id}: {message}")]
    Persistence { session_id: String, message: String },

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Task {0} is already active")]
    TaskAlreadyActive(String),

    #[error("A workflow is already running on this executor")]
    WorkflowActive,

    #[error("Task {0} was stopped")]
    Stopped(String),

    #[error("Unknown task: {0}")]
    UnknownTask(String),

    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
