//! Workflow orchestration engine
//!
//! - **Definitions**: stages of tasks, loaded from TOML/YAML/JSON
//! - **Task runner**: one supervised process per task, prompt handling
//! - **Executor**: sequential stages, concurrent tasks, resume
//! - **State**: durable sessions with atomic snapshots
//! - **Events**: what hosts observe
//!
//! ## Running a workflow
//!
//! ```no_run
//! use std::sync::Arc;
//! use cadence::{AdapterRegistry, Catalog, SessionStore, TaskRunner, WorkflowDefinition, WorkflowExecutor};
//! use cadence::process::SystemSpawner;
//! use cadence::workflow::RunnerOptions;
//!
//! # async fn run() -> cadence::Result<()> {
//! let definition = WorkflowDefinition::load("workflow.toml".as_ref())?;
//! let runner = TaskRunner::new(
//!     AdapterRegistry::from_catalog(&Catalog::builtin()),
//!     Arc::new(SystemSpawner::default()),
//!     SessionStore::new(".cadence/default/sessions"),
//!     RunnerOptions::default(),
//! );
//! let session = WorkflowExecutor::new(runner).execute(definition).await?;
//! println!("{}", session.summary());
//! # Ok(())
//! # }
//! ```

pub mod definition;
pub mod events;
pub mod executor;
pub mod state;
pub mod task_runner;

pub use definition::{Stage, Task, WorkflowDefinition};
pub use events::{EngineEvent, ErrorKind, OrchestratorState};
pub use executor::WorkflowExecutor;
pub use state::{HistoryEntry, Session, SessionStore, TaskStatus};
pub use task_runner::{RunnerOptions, TaskRunner};
