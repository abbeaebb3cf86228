//! Workflow executor
//!
//! Runs stages in order and the tasks of a stage concurrently. Progress is
//! persisted at every stage boundary, so an interrupted run resumes at the
//! first stage that has not fully completed.

use std::sync::atomic::{AtomicBool, Ordering};

use futures::future::try_join_all;
use tokio::sync::broadcast;
use tracing::{error, info};

use super::definition::WorkflowDefinition;
use super::events::EngineEvent;
use super::state::{Session, TaskStatus};
use super::task_runner::TaskRunner;
use crate::{Error, Result};

/// Sequences stages over a [`TaskRunner`]; one workflow at a time
pub struct WorkflowExecutor {
    runner: TaskRunner,
    active: AtomicBool,
}

/// Clears the active flag when a run ends, however it ends
struct ActiveGuard<'a>(&'a AtomicBool);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl WorkflowExecutor {
    pub fn new(runner: TaskRunner) -> Self {
        Self {
            runner,
            active: AtomicBool::new(false),
        }
    }

    pub fn runner(&self) -> &TaskRunner {
        &self.runner
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.runner.subscribe()
    }

    /// Check a definition against structure rules and the adapter registry
    pub fn validate(&self, definition: &WorkflowDefinition) -> Result<()> {
        definition.validate()?;

        let registry = self.runner.registry();
        for task in definition.tasks() {
            let adapter = registry.create(&task.adapter).map_err(|_| {
                Error::Validation(format!(
                    "Task {} uses unregistered adapter type {}",
                    task.id, task.adapter
                ))
            })?;
            if !adapter.supports(task.mode) {
                return Err(Error::Validation(format!(
                    "Adapter {} does not support {} mode (task {})",
                    task.adapter, task.mode, task.id
                )));
            }
        }
        Ok(())
    }

    /// Execute a workflow under a session named after the definition.
    ///
    /// An existing session with that id is resumed.
    pub async fn execute(&self, definition: WorkflowDefinition) -> Result<Session> {
        let session_id = definition.id.clone();
        self.execute_as(definition, &session_id).await
    }

    /// Resume a stored session using the definition saved in it
    pub async fn resume(&self, session_id: &str) -> Result<Session> {
        let session = self.runner.store().load(session_id)?;
        let definition = session.workflow_definition.ok_or_else(|| {
            Error::Validation(format!(
                "Session {} has no stored workflow definition",
                session_id
            ))
        })?;
        self.execute_as(definition, session_id).await
    }

    /// Execute a workflow under an explicit session id
    pub async fn execute_as(
        &self,
        definition: WorkflowDefinition,
        session_id: &str,
    ) -> Result<Session> {
        if self.active.swap(true, Ordering::SeqCst) {
            return Err(Error::WorkflowActive);
        }
        let _guard = ActiveGuard(&self.active);
        if !self.runner.active_tasks().await.is_empty() {
            return Err(Error::WorkflowActive);
        }

        self.validate(&definition)?;

        let store = self.runner.store();
        let mut session = store.load_or_create(session_id, definition.goal.clone())?;
        session.goal = definition.goal.clone();
        for task in definition.tasks() {
            session.task_status.entry(task.id.clone()).or_default();
        }
        session.workflow_definition = Some(definition.clone());

        let start = session.current_stage_index.max(0) as usize;
        info!(
            "Executing workflow {} as session {} from stage {}/{}",
            definition.id,
            session.id,
            start,
            definition.stages.len()
        );
        self.runner.attach_session(session).await;
        self.runner.clear_failure().await;

        for (index, stage) in definition.stages.iter().enumerate().skip(start) {
            let pending: Vec<_> = {
                let mut pending = Vec::new();
                for task in &stage.tasks {
                    if self.runner.status(&task.id).await != TaskStatus::Done {
                        pending.push(task);
                    }
                }
                pending
            };

            if pending.is_empty() {
                info!("Stage {} ({}) already complete, skipping", index, stage.id);
            } else {
                info!(
                    "Stage {} ({}): starting {} task(s)",
                    index,
                    stage.id,
                    pending.len()
                );
                let runs = pending.iter().map(|task| self.runner.run_task(task, index));
                if let Err(e) = try_join_all(runs).await {
                    error!("Stage {} ({}) failed: {}", index, stage.id, e);
                    let ids: Vec<String> = stage.tasks.iter().map(|t| t.id.clone()).collect();
                    self.runner.stop_tasks(&ids).await;
                    self.runner.mark_failed().await;
                    return Err(e);
                }
            }

            self.runner.advance_stage(index + 1).await;
        }

        info!("Workflow {} complete", definition.id);
        self.runner.clear_failure().await;
        self.runner
            .session()
            .await
            .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))
    }
}
