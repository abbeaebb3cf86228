//! Shared test helpers: a scripted process spawner and event waiters

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use cadence::adapter::{Adapter, AdapterRegistry, ExecutionMode, LaunchConfig};
use cadence::approval::{ApprovalRequest, AutoPolicy};
use cadence::catalog::{AdapterSpec, Catalog, PatternSpec};
use cadence::process::{ProcessEvent, ProcessHandle, SpawnedProcess, Spawner};
use cadence::workflow::{
    EngineEvent, RunnerOptions, SessionStore, Stage, Task, TaskRunner, TaskStatus,
    WorkflowDefinition, WorkflowExecutor,
};
use cadence::{Error, Result};
use tempfile::TempDir;
use tokio::sync::{broadcast, mpsc};

/// Environment variable carrying the task id into scripted launches
pub const TASK_ENV: &str = "CADENCE_TASK";

const WAIT: Duration = Duration::from_secs(5);

/// Test side of one scripted process
#[derive(Clone)]
pub struct ScriptedProcess {
    pub task_id: String,
    pub mode: ExecutionMode,
    pub launch: LaunchConfig,
    events: mpsc::UnboundedSender<ProcessEvent>,
    writes: Arc<Mutex<Vec<String>>>,
    killed: Arc<AtomicBool>,
    broken_pipe: Arc<AtomicBool>,
}

impl ScriptedProcess {
    pub fn output(&self, text: &str) {
        let _ = self.events.send(ProcessEvent::data(text.as_bytes().to_vec()));
    }

    pub fn exit(&self, code: i32) {
        let _ = self.events.send(ProcessEvent::Exit {
            code: Some(code),
            signal: None,
        });
    }

    pub fn fail(&self, message: &str) {
        let _ = self.events.send(ProcessEvent::Error(message.to_string()));
    }

    pub fn writes(&self) -> Vec<String> {
        self.writes.lock().unwrap().clone()
    }

    pub fn killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }

    /// Make every later write fail while the process keeps running
    pub fn break_stdin(&self) {
        self.broken_pipe.store(true, Ordering::SeqCst);
    }

    /// Wait until `text` has been written to the process
    pub async fn expect_write(&self, text: &str) {
        let deadline = tokio::time::Instant::now() + WAIT;
        while !self.writes().iter().any(|w| w == text) {
            assert!(
                tokio::time::Instant::now() < deadline,
                "{} never received {:?}; got {:?}",
                self.task_id,
                text,
                self.writes()
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

struct ScriptedHandle {
    events: mpsc::UnboundedSender<ProcessEvent>,
    writes: Arc<Mutex<Vec<String>>>,
    killed: Arc<AtomicBool>,
    broken_pipe: Arc<AtomicBool>,
}

impl ProcessHandle for ScriptedHandle {
    fn write(&mut self, data: &[u8]) -> Result<()> {
        if self.killed.load(Ordering::SeqCst) || self.broken_pipe.load(Ordering::SeqCst) {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "process is gone",
            )));
        }
        self.writes
            .lock()
            .unwrap()
            .push(String::from_utf8_lossy(data).into_owned());
        Ok(())
    }

    fn resize(&mut self, _cols: u16, _rows: u16) -> Result<()> {
        Ok(())
    }

    fn kill(&mut self) -> Result<()> {
        if !self.killed.swap(true, Ordering::SeqCst) {
            let _ = self.events.send(ProcessEvent::Exit {
                code: None,
                signal: Some("SIGKILL".to_string()),
            });
        }
        Ok(())
    }

    fn pid(&self) -> Option<u32> {
        Some(4242)
    }
}

/// Spawner that hands every process to the test instead of the OS
pub struct ScriptedSpawner {
    spawned: mpsc::UnboundedSender<ScriptedProcess>,
    fail_commands: Vec<String>,
}

impl ScriptedSpawner {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ScriptedProcess>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                spawned: tx,
                fail_commands: Vec::new(),
            },
            rx,
        )
    }

    /// Make launches of `command` fail
    pub fn failing(mut self, command: &str) -> Self {
        self.fail_commands.push(command.to_string());
        self
    }
}

impl Spawner for ScriptedSpawner {
    fn spawn(&self, mode: ExecutionMode, launch: &LaunchConfig) -> Result<SpawnedProcess> {
        if self.fail_commands.contains(&launch.command) {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{}: command not found", launch.command),
            )));
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let writes = Arc::new(Mutex::new(Vec::new()));
        let killed = Arc::new(AtomicBool::new(false));
        let broken_pipe = Arc::new(AtomicBool::new(false));
        let task_id = launch.env.get(TASK_ENV).cloned().unwrap_or_default();

        let _ = self.spawned.send(ScriptedProcess {
            task_id,
            mode,
            launch: launch.clone(),
            events: events_tx.clone(),
            writes: Arc::clone(&writes),
            killed: Arc::clone(&killed),
            broken_pipe: Arc::clone(&broken_pipe),
        });

        Ok(SpawnedProcess {
            handle: Box::new(ScriptedHandle {
                events: events_tx,
                writes,
                killed,
                broken_pipe,
            }),
            events: events_rx,
        })
    }
}

/// Catalog with one scripted agent type, `agent`, detecting `[y/n]` prompts
pub fn test_catalog() -> Catalog {
    let mut catalog = Catalog::new();
    catalog.insert(
        "agent",
        AdapterSpec {
            command: "agent".to_string(),
            headless_args: vec!["--print".to_string(), "{prompt}".to_string()],
            auto_args: vec!["--yes".to_string()],
            patterns: vec![PatternSpec {
                name: "interaction_confirm".to_string(),
                description: Some("Yes/no confirmation".to_string()),
                regex: r"\[y/n\]".to_string(),
                case_sensitive: false,
            }],
            ..Default::default()
        },
    );
    catalog.insert(
        "broken",
        AdapterSpec {
            command: "missing-binary".to_string(),
            ..Default::default()
        },
    );
    catalog
}

/// Scripted engine over a temporary session directory
pub struct Harness {
    pub executor: Arc<WorkflowExecutor>,
    pub runner: TaskRunner,
    pub spawned: mpsc::UnboundedReceiver<ScriptedProcess>,
    pub store: SessionStore,
    pub dir: TempDir,
}

impl Harness {
    pub fn new(auto_approve: bool) -> Self {
        Self::with_registry(AdapterRegistry::from_catalog(&test_catalog()), auto_approve)
    }

    pub fn with_registry(registry: AdapterRegistry, auto_approve: bool) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let sessions = dir.path().join("sessions");
        Self::build(registry, auto_approve, dir, sessions)
    }

    /// Harness whose session directory sits below a regular file, so every
    /// snapshot write fails
    pub fn with_unwritable_store(auto_approve: bool) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, "not a directory").unwrap();
        let registry = AdapterRegistry::from_catalog(&test_catalog());
        Self::build(registry, auto_approve, dir, blocker.join("sessions"))
    }

    fn build(registry: AdapterRegistry, auto_approve: bool, dir: TempDir, sessions: PathBuf) -> Self {
        let (spawner, spawned) = ScriptedSpawner::new();
        let spawner = spawner.failing("missing-binary");
        let store = SessionStore::new(sessions);
        let runner = TaskRunner::new(
            registry,
            Arc::new(spawner),
            store.clone(),
            RunnerOptions {
                auto_approve,
                ..Default::default()
            },
        );

        Self {
            executor: Arc::new(WorkflowExecutor::new(runner.clone())),
            runner,
            spawned,
            store,
            dir,
        }
    }

    /// Start the workflow on a background task
    pub fn execute(
        &self,
        definition: WorkflowDefinition,
    ) -> tokio::task::JoinHandle<Result<cadence::Session>> {
        let executor = Arc::clone(&self.executor);
        tokio::spawn(async move { executor.execute(definition).await })
    }

    /// Next process the engine launched
    pub async fn next_process(&mut self) -> ScriptedProcess {
        tokio::time::timeout(WAIT, self.spawned.recv())
            .await
            .expect("timed out waiting for a process launch")
            .expect("spawner dropped")
    }

    /// Assert nothing else gets launched for a short while
    pub async fn expect_no_process(&mut self) {
        let next = tokio::time::timeout(Duration::from_millis(150), self.spawned.recv()).await;
        if let Ok(Some(process)) = next {
            panic!("unexpected launch of task {}", process.task_id);
        }
    }

    /// Wait until the runner reports `status` for `task_id`
    pub async fn wait_status(&self, task_id: &str, status: TaskStatus) {
        let deadline = tokio::time::Instant::now() + WAIT;
        loop {
            let current = self.runner.status(task_id).await;
            if current == status {
                return;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "task {} stuck at {}, expected {}",
                task_id,
                current,
                status
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

/// Interactive task on the scripted `agent` adapter
pub fn task(id: &str) -> Task {
    let mut task = Task::new(id, "agent");
    task.env.insert(TASK_ENV.to_string(), id.to_string());
    task
}

/// Workflow with one stage per entry
pub fn workflow(id: &str, stages: Vec<(&str, Vec<Task>)>) -> WorkflowDefinition {
    WorkflowDefinition {
        id: id.to_string(),
        goal: Some(format!("{} goal", id)),
        stages: stages
            .into_iter()
            .map(|(stage, tasks)| Stage {
                id: stage.to_string(),
                tasks,
            })
            .collect(),
    }
}

/// Receive events until one satisfies `matches`
pub async fn wait_for_event<F>(events: &mut broadcast::Receiver<EngineEvent>, mut matches: F) -> EngineEvent
where
    F: FnMut(&EngineEvent) -> bool,
{
    tokio::time::timeout(WAIT, async {
        loop {
            match events.recv().await {
                Ok(event) if matches(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Drain whatever events are already queued
pub fn drain(events: &mut broadcast::Receiver<EngineEvent>) -> Vec<EngineEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

/// Handler with no opinion on any prompt
pub fn decline(_: &ApprovalRequest<'_>) -> Result<Option<String>> {
    Ok(None)
}

/// Adapter answering through a fixed policy instead of its own
pub struct PolicyAdapter {
    inner: Box<dyn Adapter>,
    policy: AutoPolicy,
}

impl PolicyAdapter {
    pub fn new(inner: Box<dyn Adapter>, policy: AutoPolicy) -> Self {
        Self { inner, policy }
    }
}

/// Test registry whose `agent` adapter answers through `policy`
pub fn registry_with_policy(policy: AutoPolicy) -> AdapterRegistry {
    let catalog = test_catalog();
    let base = AdapterRegistry::from_catalog(&catalog);
    let mut registry = AdapterRegistry::from_catalog(&catalog);
    registry.register("agent", move || match base.create("agent") {
        Ok(inner) => Box::new(PolicyAdapter::new(inner, policy.clone())) as Box<dyn Adapter>,
        Err(e) => panic!("{}", e),
    });
    registry
}

impl Adapter for PolicyAdapter {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn launch_config(
        &self,
        mode: ExecutionMode,
        prompt: Option<&str>,
        extra_args: &[String],
    ) -> Result<LaunchConfig> {
        self.inner.launch_config(mode, prompt, extra_args)
    }

    fn patterns(&self) -> &[cadence::CompiledPattern] {
        self.inner.patterns()
    }

    fn auto_policy(&self) -> Option<&AutoPolicy> {
        Some(&self.policy)
    }
}
