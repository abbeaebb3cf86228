//! Task runner: one supervised process per active task
//!
//! For every task the runner builds a launch configuration from the task's
//! adapter, spawns exactly one process and pumps its events:
//!
//! 1. Output is forwarded as `TaskOutput`, logged into the session and fed
//!    to the task's [`OutputClassifier`]
//! 2. Interaction states (and, for interactive tasks, confirmation
//!    heuristics) go through [`approval::resolve`]: either a reply is written
//!    straight back or the task parks in WAITING_FOR_USER
//! 3. Exit completes the task; a process error fails it
//!
//! All bookkeeping happens under one lock, so status changes, persistence
//! and classifier updates are applied one step at a time.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::definition::Task;
use super::events::{EngineEvent, ErrorKind, OrchestratorState};
use super::state::{Session, SessionStore, TaskStatus};
use crate::adapter::{
    Adapter, AdapterRegistry, AdapterSignal, ExecutionMode, InteractionPayload, LaunchConfig,
};
use crate::approval::{self, ApprovalRequest, Resolution};
use crate::classifier::OutputClassifier;
use crate::config::Config;
use crate::process::{ProcessEvent, ProcessEvents, ProcessHandle, Spawner};
use crate::{Error, Result};

const EVENT_CAPACITY: usize = 1024;

/// Lines of recent output included in an interaction payload
const PROMPT_EXCERPT_LINES: usize = 5;

/// Minimum spacing of snapshots written only for new log lines
const LOG_FLUSH_INTERVAL: Duration = Duration::from_secs(1);

/// Runner behaviour switches
#[derive(Debug, Clone)]
pub struct RunnerOptions {
    /// Let adapter policies answer prompts
    pub auto_approve: bool,
    /// Classifier buffer size per task, in bytes
    pub buffer_capacity: usize,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            auto_approve: false,
            buffer_capacity: 4096,
        }
    }
}

impl RunnerOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            auto_approve: config.auto_approve,
            buffer_capacity: config.classifier.buffer_capacity,
        }
    }
}

/// In-memory state of one active task
struct RunnerContext {
    process: Box<dyn ProcessHandle>,
    mode: ExecutionMode,
    adapter: Box<dyn Adapter>,
    classifier: OutputClassifier,
    prompt: Option<String>,
    prompt_dispatched: bool,
    heuristic_hit: Option<&'static str>,
    keep_alive: bool,
    generation: u64,
    completion: Option<oneshot::Sender<Result<()>>>,
}

/// A completed keep-alive task whose process is still running
struct Parked {
    process: Box<dyn ProcessHandle>,
    generation: u64,
}

#[derive(Default)]
struct Core {
    session: Option<Session>,
    contexts: HashMap<String, RunnerContext>,
    parked: HashMap<String, Parked>,
    state: OrchestratorState,
    failed: bool,
    next_generation: u64,
    reported_patterns: HashSet<String>,
    logs_flushed: Option<Instant>,
}

struct Shared {
    registry: AdapterRegistry,
    spawner: Arc<dyn Spawner>,
    store: SessionStore,
    options: RunnerOptions,
    events: broadcast::Sender<EngineEvent>,
    core: Mutex<Core>,
}

/// Runs tasks and owns their processes
#[derive(Clone)]
pub struct TaskRunner {
    shared: Arc<Shared>,
}

impl TaskRunner {
    pub fn new(
        registry: AdapterRegistry,
        spawner: Arc<dyn Spawner>,
        store: SessionStore,
        options: RunnerOptions,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                registry,
                spawner,
                store,
                options,
                events,
                core: Mutex::new(Core::default()),
            }),
        }
    }

    /// Receive engine events from now on
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.shared.events.subscribe()
    }

    pub fn registry(&self) -> &AdapterRegistry {
        &self.shared.registry
    }

    pub fn store(&self) -> &SessionStore {
        &self.shared.store
    }

    pub fn options(&self) -> &RunnerOptions {
        &self.shared.options
    }

    /// Make `session` the one all task bookkeeping goes to, and persist it
    pub async fn attach_session(&self, session: Session) {
        let mut core = self.shared.core.lock().await;
        self.shared.persist(&session);
        core.session = Some(session);
    }

    /// Snapshot of the attached session
    pub async fn session(&self) -> Option<Session> {
        self.shared.core.lock().await.session.clone()
    }

    pub async fn status(&self, task_id: &str) -> TaskStatus {
        let core = self.shared.core.lock().await;
        core.session
            .as_ref()
            .map_or(TaskStatus::Pending, |s| s.status(task_id))
    }

    /// Current aggregate state
    pub async fn state(&self) -> OrchestratorState {
        self.shared.core.lock().await.state
    }

    /// Ids of tasks with a live context, sorted
    pub async fn active_tasks(&self) -> Vec<String> {
        let core = self.shared.core.lock().await;
        let mut ids: Vec<String> = core.contexts.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Run a task until its process exits, it is completed manually, or it
    /// fails. Stopping the task resolves to [`Error::Stopped`].
    pub async fn run_task(&self, task: &Task, stage_index: usize) -> Result<()> {
        let done = self.shared.start(task, stage_index).await?;
        match done.await {
            Ok(result) => result,
            Err(_) => Err(Error::Stopped(task.id.clone())),
        }
    }

    /// Answer a task that is waiting for user input
    pub async fn submit_interaction(&self, task_id: &str, text: &str) -> Result<()> {
        let mut guard = self.shared.core.lock().await;
        let core = &mut *guard;

        let Some(session) = core.session.as_mut() else {
            return Err(Error::UnknownTask(task_id.to_string()));
        };
        let status = session.status(task_id);
        let Some(ctx) = core.contexts.get_mut(task_id) else {
            return if session.task_status.contains_key(task_id) {
                Err(Error::InteractionProtocol {
                    task_id: task_id.to_string(),
                    status,
                })
            } else {
                Err(Error::UnknownTask(task_id.to_string()))
            };
        };
        if ctx.mode == ExecutionMode::Headless || status != TaskStatus::WaitingForUser {
            return Err(Error::InteractionProtocol {
                task_id: task_id.to_string(),
                status,
            });
        }

        let text = approval::normalize_input(text);
        ctx.process.write(text.as_bytes())?;
        session.record_input(task_id, &text, false);
        ctx.classifier.acknowledge();
        info!("Task {} answered by user", task_id);

        self.shared.update_status(session, task_id, TaskStatus::Running);
        self.shared.refresh_state(core);
        Ok(())
    }

    /// Resize an interactive task's terminal
    pub async fn resize(&self, task_id: &str, cols: u16, rows: u16) -> Result<()> {
        let mut core = self.shared.core.lock().await;
        let ctx = core
            .contexts
            .get_mut(task_id)
            .ok_or_else(|| Error::UnknownTask(task_id.to_string()))?;
        ctx.process.resize(cols, rows)
    }

    /// Mark an interactive task DONE.
    ///
    /// The process is killed unless the task is keep-alive, in which case
    /// it keeps running (output still forwarded) until it exits or
    /// [`shutdown`](Self::shutdown).
    pub async fn complete_task(&self, task_id: &str) -> Result<()> {
        let mut guard = self.shared.core.lock().await;
        let core = &mut *guard;

        match core.contexts.get(task_id) {
            None => return Err(Error::UnknownTask(task_id.to_string())),
            Some(ctx) if ctx.mode == ExecutionMode::Headless => {
                return Err(Error::Unsupported(format!(
                    "headless task {} completes when its process exits",
                    task_id
                )))
            }
            Some(_) => {}
        }
        let Some(mut ctx) = core.contexts.remove(task_id) else {
            return Err(Error::UnknownTask(task_id.to_string()));
        };

        let completion = ctx.completion.take();
        if ctx.keep_alive {
            info!("Task {} complete, keeping its process alive", task_id);
            core.parked.insert(
                task_id.to_string(),
                Parked {
                    process: ctx.process,
                    generation: ctx.generation,
                },
            );
        } else {
            info!("Task {} complete", task_id);
            if let Err(e) = ctx.process.kill() {
                warn!("Failed to stop task {}: {}", task_id, e);
            }
        }

        if let Some(session) = core.session.as_mut() {
            self.shared.update_status(session, task_id, TaskStatus::Done);
        }
        if let Some(done) = completion {
            let _ = done.send(Ok(()));
        }
        self.shared.refresh_state(core);
        Ok(())
    }

    /// Queue input for a task.
    ///
    /// Delivered right after the initial prompt, or immediately if the task
    /// is already running and past that point.
    pub async fn queue_input(&self, task_id: &str, text: &str) -> Result<()> {
        let mut guard = self.shared.core.lock().await;
        let core = &mut *guard;
        let Some(session) = core.session.as_mut() else {
            return Err(Error::UnknownTask(task_id.to_string()));
        };

        match core.contexts.get_mut(task_id) {
            Some(ctx) if ctx.mode == ExecutionMode::Interactive && ctx.prompt_dispatched => {
                self.shared.send_input(session, ctx, task_id, text, false);
            }
            _ => session.queue_input(task_id, text),
        }
        self.shared.persist(session);
        Ok(())
    }

    /// Stop the given tasks; their `run_task` calls resolve to `Stopped`
    pub async fn stop_tasks(&self, task_ids: &[String]) {
        let mut guard = self.shared.core.lock().await;
        let core = &mut *guard;
        if let Some(session) = &core.session {
            self.shared.persist(session);
        }
        for task_id in task_ids {
            if let Some(ctx) = core.contexts.remove(task_id) {
                Shared::teardown(task_id, ctx);
            }
        }
        self.shared.refresh_state(core);
    }

    /// Persist, then tear down every active task. Statuses are left as they
    /// are so a later resume restarts the tasks.
    pub async fn stop_all(&self) {
        let mut guard = self.shared.core.lock().await;
        let core = &mut *guard;
        if let Some(session) = &core.session {
            self.shared.persist(session);
        }
        if !core.contexts.is_empty() {
            info!("Stopping {} active task(s)", core.contexts.len());
        }
        for (task_id, ctx) in core.contexts.drain() {
            Shared::teardown(&task_id, ctx);
        }
        self.shared.refresh_state(core);
    }

    /// Stop everything, including kept-alive processes
    pub async fn shutdown(&self) {
        self.stop_all().await;
        let mut core = self.shared.core.lock().await;
        for (task_id, mut parked) in core.parked.drain() {
            debug!("Killing kept-alive process of task {}", task_id);
            if let Err(e) = parked.process.kill() {
                warn!("Failed to stop task {}: {}", task_id, e);
            }
        }
    }

    /// Clear the failure latch (start and end of a workflow)
    pub(crate) async fn clear_failure(&self) {
        let mut core = self.shared.core.lock().await;
        core.failed = false;
        self.shared.refresh_state(&mut core);
    }

    /// Latch the aggregate state to ERROR until the next workflow
    pub(crate) async fn mark_failed(&self) {
        let mut core = self.shared.core.lock().await;
        core.failed = true;
        if let Some(session) = &core.session {
            self.shared.persist(session);
        }
        self.shared.refresh_state(&mut core);
    }

    /// Record that stages before `index` are complete
    pub(crate) async fn advance_stage(&self, index: usize) {
        let mut core = self.shared.core.lock().await;
        if let Some(session) = core.session.as_mut() {
            session.current_stage_index = index as i64;
            self.shared.persist(session);
        }
    }
}

impl Shared {
    fn emit(&self, event: EngineEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// Write a snapshot; failures are reported, never fatal
    fn persist(&self, session: &Session) {
        if let Err(e) = self.store.persist(session) {
            warn!("{}", e);
            self.emit(EngineEvent::Error {
                kind: ErrorKind::Persistence,
                task_id: None,
                message: e.to_string(),
            });
        }
    }

    fn update_status(&self, session: &mut Session, task_id: &str, status: TaskStatus) {
        let previous = session.set_status(task_id, status);
        self.persist(session);
        if previous != status {
            debug!("Task {}: {} -> {}", task_id, previous, status);
            self.emit(EngineEvent::TaskStatusChange {
                task_id: task_id.to_string(),
                status,
                session: Arc::new(session.clone()),
            });
        }
    }

    /// Recompute the aggregate state and announce changes
    fn refresh_state(&self, core: &mut Core) {
        let next = if core.failed {
            OrchestratorState::Error
        } else {
            let session = core.session.as_ref();
            OrchestratorState::aggregate(
                core.contexts
                    .keys()
                    .map(|id| session.map_or(TaskStatus::Pending, |s| s.status(id))),
            )
        };
        if next == core.state {
            return;
        }

        let from = std::mem::replace(&mut core.state, next);
        debug!("Orchestrator: {} -> {}", from, next);
        if let Some(session) = &core.session {
            self.emit(EngineEvent::StateChange {
                from,
                to: next,
                session: Arc::new(session.clone()),
            });
        }
    }

    /// Write normalised input to a task and record it; false if the write failed
    fn send_input(
        &self,
        session: &mut Session,
        ctx: &mut RunnerContext,
        task_id: &str,
        text: &str,
        auto: bool,
    ) -> bool {
        let text = approval::normalize_input(text);
        match ctx.process.write(text.as_bytes()) {
            Ok(()) => {
                session.record_input(task_id, &text, auto);
                true
            }
            Err(e) => {
                warn!("Failed to write to task {}: {}", task_id, e);
                self.emit(EngineEvent::Error {
                    kind: ErrorKind::Input,
                    task_id: Some(task_id.to_string()),
                    message: e.to_string(),
                });
                false
            }
        }
    }

    fn teardown(task_id: &str, mut ctx: RunnerContext) {
        debug!("Tearing down task {}", task_id);
        if let Err(e) = ctx.process.kill() {
            warn!("Failed to stop task {}: {}", task_id, e);
        }
        // Dropping the completion resolves run_task with Stopped
    }

    async fn start(
        self: &Arc<Self>,
        task: &Task,
        stage_index: usize,
    ) -> Result<oneshot::Receiver<Result<()>>> {
        let mut guard = self.core.lock().await;
        let core = &mut *guard;

        if core.contexts.contains_key(&task.id) {
            return Err(Error::TaskAlreadyActive(task.id.clone()));
        }
        if core.session.is_none() {
            return Err(Error::Unsupported(
                "no session attached to the task runner".to_string(),
            ));
        }

        let mut adapter = self.registry.create(&task.adapter)?;
        if !adapter.supports(task.mode) {
            return Err(Error::Validation(format!(
                "Adapter {} does not support {} mode (task {})",
                task.adapter, task.mode, task.id
            )));
        }
        if core.reported_patterns.insert(task.adapter.clone()) {
            for message in self.registry.pattern_errors(&task.adapter) {
                self.emit(EngineEvent::Error {
                    kind: ErrorKind::PatternLoad,
                    task_id: None,
                    message: message.clone(),
                });
            }
        }

        let spawned = build_launch(adapter.as_ref(), task, self.options.auto_approve)
            .and_then(|launch| {
                debug!("Launching task {}: {} {:?}", task.id, launch.command, launch.args);
                self.spawner.spawn(task.mode, &launch)
            });
        let spawned = match spawned {
            Ok(spawned) => spawned,
            Err(e) => {
                let message = e.to_string();
                error!("Failed to launch task {}: {}", task.id, message);
                core.failed = true;
                if let Some(session) = core.session.as_mut() {
                    self.update_status(session, &task.id, TaskStatus::Error);
                }
                self.emit(EngineEvent::Error {
                    kind: ErrorKind::Launch,
                    task_id: Some(task.id.clone()),
                    message: message.clone(),
                });
                self.refresh_state(core);
                return Err(Error::Launch {
                    task_id: task.id.clone(),
                    message,
                });
            }
        };

        // A restarted task supersedes its kept-alive predecessor
        if let Some(mut parked) = core.parked.remove(&task.id) {
            if let Err(e) = parked.process.kill() {
                debug!("Kept-alive process of task {} already gone: {}", task.id, e);
            }
        }

        let generation = core.next_generation;
        core.next_generation += 1;
        let signals = adapter.take_signals();
        let classifier =
            OutputClassifier::new(adapter.patterns().to_vec(), self.options.buffer_capacity);
        let pid = spawned.handle.pid();
        let (done_tx, done_rx) = oneshot::channel();

        core.contexts.insert(
            task.id.clone(),
            RunnerContext {
                process: spawned.handle,
                mode: task.mode,
                adapter,
                classifier,
                prompt: task.prompt.clone(),
                prompt_dispatched: false,
                heuristic_hit: None,
                keep_alive: task.keep_alive,
                generation,
                completion: Some(done_tx),
            },
        );
        if let Some(session) = core.session.as_mut() {
            session.keep_alive.insert(task.id.clone(), task.keep_alive);
            self.update_status(session, &task.id, TaskStatus::Running);
        }
        self.refresh_state(core);

        info!(
            "Task {} started (stage {}, {} mode, adapter {}, pid {:?})",
            task.id, stage_index, task.mode, task.adapter, pid
        );
        tokio::spawn(pump(
            Arc::clone(self),
            task.id.clone(),
            generation,
            spawned.events,
            signals,
        ));
        Ok(done_rx)
    }

    async fn on_process_event(&self, task_id: &str, generation: u64, event: ProcessEvent) {
        let mut guard = self.core.lock().await;
        let core = &mut *guard;

        let active = core
            .contexts
            .get(task_id)
            .map_or(false, |ctx| ctx.generation == generation);
        if !active {
            let parked = core
                .parked
                .get(task_id)
                .map_or(false, |p| p.generation == generation);
            if parked {
                match event {
                    ProcessEvent::Data { raw, clean } => self.emit(EngineEvent::TaskOutput {
                        task_id: task_id.to_string(),
                        raw,
                        clean,
                    }),
                    _ => {
                        info!("Kept-alive process of task {} ended", task_id);
                        core.parked.remove(task_id);
                    }
                }
            }
            return;
        }

        match event {
            ProcessEvent::Data { raw, clean } => self.on_output(core, task_id, raw, clean),
            ProcessEvent::Exit { code, signal } => self.on_exit(core, task_id, code, signal),
            ProcessEvent::Error(message) => self.on_failure(core, task_id, message),
        }
        self.refresh_state(core);
    }

    async fn on_adapter_signal(&self, task_id: &str, generation: u64, signal: AdapterSignal) {
        let mut guard = self.core.lock().await;
        let core = &mut *guard;

        let Core {
            session: Some(session),
            contexts,
            ..
        } = core
        else {
            return;
        };
        let Some(ctx) = contexts.get_mut(task_id) else {
            return;
        };
        if ctx.generation != generation {
            return;
        }

        match signal {
            AdapterSignal::StateChange(state) => {
                debug!("Task {} adapter state: {}", task_id, state);
                self.emit(EngineEvent::TaskStateDetected {
                    task_id: task_id.to_string(),
                    state,
                });
            }
            AdapterSignal::InteractionNeeded(payload) => {
                self.on_interaction(session, ctx, task_id, payload);
            }
        }
        self.refresh_state(core);
    }

    fn on_output(&self, core: &mut Core, task_id: &str, raw: Vec<u8>, clean: String) {
        let Core {
            session: Some(session),
            contexts,
            logs_flushed,
            ..
        } = core
        else {
            return;
        };
        let Some(ctx) = contexts.get_mut(task_id) else {
            return;
        };

        ctx.adapter.on_raw_output(&raw);
        ctx.adapter.on_clean_output(&clean);
        session.append_log(task_id, &clean);
        self.emit(EngineEvent::TaskOutput {
            task_id: task_id.to_string(),
            raw,
            clean: clean.clone(),
        });

        let mut dispatched = false;
        if ctx.mode == ExecutionMode::Interactive && !ctx.prompt_dispatched {
            ctx.prompt_dispatched = true;
            dispatched = true;
            if let Some(prompt) = ctx.prompt.clone() {
                debug!("Sending initial prompt to task {}", task_id);
                self.send_input(session, ctx, task_id, &prompt, false);
            }
            for text in session.take_pending(task_id) {
                self.send_input(session, ctx, task_id, &text, false);
            }
        }

        let mut detected = None;
        if let Some(transition) = ctx.classifier.push(&clean) {
            debug!(
                "Task {} state {:?} -> {}",
                task_id, transition.previous, transition.state
            );
            self.emit(EngineEvent::TaskStateDetected {
                task_id: task_id.to_string(),
                state: transition.state.clone(),
            });
            if transition.is_interaction() {
                detected = Some(InteractionPayload {
                    prompt: Some(transition.excerpt.clone()),
                    context: Some(json!({
                        "source": "classifier",
                        "state": transition.state,
                        "description": transition.description,
                    })),
                });
            }
        }

        // Heuristics stay quiet while an answered prompt is being redrawn
        if detected.is_none()
            && ctx.mode == ExecutionMode::Interactive
            && ctx.classifier.answered().is_none()
        {
            match approval::heuristic_prompt(&clean) {
                Some(phrase) if ctx.heuristic_hit != Some(phrase) => {
                    ctx.heuristic_hit = Some(phrase);
                    let excerpt = if ctx.classifier.is_enabled() {
                        ctx.classifier.tail(PROMPT_EXCERPT_LINES)
                    } else {
                        clean.trim().to_string()
                    };
                    detected = Some(InteractionPayload {
                        prompt: Some(excerpt),
                        context: Some(json!({ "source": "heuristic", "phrase": phrase })),
                    });
                }
                Some(_) => {}
                None if !clean.trim().is_empty() => ctx.heuristic_hit = None,
                None => {}
            }
        }

        // Log lines alone are flushed at most once per interval; status
        // changes and replies persist on their own
        let flush_due = logs_flushed.map_or(true, |at| at.elapsed() >= LOG_FLUSH_INTERVAL);
        if dispatched || flush_due {
            self.persist(session);
            *logs_flushed = Some(Instant::now());
        }
        if let Some(payload) = detected {
            self.on_interaction(session, ctx, task_id, payload);
        }
    }

    /// Resolve a detected prompt: auto-answer it or wait for the user
    fn on_interaction(
        &self,
        session: &mut Session,
        ctx: &mut RunnerContext,
        task_id: &str,
        payload: InteractionPayload,
    ) {
        let status = session.status(task_id);
        if status == TaskStatus::WaitingForUser {
            debug!("Task {} already waiting, ignoring prompt", task_id);
            return;
        }
        if ctx.mode == ExecutionMode::Headless {
            debug!("Headless task {} printed a prompt, ignoring", task_id);
            return;
        }

        let (resolution, failures) = {
            let request = ApprovalRequest {
                task_id,
                adapter: ctx.adapter.name(),
                payload: &payload,
            };
            approval::resolve(
                self.options.auto_approve,
                ctx.adapter.auto_policy(),
                &request,
            )
        };
        for failure in failures {
            warn!(
                "Approval handler {} failed for task {}: {}",
                failure.handler, task_id, failure.message
            );
            self.emit(EngineEvent::Error {
                kind: ErrorKind::Handler,
                task_id: Some(task_id.to_string()),
                message: format!("handler {} failed: {}", failure.handler, failure.message),
            });
        }

        if let Resolution::Respond { text, handler } = resolution {
            if self.send_input(session, ctx, task_id, &text, true) {
                info!("Auto-answered task {} with {:?} ({})", task_id, text, handler);
                ctx.classifier.acknowledge();
                if status != TaskStatus::Running {
                    self.update_status(session, task_id, TaskStatus::Running);
                } else {
                    self.persist(session);
                }
                return;
            }
            warn!("Auto-answer for task {} was not delivered", task_id);
        }

        info!("Task {} is waiting for user input", task_id);
        self.update_status(session, task_id, TaskStatus::WaitingForUser);
        self.emit(EngineEvent::InteractionNeeded {
            task_id: task_id.to_string(),
            payload,
        });
    }

    fn on_exit(&self, core: &mut Core, task_id: &str, code: Option<i32>, signal: Option<String>) {
        let Some(mut ctx) = core.contexts.remove(task_id) else {
            return;
        };
        ctx.adapter.on_exit(code, signal.as_deref());
        match (code, &signal) {
            (Some(0), _) => info!("Task {} finished", task_id),
            (Some(code), _) => warn!("Task {} exited with code {}", task_id, code),
            (None, Some(signal)) => warn!("Task {} terminated by {}", task_id, signal),
            (None, None) => warn!("Task {} exited without a status", task_id),
        }

        if let Some(session) = core.session.as_mut() {
            if session.status(task_id) != TaskStatus::Error {
                self.update_status(session, task_id, TaskStatus::Done);
            }
        }
        if let Some(done) = ctx.completion.take() {
            let _ = done.send(Ok(()));
        }
    }

    fn on_failure(&self, core: &mut Core, task_id: &str, message: String) {
        let Some(mut ctx) = core.contexts.remove(task_id) else {
            return;
        };
        error!("Task {} failed: {}", task_id, message);
        ctx.adapter.on_error(&message);
        if let Err(e) = ctx.process.kill() {
            debug!("Failed task {} already stopped: {}", task_id, e);
        }

        core.failed = true;
        if let Some(session) = core.session.as_mut() {
            self.update_status(session, task_id, TaskStatus::Error);
        }
        self.emit(EngineEvent::Error {
            kind: ErrorKind::Runtime,
            task_id: Some(task_id.to_string()),
            message: message.clone(),
        });
        if let Some(done) = ctx.completion.take() {
            let _ = done.send(Err(Error::Runtime {
                task_id: task_id.to_string(),
                message,
            }));
        }
    }
}

/// Launch configuration for `task`: headless tasks bake in the prompt,
/// interactive tasks get the policy's extra arguments when auto-approving
fn build_launch(adapter: &dyn Adapter, task: &Task, auto_approve: bool) -> Result<LaunchConfig> {
    let mut extra_args = task.args.clone();

    let mut launch = match task.mode {
        ExecutionMode::Headless => {
            let prompt = task.prompt.as_deref().unwrap_or_default();
            match adapter.headless_launch_config(prompt, &extra_args) {
                Some(launch) => launch?,
                None => adapter.launch_config(ExecutionMode::Headless, Some(prompt), &extra_args)?,
            }
        }
        ExecutionMode::Interactive => {
            if auto_approve {
                if let Some(policy) = adapter.auto_policy() {
                    extra_args.extend(policy.extra_args.iter().cloned());
                }
            }
            adapter.launch_config(ExecutionMode::Interactive, task.prompt.as_deref(), &extra_args)?
        }
    };

    if let Some(cwd) = &task.cwd {
        launch.cwd = Some(cwd.clone());
    }
    launch
        .env
        .extend(task.env.iter().map(|(k, v)| (k.clone(), v.clone())));
    Ok(launch)
}

/// Forward one process's events (and its adapter's signals) to the runner
async fn pump(
    shared: Arc<Shared>,
    task_id: String,
    generation: u64,
    mut events: ProcessEvents,
    mut signals: Option<mpsc::UnboundedReceiver<AdapterSignal>>,
) {
    loop {
        tokio::select! {
            event = events.recv() => {
                let event = event.unwrap_or_else(|| {
                    ProcessEvent::Error("process event stream closed".to_string())
                });
                let terminal = event.is_terminal();
                shared.on_process_event(&task_id, generation, event).await;
                if terminal {
                    break;
                }
            }
            signal = next_signal(&mut signals) => match signal {
                Some(signal) => shared.on_adapter_signal(&task_id, generation, signal).await,
                None => signals = None,
            },
        }
    }
    debug!("Event pump for task {} finished", task_id);
}

async fn next_signal(
    signals: &mut Option<mpsc::UnboundedReceiver<AdapterSignal>>,
) -> Option<AdapterSignal> {
    match signals {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
