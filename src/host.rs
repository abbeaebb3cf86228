//! Console host: signal handling and a terminal front end for the engine
//!
//! The engine never installs OS signal handlers itself. A host that wants
//! Ctrl+C to stop the workflow installs a [`SignalHandler`], which calls the
//! runner's explicit `shutdown()`.

use std::collections::VecDeque;
use std::io::{BufRead, Write};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::workflow::{EngineEvent, TaskRunner, TaskStatus};
use crate::{Error, Result};

/// What a Ctrl+C press should do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptAction {
    /// Stop all tasks and persist the session
    Shutdown,
    /// Second press within the grace window: exit now
    ForceExit,
}

/// Ctrl+C handling for console hosts
#[derive(Debug, Clone, Default)]
pub struct SignalHandler {
    /// Set on the first Ctrl+C
    interrupted: Arc<AtomicBool>,
    /// Presses within the grace window
    interrupt_count: Arc<AtomicUsize>,
}

impl SignalHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the process-wide Ctrl+C handler.
    ///
    /// The first press shuts the runner down (tasks stopped, session
    /// persisted); a second press within two seconds exits immediately.
    /// Must be called from within a tokio runtime.
    pub fn install(&self, runner: TaskRunner) -> Result<()> {
        let handler = self.clone();
        let runtime = tokio::runtime::Handle::current();

        ctrlc::set_handler(move || match handler.on_interrupt() {
            InterruptAction::Shutdown => {
                info!("Interrupt received, stopping tasks (press Ctrl+C again to force)");
                let runner = runner.clone();
                runtime.spawn(async move { runner.shutdown().await });

                let count = handler.interrupt_count.clone();
                std::thread::spawn(move || {
                    std::thread::sleep(std::time::Duration::from_secs(2));
                    count.store(0, Ordering::SeqCst);
                });
            }
            InterruptAction::ForceExit => {
                warn!("Second interrupt received, exiting");
                std::process::exit(130);
            }
        })
        .map_err(|e| Error::Config(format!("Failed to set signal handler: {}", e)))?;

        Ok(())
    }

    /// Record one interrupt and decide what to do about it
    pub fn on_interrupt(&self) -> InterruptAction {
        let count = self.interrupt_count.fetch_add(1, Ordering::SeqCst);
        self.interrupted.store(true, Ordering::SeqCst);
        if count == 0 {
            InterruptAction::Shutdown
        } else {
            InterruptAction::ForceExit
        }
    }

    /// Whether Ctrl+C was pressed
    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.interrupted.store(false, Ordering::SeqCst);
        self.interrupt_count.store(0, Ordering::SeqCst);
    }
}

/// Prefix every non-empty line of `clean` with the task id
pub fn format_output(task_id: &str, clean: &str) -> Vec<String> {
    clean
        .split(|c| c == '\r' || c == '\n')
        .filter(|line| !line.trim().is_empty())
        .map(|line| format!("[{}] {}", task_id, line))
        .collect()
}

/// Parse a reply line: `@task text` targets a task, anything else goes to
/// the task that has been waiting longest
pub fn parse_reply(line: &str) -> (Option<&str>, &str) {
    if let Some(rest) = line.strip_prefix('@') {
        if let Some((task, text)) = rest.split_once(char::is_whitespace) {
            return (Some(task), text.trim_start());
        }
        return (Some(rest), "");
    }
    (None, line)
}

/// Renders engine events on stdout and answers prompts from stdin
pub struct ConsoleHost {
    runner: TaskRunner,
    show_output: bool,
    waiting: VecDeque<String>,
}

impl ConsoleHost {
    pub fn new(runner: TaskRunner, show_output: bool) -> Self {
        Self {
            runner,
            show_output,
            waiting: VecDeque::new(),
        }
    }

    /// Process events until `stop` fires (or the channel closes), then
    /// render whatever is still queued
    pub async fn run(
        mut self,
        mut events: broadcast::Receiver<EngineEvent>,
        mut stop: oneshot::Receiver<()>,
    ) {
        let (line_tx, mut lines) = mpsc::unbounded_channel::<String>();
        // Not a runtime task: a pending stdin read would block runtime shutdown
        std::thread::spawn(move || {
            for line in std::io::stdin().lock().lines() {
                let Ok(line) = line else { break };
                if line_tx.send(line).is_err() {
                    break;
                }
            }
        });
        let mut stdin_open = true;

        loop {
            tokio::select! {
                biased;
                event = events.recv() => match event {
                    Ok(event) => self.render(event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Console fell behind, skipped {} events", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                line = lines.recv(), if stdin_open => match line {
                    Some(line) => self.reply(&line).await,
                    None => stdin_open = false,
                },
                _ = &mut stop => {
                    while let Ok(event) = events.try_recv() {
                        self.render(event);
                    }
                    break;
                }
            }
        }
    }

    fn render(&mut self, event: EngineEvent) {
        let mut out = std::io::stdout().lock();
        let _ = match event {
            EngineEvent::TaskOutput { task_id, clean, .. } if self.show_output => {
                for line in format_output(&task_id, &clean) {
                    let _ = writeln!(out, "{}", line);
                }
                Ok(())
            }
            EngineEvent::TaskStatusChange { task_id, status, .. } => {
                if status != TaskStatus::WaitingForUser {
                    self.waiting.retain(|id| id != &task_id);
                }
                writeln!(out, "● {} → {}", task_id, status)
            }
            EngineEvent::InteractionNeeded { task_id, payload } => {
                let prompt = payload.prompt.unwrap_or_default();
                self.waiting.push_back(task_id.clone());
                writeln!(
                    out,
                    "\n? {} is waiting for input:\n{}\n  (reply with a line, or `@{} <text>`)",
                    task_id, prompt, task_id
                )
            }
            EngineEvent::StateChange { from, to, .. } => {
                debug!("Orchestrator {} -> {}", from, to);
                Ok(())
            }
            EngineEvent::Error {
                kind,
                task_id,
                message,
            } => writeln!(
                out,
                "! {:?}{}: {}",
                kind,
                task_id.map(|t| format!(" [{}]", t)).unwrap_or_default(),
                message
            ),
            _ => Ok(()),
        };
        let _ = out.flush();
    }

    async fn reply(&mut self, line: &str) {
        let (target, text) = parse_reply(line);
        let task_id = match target {
            Some(task) => task.to_string(),
            None => match self.waiting.front() {
                Some(task) => task.clone(),
                None => {
                    println!("No task is waiting for input");
                    return;
                }
            },
        };

        match self.runner.submit_interaction(&task_id, text).await {
            Ok(()) => self.waiting.retain(|id| id != &task_id),
            Err(e) => println!("! {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interrupt_escalates() {
        let handler = SignalHandler::new();
        assert!(!handler.is_interrupted());

        assert_eq!(handler.on_interrupt(), InterruptAction::Shutdown);
        assert!(handler.is_interrupted());
        assert_eq!(handler.on_interrupt(), InterruptAction::ForceExit);

        handler.reset();
        assert!(!handler.is_interrupted());
        assert_eq!(handler.on_interrupt(), InterruptAction::Shutdown);
    }

    #[test]
    fn test_format_output() {
        assert_eq!(
            format_output("t1", "compiling\r\n\nok\rdone\n"),
            vec!["[t1] compiling", "[t1] ok", "[t1] done"]
        );
        assert!(format_output("t1", "\r\n").is_empty());
    }

    #[test]
    fn test_parse_reply() {
        assert_eq!(parse_reply("yes"), (None, "yes"));
        assert_eq!(parse_reply("@build   y"), (Some("build"), "y"));
        assert_eq!(parse_reply("@build"), (Some("build"), ""));
    }
}
