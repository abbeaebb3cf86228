//! Process runners for agent tasks
//!
//! Two variants share one event contract:
//! - [`PtyProcess`]: interactive, pseudo-terminal backed, bidirectional
//! - [`HeadlessProcess`]: one-shot subprocess with piped output and no stdin
//!
//! Each spawned process yields a [`ProcessHandle`] for control (write,
//! resize, kill) and a channel of [`ProcessEvent`]s. Output arrives as
//! `Data { raw, clean }` where `clean` has escape sequences removed; the
//! stream always ends with exactly one `Exit` or `Error`.

pub mod ansi;
mod headless;
mod pty;

pub use headless::HeadlessProcess;
pub use pty::PtyProcess;

use std::time::Duration;

use tokio::sync::mpsc;

use crate::adapter::{ExecutionMode, LaunchConfig};
use crate::config::ProcessConfig;
use crate::Result;

/// An event emitted by a running process
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessEvent {
    /// A chunk of output
    Data {
        /// Bytes exactly as the process wrote them
        raw: Vec<u8>,
        /// Same chunk with escape sequences stripped
        clean: String,
    },
    /// The process exited
    Exit {
        /// Exit code, if the process exited normally
        code: Option<i32>,
        /// Terminating signal name, if killed by a signal
        signal: Option<String>,
    },
    /// The process failed after it was started
    Error(String),
}

impl ProcessEvent {
    /// Build a data event from raw bytes
    pub fn data(raw: Vec<u8>) -> Self {
        let clean = ansi::strip_ansi(&raw);
        ProcessEvent::Data { raw, clean }
    }

    /// Whether this event ends the stream
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProcessEvent::Exit { .. } | ProcessEvent::Error(_))
    }
}

/// Receiving end of a process's event stream
pub type ProcessEvents = mpsc::UnboundedReceiver<ProcessEvent>;

/// Control surface of a running process
pub trait ProcessHandle: Send {
    /// Write bytes to the process's input
    fn write(&mut self, data: &[u8]) -> Result<()>;

    /// Resize the terminal (interactive processes only)
    fn resize(&mut self, cols: u16, rows: u16) -> Result<()>;

    /// Kill the process
    fn kill(&mut self) -> Result<()>;

    /// OS process id, when known
    fn pid(&self) -> Option<u32>;
}

/// A freshly spawned process
pub struct SpawnedProcess {
    pub handle: Box<dyn ProcessHandle>,
    pub events: ProcessEvents,
}

/// Strategy for turning a launch configuration into a running process
pub trait Spawner: Send + Sync {
    fn spawn(&self, mode: ExecutionMode, launch: &LaunchConfig) -> Result<SpawnedProcess>;
}

/// Spawns real OS processes: a PTY for interactive tasks, pipes for headless
#[derive(Debug, Clone)]
pub struct SystemSpawner {
    cols: u16,
    rows: u16,
    drain_timeout: Duration,
}

impl SystemSpawner {
    pub fn new(config: &ProcessConfig) -> Self {
        Self {
            cols: config.cols,
            rows: config.rows,
            drain_timeout: config.exit_drain_timeout,
        }
    }
}

impl Default for SystemSpawner {
    fn default() -> Self {
        Self::new(&ProcessConfig::default())
    }
}

impl Spawner for SystemSpawner {
    fn spawn(&self, mode: ExecutionMode, launch: &LaunchConfig) -> Result<SpawnedProcess> {
        match mode {
            ExecutionMode::Interactive => {
                let (process, events) =
                    PtyProcess::spawn(launch, self.cols, self.rows, self.drain_timeout)?;
                Ok(SpawnedProcess {
                    handle: Box::new(process),
                    events,
                })
            }
            ExecutionMode::Headless => {
                let (process, events) = HeadlessProcess::spawn(launch, self.drain_timeout)?;
                Ok(SpawnedProcess {
                    handle: Box::new(process),
                    events,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_event_strips_escapes() {
        let event = ProcessEvent::data(b"\x1b[32mok\x1b[0m\r\n".to_vec());
        match event {
            ProcessEvent::Data { raw, clean } => {
                assert_eq!(raw, b"\x1b[32mok\x1b[0m\r\n".to_vec());
                assert_eq!(clean, "ok\r\n");
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_terminal_events() {
        assert!(ProcessEvent::Exit { code: Some(0), signal: None }.is_terminal());
        assert!(ProcessEvent::Error("boom".to_string()).is_terminal());
        assert!(!ProcessEvent::data(b"x".to_vec()).is_terminal());
    }
}
