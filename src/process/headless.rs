//! Headless (one-shot) process runner
//!
//! Spawns the agent as a plain subprocess with piped stdout/stderr. Stdin is
//! closed right after spawn, so the process can never block on input; the
//! task completes when the process exits on its own.

use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use super::{ansi, ProcessEvent, ProcessEvents, ProcessHandle};
use crate::adapter::LaunchConfig;
use crate::{Error, Result};

/// Handle to a headless subprocess
pub struct HeadlessProcess {
    pid: Option<u32>,
    kill_tx: Option<oneshot::Sender<()>>,
}

impl HeadlessProcess {
    /// Spawn the process and start pumping its output.
    ///
    /// Must be called from within a tokio runtime. After the process exits,
    /// its pipes are drained for at most `drain_timeout` (grandchildren may
    /// keep them open).
    pub fn spawn(launch: &LaunchConfig, drain_timeout: Duration) -> Result<(Self, ProcessEvents)> {
        let mut command = Command::new(&launch.command);
        command
            .args(&launch.args)
            .envs(&launch.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(cwd) = &launch.cwd {
            command.current_dir(cwd);
        }

        debug!("Spawning headless: {} {:?}", launch.command, launch.args);
        let mut child = command.spawn()?;
        let pid = child.id();

        // No interactive input is possible in headless mode
        drop(child.stdin.take());

        let (tx, rx) = mpsc::unbounded_channel();
        let stdout = child.stdout.take().map(|s| tokio::spawn(pump(s, tx.clone())));
        let stderr = child.stderr.take().map(|s| tokio::spawn(pump(s, tx.clone())));

        let (kill_tx, kill_rx) = oneshot::channel::<()>();

        tokio::spawn(async move {
            // A dropped handle counts as a kill request
            let status = tokio::select! {
                status = child.wait() => status,
                _ = kill_rx => {
                    if let Err(e) = child.start_kill() {
                        debug!("Kill after exit: {}", e);
                    }
                    child.wait().await
                }
            };

            let mut read_error = None;
            for mut reader in [stdout, stderr].into_iter().flatten() {
                match tokio::time::timeout(drain_timeout, &mut reader).await {
                    Ok(Ok(Ok(()))) => {}
                    Ok(Ok(Err(e))) => read_error = Some(e),
                    Ok(Err(e)) => read_error = Some(format!("output reader panicked: {}", e)),
                    Err(_) => {
                        debug!("Output still open after exit, detaching reader");
                        reader.abort();
                    }
                }
            }

            let event = match (status, read_error) {
                (Err(e), _) => ProcessEvent::Error(format!("wait failed: {}", e)),
                (Ok(_), Some(e)) => ProcessEvent::Error(e),
                (Ok(status), None) => ProcessEvent::Exit {
                    code: status.code(),
                    signal: signal_name(&status),
                },
            };
            let _ = tx.send(event);
        });

        Ok((
            Self {
                pid,
                kill_tx: Some(kill_tx),
            },
            rx,
        ))
    }
}

impl ProcessHandle for HeadlessProcess {
    fn write(&mut self, _data: &[u8]) -> Result<()> {
        Err(Error::Unsupported(
            "headless processes do not accept input".to_string(),
        ))
    }

    fn resize(&mut self, _cols: u16, _rows: u16) -> Result<()> {
        Err(Error::Unsupported(
            "headless processes have no terminal".to_string(),
        ))
    }

    fn kill(&mut self) -> Result<()> {
        if let Some(tx) = self.kill_tx.take() {
            let _ = tx.send(());
        }
        Ok(())
    }

    fn pid(&self) -> Option<u32> {
        self.pid
    }
}

/// Forward one output pipe as data events until EOF
async fn pump<R>(mut reader: R, tx: mpsc::UnboundedSender<ProcessEvent>) -> std::result::Result<(), String>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; 8192];
    let mut carry: Vec<u8> = Vec::new();

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!("Headless read failed: {}", e);
                return Err(format!("read failed: {}", e));
            }
        };

        carry.extend_from_slice(&buf[..n]);
        let complete = ansi::complete_prefix(&carry);
        if complete == 0 {
            continue;
        }
        let chunk: Vec<u8> = carry.drain(..complete).collect();
        if tx.send(ProcessEvent::data(chunk)).is_err() {
            // Nobody is listening anymore; keep draining so the child never blocks
            continue;
        }
    }

    if !carry.is_empty() {
        let _ = tx.send(ProcessEvent::data(carry));
    }
    Ok(())
}

#[cfg(unix)]
fn signal_name(status: &std::process::ExitStatus) -> Option<String> {
    use std::os::unix::process::ExitStatusExt;
    status.signal().map(|sig| match sig {
        1 => "SIGHUP".to_string(),
        2 => "SIGINT".to_string(),
        9 => "SIGKILL".to_string(),
        15 => "SIGTERM".to_string(),
        n => format!("SIG{}", n),
    })
}

#[cfg(not(unix))]
fn signal_name(_status: &std::process::ExitStatus) -> Option<String> {
    None
}
