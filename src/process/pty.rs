//! Pseudo-terminal process runner
//!
//! Interactive agents expect a real terminal: they draw TUIs, read raw
//! keystrokes and adapt to the window size. The child gets the slave end of
//! a PTY; we keep the master for reading output, injecting input and
//! resizing.

use std::io::{ErrorKind, Read, Write};
use std::time::Duration;

use portable_pty::{
    native_pty_system, ChildKiller, CommandBuilder, ExitStatus, MasterPty, PtySize,
};
use tokio::sync::mpsc;
use tracing::debug;

use super::{ansi, ProcessEvent, ProcessEvents, ProcessHandle};
use crate::adapter::LaunchConfig;
use crate::{Error, Result};

/// A child process attached to a pseudo-terminal
pub struct PtyProcess {
    master: Box<dyn MasterPty + Send>,
    writer: Box<dyn Write + Send>,
    killer: Box<dyn ChildKiller + Send + Sync>,
    pid: Option<u32>,
}

fn pty_error(context: &str, e: impl std::fmt::Display) -> Error {
    Error::Io(std::io::Error::other(format!("{}: {}", context, e)))
}

impl PtyProcess {
    /// Spawn `launch` on a new PTY of the given size.
    ///
    /// Output is read on a blocking thread and forwarded as events. Once the
    /// child exits, remaining output is drained for at most `drain_timeout`
    /// before the exit event is sent.
    pub fn spawn(
        launch: &LaunchConfig,
        cols: u16,
        rows: u16,
        drain_timeout: Duration,
    ) -> Result<(Self, ProcessEvents)> {
        let pair = native_pty_system()
            .openpty(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| pty_error("openpty failed", e))?;

        let mut command = CommandBuilder::new(&launch.command);
        command.args(&launch.args);
        match &launch.cwd {
            Some(cwd) => command.cwd(cwd),
            None => command.cwd(std::env::current_dir()?),
        }
        if !launch.env.contains_key("TERM") {
            command.env("TERM", "xterm-256color");
        }
        for (key, value) in &launch.env {
            command.env(key, value);
        }

        debug!("Spawning on pty: {} {:?}", launch.command, launch.args);
        let mut child = pair
            .slave
            .spawn_command(command)
            .map_err(|e| pty_error("spawn failed", e))?;
        // The child owns the slave now; holding it open would hide EOF
        drop(pair.slave);

        let pid = child.process_id();
        let killer = child.clone_killer();
        let mut reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| pty_error("clone reader failed", e))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| pty_error("take writer failed", e))?;

        let (tx, rx) = mpsc::unbounded_channel();

        let data_tx = tx.clone();
        let mut reader_handle = tokio::task::spawn_blocking(move || {
            let mut buf = [0u8; 8192];
            let mut carry: Vec<u8> = Vec::new();
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        carry.extend_from_slice(&buf[..n]);
                        let complete = ansi::complete_prefix(&carry);
                        if complete > 0 {
                            let chunk: Vec<u8> = carry.drain(..complete).collect();
                            let _ = data_tx.send(ProcessEvent::data(chunk));
                        }
                    }
                    Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
                    Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
                        std::thread::sleep(Duration::from_millis(5));
                    }
                    // EIO once the child side is closed
                    Err(e) => {
                        debug!("pty read ended: {}", e);
                        break;
                    }
                }
            }
            if !carry.is_empty() {
                let _ = data_tx.send(ProcessEvent::data(carry));
            }
        });

        let wait_handle = tokio::task::spawn_blocking(move || child.wait());

        tokio::spawn(async move {
            let status = wait_handle.await;
            if tokio::time::timeout(drain_timeout, &mut reader_handle)
                .await
                .is_err()
            {
                debug!("pty output still open after exit");
            }

            let event = match status {
                Ok(Ok(status)) => {
                    let signal = exit_signal(&status);
                    let code = if signal.is_some() {
                        None
                    } else {
                        Some(status.exit_code() as i32)
                    };
                    ProcessEvent::Exit { code, signal }
                }
                Ok(Err(e)) => ProcessEvent::Error(format!("wait failed: {}", e)),
                Err(e) => ProcessEvent::Error(format!("wait task failed: {}", e)),
            };
            let _ = tx.send(event);
        });

        Ok((
            Self {
                master: pair.master,
                writer,
                killer,
                pid,
            },
            rx,
        ))
    }
}

/// Signal that ended the child, if any.
///
/// `ExitStatus` only exposes the signal name through its `Display` output.
fn exit_signal(status: &ExitStatus) -> Option<String> {
    status
        .to_string()
        .strip_prefix("Terminated by ")
        .map(str::to_string)
}

impl ProcessHandle for PtyProcess {
    fn write(&mut self, data: &[u8]) -> Result<()> {
        self.writer.write_all(data)?;
        self.writer.flush()?;
        Ok(())
    }

    fn resize(&mut self, cols: u16, rows: u16) -> Result<()> {
        self.master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| pty_error("resize failed", e))
    }

    fn kill(&mut self) -> Result<()> {
        match self.killer.kill() {
            Ok(()) => Ok(()),
            // Already gone
            Err(e) if e.kind() == ErrorKind::InvalidInput => Ok(()),
            Err(e) => Err(Error::Io(e)),
        }
    }

    fn pid(&self) -> Option<u32> {
        self.pid
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn launch(command: &str, args: &[&str]) -> LaunchConfig {
        LaunchConfig {
            command: command.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            cwd: Some(std::env::temp_dir()),
            env: HashMap::new(),
        }
    }

    async fn read_until_exit(events: &mut ProcessEvents) -> (String, ProcessEvent) {
        let mut output = String::new();
        while let Some(event) = events.recv().await {
            match event {
                ProcessEvent::Data { clean, .. } => output.push_str(&clean),
                terminal => return (output, terminal),
            }
        }
        panic!("pty stream ended without exit");
    }

    #[tokio::test]
    async fn test_pty_echo_output() {
        let (_pty, mut events) = PtyProcess::spawn(
            &launch("/bin/echo", &["hello cadence"]),
            80,
            24,
            Duration::from_millis(500),
        )
        .expect("spawn failed");

        let (output, last) = read_until_exit(&mut events).await;
        assert!(output.contains("hello cadence"), "output: {:?}", output);
        assert_eq!(last, ProcessEvent::Exit { code: Some(0), signal: None });
    }

    #[tokio::test]
    async fn test_pty_write_roundtrip() {
        let (mut pty, mut events) = PtyProcess::spawn(
            &launch("/bin/sh", &["-c", "read line; echo got:$line"]),
            80,
            24,
            Duration::from_millis(500),
        )
        .expect("spawn failed");

        pty.write(b"abc\r").expect("write failed");
        let (output, _) = read_until_exit(&mut events).await;
        assert!(output.contains("got:abc"), "output: {:?}", output);
    }

    #[tokio::test]
    async fn test_pty_kill() {
        let (mut pty, mut events) = PtyProcess::spawn(
            &launch("/bin/sleep", &["30"]),
            80,
            24,
            Duration::from_millis(200),
        )
        .expect("spawn failed");

        assert!(pty.pid().is_some());
        pty.resize(100, 30).expect("resize failed");
        pty.kill().expect("kill failed");
        let (_, last) = read_until_exit(&mut events).await;
        assert!(
            matches!(last, ProcessEvent::Exit { code: None, signal: Some(_) }),
            "last: {:?}",
            last
        );
    }

    #[tokio::test]
    async fn test_pty_exit_code() {
        let (_pty, mut events) = PtyProcess::spawn(
            &launch("/bin/sh", &["-c", "exit 3"]),
            80,
            24,
            Duration::from_millis(500),
        )
        .expect("spawn failed");

        let (_, last) = read_until_exit(&mut events).await;
        assert_eq!(last, ProcessEvent::Exit { code: Some(3), signal: None });
    }

    #[test]
    fn test_exit_signal() {
        assert_eq!(exit_signal(&ExitStatus::with_exit_code(0)), None);
        assert_eq!(exit_signal(&ExitStatus::with_exit_code(3)), None);
        assert_eq!(
            exit_signal(&ExitStatus::with_signal("Hangup")).as_deref(),
            Some("Hangup")
        );
    }
}
