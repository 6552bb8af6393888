//! Runs a service's or managed dependency's shell command sequence, tees
//! stdout/stderr into the event store, and supports pre-emptive stop.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use log::{debug, error, info, warn};
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::event_store::{EventStore, Stream as LogStream};
use crate::error::StartupError;
use crate::line_splitter::LineSplitter;

/// Per-process configuration handed to [`ProcessRunner::spawn`].
#[derive(Debug, Clone)]
pub struct ProcessConfig {
    pub name: String,
    pub working_directory: PathBuf,
    pub run_commands: Vec<String>,
}

/// A single-shot cancellation token for a running process sequence.
/// Redundant cancellation is a no-op.
#[derive(Debug, Clone)]
pub struct StopToken {
    tx: Arc<watch::Sender<bool>>,
}

impl StopToken {
    /// Wraps an existing sender, for callers (e.g. the Capture Proxy) that
    /// need the same stop-token type without going through [`ProcessRunner::spawn`].
    pub fn from_sender(tx: watch::Sender<bool>) -> Self {
        Self { tx: Arc::new(tx) }
    }

    /// Signals stop. A second call is logged and otherwise a no-op.
    pub fn stop(&self) {
        if *self.tx.borrow() {
            info!("stop already signaled");
            return;
        }
        let _ = self.tx.send(true);
    }
}

/// A spawned command sequence plus its cancellation token.
pub struct ProcessHandle {
    pub name: String,
    pub stop: StopToken,
    join: JoinHandle<Result<(), SequenceError>>,
}

impl ProcessHandle {
    /// Waits for the command sequence to finish (normally, by stop, or by failure).
    pub async fn join(self) -> Result<(), SequenceError> {
        match self.join.await {
            Ok(result) => result,
            Err(_join_err) => Err(SequenceError::Aborted),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SequenceError {
    #[error("command '{command}' exited with status {status}")]
    NonZeroExit { command: String, status: i32 },
    #[error("process runner task aborted")]
    Aborted,
}

pub struct ProcessRunner;

impl ProcessRunner {
    /// Starts the command sequence. Failure to start the *first* command
    /// is surfaced synchronously; failures mid-sequence are logged and
    /// returned from [`ProcessHandle::join`] instead.
    pub async fn spawn(config: ProcessConfig, store: EventStore) -> Result<ProcessHandle, StartupError> {
        let ProcessConfig {
            name,
            working_directory,
            run_commands,
        } = config;

        if run_commands.is_empty() {
            let (tx, rx) = watch::channel(false);
            let join = tokio::spawn(async move {
                let _ = rx;
                Ok(())
            });
            return Ok(ProcessHandle {
                name,
                stop: StopToken { tx: Arc::new(tx) },
                join,
            });
        }

        let first_child = build_command(&run_commands[0], &working_directory)
            .spawn()
            .map_err(|source| StartupError::ProcessLaunch {
                name: name.clone(),
                source,
            })?;

        let (stop_tx, stop_rx) = watch::channel(false);
        let stop_tx = Arc::new(stop_tx);

        let join_name = name.clone();
        let join_store = store;
        let join_cwd = working_directory;
        let join = tokio::spawn(run_sequence(
            join_name,
            first_child,
            run_commands,
            join_cwd,
            join_store,
            stop_rx,
        ));

        Ok(ProcessHandle {
            name,
            stop: StopToken { tx: stop_tx },
            join,
        })
    }
}

fn build_command(shell_command: &str, cwd: &PathBuf) -> Command {
    let mut cmd = Command::new("/bin/sh");
    cmd.arg("-c")
        .arg(shell_command)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    cmd
}

async fn run_sequence(
    name: String,
    mut child: Child,
    commands: Vec<String>,
    cwd: PathBuf,
    store: EventStore,
    mut stop_rx: watch::Receiver<bool>,
) -> Result<(), SequenceError> {
    for (index, command) in commands.iter().enumerate() {
        if index > 0 {
            child = match build_command(command, &cwd).spawn() {
                Ok(child) => child,
                Err(source) => {
                    error!("process '{name}': failed to start command '{command}': {source}");
                    let _ = store
                        .append_log(
                            &name,
                            LogStream::Stderr,
                            format!("failed to start command '{command}': {source}\n"),
                        )
                        .await;
                    return Err(SequenceError::NonZeroExit {
                        command: command.clone(),
                        status: -1,
                    });
                }
            };
        }

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let stdout_pump = stdout.map(|r| spawn_pump(r, store.clone(), name.clone(), LogStream::Stdout));
        let stderr_pump = stderr.map(|r| spawn_pump(r, store.clone(), name.clone(), LogStream::Stderr));

        let stopped = tokio::select! {
            status = child.wait() => {
                if let Some(h) = stdout_pump { let _ = h.await; }
                if let Some(h) = stderr_pump { let _ = h.await; }

                match status {
                    Ok(status) if status.success() => false,
                    Ok(status) => {
                        warn!("process '{name}': command '{command}' exited with status {status}");
                        let _ = store
                            .append_log(&name, LogStream::Stderr, format!("command '{command}' exited with status {status}\n"))
                            .await;
                        return Err(SequenceError::NonZeroExit {
                            command: command.clone(),
                            status: status.code().unwrap_or(-1),
                        });
                    }
                    Err(e) => {
                        error!("process '{name}': failed to wait for command '{command}': {e}");
                        return Err(SequenceError::NonZeroExit { command: command.clone(), status: -1 });
                    }
                }
            }
            _ = stop_rx.changed() => {
                debug!("process '{name}': stop received, killing command '{command}'");
                let _ = child.kill().await;
                if let Some(h) = stdout_pump { let _ = h.await; }
                if let Some(h) = stderr_pump { let _ = h.await; }
                true
            }
        };

        if stopped {
            return Ok(());
        }
    }

    Ok(())
}

fn spawn_pump<R>(reader: R, store: EventStore, name: String, stream: LogStream) -> JoinHandle<()>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<Vec<u8>>();
        let mut splitter = LineSplitter::new(move |line: Vec<u8>| {
            let _ = tx.send(line);
        });

        let append_task = tokio::spawn({
            let store = store.clone();
            let name = name.clone();
            async move {
                while let Some(line) = rx.recv().await {
                    let text = String::from_utf8_lossy(&line).into_owned();
                    if let Err(e) = store.append_log(&name, stream, text).await {
                        error!("process '{name}': failed to append log line: {e}");
                    }
                }
            }
        });

        let mut reader = reader;
        let mut buf = [0u8; 4096];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    splitter.write(&buf[..n]);
                }
                Err(e) => {
                    warn!("process '{name}': stream read error: {e}");
                    break;
                }
            }
        }
        drop(splitter);
        let _ = append_task.await;
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_store::EventStore;
    use std::time::Duration;

    #[tokio::test]
    async fn captures_stdout_lines_in_order() {
        let store = EventStore::open_in_memory().await.unwrap();
        let config = ProcessConfig {
            name: "svc1".into(),
            working_directory: std::env::temp_dir(),
            run_commands: vec!["echo Service started".into()],
        };

        let handle = ProcessRunner::spawn(config, store.clone()).await.unwrap();
        handle.join().await.unwrap();

        let logs = store.get_logs("svc1", LogStream::Stdout).await.unwrap();
        assert_eq!(logs, vec!["Service started\n".to_string()]);
    }

    #[tokio::test]
    async fn non_zero_exit_halts_sequence() {
        let store = EventStore::open_in_memory().await.unwrap();
        let config = ProcessConfig {
            name: "svc1".into(),
            working_directory: std::env::temp_dir(),
            run_commands: vec!["exit 3".into(), "echo should-not-run".into()],
        };

        let handle = ProcessRunner::spawn(config, store.clone()).await.unwrap();
        let result = handle.join().await;
        assert!(matches!(result, Err(SequenceError::NonZeroExit { status: 3, .. })));

        let logs = store.get_logs("svc1", LogStream::Stdout).await.unwrap();
        assert!(logs.is_empty());
    }

    #[tokio::test]
    async fn stop_kills_running_command_and_appends_no_further_logs() {
        let store = EventStore::open_in_memory().await.unwrap();
        let config = ProcessConfig {
            name: "svc1".into(),
            working_directory: std::env::temp_dir(),
            run_commands: vec!["echo started; sleep 60".into()],
        };

        let handle = ProcessRunner::spawn(config, store.clone()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        handle.stop.stop();

        let result = tokio::time::timeout(Duration::from_secs(3), handle.join()).await;
        assert!(result.is_ok(), "process did not stop within 3s");
        assert!(result.unwrap().is_ok());
    }
}
