//! Worker process management for one incarnation.
//!
//! Each incarnation runs three tasks: a writer draining the outbox into the
//! worker's stdin, a reader forwarding frames from its stdout, and a monitor
//! that waits for exit and reports it once the reader has finished.

use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncRead, BufReader, BufWriter};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::bridge::{HostMessage, WorkerMessage, read_message, write_message};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::state::{ExitReport, Incarnation};

use super::Event;

/// How long the monitor waits for the reader to drain after exit.
const READER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Handle to a running worker incarnation.
#[derive(Debug)]
pub(crate) struct WorkerProcess {
    incarnation: Incarnation,
    outbox: mpsc::UnboundedSender<HostMessage>,
    /// Dropping this asks the monitor to terminate the worker.
    stop: Option<oneshot::Sender<()>>,
}

impl WorkerProcess {
    /// Spawn the worker entry for `config`.
    ///
    /// A worker that cannot be spawned is reported through `events` as an
    /// exit, like any other incarnation that ends.
    pub(crate) fn spawn(
        config: &Config,
        incarnation: Incarnation,
        events: mpsc::UnboundedSender<Event>,
    ) -> Self {
        let (outbox, outbox_rx) = mpsc::unbounded_channel();
        let (stop, stop_rx) = oneshot::channel();

        match start(config) {
            Ok((child, stdin, stdout)) => {
                tracing::debug!(%incarnation, pid = child.id(), "Worker spawned");
                tokio::spawn(write_loop(stdin, outbox_rx));
                let reader = tokio::spawn(read_loop(stdout, incarnation, events.clone()));
                tokio::spawn(monitor(
                    child,
                    incarnation,
                    reader,
                    stop_rx,
                    config.stop_timeout,
                    events,
                ));
            }
            Err(e) => {
                tracing::error!(%incarnation, "{}", e);
                let _ = events.send(Event::WorkerExited {
                    incarnation,
                    exit: ExitReport::spawn_failed(),
                });
            }
        }

        Self {
            incarnation,
            outbox,
            stop: Some(stop),
        }
    }

    pub(crate) fn incarnation(&self) -> Incarnation {
        self.incarnation
    }

    /// Queue a message for the worker. Returns false once the worker is gone.
    pub(crate) fn send(&self, message: HostMessage) -> bool {
        self.outbox.send(message).is_ok()
    }

    /// A sender for answering the worker from other tasks.
    pub(crate) fn outbox(&self) -> mpsc::UnboundedSender<HostMessage> {
        self.outbox.clone()
    }

    /// Ask the worker to terminate. Idempotent.
    pub(crate) fn terminate(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}

fn start(config: &Config) -> Result<(Child, ChildStdin, ChildStdout)> {
    let mut command = Command::new(&config.worker.program);
    command
        .args(&config.worker.args)
        .arg(&config.path)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true);
    if let Some(transpiler) = &config.transpiler {
        command.arg(transpiler);
    }

    let mut child = command.spawn().map_err(|e| {
        Error::Spawn(format!(
            "Failed to spawn worker process '{}': {}",
            config.worker.program.display(),
            e
        ))
    })?;

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| Error::Spawn("Failed to get worker stdin".to_string()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| Error::Spawn("Failed to get worker stdout".to_string()))?;

    Ok((child, stdin, stdout))
}

async fn write_loop(stdin: ChildStdin, mut outbox: mpsc::UnboundedReceiver<HostMessage>) {
    let mut stdin = BufWriter::new(stdin);
    while let Some(message) = outbox.recv().await {
        if let Err(e) = write_message(&mut stdin, &message).await {
            tracing::debug!("Worker stdin closed: {}", e);
            break;
        }
    }
}

async fn read_loop<R>(stdout: R, incarnation: Incarnation, events: mpsc::UnboundedSender<Event>)
where
    R: AsyncRead + Unpin,
{
    let mut stdout = BufReader::new(stdout);
    loop {
        match read_message::<_, WorkerMessage>(&mut stdout).await {
            Ok(Some(message)) => {
                if events.send(Event::Worker { incarnation, message }).is_err() {
                    break;
                }
            }
            Ok(None) => break,
            // The whole frame was consumed, so the stream is still aligned.
            Err(Error::Serialization(e)) => {
                tracing::warn!(%incarnation, "Skipping malformed worker message: {}", e);
            }
            Err(e) => {
                tracing::warn!(%incarnation, "Dropping worker output: {}", e);
                break;
            }
        }
    }
}

async fn monitor(
    mut child: Child,
    incarnation: Incarnation,
    reader: JoinHandle<()>,
    stop: oneshot::Receiver<()>,
    stop_timeout: Duration,
    events: mpsc::UnboundedSender<Event>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = stop => {
            request_termination(&mut child);
            match tokio::time::timeout(stop_timeout, child.wait()).await {
                Ok(status) => status,
                Err(_) => {
                    tracing::warn!(%incarnation, "Worker did not stop in time, killing it");
                    let _ = child.start_kill();
                    child.wait().await
                }
            }
        }
    };

    // Results written before exit must reach the supervisor first.
    let _ = tokio::time::timeout(READER_DRAIN_TIMEOUT, reader).await;

    let exit = match status {
        Ok(status) => ExitReport::from_status(status),
        Err(e) => {
            tracing::error!(%incarnation, "Failed to wait for worker: {}", e);
            ExitReport { code: None }
        }
    };
    tracing::debug!(%incarnation, code = ?exit.code, "Worker exited");
    let _ = events.send(Event::WorkerExited { incarnation, exit });
}

#[cfg(unix)]
fn request_termination(child: &mut Child) {
    match child.id() {
        Some(pid) => {
            // SAFETY: signalling a child process we own by pid.
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
        }
        None => {
            let _ = child.start_kill();
        }
    }
}

#[cfg(not(unix))]
fn request_termination(child: &mut Child) {
    let _ = child.start_kill();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::{ExecutionId, ExecutionOutcome};
    use serde_json::json;

    #[tokio::test]
    async fn test_malformed_frame_is_skipped() {
        let execution_id = ExecutionId::new();
        let mut stream = Vec::new();

        let garbage = b"{not a message";
        stream.extend_from_slice(&(garbage.len() as u32).to_le_bytes());
        stream.extend_from_slice(garbage);
        write_message(
            &mut stream,
            &WorkerMessage::ExecutionResult {
                execution_id,
                result: ExecutionOutcome::success(json!("after")),
            },
        )
        .await
        .unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        read_loop(stream.as_slice(), Incarnation(1), tx).await;

        match rx.recv().await {
            Some(Event::Worker {
                incarnation,
                message: WorkerMessage::ExecutionResult { execution_id: id, result },
            }) => {
                assert_eq!(incarnation, Incarnation(1));
                assert_eq!(id, execution_id);
                assert_eq!(result.data, json!("after"));
            }
            other => panic!("Wrong event: {:?}", other),
        }
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_truncated_frame_stops_reading() {
        let mut stream = 10u32.to_le_bytes().to_vec();
        stream.extend_from_slice(b"{}");

        let (tx, mut rx) = mpsc::unbounded_channel();
        read_loop(stream.as_slice(), Incarnation(1), tx).await;
        assert!(rx.recv().await.is_none());
    }
}
