//! Child-process transport.
//!
//! Spawns the worker program with piped stdio: stdin carries requests as
//! newline-delimited JSON, stdout carries responses, and stderr is forwarded
//! line-by-line into `tracing`. A supervisor task owns the child, translates
//! the kill capability into `SIGKILL`, and reports the final wait status as
//! an exit event.

use super::{Control, Diagnostics, OutboundSender, Transport, TransportEvent, WorkerType};
use crate::error::ExecError;
use crate::options::WorkerOptions;
use crate::protocol::WorkerMessage;
use crate::transport::exec_args::{host_argv, inherited_exec_args};
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Counter for unique worker ids in stderr log lines.
static WORKER_STDERR_COUNTER: AtomicUsize = AtomicUsize::new(0);

/// Spawns a worker process and wires its stdio into a transport.
pub(crate) fn spawn(program: &Path, options: &WorkerOptions) -> Result<Transport, ExecError> {
    let argv = options
        .exec_argv
        .clone()
        .unwrap_or_else(host_argv);
    let inherited = inherited_exec_args(&argv, options.debug_port);

    let mut command = Command::new(program);
    command
        .args(&inherited)
        .args(&options.fork_args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(cwd) = &options.fork_opts.cwd {
        command.current_dir(cwd);
    }
    for (key, value) in &options.fork_opts.envs {
        command.env(key, value);
    }

    let mut child = command
        .spawn()
        .map_err(|e| ExecError::Spawn(format!("{}: {e}", program.display())))?;

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| ExecError::Spawn("child stdin not captured".to_string()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| ExecError::Spawn("child stdout not captured".to_string()))?;
    if let Some(stderr) = child.stderr.take() {
        forward_stderr(stderr);
    }

    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<crate::protocol::HandlerMessage>();
    let (event_tx, event_rx) = mpsc::unbounded_channel();

    // Writer: outbound channel -> child stdin.
    tokio::spawn(async move {
        let mut stdin = stdin;
        while let Some(message) = outbound_rx.recv().await {
            let line = message.to_line();
            if stdin.write_all(line.as_bytes()).await.is_err() {
                break;
            }
            if stdin.flush().await.is_err() {
                break;
            }
        }
    });

    // Reader: child stdout -> decoded message events.
    let reader_tx = event_tx.clone();
    tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match WorkerMessage::from_line(&line) {
                        Ok(message) => {
                            if reader_tx.send(TransportEvent::Message(message)).is_err() {
                                break;
                            }
                        }
                        Err(error) => {
                            let _ = reader_tx.send(TransportEvent::Error(format!(
                                "malformed worker message: {error}"
                            )));
                        }
                    }
                }
                Ok(None) => break,
                Err(error) => {
                    let _ = reader_tx.send(TransportEvent::Error(format!(
                        "failed to read from worker: {error}"
                    )));
                    break;
                }
            }
        }
    });

    // Supervisor: owns the child, applies kill, reports the exit status.
    let kill_token = CancellationToken::new();
    supervise(child, kill_token.clone(), event_tx);

    let spawn_file = program.display().to_string();
    let mut spawn_args = vec![spawn_file.clone()];
    spawn_args.extend(inherited);
    spawn_args.extend(options.fork_args.iter().cloned());

    let control = Control::new(
        Some(Box::new(move || kill_token.cancel())),
        None,
    );

    Ok(Transport {
        substrate: WorkerType::Process,
        sender: OutboundSender::Process(outbound_tx),
        events: event_rx,
        control,
        diagnostics: Diagnostics {
            spawn_args,
            spawn_file: Some(spawn_file),
        },
    })
}

/// Waits for the child to exit, force-killing when the kill token fires.
fn supervise(
    mut child: Child,
    kill_token: CancellationToken,
    event_tx: mpsc::UnboundedSender<TransportEvent>,
) {
    tokio::spawn(async move {
        let waited = tokio::select! {
            biased;
            _ = kill_token.cancelled() => None,
            status = child.wait() => Some(status),
        };

        let status = match waited {
            Some(status) => status,
            None => {
                let _ = child.start_kill();
                child.wait().await
            }
        };

        let (exit_code, signal) = match status {
            Ok(status) => (status.code(), exit_signal(&status)),
            Err(_) => (None, None),
        };
        debug!(?exit_code, ?signal, "worker process exited");
        let _ = event_tx.send(TransportEvent::Exit { exit_code, signal });
    });
}

/// Forwards worker stderr into tracing, one line at a time.
///
/// Lines mentioning errors are logged at WARN, the rest at DEBUG.
fn forward_stderr(stderr: ChildStderr) {
    let worker_id = WORKER_STDERR_COUNTER.fetch_add(1, Ordering::Relaxed);
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line.trim().is_empty() {
                continue;
            }
            if line.to_lowercase().contains("error") {
                tracing::warn!(worker_id, "{}", line);
            } else {
                tracing::debug!(worker_id, "{}", line);
            }
        }
    });
}

#[cfg(unix)]
fn exit_signal(status: &std::process::ExitStatus) -> Option<i32> {
    std::os::unix::process::ExitStatusExt::signal(status)
}

#[cfg(not(unix))]
fn exit_signal(_status: &std::process::ExitStatus) -> Option<i32> {
    None
}
