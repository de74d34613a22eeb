//! Worker-side protocol loops.
//!
//! Two renditions of the same dispatch loop:
//!
//! - [`run_stdio`] — the process-substrate payload. Reads newline-delimited
//!   JSON requests from stdin, writes responses to stdout. The shipped
//!   `offload-worker` binary is this loop around the built-in registry;
//!   custom worker executables can reuse it with their own registry.
//! - [`run_registry`] — the thread-substrate payload, driven by in-process
//!   channels instead of stdio.
//!
//! Both send the readiness signal on startup, answer the implicit `methods`
//! RPC, and honour the graceful-termination signal.

pub mod registry;

pub use registry::{Emitter, Method, MethodRegistry};

use crate::error::TaskError;
use crate::protocol::{HandlerMessage, Request, Response, WorkerMessage};
use serde_json::Value;
use std::io::{BufRead, Write};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Dispatches one request against a registry, sending events and exactly one
/// terminal response through `send`.
pub(crate) fn dispatch(
    registry: &MethodRegistry,
    request: &Request,
    send: &(dyn Fn(WorkerMessage) + Sync),
) {
    let id = request.id;
    let emit = |payload: Value| send(WorkerMessage::Response(Response::event(id, payload)));
    let emitter = Emitter::new(&emit);

    let outcome = if request.method == "methods" {
        Ok(Value::from(registry.names()))
    } else if let Some(method) = registry.get(&request.method) {
        method.call(&request.params, &emitter)
    } else {
        Err(TaskError::new(format!(
            "unknown method \"{}\"",
            request.method
        )))
    };

    let response = match outcome {
        Ok(result) => Response::result(id, result),
        Err(error) => Response::error(id, error.encode()),
    };
    send(WorkerMessage::Response(response));
}

/// Runs the dispatch loop over in-process channels (thread substrate).
///
/// Returns when the inbound channel disconnects, the termination signal
/// arrives, or `cancel` fires between tasks.
pub(crate) fn run_registry(
    registry: Arc<MethodRegistry>,
    inbound: crossbeam_channel::Receiver<HandlerMessage>,
    send: impl Fn(WorkerMessage) + Sync,
    cancel: CancellationToken,
) {
    send(WorkerMessage::ready());

    loop {
        if cancel.is_cancelled() {
            break;
        }
        match inbound.recv() {
            Ok(HandlerMessage::Request(request)) => {
                if cancel.is_cancelled() {
                    break;
                }
                dispatch(&registry, &request, &send);
            }
            Ok(message) if message.is_terminate() => break,
            Ok(_) => {}
            Err(_) => break,
        }
    }
}

/// Runs the dispatch loop over stdio (process substrate).
///
/// This is the body of the shipped `offload-worker` binary; worker
/// executables with custom method sets call it from their own `main`.
pub fn run_stdio(registry: MethodRegistry) -> std::io::Result<()> {
    let stdout = std::io::stdout();
    let write_line = |message: WorkerMessage| {
        let mut out = stdout.lock();
        let _ = out.write_all(message.to_line().as_bytes());
        let _ = out.flush();
    };

    write_line(WorkerMessage::ready());

    for line in std::io::stdin().lock().lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match HandlerMessage::from_line(&line) {
            Ok(HandlerMessage::Request(request)) => dispatch(&registry, &request, &write_line),
            Ok(message) if message.is_terminate() => break,
            Ok(_) => {}
            Err(error) => {
                eprintln!("offload-worker: discarding malformed request line: {error}");
            }
        }
    }

    Ok(())
}
