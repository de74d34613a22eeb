//! OS-thread transport.
//!
//! Runs the registry dispatch loop on a dedicated named thread. Messages
//! cross as structured values through in-process channels, so there is no
//! serialisation step. Kill is synchronous: the cancellation token stops the
//! loop between tasks and the channel teardown on transport drop unblocks a
//! loop waiting for work.

use super::{Control, Diagnostics, OutboundSender, Transport, TransportEvent, WorkerType};
use crate::error::ExecError;
use crate::options::WorkerOptions;
use crate::worker::{self, MethodRegistry};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Counter for unique worker thread names.
static WORKER_THREAD_COUNTER: AtomicUsize = AtomicUsize::new(0);

/// Spawns a registry worker on a dedicated thread and wires it into a
/// transport.
pub(crate) fn spawn(
    registry: Arc<MethodRegistry>,
    options: &WorkerOptions,
) -> Result<Transport, ExecError> {
    let (inbound_tx, inbound_rx) = crossbeam_channel::unbounded();
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();

    let thread_id = WORKER_THREAD_COUNTER.fetch_add(1, Ordering::Relaxed);
    let mut builder = thread::Builder::new().name(format!("offload-worker-{thread_id}"));
    if let Some(stack_size) = options.thread_opts.stack_size {
        builder = builder.stack_size(stack_size);
    }

    let worker_event_tx = event_tx.clone();
    let worker_cancel = cancel.clone();
    let handle = builder
        .spawn(move || {
            worker::run_registry(
                registry,
                inbound_rx,
                move |message| {
                    let _ = worker_event_tx.send(TransportEvent::Message(message));
                },
                worker_cancel,
            );
        })
        .map_err(|e| ExecError::Spawn(format!("failed to spawn worker thread: {e}")))?;

    // Join watcher: reports thread exit (and panics) as transport events.
    tokio::task::spawn_blocking(move || {
        let exit_code = match handle.join() {
            Ok(()) => Some(0),
            Err(_) => {
                let _ = event_tx.send(TransportEvent::Error(
                    "worker thread panicked".to_string(),
                ));
                Some(1)
            }
        };
        let _ = event_tx.send(TransportEvent::Exit {
            exit_code,
            signal: None,
        });
    });

    let control = Control::new(Some(Box::new(move || cancel.cancel())), None);

    Ok(Transport {
        substrate: WorkerType::Thread,
        sender: OutboundSender::Thread(inbound_tx),
        events: event_rx,
        control,
        diagnostics: Diagnostics::default(),
    })
}
