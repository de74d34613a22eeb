//! Transport adapters over the worker substrates.
//!
//! A transport is a capability record, not a trait hierarchy: an outbound
//! message sender, an inbound event stream, a control block whose kill and
//! terminate capabilities may each be absent, and diagnostic attributes
//! (absence tolerated). Higher layers treat every substrate uniformly
//! through this record.
//!
//! The substrates differ in cancellation cost — thread kill is synchronous
//! channel teardown, process kill is a graceful handshake with a forced-kill
//! fallback — and in delivery: threads pass structured values through
//! in-process queues, processes serialise newline-delimited JSON over stdio.

mod exec_args;
mod process;
mod thread;

use crate::error::ExecError;
use crate::options::{WorkerOptions, WorkerScript};
use crate::protocol::{HandlerMessage, WorkerMessage};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

// =============================================================================
// Worker types
// =============================================================================

/// The execution substrate behind a worker.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum WorkerType {
    /// A child OS process speaking the wire protocol over stdio.
    Process,
    /// A dedicated OS thread running the registry dispatch loop.
    Thread,
    /// A browser-style worker; unavailable on native hosts.
    Web,
    /// Pick the substrate that fits the script: thread for registries and
    /// the default, process for program paths.
    #[default]
    Auto,
}

impl std::fmt::Display for WorkerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Process => write!(f, "process"),
            Self::Thread => write!(f, "thread"),
            Self::Web => write!(f, "web"),
            Self::Auto => write!(f, "auto"),
        }
    }
}

/// Resolves the configured worker type against the script kind.
///
/// Returns the concrete substrate to use, or `UnsupportedSubstrate` when the
/// host lacks the substrate or the script cannot run on it.
pub(crate) fn select_substrate(
    worker_type: WorkerType,
    script: Option<&WorkerScript>,
) -> Result<WorkerType, ExecError> {
    match (worker_type, script) {
        (WorkerType::Web, _) => Err(ExecError::UnsupportedSubstrate(WorkerType::Web)),
        (WorkerType::Process, Some(WorkerScript::Registry(_))) => {
            Err(ExecError::UnsupportedSubstrate(WorkerType::Process))
        }
        (WorkerType::Process, _) => Ok(WorkerType::Process),
        (WorkerType::Thread, Some(WorkerScript::Program(_))) => {
            Err(ExecError::UnsupportedSubstrate(WorkerType::Thread))
        }
        (WorkerType::Thread, _) => Ok(WorkerType::Thread),
        (WorkerType::Auto, Some(WorkerScript::Program(_))) => Ok(WorkerType::Process),
        (WorkerType::Auto, _) => Ok(WorkerType::Thread),
    }
}

// =============================================================================
// Events and capabilities
// =============================================================================

/// Inbound events a transport delivers to its handler.
#[derive(Debug)]
pub(crate) enum TransportEvent {
    /// A decoded worker message.
    Message(WorkerMessage),
    /// An asynchronous transport failure.
    Error(String),
    /// The worker stopped. `signal` is the killing signal number on Unix.
    Exit {
        exit_code: Option<i32>,
        signal: Option<i32>,
    },
}

/// Outbound sender half, matching the substrate's native channel.
#[derive(Clone)]
pub(crate) enum OutboundSender {
    /// Async channel drained by the process substrate's writer task.
    Process(mpsc::UnboundedSender<HandlerMessage>),
    /// Blocking channel drained by the worker thread.
    Thread(crossbeam_channel::Sender<HandlerMessage>),
}

impl OutboundSender {
    /// Delivers one message. Returns false when the worker side is gone.
    pub fn send(&self, message: HandlerMessage) -> bool {
        match self {
            Self::Process(tx) => tx.send(message).is_ok(),
            Self::Thread(tx) => tx.send(message).is_ok(),
        }
    }
}

/// Shutdown capabilities of a transport. Either capability may be absent.
pub(crate) struct Control {
    kill: Option<Box<dyn Fn() + Send>>,
    terminate: Option<Box<dyn Fn() + Send>>,
    killed: Arc<AtomicBool>,
}

impl Control {
    pub(crate) fn new(
        kill: Option<Box<dyn Fn() + Send>>,
        terminate: Option<Box<dyn Fn() + Send>>,
    ) -> Self {
        Self {
            kill,
            terminate,
            killed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// True if the transport can be killed.
    pub fn can_kill(&self) -> bool {
        self.kill.is_some()
    }

    /// True if the transport exposes a terminate capability.
    pub fn can_terminate(&self) -> bool {
        self.terminate.is_some()
    }

    /// True once kill or terminate has been requested. Idempotent shutdown:
    /// a second request is reported as `AlreadyKilled` by the handler.
    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }

    /// Requests immediate shutdown. Idempotent.
    pub fn kill(&self) {
        self.killed.store(true, Ordering::SeqCst);
        if let Some(kill) = &self.kill {
            kill();
        }
    }

    /// Requests shutdown via the terminate capability. Idempotent.
    pub fn terminate(&self) {
        self.killed.store(true, Ordering::SeqCst);
        if let Some(terminate) = &self.terminate {
            terminate();
        }
    }
}

impl std::fmt::Debug for Control {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Control")
            .field("can_kill", &self.can_kill())
            .field("can_terminate", &self.can_terminate())
            .field("killed", &self.is_killed())
            .finish()
    }
}

/// Observable spawn attributes, used only in diagnostics.
#[derive(Debug, Clone, Default)]
pub(crate) struct Diagnostics {
    pub spawn_args: Vec<String>,
    pub spawn_file: Option<String>,
}

// =============================================================================
// Transport
// =============================================================================

/// A connected worker substrate.
pub(crate) struct Transport {
    /// Concrete substrate behind this transport.
    pub substrate: WorkerType,
    /// Outbound message sender.
    pub sender: OutboundSender,
    /// Inbound event stream. Taken by the handler loop.
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
    /// Shutdown capabilities.
    pub control: Control,
    /// Spawn diagnostics.
    pub diagnostics: Diagnostics,
}

/// Connects a transport for the resolved script on its matching substrate.
pub(crate) fn connect(
    script: &WorkerScript,
    options: &WorkerOptions,
) -> Result<Transport, ExecError> {
    match script {
        WorkerScript::Program(program) => process::spawn(program, options),
        WorkerScript::Registry(registry) => thread::spawn(Arc::clone(registry), options),
    }
}
