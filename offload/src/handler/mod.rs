//! Worker handler: owns one worker's full lifecycle.
//!
//! A [`WorkerHandler`] is a cheap public handle over a spawned event loop
//! (see `core`). The loop exclusively owns the transport, the in-flight
//! table, and the timers; the handle mirrors the observable state (ready,
//! terminating, terminated, counters) in atomics so `busy()`/`available()`
//! are non-blocking.
//!
//! Lifecycle: `running → terminating → terminated`. Once terminated, every
//! operation rejects with `WorkerTerminated`.

mod core;

pub use self::core::{CHILD_PROCESS_EXIT_TIMEOUT, STATS_RESET_INTERVAL};

use crate::deferred::{deferred, AbortFn, Resolver, TaskFuture};
use crate::error::ExecError;
use crate::options::{
    default_worker_program, EventCallback, ExecOptions, HandlerHooks, WorkerOptions, WorkerScript,
};
use crate::protocol::TaskId;
use crate::transport::{self, Transport, WorkerType};
use crate::worker::MethodRegistry;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

// =============================================================================
// Shared state
// =============================================================================

/// Timing statistics for one handler's responses.
///
/// `min`/`max` cover the current stats window (reset every
/// [`STATS_RESET_INTERVAL`]); `total` and `last` persist.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TimingStats {
    /// Sum of all response times.
    pub total: Duration,
    /// Fastest response in the current window; `None` until one lands.
    pub min: Option<Duration>,
    /// Slowest response in the current window.
    pub max: Duration,
    /// Most recent response time.
    pub last: Option<Duration>,
}

/// Snapshot of a handler's counters and timing statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerStats {
    /// Tasks accepted over the handler's lifetime.
    pub request_count: u64,
    /// Terminal responses processed over the handler's lifetime.
    pub response_count: u64,
    /// Tasks currently in flight.
    pub in_flight: usize,
    /// Timing statistics.
    pub timing: TimingStats,
}

/// State shared between the public handle and the handler loop.
pub(crate) struct Shared {
    pub ready: AtomicBool,
    pub terminating: AtomicBool,
    pub terminated: AtomicBool,
    pub in_flight: AtomicUsize,
    pub request_count: AtomicU64,
    pub response_count: AtomicU64,
    pub last_id: AtomicU64,
    pub timing: Mutex<TimingStats>,
    pub concurrency: usize,
    pub max_exec: u64,
}

impl Shared {
    fn new(concurrency: usize, max_exec: u64) -> Self {
        Self {
            ready: AtomicBool::new(false),
            terminating: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
            request_count: AtomicU64::new(0),
            response_count: AtomicU64::new(0),
            last_id: AtomicU64::new(0),
            timing: Mutex::new(TimingStats::default()),
            concurrency: concurrency.max(1),
            max_exec,
        }
    }

    /// `busy ⇔ |in-flight| ≥ concurrency`.
    pub fn busy(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst) >= self.concurrency
    }

    /// `available ⇔ ¬terminated ∧ ¬terminating ∧ ready ∧ lifetime cap not
    /// reached ∧ ¬busy`.
    pub fn available(&self) -> bool {
        !self.terminated.load(Ordering::SeqCst)
            && !self.terminating.load(Ordering::SeqCst)
            && self.ready.load(Ordering::SeqCst)
            && (self.max_exec == 0 || self.request_count.load(Ordering::SeqCst) < self.max_exec)
            && !self.busy()
    }

    fn snapshot(&self) -> WorkerStats {
        let timing = match self.timing.lock() {
            Ok(timing) => timing.clone(),
            Err(_) => TimingStats::default(),
        };
        WorkerStats {
            request_count: self.request_count.load(Ordering::SeqCst),
            response_count: self.response_count.load(Ordering::SeqCst),
            in_flight: self.in_flight.load(Ordering::SeqCst),
            timing,
        }
    }
}

// =============================================================================
// Commands
// =============================================================================

/// Commands the public handle sends to the handler loop.
pub(crate) enum Command {
    Exec {
        id: TaskId,
        method: String,
        params: Vec<Value>,
        resolver: Resolver,
        on_event: Option<EventCallback>,
    },
    Abort {
        id: TaskId,
        error: ExecError,
    },
    Terminate {
        force: bool,
        notify: Option<oneshot::Sender<Result<(), ExecError>>>,
    },
}

// =============================================================================
// Worker handler
// =============================================================================

/// Handle to one worker.
///
/// Spawning a handler starts the worker's transport and the event loop that
/// owns it. Tasks submitted through [`exec`](Self::exec) are multiplexed over
/// the worker by correlation id; readiness, statistics, and termination are
/// managed by the loop.
pub struct WorkerHandler {
    command_tx: mpsc::UnboundedSender<Command>,
    shared: Arc<Shared>,
    substrate: WorkerType,
    script: String,
}

impl WorkerHandler {
    /// Spawns a worker and its handler loop.
    ///
    /// With no explicit `script` the default worker for the selected
    /// substrate is used and the handler is ready immediately (the default
    /// worker needs no handshake). An explicit script defers readiness until
    /// the worker's `"ready"` signal, bounded by the configured timeouts.
    pub fn spawn(
        script: Option<WorkerScript>,
        options: WorkerOptions,
        hooks: HandlerHooks,
    ) -> Result<Self, ExecError> {
        let substrate = transport::select_substrate(options.worker_type, script.as_ref())?;
        let handshake = script.is_some();

        let script = match script {
            Some(script) => script,
            None => match substrate {
                WorkerType::Process => WorkerScript::Program(
                    default_worker_program()
                        .map_err(|e| ExecError::Spawn(format!("default worker: {e}")))?,
                ),
                _ => WorkerScript::Registry(Arc::new(MethodRegistry::builtin())),
            },
        };

        let transport = transport::connect(&script, &options)?;
        Ok(Self::spawn_with_transport(
            transport,
            script.describe(),
            !handshake,
            options,
            hooks,
        ))
    }

    /// Wires a handler loop around an already-connected transport.
    ///
    /// `initially_ready` skips the readiness handshake (default worker).
    pub(crate) fn spawn_with_transport(
        transport: Transport,
        script: String,
        initially_ready: bool,
        options: WorkerOptions,
        hooks: HandlerHooks,
    ) -> Self {
        let shared = Arc::new(Shared::new(options.concurrency, options.max_exec));
        if initially_ready {
            shared.ready.store(true, Ordering::SeqCst);
        }

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let substrate = transport.substrate;

        let loop_body = self::core::HandlerCore::new(
            Arc::clone(&shared),
            command_rx,
            transport,
            script.clone(),
            initially_ready,
            &options,
            hooks,
        );
        tokio::spawn(loop_body.run());

        Self {
            command_tx,
            shared,
            substrate,
            script,
        }
    }

    /// Enqueues one task and returns its future.
    pub fn exec(&self, method: impl Into<String>, params: Vec<Value>) -> TaskFuture {
        self.exec_with_options(method, params, ExecOptions::default())
    }

    /// Enqueues one task with per-task options (event sink).
    pub fn exec_with_options(
        &self,
        method: impl Into<String>,
        params: Vec<Value>,
        options: ExecOptions,
    ) -> TaskFuture {
        let id = self.allocate_task_id();
        let (resolver, future) = deferred(Some(self.abort_fn(id)));
        self.submit(id, method.into(), params, resolver, options.on_event);
        future
    }

    /// Submits a task whose resolver the caller created (pool dispatch).
    ///
    /// Returns the allocated task id so the caller can route aborts.
    pub(crate) fn submit_task(
        &self,
        method: String,
        params: Vec<Value>,
        resolver: Resolver,
        on_event: Option<EventCallback>,
    ) -> TaskId {
        let id = self.allocate_task_id();
        self.submit(id, method, params, resolver, on_event);
        id
    }

    /// Removes an in-flight task and force-terminates the worker.
    pub(crate) fn abort_task(&self, id: TaskId, error: ExecError) {
        let _ = self.command_tx.send(Command::Abort { id, error });
    }

    /// Lists the worker's methods. Sugar for `exec("methods")`.
    pub async fn methods(&self) -> Result<Vec<String>, ExecError> {
        let value = self.exec("methods", Vec::new()).await?;
        serde_json::from_value(value)
            .map_err(|e| ExecError::Worker(format!("invalid methods response: {e}")))
    }

    /// True when the in-flight count has reached the concurrency cap.
    pub fn busy(&self) -> bool {
        self.shared.busy()
    }

    /// True when this handler can accept a task right now.
    pub fn available(&self) -> bool {
        self.shared.available()
    }

    /// True once the worker has signalled readiness for the current epoch.
    pub fn ready(&self) -> bool {
        self.shared.ready.load(Ordering::SeqCst)
    }

    /// True while a graceful termination is draining in-flight work.
    pub fn terminating(&self) -> bool {
        self.shared.terminating.load(Ordering::SeqCst)
    }

    /// True once the worker has left service.
    pub fn terminated(&self) -> bool {
        self.shared.terminated.load(Ordering::SeqCst)
    }

    /// Snapshot of counters and timing statistics.
    pub fn stats(&self) -> WorkerStats {
        self.shared.snapshot()
    }

    /// The substrate this worker runs on.
    pub fn worker_type(&self) -> WorkerType {
        self.substrate
    }

    /// Description of the worker payload.
    pub fn script(&self) -> &str {
        &self.script
    }

    /// Requests termination without waiting for it to complete.
    ///
    /// With `force`, in-flight tasks are rejected with `WorkerTerminated`
    /// and the worker is shut down immediately; otherwise termination waits
    /// for in-flight work to drain.
    pub fn terminate(&self, force: bool) {
        let _ = self.command_tx.send(Command::Terminate {
            force,
            notify: None,
        });
    }

    /// Requests termination and waits for it.
    ///
    /// `timeout` bounds the wait: on expiry this call rejects with
    /// `TimedOut` while the underlying shutdown continues.
    pub async fn terminate_and_wait(
        &self,
        force: bool,
        timeout: Option<Duration>,
    ) -> Result<(), ExecError> {
        let (notify_tx, notify_rx) = oneshot::channel();
        if self
            .command_tx
            .send(Command::Terminate {
                force,
                notify: Some(notify_tx),
            })
            .is_err()
        {
            // Loop already gone: the worker is terminated.
            return Ok(());
        }

        match timeout {
            Some(limit) => match tokio::time::timeout(limit, notify_rx).await {
                Ok(Ok(result)) => result,
                Ok(Err(_)) => Ok(()),
                Err(_) => Err(ExecError::TimedOut(limit)),
            },
            None => notify_rx.await.unwrap_or(Ok(())),
        }
    }

    fn allocate_task_id(&self) -> TaskId {
        self.shared.last_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn abort_fn(&self, id: TaskId) -> Arc<AbortFn> {
        let command_tx = self.command_tx.clone();
        Arc::new(move |error| {
            let _ = command_tx.send(Command::Abort { id, error });
        })
    }

    fn submit(
        &self,
        id: TaskId,
        method: String,
        params: Vec<Value>,
        resolver: Resolver,
        on_event: Option<EventCallback>,
    ) {
        self.shared.request_count.fetch_add(1, Ordering::SeqCst);
        self.shared.in_flight.fetch_add(1, Ordering::SeqCst);

        if let Err(mpsc::error::SendError(command)) = self.command_tx.send(Command::Exec {
            id,
            method,
            params,
            resolver,
            on_event,
        }) {
            // Loop already gone: settle the task here.
            if let Command::Exec { mut resolver, .. } = command {
                self.shared.in_flight.fetch_sub(1, Ordering::SeqCst);
                resolver.reject(ExecError::WorkerTerminated);
            }
        }
    }
}

impl std::fmt::Debug for WorkerHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandler")
            .field("script", &self.script)
            .field("substrate", &self.substrate)
            .field("ready", &self.ready())
            .field("terminating", &self.terminating())
            .field("terminated", &self.terminated())
            .field("in_flight", &self.shared.in_flight.load(Ordering::SeqCst))
            .finish()
    }
}
