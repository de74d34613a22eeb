//! Pool scheduler: availability-ordered dispatch over many worker handlers.
//!
//! A [`Pool`] owns a set of [`WorkerHandler`](crate::WorkerHandler)s and a
//! task queue. Each submitted task goes to any available handler; when none
//! is available and the pool is under its cap, a new worker is spawned and
//! the task waits for its readiness. The queue drains on every readiness
//! epoch and task completion. Exited workers (crash, retirement,
//! cancellation-forced termination) are decommissioned and replaced on
//! demand.

mod core;

use crate::deferred::{deferred, AbortFn, TaskFuture};
use crate::error::ExecError;
use crate::options::{ExecOptions, WorkerOptions, WorkerScript};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

use self::core::{PoolCommand, PoolRunner};

/// Pool sizing default: one worker per available core, minus one for the
/// host, with a floor of one.
pub fn default_pool_size() -> usize {
    std::thread::available_parallelism()
        .map(|cores| cores.get().saturating_sub(1).max(1))
        .unwrap_or(1)
}

// =============================================================================
// Configuration
// =============================================================================

/// Pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of workers.
    pub max_workers: usize,
    /// Workers spawned eagerly at pool construction.
    pub min_workers: usize,
    /// Queued-task cap; submissions beyond it reject with `QueueFull`.
    pub max_queue_size: Option<usize>,
    /// Worker payload; the substrate default when absent.
    pub script: Option<WorkerScript>,
    /// Template applied to every spawned worker.
    pub worker: WorkerOptions,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_workers: default_pool_size(),
            min_workers: 0,
            max_queue_size: None,
            script: None,
            worker: WorkerOptions::default(),
        }
    }
}

/// Snapshot of pool occupancy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Workers currently owned by the pool.
    pub total_workers: usize,
    /// Workers at their concurrency cap.
    pub busy_workers: usize,
    /// Workers with spare capacity.
    pub idle_workers: usize,
    /// Tasks waiting for a worker.
    pub pending_tasks: usize,
    /// Tasks dispatched and not yet settled.
    pub active_tasks: usize,
}

pub(crate) struct PoolShared {
    terminated: AtomicBool,
    next_ticket: AtomicU64,
}

// =============================================================================
// Pool
// =============================================================================

/// A worker pool dispatching tasks over isolated workers.
pub struct Pool {
    command_tx: mpsc::UnboundedSender<PoolCommand>,
    shared: Arc<PoolShared>,
}

impl Pool {
    /// Creates a pool and spawns its scheduler loop (plus `min_workers`
    /// eager workers).
    pub fn new(config: PoolConfig) -> Self {
        let shared = Arc::new(PoolShared {
            terminated: AtomicBool::new(false),
            next_ticket: AtomicU64::new(0),
        });

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let runner = PoolRunner::new(config, Arc::clone(&shared), command_rx);
        tokio::spawn(runner.run());

        Self { command_tx, shared }
    }

    /// Submits one task.
    pub fn exec(&self, method: impl Into<String>, params: Vec<Value>) -> TaskFuture {
        self.exec_with_options(method, params, ExecOptions::default())
    }

    /// Submits one task with per-task options (event sink).
    pub fn exec_with_options(
        &self,
        method: impl Into<String>,
        params: Vec<Value>,
        options: ExecOptions,
    ) -> TaskFuture {
        let ticket = self.shared.next_ticket.fetch_add(1, Ordering::SeqCst) + 1;

        let command_tx = self.command_tx.clone();
        let abort: Arc<AbortFn> = Arc::new(move |error| {
            let _ = command_tx.send(PoolCommand::Abort { ticket, error });
        });
        let (mut resolver, future) = deferred(Some(abort));

        if self.shared.terminated.load(Ordering::SeqCst) {
            resolver.reject(ExecError::WorkerTerminated);
            return future;
        }

        if let Err(mpsc::error::SendError(command)) = self.command_tx.send(PoolCommand::Exec {
            ticket,
            method: method.into(),
            params,
            resolver,
            on_event: options.on_event,
        }) {
            if let PoolCommand::Exec { mut resolver, .. } = command {
                resolver.reject(ExecError::WorkerTerminated);
            }
        }
        future
    }

    /// Current occupancy. Zeroes after the pool has terminated.
    pub async fn stats(&self) -> PoolStats {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .command_tx
            .send(PoolCommand::Stats { reply: reply_tx })
            .is_err()
        {
            return PoolStats::default();
        }
        reply_rx.await.unwrap_or_default()
    }

    /// Terminates every worker and retires the pool.
    ///
    /// With `force`, in-flight tasks are rejected; queued tasks are always
    /// rejected. `timeout` bounds the wait: on expiry this call rejects with
    /// `TimedOut` while the shutdown continues in the background.
    pub async fn terminate(
        &self,
        force: bool,
        timeout: Option<Duration>,
    ) -> Result<(), ExecError> {
        let (notify_tx, notify_rx) = oneshot::channel();
        if self
            .command_tx
            .send(PoolCommand::Terminate {
                force,
                notify: Some(notify_tx),
            })
            .is_err()
        {
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

    /// True once the pool has been terminated.
    pub fn terminated(&self) -> bool {
        self.shared.terminated.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("terminated", &self.terminated())
            .finish()
    }
}
