//! Pool scheduler loop.
//!
//! Owns the worker set and the task queue. All scheduling decisions happen
//! here, driven by caller commands and handler events (readiness epochs,
//! task completions, worker exits).

use super::{PoolConfig, PoolShared, PoolStats};
use crate::deferred::Resolver;
use crate::error::ExecError;
use crate::handler::WorkerHandler;
use crate::options::{EventCallback, HandlerHooks};
use crate::protocol::TaskId;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// Pool-local worker identifier.
type WorkerId = u64;

/// Commands from the public [`super::Pool`] handle.
pub(crate) enum PoolCommand {
    Exec {
        ticket: u64,
        method: String,
        params: Vec<Value>,
        resolver: Resolver,
        on_event: Option<EventCallback>,
    },
    Abort {
        ticket: u64,
        error: ExecError,
    },
    Terminate {
        force: bool,
        notify: Option<oneshot::Sender<Result<(), ExecError>>>,
    },
    Stats {
        reply: oneshot::Sender<PoolStats>,
    },
}

/// Handler notifications routed into the scheduler loop.
enum PoolEvent {
    Ready(WorkerId),
    Exit(WorkerId),
    TaskDone(WorkerId, TaskId),
}

/// A task waiting for a worker.
struct PendingTask {
    ticket: u64,
    method: String,
    params: Vec<Value>,
    resolver: Resolver,
    on_event: Option<EventCallback>,
}

pub(crate) struct PoolRunner {
    config: PoolConfig,
    shared: Arc<PoolShared>,
    command_rx: mpsc::UnboundedReceiver<PoolCommand>,
    event_tx: mpsc::UnboundedSender<PoolEvent>,
    event_rx: mpsc::UnboundedReceiver<PoolEvent>,

    workers: HashMap<WorkerId, WorkerHandler>,
    next_worker_id: WorkerId,
    queue: VecDeque<PendingTask>,
    /// Ticket → dispatched location, for abort routing.
    dispatched: HashMap<u64, (WorkerId, TaskId)>,

    terminating: bool,
    commands_closed: bool,
    done: bool,
}

impl PoolRunner {
    pub(crate) fn new(
        config: PoolConfig,
        shared: Arc<PoolShared>,
        command_rx: mpsc::UnboundedReceiver<PoolCommand>,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        Self {
            config,
            shared,
            command_rx,
            event_tx,
            event_rx,
            workers: HashMap::new(),
            next_worker_id: 0,
            queue: VecDeque::new(),
            dispatched: HashMap::new(),
            terminating: false,
            commands_closed: false,
            done: false,
        }
    }

    pub(crate) async fn run(mut self) {
        for _ in 0..self.config.min_workers.min(self.config.max_workers) {
            if let Err(error) = self.spawn_worker() {
                warn!(error = %error, "failed to spawn eager pool worker");
                break;
            }
        }

        while !self.done {
            tokio::select! {
                biased;

                command = self.command_rx.recv(), if !self.commands_closed => match command {
                    Some(command) => self.handle_command(command).await,
                    None => {
                        // Pool handle dropped: tear everything down.
                        self.commands_closed = true;
                        self.shutdown(true, None).await;
                    }
                },

                Some(event) = self.event_rx.recv() => self.handle_event(event),
            }
        }
    }

    async fn handle_command(&mut self, command: PoolCommand) {
        match command {
            PoolCommand::Exec {
                ticket,
                method,
                params,
                mut resolver,
                on_event,
            } => {
                if self.terminating {
                    resolver.reject(ExecError::WorkerTerminated);
                    return;
                }
                if let Some(limit) = self.config.max_queue_size {
                    if self.queue.len() >= limit {
                        resolver.reject(ExecError::QueueFull(limit));
                        return;
                    }
                }
                self.queue.push_back(PendingTask {
                    ticket,
                    method,
                    params,
                    resolver,
                    on_event,
                });
                self.drain();
            }
            PoolCommand::Abort { ticket, error } => self.handle_abort(ticket, error),
            PoolCommand::Terminate { force, notify } => self.shutdown(force, notify).await,
            PoolCommand::Stats { reply } => {
                // Account for completions already signalled but not yet
                // selected, so snapshots are consistent with settled futures.
                self.flush_events();
                let _ = reply.send(self.stats());
            }
        }
    }

    fn flush_events(&mut self) {
        while let Ok(event) = self.event_rx.try_recv() {
            self.handle_event(event);
        }
    }

    fn handle_event(&mut self, event: PoolEvent) {
        match event {
            PoolEvent::Ready(worker_id) => {
                debug!(worker_id, "pool worker ready");
                self.drain();
            }
            PoolEvent::TaskDone(worker_id, task_id) => {
                self.dispatched
                    .retain(|_, location| *location != (worker_id, task_id));
                self.drain();
            }
            PoolEvent::Exit(worker_id) => self.handle_worker_exit(worker_id),
        }
    }

    /// A queued task was cancelled in place; a dispatched one is aborted on
    /// its handler (which force-terminates that worker).
    fn handle_abort(&mut self, ticket: u64, error: ExecError) {
        if let Some(position) = self.queue.iter().position(|task| task.ticket == ticket) {
            if let Some(mut task) = self.queue.remove(position) {
                debug!(ticket, error = %error, "cancelled queued task");
                task.resolver.reject(error);
            }
            return;
        }
        if let Some((worker_id, task_id)) = self.dispatched.remove(&ticket) {
            if let Some(worker) = self.workers.get(&worker_id) {
                worker.abort_task(task_id, error);
            }
        }
    }

    /// Decommissions an exited worker and replaces it when demand requires.
    fn handle_worker_exit(&mut self, worker_id: WorkerId) {
        debug!(worker_id, "pool worker exited");
        self.workers.remove(&worker_id);
        // In-flight tasks of this worker were rejected by its handler.
        self.dispatched.retain(|_, (w, _)| *w != worker_id);

        if self.terminating {
            return;
        }
        if self.workers.len() < self.config.min_workers {
            if let Err(error) = self.spawn_worker() {
                warn!(error = %error, "failed to replace exited worker");
            }
        }
        self.drain();
    }

    /// Serves queued tasks: dispatch to available workers, then grow up to
    /// the cap with one new worker per unserved task. A freshly spawned
    /// handshake worker counts toward demand until its readiness epoch.
    fn drain(&mut self) {
        while !self.queue.is_empty() {
            let Some(worker_id) = self.find_available_worker() else {
                break;
            };
            if let Some(task) = self.queue.pop_front() {
                self.dispatch(worker_id, task);
            }
        }

        if self.queue.is_empty() || self.terminating {
            return;
        }

        let starting = self
            .workers
            .values()
            .filter(|worker| !worker.ready() && !worker.terminating() && !worker.terminated())
            .count();
        let mut wanted = self.queue.len().saturating_sub(starting);

        while wanted > 0 && self.workers.len() < self.config.max_workers {
            match self.spawn_worker() {
                Ok(worker_id) => {
                    wanted -= 1;
                    // Default workers are ready immediately; serve the queue
                    // without waiting for an epoch event.
                    let ready_now = self
                        .workers
                        .get(&worker_id)
                        .is_some_and(|worker| worker.available());
                    if ready_now {
                        if let Some(task) = self.queue.pop_front() {
                            self.dispatch(worker_id, task);
                        }
                    }
                }
                Err(error) => {
                    warn!(error = %error, "failed to grow pool");
                    if let Some(mut task) = self.queue.pop_front() {
                        task.resolver.reject(error);
                    }
                    break;
                }
            }
        }
    }

    fn find_available_worker(&self) -> Option<WorkerId> {
        self.workers
            .iter()
            .find(|(_, worker)| worker.available())
            .map(|(id, _)| *id)
    }

    fn dispatch(&mut self, worker_id: WorkerId, task: PendingTask) {
        let Some(worker) = self.workers.get(&worker_id) else {
            self.queue.push_front(task);
            return;
        };
        let task_id = worker.submit_task(task.method, task.params, task.resolver, task.on_event);
        self.dispatched.insert(task.ticket, (worker_id, task_id));
    }

    fn spawn_worker(&mut self) -> Result<WorkerId, ExecError> {
        let worker_id = self.next_worker_id;
        self.next_worker_id += 1;

        let ready_tx = self.event_tx.clone();
        let exit_tx = self.event_tx.clone();
        let done_tx = self.event_tx.clone();
        let hooks = HandlerHooks {
            on_ready: Some(Box::new(move || {
                let _ = ready_tx.send(PoolEvent::Ready(worker_id));
            })),
            on_exit: Some(Box::new(move || {
                let _ = exit_tx.send(PoolEvent::Exit(worker_id));
            })),
            on_task_done: Some(Box::new(move |task_id| {
                let _ = done_tx.send(PoolEvent::TaskDone(worker_id, task_id));
            })),
        };

        let handler =
            WorkerHandler::spawn(self.config.script.clone(), self.config.worker.clone(), hooks)?;
        debug!(worker_id, script = %handler.script(), "spawned pool worker");
        self.workers.insert(worker_id, handler);
        Ok(worker_id)
    }

    fn stats(&self) -> PoolStats {
        let busy_workers = self.workers.values().filter(|worker| worker.busy()).count();
        PoolStats {
            total_workers: self.workers.len(),
            busy_workers,
            idle_workers: self.workers.len() - busy_workers,
            pending_tasks: self.queue.len(),
            active_tasks: self.dispatched.len(),
        }
    }

    /// Rejects queued work, terminates every worker, and retires the loop.
    async fn shutdown(
        &mut self,
        force: bool,
        notify: Option<oneshot::Sender<Result<(), ExecError>>>,
    ) {
        self.terminating = true;
        self.shared.terminated.store(true, Ordering::SeqCst);

        for mut task in self.queue.drain(..) {
            task.resolver.reject(ExecError::WorkerTerminated);
        }

        let mut joins = Vec::new();
        for (_, worker) in self.workers.drain() {
            joins.push(tokio::spawn(async move {
                worker.terminate_and_wait(force, None).await
            }));
        }

        let mut result = Ok(());
        for join in joins {
            match join.await {
                Ok(Ok(())) => {}
                Ok(Err(error)) => result = Err(error),
                Err(_) => result = Err(ExecError::Worker("worker termination panicked".to_string())),
            }
        }

        match notify {
            Some(notify) => {
                let _ = notify.send(result);
            }
            None => {
                if let Err(error) = result {
                    warn!(error = %error, "pool shutdown finished with an error");
                }
            }
        }
        self.done = true;
    }
}
