//! Handler event loop.
//!
//! All mutations of a handler's in-flight table, counters, and state flags
//! happen on this loop, in response to discrete events: caller commands,
//! transport messages, and timer fires. The loop runs until termination
//! cleanup completes.

use super::{Command, Shared};
use crate::error::{ExecError, ExitReport, TaskError};
use crate::options::{EventCallback, HandlerHooks, WorkerOptions};
use crate::protocol::{HandlerMessage, Request, Response, TaskId, WorkerMessage, READY_SIGNAL};
use crate::transport::{Control, Diagnostics, OutboundSender, Transport, TransportEvent, WorkerType};
use crate::deferred::Resolver;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

/// Ceiling on the graceful-shutdown handshake for process workers. A child
/// that ignores the termination signal is force-killed when this expires.
pub const CHILD_PROCESS_EXIT_TIMEOUT: Duration = Duration::from_millis(1000);

/// Period of the min/max timing-stats window reset.
pub const STATS_RESET_INTERVAL: Duration = Duration::from_secs(300);

/// One entry of the in-flight table. Exists iff its resolver is unsettled.
struct InFlightTask {
    resolver: Resolver,
    on_event: Option<EventCallback>,
    started: std::time::Instant,
}

pub(crate) struct HandlerCore {
    shared: Arc<Shared>,
    command_rx: mpsc::UnboundedReceiver<Command>,
    sender: OutboundSender,
    events: mpsc::UnboundedReceiver<TransportEvent>,
    control: Control,
    diagnostics: Diagnostics,
    substrate: WorkerType,
    script: String,
    hooks: HandlerHooks,

    mark_not_ready_after_exec: bool,
    ready_timeout: Option<Duration>,
    init_ready_timeout: Option<Duration>,

    in_flight: HashMap<TaskId, InFlightTask>,
    pending: VecDeque<HandlerMessage>,
    waiters: Vec<oneshot::Sender<Result<(), ExecError>>>,

    ready_deadline: Option<Instant>,
    exit_fallback: Option<Instant>,
    shutdown_requested: bool,
    commands_closed: bool,
    events_closed: bool,
    done: bool,
}

impl HandlerCore {
    pub(crate) fn new(
        shared: Arc<Shared>,
        command_rx: mpsc::UnboundedReceiver<Command>,
        transport: Transport,
        script: String,
        initially_ready: bool,
        options: &WorkerOptions,
        hooks: HandlerHooks,
    ) -> Self {
        let Transport {
            substrate,
            sender,
            events,
            control,
            diagnostics,
        } = transport;

        // An explicit script defers readiness to the worker's handshake,
        // bounded by the init deadline.
        let ready_deadline = if initially_ready {
            None
        } else {
            options
                .initial_ready_timeout()
                .map(|timeout| Instant::now() + timeout)
        };

        Self {
            shared,
            command_rx,
            sender,
            events,
            control,
            diagnostics,
            substrate,
            script,
            hooks,
            mark_not_ready_after_exec: options.mark_not_ready_after_exec,
            ready_timeout: options.ready_timeout,
            init_ready_timeout: options.init_ready_timeout,
            in_flight: HashMap::new(),
            pending: VecDeque::new(),
            waiters: Vec::new(),
            ready_deadline,
            exit_fallback: None,
            shutdown_requested: false,
            commands_closed: false,
            events_closed: false,
            done: false,
        }
    }

    pub(crate) async fn run(mut self) {
        if self.shared.ready.load(Ordering::SeqCst) {
            self.fire_ready_hook();
        }

        let mut stats_interval =
            tokio::time::interval_at(Instant::now() + STATS_RESET_INTERVAL, STATS_RESET_INTERVAL);
        stats_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        while !self.done {
            tokio::select! {
                biased;

                command = self.command_rx.recv(), if !self.commands_closed => match command {
                    Some(command) => self.handle_command(command),
                    None => self.handle_orphaned(),
                },

                event = self.events.recv(), if !self.events_closed => match event {
                    Some(event) => self.handle_transport_event(event),
                    None => self.handle_transport_closed(),
                },

                _ = sleep_until_opt(self.ready_deadline), if self.ready_deadline.is_some() => {
                    self.handle_ready_timeout();
                }

                _ = sleep_until_opt(self.exit_fallback), if self.exit_fallback.is_some() => {
                    self.handle_exit_fallback();
                }

                _ = stats_interval.tick() => self.reset_stats_window(),
            }
        }
    }

    // =========================================================================
    // Commands
    // =========================================================================

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Exec {
                id,
                method,
                params,
                resolver,
                on_event,
            } => self.handle_exec(id, method, params, resolver, on_event),
            Command::Abort { id, error } => self.handle_abort(id, error),
            Command::Terminate { force, notify } => {
                if let Some(notify) = notify {
                    self.waiters.push(notify);
                }
                self.attempt_termination(force);
            }
        }
    }

    fn handle_exec(
        &mut self,
        id: TaskId,
        method: String,
        params: Vec<Value>,
        mut resolver: Resolver,
        on_event: Option<EventCallback>,
    ) {
        if self.shared.terminated.load(Ordering::SeqCst) {
            self.shared.in_flight.fetch_sub(1, Ordering::SeqCst);
            resolver.reject(ExecError::WorkerTerminated);
            return;
        }

        self.in_flight.insert(
            id,
            InFlightTask {
                resolver,
                on_event,
                started: std::time::Instant::now(),
            },
        );

        let request = HandlerMessage::Request(Request { id, method, params });
        if self.shared.ready.load(Ordering::SeqCst) {
            if !self.sender.send(request) {
                debug!(task_id = id, "worker channel closed; request dropped");
            }
        } else {
            self.pending.push_back(request);
        }
    }

    /// Caller aborted its future (cancel or timeout): remove the task and
    /// force-terminate the worker, which cannot cancel tasks individually.
    fn handle_abort(&mut self, id: TaskId, error: ExecError) {
        let Some(mut task) = self.in_flight.remove(&id) else {
            return;
        };
        self.shared.in_flight.fetch_sub(1, Ordering::SeqCst);
        warn!(task_id = id, error = %error, script = %self.script, "task aborted by caller; force-terminating worker");
        task.resolver.reject(error);
        self.fire_task_done(id);
        self.attempt_termination(true);
    }

    // =========================================================================
    // Transport events
    // =========================================================================

    fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Message(message) => self.handle_message(message),
            TransportEvent::Error(message) => self.handle_transport_error(message),
            TransportEvent::Exit { exit_code, signal } => self.handle_exit(exit_code, signal),
        }
    }

    fn handle_message(&mut self, message: WorkerMessage) {
        if self.shared.terminated.load(Ordering::SeqCst) {
            return;
        }
        match message {
            WorkerMessage::Signal(signal) if signal == READY_SIGNAL => self.handle_ready(),
            WorkerMessage::Signal(signal) => {
                debug!(signal = %signal, "ignoring unknown worker signal");
            }
            WorkerMessage::Response(response) => self.handle_response(response),
        }
    }

    /// A readiness epoch: unblock dispatch and flush queued requests in
    /// submission order.
    fn handle_ready(&mut self) {
        self.ready_deadline = None;
        self.shared.ready.store(true, Ordering::SeqCst);
        self.fire_ready_hook();

        while let Some(message) = self.pending.pop_front() {
            if !self.sender.send(message) {
                break;
            }
        }
    }

    fn handle_response(&mut self, response: Response) {
        let id = response.id;

        if response.is_event {
            if let Some(task) = self.in_flight.get_mut(&id) {
                if let Some(on_event) = task.on_event.as_mut() {
                    on_event(response.payload.unwrap_or(Value::Null));
                }
            }
            return;
        }

        let Some(mut task) = self.in_flight.remove(&id) else {
            debug!(task_id = id, "dropping response for unknown task");
            return;
        };
        self.shared.in_flight.fetch_sub(1, Ordering::SeqCst);

        let time_spent = task.started.elapsed();
        self.record_response_time(time_spent);

        if self.mark_not_ready_after_exec {
            self.shared.ready.store(false, Ordering::SeqCst);
            if let Some(timeout) = self.ready_timeout {
                self.ready_deadline = Some(Instant::now() + timeout);
            }
        }

        let response_count = self.shared.response_count.load(Ordering::SeqCst);
        if self.shared.max_exec > 0 && response_count >= self.shared.max_exec {
            debug!(
                script = %self.script,
                response_count,
                max_exec = self.shared.max_exec,
                "worker reached its lifetime task cap; retiring"
            );
            self.shared.terminating.store(true, Ordering::SeqCst);
            self.fire_exit_hook();
        }

        if self.shared.terminating.load(Ordering::SeqCst) && self.in_flight.is_empty() {
            self.attempt_termination(false);
        }

        match response.error {
            Some(descriptor) => task
                .resolver
                .reject(ExecError::Task(TaskError::decode(descriptor))),
            None => task.resolver.resolve(response.result.unwrap_or(Value::Null)),
        }
        self.fire_task_done(id);
    }

    fn handle_transport_error(&mut self, message: String) {
        tracing::error!(script = %self.script, error = %message, "worker transport error");
        if self.control.can_kill() && !self.control.is_killed() {
            self.control.kill();
        }
        self.reject_all(ExecError::Worker(message));
        self.cleanup(Ok(()));
    }

    fn handle_exit(&mut self, exit_code: Option<i32>, signal: Option<i32>) {
        self.exit_fallback = None;

        if self.shutdown_requested || self.control.is_killed() {
            self.cleanup(Ok(()));
            return;
        }

        let report = ExitReport {
            exit_code,
            signal,
            script: self.script.clone(),
            spawn_args: self.diagnostics.spawn_args.clone(),
            spawn_file: self.diagnostics.spawn_file.clone(),
        };
        tracing::error!(script = %self.script, %report, "worker exited unexpectedly");
        self.reject_all(ExecError::UnexpectedExit(report));
        self.cleanup(Ok(()));
    }

    /// The event channel closed without an exit event. Treated as an exit
    /// with no status.
    fn handle_transport_closed(&mut self) {
        self.events_closed = true;
        if !self.shared.terminated.load(Ordering::SeqCst) {
            self.handle_exit(None, None);
        }
    }

    /// Every handle (and task future) is gone; nobody can command or observe
    /// this worker any more.
    fn handle_orphaned(&mut self) {
        self.commands_closed = true;
        if !self.shared.terminated.load(Ordering::SeqCst) {
            debug!(script = %self.script, "handler handle dropped; terminating worker");
            self.attempt_termination(true);
        }
    }

    // =========================================================================
    // Timers
    // =========================================================================

    fn handle_ready_timeout(&mut self) {
        self.ready_deadline = None;
        let timeout = self
            .ready_timeout
            .or(self.init_ready_timeout)
            .unwrap_or_default();
        warn!(
            script = %self.script,
            error = %ExecError::ReadyTimeout(timeout),
            "force-terminating worker"
        );
        self.attempt_termination(true);
    }

    fn handle_exit_fallback(&mut self) {
        self.exit_fallback = None;
        warn!(script = %self.script, "worker ignored termination signal; force-killing");
        self.control.kill();
    }

    fn reset_stats_window(&mut self) {
        if let Ok(mut timing) = self.shared.timing.lock() {
            timing.min = None;
            timing.max = Duration::ZERO;
        }
    }

    // =========================================================================
    // Termination
    // =========================================================================

    /// Termination state machine: `running → terminating → terminated`.
    ///
    /// `force` rejects in-flight work first; otherwise termination resumes
    /// when the last response arrives. Shutdown is substrate-specific:
    /// processes get the graceful signal with a forced-kill fallback, threads
    /// are killed synchronously.
    fn attempt_termination(&mut self, force: bool) {
        self.ready_deadline = None;

        if force {
            self.reject_all(ExecError::WorkerTerminated);
        }

        self.shared.terminating.store(true, Ordering::SeqCst);
        if !self.in_flight.is_empty() {
            return;
        }

        if self.control.can_kill() {
            if self.control.is_killed() {
                self.cleanup(Err(ExecError::AlreadyKilled));
            } else if self.substrate == WorkerType::Process {
                if self.shutdown_requested {
                    return;
                }
                self.shutdown_requested = true;
                self.exit_fallback = Some(Instant::now() + CHILD_PROCESS_EXIT_TIMEOUT);

                let signal = HandlerMessage::terminate();
                if self.shared.ready.load(Ordering::SeqCst) {
                    if !self.sender.send(signal) {
                        self.control.kill();
                    }
                } else {
                    // Delivered on readiness; the fallback timer bounds the
                    // wait if readiness never comes.
                    self.pending.push_back(signal);
                }
            } else {
                self.control.kill();
                self.cleanup(Ok(()));
            }
        } else if self.control.can_terminate() {
            self.control.terminate();
            self.cleanup(Ok(()));
        } else {
            self.cleanup(Err(ExecError::CannotTerminate));
        }
    }

    fn cleanup(&mut self, result: Result<(), ExecError>) {
        self.shared.terminated.store(true, Ordering::SeqCst);
        self.shared.terminating.store(false, Ordering::SeqCst);
        self.shared.ready.store(false, Ordering::SeqCst);
        self.ready_deadline = None;
        self.exit_fallback = None;
        self.fire_exit_hook();

        let had_waiters = !self.waiters.is_empty();
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(result.clone());
        }
        if let Err(error) = &result {
            if !had_waiters {
                tracing::error!(script = %self.script, error = %error, "worker termination failed");
            }
        }

        debug!(script = %self.script, "worker handler terminated");
        self.done = true;
    }

    fn reject_all(&mut self, error: ExecError) {
        if self.in_flight.is_empty() {
            return;
        }
        warn!(
            script = %self.script,
            count = self.in_flight.len(),
            error = %error,
            "rejecting in-flight tasks"
        );
        for (_, mut task) in self.in_flight.drain() {
            self.shared.in_flight.fetch_sub(1, Ordering::SeqCst);
            task.resolver.reject(error.clone());
        }
    }

    // =========================================================================
    // Stats and hooks
    // =========================================================================

    fn record_response_time(&mut self, time_spent: Duration) {
        self.shared.response_count.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut timing) = self.shared.timing.lock() {
            timing.total += time_spent;
            timing.last = Some(time_spent);
            timing.max = timing.max.max(time_spent);
            timing.min = Some(timing.min.map_or(time_spent, |min| min.min(time_spent)));
        }
    }

    fn fire_ready_hook(&mut self) {
        if let Some(on_ready) = self.hooks.on_ready.as_mut() {
            on_ready();
        }
    }

    fn fire_exit_hook(&mut self) {
        if let Some(on_exit) = self.hooks.on_exit.take() {
            on_exit();
        }
    }

    fn fire_task_done(&mut self, id: TaskId) {
        if let Some(on_task_done) = self.hooks.on_task_done.as_mut() {
            on_task_done(id);
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::WorkerHandler;
    use crate::options::ExecOptions;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    struct MockWorker {
        outbound: mpsc::UnboundedReceiver<HandlerMessage>,
        events: mpsc::UnboundedSender<TransportEvent>,
        kills: Arc<AtomicUsize>,
    }

    impl MockWorker {
        /// Next request delivered to the worker side.
        async fn next_request(&mut self) -> Request {
            loop {
                match tokio::time::timeout(Duration::from_secs(1), self.outbound.recv())
                    .await
                    .expect("no outbound message within 1s")
                    .expect("outbound channel closed")
                {
                    HandlerMessage::Request(request) => return request,
                    HandlerMessage::Signal(_) => continue,
                }
            }
        }

        async fn next_message(&mut self) -> Option<HandlerMessage> {
            tokio::time::timeout(Duration::from_millis(100), self.outbound.recv())
                .await
                .ok()
                .flatten()
        }

        fn send_ready(&self) {
            let _ = self
                .events
                .send(TransportEvent::Message(WorkerMessage::ready()));
        }

        fn respond(&self, response: Response) {
            let _ = self
                .events
                .send(TransportEvent::Message(WorkerMessage::Response(response)));
        }

        fn exit(&self, exit_code: Option<i32>, signal: Option<i32>) {
            let _ = self.events.send(TransportEvent::Exit { exit_code, signal });
        }
    }

    fn mock_handler(
        substrate: WorkerType,
        initially_ready: bool,
        options: WorkerOptions,
        hooks: HandlerHooks,
    ) -> (WorkerHandler, MockWorker) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let kills = Arc::new(AtomicUsize::new(0));
        let kill_count = Arc::clone(&kills);
        let control = Control::new(
            Some(Box::new(move || {
                kill_count.fetch_add(1, Ordering::SeqCst);
            })),
            None,
        );

        let transport = Transport {
            substrate,
            sender: OutboundSender::Process(outbound_tx),
            events: event_rx,
            control,
            diagnostics: Diagnostics::default(),
        };

        let handler = WorkerHandler::spawn_with_transport(
            transport,
            "mock".to_string(),
            initially_ready,
            options,
            hooks,
        );
        (
            handler,
            MockWorker {
                outbound: outbound_rx,
                events: event_tx,
                kills,
            },
        )
    }

    async fn wait_for(what: &str, condition: impl Fn() -> bool) {
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while !condition() {
            if std::time::Instant::now() > deadline {
                panic!("timed out waiting for {what}");
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_requests_before_ready_drain_in_submission_order() {
        let (handler, mut worker) = mock_handler(
            WorkerType::Thread,
            false,
            WorkerOptions::default(),
            HandlerHooks::default(),
        );

        let _first = handler.exec("first", vec![]);
        let _second = handler.exec("second", vec![]);
        let _third = handler.exec("third", vec![]);

        // Nothing is sent before the readiness signal.
        assert!(worker.next_message().await.is_none());
        assert!(!handler.ready());

        worker.send_ready();

        assert_eq!(worker.next_request().await.method, "first");
        assert_eq!(worker.next_request().await.method, "second");
        assert_eq!(worker.next_request().await.method, "third");
        assert!(handler.ready());
    }

    #[tokio::test]
    async fn test_task_ids_are_strictly_increasing_from_one() {
        let (handler, mut worker) = mock_handler(
            WorkerType::Thread,
            true,
            WorkerOptions {
                concurrency: 8,
                ..Default::default()
            },
            HandlerHooks::default(),
        );

        let _futures: Vec<_> = (0..4).map(|_| handler.exec("noop", vec![])).collect();
        for expected in 1..=4 {
            assert_eq!(worker.next_request().await.id, expected);
        }
    }

    #[tokio::test]
    async fn test_response_resolves_future_and_updates_stats() {
        let (handler, mut worker) = mock_handler(
            WorkerType::Thread,
            true,
            WorkerOptions::default(),
            HandlerHooks::default(),
        );

        let future = handler.exec("echo", vec![json!(42)]);
        let request = worker.next_request().await;
        worker.respond(Response::result(request.id, json!(42)));

        assert_eq!(future.await.unwrap(), json!(42));

        let stats = handler.stats();
        assert_eq!(stats.request_count, 1);
        assert_eq!(stats.response_count, 1);
        assert_eq!(stats.in_flight, 0);
        let last = stats.timing.last.expect("last time recorded");
        let min = stats.timing.min.expect("min time recorded");
        assert!(min <= last && last <= stats.timing.max);
        assert!(stats.timing.total >= last);
    }

    #[tokio::test]
    async fn test_events_are_delivered_before_terminal_response() {
        let (handler, mut worker) = mock_handler(
            WorkerType::Thread,
            true,
            WorkerOptions::default(),
            HandlerHooks::default(),
        );

        let seen: Arc<Mutex<Vec<Value>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let future = handler.exec_with_options(
            "stream",
            vec![],
            ExecOptions::with_event_sink(move |payload| sink.lock().unwrap().push(payload)),
        );

        let request = worker.next_request().await;
        worker.respond(Response::event(request.id, json!("a")));
        worker.respond(Response::event(request.id, json!("b")));
        worker.respond(Response::event(request.id, json!("c")));
        worker.respond(Response::result(request.id, json!("done")));

        assert_eq!(future.await.unwrap(), json!("done"));
        assert_eq!(*seen.lock().unwrap(), vec![json!("a"), json!("b"), json!("c")]);
    }

    #[tokio::test]
    async fn test_error_response_rejects_with_decoded_task_error() {
        let (handler, mut worker) = mock_handler(
            WorkerType::Thread,
            true,
            WorkerOptions::default(),
            HandlerHooks::default(),
        );

        let future = handler.exec("explode", vec![]);
        let request = worker.next_request().await;
        worker.respond(Response::error(
            request.id,
            crate::protocol::ErrorDescriptor::object("RangeError", "oops"),
        ));

        match future.await {
            Err(ExecError::Task(error)) => {
                assert_eq!(error.name, "RangeError");
                assert_eq!(error.message, "oops");
            }
            other => panic!("expected task error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_response_for_unknown_task_is_dropped() {
        let (handler, mut worker) = mock_handler(
            WorkerType::Thread,
            true,
            WorkerOptions::default(),
            HandlerHooks::default(),
        );

        worker.respond(Response::result(99, json!("stray")));

        let future = handler.exec("echo", vec![json!(1)]);
        let request = worker.next_request().await;
        worker.respond(Response::result(request.id, json!(1)));

        assert_eq!(future.await.unwrap(), json!(1));
        assert_eq!(handler.stats().response_count, 1);
    }

    #[tokio::test]
    async fn test_unexpected_exit_rejects_all_in_flight_tasks() {
        let exits = Arc::new(AtomicUsize::new(0));
        let exit_count = Arc::clone(&exits);
        let (handler, mut worker) = mock_handler(
            WorkerType::Thread,
            true,
            WorkerOptions {
                concurrency: 2,
                ..Default::default()
            },
            HandlerHooks {
                on_exit: Some(Box::new(move || {
                    exit_count.fetch_add(1, Ordering::SeqCst);
                })),
                ..Default::default()
            },
        );

        let first = handler.exec("slow", vec![]);
        let second = handler.exec("slow", vec![]);
        let _ = worker.next_request().await;
        let _ = worker.next_request().await;

        worker.exit(Some(1), None);

        let first_error = first.await.unwrap_err();
        let second_error = second.await.unwrap_err();
        for error in [&first_error, &second_error] {
            match error {
                ExecError::UnexpectedExit(report) => {
                    assert_eq!(report.exit_code, Some(1));
                    assert_eq!(report.script, "mock");
                }
                other => panic!("expected unexpected-exit error, got {:?}", other),
            }
        }

        wait_for("handler termination", || handler.terminated()).await;
        assert_eq!(exits.load(Ordering::SeqCst), 1);
        assert_eq!(handler.stats().in_flight, 0);
    }

    #[tokio::test]
    async fn test_graceful_termination_drains_in_flight_work() {
        let (handler, mut worker) = mock_handler(
            WorkerType::Thread,
            true,
            WorkerOptions::default(),
            HandlerHooks::default(),
        );

        let future = handler.exec("slow", vec![]);
        let request = worker.next_request().await;

        handler.terminate(false);
        wait_for("terminating state", || handler.terminating()).await;
        assert!(!handler.terminated());

        worker.respond(Response::result(request.id, json!("late")));
        assert_eq!(future.await.unwrap(), json!("late"));

        wait_for("handler termination", || handler.terminated()).await;
        assert_eq!(worker.kills.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_forced_termination_rejects_in_flight_tasks() {
        let (handler, mut worker) = mock_handler(
            WorkerType::Thread,
            true,
            WorkerOptions {
                concurrency: 3,
                ..Default::default()
            },
            HandlerHooks::default(),
        );

        let futures: Vec<_> = (0..3).map(|_| handler.exec("slow", vec![])).collect();
        for _ in 0..3 {
            let _ = worker.next_request().await;
        }

        handler
            .terminate_and_wait(true, None)
            .await
            .expect("termination failed");

        for future in futures {
            assert!(matches!(future.await, Err(ExecError::WorkerTerminated)));
        }
        assert!(handler.terminated());
        assert_eq!(handler.stats().in_flight, 0);
    }

    #[tokio::test]
    async fn test_max_exec_retires_worker_after_cap() {
        let exits = Arc::new(AtomicUsize::new(0));
        let exit_count = Arc::clone(&exits);
        let (handler, mut worker) = mock_handler(
            WorkerType::Thread,
            true,
            WorkerOptions {
                max_exec: 2,
                concurrency: 2,
                ..Default::default()
            },
            HandlerHooks {
                on_exit: Some(Box::new(move || {
                    exit_count.fetch_add(1, Ordering::SeqCst);
                })),
                ..Default::default()
            },
        );

        let first = handler.exec("task", vec![]);
        let second = handler.exec("task", vec![]);
        assert!(!handler.available(), "lifetime cap reached at submission");

        let request = worker.next_request().await;
        worker.respond(Response::result(request.id, json!(1)));
        assert_eq!(first.await.unwrap(), json!(1));
        assert!(!handler.terminated());

        let request = worker.next_request().await;
        worker.respond(Response::result(request.id, json!(2)));
        assert_eq!(second.await.unwrap(), json!(2));

        wait_for("worker retirement", || handler.terminated()).await;
        assert_eq!(exits.load(Ordering::SeqCst), 1);

        assert!(matches!(
            handler.exec("late", vec![]).await,
            Err(ExecError::WorkerTerminated)
        ));
    }

    #[tokio::test]
    async fn test_mark_not_ready_after_exec_rearms_handshake() {
        let (handler, mut worker) = mock_handler(
            WorkerType::Thread,
            true,
            WorkerOptions {
                mark_not_ready_after_exec: true,
                ready_timeout: Some(Duration::from_millis(40)),
                ..Default::default()
            },
            HandlerHooks::default(),
        );

        let future = handler.exec("task", vec![]);
        let request = worker.next_request().await;
        worker.respond(Response::result(request.id, json!("ok")));
        assert_eq!(future.await.unwrap(), json!("ok"));

        wait_for("not-ready after completion", || !handler.ready()).await;

        // No fresh readiness signal arrives; the deadline force-terminates.
        wait_for("readiness-timeout termination", || handler.terminated()).await;
        assert!(worker.kills.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn test_fresh_ready_signal_reopens_dispatch() {
        let (handler, mut worker) = mock_handler(
            WorkerType::Thread,
            true,
            WorkerOptions {
                mark_not_ready_after_exec: true,
                ready_timeout: Some(Duration::from_secs(5)),
                ..Default::default()
            },
            HandlerHooks::default(),
        );

        let future = handler.exec("one", vec![]);
        let request = worker.next_request().await;
        worker.respond(Response::result(request.id, json!(1)));
        future.await.unwrap();

        wait_for("not-ready after completion", || !handler.ready()).await;

        // Queued until the fresh readiness signal.
        let queued = handler.exec("two", vec![]);
        assert!(worker.next_message().await.is_none());

        worker.send_ready();
        let request = worker.next_request().await;
        assert_eq!(request.method, "two");
        worker.respond(Response::result(request.id, json!(2)));
        assert_eq!(queued.await.unwrap(), json!(2));
    }

    #[tokio::test]
    async fn test_cancel_rejects_task_and_force_terminates() {
        let (handler, mut worker) = mock_handler(
            WorkerType::Thread,
            true,
            WorkerOptions::default(),
            HandlerHooks::default(),
        );

        let future = handler.exec("slow", vec![]);
        let _ = worker.next_request().await;

        future.cancel();
        assert!(matches!(future.await, Err(ExecError::Cancelled)));

        wait_for("forced termination after cancel", || handler.terminated()).await;
        assert!(worker.kills.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn test_timeout_rejects_task_and_force_terminates() {
        let (handler, mut worker) = mock_handler(
            WorkerType::Thread,
            true,
            WorkerOptions::default(),
            HandlerHooks::default(),
        );

        let future = handler
            .exec("slow", vec![])
            .with_timeout(Duration::from_millis(30));
        let _ = worker.next_request().await;

        assert!(matches!(future.await, Err(ExecError::TimedOut(_))));
        wait_for("forced termination after timeout", || handler.terminated()).await;
    }

    #[tokio::test]
    async fn test_init_ready_timeout_terminates_unready_worker() {
        let (handler, _worker) = mock_handler(
            WorkerType::Thread,
            false,
            WorkerOptions {
                init_ready_timeout: Some(Duration::from_millis(40)),
                ..Default::default()
            },
            HandlerHooks::default(),
        );

        let future = handler.exec("never", vec![]);
        assert!(matches!(future.await, Err(ExecError::WorkerTerminated)));
        assert!(handler.terminated());
    }

    #[tokio::test]
    async fn test_process_graceful_shutdown_sends_signal_then_waits_for_exit() {
        let (handler, mut worker) = mock_handler(
            WorkerType::Process,
            true,
            WorkerOptions::default(),
            HandlerHooks::default(),
        );

        let handler = Arc::new(handler);
        let waiter = {
            let handler = Arc::clone(&handler);
            tokio::spawn(async move { handler.terminate_and_wait(false, None).await })
        };

        match worker.next_message().await {
            Some(message) => assert!(message.is_terminate()),
            None => panic!("termination signal not sent"),
        }
        assert!(!handler.terminated(), "waits for the exit event");

        worker.exit(Some(0), None);
        waiter.await.unwrap().expect("termination failed");
        assert!(handler.terminated());
        assert_eq!(worker.kills.load(Ordering::SeqCst), 0, "no forced kill");
    }

    #[tokio::test]
    async fn test_terminate_and_wait_times_out_but_shutdown_continues() {
        let (handler, mut worker) = mock_handler(
            WorkerType::Process,
            true,
            WorkerOptions::default(),
            HandlerHooks::default(),
        );

        let result = handler
            .terminate_and_wait(false, Some(Duration::from_millis(30)))
            .await;
        assert!(matches!(result, Err(ExecError::TimedOut(_))));

        // The underlying shutdown still completes once the worker exits.
        worker.exit(Some(0), None);
        wait_for("handler termination", || handler.terminated()).await;
    }

    #[tokio::test]
    async fn test_exec_on_terminated_handler_rejects() {
        let (handler, _worker) = mock_handler(
            WorkerType::Thread,
            true,
            WorkerOptions::default(),
            HandlerHooks::default(),
        );

        handler
            .terminate_and_wait(true, None)
            .await
            .expect("termination failed");

        assert!(matches!(
            handler.exec("late", vec![]).await,
            Err(ExecError::WorkerTerminated)
        ));
    }

    #[tokio::test]
    async fn test_ready_hook_fires_per_epoch() {
        let readies = Arc::new(AtomicUsize::new(0));
        let ready_count = Arc::clone(&readies);
        let (handler, mut worker) = mock_handler(
            WorkerType::Thread,
            true,
            WorkerOptions {
                mark_not_ready_after_exec: true,
                ready_timeout: Some(Duration::from_secs(5)),
                ..Default::default()
            },
            HandlerHooks {
                on_ready: Some(Box::new(move || {
                    ready_count.fetch_add(1, Ordering::SeqCst);
                })),
                ..Default::default()
            },
        );

        wait_for("initial ready hook", || readies.load(Ordering::SeqCst) == 1).await;

        let future = handler.exec("task", vec![]);
        let request = worker.next_request().await;
        worker.respond(Response::result(request.id, json!(1)));
        future.await.unwrap();

        worker.send_ready();
        wait_for("second ready epoch", || readies.load(Ordering::SeqCst) == 2).await;
    }
}
