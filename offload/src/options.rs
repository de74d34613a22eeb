//! Handler configuration: worker scripts, spawn parameters, caps, and
//! upward notification hooks.

use crate::protocol::TaskId;
use crate::transport::WorkerType;
use crate::worker::MethodRegistry;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Default maximum simultaneously in-flight tasks per worker.
pub const DEFAULT_CONCURRENCY: usize = 1;

/// File name of the default process-substrate worker payload.
pub const DEFAULT_WORKER_PROGRAM: &str = "offload-worker";

// =============================================================================
// Worker scripts
// =============================================================================

/// Opaque locator of a worker payload.
///
/// The payload kind determines which substrate can run it: a program path
/// needs a child process; a method registry needs a dedicated thread.
#[derive(Clone)]
pub enum WorkerScript {
    /// An executable speaking the wire protocol over stdio.
    Program(PathBuf),
    /// A method table run by the built-in dispatch loop on an OS thread.
    Registry(Arc<MethodRegistry>),
}

impl WorkerScript {
    /// Short description used in diagnostics and exit reports.
    pub fn describe(&self) -> String {
        match self {
            Self::Program(path) => path.display().to_string(),
            Self::Registry(registry) => format!("registry({} methods)", registry.names().len()),
        }
    }
}

impl std::fmt::Debug for WorkerScript {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "WorkerScript({})", self.describe())
    }
}

/// Resolves the default process-substrate worker program.
///
/// The `offload-worker` binary is expected next to the current executable;
/// test binaries live one directory below the bin output, so the parent
/// directory is probed as a fallback. The path is returned even when the
/// probe fails — spawning then reports the real error.
pub fn default_worker_program() -> Result<PathBuf, std::io::Error> {
    let exe = std::env::current_exe()?;
    let name = format!("{}{}", DEFAULT_WORKER_PROGRAM, std::env::consts::EXE_SUFFIX);

    let Some(dir) = exe.parent() else {
        return Ok(PathBuf::from(name));
    };

    let sibling = dir.join(&name);
    if sibling.exists() {
        return Ok(sibling);
    }
    if let Some(parent) = dir.parent() {
        let above = parent.join(&name);
        if above.exists() {
            return Ok(above);
        }
    }
    Ok(sibling)
}

// =============================================================================
// Spawn parameters
// =============================================================================

/// Child-process spawn parameters (process substrate only).
#[derive(Debug, Clone, Default)]
pub struct ForkOptions {
    /// Working directory for the child.
    pub cwd: Option<PathBuf>,
    /// Extra environment variables for the child.
    pub envs: Vec<(String, String)>,
}

/// OS-thread spawn parameters (thread substrate only).
#[derive(Debug, Clone, Default)]
pub struct ThreadOptions {
    /// Stack size in bytes; substrate default when absent.
    pub stack_size: Option<usize>,
}

// =============================================================================
// Worker options
// =============================================================================

/// Per-handler configuration.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Substrate selection.
    pub worker_type: WorkerType,
    /// Argument tail appended to the child-process argv (process only).
    pub fork_args: Vec<String>,
    /// Child-process spawn parameters (process only).
    pub fork_opts: ForkOptions,
    /// OS-thread spawn parameters (thread only).
    pub thread_opts: ThreadOptions,
    /// Port substituted into inherited `--inspect` flags.
    pub debug_port: Option<u16>,
    /// Host argv inspected for inheritable debug flags. `None` reads the
    /// real process arguments; tests inject a slice.
    pub exec_argv: Option<Vec<String>>,
    /// Maximum simultaneously in-flight tasks.
    pub concurrency: usize,
    /// Maximum lifetime tasks before auto-retirement; 0 = unbounded.
    pub max_exec: u64,
    /// Return the worker to not-ready after each completed task, until a
    /// fresh readiness signal arrives.
    pub mark_not_ready_after_exec: bool,
    /// Deadline for each readiness wait; expiry force-terminates the worker.
    pub ready_timeout: Option<Duration>,
    /// Deadline for the first readiness wait; defaults to `ready_timeout`.
    pub init_ready_timeout: Option<Duration>,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            worker_type: WorkerType::Auto,
            fork_args: Vec::new(),
            fork_opts: ForkOptions::default(),
            thread_opts: ThreadOptions::default(),
            debug_port: None,
            exec_argv: None,
            concurrency: DEFAULT_CONCURRENCY,
            max_exec: 0,
            mark_not_ready_after_exec: false,
            ready_timeout: None,
            init_ready_timeout: None,
        }
    }
}

impl WorkerOptions {
    /// The deadline governing the first readiness wait.
    pub fn initial_ready_timeout(&self) -> Option<Duration> {
        self.init_ready_timeout.or(self.ready_timeout)
    }
}

// =============================================================================
// Exec options and hooks
// =============================================================================

/// Sink for streamed event payloads of one task.
pub type EventCallback = Box<dyn FnMut(Value) + Send>;

/// Per-task options.
#[derive(Default)]
pub struct ExecOptions {
    /// Receives each `isEvent` payload, strictly before the terminal
    /// response settles the task's future.
    pub on_event: Option<EventCallback>,
}

impl ExecOptions {
    /// Options with an event sink.
    pub fn with_event_sink(on_event: impl FnMut(Value) + Send + 'static) -> Self {
        Self {
            on_event: Some(Box::new(on_event)),
        }
    }
}

impl std::fmt::Debug for ExecOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecOptions")
            .field("on_event", &self.on_event.is_some())
            .finish()
    }
}

/// Upward notifications from a handler to its owner.
///
/// Handlers never reference their owner; these hooks are the only channel
/// back. `on_ready` fires on every readiness epoch (the owner needs each
/// epoch as a dispatch trigger); `on_exit` fires at most once, when the
/// worker leaves service; `on_task_done` fires per settled task and carries
/// the task id.
#[derive(Default)]
pub struct HandlerHooks {
    /// Fired on each readiness epoch.
    pub on_ready: Option<Box<dyn FnMut() + Send>>,
    /// Fired at most once, when the worker leaves service.
    pub on_exit: Option<Box<dyn FnOnce() + Send>>,
    /// Fired after each task settles, with the task id.
    pub on_task_done: Option<Box<dyn FnMut(TaskId) + Send>>,
}

impl std::fmt::Debug for HandlerHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerHooks")
            .field("on_ready", &self.on_ready.is_some())
            .field("on_exit", &self.on_exit.is_some())
            .field("on_task_done", &self.on_task_done.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_options_defaults() {
        let options = WorkerOptions::default();
        assert_eq!(options.worker_type, WorkerType::Auto);
        assert_eq!(options.concurrency, DEFAULT_CONCURRENCY);
        assert_eq!(options.max_exec, 0);
        assert!(!options.mark_not_ready_after_exec);
        assert!(options.ready_timeout.is_none());
    }

    #[test]
    fn test_initial_ready_timeout_falls_back_to_ready_timeout() {
        let mut options = WorkerOptions {
            ready_timeout: Some(Duration::from_secs(5)),
            ..Default::default()
        };
        assert_eq!(options.initial_ready_timeout(), Some(Duration::from_secs(5)));

        options.init_ready_timeout = Some(Duration::from_secs(30));
        assert_eq!(
            options.initial_ready_timeout(),
            Some(Duration::from_secs(30))
        );
    }

    #[test]
    fn test_script_descriptions() {
        let program = WorkerScript::Program(PathBuf::from("/usr/bin/worker"));
        assert_eq!(program.describe(), "/usr/bin/worker");

        let registry = WorkerScript::Registry(Arc::new(MethodRegistry::builtin()));
        assert!(registry.describe().starts_with("registry("));
    }

    #[test]
    fn test_default_worker_program_names_the_binary() {
        let path = default_worker_program().unwrap();
        let name = path.file_name().unwrap().to_string_lossy();
        assert!(name.starts_with(DEFAULT_WORKER_PROGRAM));
    }
}
