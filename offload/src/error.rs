//! Error types for the dispatch engine.
//!
//! A single cloneable enum covers every failure the engine can surface.
//! Cloneability matters: one transport failure must reject every in-flight
//! task with the same error, and termination waiters receive the same
//! outcome the cleanup path observed.

use crate::protocol::ErrorDescriptor;
use crate::transport::WorkerType;
use serde_json::{Map, Value};
use std::time::Duration;
use thiserror::Error;

/// Errors produced by handlers, transports, and the pool scheduler.
#[derive(Debug, Clone, Error)]
pub enum ExecError {
    /// The requested worker substrate is not available on this host, or the
    /// supplied script cannot run on the requested substrate.
    #[error("worker type {0} is not supported on this host")]
    UnsupportedSubstrate(WorkerType),

    /// Operation attempted against a terminated handler, or a task rejected
    /// during forced termination.
    #[error("worker is terminated")]
    WorkerTerminated,

    /// Termination requested on a worker whose transport reports it was
    /// already killed.
    #[error("worker is already killed")]
    AlreadyKilled,

    /// The transport exposes neither a kill nor a terminate capability.
    #[error("worker transport cannot be terminated")]
    CannotTerminate,

    /// The worker exited without a prior graceful-termination request.
    #[error("{0}")]
    UnexpectedExit(ExitReport),

    /// The transport signalled an asynchronous error.
    #[error("worker error: {0}")]
    Worker(String),

    /// A task-level error decoded from a response's `error` field.
    #[error(transparent)]
    Task(#[from] TaskError),

    /// The readiness timer expired. Surfaced as a termination cause; callers
    /// of `exec` observe `WorkerTerminated` instead.
    #[error("worker was not ready within {0:?}")]
    ReadyTimeout(Duration),

    /// The caller cancelled the task's future.
    #[error("task was cancelled")]
    Cancelled,

    /// The caller's deadline on the task's future expired.
    #[error("task timed out after {0:?}")]
    TimedOut(Duration),

    /// The worker could not be spawned.
    #[error("failed to spawn worker: {0}")]
    Spawn(String),

    /// The pool's task queue is at capacity.
    #[error("task queue is full (limit {0})")]
    QueueFull(usize),
}

impl ExecError {
    /// True for the two rejection kinds that originate in the caller's
    /// future and force-terminate the owning handler.
    pub fn is_abort(&self) -> bool {
        matches!(self, Self::Cancelled | Self::TimedOut(_))
    }
}

// =============================================================================
// Task errors (decoded from the wire)
// =============================================================================

/// An error raised by a worker method, decoded from an [`ErrorDescriptor`].
///
/// Round-trips through the codec: `name`, `message`, `stack`, and any custom
/// enumerable properties survive encode/decode unchanged.
#[derive(Debug, Clone, Error)]
#[error("{name}: {message}")]
pub struct TaskError {
    /// Error class name. Defaults to `"Error"` for string descriptors.
    pub name: String,
    /// Human-readable message.
    pub message: String,
    /// Worker-side stack trace, when the worker provided one.
    pub stack: Option<String>,
    /// Custom properties beyond the recognised trio.
    pub properties: Map<String, Value>,
}

impl TaskError {
    /// Creates a task error with the default name.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            name: "Error".to_string(),
            message: message.into(),
            stack: None,
            properties: Map::new(),
        }
    }

    /// Creates a task error with an explicit name.
    pub fn named(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            stack: None,
            properties: Map::new(),
        }
    }

    /// Decodes a wire descriptor into a task error.
    ///
    /// A string descriptor becomes an error with that string as its message;
    /// an object descriptor has its enumerable properties copied over.
    pub fn decode(descriptor: ErrorDescriptor) -> Self {
        match descriptor {
            ErrorDescriptor::Message(message) => Self::new(message),
            ErrorDescriptor::Object(mut props) => {
                let name = take_string(&mut props, "name").unwrap_or_else(|| "Error".to_string());
                let message = take_string(&mut props, "message").unwrap_or_default();
                let stack = take_string(&mut props, "stack");
                Self {
                    name,
                    message,
                    stack,
                    properties: props,
                }
            }
        }
    }

    /// Encodes this error back into a wire descriptor, preserving all
    /// properties.
    pub fn encode(&self) -> ErrorDescriptor {
        let mut props = Map::new();
        props.insert("name".to_string(), Value::String(self.name.clone()));
        props.insert("message".to_string(), Value::String(self.message.clone()));
        if let Some(stack) = &self.stack {
            props.insert("stack".to_string(), Value::String(stack.clone()));
        }
        for (key, value) in &self.properties {
            props.insert(key.clone(), value.clone());
        }
        ErrorDescriptor::Object(props)
    }
}

fn take_string(props: &mut Map<String, Value>, key: &str) -> Option<String> {
    match props.remove(key) {
        Some(Value::String(s)) => Some(s),
        Some(other) => {
            // Non-string values for recognised keys are kept verbatim.
            props.insert(key.to_string(), other);
            None
        }
        None => None,
    }
}

// =============================================================================
// Exit reports
// =============================================================================

/// Diagnostic record for a worker that exited without being asked to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExitReport {
    /// Process exit code, when the worker exited normally.
    pub exit_code: Option<i32>,
    /// Signal number that killed the worker, when applicable.
    pub signal: Option<i32>,
    /// Description of the worker payload (program path or registry).
    pub script: String,
    /// Argument vector the transport spawned the worker with, when known.
    pub spawn_args: Vec<String>,
    /// Program file the transport spawned, when known.
    pub spawn_file: Option<String>,
}

impl std::fmt::Display for ExitReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "worker exited unexpectedly (exit_code: {}, signal: {}, script: {})",
            self.exit_code.map_or_else(|| "none".to_string(), |c| c.to_string()),
            self.signal.map_or_else(|| "none".to_string(), |s| s.to_string()),
            self.script,
        )?;
        if let Some(file) = &self.spawn_file {
            write!(f, " (spawn_file: {})", file)?;
        }
        if !self.spawn_args.is_empty() {
            write!(f, " (spawn_args: {})", self.spawn_args.join(" "))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_string_descriptor() {
        let err = TaskError::decode(ErrorDescriptor::Message("oops".to_string()));
        assert_eq!(err.name, "Error");
        assert_eq!(err.message, "oops");
        assert!(err.stack.is_none());
        assert!(err.properties.is_empty());
    }

    #[test]
    fn test_decode_object_descriptor() {
        let mut props = Map::new();
        props.insert("name".to_string(), json!("RangeError"));
        props.insert("message".to_string(), json!("out of range"));
        props.insert("stack".to_string(), json!("at line 1"));
        props.insert("code".to_string(), json!(42));

        let err = TaskError::decode(ErrorDescriptor::Object(props));
        assert_eq!(err.name, "RangeError");
        assert_eq!(err.message, "out of range");
        assert_eq!(err.stack.as_deref(), Some("at line 1"));
        assert_eq!(err.properties.get("code"), Some(&json!(42)));
    }

    #[test]
    fn test_encode_decode_round_trip_preserves_properties() {
        let mut original = TaskError::named("TypeError", "bad argument");
        original.stack = Some("frame 0".to_string());
        original.properties.insert("hint".to_string(), json!("pass a number"));

        let decoded = TaskError::decode(original.encode());
        assert_eq!(decoded.name, original.name);
        assert_eq!(decoded.message, original.message);
        assert_eq!(decoded.stack, original.stack);
        assert_eq!(decoded.properties, original.properties);
    }

    #[test]
    fn test_exec_error_is_abort() {
        assert!(ExecError::Cancelled.is_abort());
        assert!(ExecError::TimedOut(Duration::from_secs(1)).is_abort());
        assert!(!ExecError::WorkerTerminated.is_abort());
    }

    #[test]
    fn test_exit_report_display_includes_diagnostics() {
        let report = ExitReport {
            exit_code: Some(1),
            signal: None,
            script: "worker.bin".to_string(),
            spawn_args: vec!["worker.bin".to_string(), "--flag".to_string()],
            spawn_file: Some("worker.bin".to_string()),
        };
        let text = report.to_string();
        assert!(text.contains("exit_code: 1"));
        assert!(text.contains("signal: none"));
        assert!(text.contains("worker.bin"));
        assert!(text.contains("--flag"));
    }
}
