//! Offload - worker-pool dispatch engine.
//!
//! This library owns a fleet of isolated worker executors (child OS
//! processes or dedicated OS threads) and dispatches caller-submitted tasks
//! to them over a correlated request/response protocol with streamed event
//! callbacks.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          Pool                                │
//! │  Availability-ordered dispatch, growth to cap, task queue   │
//! ├─────────────────────────────────────────────────────────────┤
//! │                      WorkerHandler (×N)                      │
//! │  Readiness, request multiplexing, stats, termination        │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────────┐   │
//! │  │ Transport    │  │ Wire         │  │ Deferred         │   │
//! │  │ (proc/thread)│  │ protocol     │  │ task futures     │   │
//! │  └──────────────┘  └──────────────┘  └──────────────────┘   │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use offload::{Pool, PoolConfig};
//! use serde_json::json;
//!
//! let pool = Pool::new(PoolConfig::default());
//!
//! let answer = pool.exec("echo", vec![json!(42)]).await?;
//! assert_eq!(answer, json!(42));
//!
//! pool.terminate(false, None).await?;
//! ```
//!
//! # Workers
//!
//! The default worker is the shipped `offload-worker` binary (process
//! substrate) or the built-in method registry run on a thread (thread
//! substrate). Custom workers are either an executable speaking the wire
//! protocol over stdio (see [`worker::run_stdio`]) or a
//! [`MethodRegistry`] of Rust closures.

pub mod deferred;
pub mod error;
pub mod handler;
pub mod options;
pub mod pool;
pub mod protocol;
pub mod transport;
pub mod worker;

pub use deferred::{Resolver, TaskFuture, TaskOutcome};
pub use error::{ExecError, ExitReport, TaskError};
pub use handler::{
    TimingStats, WorkerHandler, WorkerStats, CHILD_PROCESS_EXIT_TIMEOUT, STATS_RESET_INTERVAL,
};
pub use options::{
    default_worker_program, EventCallback, ExecOptions, ForkOptions, HandlerHooks, ThreadOptions,
    WorkerOptions, WorkerScript, DEFAULT_CONCURRENCY, DEFAULT_WORKER_PROGRAM,
};
pub use pool::{default_pool_size, Pool, PoolConfig, PoolStats};
pub use protocol::{
    ErrorDescriptor, HandlerMessage, Request, Response, TaskId, WorkerMessage, READY_SIGNAL,
    TERMINATE_SIGNAL,
};
pub use transport::WorkerType;
pub use worker::{Emitter, Method, MethodRegistry};

/// Version of the offload library.
///
/// Synchronized with the workspace manifest and injected at compile time.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
