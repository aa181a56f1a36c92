//! Worker backends: the uniform execution contract.
//!
//! The scheduler hands a [`WorkUnit`] (one node at one state coordinate,
//! with fully resolved inputs) to a [`WorkerBackend`] and awaits outputs or
//! a [`WorkerFailure`]. Backends are interchangeable: the in-process
//! [`LocalBackend`] ships with the engine; container runtimes and cluster
//! submitters implement the same trait externally.

pub mod local;

pub use local::LocalBackend;

use async_trait::async_trait;
use miette::Diagnostic;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use thiserror::Error;

use crate::task::TaskDef;
use crate::types::UnitId;
use crate::value::Bindings;

/// Execution environment binding for a task.
///
/// The engine treats environments opaquely: the `id` participates in cache
/// keys, and `vars` are exported to external commands. Container and
/// cluster adapters interpret richer environment semantics behind the
/// [`WorkerBackend`] trait.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EnvSpec {
    pub id: String,
    pub vars: FxHashMap<String, String>,
}

impl Default for EnvSpec {
    fn default() -> Self {
        Self {
            id: "local".to_string(),
            vars: FxHashMap::default(),
        }
    }
}

impl EnvSpec {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            vars: FxHashMap::default(),
        }
    }

    #[must_use]
    pub fn var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.insert(key.into(), value.into());
        self
    }
}

/// A single dispatchable execution instance.
#[derive(Clone)]
pub struct WorkUnit {
    pub unit: UnitId,
    pub task: Arc<TaskDef>,
    /// Fully resolved concrete inputs, keyed by field name.
    pub inputs: Bindings,
}

/// Failure reported by a worker backend.
#[derive(Clone, Debug, Error, Diagnostic, PartialEq, Eq)]
pub enum WorkerFailure {
    /// An in-process task function returned an error.
    #[error("task failed: {message}")]
    #[diagnostic(code(braid::worker::task))]
    Task { message: String },

    /// An external command exited non-zero.
    #[error("command exited with status {status}")]
    #[diagnostic(code(braid::worker::command))]
    Command {
        status: i32,
        stdout: String,
        stderr: String,
    },

    /// The requested execution environment could not be provided.
    #[error("environment unavailable: {0}")]
    #[diagnostic(
        code(braid::worker::env_unavailable),
        help("Check that the backend supports the task's environment binding.")
    )]
    EnvUnavailable(String),

    /// A resolved input failed its dispatch-time type re-check.
    #[error("input `{field}` does not conform to declared type {ty}")]
    #[diagnostic(
        code(braid::worker::invalid_input),
        help("Wires typed `any` are re-checked at dispatch; the upstream value has the wrong shape.")
    )]
    InvalidInput { field: String, ty: String },

    /// I/O error while staging or collecting unit files.
    #[error("i/o failure: {0}")]
    #[diagnostic(code(braid::worker::io))]
    Io(String),
}

impl WorkerFailure {
    pub fn task(message: impl Into<String>) -> Self {
        WorkerFailure::Task {
            message: message.into(),
        }
    }

    /// Captured output streams, for command failures.
    #[must_use]
    pub fn captured(&self) -> (Option<&str>, Option<&str>) {
        match self {
            WorkerFailure::Command { stdout, stderr, .. } => {
                (Some(stdout.as_str()), Some(stderr.as_str()))
            }
            _ => (None, None),
        }
    }
}

impl From<std::io::Error> for WorkerFailure {
    fn from(err: std::io::Error) -> Self {
        WorkerFailure::Io(err.to_string())
    }
}

/// Uniform execution contract for all worker backends.
///
/// `submit` runs a unit to completion; the engine wraps the returned future
/// with per-unit timeout and retry policy. `cancel` is best-effort: the
/// default implementation does nothing, and the scheduler additionally
/// aborts the dispatch future itself on cancellation.
#[async_trait]
pub trait WorkerBackend: Send + Sync {
    async fn submit(&self, unit: &WorkUnit, env: &EnvSpec) -> Result<Bindings, WorkerFailure>;

    async fn cancel(&self, _unit: &UnitId) {}
}
