//! The user-facing view of a completed run.

use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use serde_json::Value;

use crate::workers::WorkerFailure;

/// Classification of a per-unit error.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UnitErrorKind {
    /// The worker reported a failure (task error, non-zero exit, i/o).
    Worker,
    /// The unit exceeded its wall-clock timeout.
    Timeout,
    /// The run was cancelled before the unit finished.
    Cancelled,
    /// Skipped because an upstream dependency failed; `upstream` names the
    /// originating unit.
    Unreachable { upstream: String },
    /// The execution environment could not be provided.
    Env,
    /// A value admitted through an `Any` wire failed its dispatch-time
    /// type re-check.
    InvalidType,
    /// State-array materialization failed (axis or split mismatch).
    Shape,
    /// The cache entry for the unit was unreadable.
    Cache,
    /// A nested workflow constructor failed at expansion time.
    Build,
}

/// One recorded unit failure.
#[derive(Clone, Debug, PartialEq)]
pub struct UnitErrorInfo {
    pub unit: String,
    pub kind: UnitErrorKind,
    pub message: String,
    /// Captured stdout, for command worker failures.
    pub stdout: Option<String>,
    /// Captured stderr, for command worker failures.
    pub stderr: Option<String>,
    pub when: DateTime<Utc>,
}

impl UnitErrorInfo {
    pub(crate) fn new(
        unit: impl Into<String>,
        kind: UnitErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            unit: unit.into(),
            kind,
            message: message.into(),
            stdout: None,
            stderr: None,
            when: Utc::now(),
        }
    }

    pub(crate) fn from_worker_failure(unit: impl Into<String>, failure: &WorkerFailure) -> Self {
        let kind = match failure {
            WorkerFailure::EnvUnavailable(_) => UnitErrorKind::Env,
            WorkerFailure::InvalidInput { .. } => UnitErrorKind::InvalidType,
            _ => UnitErrorKind::Worker,
        };
        let (stdout, stderr) = failure.captured();
        Self {
            unit: unit.into(),
            kind,
            message: failure.to_string(),
            stdout: stdout.map(str::to_string),
            stderr: stderr.map(str::to_string),
            when: Utc::now(),
        }
    }

    /// Re-roots a nested workflow's unit id under its outer unit.
    pub(crate) fn rerooted(mut self, outer_unit: &str) -> Self {
        self.unit = format!("{outer_unit}/{}", self.unit);
        self
    }
}

/// Execution counters for one run, nested workflows included.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RunStats {
    /// Units actually dispatched to a worker backend.
    pub executed: u64,
    /// Units satisfied from the cache (hits and in-flight waits).
    pub cache_hits: u64,
}

impl RunStats {
    pub(crate) fn absorb(&mut self, other: RunStats) {
        self.executed += other.executed;
        self.cache_hits += other.cache_hits;
    }
}

/// Outcome of a submitted workflow.
///
/// `outputs` holds every declared output whose producers completed;
/// `errors` enumerates all failures by unit id. Independent branches run to
/// completion even when others fail, so both maps can be non-empty at once.
#[derive(Clone, Debug, Default)]
pub struct RunResult {
    pub outputs: FxHashMap<String, Value>,
    pub errors: FxHashMap<String, UnitErrorInfo>,
    pub errored: bool,
    pub cancelled: bool,
    pub stats: RunStats,
}

impl RunResult {
    /// A declared workflow output, if it materialized.
    #[must_use]
    pub fn output(&self, name: &str) -> Option<&Value> {
        self.outputs.get(name)
    }

    /// The recorded error for a unit, if any.
    #[must_use]
    pub fn error(&self, unit: &str) -> Option<&UnitErrorInfo> {
        self.errors.get(unit)
    }
}
