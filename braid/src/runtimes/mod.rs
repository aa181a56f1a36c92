//! Runtime infrastructure: configuration, submission, and results.
//!
//! [`Submitter`] is the entry point for running a constructed
//! [`WorkflowDef`](crate::graphs::WorkflowDef): it owns the worker backend,
//! the optional content-addressed cache, and the runtime configuration, and
//! returns a [`RunResult`] once every unit is terminal.

pub mod config;
pub mod result;
pub mod submitter;

pub use config::RuntimeConfig;
pub use result::{RunResult, RunStats, UnitErrorInfo, UnitErrorKind};
pub use submitter::{SubmitError, Submitter};
