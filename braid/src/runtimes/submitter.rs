//! The submitter: user facade over construction and scheduling.

use miette::Diagnostic;
use rustc_hash::FxHashMap;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tracing::instrument;

use crate::cache::{CacheError, ContentCache};
use crate::graphs::{BuildError, WorkflowDef};
use crate::lattice::TypeLattice;
use crate::schedulers::scheduler::{RunContext, Scheduler};
use crate::schedulers::{CancelToken, SchedulerError};
use crate::value::Slot;
use crate::workers::WorkerBackend;

use super::config::RuntimeConfig;
use super::result::RunResult;

/// Errors that prevent a run from starting or completing as a whole;
/// per-unit failures are reported inside [`RunResult`] instead.
#[derive(Debug, Error, Diagnostic)]
pub enum SubmitError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Build(#[from] BuildError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Scheduler(#[from] SchedulerError),
}

/// Submits workflows against a worker backend.
///
/// One submitter can run many workflows; runs sharing its cache root
/// observe each other's results, and concurrent runs execute each cache
/// key at most once.
///
/// # Examples
///
/// ```rust,no_run
/// use braid::runtimes::{RuntimeConfig, Submitter};
/// use braid::workers::LocalBackend;
/// # use braid::graphs::WorkflowDef;
/// # async fn example(wf: WorkflowDef) -> Result<(), Box<dyn std::error::Error>> {
/// let submitter = Submitter::with_config(
///     LocalBackend::new(),
///     RuntimeConfig::default().with_cache_root("/tmp/braid-cache"),
/// )?;
/// let mut inputs = rustc_hash::FxHashMap::default();
/// inputs.insert("a".to_string(), serde_json::json!(2));
/// let result = submitter.submit(&wf, inputs).await?;
/// assert!(!result.errored);
/// # Ok(())
/// # }
/// ```
pub struct Submitter {
    backend: Arc<dyn WorkerBackend>,
    lattice: TypeLattice,
    cache: Option<ContentCache>,
    config: RuntimeConfig,
}

impl Submitter {
    /// A submitter with default configuration (no cache).
    pub fn new(backend: impl WorkerBackend + 'static) -> Result<Self, SubmitError> {
        Self::with_config(backend, RuntimeConfig::default())
    }

    pub fn with_config(
        backend: impl WorkerBackend + 'static,
        config: RuntimeConfig,
    ) -> Result<Self, SubmitError> {
        let cache = match &config.cache_root {
            Some(root) => Some(ContentCache::new(root)?),
            None => None,
        };
        Ok(Self {
            backend: Arc::new(backend),
            lattice: TypeLattice::default(),
            cache,
            config,
        })
    }

    /// Replaces the type lattice, e.g. to install a file-format oracle.
    #[must_use]
    pub fn with_lattice(mut self, lattice: TypeLattice) -> Self {
        self.lattice = lattice;
        self
    }

    /// The cache backing this submitter, when configured.
    #[must_use]
    pub fn cache(&self) -> Option<&ContentCache> {
        self.cache.as_ref()
    }

    /// Constructs and runs `workflow` with concrete inputs.
    pub async fn submit(
        &self,
        workflow: &WorkflowDef,
        inputs: FxHashMap<String, Value>,
    ) -> Result<RunResult, SubmitError> {
        self.submit_with_cancel(workflow, inputs, CancelToken::new())
            .await
    }

    /// Like [`submit`](Self::submit), with an external cancellation signal.
    #[instrument(skip_all, fields(workflow = %workflow.task().id))]
    pub async fn submit_with_cancel(
        &self,
        workflow: &WorkflowDef,
        inputs: FxHashMap<String, Value>,
        cancel: CancelToken,
    ) -> Result<RunResult, SubmitError> {
        let slots: FxHashMap<String, Slot> = inputs
            .into_iter()
            .map(|(name, value)| (name, Slot::Value(value)))
            .collect();
        let graph = workflow.construct(slots, &self.lattice)?;

        let ctx = RunContext {
            backend: Arc::clone(&self.backend),
            cache: self.cache.clone(),
            lattice: self.lattice.clone(),
            events: self.config.events.clone(),
            audit: self.config.audit.clone().map(Arc::new),
            cancel,
            max_concurrency: self.config.max_concurrency,
        };
        let outcome = Scheduler::run(Arc::new(graph), ctx).await?;

        let errored = !outcome.errors.is_empty();
        let errors = outcome
            .errors
            .into_iter()
            .map(|info| (info.unit.clone(), info))
            .collect();
        Ok(RunResult {
            outputs: outcome.outputs,
            errors,
            errored,
            cancelled: outcome.cancelled,
            stats: outcome.stats,
        })
    }
}
