//! Task definitions: the immutable descriptors behind every graph node.
//!
//! A [`TaskDef`] declares typed input and output fields and one of three
//! executable kinds (an in-process function, an external command template,
//! or a nested workflow constructor) behind a single tagged variant
//! ([`TaskKind`]). Definitions are immutable and `Arc`-shared; invoking one
//! produces an [`Invocation`] that records bindings and split/combine
//! declarators until the builder turns it into a graph node.

use rustc_hash::FxHashMap;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::graphs::builder::{BuildError, WorkflowBuilder};
use crate::lattice::TypeSpec;
use crate::template::CommandTemplate;
use crate::value::{Bindings, Slot};
use crate::workers::{EnvSpec, WorkerFailure};

/// One declared input or output field of a task.
#[derive(Clone, Debug)]
pub struct FieldSpec {
    pub name: String,
    pub ty: TypeSpec,
    pub default: Option<Value>,
    pub required: bool,
    pub help: Option<String>,
}

impl FieldSpec {
    /// A required field.
    pub fn required(name: impl Into<String>, ty: TypeSpec) -> Self {
        Self {
            name: name.into(),
            ty,
            default: None,
            required: true,
            help: None,
        }
    }

    /// An optional field with a default value.
    pub fn optional(name: impl Into<String>, ty: TypeSpec, default: Value) -> Self {
        Self {
            name: name.into(),
            ty,
            default: Some(default),
            required: false,
            help: None,
        }
    }

    #[must_use]
    pub fn help(mut self, text: impl Into<String>) -> Self {
        self.help = Some(text.into());
        self
    }
}

/// Per-unit retry policy: `max_retries` re-dispatches with exponential
/// backoff starting at `base_delay`. Retries reuse the unit's cache key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::from_millis(250),
        }
    }
}

impl RetryPolicy {
    pub fn retries(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    /// Delay before re-dispatching attempt number `attempt` (zero-based).
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay * 2u32.saturating_pow(attempt)
    }
}

/// In-process task function: resolved inputs in, outputs out.
pub type TaskFn = dyn Fn(&Bindings) -> Result<Bindings, WorkerFailure> + Send + Sync;

/// Nested workflow constructor, run under a fresh builder at expansion time.
pub type WorkflowCtor = dyn Fn(&mut WorkflowBuilder) -> Result<(), BuildError> + Send + Sync;

/// The executable behind a task, as a tagged variant.
#[derive(Clone)]
pub enum TaskKind {
    /// Pure in-process computation.
    Function(Arc<TaskFn>),
    /// External command rendered from a parsed template.
    Command(CommandTemplate),
    /// Nested workflow, expanded by the scheduler at execution time.
    Workflow(Arc<WorkflowCtor>),
}

impl fmt::Debug for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskKind::Function(_) => f.write_str("Function"),
            TaskKind::Command(t) => f.debug_tuple("Command").field(&t.program).finish(),
            TaskKind::Workflow(_) => f.write_str("Workflow"),
        }
    }
}

/// Immutable descriptor of a task.
#[derive(Clone, Debug)]
pub struct TaskDef {
    pub id: String,
    pub kind: TaskKind,
    pub inputs: Vec<FieldSpec>,
    pub outputs: Vec<FieldSpec>,
    pub env: Option<EnvSpec>,
    pub retry: RetryPolicy,
    pub timeout: Option<Duration>,
}

impl TaskDef {
    /// Starts a definition for an in-process function task.
    pub fn function<F>(id: impl Into<String>, f: F) -> TaskDefBuilder
    where
        F: Fn(&Bindings) -> Result<Bindings, WorkerFailure> + Send + Sync + 'static,
    {
        TaskDefBuilder::new(id, TaskKind::Function(Arc::new(f)))
    }

    /// Starts a definition for an external command task.
    pub fn command(id: impl Into<String>, template: CommandTemplate) -> TaskDefBuilder {
        TaskDefBuilder::new(id, TaskKind::Command(template))
    }

    #[must_use]
    pub fn input_spec(&self, name: &str) -> Option<&FieldSpec> {
        self.inputs.iter().find(|f| f.name == name)
    }

    #[must_use]
    pub fn output_spec(&self, name: &str) -> Option<&FieldSpec> {
        self.outputs.iter().find(|f| f.name == name)
    }
}

/// Builder for [`TaskDef`], consumed into an `Arc`.
pub struct TaskDefBuilder {
    id: String,
    kind: TaskKind,
    inputs: Vec<FieldSpec>,
    outputs: Vec<FieldSpec>,
    env: Option<EnvSpec>,
    retry: RetryPolicy,
    timeout: Option<Duration>,
}

impl TaskDefBuilder {
    pub(crate) fn from_kind(id: impl Into<String>, kind: TaskKind) -> Self {
        Self::new(id, kind)
    }

    fn new(id: impl Into<String>, kind: TaskKind) -> Self {
        Self {
            id: id.into(),
            kind,
            inputs: Vec::new(),
            outputs: Vec::new(),
            env: None,
            retry: RetryPolicy::default(),
            timeout: None,
        }
    }

    /// Declares a required input field.
    #[must_use]
    pub fn input(mut self, name: impl Into<String>, ty: TypeSpec) -> Self {
        self.inputs.push(FieldSpec::required(name, ty));
        self
    }

    /// Declares an optional input field with a default.
    #[must_use]
    pub fn input_default(mut self, name: impl Into<String>, ty: TypeSpec, default: Value) -> Self {
        self.inputs.push(FieldSpec::optional(name, ty, default));
        self
    }

    /// Declares an input from a full field spec.
    #[must_use]
    pub fn input_spec(mut self, spec: FieldSpec) -> Self {
        self.inputs.push(spec);
        self
    }

    /// Declares an output field.
    #[must_use]
    pub fn output(mut self, name: impl Into<String>, ty: TypeSpec) -> Self {
        self.outputs.push(FieldSpec::required(name, ty));
        self
    }

    #[must_use]
    pub fn env(mut self, env: EnvSpec) -> Self {
        self.env = Some(env);
        self
    }

    #[must_use]
    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn build(self) -> Arc<TaskDef> {
        Arc::new(TaskDef {
            id: self.id,
            kind: self.kind,
            inputs: self.inputs,
            outputs: self.outputs,
            env: self.env,
            retry: self.retry,
            timeout: self.timeout,
        })
    }
}

/// One split declarator: a single entry iterates its field over a sequence,
/// several entries advance in lockstep as one linked axis.
#[derive(Clone, Debug)]
pub struct SplitDecl {
    pub fields: Vec<(String, Slot)>,
}

/// A task invocation under construction: bindings plus pending split and
/// combine declarators, consumed by
/// [`WorkflowBuilder::add`](crate::graphs::builder::WorkflowBuilder::add).
#[derive(Clone)]
pub struct Invocation {
    pub(crate) task: Arc<TaskDef>,
    pub(crate) bindings: Vec<(String, Slot)>,
    pub(crate) splits: Vec<SplitDecl>,
    pub(crate) combines: Vec<String>,
    pub(crate) env: Option<EnvSpec>,
    pub(crate) retry: Option<RetryPolicy>,
    pub(crate) timeout: Option<Duration>,
}

impl Invocation {
    pub fn of(task: &Arc<TaskDef>) -> Self {
        Self {
            task: Arc::clone(task),
            bindings: Vec::new(),
            splits: Vec::new(),
            combines: Vec::new(),
            env: None,
            retry: None,
            timeout: None,
        }
    }

    /// Binds an input field to a concrete value or a lazy reference.
    #[must_use]
    pub fn bind(mut self, field: impl Into<String>, value: impl Into<Slot>) -> Self {
        self.bindings.push((field.into(), value.into()));
        self
    }

    /// Splits execution over a sequence bound to `field`, introducing the
    /// axis `"{node}.{field}"`.
    #[must_use]
    pub fn split(mut self, field: impl Into<String>, seq: impl Into<Slot>) -> Self {
        self.splits.push(SplitDecl {
            fields: vec![(field.into(), seq.into())],
        });
        self
    }

    /// Splits several fields in lockstep as one linked axis; the sequences
    /// must have equal lengths.
    #[must_use]
    pub fn split_linked<N, S>(mut self, fields: impl IntoIterator<Item = (N, S)>) -> Self
    where
        N: Into<String>,
        S: Into<Slot>,
    {
        self.splits.push(SplitDecl {
            fields: fields
                .into_iter()
                .map(|(n, s)| (n.into(), s.into()))
                .collect(),
        });
        self
    }

    /// Closes an axis downstream, gathering outputs along it. A bare field
    /// name refers to this node's own split; a dotted id (`"mul.a"`) refers
    /// to an upstream axis.
    #[must_use]
    pub fn combine(mut self, axis: impl Into<String>) -> Self {
        self.combines.push(axis.into());
        self
    }

    #[must_use]
    pub fn with_env(mut self, env: EnvSpec) -> Self {
        self.env = Some(env);
        self
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Registry of task definitions, keyed by id.
///
/// Definitions are immutable once registered; re-registering an id replaces
/// the descriptor for subsequent lookups without affecting graphs already
/// holding the old `Arc`.
#[derive(Clone, Debug, Default)]
pub struct TaskRegistry {
    defs: FxHashMap<String, Arc<TaskDef>>,
}

impl TaskRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, def: Arc<TaskDef>) {
        self.defs.insert(def.id.clone(), def);
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<Arc<TaskDef>> {
        self.defs.get(id).cloned()
    }

    #[must_use]
    pub fn ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.defs.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }
}
