//! The workflow builder: the construction context.
//!
//! A workflow is declared with [`WorkflowDef::define`] and a constructor
//! closure. The closure receives a `&mut WorkflowBuilder`, the scoped
//! construction context, and wires task invocations into nodes with
//! [`WorkflowBuilder::add`]. Every wire is type-checked at wire-up against
//! the [`TypeLattice`]; errors abort construction before anything runs.
//!
//! Construction produces data only. Lazy placeholders cannot be evaluated
//! here: branch predicates in a constructor must derive from concrete
//! workflow inputs via [`WorkflowBuilder::input_value`], which raises
//! [`BuildError::LazyInCondition`] otherwise.

use miette::Diagnostic;
use rustc_hash::FxHashMap;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::lattice::{TypeLattice, TypeSpec};
use crate::task::{
    FieldSpec, Invocation, RetryPolicy, SplitDecl, TaskDef, TaskDefBuilder, TaskKind, WorkflowCtor,
};
use crate::types::AxisId;
use crate::value::{LazyRef, LazySource, Slot};
use crate::workers::EnvSpec;

use super::spec::{GraphSpec, NodeSpec};

/// Errors raised during workflow construction.
#[derive(Debug, Error, Diagnostic)]
pub enum BuildError {
    /// A wire's source type is not assignable to its destination type.
    #[error("type mismatch: cannot wire {src} ({src_ty}) into {dst_node}.{dst_field} ({dst_ty})")]
    #[diagnostic(
        code(braid::build::type_mismatch),
        help("Check the declared output type of the producer, or widen the input with a union or `any`.")
    )]
    TypeMismatch {
        src: String,
        src_ty: String,
        dst_node: String,
        dst_field: String,
        dst_ty: String,
    },

    #[error("duplicate node name `{0}`")]
    #[diagnostic(code(braid::build::duplicate_node_name))]
    DuplicateNodeName(String),

    /// A constructor tried to read a concrete value out of a lazy field.
    #[error("input `{name}` is lazy and has no value during construction")]
    #[diagnostic(
        code(braid::build::lazy_in_condition),
        help("Branch predicates must be static: derive them from concrete workflow inputs.")
    )]
    LazyInCondition { name: String },

    #[error("missing required input `{field}` on `{node}`")]
    #[diagnostic(code(braid::build::missing_required_input))]
    MissingRequiredInput { node: String, field: String },

    #[error("`{node}` has no input field `{field}`")]
    #[diagnostic(code(braid::build::unknown_input))]
    UnknownInput { node: String, field: String },

    #[error("`{node}` has no output field `{field}`")]
    #[diagnostic(code(braid::build::unknown_output))]
    UnknownOutput { node: String, field: String },

    #[error("node `{node}` cannot combine unknown axis `{axis}`")]
    #[diagnostic(
        code(braid::build::unknown_axis),
        help("An axis must be introduced by a split on this node or inherited from a producer.")
    )]
    UnknownAxis { node: String, axis: String },

    /// A field appears both in a binding and a split declarator, or in two
    /// split declarators.
    #[error("field `{field}` on `{node}` is bound more than once")]
    #[diagnostic(code(braid::build::split_conflict))]
    SplitConflict { node: String, field: String },

    /// A lazy split source still carries open axes.
    #[error("split source for `{node}.{field}` is not scalar")]
    #[diagnostic(
        code(braid::build::split_source_not_scalar),
        help("Combine the upstream axes before splitting over the produced sequence.")
    )]
    SplitSourceNotScalar { node: String, field: String },

    #[error("workflow `{workflow}` never assigned its declared output `{name}`")]
    #[diagnostic(code(braid::build::output_unset))]
    OutputUnset { workflow: String, name: String },

    #[error("workflow has no declared input `{name}`")]
    #[diagnostic(code(braid::build::unknown_workflow_input))]
    UnknownWorkflowInput { name: String },

    #[error("workflow has no declared output `{name}`")]
    #[diagnostic(code(braid::build::unknown_workflow_output))]
    UnknownWorkflowOutput { name: String },
}

/// Proxy over a freshly added node's declared outputs.
///
/// `out(field)` yields a typed [`LazyRef`] carrying the node's current
/// downstream axis set, ready to be bound into later invocations.
#[derive(Clone, Debug)]
pub struct OutputsProxy {
    node: String,
    outputs: Vec<FieldSpec>,
    axes: Vec<AxisId>,
    combined: bool,
}

impl OutputsProxy {
    /// The name the builder assigned to the node.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.node
    }

    /// Lazy reference to one of the node's outputs.
    ///
    /// A combining node gathers its outputs along the closed axes, so its
    /// fields read as sequences downstream.
    pub fn out(&self, field: &str) -> Result<LazyRef, BuildError> {
        let spec = self
            .outputs
            .iter()
            .find(|f| f.name == field)
            .ok_or_else(|| BuildError::UnknownOutput {
                node: self.node.clone(),
                field: field.to_string(),
            })?;
        let ty = if self.combined {
            TypeSpec::seq(spec.ty.clone())
        } else {
            spec.ty.clone()
        };
        Ok(LazyRef::node(&self.node, field, ty).with_axes(self.axes.clone()))
    }
}

/// Thread-confined construction context for one workflow.
pub struct WorkflowBuilder {
    name: String,
    lattice: TypeLattice,
    input_specs: Vec<FieldSpec>,
    input_bindings: FxHashMap<String, Slot>,
    output_specs: Vec<FieldSpec>,
    nodes: Vec<NodeSpec>,
    index: FxHashMap<String, usize>,
    outputs: FxHashMap<String, LazyRef>,
}

impl WorkflowBuilder {
    pub(crate) fn new(
        name: String,
        lattice: TypeLattice,
        input_specs: Vec<FieldSpec>,
        input_bindings: FxHashMap<String, Slot>,
        output_specs: Vec<FieldSpec>,
    ) -> Self {
        Self {
            name,
            lattice,
            input_specs,
            input_bindings,
            output_specs,
            nodes: Vec::new(),
            index: FxHashMap::default(),
            outputs: FxHashMap::default(),
        }
    }

    /// The workflow's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Adds a node under a name derived from the task id (suffixed with a
    /// counter if taken).
    pub fn add(&mut self, invocation: Invocation) -> Result<OutputsProxy, BuildError> {
        self.add_impl(invocation, None)
    }

    /// Adds a node under an explicit name; the name must be unique.
    pub fn add_named(
        &mut self,
        invocation: Invocation,
        name: &str,
    ) -> Result<OutputsProxy, BuildError> {
        self.add_impl(invocation, Some(name))
    }

    /// A declared workflow input as a bindable slot: the bound concrete
    /// value, or a lazy placeholder when none is available.
    pub fn input(&self, name: &str) -> Result<Slot, BuildError> {
        let spec = self
            .input_specs
            .iter()
            .find(|f| f.name == name)
            .ok_or_else(|| BuildError::UnknownWorkflowInput {
                name: name.to_string(),
            })?;
        match self.input_bindings.get(name) {
            Some(Slot::Value(v)) => Ok(Slot::Value(v.clone())),
            _ => Ok(Slot::Lazy(LazyRef::input(name, spec.ty.clone()))),
        }
    }

    /// A lazy placeholder for a declared input, regardless of how it was
    /// bound. Useful for routing an input straight to a workflow output.
    pub fn input_lazy(&self, name: &str) -> Result<LazyRef, BuildError> {
        let spec = self
            .input_specs
            .iter()
            .find(|f| f.name == name)
            .ok_or_else(|| BuildError::UnknownWorkflowInput {
                name: name.to_string(),
            })?;
        Ok(LazyRef::input(name, spec.ty.clone()))
    }

    /// The concrete value of a declared input.
    ///
    /// This is the only sanctioned way to branch on an input during
    /// construction; a lazily bound input raises
    /// [`BuildError::LazyInCondition`].
    pub fn input_value(&self, name: &str) -> Result<&Value, BuildError> {
        if !self.input_specs.iter().any(|f| f.name == name) {
            return Err(BuildError::UnknownWorkflowInput {
                name: name.to_string(),
            });
        }
        match self.input_bindings.get(name) {
            Some(Slot::Value(v)) => Ok(v),
            _ => Err(BuildError::LazyInCondition {
                name: name.to_string(),
            }),
        }
    }

    /// Assigns a declared workflow output.
    pub fn set_output(&mut self, name: &str, lazy: LazyRef) -> Result<(), BuildError> {
        let spec = self
            .output_specs
            .iter()
            .find(|f| f.name == name)
            .ok_or_else(|| BuildError::UnknownWorkflowOutput {
                name: name.to_string(),
            })?;
        if self.lattice.assignable(&lazy.ty, &spec.ty).is_reject() {
            return Err(BuildError::TypeMismatch {
                src: describe_lazy(&lazy),
                src_ty: lazy.ty.to_string(),
                dst_node: format!("{}.outputs", self.name),
                dst_field: name.to_string(),
                dst_ty: spec.ty.to_string(),
            });
        }
        self.outputs.insert(name.to_string(), lazy);
        Ok(())
    }

    /// Names of the nodes added so far, in insertion order.
    #[must_use]
    pub fn node_names(&self) -> Vec<&str> {
        self.nodes.iter().map(|n| n.name.as_str()).collect()
    }

    /// Inspects an already-added node.
    #[must_use]
    pub fn node(&self, name: &str) -> Option<&NodeSpec> {
        self.index.get(name).map(|&i| &self.nodes[i])
    }

    pub(crate) fn finish(self) -> Result<GraphSpec, BuildError> {
        let mut outputs = Vec::with_capacity(self.output_specs.len());
        for spec in &self.output_specs {
            let lazy =
                self.outputs
                    .get(&spec.name)
                    .cloned()
                    .ok_or_else(|| BuildError::OutputUnset {
                        workflow: self.name.clone(),
                        name: spec.name.clone(),
                    })?;
            outputs.push((spec.name.clone(), lazy));
        }
        Ok(GraphSpec::new(
            self.name,
            self.nodes,
            self.index,
            self.input_specs,
            self.input_bindings,
            self.output_specs,
            outputs,
        ))
    }

    fn add_impl(
        &mut self,
        invocation: Invocation,
        explicit: Option<&str>,
    ) -> Result<OutputsProxy, BuildError> {
        let name = self.assign_name(&invocation, explicit)?;
        let task = Arc::clone(&invocation.task);

        // Fields claimed by split declarators; a field may not be both
        // bound and split, nor split twice.
        let mut split_fields: Vec<&str> = Vec::new();
        for decl in &invocation.splits {
            for (field, _) in &decl.fields {
                if split_fields.contains(&field.as_str()) {
                    return Err(BuildError::SplitConflict {
                        node: name,
                        field: field.clone(),
                    });
                }
                split_fields.push(field.as_str());
            }
        }

        let mut inputs: Vec<(String, Slot)> = Vec::with_capacity(invocation.bindings.len());
        for (field, slot) in &invocation.bindings {
            let spec =
                task.input_spec(field)
                    .ok_or_else(|| BuildError::UnknownInput {
                        node: name.clone(),
                        field: field.clone(),
                    })?;
            if split_fields.contains(&field.as_str())
                || inputs.iter().any(|(bound, _)| bound == field)
            {
                return Err(BuildError::SplitConflict {
                    node: name,
                    field: field.clone(),
                });
            }
            let resolved = self.check_binding(&name, spec, slot)?;
            inputs.push((field.clone(), resolved));
        }

        // Unbound fields fall back to defaults; required ones must exist.
        for spec in &task.inputs {
            let bound = inputs.iter().any(|(f, _)| f == &spec.name)
                || split_fields.contains(&spec.name.as_str());
            if bound {
                continue;
            }
            if let Some(default) = &spec.default {
                inputs.push((spec.name.clone(), Slot::Value(default.clone())));
            } else if spec.required {
                return Err(BuildError::MissingRequiredInput {
                    node: name,
                    field: spec.name.clone(),
                });
            }
        }

        let mut splits: Vec<(AxisId, SplitDecl)> = Vec::with_capacity(invocation.splits.len());
        for decl in &invocation.splits {
            let axis = if decl.fields.len() == 1 {
                AxisId::new(&name, &decl.fields[0].0)
            } else {
                AxisId::linked(&name, decl.fields.iter().map(|(f, _)| f.as_str()))
            };
            let mut resolved_fields = Vec::with_capacity(decl.fields.len());
            for (field, slot) in &decl.fields {
                let spec =
                    task.input_spec(field)
                        .ok_or_else(|| BuildError::UnknownInput {
                            node: name.clone(),
                            field: field.clone(),
                        })?;
                let resolved = self.check_split_source(&name, spec, slot)?;
                resolved_fields.push((field.clone(), resolved));
            }
            splits.push((
                axis,
                SplitDecl {
                    fields: resolved_fields,
                },
            ));
        }

        // Execution axes: producers' open axes in first-seen order, then
        // the local split axes.
        let mut exec_axes: Vec<AxisId> = Vec::new();
        let lazy_slots = inputs
            .iter()
            .map(|(_, s)| s)
            .chain(splits.iter().flat_map(|(_, d)| d.fields.iter().map(|(_, s)| s)));
        for slot in lazy_slots {
            if let Slot::Lazy(lazy) = slot {
                for axis in &lazy.axes {
                    if !exec_axes.contains(axis) {
                        exec_axes.push(axis.clone());
                    }
                }
            }
        }
        for (axis, _) in &splits {
            if !exec_axes.contains(axis) {
                exec_axes.push(axis.clone());
            }
        }

        let mut combines: Vec<AxisId> = Vec::new();
        for raw in &invocation.combines {
            let axis = if raw.contains('.') {
                AxisId::from_raw(raw.clone())
            } else {
                splits
                    .iter()
                    .find(|(_, decl)| {
                        decl.fields.iter().any(|(f, _)| f == raw)
                            || decl
                                .fields
                                .iter()
                                .map(|(f, _)| f.as_str())
                                .collect::<Vec<_>>()
                                .join("+")
                                == *raw
                    })
                    .map(|(axis, _)| axis.clone())
                    .ok_or_else(|| BuildError::UnknownAxis {
                        node: name.clone(),
                        axis: raw.clone(),
                    })?
            };
            if !exec_axes.contains(&axis) {
                return Err(BuildError::UnknownAxis {
                    node: name,
                    axis: axis.to_string(),
                });
            }
            if !combines.contains(&axis) {
                combines.push(axis);
            }
        }

        let downstream_axes: Vec<AxisId> = exec_axes
            .iter()
            .filter(|a| !combines.contains(*a))
            .cloned()
            .collect();

        let combined = !combines.is_empty();
        let node = NodeSpec {
            name: name.clone(),
            env: invocation.env.clone().or_else(|| task.env.clone()),
            retry: invocation.retry.unwrap_or(task.retry),
            timeout: invocation.timeout.or(task.timeout),
            task,
            inputs,
            splits,
            combines,
            exec_axes,
            downstream_axes: downstream_axes.clone(),
        };
        let outputs = node.task.outputs.clone();
        self.index.insert(name.clone(), self.nodes.len());
        self.nodes.push(node);

        Ok(OutputsProxy {
            node: name,
            outputs,
            axes: downstream_axes,
            combined,
        })
    }

    fn assign_name(
        &self,
        invocation: &Invocation,
        explicit: Option<&str>,
    ) -> Result<String, BuildError> {
        match explicit {
            Some(name) => {
                if self.index.contains_key(name) {
                    Err(BuildError::DuplicateNodeName(name.to_string()))
                } else {
                    Ok(name.to_string())
                }
            }
            None => {
                let base = invocation.task.id.clone();
                if !self.index.contains_key(&base) {
                    return Ok(base);
                }
                let mut n = 1usize;
                loop {
                    let candidate = format!("{base}{n}");
                    if !self.index.contains_key(&candidate) {
                        return Ok(candidate);
                    }
                    n += 1;
                }
            }
        }
    }

    fn check_binding(
        &self,
        node: &str,
        spec: &FieldSpec,
        slot: &Slot,
    ) -> Result<Slot, BuildError> {
        match slot {
            Slot::Lazy(lazy) => {
                if self.lattice.assignable(&lazy.ty, &spec.ty).is_reject() {
                    Err(BuildError::TypeMismatch {
                        src: describe_lazy(lazy),
                        src_ty: lazy.ty.to_string(),
                        dst_node: node.to_string(),
                        dst_field: spec.name.clone(),
                        dst_ty: spec.ty.to_string(),
                    })
                } else {
                    Ok(slot.clone())
                }
            }
            Slot::Value(value) => {
                if self.lattice.admits(value, &spec.ty) {
                    Ok(slot.clone())
                } else if let Some(coerced) = self.lattice.coerce(value, &spec.ty) {
                    Ok(Slot::Value(coerced))
                } else {
                    Err(BuildError::TypeMismatch {
                        src: format!("value `{value}`"),
                        src_ty: value_kind(value).to_string(),
                        dst_node: node.to_string(),
                        dst_field: spec.name.clone(),
                        dst_ty: spec.ty.to_string(),
                    })
                }
            }
        }
    }

    /// A split source must be a sequence whose elements fit the field, and
    /// a lazy source must be scalar (no open axes).
    fn check_split_source(
        &self,
        node: &str,
        spec: &FieldSpec,
        slot: &Slot,
    ) -> Result<Slot, BuildError> {
        let seq_ty = TypeSpec::seq(spec.ty.clone());
        match slot {
            Slot::Lazy(lazy) => {
                if !lazy.axes.is_empty() {
                    return Err(BuildError::SplitSourceNotScalar {
                        node: node.to_string(),
                        field: spec.name.clone(),
                    });
                }
                if self.lattice.assignable(&lazy.ty, &seq_ty).is_reject() {
                    return Err(BuildError::TypeMismatch {
                        src: describe_lazy(lazy),
                        src_ty: lazy.ty.to_string(),
                        dst_node: node.to_string(),
                        dst_field: spec.name.clone(),
                        dst_ty: seq_ty.to_string(),
                    });
                }
                Ok(slot.clone())
            }
            Slot::Value(value) => {
                if self.lattice.admits(value, &seq_ty) {
                    Ok(slot.clone())
                } else if let Some(coerced) = self.lattice.coerce(value, &seq_ty) {
                    Ok(Slot::Value(coerced))
                } else {
                    Err(BuildError::TypeMismatch {
                        src: format!("value `{value}`"),
                        src_ty: value_kind(value).to_string(),
                        dst_node: node.to_string(),
                        dst_field: spec.name.clone(),
                        dst_ty: seq_ty.to_string(),
                    })
                }
            }
        }
    }
}

fn describe_lazy(lazy: &LazyRef) -> String {
    match &lazy.source {
        LazySource::Input(name) => format!("workflow input `{name}`"),
        LazySource::Node { node, field } => format!("`{node}.{field}`"),
    }
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(n) if n.is_f64() => "float",
        Value::Number(_) => "int",
        Value::String(_) => "str",
        Value::Array(_) => "sequence",
        Value::Object(_) => "map",
    }
}

/// A workflow task definition: typed fields plus a constructor closure.
///
/// # Examples
///
/// ```rust
/// use braid::graphs::WorkflowDef;
/// use braid::lattice::TypeSpec;
/// use braid::task::{Invocation, TaskDef};
/// use braid::value::Bindings;
/// use serde_json::json;
///
/// let double = TaskDef::function("double", |inputs: &Bindings| {
///     let x = inputs["x"].as_i64().unwrap_or_default();
///     let mut out = Bindings::default();
///     out.insert("out".into(), json!(x * 2));
///     Ok(out)
/// })
/// .input("x", TypeSpec::Int)
/// .output("out", TypeSpec::Int)
/// .build();
///
/// let wf = WorkflowDef::define("doubler")
///     .input("x", TypeSpec::Int)
///     .output("out", TypeSpec::Int)
///     .constructor(move |wf| {
///         let node = wf.add(Invocation::of(&double).bind("x", wf.input("x")?))?;
///         wf.set_output("out", node.out("out")?)
///     });
/// ```
#[derive(Clone)]
pub struct WorkflowDef {
    def: Arc<TaskDef>,
    ctor: Arc<WorkflowCtor>,
}

impl WorkflowDef {
    /// Starts declaring a workflow task.
    pub fn define(id: impl Into<String>) -> WorkflowDefBuilder {
        WorkflowDefBuilder {
            id: id.into(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            env: None,
            retry: None,
            timeout: None,
        }
    }

    /// The underlying task definition, for nesting this workflow as a node
    /// in another workflow via [`Invocation::of`].
    #[must_use]
    pub fn task(&self) -> &Arc<TaskDef> {
        &self.def
    }

    /// Runs the constructor under a fresh builder and freezes the graph.
    pub fn construct(
        &self,
        inputs: FxHashMap<String, Slot>,
        lattice: &TypeLattice,
    ) -> Result<GraphSpec, BuildError> {
        construct_graph(&self.def, &*self.ctor, inputs, lattice)
    }
}

/// Validates declared inputs and runs a workflow constructor.
pub(crate) fn construct_graph(
    def: &TaskDef,
    ctor: &WorkflowCtor,
    inputs: FxHashMap<String, Slot>,
    lattice: &TypeLattice,
) -> Result<GraphSpec, BuildError> {
    for name in inputs.keys() {
        if def.input_spec(name).is_none() {
            return Err(BuildError::UnknownWorkflowInput { name: name.clone() });
        }
    }
    let mut bindings = FxHashMap::default();
    for spec in &def.inputs {
        match inputs.get(&spec.name) {
            Some(Slot::Value(value)) => {
                let admitted = if lattice.admits(value, &spec.ty) {
                    value.clone()
                } else if let Some(coerced) = lattice.coerce(value, &spec.ty) {
                    coerced
                } else {
                    return Err(BuildError::TypeMismatch {
                        src: format!("value `{value}`"),
                        src_ty: value_kind(value).to_string(),
                        dst_node: def.id.clone(),
                        dst_field: spec.name.clone(),
                        dst_ty: spec.ty.to_string(),
                    });
                };
                bindings.insert(spec.name.clone(), Slot::Value(admitted));
            }
            Some(Slot::Lazy(lazy)) => {
                if lattice.assignable(&lazy.ty, &spec.ty).is_reject() {
                    return Err(BuildError::TypeMismatch {
                        src: describe_lazy(lazy),
                        src_ty: lazy.ty.to_string(),
                        dst_node: def.id.clone(),
                        dst_field: spec.name.clone(),
                        dst_ty: spec.ty.to_string(),
                    });
                }
                bindings.insert(spec.name.clone(), Slot::Lazy(lazy.clone()));
            }
            None => {
                if let Some(default) = &spec.default {
                    bindings.insert(spec.name.clone(), Slot::Value(default.clone()));
                } else if spec.required {
                    return Err(BuildError::MissingRequiredInput {
                        node: def.id.clone(),
                        field: spec.name.clone(),
                    });
                }
            }
        }
    }
    let mut builder = WorkflowBuilder::new(
        def.id.clone(),
        lattice.clone(),
        def.inputs.clone(),
        bindings,
        def.outputs.clone(),
    );
    ctor(&mut builder)?;
    builder.finish()
}

/// Declaration builder for [`WorkflowDef`]; `constructor` finishes it.
pub struct WorkflowDefBuilder {
    id: String,
    inputs: Vec<FieldSpec>,
    outputs: Vec<FieldSpec>,
    env: Option<EnvSpec>,
    retry: Option<RetryPolicy>,
    timeout: Option<Duration>,
}

impl WorkflowDefBuilder {
    #[must_use]
    pub fn input(mut self, name: impl Into<String>, ty: TypeSpec) -> Self {
        self.inputs.push(FieldSpec::required(name, ty));
        self
    }

    #[must_use]
    pub fn input_default(mut self, name: impl Into<String>, ty: TypeSpec, default: Value) -> Self {
        self.inputs.push(FieldSpec::optional(name, ty, default));
        self
    }

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
        self.retry = Some(retry);
        self
    }

    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Attaches the constructor closure and finishes the definition.
    pub fn constructor<F>(self, ctor: F) -> WorkflowDef
    where
        F: Fn(&mut WorkflowBuilder) -> Result<(), BuildError> + Send + Sync + 'static,
    {
        let ctor: Arc<WorkflowCtor> = Arc::new(ctor);
        let mut builder =
            TaskDefBuilder::from_kind(self.id, TaskKind::Workflow(Arc::clone(&ctor)));
        for input in self.inputs {
            builder = builder.input_spec(input);
        }
        for output in self.outputs {
            builder = builder.output(output.name, output.ty);
        }
        if let Some(env) = self.env {
            builder = builder.env(env);
        }
        if let Some(retry) = self.retry {
            builder = builder.retry(retry);
        }
        if let Some(timeout) = self.timeout {
            builder = builder.timeout(timeout);
        }
        WorkflowDef {
            def: builder.build(),
            ctor,
        }
    }
}
