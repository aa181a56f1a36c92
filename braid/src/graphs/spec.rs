//! The frozen workflow graph.
//!
//! A [`GraphSpec`] is the output of construction: insertion-ordered nodes
//! (insertion order is topological, because a lazy input can only refer to
//! a node that already exists), declared inputs with their bindings, and
//! the workflow's output wiring. It is immutable and `Arc`-shared between
//! the submitter and the scheduler.

use rustc_hash::FxHashMap;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;

use crate::task::{FieldSpec, RetryPolicy, SplitDecl, TaskDef, TaskKind};
use crate::types::AxisId;
use crate::value::{LazyRef, LazySource, Slot};
use crate::workers::EnvSpec;

/// One node of the frozen graph.
#[derive(Clone, Debug)]
pub struct NodeSpec {
    pub name: String,
    pub task: Arc<TaskDef>,
    /// Resolved input bindings, in declaration order.
    pub inputs: Vec<(String, Slot)>,
    /// Local split declarators with their assigned axis ids.
    pub splits: Vec<(AxisId, SplitDecl)>,
    /// Axes this node closes; outputs gather along them downstream.
    pub combines: Vec<AxisId>,
    pub env: Option<EnvSpec>,
    pub retry: RetryPolicy,
    pub timeout: Option<Duration>,
    /// Axes the node's state array iterates over: the union of its
    /// producers' open axes plus its local splits.
    pub exec_axes: Vec<AxisId>,
    /// `exec_axes` minus `combines`; what consumers inherit.
    pub downstream_axes: Vec<AxisId>,
}

impl NodeSpec {
    /// The input binding for `field`, if bound.
    #[must_use]
    pub fn input(&self, field: &str) -> Option<&Slot> {
        self.inputs
            .iter()
            .find(|(name, _)| name == field)
            .map(|(_, slot)| slot)
    }

    /// Names of upstream nodes this node reads, without duplicates.
    #[must_use]
    pub fn producer_nodes(&self) -> Vec<&str> {
        let mut producers = Vec::new();
        for (_, slot) in self.inputs.iter().chain(
            self.splits
                .iter()
                .flat_map(|(_, decl)| decl.fields.iter()),
        ) {
            if let Slot::Lazy(LazyRef {
                source: LazySource::Node { node, .. },
                ..
            }) = slot
            {
                if !producers.contains(&node.as_str()) {
                    producers.push(node.as_str());
                }
            }
        }
        producers
    }
}

/// Frozen DAG: nodes in insertion (topological) order, declared inputs and
/// bindings, and workflow output wiring.
#[derive(Clone, Debug)]
pub struct GraphSpec {
    name: String,
    nodes: Vec<NodeSpec>,
    index: FxHashMap<String, usize>,
    input_specs: Vec<FieldSpec>,
    input_bindings: FxHashMap<String, Slot>,
    output_specs: Vec<FieldSpec>,
    outputs: Vec<(String, LazyRef)>,
}

impl GraphSpec {
    pub(crate) fn new(
        name: String,
        nodes: Vec<NodeSpec>,
        index: FxHashMap<String, usize>,
        input_specs: Vec<FieldSpec>,
        input_bindings: FxHashMap<String, Slot>,
        output_specs: Vec<FieldSpec>,
        outputs: Vec<(String, LazyRef)>,
    ) -> Self {
        Self {
            name,
            nodes,
            index,
            input_specs,
            input_bindings,
            output_specs,
            outputs,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Nodes in insertion order; the order is topological.
    #[must_use]
    pub fn nodes(&self) -> &[NodeSpec] {
        &self.nodes
    }

    #[must_use]
    pub fn node(&self, name: &str) -> Option<&NodeSpec> {
        self.index.get(name).map(|&i| &self.nodes[i])
    }

    #[must_use]
    pub fn node_index(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    #[must_use]
    pub fn input_specs(&self) -> &[FieldSpec] {
        &self.input_specs
    }

    #[must_use]
    pub fn output_specs(&self) -> &[FieldSpec] {
        &self.output_specs
    }

    /// Declared workflow outputs and their wiring.
    #[must_use]
    pub fn outputs(&self) -> &[(String, LazyRef)] {
        &self.outputs
    }

    /// Concrete value bound to a declared input, if the binding is concrete.
    #[must_use]
    pub fn input_value(&self, name: &str) -> Option<&Value> {
        self.input_bindings.get(name).and_then(Slot::as_value)
    }

    /// Deterministic digest of the graph's structure: node names, task ids,
    /// wiring, split/combine declarators, and constant bindings. Nested
    /// workflow cache keys incorporate it so that two structurally different
    /// graphs never share a key.
    #[must_use]
    pub fn structural_digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.name.as_bytes());
        for node in &self.nodes {
            hasher.update(b"\x1fnode\x1f");
            hasher.update(node.name.as_bytes());
            hasher.update(node.task.id.as_bytes());
            hasher.update(kind_tag(&node.task.kind));
            for (field, slot) in &node.inputs {
                hasher.update(b"\x1fin\x1f");
                hasher.update(field.as_bytes());
                hash_slot(&mut hasher, slot);
            }
            for (axis, decl) in &node.splits {
                hasher.update(b"\x1fsplit\x1f");
                hasher.update(axis.as_str().as_bytes());
                for (field, slot) in &decl.fields {
                    hasher.update(field.as_bytes());
                    hash_slot(&mut hasher, slot);
                }
            }
            for axis in &node.combines {
                hasher.update(b"\x1fcombine\x1f");
                hasher.update(axis.as_str().as_bytes());
            }
        }
        for (name, lazy) in &self.outputs {
            hasher.update(b"\x1fout\x1f");
            hasher.update(name.as_bytes());
            hash_lazy(&mut hasher, lazy);
        }
        hex_digest(hasher)
    }
}

fn kind_tag(kind: &TaskKind) -> &'static [u8] {
    match kind {
        TaskKind::Function(_) => b"fn",
        TaskKind::Command(_) => b"cmd",
        TaskKind::Workflow(_) => b"wf",
    }
}

fn hash_slot(hasher: &mut Sha256, slot: &Slot) {
    match slot {
        Slot::Value(v) => {
            hasher.update(b"v:");
            hasher.update(crate::cache::key::canonical_value(v).as_bytes());
        }
        Slot::Lazy(l) => hash_lazy(hasher, l),
    }
}

fn hash_lazy(hasher: &mut Sha256, lazy: &LazyRef) {
    match &lazy.source {
        LazySource::Input(name) => {
            hasher.update(b"l:input:");
            hasher.update(name.as_bytes());
        }
        LazySource::Node { node, field } => {
            hasher.update(b"l:node:");
            hasher.update(node.as_bytes());
            hasher.update(b".");
            hasher.update(field.as_bytes());
        }
    }
}

fn hex_digest(hasher: Sha256) -> String {
    let bytes = hasher.finalize();
    let mut hex = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        use std::fmt::Write;
        let _ = write!(hex, "{b:02x}");
    }
    hex
}
