//! Values, lazy references, and the output store.
//!
//! Construction-time wiring never runs a task, so an input binding is a
//! [`Slot`]: either a concrete [`serde_json::Value`] or a [`LazyRef`]
//! placeholder for a not-yet-computed output. The sum type is what lets the
//! builder reject attempts to read a concrete value out of a placeholder
//! (the *lazy-in-condition* error).
//!
//! At runtime the scheduler materializes outputs into an [`OutputStore`]:
//! one record per `(node, coordinate)` cell, written exactly once by the
//! scheduler's bookkeeping step and immutable afterwards.

use rustc_hash::FxHashMap;
use serde_json::Value;

use crate::lattice::TypeSpec;
use crate::types::{AxisId, Coord};

/// Resolved field bindings of a single execution, keyed by field name.
pub type Bindings = FxHashMap<String, Value>;

/// Where a lazy reference draws its value from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LazySource {
    /// A declared workflow input.
    Input(String),
    /// An output field of an upstream node.
    Node { node: String, field: String },
}

/// Placeholder for a not-yet-computed value.
///
/// Returned by [`OutputsProxy::out`](crate::graphs::OutputsProxy::out) when
/// a node is added, and consumed when bound to a downstream input. Carries
/// the declared output type (for wire-up checking) and the set of split
/// axes still open on the producing node.
#[derive(Clone, Debug, PartialEq)]
pub struct LazyRef {
    pub source: LazySource,
    pub ty: TypeSpec,
    pub axes: Vec<AxisId>,
}

impl LazyRef {
    /// Lazy reference to a declared workflow input.
    pub fn input(name: impl Into<String>, ty: TypeSpec) -> Self {
        Self {
            source: LazySource::Input(name.into()),
            ty,
            axes: Vec::new(),
        }
    }

    /// Lazy reference to a node output.
    pub fn node(node: impl Into<String>, field: impl Into<String>, ty: TypeSpec) -> Self {
        Self {
            source: LazySource::Node {
                node: node.into(),
                field: field.into(),
            },
            ty,
            axes: Vec::new(),
        }
    }

    pub(crate) fn with_axes(mut self, axes: Vec<AxisId>) -> Self {
        self.axes = axes;
        self
    }
}

/// An input binding: a concrete value or a lazy placeholder.
#[derive(Clone, Debug, PartialEq)]
pub enum Slot {
    Value(Value),
    Lazy(LazyRef),
}

impl Slot {
    #[must_use]
    pub fn is_lazy(&self) -> bool {
        matches!(self, Slot::Lazy(_))
    }

    /// The concrete value, if this slot holds one.
    #[must_use]
    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Slot::Value(v) => Some(v),
            Slot::Lazy(_) => None,
        }
    }

    #[must_use]
    pub fn as_lazy(&self) -> Option<&LazyRef> {
        match self {
            Slot::Lazy(l) => Some(l),
            Slot::Value(_) => None,
        }
    }
}

impl From<Value> for Slot {
    fn from(v: Value) -> Self {
        Slot::Value(v)
    }
}

impl From<LazyRef> for Slot {
    fn from(l: LazyRef) -> Self {
        Slot::Lazy(l)
    }
}

impl From<i64> for Slot {
    fn from(v: i64) -> Self {
        Slot::Value(Value::from(v))
    }
}

impl From<f64> for Slot {
    fn from(v: f64) -> Self {
        Slot::Value(Value::from(v))
    }
}

impl From<bool> for Slot {
    fn from(v: bool) -> Self {
        Slot::Value(Value::from(v))
    }
}

impl From<&str> for Slot {
    fn from(v: &str) -> Self {
        Slot::Value(Value::from(v))
    }
}

impl From<String> for Slot {
    fn from(v: String) -> Self {
        Slot::Value(Value::from(v))
    }
}

/// Materialized outputs of completed work units.
///
/// Keyed by `(node, coordinate)`. The scheduler is the only writer and all
/// writes happen between its suspension points, so no synchronization is
/// needed on the store itself.
#[derive(Debug, Default)]
pub struct OutputStore {
    cells: FxHashMap<(String, Coord), Bindings>,
}

impl OutputStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the outputs of one completed cell. Cells are written once.
    pub fn insert(&mut self, node: &str, coord: Coord, outputs: Bindings) {
        self.cells.insert((node.to_string(), coord), outputs);
    }

    /// All outputs of one cell, if complete.
    #[must_use]
    pub fn cell(&self, node: &str, coord: &Coord) -> Option<&Bindings> {
        self.cells.get(&(node.to_string(), coord.clone()))
    }

    /// A single output field of one cell.
    #[must_use]
    pub fn field(&self, node: &str, coord: &Coord, field: &str) -> Option<&Value> {
        self.cell(node, coord).and_then(|c| c.get(field))
    }

    #[must_use]
    pub fn contains(&self, node: &str, coord: &Coord) -> bool {
        self.cells.contains_key(&(node.to_string(), coord.clone()))
    }
}
