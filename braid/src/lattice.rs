//! The type lattice: compatibility checks for dataflow wiring.
//!
//! Every input and output field of a task carries a [`TypeSpec`]. When the
//! builder wires a lazy output into a downstream input it asks the lattice
//! whether the source type is assignable to the destination type; at dispatch
//! time the same lattice re-checks concrete values that were admitted through
//! the `Any` escape hatch.
//!
//! The subtype relation is covariant: `Any` is the top element, containers
//! are covariant in their element types, tuples are element-wise with arity
//! match, and union sources must satisfy in every variant while union
//! destinations need only one. File-format subtyping is delegated to an
//! external [`FormatOracle`] that answers ancestor chains, keeping the
//! format hierarchy out of the engine.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Tag naming a file format, e.g. `"image/png"`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FormatTag(pub String);

impl FormatTag {
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for FormatTag {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for FormatTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Type of a task field.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TypeSpec {
    /// Top of the lattice; assignable to and from everything. Wires typed as
    /// `Any` defer their check to dispatch time.
    Any,
    Bool,
    Int,
    Float,
    Str,
    /// A file on disk, tagged with its format. Runtime representation is the
    /// path as a string; the cache hashes the content behind it.
    File(FormatTag),
    /// Ordered sequence, covariant in the element type.
    Sequence(Box<TypeSpec>),
    /// Fixed-arity tuple, element-wise covariant.
    Tuple(Vec<TypeSpec>),
    Set(Box<TypeSpec>),
    Map(Box<TypeSpec>, Box<TypeSpec>),
    Union(Vec<TypeSpec>),
}

impl TypeSpec {
    /// Shorthand for `Sequence`.
    pub fn seq(elem: TypeSpec) -> Self {
        TypeSpec::Sequence(Box::new(elem))
    }

    /// Shorthand for `Union`.
    pub fn union(variants: impl IntoIterator<Item = TypeSpec>) -> Self {
        TypeSpec::Union(variants.into_iter().collect())
    }

    /// Shorthand for `File`.
    pub fn file(tag: impl Into<FormatTag>) -> Self {
        TypeSpec::File(tag.into())
    }
}

impl fmt::Display for TypeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeSpec::Any => write!(f, "any"),
            TypeSpec::Bool => write!(f, "bool"),
            TypeSpec::Int => write!(f, "int"),
            TypeSpec::Float => write!(f, "float"),
            TypeSpec::Str => write!(f, "str"),
            TypeSpec::File(tag) => write!(f, "file({tag})"),
            TypeSpec::Sequence(e) => write!(f, "seq({e})"),
            TypeSpec::Tuple(es) => {
                write!(f, "tuple(")?;
                for (i, e) in es.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{e}")?;
                }
                write!(f, ")")
            }
            TypeSpec::Set(e) => write!(f, "set({e})"),
            TypeSpec::Map(k, v) => write!(f, "map({k}, {v})"),
            TypeSpec::Union(vs) => {
                write!(f, "union(")?;
                for (i, v) in vs.iter().enumerate() {
                    if i > 0 {
                        write!(f, " | ")?;
                    }
                    write!(f, "{v}")?;
                }
                write!(f, ")")
            }
        }
    }
}

/// Verdict of an assignability query.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Assignability {
    /// The source type is a subtype of the destination.
    Ok,
    /// Assignable after a lossless coercion (numeric widening).
    Coerce,
    Reject,
}

impl Assignability {
    #[must_use]
    pub fn is_reject(self) -> bool {
        matches!(self, Assignability::Reject)
    }

    /// Worst of two verdicts; used to fold element-wise checks.
    fn meet(self, other: Assignability) -> Assignability {
        use Assignability::*;
        match (self, other) {
            (Reject, _) | (_, Reject) => Reject,
            (Coerce, _) | (_, Coerce) => Coerce,
            _ => Ok,
        }
    }
}

/// External delegate resolving the file-format hierarchy.
///
/// The engine treats format tags as opaque; the oracle answers which tags
/// are ancestors of which. `assignable(File(png), File(file))` holds when
/// `file` appears in `ancestors(png)`.
pub trait FormatOracle: Send + Sync {
    /// Ancestor chain of `tag`, nearest first, excluding `tag` itself.
    fn ancestors(&self, tag: &FormatTag) -> Vec<FormatTag>;

    /// Canonical display name for a tag.
    fn canonical_name(&self, tag: &FormatTag) -> String {
        tag.0.clone()
    }
}

/// Built-in [`FormatOracle`] backed by registered child → parent edges.
#[derive(Default)]
pub struct FormatRegistry {
    parents: FxHashMap<FormatTag, FormatTag>,
}

impl FormatRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares `child` to be a subtype of `parent`.
    pub fn register(&mut self, child: impl Into<FormatTag>, parent: impl Into<FormatTag>) {
        self.parents.insert(child.into(), parent.into());
    }
}

impl FormatOracle for FormatRegistry {
    fn ancestors(&self, tag: &FormatTag) -> Vec<FormatTag> {
        let mut chain = Vec::new();
        let mut cursor = tag;
        while let Some(parent) = self.parents.get(cursor) {
            if chain.contains(parent) {
                break;
            }
            chain.push(parent.clone());
            cursor = parent;
        }
        chain
    }
}

/// Assignability oracle over the covariant subtype lattice.
#[derive(Clone)]
pub struct TypeLattice {
    oracle: Arc<dyn FormatOracle>,
}

impl Default for TypeLattice {
    fn default() -> Self {
        Self {
            oracle: Arc::new(FormatRegistry::new()),
        }
    }
}

impl TypeLattice {
    pub fn new(oracle: Arc<dyn FormatOracle>) -> Self {
        Self { oracle }
    }

    /// Can a value of `src` flow into a slot of `dst`?
    pub fn assignable(&self, src: &TypeSpec, dst: &TypeSpec) -> Assignability {
        use TypeSpec::*;
        match (src, dst) {
            (Any, _) | (_, Any) => Assignability::Ok,
            // A union source must satisfy in every variant.
            (Union(vs), d) => vs
                .iter()
                .map(|v| self.assignable(v, d))
                .fold(Assignability::Ok, Assignability::meet),
            // A non-union source needs one admitting variant.
            (s, Union(vs)) => {
                let mut best = Assignability::Reject;
                for v in vs {
                    match self.assignable(s, v) {
                        Assignability::Ok => return Assignability::Ok,
                        Assignability::Coerce => best = Assignability::Coerce,
                        Assignability::Reject => {}
                    }
                }
                best
            }
            (Bool, Bool) | (Int, Int) | (Float, Float) | (Str, Str) => Assignability::Ok,
            (Int, Float) => Assignability::Coerce,
            (File(a), File(b)) => {
                if a == b || self.oracle.ancestors(a).contains(b) {
                    Assignability::Ok
                } else {
                    Assignability::Reject
                }
            }
            (Sequence(a), Sequence(b)) | (Set(a), Set(b)) => self.assignable(a, b),
            (Map(ka, va), Map(kb, vb)) => {
                self.assignable(ka, kb).meet(self.assignable(va, vb))
            }
            (Tuple(a), Tuple(b)) => {
                if a.len() != b.len() {
                    return Assignability::Reject;
                }
                a.iter()
                    .zip(b)
                    .map(|(x, y)| self.assignable(x, y))
                    .fold(Assignability::Ok, Assignability::meet)
            }
            _ => Assignability::Reject,
        }
    }

    /// Does a concrete runtime value conform to `ty`?
    ///
    /// Used to validate concrete bindings at build time and to re-check
    /// `Any`-escaped wires at dispatch.
    pub fn admits(&self, value: &Value, ty: &TypeSpec) -> bool {
        match ty {
            TypeSpec::Any => true,
            TypeSpec::Bool => value.is_boolean(),
            TypeSpec::Int => value.as_i64().is_some() || value.as_u64().is_some(),
            TypeSpec::Float => value.is_number(),
            TypeSpec::Str => value.is_string(),
            TypeSpec::File(_) => value.is_string(),
            TypeSpec::Sequence(e) | TypeSpec::Set(e) => value
                .as_array()
                .is_some_and(|items| items.iter().all(|v| self.admits(v, e))),
            TypeSpec::Tuple(es) => value.as_array().is_some_and(|items| {
                items.len() == es.len()
                    && items.iter().zip(es).all(|(v, e)| self.admits(v, e))
            }),
            TypeSpec::Map(k, v) => value.as_object().is_some_and(|map| {
                matches!(**k, TypeSpec::Str | TypeSpec::Any)
                    && map.values().all(|val| self.admits(val, v))
            }),
            TypeSpec::Union(vs) => vs.iter().any(|v| self.admits(value, v)),
        }
    }

    /// Attempts to coerce `value` into conformance with `ty`.
    ///
    /// Only the lattice's lossless coercions are applied: integer values
    /// widen to floats, recursively through containers. Returns `None` when
    /// the value cannot be made to conform.
    pub fn coerce(&self, value: &Value, ty: &TypeSpec) -> Option<Value> {
        if self.admits(value, ty) {
            return Some(value.clone());
        }
        match ty {
            TypeSpec::Float => {
                let n = value.as_i64().map(|i| i as f64)?;
                serde_json::Number::from_f64(n).map(Value::Number)
            }
            TypeSpec::Sequence(e) | TypeSpec::Set(e) => {
                let items = value.as_array()?;
                items
                    .iter()
                    .map(|v| self.coerce(v, e))
                    .collect::<Option<Vec<_>>>()
                    .map(Value::Array)
            }
            TypeSpec::Tuple(es) => {
                let items = value.as_array()?;
                if items.len() != es.len() {
                    return None;
                }
                items
                    .iter()
                    .zip(es)
                    .map(|(v, e)| self.coerce(v, e))
                    .collect::<Option<Vec<_>>>()
                    .map(Value::Array)
            }
            TypeSpec::Union(vs) => vs.iter().find_map(|v| self.coerce(value, v)),
            _ => None,
        }
    }
}
