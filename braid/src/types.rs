//! Core identifier types for the braid dataflow engine.
//!
//! This module defines the small vocabulary shared by every other module:
//! axis identifiers for split/combine fan-out and work-unit identifiers for
//! per-state execution instances. Runtime infrastructure types (shapes,
//! stores, unit bookkeeping) live with the components that own them.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Coordinate of a cell within a node's state array.
///
/// One index per axis, in the node's axis order. The empty coordinate is the
/// single cell of a scalar (un-split) node.
pub type Coord = Vec<usize>;

/// Identifier of a split axis.
///
/// Axes are named after the node and field that introduced them,
/// `"{node}.{field}"`, so a downstream node can close an upstream axis by
/// referring to it by name. A linked split over several fields joins the
/// field names with `+` (e.g. `"mul.a+b"`).
///
/// # Examples
///
/// ```rust
/// use braid::types::AxisId;
///
/// let axis = AxisId::new("mul", "a");
/// assert_eq!(axis.as_str(), "mul.a");
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AxisId(String);

impl AxisId {
    /// Axis introduced by splitting `field` on `node`.
    pub fn new(node: &str, field: &str) -> Self {
        Self(format!("{node}.{field}"))
    }

    /// Axis introduced by a linked split over several fields of `node`.
    pub fn linked<'a>(node: &str, fields: impl IntoIterator<Item = &'a str>) -> Self {
        let joined = fields.into_iter().collect::<Vec<_>>().join("+");
        Self(format!("{node}.{joined}"))
    }

    /// Wraps an already-formatted axis id.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AxisId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for AxisId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Identifies a single execution instance: one node at one state coordinate.
///
/// Scalar nodes render as the bare node name, split nodes carry their
/// coordinate: `"mul[1,0]"`. Unit ids of nested workflows are re-rooted by
/// the scheduler under `"{outer_unit}/"` when reported upward.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct UnitId {
    pub node: String,
    pub coord: Coord,
}

impl UnitId {
    pub fn new(node: impl Into<String>, coord: Coord) -> Self {
        Self {
            node: node.into(),
            coord,
        }
    }

    /// Scalar unit of an un-split node.
    pub fn scalar(node: impl Into<String>) -> Self {
        Self::new(node, Vec::new())
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.coord.is_empty() {
            write!(f, "{}", self.node)
        } else {
            let idx = self
                .coord
                .iter()
                .map(|i| i.to_string())
                .collect::<Vec<_>>()
                .join(",");
            write!(f, "{}[{}]", self.node, idx)
        }
    }
}
