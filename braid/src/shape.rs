//! State shapes: the split/combine lattice.
//!
//! A node's *state shape* is the ordered list of axes its state array
//! iterates over, each with a cardinality. Axis identity is resolved during
//! construction (it depends only on wiring); cardinality is resolved when
//! the scheduler materializes the node's state array, because a split
//! sequence may itself be a lazily produced value.
//!
//! The functions here are pure shape math: coordinate enumeration in
//! lexicographic order, projection of a consumer coordinate onto a
//! producer's cells, and the gather enumeration used by combine.

use miette::Diagnostic;
use rustc_hash::FxHashMap;
use thiserror::Error;

use crate::types::{AxisId, Coord};

/// Errors raised while materializing state arrays.
#[derive(Debug, Error, Diagnostic)]
pub enum ShapeError {
    /// Two producers contribute the same axis with different cardinalities.
    #[error("axis `{axis}` has conflicting cardinalities {left} and {right}")]
    #[diagnostic(
        code(braid::shape::axis_mismatch),
        help("Producers sharing an axis id form a join and must agree on its length.")
    )]
    AxisMismatch {
        axis: AxisId,
        left: usize,
        right: usize,
    },

    /// The sequences of a linked split have different lengths.
    #[error("linked split `{axis}` has unequal sequence lengths")]
    #[diagnostic(code(braid::shape::linked_length_mismatch))]
    LinkedLengthMismatch { axis: AxisId },

    /// A split source resolved to a non-sequence value.
    #[error("split source for `{node}.{field}` is not a sequence")]
    #[diagnostic(code(braid::shape::split_not_sequence))]
    SplitNotSequence { node: String, field: String },
}

/// One axis of a state shape.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Axis {
    pub id: AxisId,
    pub len: usize,
}

/// Ordered axes with cardinalities; the empty shape is scalar.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StateShape {
    axes: Vec<Axis>,
}

impl StateShape {
    #[must_use]
    pub fn scalar() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn from_axes(axes: Vec<Axis>) -> Self {
        Self { axes }
    }

    #[must_use]
    pub fn axes(&self) -> &[Axis] {
        &self.axes
    }

    #[must_use]
    pub fn is_scalar(&self) -> bool {
        self.axes.is_empty()
    }

    #[must_use]
    pub fn axis_len(&self, id: &AxisId) -> Option<usize> {
        self.axes.iter().find(|a| &a.id == id).map(|a| a.len)
    }

    /// Number of cells in the state array; zero if any axis is empty.
    #[must_use]
    pub fn cell_count(&self) -> usize {
        self.axes.iter().map(|a| a.len).product()
    }

    /// All coordinates in lexicographic order (first axis most
    /// significant). A scalar shape has the single empty coordinate.
    #[must_use]
    pub fn coords(&self) -> Vec<Coord> {
        enumerate(&self.axes.iter().map(|a| a.len).collect::<Vec<_>>())
    }

    /// Position of a coordinate within [`coords`](Self::coords) order.
    #[must_use]
    pub fn position(&self, coord: &Coord) -> usize {
        let mut pos = 0;
        for (axis, &idx) in self.axes.iter().zip(coord) {
            pos = pos * axis.len + idx;
        }
        pos
    }

    /// Maps each axis id to its index within `coord`.
    #[must_use]
    pub fn coord_by_axis(&self, coord: &Coord) -> FxHashMap<AxisId, usize> {
        self.axes
            .iter()
            .zip(coord)
            .map(|(axis, &idx)| (axis.id.clone(), idx))
            .collect()
    }
}

/// Cells of `shape` selected by fixing some axes and gathering the rest.
///
/// Axes present in `fixed` take the given index; every other axis is
/// enumerated over its full range. The returned cells are ordered
/// lexicographically over the gathered axes (in shape order), which is the
/// combine gather order. With nothing to gather this returns the single
/// projected cell.
#[must_use]
pub fn select_cells(shape: &StateShape, fixed: &FxHashMap<AxisId, usize>) -> Vec<Coord> {
    let lens: Vec<usize> = shape
        .axes()
        .iter()
        .filter(|axis| !fixed.contains_key(&axis.id))
        .map(|axis| axis.len)
        .collect();

    enumerate(&lens)
        .into_iter()
        .map(|gather_coord| {
            let mut cell: Coord = Vec::with_capacity(shape.axes().len());
            let mut g = 0;
            for axis in shape.axes() {
                if let Some(&idx) = fixed.get(&axis.id) {
                    cell.push(idx);
                } else {
                    cell.push(gather_coord[g]);
                    g += 1;
                }
            }
            cell
        })
        .collect()
}

/// Lexicographic odometer over the given cardinalities.
fn enumerate(lens: &[usize]) -> Vec<Coord> {
    if lens.iter().any(|&l| l == 0) {
        return Vec::new();
    }
    let total: usize = lens.iter().product();
    let mut out = Vec::with_capacity(total);
    let mut coord = vec![0usize; lens.len()];
    for _ in 0..total {
        out.push(coord.clone());
        for i in (0..lens.len()).rev() {
            coord[i] += 1;
            if coord[i] < lens[i] {
                break;
            }
            coord[i] = 0;
        }
    }
    out
}
