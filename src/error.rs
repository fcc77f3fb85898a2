//! Typed error taxonomy for grid, matrix and redistribution failures.
//!
//! Configuration errors are detected synchronously: every process receives
//! identical arguments under SPMD, so a failing call fails identically on all
//! of them without any communication. Addressing errors are debug-assertions
//! on the local buffer. Mismatched collective calls are not detectable here;
//! they hang the group by contract.

use crate::dist::Scheme;
use crate::prelude::*;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DistError {
    #[error("grid height {height} does not divide the group size {size}")]
    InvalidGridShape { size: usize, height: usize },

    #[error("scheme {0} assigns both axes to the same grid dimension")]
    InvalidScheme(Scheme),

    #[error("alignment {align} is out of range for an axis with {extent} coordinates")]
    InvalidAlignment { align: u64, extent: u64 },

    #[error("operands are bound to different process grids")]
    GridMismatch,

    #[error("cannot resize a view")]
    ReadOnlyResize,

    #[error("cannot write through a locked view")]
    LockedView,

    #[error("cannot change alignment after the buffer was allocated")]
    AlignmentAfterAllocation,

    #[error("view outlived a reallocating resize of its parent")]
    StaleView,

    #[error("no communication protocol routes {src} to {dst}")]
    UnroutableRedistribution { src: Scheme, dst: Scheme },

    #[error("view of {rows}x{cols} at ({i}, {j}) exceeds the {height}x{width} parent")]
    ViewOutOfBounds {
        i: u64,
        j: u64,
        rows: u64,
        cols: u64,
        height: u64,
        width: u64,
    },
}
