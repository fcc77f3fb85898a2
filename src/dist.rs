//! Distribution schemes and the per-process axis layouts they induce.
//!
//! A [`Scheme`] is a pair of axis tags plus one alignment per axis: the
//! column distribution partitions the row index space (the matrix height),
//! the row distribution partitions the column index space. Each tag claims
//! zero, one or both grid dimensions; a scheme is valid when its two tags
//! claim disjoint dimensions.
//!
//! The runtime tag set replaces per-combination generated code: every
//! ownership question reduces to the shift/stride algebra in
//! [`gridmat_core::algebra`] through an [`AxisLayout`] resolved against a
//! concrete grid.

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};

use crate::grid::ProcessGrid;
use crate::prelude::*;
use gridmat_core::algebra as alg;

/// How one matrix axis is partitioned across the grid.
#[derive(Serialize, Deserialize, Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum AxisDist {
    /// Round-robin over the grid rows.
    RowCyclic,
    /// Round-robin over the grid columns.
    ColCyclic,
    /// Round-robin over all processes, row-major rank order.
    RowMajorLinear,
    /// Round-robin over all processes, column-major rank order.
    ColMajorLinear,
    /// Every process holds the full axis.
    Replicated,
    /// One fixed process holds the full axis.
    SingleOwner,
    /// Round-robin over the diagonal path of the grid.
    Diagonal,
    /// Not yet chosen; unroutable.
    Unspecified,
}

/// Which matrix axis a tag is attached to.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Axis {
    /// The row index space (matrix height); `colDist` in the usual notation.
    Col,
    /// The column index space (matrix width); `rowDist`.
    Row,
}

impl AxisDist {
    pub fn is_specified(self) -> bool {
        self != AxisDist::Unspecified
    }

    pub fn is_cyclic(self) -> bool {
        matches!(self, AxisDist::RowCyclic | AxisDist::ColCyclic)
    }

    pub fn is_linear(self) -> bool {
        matches!(self, AxisDist::RowMajorLinear | AxisDist::ColMajorLinear)
    }

    /// Grid dimensions `(rows, cols)` whose coordinate this tag consumes.
    pub(crate) fn claims(self, axis: Axis) -> (bool, bool) {
        use AxisDist::*;

        match self {
            RowCyclic => (true, false),
            ColCyclic => (false, true),
            RowMajorLinear | ColMajorLinear | Diagonal => (true, true),
            Replicated | Unspecified => (false, false),
            SingleOwner => match axis {
                Axis::Col => (true, false),
                Axis::Row => (false, true),
            },
        }
    }

    /// Alignment of the sub-range starting at `offset` within an axis that
    /// has this alignment: cyclic and linear tags rotate, the rest are
    /// position independent.
    pub fn align_of_subrange(self, align: u64, offset: u64, extent: u64) -> u64 {
        if self.is_cyclic() || self.is_linear() {
            (align + offset) % extent
        } else {
            align
        }
    }

    /// Size of the coordinate space alignments live in.
    pub fn extent(self, axis: Axis, grid: &ProcessGrid) -> u64 {
        use AxisDist::*;
        let (r, c) = (grid.height() as u64, grid.width() as u64);

        match self {
            RowCyclic => r,
            ColCyclic => c,
            RowMajorLinear | ColMajorLinear => r * c,
            Replicated | Unspecified => 1,
            SingleOwner => match axis {
                Axis::Col => r,
                Axis::Row => c,
            },
            Diagonal => alg::lcm(r, c),
        }
    }
}

/// Resolved per-process view of one distributed axis.
///
/// `shift` is the smallest global index owned by this process, `stride` the
/// distance between consecutive owned indices. Processes outside a
/// single-owner or diagonal distribution do not participate and own nothing.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct AxisLayout {
    pub stride: u64,
    pub shift: u64,
    pub participates: bool,
}

impl AxisLayout {
    pub(crate) fn empty() -> Self {
        Self {
            stride: 1,
            shift: 0,
            participates: false,
        }
    }

    pub fn local_length(&self, n: u64) -> u64 {
        if self.participates {
            alg::local_length(n, self.shift, self.stride)
        } else {
            0
        }
    }

    pub fn owns(&self, i: u64) -> bool {
        self.participates && i >= self.shift && (i - self.shift) % self.stride == 0
    }

    pub fn local_index(&self, i: u64) -> Option<u64> {
        if self.participates {
            alg::local_index(i, self.shift, self.stride)
        } else {
            None
        }
    }

    pub fn global_index(&self, iloc: u64) -> u64 {
        debug_assert!(self.participates);
        alg::global_index(iloc, self.shift, self.stride)
    }

    /// The owned global indices below `n`, ascending.
    pub fn owned(&self, n: u64) -> Vec<u64> {
        let (shift, stride) = (self.shift, self.stride);
        (0..self.local_length(n))
            .map(move |iloc| alg::global_index(iloc, shift, stride))
            .collect()
    }
}

/// A pair of axis distributions plus their alignments.
#[derive(Serialize, Deserialize, Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Scheme {
    pub col_dist: AxisDist,
    pub row_dist: AxisDist,
    pub col_align: u64,
    pub row_align: u64,
}

impl Scheme {
    pub fn new(col_dist: AxisDist, row_dist: AxisDist) -> Self {
        Self::with_aligns(col_dist, row_dist, 0, 0)
    }

    pub fn with_aligns(col_dist: AxisDist, row_dist: AxisDist, col_align: u64, row_align: u64) -> Self {
        Self {
            col_dist,
            row_dist,
            col_align,
            row_align,
        }
    }

    /// The standard 2D scheme: rows cyclic over grid rows, columns cyclic
    /// over grid columns.
    pub fn standard() -> Self {
        Self::new(AxisDist::RowCyclic, AxisDist::ColCyclic)
    }

    pub fn replicated() -> Self {
        Self::new(AxisDist::Replicated, AxisDist::Replicated)
    }

    /// Everything on the single process at the given grid coordinate.
    pub fn rooted(row: usize, col: usize) -> Self {
        Self::with_aligns(
            AxisDist::SingleOwner,
            AxisDist::SingleOwner,
            row as u64,
            col as u64,
        )
    }

    pub fn is_specified(&self) -> bool {
        self.col_dist.is_specified() && self.row_dist.is_specified()
    }

    /// Directly assignable without communication.
    pub fn is_compatible(&self, other: &Scheme) -> bool {
        self == other
    }

    pub fn same_tags(&self, other: &Scheme) -> bool {
        self.col_dist == other.col_dist && self.row_dist == other.row_dist
    }

    pub fn validate(&self, grid: &ProcessGrid) -> Result<()> {
        let (col_r, col_c) = self.col_dist.claims(Axis::Col);
        let (row_r, row_c) = self.row_dist.claims(Axis::Row);

        if (col_r && row_r) || (col_c && row_c) {
            bail!(DistError::InvalidScheme(*self));
        }

        for &(tag, axis, align) in &[
            (self.col_dist, Axis::Col, self.col_align),
            (self.row_dist, Axis::Row, self.row_align),
        ] {
            let extent = tag.extent(axis, grid);
            if align >= extent {
                bail!(DistError::InvalidAlignment { align, extent });
            }
        }

        Ok(())
    }

    pub fn col_layout(&self, grid: &ProcessGrid) -> AxisLayout {
        axis_layout(self.col_dist, self.col_align, Axis::Col, grid, grid.row(), grid.col())
    }

    pub fn row_layout(&self, grid: &ProcessGrid) -> AxisLayout {
        axis_layout(self.row_dist, self.row_align, Axis::Row, grid, grid.row(), grid.col())
    }

    /// Layouts as seen by an arbitrary world rank.
    pub fn layout_for(&self, grid: &ProcessGrid, rank: usize) -> (AxisLayout, AxisLayout) {
        let (row, col) = grid.coordinate(rank);
        (
            axis_layout(self.col_dist, self.col_align, Axis::Col, grid, row, col),
            axis_layout(self.row_dist, self.row_align, Axis::Row, grid, row, col),
        )
    }

    /// Local fragment shape on the calling process. A process outside either
    /// axis (off the single owner, off the diagonal path) holds nothing, so
    /// its fragment is `0 x 0` on both axes at once.
    pub fn local_shape(&self, grid: &ProcessGrid, height: u64, width: u64) -> (u64, u64) {
        let (col, row) = (self.col_layout(grid), self.row_layout(grid));
        if !col.participates || !row.participates {
            return (0, 0);
        }
        (col.local_length(height), row.local_length(width))
    }

    /// Grid coordinates pinned by ownership of element `(i, j)`. A dimension
    /// left `None` is unclaimed: any coordinate along it owns a replica.
    pub fn owner_coords(
        &self,
        grid: &ProcessGrid,
        i: u64,
        j: u64,
    ) -> (Option<usize>, Option<usize>) {
        let a = pin(self.col_dist, self.col_align, Axis::Col, grid, i);
        let b = pin(self.row_dist, self.row_align, Axis::Row, grid, j);
        debug_assert!(a.0.is_none() || b.0.is_none());
        debug_assert!(a.1.is_none() || b.1.is_none());
        (a.0.or(b.0), a.1.or(b.1))
    }

    /// Canonical owning world rank of element `(i, j)`: unclaimed dimensions
    /// resolve to coordinate 0. Identical on every calling process.
    pub fn owner_rank(&self, grid: &ProcessGrid, i: u64, j: u64) -> usize {
        let (row, col) = self.owner_coords(grid, i, j);
        grid.rank_of(row.unwrap_or(0), col.unwrap_or(0))
    }
}

impl Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{:?}({}), {:?}({})]",
            self.col_dist, self.col_align, self.row_dist, self.row_align
        )
    }
}

pub(crate) fn axis_layout(
    tag: AxisDist,
    align: u64,
    axis: Axis,
    grid: &ProcessGrid,
    row: usize,
    col: usize,
) -> AxisLayout {
    use AxisDist::*;
    let (r, c) = (grid.height() as u64, grid.width() as u64);
    let (row, col) = (row as u64, col as u64);

    let (stride, coord) = match tag {
        RowCyclic => (r, row),
        ColCyclic => (c, col),
        RowMajorLinear => (r * c, row * c + col),
        ColMajorLinear => (r * c, col * r + row),
        Replicated => (1, 0),
        SingleOwner => {
            let coord = match axis {
                Axis::Col => row,
                Axis::Row => col,
            };
            return if coord == align {
                AxisLayout {
                    stride: 1,
                    shift: 0,
                    participates: true,
                }
            } else {
                AxisLayout::empty()
            };
        }
        Diagonal => {
            return match grid.diag_position(row as usize, col as usize, align) {
                Some(position) => AxisLayout {
                    stride: alg::lcm(r, c),
                    shift: position,
                    participates: true,
                },
                None => AxisLayout::empty(),
            };
        }
        Unspecified => return AxisLayout::empty(),
    };

    AxisLayout {
        stride,
        shift: alg::shift(coord, align % stride, stride),
        participates: true,
    }
}

/// Grid coordinates `(row, col)` forced by ownership of one axis index.
fn pin(
    tag: AxisDist,
    align: u64,
    axis: Axis,
    grid: &ProcessGrid,
    index: u64,
) -> (Option<usize>, Option<usize>) {
    use AxisDist::*;
    let (r, c) = (grid.height() as u64, grid.width() as u64);

    match tag {
        RowCyclic => (Some(alg::owner(index, align, r) as usize), None),
        ColCyclic => (None, Some(alg::owner(index, align, c) as usize)),
        ColMajorLinear => {
            let lin = alg::owner(index, align, r * c);
            (Some((lin % r) as usize), Some((lin / r) as usize))
        }
        RowMajorLinear => {
            let lin = alg::owner(index, align, r * c);
            (Some((lin / c) as usize), Some((lin % c) as usize))
        }
        Replicated | Unspecified => (None, None),
        SingleOwner => match axis {
            Axis::Col => (Some(align as usize), None),
            Axis::Row => (None, Some(align as usize)),
        },
        Diagonal => {
            let position = alg::owner(index, 0, alg::lcm(r, c));
            (
                Some((position % r) as usize),
                Some(((align + position) % c) as usize),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::LocalCluster;
    use std::sync::Arc;

    fn on_grid<F>(n: usize, height: usize, body: F)
    where
        F: Fn(&ProcessGrid) + Send + Sync,
    {
        LocalCluster::run(n, |comm| {
            let grid = ProcessGrid::new(Arc::new(comm), height).unwrap();
            body(&grid);
        });
    }

    #[test]
    fn test_standard_ownership_2x2() {
        // 5x5 matrix on a 2x2 grid: process (0, 0) owns rows {0, 2, 4} and
        // columns {0, 2, 4}.
        on_grid(4, 2, |grid| {
            let scheme = Scheme::standard();
            scheme.validate(grid).unwrap();

            let (lh, lw) = scheme.local_shape(grid, 5, 5);
            if grid.row() == 0 && grid.col() == 0 {
                assert_eq!((lh, lw), (3, 3));
                assert_eq!(scheme.col_layout(grid).owned(5), vec![0, 2, 4]);
                assert_eq!(scheme.row_layout(grid).owned(5), vec![0, 2, 4]);
            } else if grid.row() == 1 && grid.col() == 1 {
                assert_eq!((lh, lw), (2, 2));
                assert_eq!(scheme.col_layout(grid).owned(5), vec![1, 3]);
            }
        });
    }

    #[test]
    fn test_local_shape_conservation() {
        use AxisDist::*;

        on_grid(6, 2, |grid| {
            let schemes = [
                Scheme::standard(),
                Scheme::with_aligns(RowCyclic, ColCyclic, 1, 2),
                Scheme::new(ColCyclic, RowCyclic),
                Scheme::new(ColMajorLinear, Replicated),
                Scheme::new(RowMajorLinear, Replicated),
                Scheme::new(Replicated, ColMajorLinear),
                Scheme::rooted(1, 2),
                Scheme::new(Diagonal, Replicated),
            ];

            for scheme in &schemes {
                scheme.validate(grid).unwrap();

                for &(height, width) in &[(7u64, 5u64), (1, 13), (0, 4), (12, 12)] {
                    let col_total: u64 = (0..grid.size())
                        .map(|rank| scheme.layout_for(grid, rank).0.local_length(height))
                        .sum::<u64>();
                    // Each grid dimension unclaimed by the column axis
                    // replicates the count once per coordinate.
                    let (claims_r, claims_c) = scheme.col_dist.claims(Axis::Col);
                    let mut replicas = 1;
                    if !claims_r {
                        replicas *= grid.height() as u64;
                    }
                    if !claims_c {
                        replicas *= grid.width() as u64;
                    }
                    assert_eq!(col_total, height * replicas, "scheme {}", scheme);
                }
            }
        });
    }

    #[test]
    fn test_ownership_total_and_exclusive() {
        use AxisDist::*;

        on_grid(6, 3, |grid| {
            let schemes = [
                Scheme::standard(),
                Scheme::with_aligns(RowCyclic, ColCyclic, 2, 1),
                Scheme::new(ColMajorLinear, Replicated),
                Scheme::new(RowMajorLinear, Replicated),
                Scheme::rooted(2, 0),
                Scheme::new(Diagonal, Replicated),
            ];

            for scheme in &schemes {
                for i in 0..7u64 {
                    for j in 0..5u64 {
                        let owners = (0..grid.size())
                            .filter(|&rank| {
                                let (col, row) = scheme.layout_for(grid, rank);
                                col.owns(i) && row.owns(j)
                            })
                            .count();

                        let (pin_r, pin_c) = scheme.owner_coords(grid, i, j);
                        let mut expected = 1;
                        if pin_r.is_none() {
                            expected *= grid.height();
                        }
                        if pin_c.is_none() {
                            expected *= grid.width();
                        }
                        assert_eq!(owners, expected, "scheme {} at ({}, {})", scheme, i, j);

                        // The canonical owner really owns the element.
                        let rank = scheme.owner_rank(grid, i, j);
                        let (col, row) = scheme.layout_for(grid, rank);
                        assert!(col.owns(i) && row.owns(j));
                    }
                }
            }
        });
    }

    #[test]
    fn test_single_owner_shape_is_empty_off_owner() {
        on_grid(6, 2, |grid| {
            let scheme = Scheme::rooted(0, 1);

            // Sharing the owner's grid row (or column) is not enough; only
            // the owner itself holds a fragment.
            let expected = if grid.row() == 0 && grid.col() == 1 {
                (5, 3)
            } else {
                (0, 0)
            };
            assert_eq!(scheme.local_shape(grid, 5, 3), expected);
        });
    }

    #[test]
    fn test_invalid_scheme() {
        on_grid(4, 2, |grid| {
            let bad = Scheme::new(AxisDist::RowCyclic, AxisDist::RowMajorLinear);
            let err = bad.validate(grid).unwrap_err();
            assert!(matches!(
                err.downcast_ref::<DistError>(),
                Some(DistError::InvalidScheme(_))
            ));

            let misaligned = Scheme::with_aligns(AxisDist::RowCyclic, AxisDist::ColCyclic, 2, 0);
            assert!(misaligned.validate(grid).is_err());
        });
    }

    #[test]
    fn test_shift_owner_round_trip() {
        on_grid(6, 2, |grid| {
            let scheme = Scheme::with_aligns(AxisDist::RowCyclic, AxisDist::ColCyclic, 1, 1);
            let col = scheme.col_layout(grid);

            for i in 0..20u64 {
                let owns = alg::owner(i, 1, grid.height() as u64) == grid.row() as u64;
                assert_eq!(col.owns(i), owns);
                if owns {
                    let iloc = col.local_index(i).unwrap();
                    assert_eq!(col.global_index(iloc), i);
                }
            }
        });
    }
}
