//! Logical 2D arrangement of the process group.
//!
//! A [`ProcessGrid`] folds the world group into `height x width` coordinates
//! using column-major rank order (`rank = col * height + row`). The grid is
//! immutable for the lifetime of every matrix built on it; matrices check
//! grid identity by comparing the `Arc` they were constructed with.

use std::fmt::{self, Display};
use std::sync::Arc;

use crate::comm::{Communicator, Group};
use crate::prelude::*;
use gridmat_core::algebra::{crt2, gcd, lcm};

pub struct ProcessGrid {
    comm: Arc<dyn Communicator>,
    height: usize,
    width: usize,
    row: usize,
    col: usize,
}

impl ProcessGrid {
    /// Folds the communicator's world group into a grid.
    ///
    /// A `requested_height` of 0 picks the largest divisor of the group size
    /// not exceeding its square root; any other value must divide the group
    /// size exactly.
    pub fn new(comm: Arc<dyn Communicator>, requested_height: usize) -> Result<Self> {
        let size = comm.size();
        let height = if requested_height == 0 {
            find_factor(size)
        } else {
            requested_height
        };

        if height == 0 || size % height != 0 {
            bail!(DistError::InvalidGridShape {
                size,
                height: requested_height,
            });
        }

        let rank = comm.rank();
        let grid = Self {
            comm,
            height,
            width: size / height,
            row: rank % height,
            col: rank / height,
        };

        debug!(
            "created {} grid, local coordinate ({}, {})",
            grid, grid.row, grid.col
        );
        Ok(grid)
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn size(&self) -> usize {
        self.height * self.width
    }

    /// World rank of the calling process.
    pub fn rank(&self) -> usize {
        self.comm.rank()
    }

    /// Grid row of the calling process.
    pub fn row(&self) -> usize {
        self.row
    }

    /// Grid column of the calling process.
    pub fn col(&self) -> usize {
        self.col
    }

    pub fn comm(&self) -> &dyn Communicator {
        &*self.comm
    }

    pub fn coordinate(&self, rank: usize) -> (usize, usize) {
        debug_assert!(rank < self.size());
        (rank % self.height, rank / self.height)
    }

    pub fn rank_of(&self, row: usize, col: usize) -> usize {
        debug_assert!(row < self.height && col < self.width);
        col * self.height + row
    }

    pub fn world_group(&self) -> Group {
        Group::new((0..self.size()).collect())
    }

    /// All processes in the given grid row, ordered by column.
    pub fn row_group(&self, row: usize) -> Group {
        Group::new((0..self.width).map(|c| self.rank_of(row, c)).collect())
    }

    /// All processes in the given grid column, ordered by row.
    pub fn col_group(&self, col: usize) -> Group {
        Group::new((0..self.height).map(|r| self.rank_of(r, col)).collect())
    }

    /// The processes on the generalized diagonal path with the given offset,
    /// ordered by path position.
    ///
    /// Path position `i` lives at coordinate `(i mod height,
    /// (offset + i) mod width)`; the path closes after `lcm(height, width)`
    /// steps, visiting that many processes, each exactly once. A process
    /// `(s, t)` lies on the path iff `t - s = offset (mod gcd(height, width))`.
    pub fn diag_group(&self, offset: u64) -> Group {
        let period = lcm(self.height as u64, self.width as u64);
        let ranks = (0..period)
            .map(|i| {
                self.rank_of(
                    (i % self.height as u64) as usize,
                    ((offset + i) % self.width as u64) as usize,
                )
            })
            .collect();
        Group::new(ranks)
    }

    /// Whether the process at `(row, col)` lies on the diagonal path.
    pub fn on_diag(&self, row: usize, col: usize, offset: u64) -> bool {
        let g = gcd(self.height as u64, self.width as u64);
        let (row, col) = (row as u64, col as u64);
        (col + g * self.height as u64 - row) % g == offset % g
    }

    /// Path position of the process at `(row, col)`, or `None` if it is not
    /// on the diagonal path. Solved with the extended Euclidean relation
    /// between the two grid extents.
    pub fn diag_position(&self, row: usize, col: usize, offset: u64) -> Option<u64> {
        let (r, c) = (self.height as u64, self.width as u64);
        let col_residue = (col as u64 + c - offset % c) % c;
        crt2(row as u64, r, col_residue, c)
    }
}

impl Display for ProcessGrid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{} process grid", self.height, self.width)
    }
}

impl fmt::Debug for ProcessGrid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessGrid")
            .field("height", &self.height)
            .field("width", &self.width)
            .field("rank", &self.rank())
            .finish()
    }
}

/// Largest divisor of `n` not exceeding `sqrt(n)`.
fn find_factor(n: usize) -> usize {
    let mut factor = 1;
    let mut d = 1;
    while d * d <= n {
        if n % d == 0 {
            factor = d;
        }
        d += 1;
    }
    factor
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::LocalCluster;

    #[test]
    fn test_find_factor() {
        assert_eq!(find_factor(1), 1);
        assert_eq!(find_factor(4), 2);
        assert_eq!(find_factor(6), 2);
        assert_eq!(find_factor(12), 3);
        assert_eq!(find_factor(16), 4);
        assert_eq!(find_factor(7), 1);
    }

    #[test]
    fn test_coordinates_column_major() {
        LocalCluster::run(6, |comm| {
            let grid = ProcessGrid::new(Arc::new(comm), 2).unwrap();
            assert_eq!(grid.width(), 3);

            let rank = grid.rank();
            assert_eq!(grid.coordinate(rank), (grid.row(), grid.col()));
            assert_eq!(grid.rank_of(grid.row(), grid.col()), rank);

            // Ranks fill columns first.
            assert_eq!(grid.coordinate(1), (1, 0));
            assert_eq!(grid.coordinate(2), (0, 1));
        });
    }

    #[test]
    fn test_invalid_height() {
        LocalCluster::run(4, |comm| {
            let err = ProcessGrid::new(Arc::new(comm), 3).unwrap_err();
            assert_eq!(
                err.downcast_ref::<DistError>(),
                Some(&DistError::InvalidGridShape { size: 4, height: 3 })
            );
        });
    }

    #[test]
    fn test_groups() {
        LocalCluster::run(6, |comm| {
            let grid = ProcessGrid::new(Arc::new(comm), 2).unwrap();

            assert_eq!(grid.row_group(0).ranks(), &[0, 2, 4]);
            assert_eq!(grid.row_group(1).ranks(), &[1, 3, 5]);
            assert_eq!(grid.col_group(2).ranks(), &[4, 5]);
            assert_eq!(grid.world_group().size(), 6);
        });
    }

    #[test]
    fn test_diag_path() {
        LocalCluster::run(6, |comm| {
            let grid = ProcessGrid::new(Arc::new(comm), 2).unwrap();
            // 2x3 grid: the path has period lcm(2, 3) = 6 and visits every
            // process once.
            let diag = grid.diag_group(0);
            assert_eq!(diag.size(), 6);

            for position in 0..6u64 {
                let rank = diag.ranks()[position as usize];
                let (row, col) = grid.coordinate(rank);
                assert!(grid.on_diag(row, col, 0));
                assert_eq!(grid.diag_position(row, col, 0), Some(position));
            }
        });
    }

    #[test]
    fn test_diag_membership_square() {
        LocalCluster::run(4, |comm| {
            let grid = ProcessGrid::new(Arc::new(comm), 2).unwrap();
            // 2x2 grid: only the two processes with row == col are on the
            // offset-0 path.
            let diag = grid.diag_group(0);
            assert_eq!(diag.size(), 2);
            assert!(grid.on_diag(0, 0, 0));
            assert!(grid.on_diag(1, 1, 0));
            assert!(!grid.on_diag(0, 1, 0));
            assert_eq!(grid.diag_position(1, 1, 0), Some(1));

            let off = grid.diag_group(1);
            assert!(grid.on_diag(0, 1, 1));
            assert_eq!(off.ranks().len(), 2);
        });
    }
}
