//! The distributed matrix: global shape, scheme, grid and local fragment.
//!
//! A [`DistMatrix`] either owns its [`LocalBuffer`] or is a view into
//! another matrix's buffer. Views never allocate; they carry a local origin
//! plus the generation of the parent's buffer at creation time, so a view
//! that outlives a reallocating resize is reported as stale instead of
//! reading through dangling coordinates.
//!
//! `get`/`set` with global indices are collective: every process of the grid
//! must call them together in the same program order, or the group hangs.

use std::sync::Arc;

use crate::buffer::{Element, LocalBuffer};
use crate::dist::{Axis, AxisDist, AxisLayout, Scheme};
use crate::grid::ProcessGrid;
use crate::prelude::*;
use crate::redist;

#[derive(Debug, Copy, Clone)]
enum Attach {
    Owner,
    View {
        /// Local origin of the view inside the parent's buffer.
        row0: u64,
        col0: u64,
        /// Parent buffer generation at creation.
        generation: u64,
        locked: bool,
    },
}

pub struct DistMatrix<T: Element> {
    grid: Arc<ProcessGrid>,
    scheme: Scheme,
    height: u64,
    width: u64,
    store: Arc<Mutex<LocalBuffer<T>>>,
    attach: Attach,
}

impl<T: Element> DistMatrix<T> {
    /// Allocates a `height x width` matrix under the given scheme.
    pub fn new(grid: Arc<ProcessGrid>, scheme: Scheme, height: u64, width: u64) -> Result<Self> {
        scheme.validate(&grid)?;

        let (lh, lw) = scheme.local_shape(&grid, height, width);
        let store = Arc::new(Mutex::new(LocalBuffer::new(lh as usize, lw as usize)));

        Ok(Self {
            grid,
            scheme,
            height,
            width,
            store,
            attach: Attach::Owner,
        })
    }

    /// An empty matrix whose alignments can still be adjusted.
    pub fn empty(grid: Arc<ProcessGrid>, scheme: Scheme) -> Result<Self> {
        Self::new(grid, scheme, 0, 0)
    }

    pub fn height(&self) -> u64 {
        self.height
    }

    pub fn width(&self) -> u64 {
        self.width
    }

    pub fn scheme(&self) -> &Scheme {
        &self.scheme
    }

    pub fn grid(&self) -> &Arc<ProcessGrid> {
        &self.grid
    }

    pub fn is_view(&self) -> bool {
        matches!(self.attach, Attach::View { .. })
    }

    pub fn is_locked(&self) -> bool {
        matches!(self.attach, Attach::View { locked: true, .. })
    }

    pub fn col_layout(&self) -> AxisLayout {
        self.scheme.col_layout(&self.grid)
    }

    pub fn row_layout(&self) -> AxisLayout {
        self.scheme.row_layout(&self.grid)
    }

    /// Smallest global row index owned by this process.
    pub fn col_shift(&self) -> u64 {
        self.col_layout().shift
    }

    pub fn row_shift(&self) -> u64 {
        self.row_layout().shift
    }

    pub fn local_height(&self) -> u64 {
        self.scheme.local_shape(&self.grid, self.height, self.width).0
    }

    pub fn local_width(&self) -> u64 {
        self.scheme.local_shape(&self.grid, self.height, self.width).1
    }

    /// Whether this process holds element `(i, j)`.
    pub fn owns(&self, i: u64, j: u64) -> bool {
        self.col_layout().owns(i) && self.row_layout().owns(j)
    }

    fn local_origin(&self) -> (u64, u64) {
        match self.attach {
            Attach::Owner => (0, 0),
            Attach::View { row0, col0, .. } => (row0, col0),
        }
    }

    fn check_fresh(&self) -> Result<()> {
        if let Attach::View { generation, .. } = self.attach {
            if self.store.lock().generation() != generation {
                bail!(DistError::StaleView);
            }
        }
        Ok(())
    }

    fn check_writable(&self) -> Result<()> {
        if self.is_locked() {
            bail!(DistError::LockedView);
        }
        self.check_fresh()
    }

    /// Local read; no communication. Panics on a stale view.
    pub fn get_local(&self, iloc: u64, jloc: u64) -> T {
        self.check_fresh().expect("stale view");
        let (row0, col0) = self.local_origin();
        self.store
            .lock()
            .get((row0 + iloc) as usize, (col0 + jloc) as usize)
    }

    /// Local write; no communication. Panics on a stale or locked view.
    pub fn set_local(&mut self, iloc: u64, jloc: u64, value: T) {
        self.check_writable().expect("stale or locked view");
        let (row0, col0) = self.local_origin();
        self.store
            .lock()
            .set((row0 + iloc) as usize, (col0 + jloc) as usize, value);
    }

    /// Fills the local fragment from a closure over global indices.
    pub fn fill_with<F>(&mut self, f: F) -> Result<()>
    where
        F: Fn(u64, u64) -> T,
    {
        self.check_writable()?;
        let (col, row) = (self.col_layout(), self.row_layout());
        let (row0, col0) = self.local_origin();
        let mut store = self.store.lock();

        for jloc in 0..row.local_length(self.width) {
            for iloc in 0..col.local_length(self.height) {
                let value = f(col.global_index(iloc), row.global_index(jloc));
                store.set((row0 + iloc) as usize, (col0 + jloc) as usize, value);
            }
        }

        Ok(())
    }

    /// The local fragment, packed column-major without the leading-dimension
    /// padding. This is the hand-off point for local dense kernels.
    pub fn local_copy(&self) -> Vec<T> {
        let rows = self.owned_rows();
        let cols = self.owned_cols();
        self.read_values(&rows, &cols)
    }

    /// Global read. Collective: every grid process must call it with the
    /// same indices; the owner broadcasts the value. Purely local when the
    /// matrix is fully replicated.
    pub fn get(&self, i: u64, j: u64) -> Result<T> {
        debug_assert!(i < self.height && j < self.width);
        self.check_fresh()?;

        if self.scheme.col_dist == AxisDist::Replicated
            && self.scheme.row_dist == AxisDist::Replicated
        {
            let col = self.col_layout().local_index(i).unwrap();
            let row = self.row_layout().local_index(j).unwrap();
            return Ok(self.get_local(col, row));
        }

        let owner = self.scheme.owner_rank(&self.grid, i, j);
        let mut payload = if self.grid.rank() == owner {
            let iloc = self.col_layout().local_index(i).unwrap();
            let jloc = self.row_layout().local_index(j).unwrap();
            bytemuck::bytes_of(&self.get_local(iloc, jloc)).to_vec()
        } else {
            vec![]
        };

        self.grid
            .comm()
            .broadcast(&self.grid.world_group(), owner, &mut payload)?;

        let values: Vec<T> = bytemuck::pod_collect_to_vec(&payload);
        Ok(values[0])
    }

    /// Global write: every owning process stores the value, everyone else is
    /// a no-op. Call it from all processes with identical arguments.
    pub fn set(&mut self, i: u64, j: u64, value: T) -> Result<()> {
        debug_assert!(i < self.height && j < self.width);
        self.check_writable()?;

        let col = self.col_layout().local_index(i);
        let row = self.row_layout().local_index(j);
        if let (Some(iloc), Some(jloc)) = (col, row) {
            self.set_local(iloc, jloc, value);
        }

        Ok(())
    }

    /// Changes the global shape, reallocating the fragment when the local
    /// shape changes. Contents are unspecified afterwards. Fails on views.
    pub fn resize(&mut self, height: u64, width: u64) -> Result<()> {
        if self.is_view() {
            bail!(DistError::ReadOnlyResize);
        }

        self.height = height;
        self.width = width;
        let (lh, lw) = self.scheme.local_shape(&self.grid, height, width);
        self.store.lock().resize(lh as usize, lw as usize);

        Ok(())
    }

    /// Adopts the alignments of `other` without moving data. Only legal
    /// while this matrix is still `0 x 0`.
    pub fn align_with(&mut self, other: &DistMatrix<T>) -> Result<()> {
        if self.height != 0 || self.width != 0 {
            bail!(DistError::AlignmentAfterAllocation);
        }

        let col_extent = self.scheme.col_dist.extent(Axis::Col, &self.grid);
        let row_extent = self.scheme.row_dist.extent(Axis::Row, &self.grid);
        self.scheme.col_align = other.scheme.col_align % col_extent;
        self.scheme.row_align = other.scheme.row_align % row_extent;

        Ok(())
    }

    /// A read-only view of the `rows x cols` sub-matrix at `(i, j)`.
    pub fn view(&self, i: u64, j: u64, rows: u64, cols: u64) -> Result<DistMatrix<T>> {
        self.make_view(i, j, rows, cols, true)
    }

    /// A writable view. Writes land in the parent's buffer.
    pub fn view_mut(&mut self, i: u64, j: u64, rows: u64, cols: u64) -> Result<DistMatrix<T>> {
        self.make_view(i, j, rows, cols, false)
    }

    fn make_view(&self, i: u64, j: u64, rows: u64, cols: u64, locked: bool) -> Result<DistMatrix<T>> {
        self.check_fresh()?;

        if i + rows > self.height || j + cols > self.width {
            bail!(DistError::ViewOutOfBounds {
                i,
                j,
                rows,
                cols,
                height: self.height,
                width: self.width,
            });
        }
        if self.scheme.col_dist == AxisDist::Diagonal || self.scheme.row_dist == AxisDist::Diagonal
        {
            bail!("views of diagonal distributions are not supported");
        }

        let col_extent = self.scheme.col_dist.extent(Axis::Col, &self.grid);
        let row_extent = self.scheme.row_dist.extent(Axis::Row, &self.grid);
        let scheme = Scheme::with_aligns(
            self.scheme.col_dist,
            self.scheme.row_dist,
            self.scheme
                .col_dist
                .align_of_subrange(self.scheme.col_align, i, col_extent),
            self.scheme
                .row_dist
                .align_of_subrange(self.scheme.row_align, j, row_extent),
        );

        // Number of locally owned indices below the view origin, relative to
        // this matrix, plus whatever origin this matrix already has.
        let (row0, col0) = self.local_origin();
        let row0 = row0 + self.col_layout().local_length(i);
        let col0 = col0 + self.row_layout().local_length(j);

        Ok(DistMatrix {
            grid: Arc::clone(&self.grid),
            scheme,
            height: rows,
            width: cols,
            store: Arc::clone(&self.store),
            attach: Attach::View {
                row0,
                col0,
                generation: self.store.lock().generation(),
                locked: locked || self.is_locked(),
            },
        })
    }

    /// `self := src`, redistributing between schemes when they differ.
    ///
    /// Collective whenever communication is required. Fails with
    /// `GridMismatch` when the operands were built on different grids.
    pub fn assign_from(&mut self, src: &DistMatrix<T>) -> Result<()> {
        if !Arc::ptr_eq(&self.grid, &src.grid) {
            bail!(DistError::GridMismatch);
        }
        self.check_writable()?;
        src.check_fresh()?;

        if self.height != src.height || self.width != src.width {
            self.resize(src.height, src.width)?;
        }

        redist::execute(self, src)
    }

    /// A fresh matrix holding the same contents under another scheme.
    pub fn redistributed(&self, scheme: Scheme) -> Result<DistMatrix<T>> {
        let mut out = DistMatrix::new(Arc::clone(&self.grid), scheme, self.height, self.width)?;
        out.assign_from(self)?;
        Ok(out)
    }

    pub(crate) fn owned_rows(&self) -> Vec<u64> {
        self.col_layout().owned(self.height)
    }

    pub(crate) fn owned_cols(&self) -> Vec<u64> {
        self.row_layout().owned(self.width)
    }

    /// Values at the given owned global indices, column-major over
    /// `cols x rows`.
    pub(crate) fn read_values(&self, rows: &[u64], cols: &[u64]) -> Vec<T> {
        let (col, row) = (self.col_layout(), self.row_layout());
        let (row0, col0) = self.local_origin();
        let store = self.store.lock();

        let mut values = Vec::with_capacity(rows.len() * cols.len());
        for &j in cols {
            let jloc = row.local_index(j).expect("column not owned locally");
            for &i in rows {
                let iloc = col.local_index(i).expect("row not owned locally");
                values.push(store.get((row0 + iloc) as usize, (col0 + jloc) as usize));
            }
        }

        values
    }

    /// Stores values produced by [`read_values`] ordering at the given owned
    /// global indices.
    pub(crate) fn write_values(&mut self, rows: &[u64], cols: &[u64], values: &[T]) {
        debug_assert_eq!(values.len(), rows.len() * cols.len());
        let (col, row) = (self.col_layout(), self.row_layout());
        let (row0, col0) = self.local_origin();
        let mut store = self.store.lock();

        let mut next = values.iter();
        for &j in cols {
            let jloc = row.local_index(j).expect("column not owned locally");
            for &i in rows {
                let iloc = col.local_index(i).expect("row not owned locally");
                store.set(
                    (row0 + iloc) as usize,
                    (col0 + jloc) as usize,
                    *next.next().unwrap(),
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::LocalCluster;

    fn standard_4x4(grid: &Arc<ProcessGrid>) -> DistMatrix<f64> {
        let mut a = DistMatrix::new(Arc::clone(grid), Scheme::standard(), 4, 4).unwrap();
        a.fill_with(|i, j| (i * 10 + j) as f64).unwrap();
        a
    }

    #[test]
    fn test_local_shapes() {
        LocalCluster::run(4, |comm| {
            let grid = Arc::new(ProcessGrid::new(Arc::new(comm), 2).unwrap());
            let a = DistMatrix::<f64>::new(Arc::clone(&grid), Scheme::standard(), 5, 5).unwrap();

            let expected_h = if grid.row() == 0 { 3 } else { 2 };
            let expected_w = if grid.col() == 0 { 3 } else { 2 };
            assert_eq!(a.local_height(), expected_h);
            assert_eq!(a.local_width(), expected_w);
        });
    }

    #[test]
    fn test_single_owner_allocates_nothing_elsewhere() {
        LocalCluster::run(4, |comm| {
            let grid = Arc::new(ProcessGrid::new(Arc::new(comm), 2).unwrap());
            let a = DistMatrix::<f64>::new(Arc::clone(&grid), Scheme::rooted(0, 1), 5, 3).unwrap();

            let expected = if grid.row() == 0 && grid.col() == 1 {
                (5, 3)
            } else {
                (0, 0)
            };
            assert_eq!((a.local_height(), a.local_width()), expected);
        });
    }

    #[test]
    fn test_fill_and_local_access() {
        LocalCluster::run(4, |comm| {
            let grid = Arc::new(ProcessGrid::new(Arc::new(comm), 2).unwrap());
            let a = standard_4x4(&grid);

            let col = a.col_layout();
            let row = a.row_layout();
            for iloc in 0..a.local_height() {
                for jloc in 0..a.local_width() {
                    let (i, j) = (col.global_index(iloc), row.global_index(jloc));
                    assert_eq!(a.get_local(iloc, jloc), (i * 10 + j) as f64);
                }
            }
        });
    }

    #[test]
    fn test_collective_get() {
        LocalCluster::run(4, |comm| {
            let grid = Arc::new(ProcessGrid::new(Arc::new(comm), 2).unwrap());
            let a = standard_4x4(&grid);

            for i in 0..4 {
                for j in 0..4 {
                    assert_eq!(a.get(i, j).unwrap(), (i * 10 + j) as f64);
                }
            }
        });
    }

    #[test]
    fn test_align_after_allocation_fails() {
        LocalCluster::run(4, |comm| {
            let grid = Arc::new(ProcessGrid::new(Arc::new(comm), 2).unwrap());
            let a = standard_4x4(&grid);

            let mut b = DistMatrix::<f64>::empty(Arc::clone(&grid), Scheme::standard()).unwrap();
            b.align_with(&a).unwrap();

            b.resize(3, 3).unwrap();
            let err = b.align_with(&a).unwrap_err();
            assert_eq!(
                err.downcast_ref::<DistError>(),
                Some(&DistError::AlignmentAfterAllocation)
            );
        });
    }

    #[test]
    fn test_view_follows_parent() {
        LocalCluster::run(4, |comm| {
            let grid = Arc::new(ProcessGrid::new(Arc::new(comm), 2).unwrap());
            let a = standard_4x4(&grid);

            let v = a.view(1, 1, 3, 3).unwrap();
            assert!(v.is_view() && v.is_locked());
            assert_eq!(v.scheme().col_align, 1);

            let col = v.col_layout();
            let row = v.row_layout();
            for iloc in 0..v.local_height() {
                for jloc in 0..v.local_width() {
                    let (i, j) = (col.global_index(iloc) + 1, row.global_index(jloc) + 1);
                    assert_eq!(v.get_local(iloc, jloc), (i * 10 + j) as f64);
                }
            }

            let err = v.view(0, 0, 1, 1).map(|_| ()).err();
            assert!(err.is_none());
        });
    }

    #[test]
    fn test_view_resize_rules() {
        LocalCluster::run(4, |comm| {
            let grid = Arc::new(ProcessGrid::new(Arc::new(comm), 2).unwrap());
            let mut a = standard_4x4(&grid);

            let mut v = a.view_mut(0, 0, 2, 2).unwrap();
            let err = v.resize(3, 3).unwrap_err();
            assert_eq!(
                err.downcast_ref::<DistError>(),
                Some(&DistError::ReadOnlyResize)
            );

            // Writes through a mutable view land in the parent.
            if v.local_height() > 0 && v.local_width() > 0 {
                v.set_local(0, 0, -1.0);
                assert_eq!(a.get_local(0, 0), -1.0);
            }
        });
    }

    #[test]
    fn test_stale_view_detected() {
        LocalCluster::run(4, |comm| {
            let grid = Arc::new(ProcessGrid::new(Arc::new(comm), 2).unwrap());
            let mut a = standard_4x4(&grid);

            let v = a.view(0, 0, 4, 4).unwrap();
            a.resize(8, 8).unwrap();

            let err = v.get(0, 0).unwrap_err();
            assert_eq!(err.downcast_ref::<DistError>(), Some(&DistError::StaleView));
        });
    }
}
