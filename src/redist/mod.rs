//! Redistribution: moving a matrix between distribution schemes.
//!
//! [`resolve`] is the pure classifier (the alignment resolver): given a
//! source and target scheme on one grid it picks the cheapest protocol from
//! a fixed table, before any message is sent. [`engine`] then executes the
//! chosen protocol through the grid's sub-communicators.
//!
//! The table is keyed by runtime tags rather than generated per combination;
//! every entry is at most one collective phase (the general transpose runs
//! as a single all-to-all over the full grid communicator).

mod engine;

pub(crate) use self::engine::execute;

use crate::dist::{AxisDist, Scheme};
use crate::grid::ProcessGrid;
use crate::prelude::*;

/// Communication pattern selected for a scheme pair.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Protocol {
    /// Every target element is already present locally; no communication.
    LocalTrim,
    /// All-gather within each grid row.
    RowwiseAllGather,
    /// All-gather within each grid column.
    ColwiseAllGather,
    /// Fan-in of every fragment to one fixed process.
    GatherToOwner,
    /// Fan-out from one fixed process to the target owners.
    ScatterFromOwner,
    /// All-gather over the full grid communicator.
    FullAllGather,
    /// General exchange: one all-to-all over the full grid communicator.
    AllToAll,
}

/// Outcome of classifying a `(source, target)` scheme pair.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Compatibility {
    /// Identical schemes: plain local copy.
    Direct,
    /// Identical tags, shifted alignment.
    RealignOnly,
    Communicate(Protocol),
}

impl Compatibility {
    /// Number of communication phases the protocol needs.
    pub fn phases(&self) -> usize {
        match self {
            Compatibility::Direct | Compatibility::Communicate(Protocol::LocalTrim) => 0,
            _ => 1,
        }
    }
}

/// Classifies the scheme pair without communicating.
///
/// Fails with `UnroutableRedistribution` when either scheme still carries an
/// unspecified axis; every fully specified pair is routable, in the worst
/// case through the all-to-all fallback.
pub fn resolve(src: &Scheme, dst: &Scheme, grid: &ProcessGrid) -> Result<Compatibility> {
    use AxisDist::*;

    if !src.is_specified() || !dst.is_specified() {
        bail!(DistError::UnroutableRedistribution {
            src: *src,
            dst: *dst,
        });
    }

    if src.is_compatible(dst) {
        return Ok(Compatibility::Direct);
    }

    if src.same_tags(dst) {
        // A diagonal path changes its member set with the offset, so an
        // alignment change there is not a circular shift.
        if src.col_dist != Diagonal && src.row_dist != Diagonal {
            return Ok(Compatibility::RealignOnly);
        }
        return Ok(Compatibility::Communicate(Protocol::AllToAll));
    }

    if axis_contained(src.col_dist, src.col_align, dst.col_dist, dst.col_align, grid)
        && axis_contained(src.row_dist, src.row_align, dst.row_dist, dst.row_align, grid)
    {
        return Ok(Compatibility::Communicate(Protocol::LocalTrim));
    }

    if dst.col_dist == SingleOwner && dst.row_dist == SingleOwner {
        return Ok(Compatibility::Communicate(Protocol::GatherToOwner));
    }

    if src.col_dist == SingleOwner && src.row_dist == SingleOwner {
        return Ok(Compatibility::Communicate(Protocol::ScatterFromOwner));
    }

    // One axis untouched: gather the other along a single sub-group.
    let col_same = src.col_dist == dst.col_dist && src.col_align == dst.col_align;
    let row_same = src.row_dist == dst.row_dist && src.row_align == dst.row_align;

    if row_same {
        if let Some(protocol) = subgroup_gather(
            src.col_dist,
            src.col_align,
            dst.col_dist,
            dst.col_align,
            grid,
        ) {
            return Ok(Compatibility::Communicate(protocol));
        }
    }
    if col_same {
        if let Some(protocol) = subgroup_gather(
            src.row_dist,
            src.row_align,
            dst.row_dist,
            dst.row_align,
            grid,
        ) {
            return Ok(Compatibility::Communicate(protocol));
        }
    }

    if dst.col_dist == Replicated && dst.row_dist == Replicated {
        return Ok(Compatibility::Communicate(Protocol::FullAllGather));
    }

    Ok(Compatibility::Communicate(Protocol::AllToAll))
}

/// Whether every index owned under `dst` on a process is also owned there
/// under `src`, on all processes at once.
fn axis_contained(
    src: AxisDist,
    src_align: u64,
    dst: AxisDist,
    dst_align: u64,
    grid: &ProcessGrid,
) -> bool {
    use AxisDist::*;
    let (r, c) = (grid.height() as u64, grid.width() as u64);

    if src == Replicated {
        return true;
    }
    if src == dst && src_align == dst_align {
        return true;
    }

    // A linear distribution refines the cyclic one over the matching grid
    // dimension when the alignments are congruent.
    match (src, dst) {
        (RowCyclic, ColMajorLinear) => dst_align % r == src_align,
        (ColCyclic, RowMajorLinear) => dst_align % c == src_align,
        _ => false,
    }
}

/// The sub-group all-gather that coarsens one axis, when one exists.
fn subgroup_gather(
    src: AxisDist,
    src_align: u64,
    dst: AxisDist,
    dst_align: u64,
    grid: &ProcessGrid,
) -> Option<Protocol> {
    use AxisDist::*;
    let (r, c) = (grid.height() as u64, grid.width() as u64);

    match (src, dst) {
        // Owners spread across grid rows: concatenate down each column.
        (RowCyclic, Replicated) => Some(Protocol::ColwiseAllGather),
        // Owners spread across grid columns: concatenate along each row.
        (ColCyclic, Replicated) => Some(Protocol::RowwiseAllGather),
        // The linear refinement folds back onto its cyclic parent within one
        // row (resp. column) sub-group.
        (ColMajorLinear, RowCyclic) if src_align % r == dst_align => {
            Some(Protocol::RowwiseAllGather)
        }
        (RowMajorLinear, ColCyclic) if src_align % c == dst_align => {
            Some(Protocol::ColwiseAllGather)
        }
        _ => None,
    }
}

/// Bytes each participant contributes under the target scheme; used for the
/// plan logged before communicating.
pub(crate) fn local_volume(scheme: &Scheme, grid: &ProcessGrid, height: u64, width: u64, elem: usize) -> usize {
    let (lh, lw) = scheme.local_shape(grid, height, width);
    (lh * lw) as usize * elem
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::LocalCluster;
    use std::sync::Arc;

    fn classify(n: usize, height: usize, src: Scheme, dst: Scheme) -> Compatibility {
        let mut out = LocalCluster::run(n, |comm| {
            let grid = ProcessGrid::new(Arc::new(comm), height).unwrap();
            resolve(&src, &dst, &grid).unwrap()
        });
        out.pop().unwrap()
    }

    #[test]
    fn test_protocol_table() {
        use AxisDist::*;
        use Compatibility::*;
        use Protocol::*;

        let standard = Scheme::standard();
        let star = Scheme::replicated();

        assert_eq!(classify(4, 2, standard, standard), Direct);
        assert_eq!(
            classify(4, 2, standard, Scheme::with_aligns(RowCyclic, ColCyclic, 1, 0)),
            RealignOnly
        );
        assert_eq!(classify(4, 2, standard, star), Communicate(FullAllGather));
        assert_eq!(classify(4, 2, star, standard), Communicate(LocalTrim));
        assert_eq!(
            classify(4, 2, standard, Scheme::rooted(0, 0)),
            Communicate(GatherToOwner)
        );
        assert_eq!(
            classify(4, 2, Scheme::rooted(1, 1), standard),
            Communicate(ScatterFromOwner)
        );

        // One axis untouched.
        assert_eq!(
            classify(4, 2, standard, Scheme::new(RowCyclic, Replicated)),
            Communicate(RowwiseAllGather)
        );
        assert_eq!(
            classify(4, 2, standard, Scheme::new(Replicated, ColCyclic)),
            Communicate(ColwiseAllGather)
        );
        assert_eq!(
            classify(
                4,
                2,
                Scheme::new(ColMajorLinear, Replicated),
                Scheme::new(RowCyclic, Replicated)
            ),
            Communicate(RowwiseAllGather)
        );
        assert_eq!(
            classify(
                4,
                2,
                Scheme::new(RowCyclic, Replicated),
                Scheme::new(ColMajorLinear, Replicated)
            ),
            Communicate(LocalTrim)
        );

        // The transpose pair has no cheaper path.
        assert_eq!(
            classify(4, 2, standard, Scheme::new(ColCyclic, RowCyclic)),
            Communicate(AllToAll)
        );
    }

    #[test]
    fn test_unspecified_is_unroutable() {
        use AxisDist::*;

        LocalCluster::run(2, |comm| {
            let grid = ProcessGrid::new(Arc::new(comm), 1).unwrap();
            let bad = Scheme::new(Unspecified, ColCyclic);
            let err = resolve(&bad, &Scheme::standard(), &grid).unwrap_err();
            assert!(matches!(
                err.downcast_ref::<DistError>(),
                Some(DistError::UnroutableRedistribution { .. })
            ));
        });
    }
}
