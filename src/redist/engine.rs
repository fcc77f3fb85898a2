//! Protocol execution for the redistribution engine.
//!
//! Every routine moves raw element bytes; the placement on both sides is
//! recomputed from the shift/stride algebra, never shipped alongside the
//! data. Fragments are packed column-major over ascending owned indices, so
//! a sender and receiver that agree on the index sets agree on the order.

use crate::buffer::Element;
use crate::comm::{Group, TAG_REALIGN};
use crate::dist::{Axis, AxisDist, Scheme};
use crate::grid::ProcessGrid;
use crate::matrix::DistMatrix;
use crate::prelude::*;
use gridmat_core::algebra as alg;

use super::{local_volume, resolve, Compatibility, Protocol};

pub(crate) fn execute<T: Element>(dst: &mut DistMatrix<T>, src: &DistMatrix<T>) -> Result<()> {
    let grid = src.grid().clone();
    let compat = resolve(src.scheme(), dst.scheme(), &grid)?;

    debug!(
        "redistribute {} -> {}: {:?}, {} phase(s), {} bytes locally",
        src.scheme(),
        dst.scheme(),
        compat,
        compat.phases(),
        local_volume(
            dst.scheme(),
            &grid,
            src.height(),
            src.width(),
            std::mem::size_of::<T>()
        ),
    );

    match compat {
        Compatibility::Direct => {
            direct(dst, src);
            Ok(())
        }
        Compatibility::RealignOnly => realign(dst, src, &grid),
        Compatibility::Communicate(protocol) => match protocol {
            Protocol::LocalTrim => {
                local_trim(dst, src);
                Ok(())
            }
            Protocol::RowwiseAllGather => {
                subgroup_gather(dst, src, &grid, grid.row_group(grid.row()))
            }
            Protocol::ColwiseAllGather => {
                subgroup_gather(dst, src, &grid, grid.col_group(grid.col()))
            }
            Protocol::GatherToOwner => gather_to_owner(dst, src, &grid),
            Protocol::ScatterFromOwner => scatter_from_owner(dst, src, &grid),
            Protocol::FullAllGather => subgroup_gather(dst, src, &grid, grid.world_group()),
            Protocol::AllToAll => all_to_all(dst, src, &grid),
        },
    }
}

fn to_bytes<T: Element>(values: &[T]) -> Vec<u8> {
    bytemuck::cast_slice(values).to_vec()
}

fn from_bytes<T: Element>(payload: &[u8]) -> Vec<T> {
    bytemuck::pod_collect_to_vec(payload)
}

/// Identical schemes: the fragments already coincide.
fn direct<T: Element>(dst: &mut DistMatrix<T>, src: &DistMatrix<T>) {
    let rows = dst.owned_rows();
    let cols = dst.owned_cols();
    let values = src.read_values(&rows, &cols);
    dst.write_values(&rows, &cols, &values);
}

/// Every target element is already present in the local source fragment.
fn local_trim<T: Element>(dst: &mut DistMatrix<T>, src: &DistMatrix<T>) {
    let rows = dst.owned_rows();
    let cols = dst.owned_cols();
    let values = src.read_values(&rows, &cols);
    dst.write_values(&rows, &cols, &values);
}

/// Same tags, different alignments: the whole local fragment moves to the
/// process offset by the alignment delta, one point-to-point exchange each.
fn realign<T: Element>(dst: &mut DistMatrix<T>, src: &DistMatrix<T>, grid: &ProcessGrid) -> Result<()> {
    let to = realign_partner(src.scheme(), dst.scheme(), grid, false);
    let from = realign_partner(src.scheme(), dst.scheme(), grid, true);

    let sends = src.col_layout().participates && src.row_layout().participates;
    let receives = dst.col_layout().participates && dst.row_layout().participates;

    if sends {
        let payload = to_bytes(&src.local_copy());
        grid.comm().send(to, TAG_REALIGN, &payload)?;
    }

    if receives {
        let payload = grid.comm().recv(from, TAG_REALIGN)?;
        let rows = dst.owned_rows();
        let cols = dst.owned_cols();
        dst.write_values(&rows, &cols, &from_bytes::<T>(&payload));
    }

    Ok(())
}

/// Destination (or, inverted, origin) of this process's fragment under an
/// alignment shift. The index sets a process owns after realignment are
/// exactly the sets its partner owned before, so fragments move wholesale.
fn realign_partner(src: &Scheme, dst: &Scheme, grid: &ProcessGrid, inverse: bool) -> usize {
    let (mut row, mut col) = (grid.row() as u64, grid.col() as u64);

    for &(tag, axis, a_src, a_dst) in &[
        (src.col_dist, Axis::Col, src.col_align, dst.col_align),
        (src.row_dist, Axis::Row, src.row_align, dst.row_align),
    ] {
        let (from, to) = if inverse { (a_dst, a_src) } else { (a_src, a_dst) };
        shift_coords(tag, axis, from, to, grid, &mut row, &mut col);
    }

    grid.rank_of(row as usize, col as usize)
}

fn shift_coords(
    tag: AxisDist,
    axis: Axis,
    from: u64,
    to: u64,
    grid: &ProcessGrid,
    row: &mut u64,
    col: &mut u64,
) {
    use AxisDist::*;
    let (r, c) = (grid.height() as u64, grid.width() as u64);

    match tag {
        RowCyclic => *row = (*row + (to + r - from) % r) % r,
        ColCyclic => *col = (*col + (to + c - from) % c) % c,
        ColMajorLinear => {
            let lin = (*col * r + *row + (to + r * c - from) % (r * c)) % (r * c);
            *row = lin % r;
            *col = lin / r;
        }
        RowMajorLinear => {
            let lin = (*row * c + *col + (to + r * c - from) % (r * c)) % (r * c);
            *row = lin / c;
            *col = lin % c;
        }
        Replicated => {}
        SingleOwner => match axis {
            Axis::Col => *row = to,
            Axis::Row => *col = to,
        },
        // Diagonal alignment changes are routed through the all-to-all.
        Diagonal | Unspecified => unreachable!("not realignable"),
    }
}

/// All-gather of the local fragments within one sub-group; each receiver
/// places every member's fragment by the member's source layout.
fn subgroup_gather<T: Element>(
    dst: &mut DistMatrix<T>,
    src: &DistMatrix<T>,
    grid: &ProcessGrid,
    group: Group,
) -> Result<()> {
    let payload = to_bytes(&src.local_copy());
    let chunks = grid.comm().all_gather(&group, &payload)?;

    for (chunk, &member) in zip(&chunks, group.ranks()) {
        let (col, row) = src.scheme().layout_for(grid, member);
        let rows = col.owned(src.height());
        let cols = row.owned(src.width());
        dst.write_values(&rows, &cols, &from_bytes::<T>(chunk));
    }

    Ok(())
}

/// Fan-in of every fragment to the single target owner.
fn gather_to_owner<T: Element>(
    dst: &mut DistMatrix<T>,
    src: &DistMatrix<T>,
    grid: &ProcessGrid,
) -> Result<()> {
    let owner = grid.rank_of(
        dst.scheme().col_align as usize,
        dst.scheme().row_align as usize,
    );

    let payload = to_bytes(&src.local_copy());
    let gathered = grid.comm().gather(&grid.world_group(), owner, &payload)?;

    if let Some(chunks) = gathered {
        for (sender, chunk) in enumerate(chunks) {
            let (col, row) = src.scheme().layout_for(grid, sender);
            let rows = col.owned(src.height());
            let cols = row.owned(src.width());
            dst.write_values(&rows, &cols, &from_bytes::<T>(&chunk));
        }
    }

    Ok(())
}

/// Fan-out from the single source owner to the target owners.
fn scatter_from_owner<T: Element>(
    dst: &mut DistMatrix<T>,
    src: &DistMatrix<T>,
    grid: &ProcessGrid,
) -> Result<()> {
    let owner = grid.rank_of(
        src.scheme().col_align as usize,
        src.scheme().row_align as usize,
    );

    let chunks = if grid.rank() == owner {
        let mut chunks = Vec::with_capacity(grid.size());
        for target in 0..grid.size() {
            let (col, row) = dst.scheme().layout_for(grid, target);
            let rows = col.owned(src.height());
            let cols = row.owned(src.width());
            chunks.push(to_bytes(&src.read_values(&rows, &cols)));
        }
        Some(chunks)
    } else {
        None
    };

    let own = grid.comm().scatter(&grid.world_group(), owner, chunks)?;
    let rows = dst.owned_rows();
    let cols = dst.owned_cols();
    dst.write_values(&rows, &cols, &from_bytes::<T>(&own));

    Ok(())
}

/// General exchange: each pair of processes independently derives the index
/// sets it must exchange, then a single all-to-all moves everything.
///
/// When a source axis is replicated the element has several holders; the one
/// matching the receiver along every unclaimed grid dimension is the unique
/// designated sender, which also turns the self-chunk into the local part.
fn all_to_all<T: Element>(
    dst: &mut DistMatrix<T>,
    src: &DistMatrix<T>,
    grid: &ProcessGrid,
) -> Result<()> {
    let s = *src.scheme();
    let (height, width) = (src.height(), src.width());
    let (me_row, me_col) = (grid.row(), grid.col());

    let (col_r, col_c) = s.col_dist.claims(Axis::Col);
    let (row_r, row_c) = s.row_dist.claims(Axis::Row);
    let row_dim_free = !(col_r || row_r);
    let col_dim_free = !(col_c || row_c);

    let exchange_allowed = |peer_row: usize, peer_col: usize| {
        (!row_dim_free || peer_row == me_row) && (!col_dim_free || peer_col == me_col)
    };

    let mut chunks = Vec::with_capacity(grid.size());
    for target in 0..grid.size() {
        let (t_row, t_col) = grid.coordinate(target);
        if !exchange_allowed(t_row, t_col) {
            chunks.push(vec![]);
            continue;
        }

        let (col, row) = dst.scheme().layout_for(grid, target);
        let rows = col
            .owned(height)
            .into_iter()
            .filter(|&i| source_matches(s.col_dist, s.col_align, Axis::Col, grid, me_row, me_col, i))
            .collect::<Vec<_>>();
        let cols = row
            .owned(width)
            .into_iter()
            .filter(|&j| source_matches(s.row_dist, s.row_align, Axis::Row, grid, me_row, me_col, j))
            .collect::<Vec<_>>();

        if rows.is_empty() || cols.is_empty() {
            chunks.push(vec![]);
        } else {
            chunks.push(to_bytes(&src.read_values(&rows, &cols)));
        }
    }

    let received = grid.comm().all_to_all(&grid.world_group(), chunks)?;

    let (dst_col, dst_row) = (dst.col_layout(), dst.row_layout());
    for (sender, payload) in enumerate(received) {
        let (s_row, s_col) = grid.coordinate(sender);
        if !exchange_allowed(s_row, s_col) {
            continue;
        }

        let rows = dst_col
            .owned(height)
            .into_iter()
            .filter(|&i| source_matches(s.col_dist, s.col_align, Axis::Col, grid, s_row, s_col, i))
            .collect::<Vec<_>>();
        let cols = dst_row
            .owned(width)
            .into_iter()
            .filter(|&j| source_matches(s.row_dist, s.row_align, Axis::Row, grid, s_row, s_col, j))
            .collect::<Vec<_>>();

        if !rows.is_empty() && !cols.is_empty() {
            dst.write_values(&rows, &cols, &from_bytes::<T>(&payload));
        }
    }

    Ok(())
}

/// Whether the process at `(row, col)` is the designated holder of axis
/// index `index` under the given source tag.
fn source_matches(
    tag: AxisDist,
    align: u64,
    axis: Axis,
    grid: &ProcessGrid,
    row: usize,
    col: usize,
    index: u64,
) -> bool {
    use AxisDist::*;
    let (r, c) = (grid.height() as u64, grid.width() as u64);
    let (row, col) = (row as u64, col as u64);

    match tag {
        RowCyclic => alg::owner(index, align, r) == row,
        ColCyclic => alg::owner(index, align, c) == col,
        ColMajorLinear => alg::owner(index, align, r * c) == col * r + row,
        RowMajorLinear => alg::owner(index, align, r * c) == row * c + col,
        Replicated => true,
        SingleOwner => match axis {
            Axis::Col => row == align,
            Axis::Row => col == align,
        },
        Diagonal => {
            let position = index % alg::lcm(r, c);
            row == position % r && col == (align + position) % c
        }
        Unspecified => false,
    }
}
