#![allow(clippy::too_many_arguments, clippy::many_single_char_names)]

//! Distributed dense matrices over a 2D process grid.
//!
//! A matrix is split across a [`ProcessGrid`] according to a [`Scheme`]:
//! one distribution tag plus alignment per axis. [`DistMatrix::assign_from`]
//! moves data between any two fully specified schemes, choosing the cheapest
//! communication pattern from a fixed protocol table.

mod buffer;
pub mod comm;
mod dist;
mod error;
mod grid;
mod matrix;
mod prelude;
pub mod redist;

pub use crate::buffer::{Element, LocalBuffer};
pub use crate::dist::{Axis, AxisDist, AxisLayout, Scheme};
pub use crate::error::DistError;
pub use crate::grid::ProcessGrid;
pub use crate::matrix::DistMatrix;

pub use gridmat_core::algebra;

pub fn hostname() -> &'static str {
    lazy_static::lazy_static! {
        static ref HOSTNAME: String = {
            match ::hostname::get() {
                Ok(s) => s.to_string_lossy().into_owned(),
                Err(_) => "<anonymous>".into(),
            }
        };
    };

    &*HOSTNAME
}

pub fn initialize_logger() {
    use std::time::Instant;

    lazy_static::lazy_static! {
        static ref START_TIMING: Instant = Instant::now();
    }

    let _ = *START_TIMING;

    env_logger::Builder::from_default_env()
        .format(|formatter, record| {
            use std::io::Write;
            let duration = START_TIMING.elapsed();

            writeln!(
                formatter,
                "[{} {} {:.03}] {}: {}",
                hostname(),
                record.module_path().unwrap_or("?"),
                duration.as_secs_f64(),
                record.level(),
                record.args(),
            )
        })
        .init();
}
