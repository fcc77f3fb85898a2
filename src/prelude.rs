pub use gridmat_core::prelude::*;

pub use crate::error::DistError;
