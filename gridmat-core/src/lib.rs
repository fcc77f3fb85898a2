pub mod algebra;
pub mod prelude;
