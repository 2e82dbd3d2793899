//! SeaORM entity definitions for the threadkeep database schema.

pub mod comment;
pub mod prelude;
