//! Validation module - transaction structure and contextual checks

mod transaction;

pub use transaction::*;
