//! Chain module - canonical chain, orphan blocks, and reorganization

mod orphan;
mod reorg;
mod state;

pub use orphan::*;
pub use state::*;

#[cfg(test)]
mod tests;
