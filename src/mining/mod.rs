//! Mining module - block templates and proof-of-work search

mod miner;

pub use miner::*;
