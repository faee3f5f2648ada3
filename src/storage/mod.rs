//! Storage module - UTXO ledger, block index, and durable stores

mod blocks;
mod db;
mod index;
mod ledger;

pub use blocks::*;
pub use db::*;
pub use index::*;
pub use ledger::*;
