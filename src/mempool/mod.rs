//! Mempool module - transaction admission, orphan transactions, block-driven refresh

mod orphan;
mod pool;

pub use orphan::*;
pub use pool::*;
