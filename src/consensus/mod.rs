//! Consensus module - Block structure, proof of work, validation, difficulty, and rewards

mod block;
mod difficulty;
mod pow;
mod rewards;
mod validation;

pub use block::*;
pub use difficulty::*;
pub use pow::*;
pub use rewards::*;
pub use validation::*;
