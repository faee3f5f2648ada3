//! Checkpoint module - sealed snapshots, backups, and startup recovery

mod manager;
mod recovery;
mod snapshot;

pub use manager::*;
pub use recovery::*;
pub use snapshot::*;
