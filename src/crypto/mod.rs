//! Cryptography module - hashing, Schnorr signatures, addresses, Merkle trees

mod address;
mod hash;
mod merkle;
mod schnorr;

pub use address::*;
pub use hash::*;
pub use merkle::*;
pub use schnorr::*;
