//! Addresses
//!
//! Address = prefix + Base58Check(BLAKE3(pubkey)[0:20]).

use serde::{Deserialize, Serialize};
use std::fmt;

use super::{double_hash, hash_bytes};
use crate::constants::ADDRESS_PREFIX;

/// Owner of unspent outputs
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Address(String);

impl Address {
    /// Wrap an address string without checking it.
    /// See [`Address::is_well_formed`] for the checksum test.
    pub fn new(value: impl Into<String>) -> Self {
        Address(value.into())
    }

    pub(crate) fn from_public_key_bytes(pubkey: &[u8; 32]) -> Self {
        let hash = hash_bytes(pubkey);
        let payload = &hash.0[0..20];
        let checksum = double_hash(payload);

        let mut with_checksum = Vec::with_capacity(24);
        with_checksum.extend_from_slice(payload);
        with_checksum.extend_from_slice(&checksum.0[0..4]);

        Address(format!("{}{}", ADDRESS_PREFIX, bs58::encode(with_checksum).into_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Check prefix and Base58Check checksum
    pub fn is_well_formed(&self) -> bool {
        let Some(body) = self.0.strip_prefix(ADDRESS_PREFIX) else {
            return false;
        };
        let Ok(bytes) = bs58::decode(body).into_vec() else {
            return false;
        };
        if bytes.len() != 24 {
            return false;
        }
        let checksum = double_hash(&bytes[0..20]);
        bytes[20..24] == checksum.0[0..4]
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self.0)
    }
}

impl From<&str> for Address {
    fn from(value: &str) -> Self {
        Address::new(value)
    }
}
