//! Proof-of-work targets
//!
//! A header hash read as an unsigned 256-bit big-endian integer must be
//! strictly below `2^256 / difficulty`. Difficulty is a linear work factor:
//! one block at difficulty `d` is expected to take `d` hashes.

use std::cmp::Ordering;

use crate::crypto::Hash;

/// Cumulative chain work (sum of block difficulties)
pub type ChainWork = u128;

/// 256-bit unsigned integer, most significant limb first
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct U256(pub [u64; 4]);

impl U256 {
    pub const ZERO: U256 = U256([0; 4]);
    pub const MAX: U256 = U256([u64::MAX; 4]);

    /// Interpret 32 bytes as a big-endian integer
    pub fn from_be_bytes(bytes: &[u8; 32]) -> Self {
        let mut limbs = [0u64; 4];
        for (i, limb) in limbs.iter_mut().enumerate() {
            let mut word = [0u8; 8];
            word.copy_from_slice(&bytes[i * 8..i * 8 + 8]);
            *limb = u64::from_be_bytes(word);
        }
        U256(limbs)
    }

    pub fn to_be_bytes(&self) -> [u8; 32] {
        let mut bytes = [0u8; 32];
        for (i, limb) in self.0.iter().enumerate() {
            bytes[i * 8..i * 8 + 8].copy_from_slice(&limb.to_be_bytes());
        }
        bytes
    }

    /// Long division by a non-zero 64-bit divisor
    pub fn div_rem(&self, divisor: u64) -> Option<(U256, u64)> {
        if divisor == 0 {
            return None;
        }
        let mut quotient = [0u64; 4];
        let mut rem: u128 = 0;
        for (i, limb) in self.0.iter().enumerate() {
            let cur = (rem << 64) | *limb as u128;
            quotient[i] = (cur / divisor as u128) as u64;
            rem = cur % divisor as u128;
        }
        Some((U256(quotient), rem as u64))
    }

    pub fn checked_add_one(&self) -> Option<U256> {
        let mut limbs = self.0;
        for limb in limbs.iter_mut().rev() {
            let (sum, carry) = limb.overflowing_add(1);
            *limb = sum;
            if !carry {
                return Some(U256(limbs));
            }
        }
        None
    }

    pub fn checked_sub_one(&self) -> Option<U256> {
        let mut limbs = self.0;
        for limb in limbs.iter_mut().rev() {
            let (diff, borrow) = limb.overflowing_sub(1);
            *limb = diff;
            if !borrow {
                return Some(U256(limbs));
            }
        }
        None
    }
}

impl PartialOrd for U256 {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for U256 {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

/// `⌊2^256 / difficulty⌋` for difficulty ≥ 2.
///
/// Returns `None` for difficulty 0 (no target) and 1, whose target is
/// `2^256` itself and cannot be represented; every hash is below it.
pub fn target_for(difficulty: u64) -> Option<U256> {
    if difficulty < 2 {
        return None;
    }
    // 2^256 = MAX + 1, so the quotient gains one exactly when the remainder
    // of MAX wraps to the divisor
    let (quotient, rem) = U256::MAX.div_rem(difficulty)?;
    if rem == difficulty - 1 {
        quotient.checked_add_one()
    } else {
        Some(quotient)
    }
}

/// Check `hash < 2^256 / difficulty`
pub fn meets_target(hash: &Hash, difficulty: u64) -> bool {
    match difficulty {
        0 => false,
        1 => true,
        d => match target_for(d) {
            Some(target) => U256::from_be_bytes(hash.as_bytes()) < target,
            None => false,
        },
    }
}

/// Expected hashes to find one block at this difficulty
pub fn block_work(difficulty: u64) -> ChainWork {
    difficulty as ChainWork
}
