//! Block reward schedule
//!
//! Each block mints a fixed fraction of the issuance that remains, so total
//! mined supply approaches `PUBLIC_ISSUANCE` and never passes it.

use crate::constants::PUBLIC_ISSUANCE;
use crate::Amount;

/// Per-block share of the remaining issuance, in parts per million
const REWARD_PARTS_PER_MILLION: u128 = 50;

/// Block reward at `height` given everything mined before it.
///
/// Genesis mints nothing through this path (its allocation is separate).
/// While anything remains the reward is at least one base unit.
pub fn calculate_block_reward(height: u64, total_issued_so_far: Amount) -> Amount {
    if height == 0 {
        return 0;
    }

    let remaining = PUBLIC_ISSUANCE.saturating_sub(total_issued_so_far);
    if remaining == 0 {
        return 0;
    }

    let reward = (remaining as u128 * REWARD_PARTS_PER_MILLION) / 1_000_000;
    (reward as Amount).clamp(1, remaining)
}

/// Amount the coinbase must pay: reward plus collected fees
pub fn expected_coinbase_value(height: u64, total_issued_so_far: Amount, fees: Amount) -> Option<Amount> {
    calculate_block_reward(height, total_issued_so_far).checked_add(fees)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_genesis_has_no_reward() {
        assert_eq!(calculate_block_reward(0, 0), 0);
    }

    #[test]
    fn test_rewards_decrease_over_time() {
        let reward1 = calculate_block_reward(1, 0);
        let reward2 = calculate_block_reward(2, reward1);
        assert!(reward1 > 0);
        assert!(reward2 <= reward1);
    }

    #[test]
    fn test_supply_never_exceeded() {
        let mut issued: Amount = 0;
        for height in 1..=200_000 {
            issued += calculate_block_reward(height, issued);
        }
        assert!(issued <= PUBLIC_ISSUANCE);
    }

    #[test]
    fn test_minimum_reward_is_one_unit() {
        assert_eq!(calculate_block_reward(1_000_000, PUBLIC_ISSUANCE - 1), 1);
    }

    #[test]
    fn test_no_reward_when_fully_issued() {
        assert_eq!(calculate_block_reward(1_000_000, PUBLIC_ISSUANCE), 0);
        assert_eq!(expected_coinbase_value(1_000_000, PUBLIC_ISSUANCE, 7), Some(7));
    }
}
