//! Difficulty adjustment algorithm
//!
//! Pure linear retargeting: every `interval` blocks the difficulty is scaled
//! by expected / actual window time.

/// Minimum difficulty (easiest)
pub const MIN_DIFFICULTY: u64 = 1;

/// Maximum adjustment factor (4x in either direction per period)
const MAX_ADJUSTMENT_FACTOR: u64 = 4;

/// Retarget schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetargetParams {
    /// Blocks per adjustment period
    pub interval: u64,
    /// Desired seconds between blocks
    pub target_block_time: u64,
}

impl RetargetParams {
    /// Check if difficulty should be adjusted at this height
    pub fn should_adjust(&self, height: u64) -> bool {
        self.interval > 0 && height > 0 && height % self.interval == 0
    }

    /// Seconds the window of one period is expected to span. The window runs
    /// from the first to the last block of the period, so it has
    /// `interval - 1` gaps.
    pub fn expected_window(&self) -> u64 {
        self.target_block_time
            .saturating_mul(self.interval.saturating_sub(1))
            .max(1)
    }
}

/// Calculate the new difficulty
///
/// This is a pure function with no side effects.
///
/// # Arguments
/// * `current` - Difficulty of the period that just ended
/// * `first_block_time` - Timestamp of first block in adjustment period
/// * `last_block_time` - Timestamp of last block in adjustment period
pub fn calculate_next_difficulty(
    params: &RetargetParams,
    current: u64,
    first_block_time: u64,
    last_block_time: u64,
) -> u64 {
    let expected = params.expected_window();
    let actual = last_block_time.saturating_sub(first_block_time);

    // Limit adjustment to 4x in either direction
    let actual = actual
        .max(expected / MAX_ADJUSTMENT_FACTOR)
        .min(expected.saturating_mul(MAX_ADJUSTMENT_FACTOR))
        .max(1);

    let next = (current as u128 * expected as u128) / actual as u128;
    (next.min(u64::MAX as u128) as u64).max(MIN_DIFFICULTY)
}
