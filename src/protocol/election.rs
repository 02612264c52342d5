//! Probabilistic cluster-head election with rotation fairness.
//!
//! The threshold follows the Heinzelman rotation rule: a node that already
//! served as head in the current epoch is excluded (threshold 0); otherwise
//! the threshold grows as the epoch progresses so that by the last eligible
//! round it reaches 1 and every remaining node is elected. Over an epoch of
//! ceil(1/P) rounds each node therefore serves exactly once.

use crate::engine::rng::UniformStream;

/// Election threshold for one node at the start of a round.
///
/// `round_index` is the global round counter; the position within the epoch
/// is `round_index mod epoch_rounds`. The exclusion flag resets exactly at
/// epoch boundaries, not earlier.
pub fn election_threshold(
    head_fraction: f64,
    round_index: u64,
    epoch_rounds: u64,
    was_head_in_epoch: bool,
) -> f64 {
    if was_head_in_epoch {
        return 0.0;
    }
    let round_in_epoch = (round_index % epoch_rounds) as f64;
    let denominator = 1.0 - head_fraction * round_in_epoch;
    if denominator <= f64::EPSILON {
        1.0
    } else {
        (head_fraction / denominator).min(1.0)
    }
}

/// Sample the election. The draw is taken even when the threshold is zero so
/// that a node's random stream advances identically in every round.
pub fn run_election(rng: &mut UniformStream, threshold: f64) -> bool {
    rng.next_f64() < threshold
}
