//! Majority arithmetic used by the election and replication subsystems.
//!
//! Kept as free functions, not methods on `Configuration`, so that both
//! vote-tallying (§4.2) and match-index quorum commit (§4.3) share exactly
//! one definition of "majority of voting servers".

/// The number of affirmative votes/acks required out of `n` voting servers.
pub fn majority_of(n: usize) -> usize {
    n / 2 + 1
}

/// Given the `match_index` (or vote) of every voting server, including the
/// leader itself, returns the highest index for which a majority agree the
/// value is `>=` that index — the largest `N` such that at least
/// `majority_of(values.len())` entries of `values` are `>= N`.
///
/// Used by §4.3's quorum commit rule: candidates for `commit_index` are
/// evaluated from `last_index` down to `commit_index + 1`, and the first `N`
/// for which this function (restricted to same-term entries) would accept is
/// the new commit index. This helper itself is term-agnostic; the caller is
/// responsible for only invoking it once term equality at `N` has been
/// checked (§4.3's "same-term constraint").
pub fn quorum_match_index(values: &[u64]) -> u64 {
    if values.is_empty() {
        return 0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_unstable();
    let need = majority_of(sorted.len());
    // The value at this position (counting from the top) is held by at
    // least `need` servers.
    sorted[sorted.len() - need]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn majority_of_odd_and_even() {
        assert_eq!(majority_of(1), 1);
        assert_eq!(majority_of(2), 2);
        assert_eq!(majority_of(3), 2);
        assert_eq!(majority_of(4), 3);
        assert_eq!(majority_of(5), 3);
    }

    #[test]
    fn quorum_match_index_three_voters() {
        // leader at 10, two peers at 8 and 5: majority (2 of 3) agree on >= 8.
        assert_eq!(quorum_match_index(&[10, 8, 5]), 8);
    }

    #[test]
    fn quorum_match_index_single_voter() {
        assert_eq!(quorum_match_index(&[7]), 7);
    }
}
