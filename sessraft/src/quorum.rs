//! Majority arithmetic for elections and commit advancement.

use crate::raft_types::LogId;

/// The number of members constituting a majority of `n`.
pub fn majority_of(n: usize) -> usize {
    n / 2 + 1
}

/// Determine the new commit index from the matched log IDs of all active
/// members, including the leader itself.
///
/// The result is the greatest index replicated on a majority of the given
/// members whose entry term equals `leader_term`; entries from earlier terms
/// are never committed by counting replicas. The output never regresses
/// below `current_commit`.
pub fn commit_index_from_matched(mut matched: Vec<LogId>, current_commit: u64, leader_term: u64) -> u64 {
    if matched.is_empty() {
        return current_commit;
    }

    matched.sort_unstable_by(|a, b| a.index.cmp(&b.index));

    let majority = majority_of(matched.len());
    let offset = matched.len() - majority;
    let candidate = matched[offset];

    if candidate.index > current_commit && candidate.term == leader_term {
        candidate.index
    } else {
        current_commit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    macro_rules! test_commit_index {
        ($name:ident, $expected:literal, $current:literal, $leader_term:literal, $matched:expr) => {
            #[test]
            fn $name() {
                let matched: Vec<LogId> = $matched.into_iter().map(Into::into).collect();
                assert_eq!(commit_index_from_matched(matched, $current, $leader_term), $expected);
            }
        };
    }

    test_commit_index!(basic_values, 10, 5, 3, vec![(3, 20), (2, 5), (2, 0), (3, 15), (3, 10)]);

    test_commit_index!(empty_returns_current_commit, 20, 20, 10, Vec::<(u64, u64)>::new());

    test_commit_index!(single_member_greater_than_current, 100, 0, 3, vec![(3, 100)]);

    test_commit_index!(single_member_stale_term_is_not_committed, 0, 0, 3, vec![(2, 100)]);

    test_commit_index!(never_regresses, 100, 100, 3, vec![(3, 50)]);

    test_commit_index!(even_member_count, 0, 0, 3, vec![(3, 0), (3, 100), (3, 0), (3, 100), (3, 0), (3, 100)]);

    test_commit_index!(majority_wins, 100, 0, 3, vec![
        (3, 0),
        (3, 100),
        (3, 0),
        (3, 100),
        (3, 0),
        (3, 100),
        (3, 100)
    ]);

    test_commit_index!(majority_at_stale_term_is_not_committed, 0, 0, 3, vec![
        (2, 0),
        (2, 100),
        (2, 0),
        (3, 101),
        (2, 0),
        (3, 101),
        (3, 101)
    ]);

    #[test]
    fn majority_of_small_sets() {
        assert_eq!(majority_of(1), 1);
        assert_eq!(majority_of(2), 2);
        assert_eq!(majority_of(3), 2);
        assert_eq!(majority_of(4), 3);
        assert_eq!(majority_of(5), 3);
    }
}
