//! The balance algorithm (spec §4.4.1): turns a registry snapshot into a
//! `(base, total)` pair for one member.

/// One entry of a registry snapshot: `(instance_id, workers)`. Callers are
/// responsible for sorting ascending by `instance_id` and filtering expired
/// entries before calling [`balance`] — the algorithm itself does neither
/// (spec: "Expired entries must be filtered by the adapter, not here").
pub type Snapshot<'a> = &'a [(String, u32)];

/// Result of one balance pass for a single member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Balance {
    pub base: i64,
    pub total: u64,
}

/// Compute `(base, total)` for `our_instance_id` against `snapshot`.
///
/// `snapshot` must already be sorted ascending by `instance_id`. If
/// `our_instance_id` appears more than once, the first occurrence wins the
/// `base` assignment; later occurrences still contribute to `total` (spec:
/// "the caller's responsibility" to avoid duplicates, but the algorithm
/// must not panic or double-assign if they occur anyway).
pub fn balance(snapshot: Snapshot<'_>, our_instance_id: &str, passive: bool) -> Balance {
    let mut total: u64 = 0;
    let mut base: i64 = -1;
    let mut assigned = false;

    for (id, workers) in snapshot {
        if !passive && !assigned && id == our_instance_id {
            base = total as i64;
            assigned = true;
        }
        total += *workers as u64;
    }

    Balance { base, total }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snap(pairs: &[(&str, u32)]) -> Vec<(String, u32)> {
        pairs.iter().map(|(id, w)| (id.to_string(), *w)).collect()
    }

    #[test]
    fn single_active_member() {
        let s = snap(&[("node1", 2)]);
        let b = balance(&s, "node1", false);
        assert_eq!(b, Balance { base: 0, total: 2 });
    }

    #[test]
    fn three_node_assignment() {
        let s = snap(&[("node1", 2), ("node2", 1), ("node3", 4)]);
        assert_eq!(balance(&s, "node1", false), Balance { base: 0, total: 7 });
        assert_eq!(balance(&s, "node2", false), Balance { base: 2, total: 7 });
        assert_eq!(balance(&s, "node3", false), Balance { base: 3, total: 7 });
    }

    #[test]
    fn departure_shrinks_total_and_shifts_bases() {
        let s = snap(&[("node2", 1), ("node3", 4)]);
        assert_eq!(balance(&s, "node2", false), Balance { base: 0, total: 5 });
        assert_eq!(balance(&s, "node3", false), Balance { base: 1, total: 5 });
    }

    #[test]
    fn passive_member_always_reports_base_negative_one() {
        let s = snap(&[("node1", 2), ("node2", 1), ("node3", 4)]);
        let b = balance(&s, "passive-observer", true);
        assert_eq!(b, Balance { base: -1, total: 7 });
    }

    #[test]
    fn absent_member_reports_base_negative_one() {
        let s = snap(&[("node1", 2), ("node2", 1)]);
        let b = balance(&s, "ghost", false);
        assert_eq!(b, Balance { base: -1, total: 3 });
    }

    #[test]
    fn empty_snapshot_is_zero_total() {
        let s: Vec<(String, u32)> = Vec::new();
        assert_eq!(balance(&s, "node1", false), Balance { base: -1, total: 0 });
    }

    #[test]
    fn duplicate_instance_id_first_occurrence_wins_base() {
        // Caller's responsibility to avoid duplicates, but a duplicate must
        // not panic and must only assign `base` once.
        let s = snap(&[("dup", 2), ("dup", 3), ("zzz", 1)]);
        let b = balance(&s, "dup", false);
        assert_eq!(b.base, 0);
        assert_eq!(b.total, 6);
    }

    #[test]
    fn total_always_equals_sum_of_workers() {
        let s = snap(&[("a", 3), ("b", 5), ("c", 2)]);
        let b = balance(&s, "b", false);
        let expected: u64 = s.iter().map(|(_, w)| *w as u64).sum();
        assert_eq!(b.total, expected);
    }
}
