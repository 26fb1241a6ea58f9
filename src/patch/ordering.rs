//! Execution order of patches applied to the same method.
//!
//! Patches from independent owners are ordered by three rules, strongest first:
//!
//! 1. `before` / `after` constraints between owners
//! 2. priority, higher first
//! 3. insertion order
//!
//! Constraints are not required to be consistent. Two owners that each demand to run before the
//! other form a cycle; the cycle is reported and broken in priority order instead of rejected.

use std::cmp::Ordering;

use tracing::warn;

use crate::patch::PatchEntry;

/// `true` if `first` has to run before `second` because of an explicit constraint
fn must_precede(first: &PatchEntry, second: &PatchEntry) -> bool {
    if first.owner == second.owner {
        return false;
    }
    first.before.contains(&second.owner) || second.after.contains(&first.owner)
}

/// Pairwise precedence of two entries.
///
/// `Ordering::Less` means `a` runs first. Explicit constraints win over priority, priority wins
/// over insertion order. The relation is not transitive when constraints conflict, so it must
/// not be handed to a comparison sort; use [`sort`] instead.
#[must_use]
pub fn precedence(a: &PatchEntry, b: &PatchEntry) -> Ordering {
    if must_precede(a, b) {
        return Ordering::Less;
    }
    if must_precede(b, a) {
        return Ordering::Greater;
    }
    b.priority
        .cmp(&a.priority)
        .then(a.sequence_index.cmp(&b.sequence_index))
}

/// Orders entries for execution.
///
/// Entries start out in priority order. The first entry that no remaining entry is
/// constrained to precede is emitted next, until all are placed. Without constraints the result
/// is exactly `priority desc, sequence_index asc`.
#[must_use]
pub fn sort(entries: &[PatchEntry]) -> Vec<PatchEntry> {
    let mut remaining: Vec<PatchEntry> = entries.to_vec();
    remaining.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then(a.sequence_index.cmp(&b.sequence_index))
    });

    let mut sorted = Vec::with_capacity(remaining.len());
    while !remaining.is_empty() {
        let ready = remaining.iter().position(|candidate| {
            !remaining
                .iter()
                .any(|other| must_precede(other, candidate))
        });

        let index = match ready {
            Some(index) => index,
            None => {
                let owners: Vec<&str> = remaining.iter().map(|e| e.owner.as_str()).collect();
                warn!(
                    owners = ?owners,
                    "Cyclic before/after constraints, falling back to priority order"
                );
                0
            }
        };
        sorted.push(remaining.remove(index));
    }

    sorted
}
