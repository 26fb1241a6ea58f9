//! Integration tests for patch ordering across owners.

use dotpatch::{
    patch::{ordering::sort, PatchEntry},
    prelude::*,
};
use uguid::Guid;

fn entry(owner: &str, priority: i32, sequence_index: u32) -> PatchEntry {
    let token = Token::new(0x0600_0100 + sequence_index);
    let callback = Callback::new(
        MethodKey::new(Guid::ZERO, token),
        token,
        CallbackSignature::default(),
    );
    PatchEntry::new(owner, sequence_index, callback).with_priority(priority)
}

fn owners(entries: &[PatchEntry]) -> Vec<&str> {
    entries.iter().map(|e| e.owner.as_str()).collect()
}

/// A handful of mods patching the same method with the usual mix of priorities and
/// constraints
fn mod_load_order() -> Vec<PatchEntry> {
    vec![
        entry("ui", Priority::NORMAL, 0),
        entry("core", Priority::LOW, 1).with_before(["ui", "balance"]),
        entry("balance", Priority::HIGH, 2),
        entry("logging", Priority::FIRST, 3),
        entry("compat", Priority::NORMAL, 4).with_after(["balance"]),
        entry("ui", Priority::VERY_HIGH, 5),
    ]
}

#[test]
fn test_constraints_then_priority_then_insertion() {
    let sorted = sort(&mod_load_order());

    assert_eq!(
        owners(&sorted),
        ["logging", "core", "ui", "balance", "ui", "compat"]
    );
    let ui: Vec<u32> = sorted
        .iter()
        .filter(|e| e.owner == "ui")
        .map(|e| e.sequence_index)
        .collect();
    assert_eq!(ui, [5, 0]);
}

#[test]
fn test_order_does_not_depend_on_registration_order() {
    let expected = sort(&mod_load_order());

    let mut reversed = mod_load_order();
    reversed.reverse();
    assert_eq!(sort(&reversed), expected);

    let mut rotated = mod_load_order();
    rotated.rotate_left(2);
    assert_eq!(sort(&rotated), expected);
}

#[test]
fn test_conflicting_owners_fall_back_to_priority() {
    let entries = vec![
        entry("a", Priority::LOW, 0).with_before(["b"]),
        entry("b", Priority::HIGH, 1).with_before(["a"]),
        entry("c", Priority::NORMAL, 2),
    ];
    let sorted = sort(&entries);

    // c is unconstrained and runs first, the cycle is broken by priority
    assert_eq!(owners(&sorted), ["c", "b", "a"]);
}

#[test]
fn test_patch_set_keeps_order_through_payload() -> Result<()> {
    let mut set = PatchSet::new();
    for patch in mod_load_order() {
        set.add(PatchKind::Prefix, patch);
    }
    set.add(PatchKind::Postfix, entry("logging", Priority::LAST, 6));

    let restored = PatchSet::from_bytes(&set.to_bytes()?)?;
    assert_eq!(restored, set);
    assert_eq!(
        owners(restored.entries(PatchKind::Prefix)),
        ["logging", "core", "ui", "balance", "ui", "compat"]
    );

    let mut pruned = restored;
    assert_eq!(pruned.remove_owner("core"), 1);
    // Without core's constraint priority decides again
    assert_eq!(
        owners(pruned.entries(PatchKind::Prefix)),
        ["logging", "ui", "balance", "ui", "compat"]
    );
    assert!(pruned.has_owner("logging"));
    assert_eq!(pruned.len(), 6);
    Ok(())
}
