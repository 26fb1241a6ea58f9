//! The patches registered on one original method.

use serde::{Deserialize, Serialize};

use crate::{
    patch::{ordering, CallbackId, PatchEntry, PatchKind},
    Result,
};

/// All patches of one original method, grouped by kind and kept in execution order.
///
/// Every insertion and removal re-sorts the affected lists. The set is also the payload stored
/// in a method's trampoline frame, see [`PatchSet::to_bytes`].
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PatchSet {
    /// Callbacks run before the original
    pub prefixes: Vec<PatchEntry>,
    /// Callbacks run after the original
    pub postfixes: Vec<PatchEntry>,
    /// Instruction rewriters applied to the original
    pub transpilers: Vec<PatchEntry>,
    /// Callbacks run last, even when the original threw
    pub finalizers: Vec<PatchEntry>,
}

impl PatchSet {
    /// Creates an empty set
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Entries of one kind, in execution order
    #[must_use]
    pub fn entries(&self, kind: PatchKind) -> &[PatchEntry] {
        match kind {
            PatchKind::Prefix => &self.prefixes,
            PatchKind::Postfix => &self.postfixes,
            PatchKind::Transpiler => &self.transpilers,
            PatchKind::Finalizer => &self.finalizers,
        }
    }

    fn entries_mut(&mut self, kind: PatchKind) -> &mut Vec<PatchEntry> {
        match kind {
            PatchKind::Prefix => &mut self.prefixes,
            PatchKind::Postfix => &mut self.postfixes,
            PatchKind::Transpiler => &mut self.transpilers,
            PatchKind::Finalizer => &mut self.finalizers,
        }
    }

    fn lists_mut(&mut self) -> [&mut Vec<PatchEntry>; 4] {
        [
            &mut self.prefixes,
            &mut self.postfixes,
            &mut self.transpilers,
            &mut self.finalizers,
        ]
    }

    /// Adds an entry and restores execution order
    pub fn add(&mut self, kind: PatchKind, entry: PatchEntry) {
        let list = self.entries_mut(kind);
        list.push(entry);
        *list = ordering::sort(list);
    }

    /// Removes every entry registered by `owner`, returning how many were removed
    pub fn remove_owner(&mut self, owner: &str) -> usize {
        self.remove_where(|entry| entry.owner == owner)
    }

    /// Removes every entry calling `callback`, returning how many were removed
    pub fn remove_callback(&mut self, callback: &CallbackId) -> usize {
        self.remove_where(|entry| entry.callback.id == *callback)
    }

    fn remove_where(&mut self, predicate: impl Fn(&PatchEntry) -> bool) -> usize {
        let mut removed = 0;
        for list in self.lists_mut() {
            let before = list.len();
            list.retain(|entry| !predicate(entry));
            if list.len() != before {
                removed += before - list.len();
                *list = ordering::sort(list);
            }
        }
        removed
    }

    /// `true` if no patch of any kind is registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total number of entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.prefixes.len() + self.postfixes.len() + self.transpilers.len() + self.finalizers.len()
    }

    /// Iterates all entries with their kind
    pub fn iter(&self) -> impl Iterator<Item = (PatchKind, &PatchEntry)> {
        self.prefixes
            .iter()
            .map(|e| (PatchKind::Prefix, e))
            .chain(self.postfixes.iter().map(|e| (PatchKind::Postfix, e)))
            .chain(self.transpilers.iter().map(|e| (PatchKind::Transpiler, e)))
            .chain(self.finalizers.iter().map(|e| (PatchKind::Finalizer, e)))
    }

    /// `true` if `owner` registered at least one entry
    #[must_use]
    pub fn has_owner(&self, owner: &str) -> bool {
        self.iter().any(|(_, entry)| entry.owner == owner)
    }

    /// Serializes the set into the trampoline payload format.
    ///
    /// # Errors
    /// Returns [`crate::Error::Serialization`] if encoding fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Restores a set from its payload bytes.
    ///
    /// # Errors
    /// Returns [`crate::Error::Serialization`] if `data` is not a serialized set.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(data)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        metadata::{
            method::MethodKey,
            signatures::{SignatureParameter, TypeSignature},
            token::Token,
        },
        patch::{Callback, CallbackSignature, Priority},
        Error,
    };
    use uguid::Guid;

    fn entry(owner: &str, priority: i32, sequence_index: u32) -> PatchEntry {
        let token = Token::new(0x0600_0100 + sequence_index);
        let signature = CallbackSignature::new(
            vec![SignatureParameter::by_ref("__result", TypeSignature::I4)],
            TypeSignature::Boolean,
        );
        let callback = Callback::new(MethodKey::new(Guid::ZERO, token), token, signature);
        PatchEntry::new(owner, sequence_index, callback).with_priority(priority)
    }

    #[test]
    fn add_keeps_order() {
        let mut set = PatchSet::new();
        set.add(PatchKind::Prefix, entry("a", Priority::NORMAL, 0));
        set.add(PatchKind::Prefix, entry("b", Priority::HIGH, 1));
        set.add(PatchKind::Postfix, entry("c", Priority::NORMAL, 2));

        assert_eq!(set.prefixes[0].owner, "b");
        assert_eq!(set.entries(PatchKind::Postfix).len(), 1);
        assert_eq!(set.len(), 3);
        assert!(set.has_owner("c"));
    }

    #[test]
    fn removal() {
        let mut set = PatchSet::new();
        set.add(PatchKind::Prefix, entry("a", Priority::NORMAL, 0));
        set.add(PatchKind::Postfix, entry("a", Priority::NORMAL, 1));
        let other = entry("b", Priority::NORMAL, 2);
        let other_id = other.callback.id;
        set.add(PatchKind::Finalizer, other);

        assert_eq!(set.remove_owner("a"), 2);
        assert_eq!(set.remove_owner("a"), 0);
        assert_eq!(set.remove_callback(&other_id), 1);
        assert!(set.is_empty());
    }

    #[test]
    fn payload_round_trip() -> Result<()> {
        let mut set = PatchSet::new();
        set.add(
            PatchKind::Prefix,
            entry("a", Priority::LOW, 0).with_before(["b"]),
        );
        set.add(
            PatchKind::Transpiler,
            entry("b", Priority::HIGH, 1).with_after(["a"]),
        );

        let bytes = set.to_bytes()?;
        assert_eq!(PatchSet::from_bytes(&bytes)?, set);
        Ok(())
    }

    #[test]
    fn payload_garbage() {
        assert!(matches!(
            PatchSet::from_bytes(&[0xFF; 3]),
            Err(Error::Serialization(_))
        ));
    }
}
