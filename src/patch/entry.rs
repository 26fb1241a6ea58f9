//! Patch entries and the callbacks they carry.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter};

use crate::metadata::{
    method::MethodKey,
    signatures::{SignatureParameter, TypeSignature},
    token::Token,
};

/// Well-known patch priorities. Higher values run earlier.
pub struct Priority;

impl Priority {
    /// Runs after everything else
    pub const LAST: i32 = 0;
    /// Very low priority
    pub const VERY_LOW: i32 = 100;
    /// Low priority
    pub const LOW: i32 = 200;
    /// Slightly below normal
    pub const LOWER_THAN_NORMAL: i32 = 300;
    /// Default priority
    pub const NORMAL: i32 = 400;
    /// Slightly above normal
    pub const HIGHER_THAN_NORMAL: i32 = 500;
    /// High priority
    pub const HIGH: i32 = 600;
    /// Very high priority
    pub const VERY_HIGH: i32 = 700;
    /// Runs before everything else
    pub const FIRST: i32 = 800;
}

/// The role a callback plays in the replacement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter, Serialize, Deserialize)]
pub enum PatchKind {
    /// Runs before the original and may skip it
    Prefix,
    /// Runs after the original
    Postfix,
    /// Rewrites the instructions of the original
    Transpiler,
    /// Runs last, even if the original threw
    Finalizer,
}

/// Opaque identity of a callback method.
///
/// Callbacks are methods like any other, so they are identified the same way as originals.
pub type CallbackId = MethodKey;

/// The declared shape of a callback, used to decide which values are injected into it.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CallbackSignature {
    /// Declared parameters in call order
    pub params: Vec<SignatureParameter>,
    /// Declared return type
    pub return_type: TypeSignature,
}

impl CallbackSignature {
    /// Creates a signature
    #[must_use]
    pub fn new(params: Vec<SignatureParameter>, return_type: TypeSignature) -> Self {
        CallbackSignature {
            params,
            return_type,
        }
    }
}

/// A user method to be called from a replacement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Callback {
    /// Identity, used to unpatch a single callback
    pub id: CallbackId,
    /// Token emitted as the operand of `call`
    pub token: Token,
    /// Declared parameters and return type
    pub signature: CallbackSignature,
}

impl Callback {
    /// Creates a callback called through `token`
    #[must_use]
    pub fn new(id: CallbackId, token: Token, signature: CallbackSignature) -> Self {
        Callback {
            id,
            token,
            signature,
        }
    }
}

/// One registered patch.
///
/// Entries are immutable once inserted into a [`crate::patch::PatchSet`]; `sequence_index` is
/// assigned at insertion and never reused, so it breaks every remaining tie.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchEntry {
    /// Name of the party that registered the patch
    pub owner: String,
    /// Execution priority, see [`Priority`]
    pub priority: i32,
    /// Owners whose patches must run after this one
    pub before: BTreeSet<String>,
    /// Owners whose patches must run before this one
    pub after: BTreeSet<String>,
    /// Insertion order
    pub sequence_index: u32,
    /// The method to call
    pub callback: Callback,
}

impl PatchEntry {
    /// Creates an entry with normal priority and no ordering constraints
    #[must_use]
    pub fn new(owner: impl Into<String>, sequence_index: u32, callback: Callback) -> Self {
        PatchEntry {
            owner: owner.into(),
            priority: Priority::NORMAL,
            before: BTreeSet::new(),
            after: BTreeSet::new(),
            sequence_index,
            callback,
        }
    }

    /// Sets the priority
    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Adds owners that must run after this entry
    #[must_use]
    pub fn with_before<I, S>(mut self, owners: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.before.extend(owners.into_iter().map(Into::into));
        self
    }

    /// Adds owners that must run before this entry
    #[must_use]
    pub fn with_after<I, S>(mut self, owners: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.after.extend(owners.into_iter().map(Into::into));
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uguid::Guid;

    #[test]
    fn defaults() {
        let callback = Callback::new(
            MethodKey::new(Guid::ZERO, Token::new(0x0600_0002)),
            Token::new(0x0600_0002),
            CallbackSignature::default(),
        );
        let entry = PatchEntry::new("owner", 3, callback)
            .with_before(["a"])
            .with_after(["b", "c"]);

        assert_eq!(entry.priority, Priority::NORMAL);
        assert_eq!(entry.sequence_index, 3);
        assert!(entry.before.contains("a"));
        assert_eq!(entry.after.len(), 2);
    }

    #[test]
    fn kind_names() {
        assert_eq!(PatchKind::Prefix.to_string(), "Prefix");
        assert_eq!(PatchKind::Finalizer.to_string(), "Finalizer");
    }
}
