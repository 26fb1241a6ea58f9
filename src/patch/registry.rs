//! Process-wide bookkeeping of patched methods.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex, MutexGuard, OnceLock},
};

use crate::{
    metadata::method::{MethodDescriptor, MethodKey},
    patch::{CallbackId, PatchKind, PatchSet, Transpiler},
    Result,
};

/// Everything known about one patched method.
#[derive(Debug, Clone)]
pub struct PatchRecord {
    /// Shape of the original
    pub descriptor: MethodDescriptor,
    /// Patches currently applied
    pub patches: PatchSet,
    /// Body of the original as captured before the first patch, every rebuild starts from it
    pub pristine_body: Vec<u8>,
    /// Compiled entry point of the original, carrying the detour
    pub entry: usize,
    /// Entry bytes overwritten by the detour
    pub displaced: Vec<u8>,
    /// Entry point of the current replacement
    pub replacement: usize,
}

#[derive(Debug, Default)]
pub(crate) struct RegistryState {
    pub(crate) records: BTreeMap<MethodKey, PatchRecord>,
    pub(crate) transpilers: HashMap<CallbackId, Transpiler>,
    next_sequence: u32,
}

impl RegistryState {
    /// Hands out the next insertion index. Indices wrap after `u32::MAX` registrations.
    pub(crate) fn next_sequence(&mut self) -> u32 {
        let sequence = self.next_sequence;
        self.next_sequence = self.next_sequence.wrapping_add(1);
        sequence
    }

    /// Owner of the first transpiler entry registered under `id`, on any method
    pub(crate) fn transpiler_owner(&self, id: &CallbackId) -> Option<&str> {
        self.records.values().find_map(|record| {
            record
                .patches
                .entries(PatchKind::Transpiler)
                .iter()
                .find(|entry| entry.callback.id == *id)
                .map(|entry| entry.owner.as_str())
        })
    }

    /// Drops transforms no record refers to anymore
    pub(crate) fn prune_transpilers(&mut self) {
        let records = &self.records;
        self.transpilers.retain(|id, _| {
            records.values().any(|record| {
                record
                    .patches
                    .entries(PatchKind::Transpiler)
                    .iter()
                    .any(|entry| entry.callback.id == *id)
            })
        });
    }
}

/// Map from original method to its patches.
///
/// All patch and unpatch operations hold the registry lock from the first lookup until the
/// entry point is written, so concurrent patchers of the same process never interleave. The
/// process-wide instance is [`PatchRegistry::global`]; separate instances exist for tests and
/// for hosts that manage isolated runtimes.
#[derive(Debug, Default)]
pub struct PatchRegistry {
    state: Mutex<RegistryState>,
}

impl PatchRegistry {
    /// Creates an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The registry shared by every [`crate::patch::Patcher`] created with
    /// [`crate::patch::Patcher::new`]
    pub fn global() -> Arc<PatchRegistry> {
        static REGISTRY: OnceLock<Arc<PatchRegistry>> = OnceLock::new();
        REGISTRY.get_or_init(|| Arc::new(PatchRegistry::new())).clone()
    }

    pub(crate) fn lock(&self) -> Result<MutexGuard<'_, RegistryState>> {
        Ok(lock!(self.state))
    }

    /// Methods with at least one patch, in key order
    ///
    /// # Errors
    /// Returns [`crate::Error::LockError`] if the registry lock is poisoned.
    pub fn patched_methods(&self) -> Result<Vec<MethodKey>> {
        Ok(self.lock()?.records.keys().copied().collect())
    }

    /// Patches applied to `method`, `None` if it is not patched
    ///
    /// # Errors
    /// Returns [`crate::Error::LockError`] if the registry lock is poisoned.
    pub fn patches(&self, method: &MethodKey) -> Result<Option<PatchSet>> {
        Ok(self
            .lock()?
            .records
            .get(method)
            .map(|record| record.patches.clone()))
    }

    /// Full record of `method`, `None` if it is not patched
    ///
    /// # Errors
    /// Returns [`crate::Error::LockError`] if the registry lock is poisoned.
    pub fn record(&self, method: &MethodKey) -> Result<Option<PatchRecord>> {
        Ok(self.lock()?.records.get(method).cloned())
    }
}
