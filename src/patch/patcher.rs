//! Patch and unpatch orchestration.

use std::{collections::BTreeSet, sync::Arc};

use tracing::{debug, warn};

use crate::{
    config::PatcherConfig,
    metadata::method::{MethodDescriptor, MethodKey},
    patch::{
        registry::{PatchRecord, RegistryState},
        Callback, CallbackId, CallbackSignature, MethodRuntime, PatchEntry, PatchKind,
        PatchRegistry, PatchSet, Priority, ReplacementSynthesizer, Transpiler,
    },
    trampoline::Trampoline,
    Error, Result,
};

/// Ordering options of one patch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchOptions {
    /// Priority, see [`Priority`] (default: [`Priority::NORMAL`])
    pub priority: i32,
    /// Owners whose patches of the same kind must run after this one
    pub before: BTreeSet<String>,
    /// Owners whose patches of the same kind must run before this one
    pub after: BTreeSet<String>,
}

impl Default for PatchOptions {
    fn default() -> Self {
        Self {
            priority: Priority::NORMAL,
            before: BTreeSet::new(),
            after: BTreeSet::new(),
        }
    }
}

impl PatchOptions {
    /// Creates default options
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the priority
    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Runs this patch before the patches of `owner`
    #[must_use]
    pub fn before(mut self, owner: impl Into<String>) -> Self {
        self.before.insert(owner.into());
        self
    }

    /// Runs this patch after the patches of `owner`
    #[must_use]
    pub fn after(mut self, owner: impl Into<String>) -> Self {
        self.after.insert(owner.into());
        self
    }

    fn entry(&self, owner: &str, sequence_index: u32, callback: Callback) -> PatchEntry {
        PatchEntry::new(owner, sequence_index, callback)
            .with_priority(self.priority)
            .with_before(self.before.iter().cloned())
            .with_after(self.after.iter().cloned())
    }
}

/// A callback to run as prefix, postfix or finalizer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchMethod {
    /// The callback
    pub callback: Callback,
    /// Ordering options
    pub options: PatchOptions,
}

impl PatchMethod {
    /// Wraps `callback` with default options
    #[must_use]
    pub fn new(callback: Callback) -> Self {
        PatchMethod {
            callback,
            options: PatchOptions::default(),
        }
    }

    /// Replaces the ordering options
    #[must_use]
    pub fn with_options(mut self, options: PatchOptions) -> Self {
        self.options = options;
        self
    }
}

impl From<Callback> for PatchMethod {
    fn from(callback: Callback) -> Self {
        PatchMethod::new(callback)
    }
}

/// A transform of the original's instructions.
#[derive(Debug, Clone)]
pub struct TranspilerPatch {
    /// Identity of the transform, used for ordering and removal
    pub id: CallbackId,
    /// The transform
    pub transpiler: Transpiler,
    /// Ordering options
    pub options: PatchOptions,
}

impl TranspilerPatch {
    /// Registers `transpiler` under `id` with default options
    #[must_use]
    pub fn new(id: CallbackId, transpiler: Transpiler) -> Self {
        TranspilerPatch {
            id,
            transpiler,
            options: PatchOptions::default(),
        }
    }

    /// Replaces the ordering options
    #[must_use]
    pub fn with_options(mut self, options: PatchOptions) -> Self {
        self.options = options;
        self
    }
}

/// Patches to add to one method in a single operation.
///
/// # Examples
///
/// ```rust,ignore
/// let request = PatchRequest::new()
///     .prefix(log_arguments)
///     .postfix(PatchMethod::new(double_result).with_options(PatchOptions::new().after("audit")));
/// patcher.patch(&original, request)?;
/// ```
#[derive(Debug, Clone, Default)]
pub struct PatchRequest {
    prefixes: Vec<PatchMethod>,
    postfixes: Vec<PatchMethod>,
    finalizers: Vec<PatchMethod>,
    transpilers: Vec<TranspilerPatch>,
}

impl PatchRequest {
    /// Creates an empty request
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a prefix
    #[must_use]
    pub fn prefix(mut self, patch: impl Into<PatchMethod>) -> Self {
        self.prefixes.push(patch.into());
        self
    }

    /// Adds a postfix
    #[must_use]
    pub fn postfix(mut self, patch: impl Into<PatchMethod>) -> Self {
        self.postfixes.push(patch.into());
        self
    }

    /// Adds a finalizer
    #[must_use]
    pub fn finalizer(mut self, patch: impl Into<PatchMethod>) -> Self {
        self.finalizers.push(patch.into());
        self
    }

    /// Adds a transpiler
    #[must_use]
    pub fn transpiler(mut self, patch: TranspilerPatch) -> Self {
        self.transpilers.push(patch);
        self
    }

    /// `true` if the request adds nothing
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.prefixes.is_empty()
            && self.postfixes.is_empty()
            && self.finalizers.is_empty()
            && self.transpilers.is_empty()
    }
}

/// Which patches an unpatch call removes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnpatchTarget {
    /// Every patch of every owner
    All,
    /// Every patch registered by one owner
    Owner(String),
    /// Every patch calling one callback
    Callback(CallbackId),
}

/// Applies patches on behalf of one owner.
///
/// Owners are free-form identifiers, usually the name of the plugin or mod registering the
/// patches. They are what [`PatchOptions::before`] and [`PatchOptions::after`] refer to, and
/// what [`Patcher::unpatch_all`] removes.
pub struct Patcher {
    owner: String,
    runtime: Arc<dyn MethodRuntime>,
    registry: Arc<PatchRegistry>,
    config: PatcherConfig,
}

/// The inputs of one rebuild of a replacement.
struct Rebuild<'a> {
    key: &'a MethodKey,
    descriptor: &'a MethodDescriptor,
    body: &'a [u8],
    patches: &'a PatchSet,
    entry: usize,
    first: bool,
}

impl Patcher {
    /// Creates a patcher for `owner` working on the process-wide registry
    #[must_use]
    pub fn new(owner: impl Into<String>, runtime: Arc<dyn MethodRuntime>) -> Self {
        Patcher {
            owner: owner.into(),
            runtime,
            registry: PatchRegistry::global(),
            config: PatcherConfig::default(),
        }
    }

    /// Uses `registry` instead of the process-wide one
    #[must_use]
    pub fn with_registry(mut self, registry: Arc<PatchRegistry>) -> Self {
        self.registry = registry;
        self
    }

    /// Replaces the configuration
    #[must_use]
    pub fn with_config(mut self, config: PatcherConfig) -> Self {
        self.config = config;
        self
    }

    /// The owner patches of this patcher are registered under
    #[must_use]
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// The registry this patcher works on
    #[must_use]
    pub fn registry(&self) -> &Arc<PatchRegistry> {
        &self.registry
    }

    /// Adds the patches of `request` to `original` and returns the entry point of the new
    /// replacement.
    ///
    /// The replacement is rebuilt from the original's pristine body with all patches of all
    /// owners. An empty request changes nothing and returns the current entry point.
    ///
    /// # Errors
    ///
    /// - [`crate::Error::SignatureMismatch`] if a callback does not fit the original
    /// - [`crate::Error::Runtime`] if the runtime cannot describe, provide or compile a method
    /// - [`crate::Error::FormatError`] if the entry point carries a damaged detour
    /// - [`crate::Error::TranspilerConflict`] if a transpiler id is registered by another owner
    /// - any error of decoding the original or running a transpiler
    ///
    /// On error the method keeps its previous patches. Registering a transpiler id this owner
    /// already uses replaces its transform for every method patched with it.
    pub fn patch(&self, original: &MethodKey, request: PatchRequest) -> Result<usize> {
        let mut state = self.registry.lock()?;

        if request.is_empty() {
            return match state.records.get(original) {
                Some(record) => Ok(record.replacement),
                None => self.runtime.entry_point(original),
            };
        }

        let (descriptor, body, entry, first) = match state.records.get(original) {
            Some(record) => (
                record.descriptor.clone(),
                record.pristine_body.clone(),
                record.entry,
                false,
            ),
            None => (
                self.runtime.describe(original)?,
                self.runtime.method_body(original)?,
                self.runtime.entry_point(original)?,
                true,
            ),
        };

        let mut patches = state
            .records
            .get(original)
            .map(|record| record.patches.clone())
            .unwrap_or_default();
        let mut transpilers = state.transpilers.clone();

        let callbacks = [
            (PatchKind::Prefix, request.prefixes),
            (PatchKind::Postfix, request.postfixes),
            (PatchKind::Finalizer, request.finalizers),
        ];
        for (kind, methods) in callbacks {
            for method in methods {
                let sequence = state.next_sequence();
                patches.add(kind, method.options.entry(&self.owner, sequence, method.callback));
            }
        }
        for patch in request.transpilers {
            if let Some(owner) = state.transpiler_owner(&patch.id) {
                if owner != self.owner {
                    return Err(Error::TranspilerConflict {
                        id: patch.id,
                        owner: owner.to_string(),
                    });
                }
            }
            let sequence = state.next_sequence();
            let callback = Callback::new(patch.id, patch.id.token, CallbackSignature::default());
            patches.add(
                PatchKind::Transpiler,
                patch.options.entry(&self.owner, sequence, callback),
            );
            transpilers.insert(patch.id, patch.transpiler);
        }

        let rebuild = Rebuild {
            key: original,
            descriptor: &descriptor,
            body: &body,
            patches: &patches,
            entry,
            first,
        };
        let (replacement, displaced) = self.rebuild(&rebuild, &transpilers)?;

        state.transpilers = transpilers;
        match state.records.get_mut(original) {
            Some(record) => {
                record.patches = patches;
                record.replacement = replacement;
            }
            None => {
                state.records.insert(
                    *original,
                    PatchRecord {
                        descriptor,
                        patches,
                        pristine_body: body,
                        entry,
                        displaced: displaced.unwrap_or_default(),
                        replacement,
                    },
                );
            }
        }

        debug!(
            method = %original,
            owner = %self.owner,
            replacement = format_args!("0x{replacement:x}"),
            "Patched method"
        );
        Ok(replacement)
    }

    /// Removes patches from `original` and returns how many were removed.
    ///
    /// Removing the last patch takes the detour out and restores the original entry point
    /// byte for byte. Removing nothing is not an error.
    ///
    /// # Errors
    ///
    /// - [`crate::Error::NotPatched`] if `original` has no patches
    /// - any error of rebuilding the replacement from the remaining patches
    pub fn unpatch(&self, original: &MethodKey, target: UnpatchTarget) -> Result<usize> {
        let mut state = self.registry.lock()?;
        self.unpatch_locked(&mut state, original, &target)
    }

    /// Removes every patch of this patcher's owner from every method, returning the number
    /// of patches removed.
    ///
    /// # Errors
    /// Stops at the first method that fails to rebuild, leaving later methods untouched.
    pub fn unpatch_all(&self) -> Result<usize> {
        let mut state = self.registry.lock()?;
        let methods: Vec<MethodKey> = state
            .records
            .iter()
            .filter(|(_, record)| record.patches.has_owner(&self.owner))
            .map(|(key, _)| *key)
            .collect();

        let target = UnpatchTarget::Owner(self.owner.clone());
        let mut removed = 0;
        for method in methods {
            removed += self.unpatch_locked(&mut state, &method, &target)?;
        }
        Ok(removed)
    }

    /// Patches currently applied to `original`, by all owners
    ///
    /// # Errors
    /// Returns [`crate::Error::NotPatched`] if `original` has no patches.
    pub fn patch_info(&self, original: &MethodKey) -> Result<PatchSet> {
        self.registry
            .patches(original)?
            .ok_or(Error::NotPatched(*original))
    }

    /// All methods with at least one patch, by any owner
    ///
    /// # Errors
    /// Returns [`crate::Error::LockError`] if the registry lock is poisoned.
    pub fn patched_methods(&self) -> Result<Vec<MethodKey>> {
        self.registry.patched_methods()
    }

    /// `true` if `owner` has at least one patch on any method
    ///
    /// # Errors
    /// Returns [`crate::Error::LockError`] if the registry lock is poisoned.
    pub fn has_any_patches(&self, owner: &str) -> Result<bool> {
        Ok(self
            .registry
            .lock()?
            .records
            .values()
            .any(|record| record.patches.has_owner(owner)))
    }

    fn unpatch_locked(
        &self,
        state: &mut RegistryState,
        original: &MethodKey,
        target: &UnpatchTarget,
    ) -> Result<usize> {
        let record = state
            .records
            .get(original)
            .ok_or(Error::NotPatched(*original))?;

        let mut patches = record.patches.clone();
        let removed = match target {
            UnpatchTarget::All => {
                let removed = patches.len();
                patches = PatchSet::new();
                removed
            }
            UnpatchTarget::Owner(owner) => patches.remove_owner(owner),
            UnpatchTarget::Callback(id) => patches.remove_callback(id),
        };
        if removed == 0 {
            return Ok(0);
        }

        if patches.is_empty() {
            let trampoline = Trampoline::new(self.config.target_arch()?);
            // SAFETY: the entry was handed out by the runtime, which guarantees it stays valid
            // and idle while patched. The registry lock serializes all writes to it, and
            // `displaced` is what the first install returned.
            unsafe { trampoline.remove(record.entry, &record.displaced)? };
            state.records.remove(original);
            debug!(method = %original, "Removed last patch, original restored");
        } else {
            let rebuild = Rebuild {
                key: original,
                descriptor: &record.descriptor,
                body: &record.pristine_body,
                patches: &patches,
                entry: record.entry,
                first: false,
            };
            let (replacement, _) = self.rebuild(&rebuild, &state.transpilers)?;
            if let Some(record) = state.records.get_mut(original) {
                record.patches = patches;
                record.replacement = replacement;
            }
            debug!(method = %original, removed, "Unpatched method");
        }

        state.prune_transpilers();
        Ok(removed)
    }

    /// Synthesizes, compiles and installs a replacement, returning its entry point and, on a
    /// first install, the displaced entry bytes
    fn rebuild(
        &self,
        rebuild: &Rebuild<'_>,
        transpilers: &std::collections::HashMap<CallbackId, Transpiler>,
    ) -> Result<(usize, Option<Vec<u8>>)> {
        let method = ReplacementSynthesizer::new(rebuild.descriptor, rebuild.body)
            .exception_type(self.runtime.exception_type())
            .build(rebuild.patches, transpilers)?;

        if self.config.dump_listing {
            match method.listing() {
                Ok(listing) => debug!(method = %rebuild.key, "Replacement listing:\n{listing}"),
                Err(error) => warn!(method = %rebuild.key, %error, "Replacement not listable"),
            }
        }

        let replacement = self.runtime.compile(&method)?;
        let payload = rebuild.patches.to_bytes()?;
        let trampoline = Trampoline::new(self.config.target_arch()?);

        let verify = || {
            if !self.config.verify_payload {
                return Ok(());
            }
            // SAFETY: as below, the entry now carries the detour written by `install`
            let stored = unsafe { trampoline.payload(rebuild.entry)? };
            if stored.as_deref() == Some(payload.as_slice()) {
                Ok(())
            } else {
                Err(Error::FormatError(format!(
                    "Payload of {} did not read back after install",
                    rebuild.key
                )))
            }
        };

        // SAFETY: the entry was handed out by the runtime, which guarantees it stays valid and
        // idle while patched. The registry lock serializes all writes to it, and `first` is
        // only set when the registry holds no record, so no detour of ours exists yet.
        let displaced = unsafe {
            install_checked(
                &trampoline,
                rebuild.entry,
                replacement,
                &payload,
                rebuild.first,
                verify,
            )?
        };

        Ok((replacement, displaced))
    }
}

/// Installs a detour, then runs `check` against it.
///
/// If `check` fails after a first install, the displaced bytes are written back before the
/// error is returned, so the entry is left exactly as it was found and no record is needed to
/// undo it.
///
/// # Safety
/// Same contract as [`Trampoline::install`].
unsafe fn install_checked(
    trampoline: &Trampoline,
    entry: usize,
    replacement: usize,
    payload: &[u8],
    first: bool,
    check: impl FnOnce() -> Result<()>,
) -> Result<Option<Vec<u8>>> {
    // SAFETY: forwarded from the caller
    let displaced = unsafe { trampoline.install(entry, replacement, payload, first)? };
    if let Err(error) = check() {
        if let Some(displaced) = &displaced {
            // SAFETY: forwarded from the caller, `displaced` was returned by the install above
            unsafe { trampoline.remove(entry, displaced)? };
            warn!(entry = format_args!("0x{entry:x}"), %error, "Rolled back detour");
        }
        return Err(error);
    }
    Ok(displaced)
}
