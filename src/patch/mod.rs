//! Patch bookkeeping and replacement synthesis.
//!
//! A patched method is described by its [`PatchSet`]: the prefixes, postfixes, finalizers and
//! transpilers registered against it by any number of owners, each list kept in execution
//! order. Every change to the set rebuilds the replacement from the pristine body of the
//! original and retargets the method's trampoline at it.
//!
//! # Key Components
//!
//! - [`Patcher`] - patch and unpatch on behalf of one owner
//! - [`PatchRegistry`] - every patched method and its current state
//! - [`ReplacementSynthesizer`] - builds the replacement body from a [`PatchSet`]
//! - [`TransformChain`] - runs transpilers over the original's instructions
//! - [`MethodRuntime`] - what the host runtime has to provide
//!
//! # Ordering
//!
//! Within one kind, patches run by descending [`Priority`], then by registration order.
//! [`PatchOptions::before`] and [`PatchOptions::after`] add constraints between owners, see
//! [`ordering::sort`].
//!
//! # Usage Examples
//!
//! ```rust,ignore
//! use dotpatch::patch::{Callback, PatchMethod, PatchOptions, PatchRequest, Patcher, Priority};
//!
//! let patcher = Patcher::new("com.example.audit", runtime.clone());
//! let log_call = Callback::new(log_call_key, log_call_token, log_call_signature);
//! let first = PatchOptions::new().with_priority(Priority::FIRST);
//! let request = PatchRequest::new().prefix(PatchMethod::new(log_call).with_options(first));
//! let replacement = patcher.patch(&original, request)?;
//! ```

mod entry;
pub mod ordering;
mod patcher;
pub(crate) mod registry;
mod runtime;
mod set;
mod synthesizer;
mod transform;

pub use entry::{Callback, CallbackId, CallbackSignature, PatchEntry, PatchKind, Priority};
pub use patcher::{
    PatchMethod, PatchOptions, PatchRequest, Patcher, TranspilerPatch, UnpatchTarget,
};
pub use registry::{PatchRecord, PatchRegistry};
pub use runtime::MethodRuntime;
pub use set::PatchSet;
pub use synthesizer::{ReplacementSynthesizer, SynthesizedMethod};
pub use transform::{
    normalize, NativeTranspiler, SimpleInstruction, SimpleTranspiler, TransformChain, Transpiler,
};
