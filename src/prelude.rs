//! # dotpatch Prelude
//!
//! The types needed to register and remove patches, plus the pieces of the instruction model
//! that transpilers work with.

// ================================================================================================
// Core Types and Error Handling
// ================================================================================================

/// The main error type for all dotpatch operations
pub use crate::Error;

/// The result type used throughout dotpatch
pub use crate::Result;

/// Patcher configuration
pub use crate::config::PatcherConfig;

// ================================================================================================
// Patching
// ================================================================================================

/// Patch and unpatch on behalf of one owner
pub use crate::patch::{
    PatchMethod, PatchOptions, PatchRequest, Patcher, TranspilerPatch, UnpatchTarget,
};

/// Callbacks and their ordering
pub use crate::patch::{Callback, CallbackId, CallbackSignature, PatchKind, Priority};

/// Registry state
pub use crate::patch::{PatchRecord, PatchRegistry, PatchSet};

/// Host runtime abstraction and its input
pub use crate::patch::{MethodRuntime, SynthesizedMethod};

/// Instruction transforms
pub use crate::patch::{NativeTranspiler, SimpleInstruction, SimpleTranspiler, Transpiler};

// ================================================================================================
// Instructions and Metadata
// ================================================================================================

/// Instruction model
pub use crate::assembly::{
    opcodes, CodeGenerator, CodeMatch, CodeMatcher, Instruction, Label, MemberRef, OpCode,
    Operand,
};

/// Method identity and shape
pub use crate::metadata::{
    method::{MethodDescriptor, MethodKey},
    signatures::{SignatureLocalVariable, SignatureParameter, TypeSignature},
    token::Token,
};

/// Detour target architecture
pub use crate::trampoline::Arch;
