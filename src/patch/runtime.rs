//! The host runtime seam.
//!
//! Describing methods, handing out their IL and compiling new code belongs to the runtime that
//! hosts the patched process. The patcher only talks to it through [`MethodRuntime`].

use crate::{
    metadata::{
        method::{MethodDescriptor, MethodKey},
        token::Token,
    },
    patch::SynthesizedMethod,
    Result,
};

/// Access to the runtime that owns the methods being patched.
///
/// # Safety
///
/// The patcher writes machine code through the addresses this trait returns. Implementors
/// guarantee that:
///
/// - [`MethodRuntime::entry_point`] returns the address of compiled code for `method` that
///   stays valid for the lifetime of the process, is at least 16 bytes long, and is not
///   executed by another thread while it is being patched
/// - [`MethodRuntime::compile`] returns the address of executable code implementing the given
///   method that stays valid for the lifetime of the process
pub unsafe trait MethodRuntime: Send + Sync {
    /// Shape of `method`.
    ///
    /// # Errors
    /// Returns [`crate::Error::Runtime`] if the method is unknown.
    fn describe(&self, method: &MethodKey) -> Result<MethodDescriptor>;

    /// Raw body of `method`, header and exception sections included.
    ///
    /// # Errors
    /// Returns [`crate::Error::Runtime`] if the method has no IL body.
    fn method_body(&self, method: &MethodKey) -> Result<Vec<u8>>;

    /// Address of the compiled code of `method`, compiling it first if needed.
    ///
    /// # Errors
    /// Returns [`crate::Error::Runtime`] if no compiled form can be produced or located.
    fn entry_point(&self, method: &MethodKey) -> Result<usize>;

    /// Compiles a replacement and returns the address of its code.
    ///
    /// # Errors
    /// Returns [`crate::Error::Runtime`] if the runtime rejects the method.
    fn compile(&self, method: &SynthesizedMethod) -> Result<usize>;

    /// `TypeRef` or `TypeDef` token of the root exception type, used to catch everything in
    /// replacements with finalizers
    fn exception_type(&self) -> Token;
}
