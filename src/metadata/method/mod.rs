//! Method identity, shape and body layout.
//!
//! # Key Types
//! - [`MethodKey`] - stable identity of a method, used as the patch registry key
//! - [`MethodDescriptor`] - signature, parameter names and locals of a method
//! - [`MethodBody`] - header and exception table of a method body
//! - [`ExceptionHandler`] - one exception handling clause

mod body;
mod exceptions;
mod types;

use std::fmt;

use serde::{Deserialize, Serialize};
use uguid::Guid;

pub use body::*;
pub use exceptions::*;
pub use types::*;

use crate::metadata::{
    signatures::{SignatureLocalVariable, SignatureParameter, TypeSignature},
    token::Token,
};

/// Identity of a method that stays valid for the lifetime of the process.
///
/// Compiled code can move when the runtime re-JITs a method, so patches are never keyed by
/// an address. The defining module is identified by its MVID, the method by its `MethodDef`
/// token within that module.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MethodKey {
    /// Module version id of the defining module
    pub module: Guid,
    /// `MethodDef` token within the module
    pub token: Token,
}

impl MethodKey {
    /// Creates a new key
    #[must_use]
    pub const fn new(module: Guid, token: Token) -> Self {
        MethodKey { module, token }
    }
}

impl fmt::Debug for MethodKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MethodKey({}, {})", self.module, self.token)
    }
}

impl fmt::Display for MethodKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.module, self.token)
    }
}

/// The shape of a method as far as patching is concerned.
///
/// Provided by the host runtime for original methods. The synthesizer uses it to match callback
/// parameters by name and to lay out the locals of the replacement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodDescriptor {
    /// Identity of the method
    pub key: MethodKey,
    /// Simple name, used in diagnostics and as the name of the replacement
    pub name: String,
    /// Instance method with an implicit `this` argument at index 0
    pub has_this: bool,
    /// Declared parameters, excluding `this`
    pub params: Vec<SignatureParameter>,
    /// Return type
    pub return_type: TypeSignature,
    /// Locals declared by the body
    pub locals: Vec<SignatureLocalVariable>,
}

impl MethodDescriptor {
    /// Argument index of the declared parameter at `param`, accounting for `this`
    #[must_use]
    pub fn argument_index(&self, param: usize) -> u16 {
        // Parameter counts are bounded by the u16 argument encoding of CIL
        #[allow(clippy::cast_possible_truncation)]
        let index = (param + usize::from(self.has_this)) as u16;
        index
    }

    /// Finds a declared parameter by name
    #[must_use]
    pub fn param(&self, name: &str) -> Option<(usize, &SignatureParameter)> {
        self.params
            .iter()
            .enumerate()
            .find(|(_, param)| param.name == name)
    }
}
