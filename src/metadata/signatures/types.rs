//! Type shapes for original methods, callbacks and synthesized locals.
//!
//! Only the part of ECMA-335 II.23.2 that matters for argument injection and local slot
//! initialization is modelled. Tokens referenced by [`TypeSignature::Class`] and
//! [`TypeSignature::ValueType`] are resolved by the host runtime, never by this crate.

use serde::{Deserialize, Serialize};
use strum::Display;

use crate::metadata::token::Token;

/// The type of a parameter, return value or local variable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize, Display)]
pub enum TypeSignature {
    /// No value, only valid as a return type
    #[default]
    Void,
    /// `bool`
    Boolean,
    /// `char`
    Char,
    /// `sbyte`
    I1,
    /// `byte`
    U1,
    /// `short`
    I2,
    /// `ushort`
    U2,
    /// `int`
    I4,
    /// `uint`
    U4,
    /// `long`
    I8,
    /// `ulong`
    U8,
    /// `float`
    R4,
    /// `double`
    R8,
    /// `nint`
    I,
    /// `nuint`
    U,
    /// `string`
    String,
    /// `object`
    Object,
    /// A reference type
    Class(Token),
    /// A value type, initialized with `initobj`
    ValueType(Token),
    /// A single-dimensional, zero-based array
    SzArray(Box<TypeSignature>),
}

impl TypeSignature {
    /// Returns `true` for [`TypeSignature::Void`].
    #[must_use]
    pub fn is_void(&self) -> bool {
        matches!(self, TypeSignature::Void)
    }

    /// Returns `true` if values of this type are object references.
    #[must_use]
    pub fn is_reference(&self) -> bool {
        matches!(
            self,
            TypeSignature::String
                | TypeSignature::Object
                | TypeSignature::Class(_)
                | TypeSignature::SzArray(_)
        )
    }

    /// Returns `true` if a callback declaring `self` may receive a value of type `actual`.
    ///
    /// Identical types always fit. Any reference type fits a callback parameter declared as
    /// `object`, which mirrors how callbacks commonly observe instances of internal types.
    #[must_use]
    pub fn accepts(&self, actual: &TypeSignature) -> bool {
        self == actual || (matches!(self, TypeSignature::Object) && actual.is_reference())
    }
}

/// A named method or callback parameter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SignatureParameter {
    /// Declared parameter name
    pub name: String,
    /// Whether the parameter is passed by reference (`ref`/`out`)
    pub by_ref: bool,
    /// Parameter type without the by-ref qualifier
    pub base: TypeSignature,
}

impl SignatureParameter {
    /// Creates a by-value parameter.
    #[must_use]
    pub fn new(name: impl Into<String>, base: TypeSignature) -> Self {
        SignatureParameter {
            name: name.into(),
            by_ref: false,
            base,
        }
    }

    /// Creates a by-reference parameter.
    #[must_use]
    pub fn by_ref(name: impl Into<String>, base: TypeSignature) -> Self {
        SignatureParameter {
            name: name.into(),
            by_ref: true,
            base,
        }
    }
}

/// A local variable slot.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SignatureLocalVariable {
    /// The local is a managed reference
    pub is_byref: bool,
    /// The local is pinned
    pub is_pinned: bool,
    /// Base type of the local
    pub base: TypeSignature,
}

impl From<TypeSignature> for SignatureLocalVariable {
    fn from(base: TypeSignature) -> Self {
        SignatureLocalVariable {
            is_byref: false,
            is_pinned: false,
            base,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn categories() {
        assert!(TypeSignature::Void.is_void());
        assert!(TypeSignature::String.is_reference());
        assert!(TypeSignature::SzArray(Box::new(TypeSignature::I4)).is_reference());
        assert!(!TypeSignature::ValueType(Token::new(0x0200_0001)).is_reference());
        assert!(!TypeSignature::I8.is_reference());
    }

    #[test]
    fn object_accepts_references() {
        let class = TypeSignature::Class(Token::new(0x0200_0004));
        assert!(TypeSignature::Object.accepts(&class));
        assert!(TypeSignature::Object.accepts(&TypeSignature::String));
        assert!(!TypeSignature::Object.accepts(&TypeSignature::I4));
        assert!(TypeSignature::I4.accepts(&TypeSignature::I4));
        assert!(!TypeSignature::I4.accepts(&TypeSignature::U4));
    }
}
