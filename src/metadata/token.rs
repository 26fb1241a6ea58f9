//! Metadata tokens as they appear in CIL operands.
//!
//! ```rust
//! use dotpatch::metadata::token::Token;
//!
//! let token = Token::new(0x0600_0012);
//! assert_eq!(token.table(), Token::TABLE_METHOD_DEF);
//! assert_eq!(token.row(), 0x12);
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

/// A 32-bit metadata token as it appears in CIL operands.
///
/// The top byte selects the table (`0x06` for `MethodDef`, `0x0A` for `MemberRef`, `0x70` for
/// user strings), the remaining 24 bits are the row.
///
/// Method identities in the patch registry are built from the defining module and the
/// `MethodDef` token, since both are stable for the lifetime of the process while compiled code
/// addresses are not.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Token(pub u32);

impl Token {
    /// `MethodDef` table identifier
    pub const TABLE_METHOD_DEF: u8 = 0x06;
    /// `MemberRef` table identifier
    pub const TABLE_MEMBER_REF: u8 = 0x0A;
    /// `TypeRef` table identifier
    pub const TABLE_TYPE_REF: u8 = 0x01;
    /// `TypeDef` table identifier
    pub const TABLE_TYPE_DEF: u8 = 0x02;
    /// User string heap identifier
    pub const TABLE_USER_STRING: u8 = 0x70;

    /// Wraps a raw operand value
    #[must_use]
    pub const fn new(value: u32) -> Self {
        Token(value)
    }

    /// Creates a token from a table identifier and a row index
    #[must_use]
    pub const fn from_parts(table: u8, row: u32) -> Self {
        Token(((table as u32) << 24) | (row & 0x00FF_FFFF))
    }

    /// The raw operand value
    #[must_use]
    pub fn value(&self) -> u32 {
        self.0
    }

    /// Table identifier, see the `TABLE_*` constants
    #[must_use]
    pub fn table(&self) -> u8 {
        (self.0 >> 24) as u8
    }

    /// One-based row, `0` for a nil reference
    #[must_use]
    pub fn row(&self) -> u32 {
        self.0 & 0x00FF_FFFF
    }

    /// `true` for the all-zero token used where no class or type is referenced
    #[must_use]
    pub fn is_null(&self) -> bool {
        self.0 == 0
    }
}

impl From<u32> for Token {
    fn from(value: u32) -> Self {
        Token(value)
    }
}

impl From<Token> for u32 {
    fn from(token: Token) -> Self {
        token.0
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Token({:02x}:{})", self.table(), self.row())
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08x}", self.0)
    }
}
