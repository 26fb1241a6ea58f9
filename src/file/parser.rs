//! Forward-only cursor over a CIL instruction stream.
//!
//! The decoder walks code one opcode and operand at a time; [`Parser`] tracks the offset of the
//! next byte so every decoded instruction knows where it started, and every read goes through
//! [`crate::file::io`] so truncated code surfaces as [`crate::Error::OutOfBounds`], which the
//! decoder reports as a malformed body.
//!
//! ```rust
//! use dotpatch::Parser;
//!
//! // ldc.i4 0x2A; ret
//! let code = [0x20, 0x2A, 0x00, 0x00, 0x00, 0x2A];
//! let mut parser = Parser::new(&code);
//!
//! assert_eq!(parser.read_le::<u8>()?, 0x20);
//! assert_eq!(parser.read_le::<i32>()?, 42);
//! assert_eq!(parser.pos(), 5);
//! assert_eq!(parser.remaining(), 1);
//! # Ok::<(), dotpatch::Error>(())
//! ```

use crate::{
    file::io::{read_le_at, CilIO},
    Result,
};

/// Cursor over borrowed code bytes.
pub struct Parser<'a> {
    code: &'a [u8],
    position: usize,
}

impl<'a> Parser<'a> {
    /// Starts at offset 0 of `code`
    #[must_use]
    pub fn new(code: &'a [u8]) -> Self {
        Parser { code, position: 0 }
    }

    /// `false` once every byte was consumed
    #[must_use]
    pub fn has_more_data(&self) -> bool {
        self.position < self.code.len()
    }

    /// Offset of the next byte to read
    #[must_use]
    pub fn pos(&self) -> usize {
        self.position
    }

    /// Bytes not consumed yet
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.code.len().saturating_sub(self.position)
    }

    /// Reads a little-endian `T` and moves past it.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if fewer than `size_of::<T>()` bytes remain, the
    /// position is left unchanged in that case.
    pub fn read_le<T: CilIO>(&mut self) -> Result<T> {
        read_le_at::<T>(self.code, &mut self.position)
    }
}
