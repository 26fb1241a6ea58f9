use bitflags::bitflags;

use crate::metadata::token::Token;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    /// Clause kind of an exception handler, ECMA-335 II.25.4.6
    pub struct ExceptionHandlerFlags: u16 {
        /// A typed exception clause
        const EXCEPTION = 0x0000;
        /// An exception filter and handler clause
        const FILTER = 0x0001;
        /// A finally clause
        const FINALLY = 0x0002;
        /// Fault clause (finally that is called on exception only)
        const FAULT = 0x0004;
    }
}

/// One clause of a method's exception handling table.
///
/// Offsets are byte offsets into the method's code. Several clauses with an identical try range
/// describe one protected region with multiple handlers, clauses of nested regions are listed
/// innermost first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExceptionHandler {
    /// Clause kind
    pub flags: ExceptionHandlerFlags,
    /// Offset in bytes of try block from start of method body
    pub try_offset: u32,
    /// Length in bytes of the try block
    pub try_length: u32,
    /// Location of the handler for this try block
    pub handler_offset: u32,
    /// Size of the handler code in bytes
    pub handler_length: u32,
    /// Caught exception type, only meaningful for [`ExceptionHandlerFlags::EXCEPTION`]
    pub class_token: Token,
    /// Offset of the filter block, only meaningful for [`ExceptionHandlerFlags::FILTER`]
    pub filter_offset: u32,
}

impl ExceptionHandler {
    /// Returns the raw value stored in the last field of a clause, which is either the class
    /// token or the filter offset depending on the clause kind.
    #[must_use]
    pub fn class_or_filter(&self) -> u32 {
        if self.flags.contains(ExceptionHandlerFlags::FILTER) {
            self.filter_offset
        } else if self.is_typed() {
            self.class_token.value()
        } else {
            0
        }
    }

    /// `true` for typed catch clauses
    #[must_use]
    pub fn is_typed(&self) -> bool {
        !self.flags.intersects(
            ExceptionHandlerFlags::FILTER
                | ExceptionHandlerFlags::FINALLY
                | ExceptionHandlerFlags::FAULT,
        )
    }

    /// End offset (exclusive) of the protected region
    #[must_use]
    pub fn try_end(&self) -> u32 {
        self.try_offset.saturating_add(self.try_length)
    }

    /// End offset (exclusive) of the handler
    #[must_use]
    pub fn handler_end(&self) -> u32 {
        self.handler_offset.saturating_add(self.handler_length)
    }
}
