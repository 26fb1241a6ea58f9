//! Flags of the method body header and its extra data sections.

use bitflags::bitflags;

bitflags! {
    #[derive(PartialEq)]
    /// Method body header flags, ECMA-335 II.25.4.4
    pub struct MethodBodyFlags: u16 {
        /// Tiny header, code size packed into the upper six bits of the first byte
        const TINY_FORMAT = 0x2;
        /// Fat header of three dwords
        const FAT_FORMAT = 0x3;
        /// More sections follow after the code
        const MORE_SECTS = 0x8;
        /// Locals are zero-initialized
        const INIT_LOCALS = 0x10;
    }
}

bitflags! {
    #[derive(PartialEq)]
    /// Method data section flags, ECMA-335 II.25.4.5
    pub struct SectionFlags: u8 {
        /// Exception handling data
        const EHTABLE = 0x1;
        /// Reserved, must be zero
        const OPT_ILTABLE = 0x2;
        /// Fat section with 24-byte clauses
        const FAT_FORMAT = 0x40;
        /// Another section follows
        const MORE_SECTS = 0x80;
    }
}
