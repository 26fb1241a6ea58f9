//! Absolute and relative jump sequences per architecture.

use strum::{Display, EnumIter, EnumString};

use crate::{Error, Result};

/// `ldr x16, #8`
const ARM64_LDR_X16: u32 = 0x5800_0050;
/// `br x16`
const ARM64_BR_X16: u32 = 0xD61F_0200;

/// Instruction set of the code being patched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter, EnumString)]
pub enum Arch {
    /// 32-bit x86, `jmp rel32`
    #[strum(serialize = "x86")]
    X86,
    /// x86-64, `mov rax, imm64; jmp rax`
    #[strum(serialize = "x64")]
    X64,
    /// AArch64, `ldr x16, #8; br x16; .quad target`
    #[strum(serialize = "arm64")]
    Arm64,
}

impl Arch {
    /// The architecture this crate was compiled for, if jumps can be encoded for it
    #[must_use]
    pub fn host() -> Option<Arch> {
        if cfg!(target_arch = "x86_64") {
            Some(Arch::X64)
        } else if cfg!(target_arch = "x86") {
            Some(Arch::X86)
        } else if cfg!(target_arch = "aarch64") {
            Some(Arch::Arm64)
        } else {
            None
        }
    }

    /// Length in bytes of the jump sequence
    #[must_use]
    pub fn jump_size(self) -> usize {
        match self {
            Arch::X86 => 5,
            Arch::X64 => 12,
            Arch::Arm64 => 16,
        }
    }

    /// Size in bytes of a code pointer
    #[must_use]
    pub fn pointer_width(self) -> usize {
        match self {
            Arch::X86 => 4,
            Arch::X64 | Arch::Arm64 => 8,
        }
    }

    /// Offset of the target field within the jump sequence
    #[must_use]
    pub fn target_offset(self) -> usize {
        match self {
            Arch::X86 => 1,
            Arch::X64 => 2,
            Arch::Arm64 => 8,
        }
    }

    /// Size of the target field, which is also the alignment it needs for an atomic store
    #[must_use]
    pub fn target_width(self) -> usize {
        match self {
            Arch::X86 => 4,
            Arch::X64 | Arch::Arm64 => 8,
        }
    }

    /// Value of the target field of a jump at `from` reaching `to`.
    ///
    /// # Errors
    /// Returns [`crate::Error::AddressRangeError`] if the displacement does not fit.
    pub fn target_field(self, from: usize, to: usize) -> Result<u64> {
        match self {
            Arch::X86 => {
                let next = from
                    .checked_add(self.jump_size())
                    .ok_or(Error::AddressRangeError { from, to })?;
                let displacement = i64::try_from(to)
                    .ok()
                    .zip(i64::try_from(next).ok())
                    .map(|(to, next)| to - next)
                    .and_then(|rel| i32::try_from(rel).ok())
                    .ok_or(Error::AddressRangeError { from, to })?;
                // Stored as the raw two's complement bits
                #[allow(clippy::cast_sign_loss)]
                Ok(u64::from(displacement as u32))
            }
            Arch::X64 | Arch::Arm64 => Ok(to as u64),
        }
    }

    /// Encodes a jump located at `from` that transfers control to `to`.
    ///
    /// # Errors
    /// Returns [`crate::Error::AddressRangeError`] if the displacement does not fit.
    pub fn encode_jump(self, from: usize, to: usize) -> Result<Vec<u8>> {
        let target = self.target_field(from, to)?;
        let mut code = Vec::with_capacity(self.jump_size());
        match self {
            Arch::X86 => {
                code.push(0xE9);
                // The field was range checked above
                #[allow(clippy::cast_possible_truncation)]
                code.extend_from_slice(&(target as u32).to_le_bytes());
            }
            Arch::X64 => {
                code.extend_from_slice(&[0x48, 0xB8]);
                code.extend_from_slice(&target.to_le_bytes());
                code.extend_from_slice(&[0xFF, 0xE0]);
            }
            Arch::Arm64 => {
                code.extend_from_slice(&ARM64_LDR_X16.to_le_bytes());
                code.extend_from_slice(&ARM64_BR_X16.to_le_bytes());
                code.extend_from_slice(&target.to_le_bytes());
            }
        }
        Ok(code)
    }

    /// Decodes a jump written by [`Arch::encode_jump`] at `from`, returning its destination.
    ///
    /// Returns `None` if `code` does not start with this architecture's jump sequence.
    #[must_use]
    pub fn decode_jump(self, code: &[u8], from: usize) -> Option<usize> {
        let code = code.get(..self.jump_size())?;
        match self {
            Arch::X86 => {
                if code[0] != 0xE9 {
                    return None;
                }
                let rel = i32::from_le_bytes(code[1..5].try_into().ok()?);
                let next = from.checked_add(self.jump_size())?;
                next.checked_add_signed(isize::try_from(rel).ok()?)
            }
            Arch::X64 => {
                if code[..2] != [0x48, 0xB8] || code[10..12] != [0xFF, 0xE0] {
                    return None;
                }
                usize::try_from(u64::from_le_bytes(code[2..10].try_into().ok()?)).ok()
            }
            Arch::Arm64 => {
                let ldr = u32::from_le_bytes(code[0..4].try_into().ok()?);
                let br = u32::from_le_bytes(code[4..8].try_into().ok()?);
                if ldr != ARM64_LDR_X16 || br != ARM64_BR_X16 {
                    return None;
                }
                usize::try_from(u64::from_le_bytes(code[8..16].try_into().ok()?)).ok()
            }
        }
    }
}
