//! Entry point detours.
//!
//! Patching a method overwrites the first bytes of its compiled code with a jump into a small
//! frame allocated from the [`CodeArena`]. The frame starts with a header that records where
//! the serialized patch set lives, followed by a second jump to the current replacement:
//!
//! ```text
//! entry:  jmp frame.jump
//!
//! frame:  [padding]
//!         "Harmony"          7 bytes
//!         payload pointer    pointer width
//!         payload length     u32
//!         jump:  jmp replacement
//! ```
//!
//! Repatching only swaps the payload and retargets the frame jump with a single aligned store,
//! so the entry point is written exactly once. The payload can be recovered from any entry
//! point, which lets the state of a patched method be inspected without the registry.
//!
//! # Key Components
//!
//! - [`Trampoline`] - installs, inspects and removes detours for one [`Arch`]
//! - [`CodeArena`] - append-only executable memory for frames
//! - [`ExecutableBuffer`] - bounds-checked access to code

mod arena;
mod buffer;
mod jump;

pub use arena::{CodeArena, DEFAULT_CHUNK_SIZE};
pub use buffer::{make_writable, ExecutableBuffer};
pub use jump::Arch;

use tracing::{debug, trace};

use crate::{Error, Result};

/// Frame signature written in front of every frame jump
pub const FRAME_MAGIC: &[u8; 7] = b"Harmony";

/// Installs detours on compiled entry points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Trampoline {
    arch: Arch,
}

/// Header fields of an installed frame.
#[derive(Debug, Clone, Copy)]
struct FrameHeader {
    /// Address of the magic
    start: usize,
    payload: usize,
    payload_len: usize,
}

impl Trampoline {
    /// Creates a trampoline writer for `arch`
    #[must_use]
    pub fn new(arch: Arch) -> Self {
        Trampoline { arch }
    }

    /// Target architecture
    #[must_use]
    pub fn arch(&self) -> Arch {
        self.arch
    }

    /// Size of the frame header: magic, payload pointer and payload length
    #[must_use]
    pub fn header_size(&self) -> usize {
        FRAME_MAGIC.len() + self.arch.pointer_width() + 4
    }

    /// Padding that puts the target field of the frame jump on its natural alignment when the
    /// frame starts on that alignment
    fn padding(&self) -> usize {
        let width = self.arch.target_width();
        let misalignment = (self.header_size() + self.arch.target_offset()) % width;
        (width - misalignment) % width
    }

    /// Detours `entry` to `replacement` and stores `payload` alongside.
    ///
    /// On the first install a frame is allocated and the entry point is overwritten; the
    /// bytes it displaced are returned so [`Trampoline::remove`] can restore them. Later
    /// installs reuse the frame found through the entry point and return `None`.
    ///
    /// # Safety
    ///
    /// `entry` must point to at least [`Arch::jump_size`] bytes of mapped code that no thread
    /// executes while it is rewritten. Unless `first` is set, the entry must carry a detour
    /// installed by this type.
    ///
    /// # Errors
    ///
    /// - [`crate::Error::AddressRangeError`] if a jump cannot reach its target
    /// - [`crate::Error::FormatError`] if a reinstall finds no intact frame
    /// - [`crate::Error::Memory`] if memory cannot be mapped or reprotected
    pub unsafe fn install(
        &self,
        entry: usize,
        replacement: usize,
        payload: &[u8],
        first: bool,
    ) -> Result<Option<Vec<u8>>> {
        let payload_len = u32::try_from(payload.len())
            .map_err(|_| Error::FormatError("Payload larger than 4 GiB".to_string()))?;
        let copy = PayloadCopy::new(payload);

        if first {
            let frame = self.write_frame(replacement, &copy, payload_len)?;
            // SAFETY: forwarded from the caller
            let displaced = unsafe { self.write_entry(entry, frame)? };
            debug!(
                arch = %self.arch,
                entry = format_args!("0x{entry:x}"),
                frame = format_args!("0x{frame:x}"),
                replacement = format_args!("0x{replacement:x}"),
                "Installed detour"
            );
            copy.leak();
            return Ok(Some(displaced));
        }

        // SAFETY: forwarded from the caller
        let (header, jump) = unsafe { self.frame(entry)? }
            .ok_or_else(|| Error::FormatError(format!("No detour at entry 0x{entry:x}")))?;

        // Everything fallible happens before the header points at the new copy
        let target = self.arch.target_field(jump, replacement)?;
        // SAFETY: the header lies in arena memory written by `write_frame`
        let mut frame = unsafe {
            ExecutableBuffer::from_raw(header.start, self.header_size() + self.arch.jump_size())?
        };
        let width = self.arch.pointer_width();
        let magic = FRAME_MAGIC.len();
        self.write_pointer(&mut frame, magic, copy.address())?;
        frame.write_u32_at(magic + width, payload_len)?;

        let field = self.header_size() + self.arch.target_offset();
        match self.arch.target_width() {
            // The X86 field holds a rel32, range checked by target_field
            #[allow(clippy::cast_possible_truncation)]
            4 => frame.store_u32_at(field, target as u32)?,
            _ => frame.store_u64_at(field, target)?,
        }
        frame.flush();

        // SAFETY: the old payload was leaked by a previous install and is no longer referenced
        unsafe { PayloadCopy::free(header.payload, header.payload_len) };
        copy.leak();

        trace!(
            entry = format_args!("0x{entry:x}"),
            replacement = format_args!("0x{replacement:x}"),
            payload_len,
            "Retargeted detour"
        );
        Ok(None)
    }

    /// Reads the payload stored with the detour at `entry`.
    ///
    /// Returns `None` if the entry does not start with a jump.
    ///
    /// # Safety
    ///
    /// `entry` must point to at least [`Arch::jump_size`] bytes of mapped code. If it starts
    /// with a jump, the memory in front of the jump target must be mapped.
    ///
    /// # Errors
    /// Returns [`crate::Error::FormatError`] if the jump leads to a region without a frame.
    pub unsafe fn payload(&self, entry: usize) -> Result<Option<Vec<u8>>> {
        // SAFETY: forwarded from the caller
        let Some((header, _)) = (unsafe { self.frame(entry)? }) else {
            return Ok(None);
        };
        if header.payload_len == 0 {
            return Ok(Some(Vec::new()));
        }
        // SAFETY: the payload was leaked by `install` and is only freed under the same
        // exclusive access that calls this method
        let copy = unsafe { ExecutableBuffer::from_raw(header.payload, header.payload_len)? };
        Ok(Some(copy.read_bytes_at(0, header.payload_len)?))
    }

    /// Removes the detour at `entry` by writing back the bytes it displaced.
    ///
    /// The frame stays allocated, but its magic is cleared and its payload freed.
    ///
    /// # Safety
    ///
    /// Same as [`Trampoline::install`]. `displaced` must be the value returned by the first
    /// install on this entry.
    ///
    /// # Errors
    /// Returns [`crate::Error::FormatError`] if the entry carries no intact detour or
    /// `displaced` has the wrong length.
    pub unsafe fn remove(&self, entry: usize, displaced: &[u8]) -> Result<()> {
        if displaced.len() != self.arch.jump_size() {
            return Err(Error::FormatError(format!(
                "Expected {} displaced bytes, got {}",
                self.arch.jump_size(),
                displaced.len()
            )));
        }

        // SAFETY: forwarded from the caller
        let (header, _) = unsafe { self.frame(entry)? }
            .ok_or_else(|| Error::FormatError(format!("No detour at entry 0x{entry:x}")))?;

        // SAFETY: forwarded from the caller
        unsafe { make_writable(entry, displaced.len())? };
        // SAFETY: forwarded from the caller
        let mut code = unsafe { ExecutableBuffer::from_raw(entry, displaced.len())? };
        code.write_bytes_at(0, displaced)?;
        code.flush();

        // SAFETY: the header lies in arena memory written by `write_frame`
        let mut frame = unsafe { ExecutableBuffer::from_raw(header.start, self.header_size())? };
        frame.write_bytes_at(0, &[0; 7])?;
        self.write_pointer(&mut frame, FRAME_MAGIC.len(), 0)?;
        frame.write_u32_at(FRAME_MAGIC.len() + self.arch.pointer_width(), 0)?;

        // SAFETY: the entry no longer leads to the frame, nothing references the payload
        unsafe { PayloadCopy::free(header.payload, header.payload_len) };

        debug!(entry = format_args!("0x{entry:x}"), "Removed detour");
        Ok(())
    }

    /// Allocates and fills a frame, returning the address of its jump
    fn write_frame(
        &self,
        replacement: usize,
        copy: &PayloadCopy,
        payload_len: u32,
    ) -> Result<usize> {
        let padding = self.padding();
        let size = padding + self.header_size() + self.arch.jump_size();
        let mut region = CodeArena::global().allocate(size, self.arch.target_width())?;

        let magic = padding;
        let pointer = magic + FRAME_MAGIC.len();
        let length = pointer + self.arch.pointer_width();
        let jump = length + 4;

        region.write_bytes_at(magic, FRAME_MAGIC)?;
        self.write_pointer(&mut region, pointer, copy.address())?;
        region.write_u32_at(length, payload_len)?;

        let jump_address = region.address() + jump;
        region.write_bytes_at(jump, &self.arch.encode_jump(jump_address, replacement)?)?;
        region.flush();
        Ok(jump_address)
    }

    /// Points `entry` at `frame`, returning the overwritten bytes
    unsafe fn write_entry(&self, entry: usize, frame: usize) -> Result<Vec<u8>> {
        // Build the jump first, a range error must leave the entry untouched
        let jump = self.arch.encode_jump(entry, frame)?;

        // SAFETY: forwarded from the caller
        unsafe { make_writable(entry, jump.len())? };
        // SAFETY: forwarded from the caller
        let mut code = unsafe { ExecutableBuffer::from_raw(entry, jump.len())? };
        let displaced = code.read_bytes_at(0, jump.len())?;
        code.write_bytes_at(0, &jump)?;
        code.flush();
        Ok(displaced)
    }

    /// Follows the jump at `entry` and validates the frame header in front of its target.
    unsafe fn frame(&self, entry: usize) -> Result<Option<(FrameHeader, usize)>> {
        // SAFETY: forwarded from the caller
        let code = unsafe { ExecutableBuffer::from_raw(entry, self.arch.jump_size())? };
        let bytes = code.read_bytes_at(0, self.arch.jump_size())?;
        let Some(jump) = self.arch.decode_jump(&bytes, entry) else {
            return Ok(None);
        };

        let start = jump
            .checked_sub(self.header_size())
            .ok_or_else(|| Error::FormatError(format!("Jump target 0x{jump:x} has no frame")))?;
        // SAFETY: the caller guarantees the memory in front of the jump target is mapped
        let header = unsafe { ExecutableBuffer::from_raw(start, self.header_size())? };
        if header.read_bytes_at(0, FRAME_MAGIC.len())? != FRAME_MAGIC {
            return Err(Error::FormatError(format!(
                "Jump target 0x{jump:x} is not preceded by a frame header"
            )));
        }

        let width = self.arch.pointer_width();
        let payload = match width {
            4 => header.read_u32_at(FRAME_MAGIC.len())? as usize,
            _ => usize::try_from(header.read_u64_at(FRAME_MAGIC.len())?)
                .map_err(|_| Error::FormatError("Payload pointer out of range".to_string()))?,
        };
        let payload_len = header.read_u32_at(FRAME_MAGIC.len() + width)? as usize;

        Ok(Some((
            FrameHeader {
                start,
                payload,
                payload_len,
            },
            jump,
        )))
    }

    fn write_pointer(
        &self,
        frame: &mut ExecutableBuffer,
        offset: usize,
        value: usize,
    ) -> Result<()> {
        match self.arch.pointer_width() {
            4 => {
                let value = u32::try_from(value).map_err(|_| Error::AddressRangeError {
                    from: frame.address() + offset,
                    to: value,
                })?;
                frame.write_u32_at(offset, value)
            }
            _ => frame.write_u64_at(offset, value as u64),
        }
    }
}

/// A heap copy of a payload whose ownership moves into a frame header.
struct PayloadCopy {
    data: Box<[u8]>,
}

impl PayloadCopy {
    fn new(payload: &[u8]) -> Self {
        PayloadCopy {
            data: payload.into(),
        }
    }

    fn address(&self) -> usize {
        if self.data.is_empty() {
            0
        } else {
            self.data.as_ptr() as usize
        }
    }

    /// Hands the allocation over to the frame header
    fn leak(self) {
        let _ = Box::into_raw(self.data);
    }

    /// Frees a copy previously handed over with [`PayloadCopy::leak`].
    unsafe fn free(address: usize, len: usize) {
        if address == 0 || len == 0 {
            return;
        }
        let slice = std::ptr::slice_from_raw_parts_mut(address as *mut u8, len);
        // SAFETY: the caller guarantees the pointer came from `leak` with this length
        drop(unsafe { Box::from_raw(slice) });
    }
}

#[cfg(test)]
mod tests {
    use strum::IntoEnumIterator;

    use super::*;

    /// `mov eax, 1; ret` followed by padding
    const ORIGINAL: [u8; 6] = [0xB8, 0x01, 0x00, 0x00, 0x00, 0xC3];

    fn method_stub() -> Result<ExecutableBuffer> {
        let mut code = CodeArena::global().allocate(32, 16)?;
        code.write_bytes_at(0, &ORIGINAL)?;
        Ok(code)
    }

    #[test]
    fn frame_alignment() {
        for arch in Arch::iter() {
            let trampoline = Trampoline::new(arch);
            let field = trampoline.padding() + trampoline.header_size() + arch.target_offset();
            assert_eq!(field % arch.target_width(), 0, "{arch}");
        }
        assert_eq!(Trampoline::new(Arch::X64).header_size(), 19);
        assert_eq!(Trampoline::new(Arch::X86).header_size(), 15);
    }

    #[test]
    fn install_reinstall_remove() -> Result<()> {
        let trampoline = Trampoline::new(Arch::X64);
        let code = method_stub()?;
        let entry = code.address();

        assert_eq!(unsafe { trampoline.payload(entry)? }, None);

        let displaced = unsafe { trampoline.install(entry, 0x1111_0000, b"first", true)? };
        let displaced = displaced.ok_or(Error::NotSupported)?;
        assert_eq!(&displaced[..6], &ORIGINAL);
        assert_eq!(unsafe { trampoline.payload(entry)? }, Some(b"first".to_vec()));

        let frame_jump = Arch::X64
            .decode_jump(&code.read_bytes_at(0, 12)?, entry)
            .ok_or(Error::NotSupported)?;
        let frame = unsafe { ExecutableBuffer::from_raw(frame_jump, 12)? };
        assert_eq!(
            Arch::X64.decode_jump(&frame.read_bytes_at(0, 12)?, frame_jump),
            Some(0x1111_0000)
        );

        let entry_bytes = code.read_bytes_at(0, 12)?;
        let again = unsafe { trampoline.install(entry, 0x2222_0000, b"second payload", false)? };
        assert!(again.is_none());
        assert_eq!(code.read_bytes_at(0, 12)?, entry_bytes);
        assert_eq!(
            unsafe { trampoline.payload(entry)? },
            Some(b"second payload".to_vec())
        );
        assert_eq!(
            Arch::X64.decode_jump(&frame.read_bytes_at(0, 12)?, frame_jump),
            Some(0x2222_0000)
        );

        unsafe { trampoline.remove(entry, &displaced)? };
        assert_eq!(code.read_bytes_at(0, 6)?, ORIGINAL.to_vec());
        assert_eq!(unsafe { trampoline.payload(entry)? }, None);
        Ok(())
    }

    #[test]
    fn arm64_frames() -> Result<()> {
        let trampoline = Trampoline::new(Arch::Arm64);
        let code = method_stub()?;
        let entry = code.address();

        unsafe { trampoline.install(entry, 0x4000, &[1, 2, 3], true)? };
        unsafe { trampoline.install(entry, 0x8000, &[4], false)? };
        assert_eq!(unsafe { trampoline.payload(entry)? }, Some(vec![4]));
        Ok(())
    }

    #[test]
    fn foreign_jump_is_format_error() -> Result<()> {
        let trampoline = Trampoline::new(Arch::X64);
        let mut code = method_stub()?;
        let mut target = CodeArena::global().allocate(64, 8)?;
        target.write_bytes_at(0, &[0xCC; 64])?;

        let jump = Arch::X64.encode_jump(code.address(), target.address() + 32)?;
        code.write_bytes_at(0, &jump)?;

        assert!(matches!(
            unsafe { trampoline.payload(code.address()) },
            Err(Error::FormatError(_))
        ));
        assert!(matches!(
            unsafe { trampoline.install(code.address(), 0x1000, &[], false) },
            Err(Error::FormatError(_))
        ));
        Ok(())
    }

    #[test]
    fn reinstall_without_detour() -> Result<()> {
        let trampoline = Trampoline::new(Arch::X64);
        let code = method_stub()?;
        assert!(matches!(
            unsafe { trampoline.install(code.address(), 0x1000, &[1], false) },
            Err(Error::FormatError(_))
        ));
        assert!(matches!(
            unsafe { trampoline.remove(code.address(), &[0; 12]) },
            Err(Error::FormatError(_))
        ));
        assert!(matches!(
            unsafe { trampoline.remove(code.address(), &[0; 3]) },
            Err(Error::FormatError(_))
        ));
        Ok(())
    }

    #[test]
    #[cfg(all(target_arch = "x86_64", target_os = "linux"))]
    fn detour_executes() -> Result<()> {
        let trampoline = Trampoline::new(Arch::X64);
        let original = method_stub()?;
        let mut replacement = CodeArena::global().allocate(16, 16)?;
        // mov eax, 2; ret
        replacement.write_bytes_at(0, &[0xB8, 0x02, 0x00, 0x00, 0x00, 0xC3])?;

        // SAFETY: both regions hold complete functions with the C ABI
        let call = |address: usize| -> u32 {
            let function: extern "C" fn() -> u32 = unsafe { std::mem::transmute(address) };
            function()
        };

        assert_eq!(call(original.address()), 1);
        let displaced = unsafe {
            trampoline.install(original.address(), replacement.address(), &[], true)?
        };
        assert_eq!(call(original.address()), 2);

        unsafe { trampoline.remove(original.address(), &displaced.unwrap_or_default())? };
        assert_eq!(call(original.address()), 1);
        Ok(())
    }
}
