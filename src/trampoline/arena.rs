//! Append-only allocator for trampoline frames.
//!
//! Frames must stay reachable for as long as any thread might still be executing the jump they
//! contain, which for a detoured method is effectively forever. The arena therefore never
//! returns memory: chunks are mapped once, handed out in bump-pointer fashion and leaked.

use std::{mem, sync::Mutex, sync::OnceLock};

use memmap2::MmapMut;
use tracing::debug;

use crate::{
    trampoline::buffer::{make_writable, ExecutableBuffer},
    Result,
};

/// Size of a freshly mapped chunk unless a single allocation needs more
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug)]
struct Chunk {
    base: usize,
    size: usize,
    used: usize,
}

impl Chunk {
    fn fit(&self, size: usize, align: usize) -> Option<usize> {
        let start = align_up(self.base + self.used, align);
        let end = start.checked_add(size)?;
        (end <= self.base + self.size).then_some(start)
    }
}

/// Process-wide pool of readable, writable and executable memory.
// TODO: reclaim frames once the method they detour is fully unpatched and no thread can be
// inside the old jump, which needs a quiescence signal from the runtime.
#[derive(Debug)]
pub struct CodeArena {
    chunk_size: usize,
    chunks: Mutex<Vec<Chunk>>,
}

impl CodeArena {
    /// Creates an empty arena mapping chunks of at least `chunk_size` bytes
    #[must_use]
    pub fn new(chunk_size: usize) -> Self {
        CodeArena {
            chunk_size: chunk_size.max(1),
            chunks: Mutex::new(Vec::new()),
        }
    }

    /// The arena shared by all trampolines of the process
    pub fn global() -> &'static CodeArena {
        static ARENA: OnceLock<CodeArena> = OnceLock::new();
        ARENA.get_or_init(|| CodeArena::new(DEFAULT_CHUNK_SIZE))
    }

    /// Allocates `size` zeroed bytes aligned to `align`, which must be a power of two.
    ///
    /// # Errors
    /// Returns [`crate::Error::Memory`] if a new chunk cannot be mapped or made executable,
    /// and [`crate::Error::LockError`] if the arena lock is poisoned.
    pub fn allocate(&self, size: usize, align: usize) -> Result<ExecutableBuffer> {
        let align = align.max(1).next_power_of_two();
        let mut chunks = lock!(self.chunks);

        let start = match chunks.last().and_then(|chunk| chunk.fit(size, align)) {
            Some(start) => start,
            None => {
                let chunk = map_chunk(self.chunk_size.max(size + align))?;
                let start = chunk
                    .fit(size, align)
                    .ok_or(out_of_bounds_error!())?;
                chunks.push(chunk);
                start
            }
        };

        let chunk = chunks.last_mut().ok_or(out_of_bounds_error!())?;
        chunk.used = start + size - chunk.base;

        // SAFETY: the range lies inside a chunk that is mapped RWX and never unmapped, and the
        // bump pointer guarantees no other allocation overlaps it
        unsafe { ExecutableBuffer::from_raw(start, size) }
    }

    /// Total bytes handed out so far
    ///
    /// # Errors
    /// Returns [`crate::Error::LockError`] if the arena lock is poisoned.
    pub fn used(&self) -> Result<usize> {
        Ok(lock!(self.chunks).iter().map(|chunk| chunk.used).sum())
    }
}

fn map_chunk(size: usize) -> Result<Chunk> {
    let mut map = MmapMut::map_anon(size)?;
    let base = map.as_mut_ptr() as usize;

    // SAFETY: the mapping was just created and covers base..base + size
    unsafe { make_writable(base, size)? };

    // The mapping is leaked on purpose, frames must outlive every caller
    mem::forget(map);

    debug!(base = format_args!("0x{base:x}"), size, "Mapped trampoline chunk");
    Ok(Chunk {
        base,
        size,
        used: 0,
    })
}

fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocations_are_aligned_and_disjoint() -> Result<()> {
        let arena = CodeArena::new(256);
        let a = arena.allocate(3, 1)?;
        let b = arena.allocate(16, 8)?;
        let c = arena.allocate(8, 16)?;

        assert_eq!(b.address() % 8, 0);
        assert_eq!(c.address() % 16, 0);
        assert!(a.address() + a.len() <= b.address());
        assert!(b.address() + b.len() <= c.address());
        Ok(())
    }

    #[test]
    fn large_allocation_gets_own_chunk() -> Result<()> {
        let arena = CodeArena::new(64);
        let small = arena.allocate(32, 8)?;
        let mut large = arena.allocate(1000, 8)?;

        large.write_u64_at(992, u64::MAX)?;
        assert_eq!(large.read_u64_at(992)?, u64::MAX);
        assert_eq!(large.read_u8_at(0)?, 0);
        assert_ne!(small.address(), large.address());
        assert_eq!(arena.used()?, 1032);
        Ok(())
    }

    #[test]
    fn global_is_shared() {
        assert!(std::ptr::eq(CodeArena::global(), CodeArena::global()));
    }
}
