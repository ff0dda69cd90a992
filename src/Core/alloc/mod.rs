// Boundary-tag, first-fit heap living inside the arena.
//
// Block layout (offsets are arena-relative, `bp` is the payload offset):
//
//   bp - 4            header  (size | allocated)
//   bp .. bp+size-8   payload
//   bp + size - 8     footer  (same word as the header)
//
// Heap image right after formatting:
//
//   [pad][start sentinel hdr][start sentinel ftr][free hdr ... free ftr][end sentinel hdr]
//
// The start sentinel is an allocated block with no payload; the end sentinel is a lone
// header of size 0 marked allocated, which terminates every scan. Sizes are multiples of
// 8 and every header sits at 4 mod 8, so every payload is 8-byte aligned.

use crate::error::{IpcError, Result};
use crate::Core::arena::ArenaGuard;
use log::{error, trace};
mod debug;
mod getters;

const WSIZE: u32 = 4;
const DSIZE: u32 = 8;
const ALLOC_BIT: u32 = 1;
const SIZE_MASK: u32 = !0x7;

/// Smallest block: header, footer and one aligned payload word.
pub const MIN_BLOCK: u32 = 16;

/// Per-block bookkeeping bytes (header plus footer).
pub const BLOCK_OVERHEAD: u32 = DSIZE;

#[inline]
fn pack(size: u32, allocated: bool) -> u32 {
    size | if allocated { ALLOC_BIT } else { 0 }
}

#[inline]
fn tag_size(tag: u32) -> u32 {
    tag & SIZE_MASK
}

#[inline]
fn tag_allocated(tag: u32) -> bool {
    tag & ALLOC_BIT != 0
}

/// Block size needed to serve `size` payload bytes, or `None` if it cannot be expressed.
fn adjusted_size(size: usize) -> Option<u32> {
    let size = u32::try_from(size).ok()?;
    let padded = size.checked_add(BLOCK_OVERHEAD + DSIZE - 1)? & SIZE_MASK;
    Some(padded.max(MIN_BLOCK))
}

/// Totals gathered by a full heap walk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapInfo {
    pub total_bytes: u32,
    pub free_bytes: u32,
    pub used_bytes: u32,
    pub free_blocks: u32,
    pub used_blocks: u32,
    pub largest_free: u32,
}

/// Location of the heap inside the arena.
///
/// Every core holds its own copy; only the master formats the memory behind it.
/// None of the methods lock: each takes an [`ArenaGuard`] to prove the caller already does.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct SharedHeap {
    start: u32,
    size: u32,
}

impl SharedHeap {
    /// Format `[start, start + size)` as one free block between the two sentinels.
    ///
    /// `start` must be 8-byte aligned; `size` is rounded down to a multiple of 8.
    pub fn format(arena: &ArenaGuard<'_>, start: u32, size: u32) -> Result<Self> {
        let size = size & SIZE_MASK;
        if start % DSIZE != 0 || size < 2 * MIN_BLOCK {
            return Err(IpcError::Error(format!(
                "cannot format a heap of {} bytes at offset {}",
                size, start
            )));
        }

        let heap = Self { start, size };
        let free = size - 2 * DSIZE;

        arena.write_u32(start, 0);
        arena.write_u32(start + WSIZE, pack(DSIZE, true));
        arena.write_u32(start + DSIZE, pack(DSIZE, true));
        let bp = heap.first_block();
        arena.write_u32(bp - WSIZE, pack(free, false));
        arena.write_u32(bp + free - DSIZE, pack(free, false));
        arena.write_u32(heap.end() - WSIZE, pack(0, true));

        trace!("heap formatted at {:#x}, {} bytes, {} free", start, size, free);
        Ok(heap)
    }

    /// Adopt a heap some other core already formatted.
    pub fn attach(start: u32, size: u32) -> Self {
        Self {
            start,
            size: size & SIZE_MASK,
        }
    }

    #[inline]
    fn first_block(&self) -> u32 {
        self.start + 2 * DSIZE
    }

    #[inline]
    fn end(&self) -> u32 {
        self.start + self.size
    }

    #[inline]
    fn contains_payload(&self, bp: u32) -> bool {
        bp >= self.first_block() && bp < self.end() && bp % DSIZE == 0
    }

    /// First-fit allocation of `size` payload bytes. Returns the payload offset.
    ///
    /// Zero-size requests and exhaustion both return `None`.
    pub fn malloc(&self, arena: &ArenaGuard<'_>, size: usize) -> Option<u32> {
        if size == 0 {
            return None;
        }
        let asize = adjusted_size(size)?;

        let mut bp = self.first_block();
        loop {
            let tag = arena.read_u32(bp - WSIZE);
            let bsize = tag_size(tag);
            if bsize == 0 {
                return None;
            }
            if !tag_allocated(tag) && bsize >= asize {
                self.place(arena, bp, bsize, asize);
                return Some(bp);
            }
            bp += bsize;
            if bp > self.end() {
                error!("heap scan ran past the end sentinel at {:#x}", bp);
                return None;
            }
        }
    }

    fn place(&self, arena: &ArenaGuard<'_>, bp: u32, bsize: u32, asize: u32) {
        let remainder = bsize - asize;
        if remainder >= MIN_BLOCK {
            arena.write_u32(bp - WSIZE, pack(asize, true));
            arena.write_u32(bp + asize - DSIZE, pack(asize, true));
            let next = bp + asize;
            arena.write_u32(next - WSIZE, pack(remainder, false));
            arena.write_u32(next + remainder - DSIZE, pack(remainder, false));
        } else {
            arena.write_u32(bp - WSIZE, pack(bsize, true));
            arena.write_u32(bp + bsize - DSIZE, pack(bsize, true));
        }
    }

    /// Return the block at `bp` and merge it with free physical neighbours.
    ///
    /// Rejects offsets that are not the payload of an allocated block.
    pub fn free(&self, arena: &ArenaGuard<'_>, bp: u32) -> Result<()> {
        if !self.contains_payload(bp) {
            return Err(IpcError::CorruptHeap);
        }
        let tag = arena.read_u32(bp - WSIZE);
        let size = tag_size(tag);
        if size < MIN_BLOCK || size > self.end() - bp || arena.read_u32(bp + size - DSIZE) != tag {
            return Err(IpcError::CorruptHeap);
        }
        if !tag_allocated(tag) {
            return Err(IpcError::ReferenceError);
        }

        arena.write_u32(bp - WSIZE, pack(size, false));
        arena.write_u32(bp + size - DSIZE, pack(size, false));
        self.coalesce(arena, bp, size);
        Ok(())
    }

    /// Merge up to three blocks into one. Boundary tags swallowed by the merge are
    /// cleared, so an allocate-then-free leaves the heap bytes exactly as they were.
    fn coalesce(&self, arena: &ArenaGuard<'_>, bp: u32, size: u32) {
        let prev_tag = arena.read_u32(bp - DSIZE);
        let next_tag = arena.read_u32(bp + size - WSIZE);

        let mut start = bp;
        let mut total = size;

        if !tag_allocated(next_tag) {
            arena.write_u32(bp + size - DSIZE, 0);
            arena.write_u32(bp + size - WSIZE, 0);
            total += tag_size(next_tag);
        }
        if !tag_allocated(prev_tag) {
            arena.write_u32(bp - DSIZE, 0);
            arena.write_u32(bp - WSIZE, 0);
            start = bp - tag_size(prev_tag);
            total += tag_size(prev_tag);
        }

        if start != bp || total != size {
            arena.write_u32(start - WSIZE, pack(total, false));
            arena.write_u32(start + total - DSIZE, pack(total, false));
        }
    }

    /// Walk every block, validating tags, alignment and coalescing.
    ///
    /// O(number of blocks) under the caller's lock: keep it out of latency-sensitive paths.
    pub fn check(&self, arena: &ArenaGuard<'_>) -> bool {
        self.walk(arena).is_ok()
    }

    /// Same walk as [`SharedHeap::check`], returning the totals.
    pub fn info(&self, arena: &ArenaGuard<'_>) -> Result<HeapInfo> {
        self.walk(arena)
    }

    fn walk(&self, arena: &ArenaGuard<'_>) -> Result<HeapInfo> {
        let sentinel = pack(DSIZE, true);
        if arena.read_u32(self.start + WSIZE) != sentinel || arena.read_u32(self.start + DSIZE) != sentinel {
            error!("heap start sentinel damaged at {:#x}", self.start);
            return Err(IpcError::CorruptHeap);
        }

        let mut info = HeapInfo {
            total_bytes: self.size,
            ..HeapInfo::default()
        };
        let mut prev_free = false;
        let mut bp = self.first_block();
        loop {
            if bp > self.end() || bp % DSIZE != 0 {
                error!("heap block at {:#x} is misaligned or out of range", bp);
                return Err(IpcError::CorruptHeap);
            }
            let tag = arena.read_u32(bp - WSIZE);
            let size = tag_size(tag);
            if size == 0 {
                if tag != pack(0, true) || bp != self.end() {
                    error!("heap end sentinel damaged at {:#x}", bp);
                    return Err(IpcError::CorruptHeap);
                }
                return Ok(info);
            }
            if size < MIN_BLOCK || size > self.end() - bp {
                error!("heap block at {:#x} has impossible size {}", bp, size);
                return Err(IpcError::CorruptHeap);
            }
            if arena.read_u32(bp + size - DSIZE) != tag {
                error!("heap block at {:#x}: header and footer disagree", bp);
                return Err(IpcError::CorruptHeap);
            }

            if tag_allocated(tag) {
                info.used_blocks += 1;
                info.used_bytes += size;
                prev_free = false;
            } else {
                if prev_free {
                    error!("heap block at {:#x} was not coalesced with its predecessor", bp);
                    return Err(IpcError::CorruptHeap);
                }
                info.free_blocks += 1;
                info.free_bytes += size;
                info.largest_free = info.largest_free.max(size);
                prev_free = true;
            }
            bp += size;
        }
    }
}
