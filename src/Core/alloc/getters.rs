use super::*;

/// Accessors used by diagnostics and the Debug helpers.
impl SharedHeap {
    /// Arena offset of the first heap byte (the alignment pad word).
    pub fn start(&self) -> u32 {
        self.start
    }

    /// Heap size in bytes, sentinels included.
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Payload offset of the first real block.
    pub fn first_payload(&self) -> u32 {
        self.first_block()
    }

    /// Bytes a single allocation could ever receive on a freshly formatted heap.
    pub fn capacity(&self) -> u32 {
        self.size - 2 * DSIZE - BLOCK_OVERHEAD
    }

    /// Size of the block whose payload starts at `bp`, read from its header.
    pub fn block_size(&self, arena: &ArenaGuard<'_>, bp: u32) -> Option<u32> {
        if !self.contains_payload(bp) {
            return None;
        }
        Some(tag_size(arena.read_u32(bp - WSIZE)))
    }

    /// Usable payload bytes of the block at `bp`.
    pub fn usable_size(&self, arena: &ArenaGuard<'_>, bp: u32) -> Option<u32> {
        self.block_size(arena, bp).map(|size| size - BLOCK_OVERHEAD)
    }

    pub fn is_allocated(&self, arena: &ArenaGuard<'_>, bp: u32) -> bool {
        self.contains_payload(bp) && tag_allocated(arena.read_u32(bp - WSIZE))
    }
}
