// Reference-counted message buffers in the shared heap.
//
// One heap block holds a MsgHeader followed directly by the payload. The count lives in
// shared memory and only changes under the arena lock; the block goes back to the heap
// exactly when it drops from 1 to 0.
//
// Once a buffer has a second holder, other cores may read `size`, `kind`, `event` and
// `src_core` without the lock. Locked updates therefore write single fields, never the
// whole header, and never touch those four once the buffer is shared.

use super::layout::{
    MsgHeader, MSG_EVENT_AT, MSG_HEADER_SIZE, MSG_KIND_AT, MSG_MAGIC, MSG_MAGIC_AT,
    MSG_REF_COUNT_AT, MSG_SIZE_AT, MSG_SRC_CORE_AT,
};
use crate::error::{IpcError, Result};
use crate::Core::alloc::SharedHeap;
use crate::Core::arena::{Arena, ArenaGuard};
use log::trace;

/// Most simultaneous holders a buffer can have.
pub const MAX_REFS: u8 = u8::MAX;

/// What the receiving dispatcher does with a buffer.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgKind {
    /// Goes to the user-message handler.
    User = 1,
    /// Goes to the event handler (stream add/remove and broadcast events).
    Event = 2,
}

impl MsgKind {
    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(MsgKind::User),
            2 => Some(MsgKind::Event),
            _ => None,
        }
    }
}

/// One held reference to a shared message buffer.
///
/// Not `Clone`: a second reference comes from `IpcContext::ref_buffer`, and every handle
/// must end in exactly one of `unref_buffer`, a successful send, or `into_raw`.
#[derive(Debug, PartialEq, Eq)]
#[must_use = "a dropped MsgBuffer leaks its reference; unref or send it"]
pub struct MsgBuffer {
    offset: u32,
}

impl MsgBuffer {
    /// Arena offset of the buffer header. Identical on every core.
    pub fn offset(&self) -> u32 {
        self.offset
    }

    /// Give up the handle without touching the count, e.g. to pass it through C.
    pub fn into_raw(self) -> u32 {
        self.offset
    }

    /// Rebuild a handle from `into_raw`.
    ///
    /// # Safety
    /// `offset` must come from `into_raw` and the reference it stood for must still be held.
    pub unsafe fn from_raw(offset: u32) -> Self {
        Self { offset }
    }

    pub(crate) fn payload_offset(&self) -> u32 {
        self.offset + MSG_HEADER_SIZE as u32
    }

    /// Whole-header snapshot, `ref_count` included.
    ///
    /// Take the arena lock first unless this handle is the only reference.
    pub fn header(&self, arena: &Arena) -> MsgHeader {
        arena.read(self.offset)
    }

    pub fn size(&self, arena: &Arena) -> usize {
        arena.read_u32(self.offset + MSG_SIZE_AT) as usize
    }

    pub fn kind(&self, arena: &Arena) -> Option<MsgKind> {
        MsgKind::from_u8(arena.read::<u8>(self.offset + MSG_KIND_AT))
    }

    pub fn event(&self, arena: &Arena) -> u8 {
        arena.read::<u8>(self.offset + MSG_EVENT_AT)
    }

    /// Core that last sent this buffer while holding its only reference.
    pub fn source_core(&self, arena: &Arena) -> u8 {
        arena.read::<u8>(self.offset + MSG_SRC_CORE_AT)
    }

    /// Copy `data` into the payload, starting at byte 0. Returns the bytes written.
    pub fn write_payload(&self, arena: &Arena, data: &[u8]) -> usize {
        let len = data.len().min(self.size(arena));
        arena.copy_in(self.payload_offset(), &data[..len]);
        len
    }

    /// Copy the whole payload out.
    pub fn read_payload(&self, arena: &Arena) -> Vec<u8> {
        let mut out = vec![0u8; self.size(arena)];
        arena.copy_out(self.payload_offset(), &mut out);
        out
    }

    /// Borrow the payload in place.
    ///
    /// # Safety
    /// No other holder may write the payload while the slice lives. In practice: only the
    /// producer writes, and only before the first send.
    pub unsafe fn payload<'a>(&self, arena: &'a Arena) -> &'a [u8] {
        arena.bytes(self.payload_offset(), self.size(arena))
    }

    /// Mutably borrow the payload in place.
    ///
    /// # Safety
    /// The caller must be the only holder (count of 1, not yet sent).
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn payload_mut<'a>(&self, arena: &'a Arena) -> &'a mut [u8] {
        arena.bytes_mut(self.payload_offset(), self.size(arena))
    }
}

/// Allocate header and payload as one block; count 1, kind `User`. Lock already held.
pub fn create_locked(
    arena: &ArenaGuard<'_>,
    heap: &SharedHeap,
    src_core: u8,
    size: usize,
) -> Result<MsgBuffer> {
    let total = size.checked_add(MSG_HEADER_SIZE).ok_or(IpcError::NoMemory)?;
    let offset = heap.malloc(arena, total).ok_or(IpcError::NoMemory)?;
    arena.write(
        offset,
        MsgHeader {
            ref_count: 1,
            src_core,
            kind: MsgKind::User as u8,
            event: 0,
            size: size as u32,
            payload: offset + MSG_HEADER_SIZE as u32,
            magic: MSG_MAGIC,
        },
    );
    trace!("buffer {:#x} created, {} payload bytes", offset, size);
    Ok(MsgBuffer { offset })
}

/// Whether the heap block at `offset` is a live message buffer. Lock already held.
pub(crate) fn is_live(arena: &ArenaGuard<'_>, offset: u32) -> bool {
    arena.read_u32(offset + MSG_MAGIC_AT) == MSG_MAGIC
}

fn ref_count_of(arena: &ArenaGuard<'_>, msg: &MsgBuffer) -> Result<u8> {
    if !is_live(arena, msg.offset) {
        return Err(IpcError::ReferenceError);
    }
    Ok(arena.read::<u8>(msg.offset + MSG_REF_COUNT_AT))
}

/// Add one reference. Refuses to go past `MAX_REFS`. Lock already held.
pub fn ref_locked(arena: &ArenaGuard<'_>, msg: &MsgBuffer) -> Result<u8> {
    let count = ref_count_of(arena, msg)?;
    if count == MAX_REFS {
        return Err(IpcError::ReferenceError);
    }
    arena.write::<u8>(msg.offset + MSG_REF_COUNT_AT, count + 1);
    Ok(count + 1)
}

/// Drop one reference, freeing the block when it was the last. Lock already held.
///
/// Returns the count left behind; 0 means the memory is gone.
pub fn unref_locked(arena: &ArenaGuard<'_>, heap: &SharedHeap, msg: MsgBuffer) -> Result<u8> {
    let count = ref_count_of(arena, &msg)?;
    if count == 0 {
        return Err(IpcError::ReferenceError);
    }
    arena.write::<u8>(msg.offset + MSG_REF_COUNT_AT, count - 1);
    if count == 1 {
        arena.write_u32(msg.offset + MSG_MAGIC_AT, 0);
        heap.free(arena, msg.offset)?;
        trace!("buffer {:#x} freed", msg.offset);
    }
    Ok(count - 1)
}

/// Set kind and event tag on a buffer nobody else holds yet. Lock already held.
pub(crate) fn set_kind_locked(arena: &ArenaGuard<'_>, msg: &MsgBuffer, kind: MsgKind, event: u8) {
    arena.write::<u8>(msg.offset + MSG_KIND_AT, kind as u8);
    arena.write::<u8>(msg.offset + MSG_EVENT_AT, event);
}

/// Stamp the sending core, but only while the sender holds the only reference: a shared
/// buffer keeps the core that sent it first. Lock already held.
pub(crate) fn set_source_locked(arena: &ArenaGuard<'_>, msg: &MsgBuffer, src_core: u8) {
    if arena.read::<u8>(msg.offset + MSG_REF_COUNT_AT) == 1 {
        arena.write::<u8>(msg.offset + MSG_SRC_CORE_AT, src_core);
    }
}
