use std::fmt;
use crate::Core::alloc::SharedHeap;
use crate::Core::arena::Arena;
use crate::IPC::context::IpcContext;

/// Debug function for SharedHeap
///
/// Shows only the bounds; walking the blocks needs the arena lock.
pub fn debug_shared_heap(heap: &SharedHeap, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("SharedHeap")
        .field("start", &format_args!("{:#x}", heap.start()))
        .field("size", &heap.size())
        .field("first_payload", &format_args!("{:#x}", heap.first_payload()))
        .finish()
}

/// Debug function for Arena
///
/// Displays the mapping without dereferencing shared memory, except the lock word.
pub fn debug_arena(arena: &Arena, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Arena")
        .field("base", &format_args!("{:p}", arena.ptr_at(0)))
        .field("size", &arena.size())
        .field("backend", &arena.backend())
        .field("locked", &crate::Core::spinlock::is_locked(arena.lock_word()))
        .finish()
}

/// Debug function for IpcContext
///
/// Core-local state only; does not take the arena lock.
pub fn debug_ipc_context(ctx: &IpcContext, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("IpcContext")
        .field("core", &ctx.core_index())
        .field("master", &ctx.is_master())
        .field("trigger_id", &ctx.trigger_id())
        .field("heap", ctx.heap())
        .field("arena", &format_args!("{:p}", ctx.arena().ptr_at(0)))
        .finish_non_exhaustive()
}

impl fmt::Debug for Arena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        debug_arena(self, f)
    }
}

impl fmt::Debug for IpcContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        debug_ipc_context(self, f)
    }
}
