use crate::error::{IpcError, Result};
use crate::Core::spinlock::{InterruptMask, SpinGuard, SpinLock};
use crate::Core::SharedMemory::{SharedMemoryBackend, BACKEND_ALIGN};
use crate::IPC::layout::{ArenaHeader, CoreQueue, HEAP_START, MAX_CORES};
use std::ops::Deref;
use std::ptr;
use std::sync::atomic::AtomicU32;

/// Smallest heap that still fits the boundary sentinels and one minimal block.
pub const MIN_HEAP_SIZE: usize = 64;

/// View of one shared region: fixed header at offset 0, heap behind it.
///
/// All addressing is by `u32` offset from the region base, so the same values are valid
/// on every core that maps the region, at whatever address. Plain reads and writes are
/// only sound while holding the lock (see [`Arena::lock`]); the lock word and the
/// doorbells are atomics and may be touched at any time.
pub struct Arena {
    backend: Box<dyn SharedMemoryBackend>,
    base: *mut u8,
    size: usize,
}

unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

impl Arena {
    pub fn new(backend: Box<dyn SharedMemoryBackend>) -> Result<Self> {
        let base = backend.as_ptr();
        let size = backend.size();

        if (base as usize) % BACKEND_ALIGN != 0 {
            return Err(IpcError::Error(format!(
                "arena base {:p} is not {}-byte aligned",
                base, BACKEND_ALIGN
            )));
        }
        if size < HEAP_START + MIN_HEAP_SIZE {
            return Err(IpcError::Error(format!(
                "arena of {} bytes cannot hold the {} byte header and a heap",
                size, HEAP_START
            )));
        }
        if size > u32::MAX as usize {
            return Err(IpcError::Error(format!(
                "arena of {} bytes is not addressable by 32-bit offsets",
                size
            )));
        }

        Ok(Self {
            backend,
            base,
            size,
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn backend(&self) -> &dyn SharedMemoryBackend {
        &*self.backend
    }

    pub(crate) fn header(&self) -> *mut ArenaHeader {
        self.base as *mut ArenaHeader
    }

    pub fn lock_word(&self) -> &AtomicU32 {
        unsafe { &(*self.header()).lock }
    }

    pub fn doorbell(&self, core: usize) -> &AtomicU32 {
        debug_assert!(core < MAX_CORES);
        unsafe { &(*self.header()).doorbells[core] }
    }

    /// Take the global lock, masking local interrupts through `mask` while held.
    pub fn lock<'a>(&'a self, mask: &'a dyn InterruptMask) -> ArenaGuard<'a> {
        let guard = SpinLock::new(self.lock_word(), mask).lock();
        ArenaGuard {
            arena: self,
            _guard: guard,
        }
    }

    /// Zero everything after the lock word. Used once by the master during bring-up.
    pub(crate) fn zero(&self) {
        unsafe { ptr::write_bytes(self.base.add(4), 0, self.size - 4) };
    }

    #[inline]
    fn check(&self, off: u32, len: usize) {
        debug_assert!(
            off as usize + len <= self.size,
            "offset {} + {} outside arena of {}",
            off,
            len,
            self.size
        );
    }

    /// Raw pointer to the byte at `off`.
    #[inline]
    pub fn ptr_at(&self, off: u32) -> *mut u8 {
        self.check(off, 0);
        unsafe { self.base.add(off as usize) }
    }

    #[inline]
    pub(crate) fn read_u32(&self, off: u32) -> u32 {
        self.check(off, 4);
        debug_assert_eq!(off % 4, 0);
        unsafe { ptr::read(self.ptr_at(off) as *const u32) }
    }

    #[inline]
    pub(crate) fn write_u32(&self, off: u32, value: u32) {
        self.check(off, 4);
        debug_assert_eq!(off % 4, 0);
        unsafe { ptr::write(self.ptr_at(off) as *mut u32, value) }
    }

    #[inline]
    pub(crate) fn read<T: Copy>(&self, off: u32) -> T {
        self.check(off, std::mem::size_of::<T>());
        unsafe { ptr::read_unaligned(self.ptr_at(off) as *const T) }
    }

    #[inline]
    pub(crate) fn write<T: Copy>(&self, off: u32, value: T) {
        self.check(off, std::mem::size_of::<T>());
        unsafe { ptr::write_unaligned(self.ptr_at(off) as *mut T, value) }
    }

    pub(crate) fn copy_in(&self, off: u32, bytes: &[u8]) {
        self.check(off, bytes.len());
        unsafe { ptr::copy_nonoverlapping(bytes.as_ptr(), self.ptr_at(off), bytes.len()) }
    }

    pub(crate) fn copy_out(&self, off: u32, out: &mut [u8]) {
        self.check(off, out.len());
        unsafe { ptr::copy_nonoverlapping(self.ptr_at(off), out.as_mut_ptr(), out.len()) }
    }

    /// Borrow `len` bytes at `off`.
    ///
    /// # Safety
    /// No other core may write the range while the slice is alive.
    pub(crate) unsafe fn bytes(&self, off: u32, len: usize) -> &[u8] {
        self.check(off, len);
        std::slice::from_raw_parts(self.ptr_at(off), len)
    }

    /// Mutably borrow `len` bytes at `off`.
    ///
    /// # Safety
    /// The caller must be the only party touching the range while the slice is alive.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn bytes_mut(&self, off: u32, len: usize) -> &mut [u8] {
        self.check(off, len);
        std::slice::from_raw_parts_mut(self.ptr_at(off), len)
    }
}

/// Header fields describing how the arena was formatted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutFields {
    pub magic: u32,
    pub digest: [u8; 8],
    pub heap_offset: u32,
    pub heap_size: u32,
    pub master_core: u32,
}

/// The arena with its global lock held.
///
/// Functions that mutate shared state take `&ArenaGuard` as proof that the caller holds
/// the lock; this is how the "unsafe" (caller-locked) variants are expressed.
pub struct ArenaGuard<'a> {
    arena: &'a Arena,
    _guard: SpinGuard<'a>,
}

impl<'a> ArenaGuard<'a> {
    /// Write the identity fields a non-master checks before attaching.
    pub(crate) fn stamp_layout(&self, fields: LayoutFields) {
        let hdr = self.arena.header();
        unsafe {
            ptr::write(ptr::addr_of_mut!((*hdr).layout_digest), fields.digest);
            ptr::write(ptr::addr_of_mut!((*hdr).heap_offset), fields.heap_offset);
            ptr::write(ptr::addr_of_mut!((*hdr).heap_size), fields.heap_size);
            ptr::write(ptr::addr_of_mut!((*hdr).master_core), fields.master_core);
            // magic last: it is what marks the arena as formatted
            ptr::write(ptr::addr_of_mut!((*hdr).magic), fields.magic);
        }
    }

    pub(crate) fn layout_fields(&self) -> LayoutFields {
        let hdr = self.arena.header();
        unsafe {
            LayoutFields {
                magic: ptr::read(ptr::addr_of!((*hdr).magic)),
                digest: ptr::read(ptr::addr_of!((*hdr).layout_digest)),
                heap_offset: ptr::read(ptr::addr_of!((*hdr).heap_offset)),
                heap_size: ptr::read(ptr::addr_of!((*hdr).heap_size)),
                master_core: ptr::read(ptr::addr_of!((*hdr).master_core)),
            }
        }
    }

    #[allow(clippy::mut_from_ref)]
    pub(crate) fn queue_mut(&self, core: usize) -> &mut CoreQueue {
        unsafe { &mut (*self.arena.header()).queues[core] }
    }

    pub(crate) fn trigger_id(&self, core: usize) -> u32 {
        unsafe { ptr::read(ptr::addr_of!((*self.arena.header()).trigger_ids[core])) }
    }

    pub(crate) fn set_trigger_id(&self, core: usize, id: u32) {
        unsafe { ptr::write(ptr::addr_of_mut!((*self.arena.header()).trigger_ids[core]), id) }
    }

    pub(crate) fn stream_head(&self) -> u32 {
        unsafe { ptr::read(ptr::addr_of!((*self.arena.header()).stream_head)) }
    }

    pub(crate) fn set_stream_head(&self, off: u32) {
        unsafe { ptr::write(ptr::addr_of_mut!((*self.arena.header()).stream_head), off) }
    }

    /// Advance the stream generation and return the new value.
    pub(crate) fn next_stream_generation(&self) -> u32 {
        let field = unsafe { ptr::addr_of_mut!((*self.arena.header()).stream_generation) };
        unsafe {
            let generation = ptr::read(field).wrapping_add(1);
            ptr::write(field, generation);
            generation
        }
    }
}

impl Deref for ArenaGuard<'_> {
    type Target = Arena;

    fn deref(&self) -> &Arena {
        self.arena
    }
}
