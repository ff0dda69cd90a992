// Per-core IPC context: bring-up, buffer lifecycle, send/receive and dispatch.
//
// Every shared mutation happens under the single arena lock. The context itself holds only
// core-local state (its index, its copy of the heap bounds, its handlers), so any number of
// contexts, one per core, can share one arena, including several inside one test process.

use super::buffer::{self, MsgBuffer, MsgKind};
use super::interrupt::InterruptLine;
use super::layout::{layout_digest, ARENA_MAGIC, HEAP_START, MAX_CORES, MSG_HEADER_SIZE};
use crate::error::{IpcError, Result};
use crate::Core::alloc::{HeapInfo, SharedHeap};
use crate::Core::arena::{Arena, ArenaGuard, LayoutFields};
use crate::Core::futex::futex_wait;
use crate::Core::spinlock::InterruptMask;
use log::{debug, error, trace, warn};
use parking_lot::RwLock;
use std::fmt;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

/// Receives user messages. Owns the reference it is handed and must drop it exactly once.
pub trait MessageHandler: Send + Sync {
    fn on_message(&self, ctx: &IpcContext, msg: MsgBuffer);
}

impl<F> MessageHandler for F
where
    F: Fn(&IpcContext, MsgBuffer) + Send + Sync,
{
    fn on_message(&self, ctx: &IpcContext, msg: MsgBuffer) {
        self(ctx, msg)
    }
}

/// Receives events. The dispatcher drops the buffer's reference once this returns.
pub trait EventHandler: Send + Sync {
    fn on_event(&self, ctx: &IpcContext, event: &IpcEvent<'_>);
}

impl<F> EventHandler for F
where
    F: Fn(&IpcContext, &IpcEvent<'_>) + Send + Sync,
{
    fn on_event(&self, ctx: &IpcContext, event: &IpcEvent<'_>) {
        self(ctx, event)
    }
}

/// An event as seen by the receiving core; `data` points into the shared buffer.
#[derive(Debug)]
pub struct IpcEvent<'a> {
    pub tag: u8,
    pub source_core: u8,
    pub data: &'a [u8],
}

/// A send that did not enqueue. The caller still holds the reference inside.
#[derive(Debug)]
pub struct SendError {
    pub error: IpcError,
    pub msg: MsgBuffer,
}

impl SendError {
    pub fn into_inner(self) -> MsgBuffer {
        self.msg
    }
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "send of buffer {:#x} failed: {}", self.msg.offset(), self.error)
    }
}

impl std::error::Error for SendError {}

#[derive(Default)]
struct Handlers {
    message: Option<Arc<dyn MessageHandler>>,
    event: Option<Arc<dyn EventHandler>>,
}

/// One core's handle on the shared arena.
pub struct IpcContext {
    arena: Arena,
    core: u8,
    master: bool,
    trigger_id: u32,
    heap: SharedHeap,
    line: Arc<dyn InterruptLine>,
    mask: Arc<dyn InterruptMask>,
    handlers: RwLock<Handlers>,
}

impl IpcContext {
    /// Join the arena as core `core`.
    ///
    /// The master zeroes and formats the arena first; every other core only validates the
    /// header and records where the heap is. Either way the core then publishes
    /// `trigger_id`, after which other cores may send to it.
    pub fn initialize(
        arena: Arena,
        core: u8,
        master: bool,
        trigger_id: u32,
        line: Arc<dyn InterruptLine>,
        mask: Arc<dyn InterruptMask>,
    ) -> Result<Self> {
        if core as usize >= MAX_CORES {
            return Err(IpcError::Error(format!(
                "core index {} out of range (max {})",
                core,
                MAX_CORES - 1
            )));
        }
        if trigger_id == 0 {
            return Err(IpcError::Error("trigger id 0 is reserved for \"not ready\"".into()));
        }

        let heap = if master {
            Self::format(&arena, core, &*mask)?
        } else {
            Self::attach(&arena, &*mask)?
        };

        {
            let guard = arena.lock(&*mask);
            guard.set_trigger_id(core as usize, trigger_id);
        }

        debug!(
            "core {} joined arena ({} bytes, master: {}, trigger {})",
            core,
            arena.size(),
            master,
            trigger_id
        );

        Ok(Self {
            arena,
            core,
            master,
            trigger_id,
            heap,
            line,
            mask,
            handlers: RwLock::new(Handlers::default()),
        })
    }

    fn format(arena: &Arena, core: u8, mask: &dyn InterruptMask) -> Result<SharedHeap> {
        // Nobody else may touch the arena before the master is done with it
        arena.lock_word().store(crate::Core::spinlock::UNLOCKED, Ordering::Release);
        arena.zero();

        let guard = arena.lock(mask);
        for q in 0..MAX_CORES {
            guard.queue_mut(q).init();
        }
        guard.set_stream_head(super::layout::NULL_OFFSET);

        let heap_size = (arena.size() - HEAP_START) as u32;
        let heap = SharedHeap::format(&guard, HEAP_START as u32, heap_size)?;
        guard.stamp_layout(LayoutFields {
            magic: ARENA_MAGIC,
            digest: layout_digest(),
            heap_offset: heap.start(),
            heap_size: heap.size(),
            master_core: core as u32,
        });
        Ok(heap)
    }

    fn attach(arena: &Arena, mask: &dyn InterruptMask) -> Result<SharedHeap> {
        let guard = arena.lock(mask);
        let fields = guard.layout_fields();
        if fields.magic != ARENA_MAGIC {
            return Err(IpcError::Error(
                "arena has not been formatted by a master core".into(),
            ));
        }
        if fields.digest != layout_digest() {
            return Err(IpcError::Error(format!(
                "arena layout digest {:02x?} does not match this build ({:02x?})",
                fields.digest,
                layout_digest()
            )));
        }
        if fields.heap_offset as usize + fields.heap_size as usize > arena.size() {
            return Err(IpcError::Error(format!(
                "arena heap [{}, +{}) exceeds the {} bytes mapped here",
                fields.heap_offset,
                fields.heap_size,
                arena.size()
            )));
        }
        Ok(SharedHeap::attach(fields.heap_offset, fields.heap_size))
    }

    pub fn core_index(&self) -> u8 {
        self.core
    }

    pub fn is_master(&self) -> bool {
        self.master
    }

    pub fn trigger_id(&self) -> u32 {
        self.trigger_id
    }

    pub fn arena(&self) -> &Arena {
        &self.arena
    }

    pub fn heap(&self) -> &SharedHeap {
        &self.heap
    }

    /// Take the global lock for a batch of caller-locked operations.
    pub fn lock(&self) -> ArenaGuard<'_> {
        self.arena.lock(&*self.mask)
    }

    /// Whether core `core` has published its trigger id.
    pub fn is_core_ready(&self, core: u8) -> bool {
        (core as usize) < MAX_CORES && self.lock().trigger_id(core as usize) != 0
    }

    // ---------------------------------------------------------------------------------
    // Raw heap
    // ---------------------------------------------------------------------------------

    /// Allocate from the shared heap, taking the lock. Payload offset, or `None`.
    pub fn malloc(&self, size: usize) -> Option<u32> {
        let guard = self.lock();
        self.heap.malloc(&guard, size)
    }

    /// Free a block from [`IpcContext::malloc`], taking the lock.
    ///
    /// Message buffers are refused with `ReferenceError`; they only go back to the heap
    /// through [`IpcContext::unref_buffer`]. Raw blocks must not store `MSG_MAGIC` at
    /// byte 12, or they are taken for buffers.
    pub fn free(&self, offset: u32) -> Result<()> {
        let guard = self.lock();
        let holds_header = self
            .heap
            .usable_size(&guard, offset)
            .is_some_and(|usable| usable as usize >= MSG_HEADER_SIZE)
            && offset as usize + MSG_HEADER_SIZE <= self.arena.size();
        if holds_header && self.heap.is_allocated(&guard, offset) && buffer::is_live(&guard, offset) {
            warn!("core {}: free of live message buffer {:#x} refused", self.core, offset);
            return Err(IpcError::ReferenceError);
        }
        self.heap.free(&guard, offset)
    }

    /// Full consistency walk. Not for latency-sensitive paths.
    pub fn check_heap(&self) -> bool {
        let guard = self.lock();
        self.heap.check(&guard)
    }

    /// Full walk returning usage totals. Not for latency-sensitive paths.
    pub fn heap_info(&self) -> Result<HeapInfo> {
        let guard = self.lock();
        self.heap.info(&guard)
    }

    // ---------------------------------------------------------------------------------
    // Buffers
    // ---------------------------------------------------------------------------------

    /// New user buffer with `size` payload bytes and one reference, held by the caller.
    pub fn create_msg_buffer(&self, size: usize) -> Result<MsgBuffer> {
        let guard = self.lock();
        buffer::create_locked(&guard, &self.heap, self.core, size)
    }

    /// Create a buffer and copy `data` into it.
    pub fn create_msg_buffer_from(&self, data: &[u8]) -> Result<MsgBuffer> {
        let msg = self.create_msg_buffer(data.len())?;
        msg.write_payload(&self.arena, data);
        Ok(msg)
    }

    /// Take another reference, returned as a second handle.
    ///
    /// Fails with `ReferenceError` once 255 holders exist; the caller must handle that
    /// rather than assume the reference was taken.
    pub fn ref_buffer(&self, msg: &MsgBuffer) -> Result<MsgBuffer> {
        let guard = self.lock();
        buffer::ref_locked(&guard, msg)?;
        // SAFETY: the count was just raised on behalf of the new handle
        Ok(unsafe { MsgBuffer::from_raw(msg.offset()) })
    }

    /// Drop a reference; the memory is freed exactly when the count reaches 0.
    /// Returns the remaining count.
    pub fn unref_buffer(&self, msg: MsgBuffer) -> Result<u8> {
        let guard = self.lock();
        buffer::unref_locked(&guard, &self.heap, msg)
    }

    /// Current count, for diagnostics.
    pub fn ref_count(&self, msg: &MsgBuffer) -> u8 {
        let _guard = self.lock();
        msg.header(&self.arena).ref_count
    }

    // ---------------------------------------------------------------------------------
    // Queues
    // ---------------------------------------------------------------------------------

    /// Enqueue `msg` on `dest`'s ring; its reference passes to the receiver.
    ///
    /// With `signal` set, the destination's interrupt is raised after the lock is released.
    /// Batch senders pass `false` and signal on their last send. On failure the reference
    /// comes back inside the [`SendError`].
    pub fn send(&self, msg: MsgBuffer, dest: u8, signal: bool) -> std::result::Result<(), SendError> {
        if dest as usize >= MAX_CORES {
            return Err(SendError {
                error: IpcError::Error(format!("destination core {} out of range", dest)),
                msg,
            });
        }

        let trigger = {
            let guard = self.lock();
            let trigger = guard.trigger_id(dest as usize);
            if trigger == 0 {
                return Err(SendError {
                    error: IpcError::CoreNotReady(dest),
                    msg,
                });
            }
            buffer::set_source_locked(&guard, &msg, self.core);
            if let Err(error) = guard.queue_mut(dest as usize).push(msg.offset()) {
                return Err(SendError { error, msg });
            }
            trigger
        };

        trace!("core {} -> core {}: buffer {:#x}", self.core, dest, msg.offset());
        if signal {
            self.line.raise(&self.arena, dest, trigger);
        }
        // The ring owns the reference now
        let _ = msg.into_raw();
        Ok(())
    }

    /// Copy `data` into a fresh buffer and send it, dropping the buffer if the send fails.
    pub fn send_bytes(&self, data: &[u8], dest: u8, signal: bool) -> Result<()> {
        let msg = self.create_msg_buffer_from(data)?;
        self.send(msg, dest, signal).map_err(|e| {
            let SendError { error, msg } = e;
            if let Err(unref) = self.unref_buffer(msg) {
                error!("dropping unsent buffer failed: {}", unref);
            }
            error
        })
    }

    /// Take the oldest buffer from this core's own ring.
    pub fn receive(&self) -> Result<MsgBuffer> {
        let guard = self.lock();
        let offset = guard.queue_mut(self.core as usize).pop()?;
        // SAFETY: the sender's reference travelled through the ring with the offset
        Ok(unsafe { MsgBuffer::from_raw(offset) })
    }

    /// Entries waiting on this core's ring.
    pub fn pending(&self) -> usize {
        self.lock().queue_mut(self.core as usize).len()
    }

    // ---------------------------------------------------------------------------------
    // Dispatch
    // ---------------------------------------------------------------------------------

    /// Install the user-message callback, replacing any previous one.
    pub fn register_receive_callback<F>(&self, callback: F)
    where
        F: Fn(&IpcContext, MsgBuffer) + Send + Sync + 'static,
    {
        self.set_message_handler(Arc::new(callback));
    }

    /// Install the event callback, replacing any previous one.
    pub fn register_event_callback<F>(&self, callback: F)
    where
        F: Fn(&IpcContext, &IpcEvent<'_>) + Send + Sync + 'static,
    {
        self.set_event_handler(Arc::new(callback));
    }

    pub fn set_message_handler(&self, handler: Arc<dyn MessageHandler>) {
        self.handlers.write().message = Some(handler);
    }

    pub fn set_event_handler(&self, handler: Arc<dyn EventHandler>) {
        self.handlers.write().event = Some(handler);
    }

    pub fn clear_handlers(&self) {
        *self.handlers.write() = Handlers::default();
    }

    /// Interrupt-handler body: receive until the ring is empty, dispatching each buffer.
    ///
    /// Buffers nobody claims (no handler installed, unknown kind) have their reference
    /// dropped here so they cannot leak. Returns the number of buffers taken off the ring.
    pub fn service_interrupt(&self) -> usize {
        let mut serviced = 0;
        loop {
            let msg = match self.receive() {
                Ok(msg) => msg,
                Err(_) => return serviced,
            };
            serviced += 1;
            self.dispatch(msg);
        }
    }

    fn dispatch(&self, msg: MsgBuffer) {
        let header = {
            let _guard = self.lock();
            msg.header(&self.arena)
        };

        match MsgKind::from_u8(header.kind) {
            Some(MsgKind::User) => {
                let handler = self.handlers.read().message.clone();
                match handler {
                    Some(handler) => handler.on_message(self, msg),
                    None => {
                        warn!(
                            "core {}: no message handler, dropping buffer {:#x} from core {}",
                            self.core,
                            msg.offset(),
                            header.src_core
                        );
                        self.drop_reference(msg);
                    }
                }
            }
            Some(MsgKind::Event) => {
                let handler = self.handlers.read().event.clone();
                if let Some(handler) = handler {
                    // SAFETY: event payloads are never written after the first send
                    let data = unsafe {
                        self.arena
                            .bytes(header.payload, header.size as usize)
                    };
                    let event = IpcEvent {
                        tag: header.event,
                        source_core: header.src_core,
                        data,
                    };
                    handler.on_event(self, &event);
                }
                self.drop_reference(msg);
            }
            None => {
                warn!(
                    "core {}: buffer {:#x} has unknown kind {}, dropping",
                    self.core,
                    msg.offset(),
                    header.kind
                );
                self.drop_reference(msg);
            }
        }
    }

    fn drop_reference(&self, msg: MsgBuffer) {
        if let Err(e) = self.unref_buffer(msg) {
            error!("core {}: dropping a dispatched buffer failed: {}", self.core, e);
        }
    }

    /// Sleep until this core's doorbell rings (or `timeout` passes), then service the ring.
    ///
    /// Only meaningful with a doorbell-style [`InterruptLine`]. Returns what
    /// [`IpcContext::service_interrupt`] returns.
    pub fn wait_for_interrupt(&self, timeout: Option<Duration>) -> usize {
        let bell = self.arena.doorbell(self.core as usize);
        // Read before looking at the ring so a ring-then-raise in between is not missed
        let seen = bell.load(Ordering::Acquire);
        if self.pending() == 0 {
            futex_wait(bell, seen, timeout);
        }
        self.service_interrupt()
    }

    // ---------------------------------------------------------------------------------
    // Events
    // ---------------------------------------------------------------------------------

    /// Send one event buffer to every ready core, this one included.
    ///
    /// The buffer gets one reference per destination before each send; a failed send drops
    /// only its own reference. The creator's reference is dropped last, so the buffer lives
    /// until the slowest recipient is done with it. Returns how many cores it reached.
    pub fn broadcast_event(&self, tag: u8, data: &[u8]) -> Result<usize> {
        let msg = {
            let guard = self.lock();
            let msg = buffer::create_locked(&guard, &self.heap, self.core, data.len())?;
            buffer::set_kind_locked(&guard, &msg, MsgKind::Event, tag);
            msg
        };
        msg.write_payload(&self.arena, data);

        let targets: [bool; MAX_CORES] = {
            let guard = self.lock();
            std::array::from_fn(|core| guard.trigger_id(core) != 0)
        };

        let mut delivered = 0;
        for (dest, _) in targets.iter().enumerate().filter(|(_, ready)| **ready) {
            let leg = match self.ref_buffer(&msg) {
                Ok(leg) => leg,
                Err(e) => {
                    warn!("event {} to core {} skipped: {}", tag, dest, e);
                    continue;
                }
            };
            match self.send(leg, dest as u8, true) {
                Ok(()) => delivered += 1,
                Err(SendError { error, msg: leg }) => {
                    warn!("event {} to core {} not delivered: {}", tag, dest, error);
                    self.drop_reference(leg);
                }
            }
        }

        self.unref_buffer(msg)?;
        trace!("event {} from core {} reached {} cores", tag, self.core, delivered);
        Ok(delivered)
    }

    /// Bytes of payload a buffer created right now could at most carry.
    pub fn max_payload(&self) -> usize {
        (self.heap.capacity() as usize).saturating_sub(MSG_HEADER_SIZE)
    }
}

impl Drop for IpcContext {
    fn drop(&mut self) {
        // Stop accepting sends, then release whatever is still queued for us
        let guard = self.arena.lock(&*self.mask);
        guard.set_trigger_id(self.core as usize, 0);
        let queue = guard.queue_mut(self.core as usize);
        let mut drained = 0;
        while let Ok(offset) = queue.pop() {
            // SAFETY: queued offsets carry a reference for this core
            let msg = unsafe { MsgBuffer::from_raw(offset) };
            if let Err(e) = buffer::unref_locked(&guard, &self.heap, msg) {
                error!("core {}: releasing queued buffer {:#x} failed: {}", self.core, offset, e);
            }
            drained += 1;
        }
        if drained > 0 {
            debug!("core {} left with {} undelivered buffers released", self.core, drained);
        }
    }
}
