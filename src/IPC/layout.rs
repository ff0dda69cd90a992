use sha2::{Digest, Sha256};
use std::mem::size_of;
use std::sync::atomic::AtomicU32;

/// Number of participating cores the arena header is sized for.
pub const MAX_CORES: usize = 4;

/// Slots per destination ring. One slot always stays empty, so 15 buffers fit.
pub const QUEUE_CAPACITY: usize = 16;

/// Bytes reserved for a stream name, NUL terminator included.
pub const STREAM_NAME_LEN: usize = 32;

/// Payload alignment guaranteed by the shared heap.
pub const HEAP_ALIGN: usize = 8;

/// "AEIP"
pub const ARENA_MAGIC: u32 = 0x4145_4950;

/// "AEMB", stamped into every live message buffer header.
pub const MSG_MAGIC: u32 = 0x4145_4D42;

/// Arena offset meaning "no block".
pub const NULL_OFFSET: u32 = 0;

const _: () = assert!(QUEUE_CAPACITY.is_power_of_two());
const _: () = assert!(QUEUE_CAPACITY <= u8::MAX as usize);
const _: () = assert!(MAX_CORES <= u8::MAX as usize);

/// One destination core's ring of buffer offsets.
///
/// `head` is the next slot to write, `tail` the next slot to read.
/// The ring is full when `(head + 1) % capacity == tail`.
#[repr(C)]
pub struct CoreQueue {
    pub head: u8,
    pub tail: u8,
    /// Capacity, stamped by the master so every core agrees on it.
    pub size: u8,
    pub align: u8,
    pub slots: [u32; QUEUE_CAPACITY],
}

/// Fixed header at offset 0 of every arena.
///
/// Every field is a `u32`, a `u32` array, or a byte group whose size is a multiple of four,
/// so `repr(C)` lays it out without padding on every core.
#[repr(C)]
pub struct ArenaHeader {
    /// Spinlock word guarding everything below except the doorbells.
    pub lock: AtomicU32,
    pub magic: u32,
    pub layout_digest: [u8; 8],
    /// Non-zero once the core at that index has registered itself.
    pub trigger_ids: [u32; MAX_CORES],
    /// Incremented by senders to wake a hosted core; touched only atomically.
    pub doorbells: [AtomicU32; MAX_CORES],
    pub queues: [CoreQueue; MAX_CORES],
    /// Offset of the first stream descriptor, or `NULL_OFFSET`.
    pub stream_head: u32,
    pub heap_offset: u32,
    pub heap_size: u32,
    pub master_core: u32,
    /// Bumped on every stream registration; stale handles carry an older value.
    pub stream_generation: u32,
}

/// Header every message buffer carries at the start of its heap block.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MsgHeader {
    pub ref_count: u8,
    pub src_core: u8,
    pub kind: u8,
    pub event: u8,
    pub size: u32,
    pub payload: u32,
    /// `MSG_MAGIC` while the block is a live buffer, 0 once it is freed.
    pub magic: u32,
}

// Byte offsets of the MsgHeader fields. `size`, `kind` and `event` are fixed before the
// first send; `ref_count` only changes under the lock.
pub const MSG_REF_COUNT_AT: u32 = 0;
pub const MSG_SRC_CORE_AT: u32 = 1;
pub const MSG_KIND_AT: u32 = 2;
pub const MSG_EVENT_AT: u32 = 3;
pub const MSG_SIZE_AT: u32 = 4;
pub const MSG_MAGIC_AT: u32 = 12;

/// Stream metadata as stored in the shared list and carried in add/remove events.
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct StreamInfo {
    pub owner_core: u8,
    pub format: u8,
    pub channels: u8,
    pub stream_id: u8,
    pub sample_rate: u32,
    pub block_size: u32,
    /// Opaque value the owning core uses to find its local callbacks.
    pub callback_token: u32,
    pub name: [u8; STREAM_NAME_LEN],
}

/// Node of the shared stream list.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct StreamDescriptor {
    pub next: u32,
    /// `stream_generation` at the time this node was registered.
    pub generation: u32,
    pub info: StreamInfo,
}

pub const QUEUE_SIZE: usize = 4 + 4 * QUEUE_CAPACITY;
pub const HEADER_SIZE: usize = 4 + 4 + 8 + 4 * MAX_CORES + 4 * MAX_CORES + QUEUE_SIZE * MAX_CORES + 20;
pub const MSG_HEADER_SIZE: usize = 16;
pub const STREAM_INFO_SIZE: usize = 16 + STREAM_NAME_LEN;
pub const STREAM_DESCRIPTOR_SIZE: usize = 8 + STREAM_INFO_SIZE;

const _: () = assert!(size_of::<CoreQueue>() == QUEUE_SIZE);
const _: () = assert!(size_of::<ArenaHeader>() == HEADER_SIZE);
const _: () = assert!(size_of::<MsgHeader>() == MSG_HEADER_SIZE);
const _: () = assert!(size_of::<StreamInfo>() == STREAM_INFO_SIZE);
const _: () = assert!(size_of::<StreamDescriptor>() == STREAM_DESCRIPTOR_SIZE);

/// First heap byte; the header rounded up to the heap alignment.
pub const HEAP_START: usize = (HEADER_SIZE + HEAP_ALIGN - 1) & !(HEAP_ALIGN - 1);

/// Fingerprint of the compiled layout.
///
/// Stored by the master; a core built with different constants refuses to attach.
pub fn layout_digest() -> [u8; 8] {
    let mut hasher = Sha256::new();
    hasher.update(b"audio-ipc layout v2");
    for value in [
        MAX_CORES,
        QUEUE_CAPACITY,
        STREAM_NAME_LEN,
        HEAP_ALIGN,
        HEADER_SIZE,
        MSG_HEADER_SIZE,
        STREAM_DESCRIPTOR_SIZE,
    ] {
        hasher.update((value as u32).to_le_bytes());
    }
    let full = hasher.finalize();
    let mut digest = [0u8; 8];
    digest.copy_from_slice(&full[..8]);
    digest
}

impl StreamInfo {
    /// The stream name up to its NUL terminator.
    pub fn name(&self) -> &str {
        let end = self.name.iter().position(|&b| b == 0).unwrap_or(STREAM_NAME_LEN);
        std::str::from_utf8(&self.name[..end]).unwrap_or("")
    }

    /// Little-endian wire image, as carried in stream events.
    pub fn to_bytes(&self) -> [u8; STREAM_INFO_SIZE] {
        let mut out = [0u8; STREAM_INFO_SIZE];
        out[0] = self.owner_core;
        out[1] = self.format;
        out[2] = self.channels;
        out[3] = self.stream_id;
        out[4..8].copy_from_slice(&self.sample_rate.to_le_bytes());
        out[8..12].copy_from_slice(&self.block_size.to_le_bytes());
        out[12..16].copy_from_slice(&self.callback_token.to_le_bytes());
        out[16..].copy_from_slice(&self.name);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < STREAM_INFO_SIZE {
            return None;
        }
        let word = |at: usize| u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]);
        let mut name = [0u8; STREAM_NAME_LEN];
        name.copy_from_slice(&bytes[16..STREAM_INFO_SIZE]);
        Some(Self {
            owner_core: bytes[0],
            format: bytes[1],
            channels: bytes[2],
            stream_id: bytes[3],
            sample_rate: word(4),
            block_size: word(8),
            callback_token: word(12),
            name,
        })
    }
}

impl std::fmt::Debug for StreamInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamInfo")
            .field("name", &self.name())
            .field("stream_id", &self.stream_id)
            .field("owner_core", &self.owner_core)
            .field("format", &self.format)
            .field("channels", &self.channels)
            .field("sample_rate", &self.sample_rate)
            .field("block_size", &self.block_size)
            .field("callback_token", &self.callback_token)
            .finish()
    }
}
