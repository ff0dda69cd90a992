// Shared stream registry.
//
// A singly linked list of descriptors in the shared heap, rooted in the arena header.
// Descriptors are metadata only; membership changes are announced to every core as
// events carrying a copy of the descriptor, so nobody has to chase a node that may
// already be gone.

use super::context::{IpcContext, IpcEvent};
use super::layout::{StreamDescriptor, StreamInfo, NULL_OFFSET, STREAM_DESCRIPTOR_SIZE, STREAM_NAME_LEN};
use crate::error::{IpcError, Result};
use crate::Core::arena::ArenaGuard;
use log::{debug, warn};

pub const EVENT_STREAM_ADDED: u8 = 1;
pub const EVENT_STREAM_REMOVED: u8 = 2;

/// Sample encoding announced with a stream.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleFormat {
    S16 = 0,
    S24 = 1,
    S32 = 2,
    F32 = 3,
}

impl SampleFormat {
    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(SampleFormat::S16),
            1 => Some(SampleFormat::S24),
            2 => Some(SampleFormat::S32),
            3 => Some(SampleFormat::F32),
            _ => None,
        }
    }

    pub fn word_size(self) -> u8 {
        match self {
            SampleFormat::S16 => 2,
            SampleFormat::S24 => 3,
            SampleFormat::S32 | SampleFormat::F32 => 4,
        }
    }
}

/// What a core announces when it registers a stream.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub name: String,
    pub sample_rate: u32,
    pub block_size: u32,
    pub channels: u8,
    pub format: SampleFormat,
    pub callback_token: u32,
}

impl StreamConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sample_rate: 48_000,
            block_size: 64,
            channels: 2,
            format: SampleFormat::S32,
            callback_token: 0,
        }
    }

    pub fn sample_rate(mut self, rate: u32) -> Self {
        self.sample_rate = rate;
        self
    }

    pub fn block_size(mut self, frames: u32) -> Self {
        self.block_size = frames;
        self
    }

    pub fn channels(mut self, channels: u8) -> Self {
        self.channels = channels;
        self
    }

    pub fn format(mut self, format: SampleFormat) -> Self {
        self.format = format;
        self
    }

    pub fn callback_token(mut self, token: u32) -> Self {
        self.callback_token = token;
        self
    }
}

/// A registered stream, valid until `unregister_stream`.
///
/// Offsets and ids are recycled; the generation tells a stale handle from the stream
/// that now occupies its slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamHandle {
    offset: u32,
    stream_id: u8,
    generation: u32,
}

impl StreamHandle {
    /// Rebuild a handle from the parts handed across the C boundary.
    pub(crate) fn from_parts(offset: u32, stream_id: u8, generation: u32) -> Self {
        Self {
            offset,
            stream_id,
            generation,
        }
    }

    pub fn stream_id(&self) -> u8 {
        self.stream_id
    }

    pub fn offset(&self) -> u32 {
        self.offset
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

/// Decoded stream add/remove event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamChange {
    Added(StreamInfo),
    Removed(StreamInfo),
}

impl IpcEvent<'_> {
    /// Decode this event as a stream membership change, if it is one.
    pub fn stream_change(&self) -> Option<StreamChange> {
        let info = StreamInfo::from_bytes(self.data);
        match self.tag {
            EVENT_STREAM_ADDED => info.map(StreamChange::Added),
            EVENT_STREAM_REMOVED => info.map(StreamChange::Removed),
            _ => None,
        }
    }
}

fn encode_name(name: &str) -> Result<[u8; STREAM_NAME_LEN]> {
    let bytes = name.as_bytes();
    if bytes.is_empty() || bytes.len() >= STREAM_NAME_LEN || bytes.contains(&0) {
        return Err(IpcError::BadStreamName);
    }
    let mut out = [0u8; STREAM_NAME_LEN];
    out[..bytes.len()].copy_from_slice(bytes);
    Ok(out)
}

fn next_of(arena: &ArenaGuard<'_>, node: u32) -> u32 {
    arena.read_u32(node)
}

/// Visit every node in list order; stop early when `f` returns `false`.
fn walk(arena: &ArenaGuard<'_>, mut f: impl FnMut(u32, &StreamDescriptor) -> bool) {
    let mut node = arena.stream_head();
    while node != NULL_OFFSET {
        let desc = arena.read::<StreamDescriptor>(node);
        if !f(node, &desc) {
            return;
        }
        node = next_of(arena, node);
    }
}

impl IpcContext {
    /// Add a named stream to the shared list and announce it to every core.
    ///
    /// Fails with `StreamExists` on a duplicate name, `BadStreamName` on an empty, too long
    /// or NUL-containing name, and `NoMemory` when the heap or the 256 stream ids run out.
    pub fn register_stream(&self, config: &StreamConfig) -> Result<StreamHandle> {
        let name = encode_name(&config.name)?;

        let (handle, info) = {
            let guard = self.lock();
            let mut exists = false;
            let mut used = [false; 256];
            let mut tail = NULL_OFFSET;
            walk(&guard, |node, desc| {
                if desc.info.name == name {
                    exists = true;
                    return false;
                }
                used[desc.info.stream_id as usize] = true;
                tail = node;
                true
            });
            if exists {
                return Err(IpcError::StreamExists);
            }
            let stream_id = used.iter().position(|u| !u).ok_or(IpcError::NoMemory)? as u8;

            let node = self
                .heap()
                .malloc(&guard, STREAM_DESCRIPTOR_SIZE)
                .ok_or(IpcError::NoMemory)?;
            let generation = guard.next_stream_generation();
            let info = StreamInfo {
                owner_core: self.core_index(),
                format: config.format as u8,
                channels: config.channels,
                stream_id,
                sample_rate: config.sample_rate,
                block_size: config.block_size,
                callback_token: config.callback_token,
                name,
            };
            guard.write(
                node,
                StreamDescriptor {
                    next: NULL_OFFSET,
                    generation,
                    info,
                },
            );
            if tail == NULL_OFFSET {
                guard.set_stream_head(node);
            } else {
                guard.write_u32(tail, node);
            }
            (
                StreamHandle {
                    offset: node,
                    stream_id,
                    generation,
                },
                info,
            )
        };

        debug!(
            "core {} registered stream '{}' as id {}",
            self.core_index(),
            config.name,
            handle.stream_id
        );
        if let Err(e) = self.broadcast_event(EVENT_STREAM_ADDED, &info.to_bytes()) {
            warn!("stream '{}' registered but not announced: {}", config.name, e);
        }
        Ok(handle)
    }

    /// Unlink a stream this core registered, announce the removal, then free the node.
    pub fn unregister_stream(&self, handle: StreamHandle) -> Result<()> {
        let info = {
            let guard = self.lock();
            let mut prev = NULL_OFFSET;
            let mut found = None;
            walk(&guard, |node, desc| {
                if node == handle.offset {
                    found = Some(*desc);
                    return false;
                }
                prev = node;
                true
            });
            let desc = found.ok_or(IpcError::BadStream)?;
            let info = desc.info;
            if info.owner_core != self.core_index()
                || info.stream_id != handle.stream_id
                || desc.generation != handle.generation
            {
                return Err(IpcError::BadStream);
            }

            let next = next_of(&guard, handle.offset);
            if prev == NULL_OFFSET {
                guard.set_stream_head(next);
            } else {
                guard.write_u32(prev, next);
            }
            info
        };

        if let Err(e) = self.broadcast_event(EVENT_STREAM_REMOVED, &info.to_bytes()) {
            warn!("stream '{}' removed but not announced: {}", info.name(), e);
        }

        let guard = self.lock();
        self.heap().free(&guard, handle.offset)?;
        debug!("core {} unregistered stream '{}'", self.core_index(), info.name());
        Ok(())
    }

    /// Look a stream up by name.
    pub fn find_stream(&self, name: &str) -> Option<StreamInfo> {
        let name = encode_name(name).ok()?;
        let guard = self.lock();
        let mut found = None;
        walk(&guard, |_, desc| {
            if desc.info.name == name {
                found = Some(desc.info);
                return false;
            }
            true
        });
        found
    }

    /// Snapshot of every registered stream, in registration order.
    pub fn streams(&self) -> Vec<StreamInfo> {
        let mut out = Vec::new();
        let guard = self.lock();
        walk(&guard, |_, desc| {
            out.push(desc.info);
            true
        });
        out
    }
}
