// Module naming follows project convention (IPC = inter-core message passing)
#[allow(non_snake_case)]
pub mod Core {
    pub mod SharedMemory;
    pub use SharedMemory::{
        attach_shared_memory, create_shared_memory, unlink_shared_memory, HeapMemory, RawHandle,
        SharedMemoryBackend,
    };
    pub mod alloc;
    pub mod arena;
    pub mod futex;
    pub mod spinlock;
    pub use alloc::{HeapInfo, SharedHeap};
    pub use arena::{Arena, ArenaGuard};
    pub use spinlock::{InterruptMask, NoInterruptMask};
}
#[allow(non_snake_case)]
pub mod IPC {
    pub mod buffer;
    pub mod builder;
    pub mod context;
    pub mod envelope;
    pub mod interrupt;
    pub mod layout;
    pub mod queue;
    pub mod stream;
    pub use buffer::{MsgBuffer, MsgKind}; // re-export for stable path
    pub use builder::CoreBuilder;
    pub use context::{EventHandler, IpcContext, IpcEvent, MessageHandler, SendError};
    pub use envelope::Envelope;
    pub use interrupt::{DoorbellLine, InterruptLine, PollingLine};
    pub use stream::{SampleFormat, StreamChange, StreamConfig, StreamHandle};
}
#[allow(non_snake_case)]
pub mod Debug {
    pub mod StructDebug;
}
pub mod error;
pub mod ffi;

pub use error::{IpcError, Result};
pub use IPC::{CoreBuilder, IpcContext, MsgBuffer};
