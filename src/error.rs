//! IPC result codes

use thiserror::Error;

/// Errors returned by every fallible IPC operation.
///
/// Resource exhaustion (`NoMemory`, `QueueFull`) and `QueueEmpty` are expected and
/// recoverable. `ReferenceError`, `BadStream` and `BadStreamName` indicate a caller bug.
/// `CoreNotReady` clears once the destination core has finished its own bring-up.
#[derive(Debug, Error)]
pub enum IpcError {
    #[error("IPC error: {0}")]
    Error(String),

    #[error("Shared heap exhausted")]
    NoMemory,

    #[error("Destination queue is full")]
    QueueFull,

    #[error("Queue is empty")]
    QueueEmpty,

    #[error("Core {0} has not registered with the arena yet")]
    CoreNotReady(u8),

    #[error("A stream with this name is already registered")]
    StreamExists,

    #[error("Stream name must be 1..={max} bytes without NUL", max = crate::IPC::layout::STREAM_NAME_LEN - 1)]
    BadStreamName,

    #[error("Stream handle does not refer to a stream owned by this core")]
    BadStream,

    #[error("Reference count over- or underflow")]
    ReferenceError,

    #[error("Shared heap failed consistency check")]
    CorruptHeap,

    #[error("Shared memory backend: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, IpcError>;

pub const IPC_OK: i32 = 0;
pub const IPC_ERROR: i32 = -1;
pub const IPC_NO_MEMORY: i32 = -2;
pub const IPC_QUEUE_FULL: i32 = -3;
pub const IPC_QUEUE_EMPTY: i32 = -4;
pub const IPC_CORE_NOT_READY: i32 = -5;
pub const IPC_STREAM_EXISTS: i32 = -6;
pub const IPC_BAD_STREAM_NAME: i32 = -7;
pub const IPC_BAD_STREAM: i32 = -8;
pub const IPC_REFERENCE_ERROR: i32 = -9;
pub const IPC_CORRUPT_HEAP: i32 = -10;

impl IpcError {
    /// Stable numeric code used at the C boundary.
    pub fn code(&self) -> i32 {
        match self {
            IpcError::Error(_) | IpcError::Io(_) => IPC_ERROR,
            IpcError::NoMemory => IPC_NO_MEMORY,
            IpcError::QueueFull => IPC_QUEUE_FULL,
            IpcError::QueueEmpty => IPC_QUEUE_EMPTY,
            IpcError::CoreNotReady(_) => IPC_CORE_NOT_READY,
            IpcError::StreamExists => IPC_STREAM_EXISTS,
            IpcError::BadStreamName => IPC_BAD_STREAM_NAME,
            IpcError::BadStream => IPC_BAD_STREAM,
            IpcError::ReferenceError => IPC_REFERENCE_ERROR,
            IpcError::CorruptHeap => IPC_CORRUPT_HEAP,
        }
    }

    /// Expected conditions a caller retries or drops on.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            IpcError::NoMemory | IpcError::QueueFull | IpcError::QueueEmpty | IpcError::CoreNotReady(_)
        )
    }
}
