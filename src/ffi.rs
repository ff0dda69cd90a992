// C boundary over one process-wide context.
//
// Buffers cross as their arena offset. A handle returned by `aeipc_create_msg_buffer`,
// `aeipc_receive` or passed to the receive callback carries one reference; the C side
// gives it back with `aeipc_unref_msg_buffer` or hands it on with `aeipc_send`.

use crate::error::{IpcError, Result, IPC_ERROR, IPC_OK};
use crate::IPC::builder::CoreBuilder;
use crate::IPC::context::{IpcContext, IpcEvent};
use crate::IPC::stream::{SampleFormat, StreamConfig, StreamHandle};
use crate::IPC::MsgBuffer;
use lazy_static::lazy_static;
use log::error;
use parking_lot::Mutex;
use std::ffi::{c_char, c_void, CStr};
use std::sync::Arc;

/// Receive callback: buffer handle, payload pointer, payload size, user data.
pub type ReceiveCallback = extern "C" fn(u32, *mut u8, usize, *mut c_void);

/// Event callback: event tag, source core, payload pointer, payload size, user data.
pub type EventCallback = extern "C" fn(u8, u8, *const u8, usize, *mut c_void);

lazy_static! {
    static ref CONTEXT: Mutex<Option<Arc<IpcContext>>> = Mutex::new(None);
}

/// Opaque user pointer, only ever handed back to the C code that supplied it.
#[derive(Clone, Copy)]
struct UserData(*mut c_void);

unsafe impl Send for UserData {}
unsafe impl Sync for UserData {}

fn context() -> Result<Arc<IpcContext>> {
    CONTEXT
        .lock()
        .clone()
        .ok_or_else(|| IpcError::Error("aeipc_init has not been called".into()))
}

fn code<T>(res: Result<T>) -> i32 {
    match res {
        Ok(_) => IPC_OK,
        Err(e) => e.code(),
    }
}

/// Bring up this process as core `core`.
///
/// # Arguments
/// * `shm_name` - NUL-terminated `/dev/shm` name, or NULL for process-local memory (master only).
/// * `arena_size` - Bytes to create or map; 0 selects the default.
///
/// # Returns
/// * 0 on success, negative error code otherwise.
#[no_mangle]
pub extern "C" fn aeipc_init(
    core: u8,
    is_master: bool,
    shm_name: *const c_char,
    arena_size: usize,
) -> i32 {
    let mut slot = CONTEXT.lock();
    if slot.is_some() {
        return IPC_ERROR;
    }

    let mut builder = CoreBuilder::new()
        .with_core_index(core)
        .with_master(is_master);
    if arena_size != 0 {
        builder = builder.with_arena_size(arena_size);
    }
    if !shm_name.is_null() {
        let name = match unsafe { CStr::from_ptr(shm_name) }.to_str() {
            Ok(name) => name,
            Err(_) => return IPC_ERROR,
        };
        builder = builder.with_shm_name(name);
    }

    match builder.build() {
        Ok(ctx) => {
            *slot = Some(Arc::new(ctx));
            IPC_OK
        }
        Err(e) => {
            error!("aeipc_init for core {} failed: {}", core, e);
            e.code()
        }
    }
}

/// Leave the arena. Queued buffers for this core are released.
#[no_mangle]
pub extern "C" fn aeipc_shutdown() -> i32 {
    match CONTEXT.lock().take() {
        Some(_) => IPC_OK,
        None => IPC_ERROR,
    }
}

/// Allocate a buffer with `size` payload bytes.
///
/// # Arguments
/// * `out_handle` - Receives the buffer handle.
/// * `out_payload` - Receives the payload address; may be NULL.
#[no_mangle]
pub extern "C" fn aeipc_create_msg_buffer(
    size: u32,
    out_handle: *mut u32,
    out_payload: *mut *mut u8,
) -> i32 {
    if out_handle.is_null() {
        return IPC_ERROR;
    }
    let res = context().and_then(|ctx| {
        let msg = ctx.create_msg_buffer(size as usize)?;
        let payload = ctx.arena().ptr_at(msg.payload_offset());
        Ok((msg.into_raw(), payload))
    });
    match res {
        Ok((handle, payload)) => {
            unsafe {
                *out_handle = handle;
                if !out_payload.is_null() {
                    *out_payload = payload;
                }
            }
            IPC_OK
        }
        Err(e) => e.code(),
    }
}

/// Take an extra reference on `handle`.
#[no_mangle]
pub extern "C" fn aeipc_ref_msg_buffer(handle: u32) -> i32 {
    code(context().and_then(|ctx| {
        let msg = unsafe { MsgBuffer::from_raw(handle) };
        let extra = ctx.ref_buffer(&msg);
        // Both references stay with the C caller
        let _ = msg.into_raw();
        extra.map(MsgBuffer::into_raw)
    }))
}

/// Drop one reference on `handle`.
#[no_mangle]
pub extern "C" fn aeipc_unref_msg_buffer(handle: u32) -> i32 {
    code(context().and_then(|ctx| ctx.unref_buffer(unsafe { MsgBuffer::from_raw(handle) })))
}

/// Queue `handle` for `dest_core`. On failure the caller still holds the reference.
#[no_mangle]
pub extern "C" fn aeipc_send(handle: u32, dest_core: u8, signal: bool) -> i32 {
    let ctx = match context() {
        Ok(ctx) => ctx,
        Err(e) => return e.code(),
    };
    match ctx.send(unsafe { MsgBuffer::from_raw(handle) }, dest_core, signal) {
        Ok(()) => IPC_OK,
        Err(e) => {
            let code = e.error.code();
            let _ = e.into_inner().into_raw();
            code
        }
    }
}

/// Take the oldest buffer off this core's ring without dispatching it.
#[no_mangle]
pub extern "C" fn aeipc_receive(out_handle: *mut u32) -> i32 {
    if out_handle.is_null() {
        return IPC_ERROR;
    }
    match context().and_then(|ctx| ctx.receive()) {
        Ok(msg) => {
            unsafe { *out_handle = msg.into_raw() };
            IPC_OK
        }
        Err(e) => e.code(),
    }
}

/// Install the user-message callback. The callback owns the handle it receives.
#[no_mangle]
pub extern "C" fn aeipc_register_receive_callback(
    callback: Option<ReceiveCallback>,
    user: *mut c_void,
) -> i32 {
    let (ctx, callback) = match (context(), callback) {
        (Ok(ctx), Some(callback)) => (ctx, callback),
        (Err(e), _) => return e.code(),
        (_, None) => return IPC_ERROR,
    };
    let user = UserData(user);
    ctx.register_receive_callback(move |ctx: &IpcContext, msg: MsgBuffer| {
        let user = user;
        let payload = ctx.arena().ptr_at(msg.payload_offset());
        let size = msg.size(ctx.arena());
        callback(msg.into_raw(), payload, size, user.0);
    });
    IPC_OK
}

/// Install the event callback. The payload is valid only during the call.
#[no_mangle]
pub extern "C" fn aeipc_register_event_callback(
    callback: Option<EventCallback>,
    user: *mut c_void,
) -> i32 {
    let (ctx, callback) = match (context(), callback) {
        (Ok(ctx), Some(callback)) => (ctx, callback),
        (Err(e), _) => return e.code(),
        (_, None) => return IPC_ERROR,
    };
    let user = UserData(user);
    ctx.register_event_callback(move |_: &IpcContext, event: &IpcEvent<'_>| {
        let user = user;
        callback(
            event.tag,
            event.source_core,
            event.data.as_ptr(),
            event.data.len(),
            user.0,
        );
    });
    IPC_OK
}

/// Register a stream owned by this core.
///
/// # Arguments
/// * `name` - NUL-terminated, 1 to 31 bytes.
/// * `format` - 0 = S16, 1 = S24, 2 = S32, 3 = F32.
/// * `out_handle`, `out_stream_id`, `out_generation` - Receive the parts of the stream
///   handle; all three go back to `aeipc_unregister_stream`.
#[no_mangle]
#[allow(clippy::too_many_arguments)]
pub extern "C" fn aeipc_register_stream(
    name: *const c_char,
    sample_rate: u32,
    block_size: u32,
    channels: u8,
    format: u8,
    callback_token: u32,
    out_handle: *mut u32,
    out_stream_id: *mut u8,
    out_generation: *mut u32,
) -> i32 {
    if name.is_null() || out_handle.is_null() || out_stream_id.is_null() || out_generation.is_null() {
        return IPC_ERROR;
    }
    let name = match unsafe { CStr::from_ptr(name) }.to_str() {
        Ok(name) => name,
        Err(_) => return IpcError::BadStreamName.code(),
    };
    let format = match SampleFormat::from_u8(format) {
        Some(format) => format,
        None => return IPC_ERROR,
    };
    let config = StreamConfig::new(name)
        .sample_rate(sample_rate)
        .block_size(block_size)
        .channels(channels)
        .format(format)
        .callback_token(callback_token);

    match context().and_then(|ctx| ctx.register_stream(&config)) {
        Ok(handle) => {
            unsafe {
                *out_handle = handle.offset();
                *out_stream_id = handle.stream_id();
                *out_generation = handle.generation();
            }
            IPC_OK
        }
        Err(e) => e.code(),
    }
}

#[no_mangle]
pub extern "C" fn aeipc_unregister_stream(handle: u32, stream_id: u8, generation: u32) -> i32 {
    let handle = StreamHandle::from_parts(handle, stream_id, generation);
    code(context().and_then(|ctx| ctx.unregister_stream(handle)))
}

/// Send an event to every ready core.
///
/// # Returns
/// * Number of cores reached, or a negative error code.
#[no_mangle]
pub extern "C" fn aeipc_broadcast_event(tag: u8, data: *const u8, len: usize) -> i32 {
    if data.is_null() && len != 0 {
        return IPC_ERROR;
    }
    let data = if len == 0 {
        &[][..]
    } else {
        unsafe { std::slice::from_raw_parts(data, len) }
    };
    match context().and_then(|ctx| ctx.broadcast_event(tag, data)) {
        Ok(reached) => reached as i32,
        Err(e) => e.code(),
    }
}

/// Drain and dispatch this core's ring. Returns the number of buffers serviced.
#[no_mangle]
pub extern "C" fn aeipc_service_interrupt() -> i32 {
    match context() {
        Ok(ctx) => ctx.service_interrupt() as i32,
        Err(e) => e.code(),
    }
}

/// 0 if the heap walk finds no inconsistency, `IPC_CORRUPT_HEAP` otherwise.
#[no_mangle]
pub extern "C" fn aeipc_check_heap() -> i32 {
    match context() {
        Ok(ctx) if ctx.check_heap() => IPC_OK,
        Ok(_) => IpcError::CorruptHeap.code(),
        Err(e) => e.code(),
    }
}
