// Message buffer reference counting
// Run with: cargo test --test refcount -- --nocapture

use audio_ipc::Core::HeapMemory;
use audio_ipc::IPC::buffer::MAX_REFS;
use audio_ipc::IPC::layout::MSG_HEADER_SIZE;
use audio_ipc::IPC::MsgKind;
use audio_ipc::{CoreBuilder, IpcContext, IpcError};

fn master() -> IpcContext {
    CoreBuilder::new()
        .with_backend(HeapMemory::new(32 * 1024))
        .build()
        .unwrap()
}

#[test]
fn test_fresh_buffer() {
    let ctx = master();
    let msg = ctx.create_msg_buffer(48).unwrap();
    let header = msg.header(ctx.arena());

    assert_eq!(header.ref_count, 1);
    assert_eq!(header.src_core, 0);
    assert_eq!(header.size, 48);
    assert_eq!(header.payload, msg.offset() + MSG_HEADER_SIZE as u32);
    assert_eq!(msg.kind(ctx.arena()), Some(MsgKind::User));
    assert_eq!(header.payload % 8, 0, "payload must keep the heap alignment");
    assert_eq!(header.magic, audio_ipc::IPC::layout::MSG_MAGIC);

    assert_eq!(ctx.unref_buffer(msg).unwrap(), 0);
    assert_eq!(ctx.heap_info().unwrap().used_blocks, 0);
}

#[test]
fn test_saturation_at_255() {
    let ctx = master();
    let msg = ctx.create_msg_buffer(16).unwrap();

    let mut extra = Vec::new();
    for _ in 0..(MAX_REFS - 1) {
        extra.push(ctx.ref_buffer(&msg).unwrap());
    }
    assert_eq!(ctx.ref_count(&msg), 255);
    assert!(matches!(ctx.ref_buffer(&msg), Err(IpcError::ReferenceError)));
    assert_eq!(ctx.ref_count(&msg), 255, "a refused ref leaves the count alone");

    for handle in extra {
        assert!(ctx.unref_buffer(handle).unwrap() > 0);
        assert_eq!(ctx.heap_info().unwrap().used_blocks, 1);
    }
    assert_eq!(ctx.unref_buffer(msg).unwrap(), 0);
    assert_eq!(ctx.heap_info().unwrap().used_blocks, 0);
}

#[test]
fn test_freed_exactly_when_count_reaches_zero() {
    let ctx = master();
    let msg = ctx.create_msg_buffer(100).unwrap();
    let second = ctx.ref_buffer(&msg).unwrap();
    let third = ctx.ref_buffer(&msg).unwrap();

    assert_eq!(ctx.unref_buffer(third).unwrap(), 2);
    assert_eq!(ctx.unref_buffer(second).unwrap(), 1);
    assert_eq!(ctx.heap_info().unwrap().used_blocks, 1);
    assert_eq!(ctx.unref_buffer(msg).unwrap(), 0);
    assert_eq!(ctx.heap_info().unwrap().used_blocks, 0);
}

#[test]
fn test_unref_at_zero_is_an_error() {
    let ctx = master();
    let msg = ctx.create_msg_buffer(8).unwrap();
    let offset = msg.offset();
    ctx.unref_buffer(msg).unwrap();

    // A stale handle forged from the old offset
    let stale = unsafe { audio_ipc::MsgBuffer::from_raw(offset) };
    assert!(matches!(ctx.unref_buffer(stale), Err(IpcError::ReferenceError)));
    assert!(ctx.check_heap());
}

#[test]
fn test_payload_read_write() {
    let ctx = master();
    let msg = ctx.create_msg_buffer_from(b"abcdefgh").unwrap();
    assert_eq!(msg.size(ctx.arena()), 8);
    assert_eq!(msg.read_payload(ctx.arena()), b"abcdefgh");

    // Writes are truncated to the payload size
    assert_eq!(msg.write_payload(ctx.arena(), b"0123456789"), 8);
    assert_eq!(msg.read_payload(ctx.arena()), b"01234567");
    ctx.unref_buffer(msg).unwrap();
}

#[test]
fn test_create_fails_when_heap_is_exhausted() {
    let ctx = master();
    assert!(matches!(
        ctx.create_msg_buffer(ctx.max_payload() + 1),
        Err(IpcError::NoMemory)
    ));
    let big = ctx.create_msg_buffer(ctx.max_payload()).unwrap();
    assert!(matches!(ctx.create_msg_buffer(1), Err(IpcError::NoMemory)));
    ctx.unref_buffer(big).unwrap();
    assert!(ctx.check_heap());
}

#[test]
fn test_raw_free_refuses_a_live_buffer() {
    let ctx = master();
    let msg = ctx.create_msg_buffer(24).unwrap();

    assert!(matches!(ctx.free(msg.offset()), Err(IpcError::ReferenceError)));
    assert_eq!(ctx.ref_count(&msg), 1);
    assert_eq!(ctx.heap_info().unwrap().used_blocks, 1);
    ctx.unref_buffer(msg).unwrap();

    // The released block is an ordinary raw allocation again
    let raw = ctx.malloc(24).unwrap();
    ctx.free(raw).unwrap();
    assert!(ctx.check_heap());
}
