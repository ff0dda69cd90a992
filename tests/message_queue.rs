// Queue, send/receive and dispatch tests between two in-process cores
// Run with: cargo test --test message_queue -- --nocapture

use audio_ipc::Core::HeapMemory;
use audio_ipc::IPC::layout::{CoreQueue, QUEUE_CAPACITY};
use audio_ipc::IPC::{IpcEvent, MsgKind, PollingLine};
use audio_ipc::{CoreBuilder, IpcContext, IpcError, MsgBuffer};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn two_cores() -> (IpcContext, IpcContext) {
    let mem = Arc::new(HeapMemory::new(64 * 1024));
    let a = CoreBuilder::new()
        .with_backend(Arc::clone(&mem))
        .with_interrupt_line(Arc::new(PollingLine))
        .build()
        .unwrap();
    let b = CoreBuilder::attach(1)
        .with_backend(mem)
        .with_interrupt_line(Arc::new(PollingLine))
        .build()
        .unwrap();
    (a, b)
}

#[test]
fn test_ring_in_isolation() {
    let mut q = CoreQueue::default();
    assert!(q.is_empty());
    assert_eq!(q.capacity(), QUEUE_CAPACITY);

    for i in 1..QUEUE_CAPACITY as u32 {
        q.push(i * 8).unwrap();
    }
    assert!(q.is_full());
    assert_eq!(q.len(), QUEUE_CAPACITY - 1);

    let (head, tail) = (q.head, q.tail);
    assert!(matches!(q.push(999), Err(IpcError::QueueFull)));
    assert_eq!((q.head, q.tail), (head, tail), "a rejected push must not move the ring");

    assert_eq!(q.peek(), Some(8));
    for i in 1..QUEUE_CAPACITY as u32 {
        assert_eq!(q.pop().unwrap(), i * 8);
    }
    assert!(matches!(q.pop(), Err(IpcError::QueueEmpty)));
}

#[test]
fn test_ring_wraps_around() {
    let mut q = CoreQueue::default();
    for round in 0..5u32 {
        for i in 0..10 {
            q.push(round * 100 + i).unwrap();
        }
        for i in 0..10 {
            assert_eq!(q.pop().unwrap(), round * 100 + i);
        }
    }
    assert!(q.is_empty());
}

#[test]
fn test_seventeen_sends_into_a_sixteen_slot_ring() {
    let (a, b) = two_cores();

    for i in 0..15u32 {
        a.send_bytes(&i.to_le_bytes(), 1, false).unwrap();
    }
    let msg = a.create_msg_buffer_from(&15u32.to_le_bytes()).unwrap();
    let err = a.send(msg, 1, true).unwrap_err();
    assert!(matches!(err.error, IpcError::QueueFull));
    let msg = err.into_inner();

    let first = b.receive().unwrap();
    assert_eq!(first.read_payload(b.arena()), 0u32.to_le_bytes());
    b.unref_buffer(first).unwrap();

    a.send(msg, 1, true).unwrap();
    assert_eq!(b.pending(), QUEUE_CAPACITY - 1);

    for expected in 1..=15u32 {
        let msg = b.receive().unwrap();
        assert_eq!(msg.read_payload(b.arena()), expected.to_le_bytes());
        b.unref_buffer(msg).unwrap();
    }
    assert!(matches!(b.receive(), Err(IpcError::QueueEmpty)));
    assert_eq!(a.heap_info().unwrap().used_blocks, 0);
}

#[test]
fn test_send_to_absent_core() {
    let (a, _b) = two_cores();
    let msg = a.create_msg_buffer(8).unwrap();

    let err = a.send(msg, 2, true).unwrap_err();
    assert!(matches!(err.error, IpcError::CoreNotReady(2)));
    let msg = err.into_inner();
    assert_eq!(a.ref_count(&msg), 1, "a failed send keeps the caller's reference");

    let err = a.send(msg, 9, true).unwrap_err();
    assert!(matches!(err.error, IpcError::Error(_)));
    a.unref_buffer(err.into_inner()).unwrap();
}

#[test]
fn test_core_leaving_is_no_longer_ready() {
    let (a, b) = two_cores();
    assert!(a.is_core_ready(1));
    a.send_bytes(b"left behind", 1, false).unwrap();

    drop(b);
    assert!(!a.is_core_ready(1));
    // Whatever was queued for the departed core was released with it
    assert_eq!(a.heap_info().unwrap().used_blocks, 0);
    assert!(matches!(a.send_bytes(b"x", 1, false), Err(IpcError::CoreNotReady(1))));
}

#[test]
fn test_dispatch_hands_user_messages_to_the_handler() {
    let (a, b) = two_cores();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_in_handler = Arc::clone(&seen);
    b.register_receive_callback(move |ctx: &IpcContext, msg: MsgBuffer| {
        assert_eq!(msg.kind(ctx.arena()), Some(MsgKind::User));
        seen_in_handler
            .lock()
            .push((msg.source_core(ctx.arena()), msg.read_payload(ctx.arena())));
        ctx.unref_buffer(msg).unwrap();
    });

    a.send_bytes(b"one", 1, false).unwrap();
    a.send_bytes(b"two", 1, true).unwrap();
    assert_eq!(b.service_interrupt(), 2);
    assert_eq!(b.service_interrupt(), 0);

    assert_eq!(
        *seen.lock(),
        vec![(0, b"one".to_vec()), (0, b"two".to_vec())]
    );
    assert_eq!(a.heap_info().unwrap().used_blocks, 0);
}

#[test]
fn test_unclaimed_messages_are_released() {
    let (a, b) = two_cores();
    a.send_bytes(b"nobody listens", 1, true).unwrap();
    assert_eq!(b.service_interrupt(), 1);
    assert_eq!(a.heap_info().unwrap().used_blocks, 0);
}

#[test]
fn test_handler_may_keep_and_forward_the_buffer() {
    let (a, b) = two_cores();
    b.register_receive_callback(|ctx: &IpcContext, msg: MsgBuffer| {
        // Bounce it straight back, handing our reference on
        let src = msg.source_core(ctx.arena());
        if let Err(e) = ctx.send(msg, src, true) {
            ctx.unref_buffer(e.into_inner()).unwrap();
        }
    });
    let echoed = Arc::new(AtomicUsize::new(0));
    let echoed_in_handler = Arc::clone(&echoed);
    a.register_receive_callback(move |ctx: &IpcContext, msg: MsgBuffer| {
        assert_eq!(msg.source_core(ctx.arena()), 1);
        assert_eq!(msg.read_payload(ctx.arena()), b"ping");
        echoed_in_handler.fetch_add(1, Ordering::SeqCst);
        ctx.unref_buffer(msg).unwrap();
    });

    a.send_bytes(b"ping", 1, true).unwrap();
    b.service_interrupt();
    a.service_interrupt();
    assert_eq!(echoed.load(Ordering::SeqCst), 1);
    assert!(a.check_heap());
    assert_eq!(a.heap_info().unwrap().used_blocks, 0);
}

#[test]
fn test_broadcast_reaches_every_ready_core() {
    let (a, b) = two_cores();
    let events = Arc::new(Mutex::new(Vec::new()));
    for ctx in [&a, &b] {
        let events = Arc::clone(&events);
        ctx.register_event_callback(move |ctx: &IpcContext, event: &IpcEvent<'_>| {
            events
                .lock()
                .push((ctx.core_index(), event.tag, event.source_core, event.data.to_vec()));
        });
    }

    assert_eq!(a.broadcast_event(42, b"hello").unwrap(), 2);
    // Still alive: one reference per recipient
    assert_eq!(a.heap_info().unwrap().used_blocks, 1);

    b.service_interrupt();
    assert_eq!(a.heap_info().unwrap().used_blocks, 1);
    a.service_interrupt();
    assert_eq!(a.heap_info().unwrap().used_blocks, 0);

    let mut events = events.lock().clone();
    events.sort();
    assert_eq!(
        events,
        vec![(0, 42, 0, b"hello".to_vec()), (1, 42, 0, b"hello".to_vec())]
    );
}

#[test]
fn test_broadcast_skips_full_rings() {
    let (a, b) = two_cores();
    for _ in 0..QUEUE_CAPACITY - 1 {
        a.send_bytes(b"filler", 1, false).unwrap();
    }

    // Core 1's ring is full; only core 0 gets the event
    assert_eq!(a.broadcast_event(7, &[]).unwrap(), 1);
    a.service_interrupt();
    b.service_interrupt();
    assert_eq!(a.heap_info().unwrap().used_blocks, 0);
}

#[test]
fn test_wait_for_interrupt_returns_after_timeout() {
    let (a, _b) = two_cores();
    let serviced = a.wait_for_interrupt(Some(std::time::Duration::from_millis(5)));
    assert_eq!(serviced, 0);
}

#[test]
fn test_shared_buffer_keeps_its_first_sender() {
    let (a, b) = two_cores();
    let msg = a.create_msg_buffer_from(b"shared").unwrap();
    let kept = a.ref_buffer(&msg).unwrap();
    a.send(msg, 1, false).unwrap();

    // b forwards its reference while a still holds one; the header is left alone
    let leg = b.receive().unwrap();
    assert_eq!(leg.source_core(b.arena()), 0);
    b.send(leg, 0, false).unwrap();

    let back = a.receive().unwrap();
    assert_eq!(back.source_core(a.arena()), 0);
    assert_eq!(back.read_payload(a.arena()), b"shared");
    assert_eq!(a.unref_buffer(back).unwrap(), 1);

    // A forward by the only holder records the forwarding core
    a.send_bytes(b"solo", 1, false).unwrap();
    let solo = b.receive().unwrap();
    assert_eq!(solo.source_core(b.arena()), 0);
    b.send(solo, 0, false).unwrap();
    let solo = a.receive().unwrap();
    assert_eq!(solo.source_core(a.arena()), 1);
    a.unref_buffer(solo).unwrap();

    assert_eq!(a.unref_buffer(kept).unwrap(), 0);
    assert_eq!(a.heap_info().unwrap().used_blocks, 0);
}
