// Shared heap tests
// Run with: cargo test --test allocator_test -- --nocapture

use audio_ipc::Core::{HeapMemory, SharedHeap};
use audio_ipc::IPC::layout::HEAP_START;
use audio_ipc::{CoreBuilder, IpcContext, IpcError};

fn master(size: usize) -> IpcContext {
    CoreBuilder::new()
        .with_backend(HeapMemory::new(size))
        .build()
        .unwrap()
}

fn heap_image(ctx: &IpcContext) -> Vec<u8> {
    let heap: SharedHeap = *ctx.heap();
    let _guard = ctx.lock();
    let bytes = unsafe {
        std::slice::from_raw_parts(ctx.arena().ptr_at(heap.start()), heap.size() as usize)
    };
    bytes.to_vec()
}

#[test]
fn test_small_arena_scenario() {
    let ctx = master(4096);

    let first = ctx.malloc(100).expect("100 bytes should fit in a 4K arena");
    assert!(ctx.malloc(4000).is_none(), "4000 bytes cannot fit next to the header");
    ctx.free(first).unwrap();
    assert!(ctx.check_heap());
}

#[test]
fn test_fresh_heap_is_one_free_block() {
    let ctx = master(4096);
    let info = ctx.heap_info().unwrap();
    println!("fresh heap: {:?}", info);

    assert_eq!(ctx.heap().start() as usize, HEAP_START);
    assert_eq!(info.total_bytes as usize, 4096 - HEAP_START);
    assert_eq!(info.free_blocks, 1);
    assert_eq!(info.used_blocks, 0);
    assert_eq!(info.largest_free, info.free_bytes);
    assert_eq!(info.free_bytes, info.total_bytes - 16);
}

#[test]
fn test_payloads_are_aligned_and_disjoint() {
    let ctx = master(64 * 1024);
    let mut blocks = Vec::new();
    for size in [1usize, 7, 8, 9, 24, 100, 333, 1024] {
        let bp = ctx.malloc(size).unwrap();
        assert_eq!(bp % 8, 0, "payload {:#x} is not 8-byte aligned", bp);
        blocks.push((bp, size));
    }

    blocks.sort();
    for pair in blocks.windows(2) {
        let (a, a_len) = pair[0];
        let (b, _) = pair[1];
        assert!(a as usize + a_len <= b as usize, "blocks {:#x} and {:#x} overlap", a, b);
    }

    let guard = ctx.lock();
    for &(bp, size) in &blocks {
        assert!(ctx.heap().usable_size(&guard, bp).unwrap() as usize >= size);
        assert!(ctx.heap().is_allocated(&guard, bp));
    }
}

#[test]
fn test_zero_size_returns_none() {
    let ctx = master(4096);
    assert!(ctx.malloc(0).is_none());
    assert!(ctx.check_heap());
}

#[test]
fn test_round_trip_is_bit_identical() {
    let ctx = master(16 * 1024);
    let keep = ctx.malloc(200).unwrap();

    for size in [1usize, 16, 100, 512, 4000] {
        let before = heap_image(&ctx);
        let bp = ctx.malloc(size).unwrap();
        ctx.free(bp).unwrap();
        assert_eq!(before, heap_image(&ctx), "malloc({}) + free changed the heap", size);
    }

    ctx.free(keep).unwrap();
    assert_eq!(ctx.heap_info().unwrap().free_blocks, 1);
}

#[test]
fn test_neighbours_coalesce() {
    let ctx = master(16 * 1024);
    let initial = ctx.heap_info().unwrap();

    let a = ctx.malloc(64).unwrap();
    let b = ctx.malloc(64).unwrap();
    let c = ctx.malloc(64).unwrap();
    let d = ctx.malloc(64).unwrap();

    // a and c free, b between them still allocated
    ctx.free(a).unwrap();
    ctx.free(c).unwrap();
    assert_eq!(ctx.heap_info().unwrap().free_blocks, 3);

    // freeing b merges a, b, c into one block
    ctx.free(b).unwrap();
    let info = ctx.heap_info().unwrap();
    assert_eq!(info.free_blocks, 2);
    assert_eq!(info.used_blocks, 1);
    assert!(ctx.check_heap());

    ctx.free(d).unwrap();
    assert_eq!(ctx.heap_info().unwrap(), initial);
}

#[test]
fn test_free_rejects_bad_pointers() {
    let ctx = master(4096);
    let bp = ctx.malloc(32).unwrap();

    assert!(matches!(ctx.free(0), Err(IpcError::CorruptHeap)));
    assert!(matches!(ctx.free(bp + 4), Err(IpcError::CorruptHeap)));
    assert!(matches!(ctx.free(1 << 20), Err(IpcError::CorruptHeap)));

    ctx.free(bp).unwrap();
    assert!(matches!(ctx.free(bp), Err(IpcError::ReferenceError)));
    assert!(ctx.check_heap());
}

#[test]
fn test_exhaustion_and_recovery() {
    let ctx = master(8192);
    let mut blocks = Vec::new();
    while let Some(bp) = ctx.malloc(128) {
        blocks.push(bp);
    }
    println!("allocated {} blocks of 128 bytes before exhaustion", blocks.len());
    assert!(!blocks.is_empty());
    assert!(ctx.heap_info().unwrap().largest_free < 136);

    for bp in blocks.drain(..) {
        ctx.free(bp).unwrap();
    }
    let info = ctx.heap_info().unwrap();
    assert_eq!(info.free_blocks, 1);
    assert_eq!(info.used_blocks, 0);
}

#[test]
fn test_corruption_is_detected() {
    let ctx = master(4096);
    let bp = ctx.malloc(64).unwrap();
    assert!(ctx.check_heap());

    // Smash the block's header tag
    unsafe {
        let guard = ctx.lock();
        std::ptr::write(guard.ptr_at(bp - 4) as *mut u32, 0xdead_beef);
    }
    assert!(!ctx.check_heap());
    assert!(matches!(ctx.heap_info(), Err(IpcError::CorruptHeap)));
}

#[test]
fn test_random_sequences_keep_heap_consistent() {
    let ctx = master(64 * 1024);
    let initial = ctx.heap_info().unwrap();
    let mut rng = fastrand::Rng::with_seed(0x5eed);
    let mut live: Vec<u32> = Vec::new();

    for step in 0..5_000 {
        if live.is_empty() || rng.u8(..) < 140 {
            if let Some(bp) = ctx.malloc(rng.usize(1..=700)) {
                live.push(bp);
            }
        } else {
            let victim = live.swap_remove(rng.usize(..live.len()));
            ctx.free(victim).unwrap();
        }
        if step % 250 == 0 {
            assert!(ctx.check_heap(), "heap inconsistent at step {}", step);
        }
    }

    for bp in live {
        ctx.free(bp).unwrap();
    }
    assert_eq!(ctx.heap_info().unwrap(), initial);
}
