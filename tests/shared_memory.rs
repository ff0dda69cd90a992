// Shared memory backend tests for Linux
// Run with: cargo test --test shared_memory -- --nocapture

#[cfg(target_os = "linux")]
mod linux_tests {
    use audio_ipc::Core::{
        attach_shared_memory, create_shared_memory, unlink_shared_memory, RawHandle,
        SharedMemoryBackend,
    };
    use audio_ipc::IPC::layout::HEAP_START;
    use audio_ipc::{CoreBuilder, IpcError};
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_create_and_attach_see_the_same_bytes() {
        let name = "aeipc_test_same_bytes";
        let size = 8192;
        let master = create_shared_memory(size, name).unwrap();
        let other = attach_shared_memory(name, size).unwrap();

        assert_eq!(master.size(), size);
        assert!(matches!(master.raw_handle(), RawHandle::Fd(fd) if fd > 0));
        assert_ne!(master.as_ptr(), other.as_ptr(), "separate mappings of one file");

        unsafe {
            let a = std::slice::from_raw_parts_mut(master.as_ptr(), size);
            let b = std::slice::from_raw_parts(other.as_ptr(), size);
            assert!(b.iter().all(|&x| x == 0), "fresh region must be zero-filled");
            a[0] = 0x42;
            a[size - 1] = 0x24;
            assert_eq!(b[0], 0x42);
            assert_eq!(b[size - 1], 0x24);
        }
        unlink_shared_memory(name).unwrap();
    }

    #[test]
    #[serial]
    fn test_attach_missing_region_fails() {
        let err = attach_shared_memory("aeipc_test_does_not_exist", 4096).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::NotFound);
    }

    #[test]
    #[serial]
    fn test_attach_checks_size() {
        let name = "aeipc_test_small";
        let _master = create_shared_memory(4096, name).unwrap();
        let err = attach_shared_memory(name, 8192).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
        unlink_shared_memory(name).unwrap();
    }

    #[test]
    #[serial]
    fn test_two_cores_over_dev_shm() {
        let name = "aeipc_test_two_cores";
        let host = CoreBuilder::new()
            .with_shm_name(name)
            .with_arena_size(64 * 1024)
            .build()
            .unwrap();
        let dsp = CoreBuilder::attach(1)
            .with_shm_name(name)
            .with_arena_size(64 * 1024)
            .build()
            .unwrap();

        // Different mappings, same offsets
        assert_ne!(host.arena().ptr_at(0), dsp.arena().ptr_at(0));
        assert_eq!(host.heap(), dsp.heap());
        assert_eq!(host.heap().start() as usize, HEAP_START);

        host.send_bytes(b"across mappings", 1, true).unwrap();
        let msg = dsp.receive().unwrap();
        assert_eq!(msg.read_payload(dsp.arena()), b"across mappings");
        dsp.unref_buffer(msg).unwrap();
        assert_eq!(host.heap_info().unwrap().used_blocks, 0);

        drop(dsp);
        drop(host);
        unlink_shared_memory(name).unwrap();
    }

    #[test]
    #[serial]
    fn test_unformatted_region_is_refused() {
        let name = "aeipc_test_unformatted";
        let _raw = create_shared_memory(4096, name).unwrap();
        let err = CoreBuilder::attach(1)
            .with_shm_name(name)
            .with_arena_size(4096)
            .build()
            .unwrap_err();
        assert!(matches!(err, IpcError::Error(_)), "got {:?}", err);
        unlink_shared_memory(name).unwrap();
    }
}

#[cfg(not(target_os = "linux"))]
mod non_linux_tests {
    use audio_ipc::Core::{attach_shared_memory, create_shared_memory};

    #[test]
    fn test_unsupported_platform() {
        let err = create_shared_memory(4096, "aeipc").unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::Unsupported);
        let err = attach_shared_memory("aeipc", 4096).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::Unsupported);
    }
}
