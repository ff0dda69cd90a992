// Arena backing stores.
// Linux cores map a POSIX shm object (it shows up under /dev/shm); tests and
// single-process setups share one aligned allocation between in-process cores.

use std::fmt::Debug;
use std::io;
use std::ptr::NonNull;

#[cfg(target_os = "linux")]
use std::ffi::CString;
#[cfg(target_os = "linux")]
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

/// Minimum alignment every backend guarantees for its base address.
pub const BACKEND_ALIGN: usize = 8;

/// Backing memory for an arena.
///
/// The region must stay mapped, at the same address, for the lifetime of the backend.
pub trait SharedMemoryBackend: Send + Sync + Debug {
    /// Base of the region; arena offset 0.
    fn as_ptr(&self) -> *mut u8;

    fn size(&self) -> usize;

    fn raw_handle(&self) -> RawHandle;
}

/// What keeps the region alive underneath the mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawHandle {
    /// Descriptor of the shm object
    Fd(i32),
    /// Process-local memory, no OS object behind it
    Local,
}

/// Create a new, zero-filled POSIX shm object `<name>` and map it.
#[cfg(target_os = "linux")]
pub fn create_shared_memory(size: usize, name: &str) -> io::Result<Box<dyn SharedMemoryBackend>> {
    Ok(Box::new(ShmRegion::create(size, name)?))
}

/// Map an existing object created by the master core.
#[cfg(target_os = "linux")]
pub fn attach_shared_memory(name: &str, size: usize) -> io::Result<Box<dyn SharedMemoryBackend>> {
    Ok(Box::new(ShmRegion::attach(name, size)?))
}

#[cfg(not(target_os = "linux"))]
pub fn create_shared_memory(_size: usize, _name: &str) -> io::Result<Box<dyn SharedMemoryBackend>> {
    Err(no_shm())
}

#[cfg(not(target_os = "linux"))]
pub fn attach_shared_memory(_name: &str, _size: usize) -> io::Result<Box<dyn SharedMemoryBackend>> {
    Err(no_shm())
}

#[cfg(not(target_os = "linux"))]
fn no_shm() -> io::Error {
    io::Error::new(
        io::ErrorKind::Unsupported,
        "named arenas need POSIX shm; use HeapMemory on this platform",
    )
}

/// Remove the name; existing mappings stay valid.
#[cfg(target_os = "linux")]
pub fn unlink_shared_memory(name: &str) -> io::Result<()> {
    let cname = shm_name(name)?;
    if unsafe { libc::shm_unlink(cname.as_ptr()) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn unlink_shared_memory(_name: &str) -> io::Result<()> {
    Ok(())
}

/// `shm_open` wants a leading slash and nothing else that looks like a path.
#[cfg(target_os = "linux")]
fn shm_name(name: &str) -> io::Result<CString> {
    if name.is_empty() || name.contains('/') {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("bad shm object name {:?}", name),
        ));
    }
    CString::new(format!("/{}", name))
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "shm object name holds a NUL"))
}

/// A POSIX shm object mapped read-write and shared.
#[cfg(target_os = "linux")]
#[derive(Debug)]
pub struct ShmRegion {
    base: NonNull<u8>,
    len: usize,
    fd: OwnedFd,
}

#[cfg(target_os = "linux")]
unsafe impl Send for ShmRegion {}
#[cfg(target_os = "linux")]
unsafe impl Sync for ShmRegion {}

#[cfg(target_os = "linux")]
impl ShmRegion {
    /// Create (or truncate) the object and size it to `size` bytes.
    pub fn create(size: usize, name: &str) -> io::Result<Self> {
        let fd = Self::open(name, libc::O_CREAT | libc::O_TRUNC)?;
        // Growing a truncated object zero-fills it
        if unsafe { libc::ftruncate(fd.as_raw_fd(), size as libc::off_t) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Self::map(fd, size)
    }

    /// Open the object the master created; it must hold at least `size` bytes.
    pub fn attach(name: &str, size: usize) -> io::Result<Self> {
        let fd = Self::open(name, 0)?;
        let mut st: libc::stat = unsafe { std::mem::zeroed() };
        if unsafe { libc::fstat(fd.as_raw_fd(), &mut st) } != 0 {
            return Err(io::Error::last_os_error());
        }
        let have = st.st_size as usize;
        if have < size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("shm object {} holds {} bytes, {} requested", name, have, size),
            ));
        }
        Self::map(fd, have)
    }

    fn open(name: &str, extra_flags: libc::c_int) -> io::Result<OwnedFd> {
        let cname = shm_name(name)?;
        let raw = unsafe { libc::shm_open(cname.as_ptr(), libc::O_RDWR | extra_flags, 0o600) };
        if raw < 0 {
            // ENOENT surfaces as ErrorKind::NotFound
            let err = io::Error::last_os_error();
            return Err(io::Error::new(err.kind(), format!("shm object {}: {}", name, err)));
        }
        Ok(unsafe { OwnedFd::from_raw_fd(raw) })
    }

    fn map(fd: OwnedFd, len: usize) -> io::Result<Self> {
        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd.as_raw_fd(),
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            // fd closes on drop
            return Err(io::Error::last_os_error());
        }
        // Page aligned, so BACKEND_ALIGN holds
        let base = NonNull::new(addr.cast::<u8>())
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "mmap gave a null base"))?;
        Ok(Self { base, len, fd })
    }
}

#[cfg(target_os = "linux")]
impl Drop for ShmRegion {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base.as_ptr().cast(), self.len);
        }
    }
}

#[cfg(target_os = "linux")]
impl SharedMemoryBackend for ShmRegion {
    fn as_ptr(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    fn size(&self) -> usize {
        self.len
    }

    fn raw_handle(&self) -> RawHandle {
        RawHandle::Fd(self.fd.as_raw_fd())
    }
}

/// Zero-filled, 8-byte aligned process memory standing in for a physical shared region.
///
/// Cloning the `Arc` around it and handing one copy to each in-process core gives every
/// core the same base address, which is all the arena requires.
pub struct HeapMemory {
    ptr: NonNull<u64>,
    words: usize,
    size: usize,
}

impl HeapMemory {
    pub fn new(size: usize) -> Self {
        let words = size.div_ceil(BACKEND_ALIGN);
        let raw = Box::into_raw(vec![0u64; words].into_boxed_slice()) as *mut u64;
        Self {
            // Box never hands out null, even for an empty slice
            ptr: NonNull::new(raw).unwrap_or(NonNull::dangling()),
            words,
            size,
        }
    }
}

impl Drop for HeapMemory {
    fn drop(&mut self) {
        unsafe {
            drop(Box::from_raw(std::ptr::slice_from_raw_parts_mut(
                self.ptr.as_ptr(),
                self.words,
            )));
        }
    }
}

impl Debug for HeapMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeapMemory")
            .field("base", &format_args!("{:p}", self.ptr.as_ptr()))
            .field("size", &self.size)
            .finish()
    }
}

// Every access goes through the arena lock or through atomics
unsafe impl Send for HeapMemory {}
unsafe impl Sync for HeapMemory {}

impl SharedMemoryBackend for HeapMemory {
    fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr() as *mut u8
    }

    fn size(&self) -> usize {
        self.size
    }

    fn raw_handle(&self) -> RawHandle {
        RawHandle::Local
    }
}

impl<T: SharedMemoryBackend + ?Sized> SharedMemoryBackend for std::sync::Arc<T> {
    fn as_ptr(&self) -> *mut u8 {
        (**self).as_ptr()
    }

    fn size(&self) -> usize {
        (**self).size()
    }

    fn raw_handle(&self) -> RawHandle {
        (**self).raw_handle()
    }
}
