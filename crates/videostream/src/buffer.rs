// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

//! Buffer provider: turns a byte size into a kernel-backed, `mmap`-able,
//! file-descriptor-shareable allocation, either from a Linux DMA-BUF heap or
//! from POSIX shared memory.
//!
//! Selection policy, matching the core's allocation contract:
//!
//! - an explicit path under `/dev/` is treated as a DMA-BUF heap device and
//!   opened directly;
//! - any other explicit path is treated as a POSIX shm object name;
//! - no path tries each heap in [`DEFAULT_HEAPS`] in order, falling back to
//!   an anonymous shm object under [`SHM_NAME_PREFIX`] if none are usable.

use crate::Error;
use std::ffi::CString;
use std::io;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};

/// DMA-BUF heaps tried, in order, when no explicit allocation path is given.
pub const DEFAULT_HEAPS: &[&str] = &["system", "cma", "reserved"];

/// Prefix for anonymous POSIX shm objects created when no heap is available.
pub const SHM_NAME_PREFIX: &str = "/vsl";

static SHM_SEQ: AtomicU32 = AtomicU32::new(0);

/// Which mechanism backs an [`Allocation`], needed by [`crate::frame::Frame`]
/// to route `sync()` (DmaBuf cache maintenance ioctl is a no-op on shm) and
/// `unalloc()` (shm must `shm_unlink` its name; DmaBuf just closes the fd).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    DmaBuf,
    Shm,
}

/// A kernel-backed buffer: an owned file descriptor plus its size and, for
/// DmaBuf allocations, its physical base address where known.
#[derive(Debug)]
pub struct Allocation {
    pub fd: OwnedFd,
    pub size: usize,
    pub kind: ProviderKind,
    /// Name to `shm_unlink` on release, for [`ProviderKind::Shm`].
    pub shm_name: Option<CString>,
    /// Physical/base address, resolved once at allocation time so later
    /// accessors can stay pure reads (see spec's `paddr` caching note).
    pub paddr: Option<u64>,
}

/// Allocates a buffer of `size` bytes, following the policy above.
///
/// `path`, if given, is either a `/dev/...` DmaBuf heap device or an explicit
/// shm object name. If `None`, the default heap list is tried first.
pub fn allocate(size: usize, path: Option<&Path>) -> Result<Allocation, Error> {
    if size == 0 {
        return Err(Error::InvalidArgument("buffer size must be non-zero"));
    }

    match path {
        Some(p) if p.starts_with("/dev/") => alloc_dma_heap(p, size),
        Some(p) => alloc_named_shm(p, size),
        None => {
            for heap in DEFAULT_HEAPS {
                let dev = Path::new("/dev/dma_heap").join(heap);
                match alloc_dma_heap(&dev, size) {
                    Ok(alloc) => return Ok(alloc),
                    Err(Error::Permission(_)) | Err(Error::Io(_)) | Err(Error::NoMemory(_)) => {
                        continue
                    }
                    Err(e) => return Err(e),
                }
            }
            alloc_anonymous_shm(size)
        }
    }
}

// --- DMA-BUF heap allocation -------------------------------------------------
//
// uAPI from <linux/dma-heap.h>:
//
//   struct dma_heap_allocation_data {
//       __u64 len;
//       __u32 fd;
//       __u32 fd_flags;
//       __u64 heap_flags;
//   };
//   #define DMA_HEAP_IOCTL_ALLOC _IOWR('H', 0x0, struct dma_heap_allocation_data)
//
// `_IOWR(type, nr, struct)` packs as:
//   dir(2 bits, 3=READ|WRITE) << 30 | size << 16 | type << 8 | nr
// with size = sizeof(struct dma_heap_allocation_data) = 24.

#[repr(C)]
struct DmaHeapAllocationData {
    len: u64,
    fd: u32,
    fd_flags: u32,
    heap_flags: u64,
}

const DMA_HEAP_IOCTL_ALLOC: libc::c_ulong = 0xC0184800;

fn alloc_dma_heap(device: &Path, size: usize) -> Result<Allocation, Error> {
    let c_path = CString::new(device.as_os_str().to_str().ok_or(Error::InvalidArgument(
        "heap device path is not valid UTF-8",
    ))?)?;

    let heap_fd = unsafe { libc::open(c_path.as_ptr(), libc::O_RDWR | libc::O_CLOEXEC) };
    if heap_fd < 0 {
        let err = io::Error::last_os_error();
        return Err(match err.kind() {
            io::ErrorKind::PermissionDenied => Error::Permission(err),
            _ => Error::Io(err),
        });
    }
    let heap_fd = unsafe { OwnedFd::from_raw_fd(heap_fd) };

    let mut data = DmaHeapAllocationData {
        len: size as u64,
        fd: 0,
        fd_flags: (libc::O_RDWR | libc::O_CLOEXEC) as u32,
        heap_flags: 0,
    };

    let rc = unsafe {
        libc::ioctl(
            std::os::fd::AsRawFd::as_raw_fd(&heap_fd),
            DMA_HEAP_IOCTL_ALLOC,
            &mut data,
        )
    };
    if rc < 0 {
        let err = io::Error::last_os_error();
        return Err(match err.kind() {
            io::ErrorKind::PermissionDenied => Error::Permission(err),
            _ => Error::NoMemory(err),
        });
    }

    let buf_fd = unsafe { OwnedFd::from_raw_fd(data.fd as RawFd) };
    Ok(Allocation {
        fd: buf_fd,
        size,
        kind: ProviderKind::DmaBuf,
        shm_name: None,
        paddr: None,
    })
}

// --- POSIX shared memory -----------------------------------------------------

fn alloc_named_shm(path: &Path, size: usize) -> Result<Allocation, Error> {
    let name_str = path
        .to_str()
        .ok_or(Error::InvalidArgument("shm name is not valid UTF-8"))?;
    let name = CString::new(name_str)?;
    create_shm(name, size)
}

fn alloc_anonymous_shm(size: usize) -> Result<Allocation, Error> {
    let seq = SHM_SEQ.fetch_add(1, Ordering::Relaxed);
    let name_str = format!("{SHM_NAME_PREFIX}-{}-{seq}", std::process::id());
    let name = CString::new(name_str).expect("generated shm name has no interior NUL");
    create_shm(name, size)
}

fn create_shm(name: CString, size: usize) -> Result<Allocation, Error> {
    let fd = unsafe {
        libc::shm_open(
            name.as_ptr(),
            libc::O_CREAT | libc::O_EXCL | libc::O_RDWR,
            0o600,
        )
    };
    if fd < 0 {
        let err = io::Error::last_os_error();
        return Err(match err.kind() {
            io::ErrorKind::PermissionDenied => Error::Permission(err),
            io::ErrorKind::AlreadyExists => Error::PathInUse(name.to_str().unwrap_or("").into()),
            _ => Error::Io(err),
        });
    }
    let fd = unsafe { OwnedFd::from_raw_fd(fd) };

    let rc = unsafe {
        libc::ftruncate(
            std::os::fd::AsRawFd::as_raw_fd(&fd),
            size as libc::off_t,
        )
    };
    if rc != 0 {
        let err = io::Error::last_os_error();
        unsafe { libc::shm_unlink(name.as_ptr()) };
        return Err(Error::NoMemory(err));
    }

    Ok(Allocation {
        fd,
        size,
        kind: ProviderKind::Shm,
        shm_name: Some(name),
        paddr: None,
    })
}

/// Removes a named shm object, called once when a [`crate::frame::Frame`]
/// backed by it is released. Idempotent: a missing name is not an error.
pub fn unlink_shm(name: &CString) {
    unsafe {
        libc::shm_unlink(name.as_ptr());
    }
}
