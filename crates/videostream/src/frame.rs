// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

//! Frame: a reference to a kernel-backed buffer plus the metadata a host
//! stamps on it when posting it and a client reads off the wire when
//! receiving it.
//!
//! A `Frame` may be free-standing (created and allocated locally, never
//! shared), host-owned (moved into a [`crate::host::Host`] by
//! [`crate::host::Host::post`], at which point the caller no longer holds
//! it — ownership transfer is modeled with Rust's move semantics rather
//! than a runtime owner tag), or client-received (built from a wire
//! `ANNOUNCE` plus the file descriptor that rode along with it).

use crate::buffer::{self, ProviderKind};
use crate::wire;
use crate::Error;
use std::ffi::CString;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};

const DMA_BUF_SYNC_READ: u64 = 1 << 0;
const DMA_BUF_SYNC_WRITE: u64 = 1 << 1;
const DMA_BUF_SYNC_RW: u64 = DMA_BUF_SYNC_READ | DMA_BUF_SYNC_WRITE;
const DMA_BUF_SYNC_START: u64 = 0 << 2;
const DMA_BUF_SYNC_END: u64 = 1 << 2;

#[repr(C)]
struct DmaBufSync {
    flags: u64,
}

const DMA_BUF_IOCTL_SYNC: libc::c_ulong = 0x40086200;

/// Direction to pass to [`Frame::sync`], mirroring `DMA_BUF_SYNC_{READ,WRITE,RW}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncDirection {
    Read,
    Write,
    ReadWrite,
}

impl SyncDirection {
    fn flags(self) -> u64 {
        match self {
            SyncDirection::Read => DMA_BUF_SYNC_READ,
            SyncDirection::Write => DMA_BUF_SYNC_WRITE,
            SyncDirection::ReadWrite => DMA_BUF_SYNC_RW,
        }
    }
}

/// A byte rectangle within a row-major buffer, used by [`Frame::copy_region_to`].
/// `x`/`width` are byte offsets into a row; `y`/`height` are row indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

struct MappedRegion {
    ptr: *mut u8,
    len: usize,
}

// SAFETY: the region is backed by kernel shared memory; concurrent access
// from multiple threads is the caller's responsibility, same as any other
// shared-memory API (this mirrors memmap2's Mmap Send/Sync impls).
unsafe impl Send for MappedRegion {}
unsafe impl Sync for MappedRegion {}

struct FrameState {
    handle: Option<OwnedFd>,
    provider: Option<ProviderKind>,
    shm_name: Option<CString>,
    path: Option<PathBuf>,
    size: usize,
    offset: usize,
    stride: u32,
    paddr: Option<u64>,
    mapped: Option<MappedRegion>,
}

impl Default for FrameState {
    fn default() -> Self {
        FrameState {
            handle: None,
            provider: None,
            shm_name: None,
            path: None,
            size: 0,
            offset: 0,
            stride: 0,
            paddr: None,
            mapped: None,
        }
    }
}

impl Drop for FrameState {
    fn drop(&mut self) {
        if let Some(region) = self.mapped.take() {
            unsafe {
                libc::munmap(region.ptr as *mut libc::c_void, region.len);
            }
        }
        if let Some(name) = &self.shm_name {
            buffer::unlink_shm(name);
        }
    }
}

#[derive(Default)]
struct PostedMeta {
    serial: i64,
    timestamp: i64,
    expires: i64,
    duration: i64,
    pts: i64,
    dts: i64,
}

type ReleaseHook = Box<dyn Fn(i64) + Send + Sync>;

struct FrameInner {
    width: u32,
    height: u32,
    fourcc: u32,
    posted: OnceLock<PostedMeta>,
    lock_count: AtomicU32,
    expired: AtomicBool,
    released: AtomicBool,
    /// Opaque, caller-supplied value, never interpreted by this crate; see
    /// [`Frame::userptr`]/[`Frame::set_userptr`].
    userptr: AtomicUsize,
    state: Mutex<FrameState>,
    release_hook: Mutex<Option<ReleaseHook>>,
}

/// A reference to a video frame: its dimensions, pixel format, and (once
/// allocated or received) its shared-memory backing.
#[derive(Clone)]
pub struct Frame {
    inner: Arc<FrameInner>,
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width())
            .field("height", &self.height())
            .field("serial", &self.serial())
            .field("handle", &self.handle())
            .finish()
    }
}

impl Frame {
    /// Creates a free-standing, unallocated frame descriptor.
    pub fn new(width: u32, height: u32, stride: u32, fourcc: &str) -> Result<Frame, Error> {
        if width == 0 || height == 0 {
            return Err(Error::InvalidArgument("width and height must be non-zero"));
        }
        let fourcc_bytes = fourcc.as_bytes();
        if fourcc_bytes.len() != 4 {
            return Err(Error::InvalidArgument("fourcc must be exactly 4 bytes"));
        }
        let fourcc_val = u32::from_le_bytes([
            fourcc_bytes[0],
            fourcc_bytes[1],
            fourcc_bytes[2],
            fourcc_bytes[3],
        ]);

        let mut state = FrameState::default();
        state.stride = stride;

        Ok(Frame {
            inner: Arc::new(FrameInner {
                width,
                height,
                fourcc: fourcc_val,
                posted: OnceLock::new(),
                lock_count: AtomicU32::new(0),
                expired: AtomicBool::new(false),
                released: AtomicBool::new(false),
                userptr: AtomicUsize::new(0),
                state: Mutex::new(state),
                release_hook: Mutex::new(None),
            }),
        })
    }

    /// Allocates backing memory for this frame via the buffer provider
    /// (DmaBuf heap or POSIX shm). `path` follows [`buffer::allocate`]'s
    /// selection policy.
    pub fn alloc(&self, path: Option<&std::path::Path>) -> Result<(), Error> {
        let mut state = self.inner.state.lock().unwrap();
        if state.handle.is_some() {
            return Err(Error::InvalidArgument("frame is already allocated"));
        }
        let stride = if state.stride == 0 {
            self.inner.width * 4
        } else {
            state.stride
        };
        let size = stride as usize * self.inner.height as usize;

        let alloc = buffer::allocate(size, path)?;
        state.paddr = alloc.paddr;
        state.handle = Some(alloc.fd);
        state.provider = Some(alloc.kind);
        state.shm_name = alloc.shm_name;
        state.path = path.map(|p| p.to_path_buf());
        state.size = alloc.size;
        state.stride = stride;
        state.offset = 0;
        Ok(())
    }

    /// Attaches an externally-provided file descriptor (typically one
    /// received over the wire via `SCM_RIGHTS`) as this frame's backing
    /// memory, without going through the buffer provider.
    pub fn attach(
        &self,
        fd: OwnedFd,
        size: usize,
        stride: u32,
        offset: usize,
    ) -> Result<(), Error> {
        let mut state = self.inner.state.lock().unwrap();
        if state.handle.is_some() {
            return Err(Error::InvalidArgument("frame is already allocated"));
        }
        state.handle = Some(fd);
        state.size = size;
        state.stride = stride;
        state.offset = offset;
        state.paddr = None;
        Ok(())
    }

    /// Releases the backing allocation: unmaps if mapped, closes the handle,
    /// and unlinks any shm name. The frame may be `alloc`'d again afterward.
    pub fn unalloc(&self) -> Result<(), Error> {
        let mut state = self.inner.state.lock().unwrap();
        *state = FrameState::default();
        Ok(())
    }

    pub(crate) fn from_wire(
        header: &wire::Header,
        announce: &wire::AnnouncePayload,
        fd: OwnedFd,
    ) -> Frame {
        let posted = OnceLock::new();
        let _ = posted.set(PostedMeta {
            serial: header.serial,
            timestamp: header.timestamp,
            expires: header.expires,
            duration: header.duration,
            pts: header.pts,
            dts: header.dts,
        });

        let mut state = FrameState::default();
        state.handle = Some(fd);
        state.size = announce.size as usize;
        state.stride = announce.stride;
        state.offset = announce.offset as usize;

        Frame {
            inner: Arc::new(FrameInner {
                width: header.width as u32,
                height: header.height as u32,
                fourcc: header.fourcc,
                posted,
                lock_count: AtomicU32::new(1),
                expired: AtomicBool::new(false),
                released: AtomicBool::new(false),
                userptr: AtomicUsize::new(0),
                state: Mutex::new(state),
                release_hook: Mutex::new(None),
            }),
        }
    }

    pub(crate) fn set_release_hook(&self, hook: ReleaseHook) {
        *self.inner.release_hook.lock().unwrap() = Some(hook);
    }

    /// A non-owning reference to this frame. Lets a caller track frames it
    /// has delivered (e.g. to invalidate them on teardown) without keeping
    /// them alive past the last strong handle the caller gave out — holding
    /// a strong `Frame` here instead would mean `release_hook` could never
    /// fire, since the reference count would never reach zero.
    pub(crate) fn downgrade(&self) -> FrameWeak {
        FrameWeak(Arc::downgrade(&self.inner))
    }

    pub(crate) fn mark_expired(&self) {
        self.inner.expired.store(true, Ordering::SeqCst);
    }

    pub(crate) fn raw_fd(&self) -> Option<RawFd> {
        self.inner
            .state
            .lock()
            .unwrap()
            .handle
            .as_ref()
            .map(|fd| fd.as_raw_fd())
    }

    pub(crate) fn install_posted_meta(
        &self,
        serial: i64,
        timestamp: i64,
        expires: i64,
        duration: i64,
        pts: i64,
        dts: i64,
    ) {
        let _ = self.inner.posted.set(PostedMeta {
            serial,
            timestamp,
            expires,
            duration,
            pts,
            dts,
        });
    }

    pub(crate) fn announce_payload(&self) -> wire::AnnouncePayload {
        let state = self.inner.state.lock().unwrap();
        wire::AnnouncePayload {
            stride: state.stride,
            size: state.size as u32,
            offset: state.offset as u32,
            reserved: 0,
        }
    }

    /// Takes a lock on the frame. Reentrant: each call increments an
    /// internal counter; pair every `trylock` with an `unlock`. Locking is
    /// process-local bookkeeping to guard concurrent access within this
    /// process; it does not itself talk to the host. Fails if the frame has
    /// already expired.
    pub fn trylock(&self) -> Result<(), Error> {
        if self.inner.expired.load(Ordering::SeqCst) {
            return Err(Error::InvalidArgument("frame is expired"));
        }
        self.inner.lock_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Releases one lock taken by `trylock`. Idempotent past zero.
    pub fn unlock(&self) {
        let _ = self
            .inner
            .lock_count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| {
                if c == 0 {
                    None
                } else {
                    Some(c - 1)
                }
            });
    }

    pub fn lock_count(&self) -> u32 {
        self.inner.lock_count.load(Ordering::SeqCst)
    }

    /// True once the host has broadcast an `EXPIRE`/`DROP` for this frame's
    /// serial. The underlying memory stays valid and mapped regardless; this
    /// only means the host no longer considers the frame live.
    pub fn expired(&self) -> bool {
        self.inner.expired.load(Ordering::SeqCst)
    }

    pub fn width(&self) -> u32 {
        self.inner.width
    }

    pub fn height(&self) -> u32 {
        self.inner.height
    }

    pub fn fourcc(&self) -> u32 {
        self.inner.fourcc
    }

    pub fn stride(&self) -> u32 {
        self.inner.state.lock().unwrap().stride
    }

    pub fn size(&self) -> usize {
        self.inner.state.lock().unwrap().size
    }

    pub fn offset(&self) -> usize {
        self.inner.state.lock().unwrap().offset
    }

    /// Raw handle to the backing buffer, or -1 if unallocated.
    pub fn handle(&self) -> RawFd {
        self.inner
            .state
            .lock()
            .unwrap()
            .handle
            .as_ref()
            .map(|fd| fd.as_raw_fd())
            .unwrap_or(-1)
    }

    pub fn path(&self) -> Option<PathBuf> {
        self.inner.state.lock().unwrap().path.clone()
    }

    /// Physical/base address of the backing buffer, if resolved at
    /// `alloc`/`attach` time. Pure read: never recomputed on access.
    pub fn paddr(&self) -> Option<u64> {
        self.inner.state.lock().unwrap().paddr
    }

    pub fn serial(&self) -> i64 {
        self.inner.posted.get().map(|m| m.serial).unwrap_or(0)
    }

    pub fn timestamp(&self) -> i64 {
        self.inner.posted.get().map(|m| m.timestamp).unwrap_or(0)
    }

    pub fn expires(&self) -> i64 {
        self.inner.posted.get().map(|m| m.expires).unwrap_or(-1)
    }

    pub fn duration(&self) -> i64 {
        self.inner.posted.get().map(|m| m.duration).unwrap_or(-1)
    }

    pub fn pts(&self) -> i64 {
        self.inner.posted.get().map(|m| m.pts).unwrap_or(-1)
    }

    pub fn dts(&self) -> i64 {
        self.inner.posted.get().map(|m| m.dts).unwrap_or(-1)
    }

    /// Maps the backing buffer read-only, mapping it on first call and
    /// reusing the mapping afterward.
    pub fn mmap(&self) -> Result<&[u8], Error> {
        let ptr = self.ensure_mapped()?;
        let len = self
            .inner
            .state
            .lock()
            .unwrap()
            .mapped
            .as_ref()
            .unwrap()
            .len;
        Ok(unsafe { std::slice::from_raw_parts(ptr, len) })
    }

    /// Maps the backing buffer read-write.
    pub fn mmap_mut(&self) -> Result<&mut [u8], Error> {
        let ptr = self.ensure_mapped()?;
        let len = self
            .inner
            .state
            .lock()
            .unwrap()
            .mapped
            .as_ref()
            .unwrap()
            .len;
        Ok(unsafe { std::slice::from_raw_parts_mut(ptr, len) })
    }

    fn ensure_mapped(&self) -> Result<*mut u8, Error> {
        let mut state = self.inner.state.lock().unwrap();
        if let Some(region) = &state.mapped {
            return Ok(region.ptr);
        }
        let fd = state
            .handle
            .as_ref()
            .ok_or(Error::InvalidArgument("frame has no backing allocation"))?
            .as_raw_fd();
        let len = state.size;
        if len == 0 {
            return Err(Error::InvalidArgument("frame has zero size"));
        }
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                state.offset as libc::off_t,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error().into());
        }
        let ptr = ptr as *mut u8;
        state.mapped = Some(MappedRegion { ptr, len });
        Ok(ptr)
    }

    /// Unmaps the buffer if mapped. Safe to call even if never mapped.
    pub fn munmap(&self) {
        let mut state = self.inner.state.lock().unwrap();
        if let Some(region) = state.mapped.take() {
            unsafe {
                libc::munmap(region.ptr as *mut libc::c_void, region.len);
            }
        }
    }

    /// Issues the DmaBuf cache-coherency ioctl for `direction`, bracketing a
    /// CPU access window. A no-op (returns `Ok`) for shm-backed frames,
    /// which are always CPU-coherent.
    pub fn sync(&self, direction: SyncDirection, begin: bool) -> Result<(), Error> {
        let state = self.inner.state.lock().unwrap();
        if state.provider != Some(ProviderKind::DmaBuf) {
            return Ok(());
        }
        let fd = state
            .handle
            .as_ref()
            .ok_or(Error::InvalidArgument("frame has no backing allocation"))?
            .as_raw_fd();
        let mut data = DmaBufSync {
            flags: direction.flags()
                | if begin {
                    DMA_BUF_SYNC_START
                } else {
                    DMA_BUF_SYNC_END
                },
        };
        let rc = unsafe { libc::ioctl(fd, DMA_BUF_IOCTL_SYNC, &mut data) };
        if rc < 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(())
    }

    /// Copies this frame's entire mapped buffer into `dst`'s, truncating to
    /// the shorter of the two, and returns the number of bytes copied so
    /// callers can detect truncation. Both frames must already be mapped.
    /// Locks both frames' internal state in a fixed, address-derived order
    /// so two threads copying in opposite directions can never deadlock.
    pub fn copy_to(&self, dst: &Frame) -> Result<usize, Error> {
        if Arc::ptr_eq(&self.inner, &dst.inner) {
            let len = self.inner.state.lock().unwrap().size;
            return Ok(len);
        }
        let self_addr = Arc::as_ptr(&self.inner) as usize;
        let dst_addr = Arc::as_ptr(&dst.inner) as usize;
        let (src_guard, dst_guard) = if self_addr < dst_addr {
            (
                self.inner.state.lock().unwrap(),
                dst.inner.state.lock().unwrap(),
            )
        } else {
            let d = dst.inner.state.lock().unwrap();
            let s = self.inner.state.lock().unwrap();
            (s, d)
        };
        let src_region = src_guard
            .mapped
            .as_ref()
            .ok_or(Error::InvalidArgument("source frame is not mapped"))?;
        let dst_region = dst_guard
            .mapped
            .as_ref()
            .ok_or(Error::InvalidArgument("destination frame is not mapped"))?;
        let len = src_region.len.min(dst_region.len);
        unsafe {
            std::ptr::copy_nonoverlapping(src_region.ptr, dst_region.ptr, len);
        }
        Ok(len)
    }

    /// Copies a row-range of `rect` (byte `x`/`width` within each row, row
    /// range `y..y+height`) from this frame into `dst`, using each frame's
    /// own stride to find row starts. Returns the total bytes copied across
    /// all rows.
    pub fn copy_region_to(&self, dst: &Frame, rect: Rect) -> Result<usize, Error> {
        if Arc::ptr_eq(&self.inner, &dst.inner) {
            return Ok(0);
        }
        let self_addr = Arc::as_ptr(&self.inner) as usize;
        let dst_addr = Arc::as_ptr(&dst.inner) as usize;
        let (src_guard, dst_guard) = if self_addr < dst_addr {
            (
                self.inner.state.lock().unwrap(),
                dst.inner.state.lock().unwrap(),
            )
        } else {
            let d = dst.inner.state.lock().unwrap();
            let s = self.inner.state.lock().unwrap();
            (s, d)
        };
        let src_stride = src_guard.stride as usize;
        let dst_stride = dst_guard.stride as usize;
        let src_region = src_guard
            .mapped
            .as_ref()
            .ok_or(Error::InvalidArgument("source frame is not mapped"))?;
        let dst_region = dst_guard
            .mapped
            .as_ref()
            .ok_or(Error::InvalidArgument("destination frame is not mapped"))?;

        let row_bytes = (rect.width as usize).min(src_stride).min(dst_stride);
        let mut copied = 0;
        for row in 0..rect.height as usize {
            let y = rect.y as usize + row;
            let src_off = y * src_stride + rect.x as usize;
            let dst_off = y * dst_stride + rect.x as usize;
            if src_off + row_bytes > src_region.len || dst_off + row_bytes > dst_region.len {
                return Err(Error::InvalidArgument("region exceeds frame bounds"));
            }
            unsafe {
                std::ptr::copy_nonoverlapping(
                    src_region.ptr.add(src_off),
                    dst_region.ptr.add(dst_off),
                    row_bytes,
                );
            }
            copied += row_bytes;
        }
        Ok(copied)
    }

    /// User-supplied opaque value for attaching caller-defined context to a
    /// frame (e.g. a pool slot index). Independent of `paddr`; never
    /// interpreted by this crate.
    pub fn userptr(&self) -> usize {
        self.inner.userptr.load(Ordering::SeqCst)
    }

    /// Sets the opaque user-pointer value returned by [`Frame::userptr`].
    pub fn set_userptr(&self, value: usize) {
        self.inner.userptr.store(value, Ordering::SeqCst);
    }

    /// Invalidates the frame: drops its backing handle (unmapping and
    /// unlinking any shm name) and marks it expired, while leaving the rest
    /// of its metadata (dimensions, stride, size, offset, path, paddr)
    /// readable. Called when a client's connection is released so any
    /// frames it still held can't be mistaken for live, mappable buffers.
    pub(crate) fn invalidate(&self) {
        self.inner.expired.store(true, Ordering::SeqCst);
        let mut state = self.inner.state.lock().unwrap();
        if let Some(region) = state.mapped.take() {
            unsafe {
                libc::munmap(region.ptr as *mut libc::c_void, region.len);
            }
        }
        state.handle = None;
        if let Some(name) = state.shm_name.take() {
            buffer::unlink_shm(&name);
        }
    }
}

/// A weak reference to a [`Frame`], obtained via [`Frame::downgrade`].
pub(crate) struct FrameWeak(Weak<FrameInner>);

impl FrameWeak {
    pub(crate) fn upgrade(&self) -> Option<Frame> {
        self.0.upgrade().map(|inner| Frame { inner })
    }
}

impl Drop for FrameInner {
    fn drop(&mut self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(hook) = self.release_hook.lock().unwrap().take() {
            let serial = self.posted.get().map(|m| m.serial).unwrap_or(0);
            hook(serial);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_rejects_bad_fourcc() {
        let err = Frame::new(640, 480, 0, "XY").unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn new_rejects_zero_dims() {
        let err = Frame::new(0, 480, 0, "YUYV").unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn alloc_then_mmap_roundtrip() {
        let frame = Frame::new(64, 64, 64 * 4, "YUYV").unwrap();
        frame.alloc(None).unwrap();
        assert!(frame.size() > 0);
        assert_ne!(frame.handle(), -1);

        {
            let buf = frame.mmap_mut().unwrap();
            buf[0] = 0xAB;
        }
        let buf = frame.mmap().unwrap();
        assert_eq!(buf[0], 0xAB);
    }

    #[test]
    fn copy_to_transfers_bytes() {
        let src = Frame::new(16, 16, 64, "YUYV").unwrap();
        src.alloc(None).unwrap();
        let dst = Frame::new(16, 16, 64, "YUYV").unwrap();
        dst.alloc(None).unwrap();

        {
            let buf = src.mmap_mut().unwrap();
            buf.fill(0x42);
        }
        let copied = src.copy_to(&dst).unwrap();
        assert_eq!(copied, src.size());
        let buf = dst.mmap().unwrap();
        assert!(buf.iter().all(|&b| b == 0x42));
    }

    #[test]
    fn userptr_is_independent_of_paddr() {
        let frame = Frame::new(16, 16, 64, "YUYV").unwrap();
        assert_eq!(frame.userptr(), 0);
        frame.set_userptr(0xDEAD_BEEF);
        assert_eq!(frame.userptr(), 0xDEAD_BEEF);
        assert_ne!(frame.userptr() as u64, frame.paddr().unwrap_or(0));
    }

    #[test]
    fn trylock_rejects_expired_frame() {
        let frame = Frame::new(16, 16, 64, "YUYV").unwrap();
        frame.trylock().unwrap();
        frame.mark_expired();
        let err = frame.trylock().unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn invalidate_drops_handle_and_marks_expired() {
        let frame = Frame::new(16, 16, 64, "YUYV").unwrap();
        frame.alloc(None).unwrap();
        assert_ne!(frame.handle(), -1);
        frame.invalidate();
        assert_eq!(frame.handle(), -1);
        assert!(frame.expired());
    }

    #[test]
    fn lock_unlock_counter() {
        let frame = Frame::new(16, 16, 64, "YUYV").unwrap();
        assert_eq!(frame.lock_count(), 0);
        frame.trylock().unwrap();
        frame.trylock().unwrap();
        assert_eq!(frame.lock_count(), 2);
        frame.unlock();
        assert_eq!(frame.lock_count(), 1);
        frame.unlock();
        frame.unlock(); // idempotent past zero
        assert_eq!(frame.lock_count(), 0);
    }

    #[test]
    fn release_hook_runs_once_on_drop() {
        use std::sync::atomic::AtomicUsize;
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let frame = Frame::new(16, 16, 64, "YUYV").unwrap();
        frame.set_release_hook(Box::new(move |_serial| {
            calls2.fetch_add(1, Ordering::SeqCst);
        }));
        drop(frame);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unalloc_resets_state() {
        let frame = Frame::new(16, 16, 64, "YUYV").unwrap();
        frame.alloc(None).unwrap();
        frame.unalloc().unwrap();
        assert_eq!(frame.handle(), -1);
        assert_eq!(frame.size(), 0);
    }
}
