// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

//! VideoStream Library for Rust
//!
//! Zero-copy video frame sharing across processes, built on DMA-BUF or
//! POSIX shared memory with frame handles passed between processes over
//! UNIX domain sockets, optimized for edge AI and computer vision
//! applications on resource-constrained embedded devices.
//!
//! # Architecture
//!
//! VideoStream uses a **Host/Client** pattern for inter-process communication:
//!
//! - **Host**: Publishes video frames over a UNIX socket
//! - **Clients**: Subscribe to frames by connecting to the socket
//! - **Frames**: Zero-copy shared memory (DmaBuf or POSIX shm) with metadata
//!
//! # Quick Start
//!
//! ## Publishing Frames (Host)
//!
//! ```no_run
//! use videostream::{host::Host, frame::Frame, Error};
//!
//! fn publish_frames() -> Result<(), Error> {
//!     let host = Host::new("/tmp/video.sock")?;
//!
//!     let mut frame = Frame::new(1920, 1080, 1920 * 2, "YUYV")?;
//!     frame.alloc(None)?;
//!
//!     host.post(frame, -1, -1, -1, -1)?;
//!     Ok(())
//! }
//! # publish_frames().ok();
//! ```
//!
//! ## Subscribing to Frames (Client)
//!
//! ```no_run
//! use videostream::{client::{Client, Reconnect}, Error};
//!
//! fn subscribe_frames() -> Result<(), Error> {
//!     let client = Client::new("/tmp/video.sock", Reconnect::Enabled)?;
//!
//!     let frame = client.wait(0)?;
//!     println!("Frame: {}x{}", frame.width(), frame.height());
//!     Ok(())
//! }
//! # subscribe_frames().ok();
//! ```
//!
//! # Features
//!
//! - **Zero-copy sharing**: DmaBuf or POSIX shared memory for minimal overhead
//! - **Multi-subscriber**: One host can serve many clients simultaneously
//! - **Cross-process**: UNIX sockets enable containerized applications
//!
//! # Platform Support
//!
//! - **Primary**: NXP i.MX8M Plus and similar embedded Linux targets
//! - **Kernel**: Linux 4.14+ (5.6+ recommended for the DmaBuf heap uAPI)
//!
//! # Error Handling
//!
//! All fallible operations return [`Result<T, Error>`]. The [`Error`] enum
//! distinguishes the failure categories a host or client needs to act on
//! (permission, out-of-memory, timeout, protocol violation, peer closed)
//! from the plumbing conversions it needs for ergonomics.
//!
//! # Safety
//!
//! This crate talks to the kernel directly (`mmap`, `ioctl`, `sendmsg` with
//! `SCM_RIGHTS`) to get zero-copy sharing without a C library in between.
//! Unsafe blocks are confined to [`buffer`], [`frame`], and [`wire`]; the
//! public API itself is safe to call.

mod buffer;
pub mod client;
pub mod fourcc;
pub mod frame;
pub mod host;
mod wire;

use std::{
    error,
    ffi::{NulError, OsString},
    fmt, io,
    num::TryFromIntError,
    path::PathBuf,
    str,
};

/// Error type for VideoStream library operations.
#[non_exhaustive]
#[derive(Debug)]
pub enum Error {
    /// A caller-supplied argument was out of range or otherwise invalid
    /// (bad dimensions, unsupported fourcc, a null where one is forbidden).
    InvalidArgument(&'static str),

    /// The heap device or socket path exists but this process lacks the
    /// rights to use it.
    Permission(io::Error),

    /// The socket path is occupied by another live host.
    PathInUse(PathBuf),

    /// The kernel refused to back an allocation.
    NoMemory(io::Error),

    /// The peer closed its end of the connection.
    PeerClosed,

    /// A blocking wait exceeded its configured bound.
    Timeout,

    /// An in-flight wait was interrupted by a concurrent `disconnect`.
    Cancelled,

    /// A received message violated the wire format.
    Protocol(&'static str),

    /// No buffer-provider mechanism succeeded (no DMA heap, no shm).
    Unavailable,

    /// I/O error from an underlying system call not covered by a more
    /// specific variant above.
    Io(io::Error),

    /// UTF-8 conversion error when converting a path or C string.
    Utf8(str::Utf8Error),

    /// CString creation error (null byte found in string).
    CString(NulError),

    /// Integer conversion error (`try_from` failed).
    TryFromInt(TryFromIntError),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            Error::Permission(err) => write!(f, "permission denied: {err}"),
            Error::PathInUse(path) => write!(f, "socket path in use: {}", path.display()),
            Error::NoMemory(err) => write!(f, "allocation failed: {err}"),
            Error::PeerClosed => write!(f, "peer closed the connection"),
            Error::Timeout => write!(f, "operation timed out"),
            Error::Cancelled => write!(f, "operation cancelled"),
            Error::Protocol(msg) => write!(f, "protocol error: {msg}"),
            Error::Unavailable => write!(f, "no buffer provider available"),
            Error::Io(err) => write!(f, "I/O error: {}", err),
            Error::Utf8(err) => write!(f, "UTF-8 conversion error: {}", err),
            Error::CString(err) => write!(f, "CString creation error: {}", err),
            Error::TryFromInt(err) => write!(f, "integer conversion error: {}", err),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::Permission(err) | Error::NoMemory(err) | Error::Io(err) => Some(err),
            Error::Utf8(err) => Some(err),
            Error::CString(err) => Some(err),
            Error::TryFromInt(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::PermissionDenied => Error::Permission(err),
            io::ErrorKind::OutOfMemory => Error::NoMemory(err),
            io::ErrorKind::UnexpectedEof | io::ErrorKind::ConnectionReset => Error::PeerClosed,
            io::ErrorKind::TimedOut => Error::Timeout,
            _ => Error::Io(err),
        }
    }
}

impl From<str::Utf8Error> for Error {
    fn from(err: str::Utf8Error) -> Self {
        Error::Utf8(err)
    }
}

impl From<NulError> for Error {
    fn from(err: NulError) -> Self {
        Error::CString(err)
    }
}

impl From<TryFromIntError> for Error {
    fn from(err: TryFromIntError) -> Self {
        Error::TryFromInt(err)
    }
}

impl From<OsString> for Error {
    fn from(_: OsString) -> Self {
        Error::InvalidArgument("path is not valid UTF-8")
    }
}

/// Returns whether verbose diagnostic tracing was requested via the
/// `VSL_DEBUG` environment variable, independent of whatever `log`
/// subscriber (if any) the embedding process has installed.
pub(crate) fn debug_tracing_enabled() -> bool {
    std::env::var_os("VSL_DEBUG").is_some_and(|v| !v.is_empty())
}

/// Logs through `log::debug!`, and additionally echoes to stderr when
/// `VSL_DEBUG` is set, so a host or client embedded without a logger still
/// surfaces what's happening on the hot paths that matter most.
macro_rules! trace_hot_path {
    ($($arg:tt)+) => {{
        log::debug!($($arg)+);
        if $crate::debug_tracing_enabled() {
            eprintln!($($arg)+);
        }
    }};
}
pub(crate) use trace_hot_path;

/// Returns the current monotonic timestamp in nanoseconds.
///
/// Reads `CLOCK_MONOTONIC` directly rather than `std::time::Instant`:
/// `Instant`'s epoch is unspecified and process-local, but this timestamp is
/// written to the wire by a host in one process and compared against the
/// clock of a client in another, so both sides need the same clock source.
///
/// # Example
///
/// ```no_run
/// use videostream::timestamp;
///
/// let ts = timestamp().expect("Failed to get timestamp");
/// println!("Current time: {} ns", ts);
/// ```
pub fn timestamp() -> Result<i64, Error> {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    let rc = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    if rc != 0 {
        return Err(io::Error::last_os_error().into());
    }
    Ok(ts.tv_sec as i64 * 1_000_000_000 + ts.tv_nsec as i64)
}

/// Returns the VideoStream Library version string, from `Cargo.toml`.
///
/// # Example
///
/// ```
/// use videostream::version;
///
/// println!("VideoStream version: {}", version());
/// ```
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!version().is_empty());
    }

    #[test]
    fn test_timestamp() {
        let result = timestamp();
        assert!(result.is_ok(), "timestamp() should succeed");
        let ts = result.unwrap();
        assert!(ts >= 0, "timestamp should be non-negative");
    }

    #[test]
    fn test_timestamps_are_monotonic() {
        let a = timestamp().unwrap();
        let b = timestamp().unwrap();
        assert!(b >= a);
    }

    #[test]
    fn test_error_display_io() {
        let io_err = Error::Io(std::io::Error::new(
            std::io::ErrorKind::Other,
            "test error",
        ));
        let display = format!("{}", io_err);
        assert!(display.contains("test error"));
    }

    #[test]
    fn test_error_display_peer_closed() {
        let err = Error::PeerClosed;
        let display = format!("{}", err);
        assert!(display.contains("closed"));
    }

    #[test]
    fn test_error_from_io_permission() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "no access");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Permission(_)));
    }

    #[test]
    fn test_error_from_io_eof() {
        let io_err = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::PeerClosed));
    }

    #[test]
    fn test_error_from_nul() {
        let nul_result = std::ffi::CString::new("test\0string");
        let nul_err = nul_result.unwrap_err();
        let err: Error = nul_err.into();
        assert!(matches!(err, Error::CString(_)));
    }

    #[test]
    fn test_error_from_utf8() {
        let invalid_utf8 = vec![0xff, 0xfe];
        let utf8_err = std::str::from_utf8(&invalid_utf8).unwrap_err();
        let err: Error = utf8_err.into();
        assert!(matches!(err, Error::Utf8(_)));
    }

    #[test]
    fn test_error_from_try_from_int() {
        let result: Result<u8, _> = (-1i32).try_into();
        let int_err = result.unwrap_err();
        let err: Error = int_err.into();
        assert!(matches!(err, Error::TryFromInt(_)));
    }

    #[test]
    fn test_error_source() {
        use std::error::Error as StdError;

        let peer_closed = Error::PeerClosed;
        assert!(peer_closed.source().is_none());

        let io_err = Error::Io(std::io::Error::new(std::io::ErrorKind::Other, "test"));
        assert!(io_err.source().is_some());
    }

    #[test]
    fn test_error_path_in_use_display() {
        let err = Error::PathInUse(PathBuf::from("/tmp/video.sock"));
        let display = format!("{}", err);
        assert!(display.contains("/tmp/video.sock"));
    }
}
