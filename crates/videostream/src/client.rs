// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

//! Client: connects to a [`crate::host::Host`] and receives the frames it
//! posts.
//!
//! Reads and writes use separate cloned socket handles so a frame's `Drop`
//! (which sends `UNLOCK` from whatever thread happens to drop it) never
//! contends with a thread blocked inside [`Client::wait`]'s `recvmsg`.
//! [`Client::disconnect`] wakes a blocked `wait` by shutting down the read
//! half, which unblocks `poll`/`recvmsg` with an EOF-like condition.

use crate::frame::{Frame, FrameWeak};
use crate::wire::{self, Kind};
use crate::{trace_hot_path, Error};
use std::collections::HashMap;
use std::io;
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const INITIAL_BACKOFF_MS: u64 = 10;
const MAX_BACKOFF_MS: u64 = 1000;
const HANDSHAKE_TIMEOUT_MS: i32 = 1000;

/// Whether a [`Client`] should transparently reconnect when its connection
/// to the host drops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconnect {
    Disabled,
    Enabled,
}

struct Connection {
    read: UnixStream,
    write: Mutex<UnixStream>,
    reader: Mutex<wire::MessageReader>,
}

struct ClientShared {
    path: PathBuf,
    reconnect: Reconnect,
    conn: Mutex<Option<Arc<Connection>>>,
    cancelled: AtomicBool,
    last_serial: AtomicI64,
    timeout_ms: AtomicI64,
    locked: Mutex<HashMap<i64, FrameWeak>>,
}

/// A connection to a [`crate::host::Host`]'s socket.
pub struct Client {
    shared: Arc<ClientShared>,
}

impl Client {
    /// Connects to `path`. With [`Reconnect::Enabled`], a dropped connection
    /// is retried transparently inside [`Client::wait`] with exponential
    /// backoff capped at one second.
    pub fn new(path: impl AsRef<Path>, reconnect: Reconnect) -> Result<Client, Error> {
        let path = path.as_ref().to_path_buf();
        let conn = connect_and_handshake(&path)?;
        Ok(Client {
            shared: Arc::new(ClientShared {
                path,
                reconnect,
                conn: Mutex::new(Some(Arc::new(conn))),
                cancelled: AtomicBool::new(false),
                last_serial: AtomicI64::new(0),
                timeout_ms: AtomicI64::new(-1),
                locked: Mutex::new(HashMap::new()),
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.shared.path
    }

    /// Sets the default timeout (seconds) used by [`Client::wait`] when
    /// called with `until == 0`. Zero or negative means block indefinitely.
    pub fn set_timeout(&self, secs: f32) {
        let ms = if secs > 0.0 {
            (secs * 1000.0) as i64
        } else {
            -1
        };
        self.shared.timeout_ms.store(ms, Ordering::SeqCst);
    }

    /// Cancels any in-flight or future `wait` and disables reconnection.
    /// Safe to call concurrently with a blocked `wait` on another thread.
    pub fn disconnect(&self) {
        self.shared.cancelled.store(true, Ordering::SeqCst);
        let conn = self.shared.conn.lock().unwrap().clone();
        if let Some(conn) = conn {
            unsafe {
                libc::shutdown(conn.read.as_raw_fd(), libc::SHUT_RDWR);
            }
        }
    }

    /// Waits for the next frame not already seen.
    ///
    /// `until` is an absolute `CLOCK_MONOTONIC` deadline in nanoseconds
    /// (see [`crate::timestamp`]); `0` uses the timeout configured via
    /// [`Client::set_timeout`] (block indefinitely if none was set);
    /// negative blocks indefinitely.
    pub fn wait(&self, until: i64) -> Result<Frame, Error> {
        let deadline = match until {
            0 => {
                let configured = self.shared.timeout_ms.load(Ordering::SeqCst);
                if configured < 0 {
                    None
                } else {
                    Some(crate::timestamp()? + configured * 1_000_000)
                }
            }
            u if u < 0 => None,
            u => Some(u),
        };

        loop {
            if self.shared.cancelled.load(Ordering::SeqCst) {
                return Err(Error::Cancelled);
            }

            let wait_ms = match deadline {
                Some(d) => {
                    let now = crate::timestamp()?;
                    if now >= d {
                        return Err(Error::Timeout);
                    }
                    ((d - now) / 1_000_000).clamp(1, i32::MAX as i64) as i32
                }
                None => -1,
            };

            match self.wait_once(wait_ms) {
                Ok(Some(frame)) => return Ok(frame),
                Ok(None) => continue,
                Err(Error::PeerClosed) => {
                    if self.shared.cancelled.load(Ordering::SeqCst) {
                        return Err(Error::Cancelled);
                    }
                    self.reconnect_or_fail(deadline)?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Polls the current connection for up to `wait_ms` and, if a message
    /// arrives, handles it. Returns `Ok(Some(frame))` on a new `ANNOUNCE`,
    /// `Ok(None)` if the poll timed out or the message was a control message
    /// already handled internally, `Err(PeerClosed)` if the connection died.
    fn wait_once(&self, wait_ms: i32) -> Result<Option<Frame>, Error> {
        // Clone the connection handle out and drop the lock immediately:
        // `poll`/`recvmsg` below can block for up to `wait_ms`, and holding
        // the outer lock across that would deadlock against a concurrent
        // `disconnect` (which also needs the lock, briefly, to find the fd
        // to shut down).
        let conn = self.shared.conn.lock().unwrap().clone();
        let Some(conn) = conn else {
            return Err(Error::PeerClosed);
        };

        let mut pollfd = libc::pollfd {
            fd: conn.read.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let rc = unsafe { libc::poll(&mut pollfd, 1, wait_ms) };
        if rc < 0 {
            return Err(io::Error::last_os_error().into());
        }
        if rc == 0 {
            return Ok(None);
        }
        if pollfd.revents & (libc::POLLHUP | libc::POLLERR) != 0
            && pollfd.revents & libc::POLLIN == 0
        {
            return Err(Error::PeerClosed);
        }

        let msg = conn.reader.lock().unwrap().read_one(&conn.read)?;
        let Some(msg) = msg else {
            return Ok(None);
        };

        match msg.header.kind() {
            Some(Kind::HelloAck) => Ok(None),
            Some(Kind::Announce) => {
                let serial = msg.header.serial;
                let fd = msg.fd.ok_or(Error::Protocol("announce missing fd"))?;
                let announce = msg
                    .announce
                    .ok_or(Error::Protocol("announce missing payload"))?;

                if serial <= self.shared.last_serial.load(Ordering::SeqCst) {
                    // Already seen before a reconnect; drop the fd and tell
                    // the host we're done with it without surfacing a
                    // duplicate to the caller.
                    drop(fd);
                    self.shared.send_unlock(serial);
                    return Ok(None);
                }
                self.shared.last_serial.store(serial, Ordering::SeqCst);

                let frame = Frame::from_wire(&msg.header, &announce, fd);
                let shared = self.shared.clone();
                frame.set_release_hook(Box::new(move |serial| {
                    shared.locked.lock().unwrap().remove(&serial);
                    shared.send_unlock(serial);
                }));
                self.shared
                    .locked
                    .lock()
                    .unwrap()
                    .insert(serial, frame.downgrade());
                Ok(Some(frame))
            }
            Some(Kind::Expire) | Some(Kind::Drop) => {
                let locked = self.shared.locked.lock().unwrap();
                if let Some(frame) = locked.get(&msg.header.serial).and_then(FrameWeak::upgrade) {
                    frame.mark_expired();
                }
                Ok(None)
            }
            Some(Kind::Bye) => Err(Error::PeerClosed),
            _ => Ok(None),
        }
    }

    fn reconnect_or_fail(&self, deadline: Option<i64>) -> Result<(), Error> {
        *self.shared.conn.lock().unwrap() = None;
        if self.shared.reconnect == Reconnect::Disabled {
            return Err(Error::PeerClosed);
        }

        let mut backoff = INITIAL_BACKOFF_MS;
        loop {
            if self.shared.cancelled.load(Ordering::SeqCst) {
                return Err(Error::Cancelled);
            }
            if let Some(d) = deadline {
                if crate::timestamp()? >= d {
                    return Err(Error::Timeout);
                }
            }

            match connect_and_handshake(&self.shared.path) {
                Ok(conn) => {
                    trace_hot_path!("reconnected to {:?}", self.shared.path);
                    *self.shared.conn.lock().unwrap() = Some(Arc::new(conn));
                    return Ok(());
                }
                Err(_) => {
                    std::thread::sleep(Duration::from_millis(backoff));
                    backoff = (backoff * 2).min(MAX_BACKOFF_MS);
                }
            }
        }
    }
}

impl Drop for Client {
    /// Invalidates every frame this client still holds so none of them can
    /// be mistaken for a live, mappable buffer once the connection is gone.
    /// Frames the caller already dropped are gone from `locked` by the time
    /// this runs (their `release_hook` removed them), so only genuinely
    /// outstanding frames are touched.
    fn drop(&mut self) {
        for weak in self.shared.locked.lock().unwrap().values() {
            if let Some(frame) = weak.upgrade() {
                frame.invalidate();
            }
        }
    }
}

impl ClientShared {
    fn send_unlock(&self, serial: i64) {
        if let Some(conn) = self.conn.lock().unwrap().as_ref() {
            let mut header = wire::Header::new(Kind::Unlock);
            header.serial = serial;
            let write = conn.write.lock().unwrap();
            let _ = wire::send_simple(&write, &header);
        }
    }
}

fn connect_and_handshake(path: &Path) -> Result<Connection, Error> {
    let stream = UnixStream::connect(path).map_err(Error::from)?;
    let write = stream.try_clone().map_err(Error::from)?;

    wire::send_simple(&write, &wire::Header::new(Kind::Hello)).map_err(Error::from)?;

    let mut reader = wire::MessageReader::new();
    let mut pollfd = libc::pollfd {
        fd: stream.as_raw_fd(),
        events: libc::POLLIN,
        revents: 0,
    };
    loop {
        let rc = unsafe { libc::poll(&mut pollfd, 1, HANDSHAKE_TIMEOUT_MS) };
        if rc <= 0 {
            return Err(Error::Timeout);
        }
        if let Some(msg) = reader.read_one(&stream)? {
            if msg.header.kind() == Some(Kind::HelloAck) {
                break;
            }
        }
    }

    Ok(Connection {
        read: stream,
        write: Mutex::new(write),
        reader: Mutex::new(reader),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Frame;
    use crate::host::Host;
    use serial_test::serial;
    use std::thread;
    use std::time::Duration;

    fn test_socket_path(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "vsl-client-test-{tag}-{}-{:?}.sock",
            std::process::id(),
            thread::current().id()
        ))
    }

    fn pump(host: &Host, rounds: usize) {
        for _ in 0..rounds {
            host.process().unwrap();
            thread::sleep(Duration::from_millis(5));
        }
    }

    /// `Client::new` blocks on the handshake `HelloAck`, which only arrives
    /// once something calls `host.process()`; connect from a background
    /// thread while the caller pumps, instead of connecting synchronously
    /// with no one servicing the host side.
    fn connect_client(host: &Host, path: &Path, reconnect: Reconnect) -> Client {
        let path = path.to_path_buf();
        let handle = thread::spawn(move || Client::new(&path, reconnect).unwrap());
        for _ in 0..40 {
            host.process().unwrap();
            thread::sleep(Duration::from_millis(5));
            if handle.is_finished() {
                break;
            }
        }
        handle.join().unwrap()
    }

    #[test]
    #[serial]
    fn connects_and_receives_hello_ack() {
        let path = test_socket_path("connect");
        let host = Host::new(&path).unwrap();
        let handle = thread::spawn(move || Client::new(&path, Reconnect::Disabled).unwrap());
        pump(&host, 20);
        let _client = handle.join().unwrap();
    }

    #[test]
    #[serial]
    fn disconnect_cancels_blocked_wait() {
        let path = test_socket_path("cancel");
        let host = Host::new(&path).unwrap();
        let client = Arc::new(connect_client(&host, &path, Reconnect::Disabled));
        pump(&host, 5);

        let waiter = {
            let client = client.clone();
            thread::spawn(move || client.wait(-1))
        };
        thread::sleep(Duration::from_millis(50));
        client.disconnect();

        let result = waiter.join().unwrap();
        assert!(matches!(
            result,
            Err(Error::Cancelled) | Err(Error::PeerClosed)
        ));
    }

    #[test]
    #[serial]
    fn receives_posted_frame_with_correct_serial() {
        let path = test_socket_path("serial");
        let host = Host::new(&path).unwrap();
        let client = connect_client(&host, &path, Reconnect::Disabled);
        pump(&host, 5);

        let frame = Frame::new(2, 2, 8, "YUYV").unwrap();
        frame.alloc(None).unwrap();
        host.post(frame, -1, -1, -1, -1).unwrap();
        pump(&host, 10);

        let deadline = crate::timestamp().unwrap() + 100_000_000;
        let first = client.wait(deadline).unwrap();
        assert_eq!(first.serial(), 1);
    }

    #[test]
    #[serial]
    fn dropping_client_invalidates_its_locked_frames() {
        let path = test_socket_path("drop-invalidate");
        let host = Host::new(&path).unwrap();
        let client = connect_client(&host, &path, Reconnect::Disabled);
        pump(&host, 5);

        let frame = Frame::new(2, 2, 8, "YUYV").unwrap();
        frame.alloc(None).unwrap();
        host.post(frame, -1, -1, -1, -1).unwrap();
        pump(&host, 10);

        let deadline = crate::timestamp().unwrap() + 100_000_000;
        let received = client.wait(deadline).unwrap();
        assert!(!received.expired());

        drop(client);
        assert!(received.expired());
        assert_eq!(received.handle(), -1);
    }

    #[test]
    #[serial]
    fn wait_times_out_with_no_frames() {
        let path = test_socket_path("timeout");
        let host = Host::new(&path).unwrap();
        let client = connect_client(&host, &path, Reconnect::Disabled);
        pump(&host, 5);

        let deadline = crate::timestamp().unwrap() + 50_000_000;
        let result = client.wait(deadline);
        assert!(matches!(result, Err(Error::Timeout)));
    }
}
