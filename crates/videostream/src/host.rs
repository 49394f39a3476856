// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

//! Host: publishes frames to any number of connected clients over a UNIX
//! domain socket.
//!
//! A single [`Host`] owns the listening socket, the set of connected client
//! sessions, and the live-frame queue. All of that lives behind one
//! [`Mutex`] so `post`/`drop_frame` (called from arbitrary application
//! threads) and `process` (typically called from one service thread) can
//! run concurrently without corrupting state; the lock is held only for the
//! bookkeeping, never across a blocking socket call.

use crate::frame::Frame;
use crate::wire::{self, Kind};
use crate::{trace_hot_path, Error};
use std::collections::HashSet;
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Default unacknowledged-announcement watermark before a client is
/// considered too slow and evicted (spec's suggested value).
pub const DEFAULT_WATERMARK: u32 = 64;
/// Default listen backlog.
pub const DEFAULT_BACKLOG: i32 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnState {
    New,
    Ready,
}

struct ClientConn {
    id: u64,
    stream: UnixStream,
    reader: wire::MessageReader,
    state: ConnState,
    /// Serials announced to this client but not yet acknowledged with
    /// `UNLOCK`. Doubles as the per-client reference count `expire_due_frames`
    /// checks before removing a frame, and its length as the
    /// unacknowledged-announcement watermark.
    held: HashSet<i64>,
}

struct HostState {
    clients: Vec<ClientConn>,
    live: Vec<Frame>,
    next_serial: i64,
    next_client_id: u64,
}

/// A UNIX-socket frame publisher.
pub struct Host {
    listener: UnixListener,
    path: PathBuf,
    watermark: u32,
    #[allow(dead_code)]
    backlog: i32,
    state: Mutex<HostState>,
}

impl std::fmt::Debug for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Host")
            .field("path", &self.path)
            .field("watermark", &self.watermark)
            .finish()
    }
}

impl Host {
    /// Binds a new host at `path`. Fails with [`Error::PathInUse`] if the
    /// path is occupied by a socket that still accepts connections.
    pub fn new(path: impl AsRef<Path>) -> Result<Host, Error> {
        let path = path.as_ref().to_path_buf();
        if path.exists() {
            if UnixStream::connect(&path).is_ok() {
                return Err(Error::PathInUse(path));
            }
            std::fs::remove_file(&path).map_err(Error::from)?;
        }
        let listener = UnixListener::bind(&path).map_err(Error::from)?;
        listener.set_nonblocking(true).map_err(Error::from)?;

        Ok(Host {
            listener,
            path,
            watermark: DEFAULT_WATERMARK,
            backlog: DEFAULT_BACKLOG,
            state: Mutex::new(HostState {
                clients: Vec::new(),
                live: Vec::new(),
                next_serial: 1,
                next_client_id: 1,
            }),
        })
    }

    /// Overrides the unacknowledged-announcement watermark before a slow
    /// client is evicted.
    pub fn with_watermark(mut self, watermark: u32) -> Self {
        self.watermark = watermark;
        self
    }

    /// Overrides the listen backlog recorded for this host. The socket
    /// itself is already bound by `new`; this only affects a future `bind`
    /// if this host is ever re-created at the same path.
    pub fn with_backlog(mut self, backlog: i32) -> Self {
        self.backlog = backlog;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Raw fds this host wants polled for readability: the listening socket
    /// plus every connected client.
    pub fn sockets(&self) -> Vec<RawFd> {
        let state = self.state.lock().unwrap();
        let mut fds = vec![self.listener.as_raw_fd()];
        fds.extend(state.clients.iter().map(|c| c.stream.as_raw_fd()));
        fds
    }

    /// Polls this host's sockets for readability, waiting up to `wait_ms`
    /// (0 = return immediately, negative = block indefinitely).
    pub fn poll(&self, wait_ms: i32) -> Result<Vec<RawFd>, Error> {
        let fds = self.sockets();
        let mut pollfds: Vec<libc::pollfd> = fds
            .iter()
            .map(|&fd| libc::pollfd {
                fd,
                events: libc::POLLIN,
                revents: 0,
            })
            .collect();

        let rc = unsafe {
            libc::poll(
                pollfds.as_mut_ptr(),
                pollfds.len() as libc::nfds_t,
                wait_ms,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error().into());
        }

        Ok(pollfds
            .iter()
            .filter(|p| p.revents & libc::POLLIN != 0)
            .map(|p| p.fd)
            .collect())
    }

    /// One service step: expires any due frames, then services every
    /// currently-readable socket (accepting new connections, reading client
    /// messages). Call this repeatedly from a service loop, typically after
    /// `poll` reports readiness.
    pub fn process(&self) -> Result<(), Error> {
        self.expire_due_frames()?;
        for fd in self.poll(0)? {
            self.service(fd)?;
        }
        Ok(())
    }

    /// Walks the live queue from the front, removing frames whose expiry has
    /// passed AND whose serial no connected client still holds, and stops at
    /// the first frame that fails either condition (spec's expiry
    /// algorithm): a frame stuck at the head because one slow client still
    /// holds it must not let later, unheld frames jump ahead of it.
    fn expire_due_frames(&self) -> Result<(), Error> {
        let now = crate::timestamp()?;
        let mut state = self.state.lock().unwrap();
        let mut expired = Vec::new();
        loop {
            let Some(frame) = state.live.first() else {
                break;
            };
            let expires = frame.expires();
            if !(expires >= 0 && expires <= now) {
                break;
            }
            let serial = frame.serial();
            if state.clients.iter().any(|c| c.held.contains(&serial)) {
                break;
            }
            expired.push(state.live.remove(0));
        }
        for frame in expired {
            trace_hot_path!("expiring frame serial={}", frame.serial());
            frame.mark_expired();
            broadcast(&mut state.clients, Kind::Expire, frame.serial());
        }
        Ok(())
    }

    /// Services one ready fd: accepts a new connection if it's the listening
    /// socket, otherwise reads and handles one message from that client.
    pub fn service(&self, fd: RawFd) -> Result<(), Error> {
        if fd == self.listener.as_raw_fd() {
            return self.accept_one();
        }

        let mut state = self.state.lock().unwrap();
        let Some(idx) = state.clients.iter().position(|c| c.stream.as_raw_fd() == fd) else {
            return Ok(());
        };

        let msg = {
            let conn = &mut state.clients[idx];
            conn.reader.read_one(&conn.stream)
        };

        match msg {
            Ok(Some(m)) => self.handle_client_message(&mut state, idx, m),
            Ok(None) => Ok(()),
            Err(Error::PeerClosed) => {
                state.clients.remove(idx);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn handle_client_message(
        &self,
        state: &mut HostState,
        idx: usize,
        msg: wire::Message,
    ) -> Result<(), Error> {
        match msg.header.kind() {
            Some(Kind::Hello) => {
                state.clients[idx].state = ConnState::Ready;
                wire::send_simple(&state.clients[idx].stream, &wire::Header::new(Kind::HelloAck))
                    .map_err(Error::from)?;
                let live = state.live.clone();
                for frame in live {
                    announce_one(&mut state.clients[idx], &frame);
                }
                Ok(())
            }
            Some(Kind::Unlock) => {
                state.clients[idx].held.remove(&msg.header.serial);
                Ok(())
            }
            Some(Kind::Bye) => {
                state.clients.remove(idx);
                Ok(())
            }
            _ => Err(Error::Protocol("unexpected message kind from client")),
        }
    }

    fn accept_one(&self) -> Result<(), Error> {
        match self.listener.accept() {
            Ok((stream, _addr)) => {
                stream.set_nonblocking(true).map_err(Error::from)?;
                let mut state = self.state.lock().unwrap();
                let id = state.next_client_id;
                state.next_client_id += 1;
                state.clients.push(ClientConn {
                    id,
                    stream,
                    reader: wire::MessageReader::new(),
                    state: ConnState::New,
                    held: HashSet::new(),
                });
                trace_hot_path!("accepted client id={id}");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Posts `frame` for broadcast to every connected, ready client,
    /// stamping `expires`/`duration`/`pts`/`dts` (`-1` for "unknown"/"never
    /// expires") and a freshly assigned monotonically increasing serial.
    /// Consumes `frame`: the caller no longer owns it afterward. Returns the
    /// assigned serial, which is the handle to later call [`Host::drop_frame`].
    pub fn post(
        &self,
        frame: Frame,
        expires: i64,
        duration: i64,
        pts: i64,
        dts: i64,
    ) -> Result<i64, Error> {
        let now = crate::timestamp()?;
        let mut state = self.state.lock().unwrap();
        let serial = state.next_serial;
        state.next_serial += 1;
        frame.install_posted_meta(serial, now, expires, duration, pts, dts);

        let watermark = self.watermark;
        let mut evict = Vec::new();
        for conn in state.clients.iter_mut() {
            if conn.state != ConnState::Ready {
                continue;
            }
            announce_one(conn, &frame);
            if conn.held.len() as u32 > watermark {
                evict.push(conn.id);
            }
        }
        if !evict.is_empty() {
            for conn in state.clients.iter().filter(|c| evict.contains(&c.id)) {
                trace_hot_path!("evicting slow client id={}", conn.id);
                let _ = send_bye(conn);
            }
            state.clients.retain(|c| !evict.contains(&c.id));
        }

        state.live.push(frame);
        Ok(serial)
    }

    /// Removes the frame with the given serial from the live queue and
    /// broadcasts a `DROP`, returning ownership of the [`Frame`] to the
    /// caller. Errs with [`Error::InvalidArgument`] if no live frame has
    /// that serial.
    pub fn drop_frame(&self, serial: i64) -> Result<Frame, Error> {
        let mut state = self.state.lock().unwrap();
        let idx = state
            .live
            .iter()
            .position(|f| f.serial() == serial)
            .ok_or(Error::InvalidArgument("no live frame with that serial"))?;
        let frame = state.live.remove(idx);
        frame.mark_expired();
        broadcast(&mut state.clients, Kind::Drop, serial);
        Ok(frame)
    }
}

fn announce_one(conn: &mut ClientConn, frame: &Frame) {
    let fd = match frame.raw_fd() {
        Some(fd) => fd,
        None => return,
    };
    let dup_fd = unsafe { libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, 0) };
    if dup_fd < 0 {
        return;
    }

    let mut header = wire::Header::new(Kind::Announce);
    header.serial = frame.serial();
    header.timestamp = frame.timestamp();
    header.expires = frame.expires();
    header.duration = frame.duration();
    header.pts = frame.pts();
    header.dts = frame.dts();
    header.fourcc = frame.fourcc();
    header.width = frame.width() as u16;
    header.height = frame.height() as u16;

    let payload = frame.announce_payload();
    let result = wire::send_announce(&conn.stream, header, &payload, dup_fd);
    unsafe {
        libc::close(dup_fd);
    }
    if result.is_ok() {
        conn.held.insert(frame.serial());
    }
}

fn send_bye(conn: &ClientConn) -> io::Result<()> {
    wire::send_simple(&conn.stream, &wire::Header::new(Kind::Bye))
}

fn broadcast(clients: &mut [ClientConn], kind: Kind, serial: i64) {
    for conn in clients.iter_mut() {
        if conn.state != ConnState::Ready {
            continue;
        }
        let mut header = wire::Header::new(kind);
        header.serial = serial;
        let _ = wire::send_simple(&conn.stream, &header);
    }
}

impl Drop for Host {
    fn drop(&mut self) {
        let mut state = self.state.lock().unwrap();
        for conn in state.clients.iter() {
            let _ = send_bye(conn);
        }
        state.clients.clear();
        state.live.clear();
        let _ = std::fs::remove_file(&self.path);
    }
}
