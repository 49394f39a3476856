// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

//! The fixed-format messages exchanged between a [`crate::host::Host`] and a
//! [`crate::client::Client`], and the SCM_RIGHTS plumbing used to carry a
//! file descriptor alongside an `ANNOUNCE`.
//!
//! Every message is a 64-byte header, little-endian, optionally followed by a
//! kind-specific payload. Only `ANNOUNCE` carries a payload and a file
//! descriptor. Because the header size and the payload size are both fully
//! determined by `kind`, a connection never needs an explicit length field:
//! the reader just needs to know how many bytes a given `kind` occupies.

use crate::Error;
use std::collections::VecDeque;
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;

pub const MAGIC: [u8; 4] = *b"VSL1";
pub const HEADER_LEN: usize = 64;
pub const ANNOUNCE_PAYLOAD_LEN: usize = 16;

const FLAG_FD_ATTACHED: u16 = 1 << 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Hello = 1,
    HelloAck = 2,
    Announce = 3,
    Expire = 4,
    Drop = 5,
    Unlock = 6,
    Bye = 7,
}

impl Kind {
    fn from_u16(v: u16) -> Option<Kind> {
        Some(match v {
            1 => Kind::Hello,
            2 => Kind::HelloAck,
            3 => Kind::Announce,
            4 => Kind::Expire,
            5 => Kind::Drop,
            6 => Kind::Unlock,
            7 => Kind::Bye,
            _ => return None,
        })
    }

    /// Total on-wire length (header + payload) for a message of this kind.
    fn total_len(self) -> usize {
        match self {
            Kind::Announce => HEADER_LEN + ANNOUNCE_PAYLOAD_LEN,
            _ => HEADER_LEN,
        }
    }
}

/// The 64-byte fixed header shared by every wire message.
#[derive(Debug, Clone, Copy, Default)]
pub struct Header {
    pub kind: u16,
    pub flags: u16,
    pub serial: i64,
    pub timestamp: i64,
    pub expires: i64,
    pub duration: i64,
    pub pts: i64,
    pub dts: i64,
    pub fourcc: u32,
    pub width: u16,
    pub height: u16,
}

impl Header {
    pub fn new(kind: Kind) -> Self {
        Header {
            kind: kind as u16,
            duration: -1,
            pts: -1,
            dts: -1,
            ..Default::default()
        }
    }

    pub fn kind(&self) -> Option<Kind> {
        Kind::from_u16(self.kind)
    }

    pub fn fd_attached(&self) -> bool {
        self.flags & FLAG_FD_ATTACHED != 0
    }

    pub fn set_fd_attached(&mut self, attached: bool) {
        if attached {
            self.flags |= FLAG_FD_ATTACHED;
        } else {
            self.flags &= !FLAG_FD_ATTACHED;
        }
    }

    fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0..4].copy_from_slice(&MAGIC);
        buf[4..6].copy_from_slice(&self.kind.to_le_bytes());
        buf[6..8].copy_from_slice(&self.flags.to_le_bytes());
        buf[8..16].copy_from_slice(&self.serial.to_le_bytes());
        buf[16..24].copy_from_slice(&self.timestamp.to_le_bytes());
        buf[24..32].copy_from_slice(&self.expires.to_le_bytes());
        buf[32..40].copy_from_slice(&self.duration.to_le_bytes());
        buf[40..48].copy_from_slice(&self.pts.to_le_bytes());
        buf[48..56].copy_from_slice(&self.dts.to_le_bytes());
        buf[56..60].copy_from_slice(&self.fourcc.to_le_bytes());
        buf[60..62].copy_from_slice(&self.width.to_le_bytes());
        buf[62..64].copy_from_slice(&self.height.to_le_bytes());
        buf
    }

    fn decode(buf: &[u8]) -> Result<Header, Error> {
        if buf.len() < HEADER_LEN {
            return Err(Error::Protocol("short header"));
        }
        if buf[0..4] != MAGIC {
            return Err(Error::Protocol("bad magic"));
        }
        let u16_at = |o: usize| u16::from_le_bytes(buf[o..o + 2].try_into().unwrap());
        let u32_at = |o: usize| u32::from_le_bytes(buf[o..o + 4].try_into().unwrap());
        let i64_at = |o: usize| i64::from_le_bytes(buf[o..o + 8].try_into().unwrap());
        let kind = u16_at(4);
        if Kind::from_u16(kind).is_none() {
            return Err(Error::Protocol("unknown message kind"));
        }
        Ok(Header {
            kind,
            flags: u16_at(6),
            serial: i64_at(8),
            timestamp: i64_at(16),
            expires: i64_at(24),
            duration: i64_at(32),
            pts: i64_at(40),
            dts: i64_at(48),
            fourcc: u32_at(56),
            width: u16_at(60),
            height: u16_at(62),
        })
    }
}

/// 16-byte payload carried by `ANNOUNCE`.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnnouncePayload {
    pub stride: u32,
    pub size: u32,
    pub offset: u32,
    pub reserved: u32,
}

impl AnnouncePayload {
    fn encode(&self) -> [u8; ANNOUNCE_PAYLOAD_LEN] {
        let mut buf = [0u8; ANNOUNCE_PAYLOAD_LEN];
        buf[0..4].copy_from_slice(&self.stride.to_le_bytes());
        buf[4..8].copy_from_slice(&self.size.to_le_bytes());
        buf[8..12].copy_from_slice(&self.offset.to_le_bytes());
        buf[12..16].copy_from_slice(&self.reserved.to_le_bytes());
        buf
    }

    fn decode(buf: &[u8]) -> Result<AnnouncePayload, Error> {
        if buf.len() < ANNOUNCE_PAYLOAD_LEN {
            return Err(Error::Protocol("short announce payload"));
        }
        let u32_at = |o: usize| u32::from_le_bytes(buf[o..o + 4].try_into().unwrap());
        Ok(AnnouncePayload {
            stride: u32_at(0),
            size: u32_at(4),
            offset: u32_at(8),
            reserved: u32_at(12),
        })
    }
}

/// A decoded message: header plus the optional `ANNOUNCE` payload and the
/// optional attached file descriptor.
pub struct Message {
    pub header: Header,
    pub announce: Option<AnnouncePayload>,
    pub fd: Option<OwnedFd>,
}

/// Sends a message with no payload and no attached fd (`HELLO`, `HELLO_ACK`,
/// `EXPIRE`, `DROP`, `UNLOCK`, `BYE`).
pub fn send_simple(sock: &UnixStream, header: &Header) -> io::Result<()> {
    send_raw(sock, &header.encode(), None)
}

/// Sends an `ANNOUNCE`, attaching `fd` via `SCM_RIGHTS`.
pub fn send_announce(
    sock: &UnixStream,
    mut header: Header,
    payload: &AnnouncePayload,
    fd: RawFd,
) -> io::Result<()> {
    header.set_fd_attached(true);
    let mut buf = Vec::with_capacity(HEADER_LEN + ANNOUNCE_PAYLOAD_LEN);
    buf.extend_from_slice(&header.encode());
    buf.extend_from_slice(&payload.encode());
    send_raw(sock, &buf, Some(fd))
}

fn send_raw(sock: &UnixStream, bytes: &[u8], fd: Option<RawFd>) -> io::Result<()> {
    unsafe {
        let mut iov = libc::iovec {
            iov_base: bytes.as_ptr() as *mut libc::c_void,
            iov_len: bytes.len(),
        };

        let mut cmsg_buf;
        let (control, controllen) = if let Some(fd) = fd {
            let space = libc::CMSG_SPACE(mem::size_of::<RawFd>() as u32) as usize;
            cmsg_buf = vec![0u8; space];
            let msg: *mut libc::msghdr = &mut libc::msghdr {
                msg_name: std::ptr::null_mut(),
                msg_namelen: 0,
                msg_iov: &mut iov,
                msg_iovlen: 1,
                msg_control: cmsg_buf.as_mut_ptr() as *mut libc::c_void,
                msg_controllen: space,
                msg_flags: 0,
            };
            let cmsg = libc::CMSG_FIRSTHDR(msg);
            (*cmsg).cmsg_level = libc::SOL_SOCKET;
            (*cmsg).cmsg_type = libc::SCM_RIGHTS;
            (*cmsg).cmsg_len = libc::CMSG_LEN(mem::size_of::<RawFd>() as u32) as usize;
            std::ptr::write(libc::CMSG_DATA(cmsg) as *mut RawFd, fd);
            (cmsg_buf.as_mut_ptr() as *mut libc::c_void, space)
        } else {
            (std::ptr::null_mut(), 0)
        };

        let msg = libc::msghdr {
            msg_name: std::ptr::null_mut(),
            msg_namelen: 0,
            msg_iov: &mut iov,
            msg_iovlen: 1,
            msg_control: control,
            msg_controllen: controllen,
            msg_flags: 0,
        };

        let ret = libc::sendmsg(sock.as_raw_fd(), &msg, libc::MSG_NOSIGNAL);
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

/// Accumulates bytes and ancillary file descriptors read from a connection
/// and hands back complete [`Message`]s.
///
/// Required because `SOCK_STREAM` does not preserve write boundaries: a
/// single `recvmsg` may return less than a full message (never split across
/// calls in practice for messages this small, but we don't rely on that) or,
/// with pipelined sends, more than one. Every message this protocol sends is
/// the product of exactly one `sendmsg` call, so any ancillary fd is
/// delivered together with the first byte of its message; we track fds in
/// strict arrival order and pair the next one off whenever we dequeue a
/// message whose header says `fd-attached`.
pub struct MessageReader {
    buf: Vec<u8>,
    fds: VecDeque<OwnedFd>,
    scratch: [u8; 4096],
}

impl MessageReader {
    pub fn new() -> Self {
        MessageReader {
            buf: Vec::new(),
            fds: VecDeque::new(),
            scratch: [0u8; 4096],
        }
    }

    /// Reads one chunk from `sock` and returns the first complete message now
    /// available, if any. `Ok(None)` means the read produced bytes but not
    /// yet a full message; call again. `Err` with `ErrorKind::UnexpectedEof`
    /// means the peer closed the connection.
    pub fn read_one(&mut self, sock: &UnixStream) -> Result<Option<Message>, Error> {
        if let Some(msg) = self.try_take()? {
            return Ok(Some(msg));
        }

        let n = recv_chunk(sock, &mut self.scratch, &mut self.fds)?;
        if n == 0 {
            return Err(Error::PeerClosed);
        }
        self.buf.extend_from_slice(&self.scratch[..n]);
        self.try_take()
    }

    fn try_take(&mut self) -> Result<Option<Message>, Error> {
        if self.buf.len() < HEADER_LEN {
            return Ok(None);
        }
        let header = Header::decode(&self.buf)?;
        let kind = header.kind().ok_or(Error::Protocol("unknown message kind"))?;
        let total = kind.total_len();
        if self.buf.len() < total {
            return Ok(None);
        }

        let msg_bytes: Vec<u8> = self.buf.drain(..total).collect();
        let announce = if matches!(kind, Kind::Announce) {
            Some(AnnouncePayload::decode(&msg_bytes[HEADER_LEN..])?)
        } else {
            None
        };

        let fd = if header.fd_attached() {
            match self.fds.pop_front() {
                Some(fd) => Some(fd),
                None => return Err(Error::Protocol("fd-attached flag set but no fd received")),
            }
        } else {
            None
        };

        Ok(Some(Message {
            header,
            announce,
            fd,
        }))
    }
}

impl Default for MessageReader {
    fn default() -> Self {
        Self::new()
    }
}

fn recv_chunk(
    sock: &UnixStream,
    buf: &mut [u8],
    fds: &mut VecDeque<OwnedFd>,
) -> io::Result<usize> {
    unsafe {
        let mut iov = libc::iovec {
            iov_base: buf.as_mut_ptr() as *mut libc::c_void,
            iov_len: buf.len(),
        };

        const MAX_FDS: usize = 4;
        let space = libc::CMSG_SPACE((mem::size_of::<RawFd>() * MAX_FDS) as u32) as usize;
        let mut cmsg_buf = vec![0u8; space];

        let mut msg = libc::msghdr {
            msg_name: std::ptr::null_mut(),
            msg_namelen: 0,
            msg_iov: &mut iov,
            msg_iovlen: 1,
            msg_control: cmsg_buf.as_mut_ptr() as *mut libc::c_void,
            msg_controllen: space,
            msg_flags: 0,
        };

        let n = libc::recvmsg(sock.as_raw_fd(), &mut msg, 0);
        if n < 0 {
            return Err(io::Error::last_os_error());
        }

        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                let data = libc::CMSG_DATA(cmsg) as *const RawFd;
                let payload_len = (*cmsg).cmsg_len - (data as usize - cmsg as *const _ as usize);
                let count = payload_len / mem::size_of::<RawFd>();
                for i in 0..count {
                    let fd = std::ptr::read_unaligned(data.add(i));
                    fds.push_back(OwnedFd::from_raw_fd(fd));
                }
            }
            cmsg = libc::CMSG_NXTHDR(&mut msg, cmsg);
        }

        Ok(n as usize)
    }
}

use std::os::fd::FromRawFd;

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::IntoRawFd;

    #[test]
    fn header_roundtrip() {
        let mut h = Header::new(Kind::Announce);
        h.serial = 42;
        h.timestamp = 123456789;
        h.expires = 987654321;
        h.fourcc = u32::from_le_bytes(*b"NV12");
        h.width = 640;
        h.height = 480;
        let encoded = h.encode();
        let decoded = Header::decode(&encoded).unwrap();
        assert_eq!(decoded.serial, 42);
        assert_eq!(decoded.timestamp, 123456789);
        assert_eq!(decoded.expires, 987654321);
        assert_eq!(decoded.fourcc, u32::from_le_bytes(*b"NV12"));
        assert_eq!(decoded.width, 640);
        assert_eq!(decoded.height, 480);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut buf = [0u8; HEADER_LEN];
        buf[0..4].copy_from_slice(b"XXXX");
        assert!(matches!(Header::decode(&buf), Err(Error::Protocol(_))));
    }

    #[test]
    fn send_recv_announce_with_fd() {
        let (a, b) = UnixStream::pair().unwrap();
        let tmpfd = unsafe { libc::memfd_create(c"wire-test".as_ptr(), 0) };
        assert!(tmpfd >= 0);

        let mut header = Header::new(Kind::Announce);
        header.serial = 7;
        let payload = AnnouncePayload {
            stride: 1920,
            size: 1920 * 1080 * 2,
            offset: 0,
            reserved: 0,
        };
        send_announce(&a, header, &payload, tmpfd).unwrap();
        unsafe { libc::close(tmpfd) };

        let mut reader = MessageReader::new();
        let msg = loop {
            if let Some(msg) = reader.read_one(&b).unwrap() {
                break msg;
            }
        };
        assert_eq!(msg.header.serial, 7);
        assert!(msg.header.fd_attached());
        let announce = msg.announce.unwrap();
        assert_eq!(announce.stride, 1920);
        assert!(msg.fd.is_some());
        let _ = msg.fd.unwrap().into_raw_fd();
    }

    #[test]
    fn send_recv_simple() {
        let (a, b) = UnixStream::pair().unwrap();
        let mut header = Header::new(Kind::Unlock);
        header.serial = 99;
        send_simple(&a, &header).unwrap();

        let mut reader = MessageReader::new();
        let msg = loop {
            if let Some(msg) = reader.read_one(&b).unwrap() {
                break msg;
            }
        };
        assert_eq!(msg.header.kind().unwrap(), Kind::Unlock);
        assert_eq!(msg.header.serial, 99);
        assert!(msg.fd.is_none());
    }
}
