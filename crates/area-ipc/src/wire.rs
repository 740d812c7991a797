//! Post-handshake envelope framing.
//!
//! Every envelope is a fixed [`FrameHeader`] followed by `payload_len` bytes
//! of payload. When `fd_count` is non-zero, the descriptors travel on the
//! side channel immediately after the payload, attached to a single filler
//! byte, so they stay in FIFO order with the data they belong to.
//!
//! ```text
//! FrameHeader (24 bytes, little-endian)
//! [u8; payload_len]
//! if fd_count > 0: 1 filler byte + SCM_RIGHTS [fd; fd_count]
//! ```

use std::mem;
use std::os::fd::OwnedFd;

use bytemuck::{Pod, Zeroable};

use crate::error::{Error, Result};
use crate::transport::StreamTransport;

/// Upper bound on a single envelope payload.
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Upper bound on descriptors attached to one envelope.
pub const MAX_FDS: usize = 253;

/// What an envelope carries.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// Client to server invocation.
    Request = 0,
    /// Successful result for a request id.
    Response = 1,
    /// Failed result for a request id; payload is a UTF-8 message.
    Error = 2,
    /// Server-pushed event with no correlated request.
    Event = 3,
}

impl FrameKind {
    fn from_wire(value: u32) -> Result<Self> {
        match value {
            0 => Ok(Self::Request),
            1 => Ok(Self::Response),
            2 => Ok(Self::Error),
            3 => Ok(Self::Event),
            other => Err(Error::violation(format!("unknown envelope kind {other}"))),
        }
    }
}

/// Envelope header as laid out on the wire.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct FrameHeader {
    /// Detects loss of stream sync.
    pub magic: u32,
    pub kind: u32,
    /// Request id; zero for events.
    pub id: u32,
    /// Method selector; zero for anything but requests.
    pub method: u32,
    pub payload_len: u32,
    /// Descriptors following the payload on the side channel.
    pub fd_count: u32,
}

impl FrameHeader {
    pub const MAGIC: u32 = u32::from_le_bytes(*b"AREA");

    pub const fn size() -> usize {
        mem::size_of::<Self>()
    }

    fn new(kind: FrameKind, id: u32, method: u32, payload_len: usize, fd_count: usize) -> Result<Self> {
        if payload_len > MAX_MESSAGE_SIZE {
            return Err(Error::violation(format!(
                "message too large: {payload_len} bytes (limit {MAX_MESSAGE_SIZE})"
            )));
        }
        if fd_count > MAX_FDS {
            return Err(Error::usage(format!(
                "too many descriptors for one message: {fd_count} (limit {MAX_FDS})"
            )));
        }
        Ok(Self {
            magic: Self::MAGIC,
            kind: kind as u32,
            id,
            method,
            payload_len: payload_len as u32,
            fd_count: fd_count as u32,
        })
    }

    pub fn request(id: u32, method: u32, payload_len: usize, fd_count: usize) -> Result<Self> {
        Self::new(FrameKind::Request, id, method, payload_len, fd_count)
    }

    pub fn response(id: u32, payload_len: usize, fd_count: usize) -> Result<Self> {
        Self::new(FrameKind::Response, id, 0, payload_len, fd_count)
    }

    pub fn error(id: u32, payload_len: usize) -> Result<Self> {
        Self::new(FrameKind::Error, id, 0, payload_len, 0)
    }

    pub fn event(payload_len: usize, fd_count: usize) -> Result<Self> {
        Self::new(FrameKind::Event, 0, 0, payload_len, fd_count)
    }

    pub fn kind(&self) -> Result<FrameKind> {
        FrameKind::from_wire(self.kind)
    }

    /// Serialize with every field little-endian.
    pub fn encode(&self) -> [u8; mem::size_of::<FrameHeader>()] {
        let le = Self {
            magic: self.magic.to_le(),
            kind: self.kind.to_le(),
            id: self.id.to_le(),
            method: self.method.to_le(),
            payload_len: self.payload_len.to_le(),
            fd_count: self.fd_count.to_le(),
        };
        bytemuck::cast(le)
    }

    /// Parse and validate a received header.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != Self::size() {
            return Err(Error::violation(format!(
                "envelope header must be {} bytes, got {}",
                Self::size(),
                bytes.len()
            )));
        }
        let raw: Self = bytemuck::pod_read_unaligned(bytes);
        let header = Self {
            magic: u32::from_le(raw.magic),
            kind: u32::from_le(raw.kind),
            id: u32::from_le(raw.id),
            method: u32::from_le(raw.method),
            payload_len: u32::from_le(raw.payload_len),
            fd_count: u32::from_le(raw.fd_count),
        };

        if header.magic != Self::MAGIC {
            return Err(Error::violation(format!(
                "bad envelope magic {:#010x}",
                header.magic
            )));
        }
        header.kind()?;
        if header.payload_len as usize > MAX_MESSAGE_SIZE {
            return Err(Error::violation(format!(
                "message too large: {} bytes (limit {MAX_MESSAGE_SIZE})",
                header.payload_len
            )));
        }
        if header.fd_count as usize > MAX_FDS {
            return Err(Error::violation(format!(
                "too many descriptors announced: {}",
                header.fd_count
            )));
        }
        Ok(header)
    }
}

/// One decoded envelope together with its descriptors.
#[derive(Debug)]
pub struct Frame {
    pub header: FrameHeader,
    pub payload: Vec<u8>,
    pub fds: Vec<OwnedFd>,
}

/// Read one complete envelope, descriptors included.
pub fn read_frame(transport: &StreamTransport) -> Result<Frame> {
    let mut raw = [0u8; FrameHeader::size()];
    transport.receive(&mut raw)?;
    let header = FrameHeader::decode(&raw)?;

    let mut payload = vec![0u8; header.payload_len as usize];
    if !payload.is_empty() {
        transport.receive(&mut payload)?;
    }
    let fds = receive_fds(transport, header.fd_count as usize)?;

    Ok(Frame {
        header,
        payload,
        fds,
    })
}

/// Write one envelope. Callers serialise writers on the same transport.
pub fn write_frame(
    transport: &StreamTransport,
    header: &FrameHeader,
    payload: &[u8],
    fds: Vec<OwnedFd>,
) -> Result<()> {
    debug_assert_eq!(header.payload_len as usize, payload.len());
    debug_assert_eq!(header.fd_count as usize, fds.len());

    let mut message = Vec::with_capacity(FrameHeader::size() + payload.len());
    message.extend_from_slice(&header.encode());
    message.extend_from_slice(payload);
    transport.send(&message, Vec::new())?;
    send_fds(transport, fds)
}

/// Send descriptors on the side channel, attached to one filler byte.
pub fn send_fds(transport: &StreamTransport, fds: Vec<OwnedFd>) -> Result<()> {
    if fds.is_empty() {
        return Ok(());
    }
    transport.send(&[0u8], fds)
}

/// Receive exactly `count` descriptors sent with [`send_fds`].
pub fn receive_fds(transport: &StreamTransport, count: usize) -> Result<Vec<OwnedFd>> {
    if count == 0 {
        return Ok(Vec::new());
    }
    let mut filler = [0u8; 1];
    transport.receive_with_fds(&mut filler, count)
}
