//! Wire framing.
//!
//! Every message on an RPC connection is one frame:
//!
//! ```text
//! +-------+------+----------+-----+-----+------------------+
//! | magic | kind | fd_count | seq | len | payload (len B)  |
//! |  u16  |  u8  |    u8    | u32 | u32 | rkyv bytes       |
//! +-------+------+----------+-----+-----+------------------+
//! ```
//!
//! All integers are little-endian. Descriptors travel in `SCM_RIGHTS`
//! ancillary data attached to the frame's first byte, so they always arrive
//! with the header that announces them.

use crate::error::{Error, Result};
use crate::memory::{MAX_FDS_PER_MESSAGE, recv_with_fds, send_with_fds};
use rkyv::util::AlignedVec;
use rustix::fd::{BorrowedFd, OwnedFd};
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;

/// Frame magic, "MP".
pub const FRAME_MAGIC: u16 = 0x504d;

/// Largest accepted payload.
pub const MAX_PAYLOAD_LEN: u32 = 16 * 1024 * 1024;

/// What a frame carries.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// Client request expecting a response with the same `seq`.
    Request = 1,
    /// Server response to a request.
    Response = 2,
    /// Buffer pushed to an output subscriber.
    Output = 3,
    /// Event pushed to an event subscriber.
    Event = 4,
    /// Client request that gets no response.
    Notice = 5,
}

impl TryFrom<u8> for FrameKind {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(Self::Request),
            2 => Ok(Self::Response),
            3 => Ok(Self::Output),
            4 => Ok(Self::Event),
            5 => Ok(Self::Notice),
            _ => Err(Error::Protocol(format!("unknown frame kind: {}", value))),
        }
    }
}

/// Fixed-size frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Payload type.
    pub kind: FrameKind,
    /// Descriptors attached to this frame.
    pub fd_count: u8,
    /// Request sequence number; zero for pushes.
    pub seq: u32,
    /// Payload length.
    pub len: u32,
}

impl FrameHeader {
    /// Encoded size.
    pub const SIZE: usize = 2 + 1 + 1 + 4 + 4;

    /// Encode to bytes.
    pub fn to_bytes(self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..2].copy_from_slice(&FRAME_MAGIC.to_le_bytes());
        buf[2] = self.kind as u8;
        buf[3] = self.fd_count;
        buf[4..8].copy_from_slice(&self.seq.to_le_bytes());
        buf[8..12].copy_from_slice(&self.len.to_le_bytes());
        buf
    }

    /// Decode and validate.
    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Result<Self> {
        let magic = u16::from_le_bytes([bytes[0], bytes[1]]);
        if magic != FRAME_MAGIC {
            return Err(Error::Protocol(format!("bad frame magic {:#06x}", magic)));
        }
        let header = Self {
            kind: FrameKind::try_from(bytes[2])?,
            fd_count: bytes[3],
            seq: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
            len: u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]),
        };
        if header.len > MAX_PAYLOAD_LEN {
            return Err(Error::Protocol(format!(
                "frame payload {} exceeds {}",
                header.len, MAX_PAYLOAD_LEN
            )));
        }
        if header.fd_count as usize > MAX_FDS_PER_MESSAGE {
            return Err(Error::Protocol(format!(
                "frame announces {} descriptors",
                header.fd_count
            )));
        }
        Ok(header)
    }
}

/// A received frame.
#[derive(Debug)]
pub struct Frame {
    /// Header.
    pub header: FrameHeader,
    /// Payload, aligned for rkyv access.
    pub payload: AlignedVec,
    /// Descriptors that arrived with the frame.
    pub fds: Vec<OwnedFd>,
}

/// Write one frame. The caller serializes writers on the socket.
pub fn write_frame(
    stream: &UnixStream,
    kind: FrameKind,
    seq: u32,
    payload: &[u8],
    fd: Option<BorrowedFd<'_>>,
) -> Result<()> {
    let len = u32::try_from(payload.len())
        .ok()
        .filter(|len| *len <= MAX_PAYLOAD_LEN)
        .ok_or_else(|| Error::Protocol(format!("payload of {} bytes too large", payload.len())))?;
    let header = FrameHeader {
        kind,
        fd_count: fd.is_some() as u8,
        seq,
        len,
    };

    let mut bytes = Vec::with_capacity(FrameHeader::SIZE + payload.len());
    bytes.extend_from_slice(&header.to_bytes());
    bytes.extend_from_slice(payload);

    match fd {
        Some(fd) => send_with_fds(stream, &[fd], &bytes),
        None => {
            let mut writer = stream;
            writer.write_all(&bytes)?;
            Ok(())
        }
    }
}

/// Read one frame. Returns `Ok(None)` if the peer closed cleanly between
/// frames.
pub fn read_frame(stream: &UnixStream) -> Result<Option<Frame>> {
    let mut header_buf = [0u8; FrameHeader::SIZE];
    let (read, fds) = recv_with_fds(stream, &mut header_buf)?;
    if read == 0 {
        return Ok(None);
    }
    let mut reader = stream;
    if read < FrameHeader::SIZE {
        reader.read_exact(&mut header_buf[read..])?;
    }

    let header = FrameHeader::from_bytes(&header_buf)?;
    if fds.len() != header.fd_count as usize {
        return Err(Error::Protocol(format!(
            "frame announced {} descriptors, received {}",
            header.fd_count,
            fds.len()
        )));
    }

    let mut payload = AlignedVec::with_capacity(header.len as usize);
    payload.resize(header.len as usize, 0);
    reader.read_exact(&mut payload)?;

    Ok(Some(Frame {
        header,
        payload,
        fds,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{CpuSegment, MemorySegment, MemoryType};

    #[test]
    fn test_header_layout() {
        let header = FrameHeader {
            kind: FrameKind::Output,
            fd_count: 1,
            seq: 7,
            len: 300,
        };
        let bytes = header.to_bytes();
        assert_eq!(&bytes[0..2], b"MP");
        assert_eq!(FrameHeader::from_bytes(&bytes).unwrap(), header);
    }

    #[test]
    fn test_rejects_garbage() {
        let mut bytes = FrameHeader {
            kind: FrameKind::Request,
            fd_count: 0,
            seq: 1,
            len: 0,
        }
        .to_bytes();
        bytes[2] = 99;
        assert!(FrameHeader::from_bytes(&bytes).is_err());
        bytes[0] = 0;
        assert!(FrameHeader::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_frames_with_and_without_fd() {
        let (a, b) = UnixStream::pair().unwrap();
        let segment = CpuSegment::new(64).unwrap();
        unsafe { *segment.as_mut_ptr() = 9 };

        write_frame(&a, FrameKind::Request, 1, b"first", None).unwrap();
        write_frame(&a, FrameKind::Output, 0, b"second", Some(segment.fd())).unwrap();
        drop(a);

        let first = read_frame(&b).unwrap().unwrap();
        assert_eq!(first.header.kind, FrameKind::Request);
        assert_eq!(&first.payload[..], b"first");
        assert!(first.fds.is_empty());

        let second = read_frame(&b).unwrap().unwrap();
        assert_eq!(second.header.kind, FrameKind::Output);
        assert_eq!(&second.payload[..], b"second");
        let mapped = CpuSegment::from_fd(
            second.fds.into_iter().next().unwrap(),
            MemoryType::Cpu,
        )
        .unwrap();
        assert_eq!(unsafe { *mapped.as_ptr() }, 9);

        assert!(read_frame(&b).unwrap().is_none());
    }
}
