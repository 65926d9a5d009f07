//! Passing native buffer descriptors between processes.
//!
//! Descriptors ride in `SCM_RIGHTS` ancillary data attached to the first byte
//! of a frame, so a frame header and the descriptor of the buffer it names
//! always arrive together.

use crate::error::{Error, Result};
use rustix::fd::{AsFd, BorrowedFd, OwnedFd};
use rustix::net::{
    RecvAncillaryBuffer, RecvAncillaryMessage, RecvFlags, SendAncillaryBuffer,
    SendAncillaryMessage, SendFlags, recvmsg, sendmsg,
};
use std::io::{IoSlice, IoSliceMut};
use std::mem::MaybeUninit;
use std::os::unix::net::UnixStream;

/// Maximum number of file descriptors that can be sent in a single message.
pub const MAX_FDS_PER_MESSAGE: usize = 4;

/// Send `data` with the given descriptors attached.
///
/// `sendmsg` may accept fewer bytes than offered; the remainder is written
/// with plain writes after the descriptors have been attached to the first
/// chunk.
pub fn send_with_fds<Fd: AsFd>(socket: &UnixStream, fds: &[Fd], data: &[u8]) -> Result<()> {
    if fds.is_empty() {
        return Err(Error::InvalidArgument("no file descriptors to send".into()));
    }
    if fds.len() > MAX_FDS_PER_MESSAGE {
        return Err(Error::InvalidArgument(format!(
            "too many fds: {} > {}",
            fds.len(),
            MAX_FDS_PER_MESSAGE
        )));
    }
    if data.is_empty() {
        return Err(Error::InvalidArgument(
            "SCM_RIGHTS needs at least one data byte".into(),
        ));
    }

    let borrowed_fds: Vec<BorrowedFd<'_>> = fds.iter().map(|fd| fd.as_fd()).collect();

    let mut ancillary_space: [MaybeUninit<u8>; 64] = [const { MaybeUninit::uninit() }; 64];
    let mut ancillary = SendAncillaryBuffer::new(&mut ancillary_space);
    if !ancillary.push(SendAncillaryMessage::ScmRights(&borrowed_fds)) {
        return Err(Error::Protocol(
            "failed to add fds to ancillary buffer".into(),
        ));
    }

    let iov = [IoSlice::new(data)];
    let sent = sendmsg(socket, &iov, &mut ancillary, SendFlags::NOSIGNAL)?;

    if sent < data.len() {
        use std::io::Write;
        let mut writer: &UnixStream = socket;
        writer.write_all(&data[sent..])?;
    }

    Ok(())
}

/// Receive up to `data_buf.len()` bytes plus any attached descriptors.
///
/// Returns `(bytes_read, fds)`; `bytes_read == 0` means the peer closed.
pub fn recv_with_fds(socket: &UnixStream, data_buf: &mut [u8]) -> Result<(usize, Vec<OwnedFd>)> {
    if data_buf.is_empty() {
        return Err(Error::InvalidArgument("data buffer cannot be empty".into()));
    }

    let mut ancillary_space: [MaybeUninit<u8>; 64] = [const { MaybeUninit::uninit() }; 64];
    let mut ancillary = RecvAncillaryBuffer::new(&mut ancillary_space);

    let mut iov = [IoSliceMut::new(data_buf)];
    let result = recvmsg(socket, &mut iov, &mut ancillary, RecvFlags::CMSG_CLOEXEC)?;

    let mut fds = Vec::new();
    for msg in ancillary.drain() {
        if let RecvAncillaryMessage::ScmRights(rights) = msg {
            fds.extend(rights);
        }
    }

    Ok((result.bytes, fds))
}
