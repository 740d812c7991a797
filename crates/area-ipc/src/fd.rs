//! File descriptor side channel.
//!
//! Descriptors ride alongside stream data as `SCM_RIGHTS` ancillary data.
//! A stream socket does not preserve message boundaries, so a single
//! `recvmsg` may return part of the data and part of the descriptors; the
//! reader here accumulates across calls until it has exactly what was asked
//! for.

use std::io::{IoSlice, IoSliceMut};
use std::os::fd::{FromRawFd, OwnedFd, RawFd};

use nix::errno::Errno;
use nix::sys::socket::{
    recv, recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags, UnixAddr,
};

use crate::wire::MAX_FDS;

/// Raw outcome of a codec operation, before the transport maps it onto
/// [`crate::Error`] and notifies its observers.
#[derive(Debug)]
pub(crate) enum CodecError {
    /// Orderly shutdown by the peer before the read completed.
    Closed,
    /// `EPIPE` / `ECONNRESET`.
    Disconnected(Errno),
    /// Descriptors arrived on a read that asked for none.
    UnexpectedFds,
    /// The peer sent a different number of descriptors than expected.
    FdCountMismatch { expected: usize, received: usize },
    /// Any other OS error.
    Os(Errno),
}

fn is_transient(errno: Errno) -> bool {
    matches!(errno, Errno::EINTR | Errno::EAGAIN)
}

fn is_disconnect(errno: Errno) -> bool {
    matches!(errno, Errno::EPIPE | Errno::ECONNRESET)
}

/// Read exactly `buffer.len()` bytes and exactly `expected_fds` descriptors.
///
/// Blocks until both are satisfied or the stream fails. The control buffer
/// always has room for a full `SCM_RIGHTS` message, so every descriptor the
/// kernel hands over is owned here; surplus ones are closed before the error
/// returns and nothing leaks.
pub(crate) fn receive(
    fd: RawFd,
    buffer: &mut [u8],
    expected_fds: usize,
) -> Result<Vec<OwnedFd>, CodecError> {
    let mut fds: Vec<OwnedFd> = Vec::with_capacity(expected_fds);
    let mut cmsg_space = nix::cmsg_space!([RawFd; MAX_FDS]);
    let mut bytes_read = 0;

    while bytes_read < buffer.len() {
        let mut iov = [IoSliceMut::new(&mut buffer[bytes_read..])];
        let msg = match recvmsg::<UnixAddr>(
            fd,
            &mut iov,
            Some(cmsg_space.as_mut_slice()),
            MsgFlags::MSG_CMSG_CLOEXEC,
        ) {
            Ok(msg) => msg,
            Err(errno) if is_transient(errno) => continue,
            Err(errno) if is_disconnect(errno) => return Err(CodecError::Disconnected(errno)),
            Err(errno) => return Err(CodecError::Os(errno)),
        };

        // nix refuses to walk a truncated control buffer; MSG_CTRUNC is read
        // from the flags instead.
        let truncated = msg.flags.contains(MsgFlags::MSG_CTRUNC);
        if let Ok(cmsgs) = msg.cmsgs() {
            for cmsg in cmsgs {
                if let ControlMessageOwned::ScmRights(raw_fds) = cmsg {
                    for raw in raw_fds {
                        // SAFETY: the kernel just installed this descriptor
                        // for us and nothing else refers to it.
                        fds.push(unsafe { OwnedFd::from_raw_fd(raw) });
                    }
                }
            }
        }
        let bytes = msg.bytes;

        if expected_fds == 0 && (truncated || !fds.is_empty()) {
            return Err(CodecError::UnexpectedFds);
        }
        if truncated || fds.len() > expected_fds {
            // The kernel closes whatever did not fit; count it as at least one more.
            let received = fds.len().max(expected_fds + 1);
            return Err(CodecError::FdCountMismatch {
                expected: expected_fds,
                received,
            });
        }
        if bytes == 0 {
            return Err(CodecError::Closed);
        }
        bytes_read += bytes;
    }

    if fds.len() != expected_fds {
        return Err(CodecError::FdCountMismatch {
            expected: expected_fds,
            received: fds.len(),
        });
    }
    Ok(fds)
}

/// Write all of `buffer`, attaching `fds` to the first write.
pub(crate) fn send(fd: RawFd, buffer: &[u8], fds: &[RawFd]) -> Result<(), CodecError> {
    let mut written = 0;
    let mut fds_pending = !fds.is_empty();
    let rights = [ControlMessage::ScmRights(fds)];

    while written < buffer.len() {
        let iov = [IoSlice::new(&buffer[written..])];
        let cmsgs: &[ControlMessage<'_>] = if fds_pending { &rights } else { &[] };
        match sendmsg::<()>(fd, &iov, cmsgs, MsgFlags::MSG_NOSIGNAL, None) {
            Ok(sent) => {
                written += sent;
                fds_pending = false;
            }
            Err(errno) if is_transient(errno) => continue,
            Err(errno) if is_disconnect(errno) => return Err(CodecError::Disconnected(errno)),
            Err(errno) => return Err(CodecError::Os(errno)),
        }
    }
    Ok(())
}

/// Whether unread application data is still queued on the socket.
pub(crate) fn has_pending_data(fd: RawFd) -> bool {
    let mut peeked = [0u8; 1];
    loop {
        match recv(fd, &mut peeked, MsgFlags::MSG_PEEK | MsgFlags::MSG_DONTWAIT) {
            Ok(n) => return n > 0,
            Err(Errno::EINTR) => continue,
            Err(_) => return false,
        }
    }
}
