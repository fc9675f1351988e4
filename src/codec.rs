//! Length-prefixed fixed-layout message framing over a stream socket
//! (spec §4.1). Reads and writes are raw `read(2)`/`write(2)` calls via
//! `nix`, retried on `EINTR` and looped on short transfers, so that
//! partial-I/O and signal-interruption behavior is explicit rather than
//! hidden behind `std::io::Read`/`Write`.

use std::os::fd::BorrowedFd;

use nix::errno::Errno;
use nix::unistd::{read, write};

use crate::error::ProtocolError;
use crate::message::{Message, HEADER_LEN, MAX_PAYLOAD_LEN};

/// Write every byte of `buf`, retrying on `EINTR` and looping over short
/// writes. A `write` returning 0 is treated as a fatal I/O error: stream
/// sockets don't return 0 from `write` for an open connection.
fn write_all(fd: BorrowedFd<'_>, buf: &[u8]) -> Result<(), ProtocolError> {
    let mut written = 0;
    while written < buf.len() {
        match write(fd, &buf[written..]) {
            Ok(0) => {
                return Err(ProtocolError::Io(std::io::Error::new(
                    std::io::ErrorKind::WriteZero,
                    "write returned 0 bytes",
                )))
            }
            Ok(n) => written += n,
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(ProtocolError::Io(e.into())),
        }
    }
    Ok(())
}

/// Fill `buf` completely, retrying on `EINTR` and looping over short
/// reads. A 0-byte read before any bytes have been read is the peer
/// closing cleanly (`ProtocolError::ConnectionClosed`); a 0-byte read
/// after a partial fill is a truncated frame, which is an I/O error.
fn read_exact(fd: BorrowedFd<'_>, buf: &mut [u8]) -> Result<(), ProtocolError> {
    let mut filled = 0;
    while filled < buf.len() {
        match read(fd, &mut buf[filled..]) {
            Ok(0) if filled == 0 => return Err(ProtocolError::ConnectionClosed),
            Ok(0) => {
                return Err(ProtocolError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "peer closed mid-frame",
                )))
            }
            Ok(n) => filled += n,
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(ProtocolError::Io(e.into())),
        }
    }
    Ok(())
}

/// Write the header and payload for `msg` as one logical frame.
pub fn send_message(fd: BorrowedFd<'_>, msg: &Message) -> Result<(), ProtocolError> {
    let payload = msg.encode_payload()?;
    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.extend_from_slice(&msg.type_code().to_ne_bytes());
    frame.extend_from_slice(&(payload.len() as u32).to_ne_bytes());
    frame.extend_from_slice(&payload);
    write_all(fd, &frame)
}

/// Read one frame: header first, then exactly `header.length` payload
/// bytes, validated against `MAX_PAYLOAD_LEN` before the payload read
/// (§4.1 bounds check) so an attacker-controlled length can't force an
/// unbounded allocation.
pub fn recv_message(fd: BorrowedFd<'_>) -> Result<Message, ProtocolError> {
    let mut header = [0u8; HEADER_LEN];
    read_exact(fd, &mut header)?;
    let type_code = u32::from_ne_bytes(header[0..4].try_into().unwrap());
    let length = u32::from_ne_bytes(header[4..8].try_into().unwrap());
    if length > MAX_PAYLOAD_LEN {
        return Err(ProtocolError::FrameTooLarge(length));
    }
    let mut payload = vec![0u8; length as usize];
    read_exact(fd, &mut payload)?;
    Message::decode(type_code, &payload).map_err(|e| match e {
        // an unknown-type error should report the header's type code,
        // not one derived from the (empty) payload
        ProtocolError::UnknownType(_) => ProtocolError::UnknownType(type_code),
        other => other,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
    use std::os::fd::AsFd;

    fn pair() -> (std::os::fd::OwnedFd, std::os::fd::OwnedFd) {
        socketpair(AddressFamily::Unix, SockType::Stream, None, SockFlag::empty()).unwrap()
    }

    #[test]
    fn roundtrip_over_socketpair() {
        let (a, b) = pair();
        send_message(a.as_fd(), &Message::Ping).unwrap();
        let got = recv_message(b.as_fd()).unwrap();
        assert_eq!(got, Message::Ping);
    }

    #[test]
    fn roundtrip_start_process_over_socketpair() {
        let (a, b) = pair();
        let msg = Message::StartProcess {
            name: "/bin/sleep".to_string(),
            args: vec!["2".to_string()],
        };
        send_message(a.as_fd(), &msg).unwrap();
        let got = recv_message(b.as_fd()).unwrap();
        assert_eq!(got, msg);
    }

    #[test]
    fn peer_close_is_reported_distinctly() {
        let (a, b) = pair();
        drop(a);
        let err = recv_message(b.as_fd()).unwrap_err();
        assert!(matches!(err, ProtocolError::ConnectionClosed));
    }

    #[test]
    fn oversize_length_is_rejected_before_payload_read() {
        let (a, b) = pair();
        let header = [1u8, 0, 0, 0, 0xff, 0xff, 0xff, 0x7f];
        write_all(a.as_fd(), &header).unwrap();
        let err = recv_message(b.as_fd()).unwrap_err();
        assert!(matches!(err, ProtocolError::FrameTooLarge(_)));
    }

    /// Feeding the frame one byte at a time through the kernel pipe
    /// simulates the short-read/short-write case without needing to
    /// fake the syscall layer (§8 P2).
    #[test]
    fn survives_byte_at_a_time_delivery() {
        let (a, b) = pair();
        let msg = Message::ApplyConstraints {
            pid: 123,
            memory_limit: 64 * 1024 * 1024,
            cpu_limit: 50,
        };
        let payload = msg.encode_payload().unwrap();
        let mut frame = Vec::new();
        frame.extend_from_slice(&msg.type_code().to_ne_bytes());
        frame.extend_from_slice(&(payload.len() as u32).to_ne_bytes());
        frame.extend_from_slice(&payload);

        std::thread::scope(|s| {
            s.spawn(|| {
                for byte in &frame {
                    write_all(a.as_fd(), std::slice::from_ref(byte)).unwrap();
                }
            });
            let got = recv_message(b.as_fd()).unwrap();
            assert_eq!(got, msg);
        });
    }
}
