//! An owned pidfd: a file descriptor that refers to a specific process
//! and becomes readable (POLLIN) exactly once, when that process is
//! reaped (spec §3.3).

use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

use nix::errno::Errno;
use nix::libc::{self, siginfo_t, syscall, SYS_pidfd_open, SYS_pidfd_send_signal};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::signal::Signal;

pub struct PidFd(OwnedFd);

impl PidFd {
    /// Open a pidfd for `pid`, normally called by the parent immediately
    /// after `fork` while the PID is still guaranteed to refer to that
    /// child (it hasn't had a chance to exit and be reaped by anyone
    /// else yet).
    pub fn open(pid: libc::pid_t) -> std::io::Result<Self> {
        let fd = unsafe { syscall(SYS_pidfd_open, pid, 0) };
        if fd < 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(Self(unsafe { OwnedFd::from_raw_fd(fd as RawFd) }))
    }

    /// Send `signal` to the process this pidfd refers to via
    /// `pidfd_send_signal`, which (unlike `kill(2)` by PID) can't
    /// accidentally target a recycled PID.
    pub fn send_signal(&self, signal: Signal) -> nix::Result<()> {
        let res = unsafe {
            syscall(
                SYS_pidfd_send_signal,
                self.as_raw_fd(),
                signal as i32,
                std::ptr::null::<*const siginfo_t>(),
                0,
            )
        };
        if res < 0 {
            return Err(Errno::last());
        }
        Ok(())
    }

    /// Block until the referenced process has been reaped.
    pub fn wait(&self) -> std::io::Result<()> {
        let mut fds = [PollFd::new(self.0.as_fd(), PollFlags::POLLIN)];
        loop {
            match poll(&mut fds, PollTimeout::NONE) {
                Ok(_) => return Ok(()),
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl AsRawFd for PidFd {
    fn as_raw_fd(&self) -> RawFd {
        self.0.as_raw_fd()
    }
}

impl AsFd for PidFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.as_fd()
    }
}

impl From<PidFd> for OwnedFd {
    fn from(value: PidFd) -> Self {
        value.0
    }
}

impl From<OwnedFd> for PidFd {
    /// Wrap an `OwnedFd` received via SCM_RIGHTS: the fd is a pidfd
    /// regardless of whether this process opened it itself or received
    /// it from a peer, so the two constructors converge on the same type.
    fn from(value: OwnedFd) -> Self {
        Self(value)
    }
}
