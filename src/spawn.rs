//! Fork + exec with the child-resource discipline spec §5 requires:
//! every fd above stderr closed before exec, and exec failure reaching
//! `_exit` rather than the normal exit path (which would run the
//! parent's drop-based cleanup guards — spec §9 redesign note 4).

use std::ffi::CString;

use anyhow::{Context, Result};
use libc::pid_t;
use nix::sys::signal::SigSet;
use nix::unistd::{close, execvp, fork, ForkResult};

use crate::pidfd::PidFd;

const MAX_INHERITED_FD: i32 = 1024;

fn close_extra_fds() {
    for fd in 3..MAX_INHERITED_FD {
        let _ = close(fd);
    }
}

/// Fork and exec `name` with `args` as `argv[1..]` (`name` itself is
/// `argv[0]`). Returns the child's host PID and a pidfd opened in the
/// parent immediately after `fork`, while the PID is still guaranteed
/// to refer to this child.
pub fn spawn(name: &str, args: &[String]) -> Result<(pid_t, PidFd)> {
    let argv0 = CString::new(name.as_bytes()).with_context(|| format!("invalid argv0: {name:?}"))?;
    let mut argv = Vec::with_capacity(args.len() + 1);
    argv.push(argv0.clone());
    for a in args {
        argv.push(CString::new(a.as_bytes()).with_context(|| format!("invalid argument: {a:?}"))?);
    }

    match unsafe { fork() }.context("fork")? {
        ForkResult::Child => {
            // exec preserves the blocked-signal mask across the image
            // swap, so without this the child would inherit the
            // parent's SIGCHLD/SIGINT/SIGTERM block (§9 signalfd setup)
            // and ignore a later SIGTERM from StopProcess.
            let _ = SigSet::empty().thread_set_mask();
            close_extra_fds();
            // execvp only returns on failure
            let _ = execvp(&argv0, &argv);
            unsafe { libc::_exit(1) };
        }
        ForkResult::Parent { child } => {
            let pidfd = PidFd::open(child.as_raw()).context("pidfd_open")?;
            Ok((child.as_raw(), pidfd))
        }
    }
}
