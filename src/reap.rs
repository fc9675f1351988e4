//! Draining exited children via `waitid(..., WNOHANG)`, shared by the
//! agent's signalfd-driven reaper and the orchestrator's local-child
//! reaping (spec §4.4, §9 redesign note 3; grounded in the same
//! "loop until StillAlive/ECHILD" shape this codebase already uses
//! elsewhere for subprocess supervision).

use nix::errno::Errno;
use nix::sys::wait::{waitid, Id, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;

/// Drain every exited-and-unwaited child, invoking `on_exit(pid,
/// exit_status)` for each. Mirrors shells' convention of reporting a
/// signal death as `128 + signal`. Returns once no more children are
/// immediately reapable (`StillAlive`) or there are none left at all
/// (`ECHILD`, reported as `false` so callers who only supervise one
/// child can stop polling).
pub fn drain_exits(mut on_exit: impl FnMut(Pid, i32)) -> nix::Result<bool> {
    loop {
        match waitid(Id::All, WaitPidFlag::WNOHANG | WaitPidFlag::WEXITED) {
            Ok(WaitStatus::Exited(pid, status)) => on_exit(pid, status),
            Ok(WaitStatus::Signaled(pid, signal, _)) => on_exit(pid, 128 + signal as i32),
            Ok(WaitStatus::StillAlive) => return Ok(true),
            Ok(_) => {}
            Err(Errno::ECHILD) => return Ok(false),
            Err(e) => return Err(e),
        }
    }
}
