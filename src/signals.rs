//! SIGCHLD/SIGINT/SIGTERM delivery via `signalfd`, read from the
//! ordinary event loop instead of an async-signal-context handler
//! (spec §9 redesign note 3). This removes every async-signal-safety
//! constraint from the reaping code: draining the signalfd happens in
//! the same execution context as everything else the event loop does.

use nix::sys::signal::{SigSet, Signal};
use nix::sys::signalfd::{SfdFlags, SignalFd as NixSignalFd};

/// Block `signals` from their default disposition on the calling
/// thread and return a pollable fd that receives them instead.
///
/// `exec` preserves the calling thread's signal mask across the image
/// replacement — it does not reset it — so every spawned child must
/// explicitly restore its own mask before exec if it shouldn't inherit
/// this block (see `spawn::spawn`'s `ForkResult::Child` arm).
pub fn block_and_watch(signals: &[Signal]) -> nix::Result<NixSignalFd> {
    let mut mask = SigSet::empty();
    for &sig in signals {
        mask.add(sig);
    }
    mask.thread_block()?;
    // non-blocking so draining the fd in a loop (there may be several
    // queued signals, e.g. two SIGCHLDs) terminates on EAGAIN instead
    // of blocking for one more signal that may never come
    NixSignalFd::with_flags(&mask, SfdFlags::SFD_CLOEXEC | SfdFlags::SFD_NONBLOCK)
}
