//! Shared library for the `agent` and `orchestrator` binaries: the
//! wire protocol, fd-passing channel, pidfd wrapper, cgroup v2
//! controller, namespace PID resolver, fork/exec helper, signalfd
//! wrapper, and the tracked-mode process registry. See `SPEC_FULL.md`
//! for the full design this implements.

pub mod cgroup;
pub mod codec;
pub mod config;
pub mod error;
pub mod fdpass;
pub mod message;
pub mod nsresolve;
pub mod pidfd;
pub mod reap;
pub mod registry;
pub mod signals;
pub mod spawn;

pub use error::ProtocolError;
pub use message::Message;
