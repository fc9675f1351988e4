//! Agent daemon (spec §4.4): accepts connections on a Unix control
//! socket, spawns children on request, and either hands off a pidfd to
//! the caller or tracks the child for later Stop/List/ApplyConstraints
//! calls, depending on the configured mode.

use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd};
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use holden::cgroup::CgroupController;
use holden::config::{self, AgentMode};
use holden::message::{Message, ProcessListEntry, MAX_PROCESS_LIST_ENTRIES};
use holden::registry::ProcessRegistry;
use holden::{codec, fdpass, nsresolve, spawn, ProtocolError};
use nix::errno::Errno;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags};
use nix::sys::signal::{self, SigHandler, Signal};
use nix::sys::signalfd::SignalFd;
use nix::sys::socket::{accept, bind, listen, socket, AddressFamily, Backlog, SockFlag, SockType, UnixAddr};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{unlink, Pid};
use tracing::{debug, error, info, warn};

/// CLI overrides for the environment-driven configuration (§2.10, §4.6);
/// any flag left unset falls back to its `HOLDEN_*` variable, then to
/// the compiled-in default.
#[derive(Parser)]
#[command(version, about = "process-orchestration agent", long_about = None)]
struct Cli {
    /// Overrides HOLDEN_SOCKET_PATH
    #[arg(long)]
    socket_path: Option<PathBuf>,
    /// Overrides HOLDEN_AGENT_MODE (handoff|tracked)
    #[arg(long)]
    mode: Option<String>,
    /// Overrides HOLDEN_CGROUP_ROOT
    #[arg(long)]
    cgroup_root: Option<PathBuf>,
}

const EPOLL_SIGNAL_DATA: u64 = 1;
const EPOLL_LISTENER_DATA: u64 = 2;
const EPOLL_CONN_DATA: u64 = 3;

fn main() -> Result<()> {
    config::init_logging();
    let cli = Cli::parse();

    // a peer that closes its end must surface as EPIPE on our next
    // write rather than take the whole agent down
    unsafe { signal::signal(Signal::SIGPIPE, SigHandler::SigIgn) }.context("ignore SIGPIPE")?;

    let socket_path = cli.socket_path.unwrap_or_else(config::socket_path);
    let mode = match cli.mode {
        Some(m) => AgentMode::from_env_value(&m)?,
        None => config::agent_mode().context("HOLDEN_AGENT_MODE")?,
    };
    let cgroup_root = cli.cgroup_root.unwrap_or_else(config::cgroup_root);

    info!(socket_path = %socket_path.display(), ?mode, cgroup_root = %cgroup_root.display(), "starting agent");

    let cgroup = CgroupController::new(cgroup_root);
    cgroup.init();

    match unlink(&socket_path) {
        Ok(()) | Err(Errno::ENOENT) => {}
        Err(e) => bail!("removing stale socket at {}: {e}", socket_path.display()),
    }

    let listener = bind_listener(&socket_path)
        .with_context(|| format!("bind {}", socket_path.display()))?;

    let _cleanup_socket = scopeguard::guard(socket_path.clone(), |path| {
        if let Err(e) = std::fs::remove_file(&path) {
            warn!(error = %e, path = %path.display(), "failed to remove socket file on exit");
        }
    });

    let sfd = holden::signals::block_and_watch(&[Signal::SIGCHLD, Signal::SIGINT, Signal::SIGTERM])
        .context("signalfd setup")?;

    run(listener, sfd, mode, cgroup)
}

/// Low-level bind so the backlog can be set explicitly (§4.4: backlog 5),
/// which `std::os::unix::net::UnixListener` does not expose.
fn bind_listener(path: &std::path::Path) -> Result<OwnedFd> {
    let fd = socket(AddressFamily::Unix, SockType::Stream, SockFlag::SOCK_CLOEXEC, None)
        .context("socket")?;
    let addr = UnixAddr::new(path).with_context(|| format!("{}", path.display()))?;
    bind(fd.as_raw_fd(), &addr).context("bind")?;
    listen(&fd, Backlog::new(5).expect("5 is a valid backlog")).context("listen")?;
    Ok(fd)
}

fn run(listener: OwnedFd, mut sfd: SignalFd, mode: AgentMode, cgroup: CgroupController) -> Result<()> {
    let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)?;
    epoll.add(&listener, EpollEvent::new(EpollFlags::EPOLLIN, EPOLL_LISTENER_DATA))?;
    epoll.add(&sfd, EpollEvent::new(EpollFlags::EPOLLIN, EPOLL_SIGNAL_DATA))?;
    let mut events = [EpollEvent::empty()];

    let mut registry = ProcessRegistry::new();

    loop {
        match epoll.wait(&mut events, -1) {
            Ok(n) if n < 1 => continue,
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e.into()),
            Ok(_) => {}
        }

        match events[0].data() {
            EPOLL_SIGNAL_DATA => {
                if drain_signals(&mut sfd, &mut registry, &cgroup)? {
                    info!("shutdown signal received, exiting");
                    return Ok(());
                }
            }
            EPOLL_LISTENER_DATA => match accept(listener.as_raw_fd()) {
                Ok(raw) => {
                    let conn = unsafe { OwnedFd::from_raw_fd(raw) };
                    debug!("accepted connection");
                    match serve_connection(conn.as_fd(), &mut sfd, &mut registry, &cgroup, mode) {
                        Ok(true) => {
                            info!("shutdown signal received mid-connection, exiting");
                            return Ok(());
                        }
                        Ok(false) => debug!("connection closed"),
                        Err(e) => warn!(error = %e, "connection ended with an error"),
                    }
                }
                Err(Errno::EINTR) => {}
                Err(e) => warn!(error = %e, "accept failed"),
            },
            other => warn!(data = other, "unexpected epoll data"),
        }
    }
}

/// Drain every queued signal. Returns `true` if a shutdown signal
/// (SIGINT/SIGTERM) was among them.
fn drain_signals(sfd: &mut SignalFd, registry: &mut ProcessRegistry, cgroup: &CgroupController) -> Result<bool> {
    let mut shutdown = false;
    loop {
        match sfd.read_signal() {
            Ok(Some(info)) if info.ssi_signo == Signal::SIGCHLD as u32 => {
                reap_and_remove(registry, cgroup)?;
            }
            Ok(Some(info)) => {
                info!(signal = info.ssi_signo, "shutdown signal received");
                shutdown = true;
            }
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "signalfd read failed");
                break;
            }
        }
    }
    Ok(shutdown)
}

fn reap_and_remove(registry: &mut ProcessRegistry, cgroup: &CgroupController) -> Result<()> {
    holden::reap::drain_exits(|pid, status| {
        info!(pid = pid.as_raw(), status, "reaped child");
        if let Some(record) = registry.remove(pid.as_raw()) {
            if record.cgroup_applied {
                cgroup.remove_process_cgroup(pid.as_raw());
            }
        }
    })?;
    Ok(())
}

/// Serve requests on one accepted connection until it closes or a
/// protocol error ends it. Returns `true` if a shutdown signal arrived
/// while this connection was open.
fn serve_connection(
    conn: BorrowedFd<'_>,
    sfd: &mut SignalFd,
    registry: &mut ProcessRegistry,
    cgroup: &CgroupController,
    mode: AgentMode,
) -> Result<bool> {
    let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)?;
    epoll.add(&conn, EpollEvent::new(EpollFlags::EPOLLIN, EPOLL_CONN_DATA))?;
    epoll.add(&*sfd, EpollEvent::new(EpollFlags::EPOLLIN, EPOLL_SIGNAL_DATA))?;
    let mut events = [EpollEvent::empty()];

    loop {
        match epoll.wait(&mut events, -1) {
            Ok(n) if n < 1 => continue,
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e.into()),
            Ok(_) => {}
        }

        match events[0].data() {
            EPOLL_SIGNAL_DATA => {
                if drain_signals(sfd, registry, cgroup)? {
                    return Ok(true);
                }
            }
            EPOLL_CONN_DATA => {
                let request = match codec::recv_message(conn) {
                    Ok(msg) => msg,
                    Err(ProtocolError::ConnectionClosed) => return Ok(false),
                    Err(e) => {
                        warn!(error = %e, "protocol error reading request");
                        return Ok(false);
                    }
                };
                if !handle_message(conn, request, registry, cgroup, mode)? {
                    return Ok(false);
                }
            }
            other => warn!(data = other, "unexpected epoll data"),
        }
    }
}

/// Dispatch one request and write its reply. Returns `false` only for
/// the unrecoverable handoff case (§4.2 ordering rule): a reply already
/// went out but the pidfd send that must follow it failed.
fn handle_message(
    conn: BorrowedFd<'_>,
    msg: Message,
    registry: &mut ProcessRegistry,
    cgroup: &CgroupController,
    mode: AgentMode,
) -> Result<bool> {
    match msg {
        Message::Ping => codec::send_message(conn, &Message::Pong)?,
        Message::StartProcess { name, args } => {
            return handle_start_process(conn, &name, &args, registry, mode);
        }
        Message::StopProcess { pid } => {
            codec::send_message(conn, &handle_stop_process(pid, registry, mode))?;
        }
        Message::ListProcesses => {
            codec::send_message(conn, &handle_list_processes(registry, cgroup, mode))?;
        }
        Message::ApplyConstraints {
            pid,
            memory_limit,
            cpu_limit,
        } => {
            codec::send_message(
                conn,
                &handle_apply_constraints(pid, memory_limit, cpu_limit, registry, cgroup, mode),
            )?;
        }
        other => {
            let message = format!("unexpected request type {}", other.type_code());
            codec::send_message(conn, &Message::ProcessError { message })?;
        }
    }
    Ok(true)
}

fn handle_start_process(
    conn: BorrowedFd<'_>,
    name: &str,
    args: &[String],
    registry: &mut ProcessRegistry,
    mode: AgentMode,
) -> Result<bool> {
    let (host_pid, pidfd) = match spawn::spawn(name, args) {
        Ok(v) => v,
        Err(e) => {
            let message = format!("spawn failed: {e}");
            codec::send_message(conn, &Message::ProcessError { message })?;
            return Ok(true);
        }
    };

    match mode {
        AgentMode::Handoff => {
            codec::send_message(
                conn,
                &Message::ProcessStarted {
                    host_pid,
                    container_pid: host_pid,
                },
            )?;
            if let Err(e) = fdpass::send_fd(conn, pidfd.as_fd()) {
                error!(error = %e, pid = host_pid, "failed to hand off pidfd after replying; closing connection");
                return Ok(false);
            }
        }
        AgentMode::Tracked => {
            registry.insert(host_pid, name.to_string());
            let container_pid = nsresolve::resolve_container_pid(host_pid);
            codec::send_message(
                conn,
                &Message::ProcessStarted {
                    host_pid,
                    container_pid,
                },
            )?;
        }
    }
    Ok(true)
}

fn handle_stop_process(pid: i32, registry: &ProcessRegistry, mode: AgentMode) -> Message {
    if mode == AgentMode::Handoff {
        return Message::ProcessError {
            message: "StopProcess is unsupported in handoff mode".to_string(),
        };
    }
    if registry.get(pid).is_none() {
        return Message::ProcessError {
            message: format!("no tracked process with pid {pid}"),
        };
    }
    match holden::pidfd::PidFd::open(pid) {
        Ok(fd) => match fd.send_signal(Signal::SIGTERM) {
            Ok(()) => Message::ProcessStopped { pid },
            Err(e) => Message::ProcessError {
                message: format!("SIGTERM failed for pid {pid}: {e}"),
            },
        },
        Err(e) => Message::ProcessError {
            message: format!("pidfd_open failed for pid {pid}: {e}"),
        },
    }
}

/// Reconcile against `waitpid(WNOHANG)` before reporting: a child can
/// exit in the narrow window between the last signalfd drain and this
/// request (§4.4).
fn handle_list_processes(registry: &mut ProcessRegistry, cgroup: &CgroupController, mode: AgentMode) -> Message {
    if mode == AgentMode::Handoff {
        return Message::ProcessList { entries: Vec::new() };
    }

    let exited: Vec<i32> = registry
        .iter()
        .filter(|r| {
            matches!(
                waitpid(Pid::from_raw(r.host_pid), Some(WaitPidFlag::WNOHANG)),
                Ok(WaitStatus::Exited(..)) | Ok(WaitStatus::Signaled(..))
            )
        })
        .map(|r| r.host_pid)
        .collect();
    for pid in exited {
        if let Some(record) = registry.remove(pid) {
            if record.cgroup_applied {
                cgroup.remove_process_cgroup(pid);
            }
        }
    }

    let mut entries = Vec::new();
    let mut dropped = 0usize;
    for record in registry.iter() {
        if entries.len() == MAX_PROCESS_LIST_ENTRIES {
            dropped += 1;
            continue;
        }
        entries.push(ProcessListEntry {
            host_pid: record.host_pid,
            container_pid: nsresolve::resolve_container_pid(record.host_pid),
            name: record.name.clone(),
        });
    }
    if dropped > 0 {
        warn!(dropped, "ListProcesses reply omitted entries beyond the wire cap");
    }
    Message::ProcessList { entries }
}

fn handle_apply_constraints(
    pid: i32,
    memory_limit: u64,
    cpu_limit: u64,
    registry: &mut ProcessRegistry,
    cgroup: &CgroupController,
    mode: AgentMode,
) -> Message {
    if mode == AgentMode::Handoff {
        return Message::ProcessError {
            message: "ApplyConstraints is unsupported in handoff mode".to_string(),
        };
    }
    if registry.get(pid).is_none() {
        return Message::ProcessError {
            message: format!("no tracked process with pid {pid}"),
        };
    }
    if let Err(e) = cgroup.create_process_cgroup(pid) {
        return Message::ProcessError {
            message: format!("create_process_cgroup failed: {e}"),
        };
    }
    if memory_limit > 0 {
        if let Err(e) = cgroup.apply_memory_limit(pid, memory_limit) {
            return Message::ProcessError {
                message: format!("apply_memory_limit failed: {e}"),
            };
        }
    }
    if cpu_limit > 0 {
        if let Err(e) = cgroup.apply_cpu_limit(pid, cpu_limit) {
            return Message::ProcessError {
                message: format!("apply_cpu_limit failed: {e}"),
            };
        }
    }
    registry.mark_cgroup_applied(pid);
    Message::ConstraintsApplied { pid }
}
