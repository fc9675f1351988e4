//! Orchestrator client (spec §4.5): spawns one child directly and one
//! through the agent, treats both uniformly as pidfds, and restarts
//! whichever one exits.

use std::os::fd::AsFd;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use holden::config;
use holden::message::Message;
use holden::pidfd::PidFd;
use holden::{codec, fdpass, reap, signals, spawn};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::signal::Signal;
use nix::sys::signalfd::SignalFd;
use tracing::{info, warn};

/// §3.1/§4.5 tokenization bound: a command line longer than this is
/// almost certainly a misquoted shell command, not a real invocation.
const MAX_TOKENS: usize = 15;

#[derive(Parser)]
#[command(version, about = "local + agent-forked process monitor", long_about = None)]
struct Cli {
    /// Command to fork and exec directly, e.g. "/bin/sleep 5"
    local_cmd: String,
    /// Command to start via the agent, e.g. "/bin/sleep 5"
    agent_cmd: String,
}

struct Child {
    tokens: Vec<String>,
    pidfd: PidFd,
}

fn tokenize(cmd: &str, label: &str) -> Result<Vec<String>> {
    let tokens: Vec<String> = cmd.split_whitespace().map(str::to_string).collect();
    if tokens.is_empty() {
        bail!("{label} command is empty");
    }
    if tokens.len() > MAX_TOKENS {
        bail!("{label} command has more than {MAX_TOKENS} tokens");
    }
    Ok(tokens)
}

fn spawn_local(tokens: &[String]) -> Result<PidFd> {
    let (pid, pidfd) = spawn::spawn(&tokens[0], &tokens[1..])?;
    info!(pid, "spawned local child");
    Ok(pidfd)
}

fn spawn_via_agent(tokens: &[String], socket_path: &Path) -> Result<PidFd> {
    let stream =
        UnixStream::connect(socket_path).with_context(|| format!("connect {}", socket_path.display()))?;
    let fd = stream.as_fd();

    let request = Message::StartProcess {
        name: tokens[0].clone(),
        args: tokens[1..].to_vec(),
    };
    codec::send_message(fd, &request).context("send StartProcess")?;

    match codec::recv_message(fd).context("recv reply to StartProcess")? {
        Message::ProcessStarted { host_pid, .. } => {
            // the fd transfer must follow ProcessStarted immediately,
            // with no intervening request, per §4.2's ordering rule
            let owned = fdpass::recv_fd(fd).context("recv pidfd")?;
            info!(pid = host_pid, "agent started child");
            Ok(PidFd::from(owned))
        }
        Message::ProcessError { message } => bail!("agent refused StartProcess: {message}"),
        other => bail!("unexpected reply to StartProcess: type {}", other.type_code()),
    }
}

fn main() -> Result<()> {
    config::init_logging();
    let cli = Cli::parse();

    let local_tokens = tokenize(&cli.local_cmd, "local")?;
    let agent_tokens = tokenize(&cli.agent_cmd, "agent")?;
    let socket_path = config::socket_path();

    // SIGCHLD read via signalfd (§9 redesign, applied here too) so the
    // locally-forked child becomes a reapable zombie whose pidfd then
    // reports POLLIN; the agent-forked child is reaped by the agent.
    let sfd = signals::block_and_watch(&[Signal::SIGCHLD]).context("signalfd setup")?;

    let mut local = Child {
        pidfd: spawn_local(&local_tokens).context("initial local spawn")?,
        tokens: local_tokens,
    };
    let mut agent = Child {
        pidfd: spawn_via_agent(&agent_tokens, &socket_path).context("initial agent spawn")?,
        tokens: agent_tokens,
    };

    run(&mut local, &mut agent, sfd, &socket_path)
}

fn run(local: &mut Child, agent: &mut Child, mut sfd: SignalFd, socket_path: &Path) -> Result<()> {
    let mut restarts: u64 = 0;

    loop {
        let mut fds = [
            PollFd::new(local.pidfd.as_fd(), PollFlags::POLLIN),
            PollFd::new(agent.pidfd.as_fd(), PollFlags::POLLIN),
            PollFd::new(sfd.as_fd(), PollFlags::POLLIN),
        ];

        match poll(&mut fds, PollTimeout::NONE) {
            Ok(_) => {}
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e.into()),
        }

        let local_ready = revents_has_pollin(&fds[0]);
        let agent_ready = revents_has_pollin(&fds[1]);
        let signal_ready = revents_has_pollin(&fds[2]);

        if signal_ready {
            drain_local_reaps(&mut sfd)?;
        }

        if local_ready {
            restarts += 1;
            info!(restarts, "local child exited, restarting");
            local.pidfd = spawn_local(&local.tokens)?;
            std::thread::sleep(Duration::from_millis(100));
        }

        if agent_ready {
            restarts += 1;
            info!(restarts, "agent child exited, restarting");
            agent.pidfd = spawn_via_agent(&agent.tokens, socket_path)?;
            std::thread::sleep(Duration::from_millis(100));
        }
    }
}

fn revents_has_pollin(fd: &PollFd<'_>) -> bool {
    fd.revents().unwrap_or(PollFlags::empty()).contains(PollFlags::POLLIN)
}

fn drain_local_reaps(sfd: &mut SignalFd) -> Result<()> {
    loop {
        match sfd.read_signal() {
            Ok(Some(_)) => {}
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "signalfd read failed");
                break;
            }
        }
    }
    reap::drain_exits(|pid, status| info!(pid = pid.as_raw(), status, "reaped locally-forked child"))?;
    Ok(())
}
