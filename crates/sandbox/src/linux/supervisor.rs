use std::{fs::File, io::Read, os::fd::{AsRawFd, OwnedFd}};

use anyhow::{bail, Context, Result};
use nix::{
    fcntl::OFlag,
    sched::clone,
    sys::wait::{waitpid, WaitStatus},
    unistd::{getgid, getuid, Pid},
};

use super::{barrier, child, config::{Namespaces, SandboxConfig}, ids::IdMapper};

const STACK_SIZE: usize = 1024 * 1024;

/// What the supervisor observed of a completed sandbox run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Outcome {
    /// Exit code of the target command, captured but deliberately not
    /// propagated into the process exit status. `None` when the namespaced
    /// process died before the target ran.
    pub target_status: Option<i32>,
}

/// Builds the sandbox and runs the configured command inside it.
///
/// Spawns the namespaced process, writes its identity mapping from out here
/// (it cannot write its own), releases the barrier, and waits for the whole
/// thing to finish. Ordering is the contract: the mapping write strictly
/// precedes the barrier release, and the barrier guard releases on every
/// exit path so the namespaced process can never be left blocked.
pub fn run(config: &SandboxConfig) -> Result<Outcome> {
    let namespaces = config.namespaces();
    if namespaces.contains(Namespaces::PID) {
        tracing::warn!(
            "PID isolation enabled: software relying on a shared pid namespace (pulseaudio, ...) may not work"
        );
    }

    // Captured before the spawn; the mapping establishes these exact ids
    // inside the new user namespace.
    let uid = getuid();
    let gid = getgid();

    let (guard, wait) = barrier::new().context("while creating the synchronization barrier")?;
    let (status_read, status_write) = status_pipe().context("while creating the status pipe")?;

    let close_fds = [guard.raw_fd(), status_read.as_raw_fd()];
    let mut state = Some((wait, File::from(status_write)));
    let cloned_config = config.clone();
    let cb = Box::new(move || match state.take() {
        Some((wait, status)) => child::main(&cloned_config, wait, status, &close_fds),
        None => -1,
    });

    tracing::debug!(?namespaces, "cloning the namespaced process");
    let mut stack = [0u8; STACK_SIZE];
    let pid = unsafe {
        clone(
            cb,
            &mut stack,
            namespaces.clone_flags(),
            Some(nix::libc::SIGCHLD),
        )
    }
    .context("while cloning the namespaced process")?;

    // The guard releases on the error path here too, unblocking the child so
    // it fails its first privileged operation instead of hanging forever.
    IdMapper::new()
        .map(pid, uid, gid)
        .context("while writing the identity mapping")?;
    guard.release();

    let target_status = read_status(File::from(status_read));
    await_child(pid)?;
    Ok(Outcome { target_status })
}

/// Creates the pipe the target's exit code is reported over. Both ends are
/// close-on-exec: the write end is inherited through fork by the target
/// command, which must not be able to forge the reported status.
fn status_pipe() -> nix::Result<(OwnedFd, OwnedFd)> {
    nix::unistd::pipe2(OFlag::O_CLOEXEC)
}

/// Reads the target's exit code off the status pipe. EOF means the
/// namespaced process died before it could report one.
fn read_status(mut status: File) -> Option<i32> {
    let mut buf = [0u8; 4];
    match status.read_exact(&mut buf) {
        Ok(()) => Some(i32::from_ne_bytes(buf)),
        Err(error) => {
            tracing::debug!(?error, "no target status reported by the namespaced process");
            None
        }
    }
}

fn await_child(pid: Pid) -> Result<()> {
    loop {
        match waitpid(pid, None).context("while waiting for the namespaced process")? {
            WaitStatus::Exited(_, 0) => return Ok(()),
            WaitStatus::Exited(_, code) => {
                bail!("the namespaced process exited with status {}", code)
            }
            WaitStatus::Signaled(_, signal, _) => {
                bail!("the namespaced process was killed by {}", signal)
            }
            _ => continue,
        }
    }
}
