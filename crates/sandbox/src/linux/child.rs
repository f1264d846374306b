use std::{
    ffi::{CString, OsString},
    fs::File,
    io::Write,
    os::unix::ffi::OsStrExt,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use nix::{
    sys::wait::{waitpid, WaitStatus},
    unistd::{fork, getuid, ForkResult},
};
use ovjail_util::io::ScratchDir;

use super::{
    barrier::BarrierWait,
    config::SandboxConfig,
    overlay, pulse,
    syscall::{self, MountType, NixSyscall, Syscall},
};

/// Entry point of the namespaced process.
///
/// Runs inside the fresh namespaces but with no identity mapping yet, so the
/// very first action is to block on the barrier. Everything after it executes
/// with the mapped identity.
pub(crate) fn main(
    config: &SandboxConfig,
    barrier: BarrierWait,
    status: File,
    close_fds: &[i32],
) -> isize {
    super::result_to_isize("sandbox setup", imp(config, barrier, status, close_fds))
}

fn imp(
    config: &SandboxConfig,
    barrier: BarrierWait,
    mut status: File,
    close_fds: &[i32],
) -> Result<()> {
    // Close the inherited copies of the parent-owned pipe ends first: holding
    // the barrier's write end would deadlock the wait below against ourselves.
    for fd in close_fds {
        nix::unistd::close(*fd).ok();
    }

    barrier
        .wait()
        .context("while waiting for the identity mapping")?;

    if let Err(error) = prctl::set_name("ovjail-ns") {
        let error = nix::Error::from_i32(error);
        tracing::warn!(?error, "failed to set sandbox process name");
    }

    let sys = NixSyscall;
    syscall::make_root_private(&sys)?;

    let scratch = prepare_scratch(&sys, config)?;
    overlay::compose(&sys, Path::new("/"), &scratch, config)
        .context("while composing the overlay mounts")?;

    if config.empty_home {
        overlay::provision_home(&sys, getuid(), std::env::var_os("HOME").map(PathBuf::from))
            .context("while provisioning an empty home")?;
    }
    if config.empty_proc {
        overlay::provision_proc(&sys).context("while provisioning a fresh /proc")?;
    }
    if config.strict || config.empty_proc {
        pulse::setup_default().context("while setting up the pulseaudio passthrough")?;
    }

    let code = exec_wait(&config.command)?;
    tracing::info!(command = ?config.command[0], code, "target command exited");

    // Best effort; the supervisor may already be gone.
    status.write_all(&code.to_ne_bytes()).ok();
    Ok(())
}

/// Resolves the scratch base the overlay upper/work areas live under: the
/// fixed path from the configuration, or a fresh tmpfs-backed directory under
/// /dev/shm that is never reused across runs.
fn prepare_scratch(sys: &impl Syscall, config: &SandboxConfig) -> Result<PathBuf> {
    match &config.overlay_dir {
        Some(path) => {
            std::fs::create_dir_all(path)
                .with_context(|| format!("while creating the scratch base {:?}", path))?;
            Ok(path.clone())
        }
        None => {
            let dir = ScratchDir::new_in("/dev/shm")
                .context("while allocating a scratch directory under /dev/shm")?;
            sys.mount(
                Some(Path::new("tmpfs")),
                dir.as_path(),
                Some(MountType::TmpFs),
                overlay::tmpfs_flags(),
                None,
            )
            .with_context(|| format!("while mounting tmpfs at {:?}", dir.as_path()))?;
            Ok(dir.into_path())
        }
    }
}

/// Forks once more and replaces the grandchild's image with the target
/// command, then waits for it and returns its exit code.
fn exec_wait(command: &[OsString]) -> Result<i32> {
    let argv = command
        .iter()
        .map(|arg| {
            CString::new(arg.as_bytes())
                .with_context(|| format!("argument {:?} contains a NUL byte", arg))
        })
        .collect::<Result<Vec<_>>>()?;

    match unsafe { fork() }.context("while forking the target command")? {
        ForkResult::Child => {
            if let Err(error) = nix::unistd::execvp(&argv[0], &argv) {
                tracing::error!(?error, command = ?command[0], "failed to execute the target command");
            }
            std::process::exit(127);
        }
        ForkResult::Parent { child } => loop {
            match waitpid(child, None).context("while waiting for the target command")? {
                WaitStatus::Exited(_, code) => return Ok(code),
                WaitStatus::Signaled(_, signal, _) => return Ok(128 + signal as i32),
                _ => continue,
            }
        },
    }
}
