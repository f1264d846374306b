use std::path::PathBuf;

use nix::unistd::{Gid, Pid, Uid};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MappingError {
    #[error("failed to write identity mapping to {file}")]
    Write {
        file: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Writes the single-entry uid/gid mapping for a freshly spawned user
/// namespace, from outside that namespace.
///
/// The base path is injectable so the mapping logic can be unit tested
/// against a fake proc directory.
#[derive(Debug, Clone)]
pub struct IdMapper {
    proc_dir: PathBuf,
}

impl Default for IdMapper {
    fn default() -> Self {
        Self {
            proc_dir: PathBuf::from("/proc"),
        }
    }
}

impl IdMapper {
    pub fn new() -> Self {
        Default::default()
    }

    #[cfg(test)]
    fn new_test(proc_dir: PathBuf) -> Self {
        Self { proc_dir }
    }

    /// Establishes the identity mapping for `pid`: the real uid maps to
    /// itself, further group changes are denied, and the real gid maps to
    /// itself.
    ///
    /// The setgroups denial must precede the gid map write; the kernel
    /// rejects the gid map otherwise. Each file is written in a single write,
    /// since the kernel parses the mapping as soon as anything arrives.
    pub fn map(&self, pid: Pid, uid: Uid, gid: Gid) -> Result<(), MappingError> {
        let proc_pid = self.proc_dir.join(pid.to_string());

        tracing::debug!(%pid, %uid, %gid, "writing identity mapping");
        self.write(proc_pid.join("uid_map"), format!("{} {} 1", uid, uid))?;
        self.write(proc_pid.join("setgroups"), "deny")?;
        self.write(proc_pid.join("gid_map"), format!("{} {} 1", gid, gid))?;
        Ok(())
    }

    fn write(&self, file: PathBuf, contents: impl AsRef<[u8]>) -> Result<(), MappingError> {
        std::fs::write(file.as_path(), contents.as_ref())
            .map_err(|source| MappingError::Write { file, source })
    }

    #[cfg(test)]
    fn proc_pid_dir(&self, pid: Pid) -> PathBuf {
        self.proc_dir.join(pid.to_string())
    }
}
