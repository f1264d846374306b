use std::{ffi::OsString, path::PathBuf};

use bitflags::bitflags;
use nix::sched::CloneFlags;
use thiserror::Error;

/// Top-level directories that never receive an overlay mount.
///
/// `proc` is always handled specially (a fresh instance is mounted when
/// requested); the others are either ephemeral already or would break the
/// host if shadowed.
pub const SKIP_DIRS: &[&str] = &["proc", "dev", "run", "mnt", "var", "sys"];

/// Skipped by the generic overlay pass only when the home directory is
/// emptied, since it is then provisioned as a fresh tmpfs instead.
pub const HOME_DIR: &str = "home";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no program specified")]
    MissingCommand,
}

bitflags! {
    /// The set of kernel namespaces a sandbox is built with.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Namespaces: u32 {
        const MOUNT = 1;
        const USER = 1 << 1;
        const PID = 1 << 2;
        const IPC = 1 << 3;
    }
}

impl Namespaces {
    pub fn clone_flags(self) -> CloneFlags {
        let mut flags = CloneFlags::empty();
        if self.contains(Namespaces::MOUNT) {
            flags |= CloneFlags::CLONE_NEWNS;
        }
        if self.contains(Namespaces::USER) {
            flags |= CloneFlags::CLONE_NEWUSER;
        }
        if self.contains(Namespaces::PID) {
            flags |= CloneFlags::CLONE_NEWPID;
        }
        if self.contains(Namespaces::IPC) {
            flags |= CloneFlags::CLONE_NEWIPC;
        }
        flags
    }
}

/// Immutable description of one sandbox run, supplied once at startup.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// The target command and its arguments. Never empty.
    pub command: Vec<OsString>,
    /// Mount an empty tmpfs over the home directory.
    pub empty_home: bool,
    /// Mount a fresh proc instance over /proc. Implies PID isolation.
    pub empty_proc: bool,
    /// Add IPC isolation and force PID isolation.
    pub strict: bool,
    /// Fixed scratch base for the overlay upper/work areas. When unset a
    /// fresh tmpfs-backed directory under /dev/shm is used, never reused
    /// across runs.
    pub overlay_dir: Option<PathBuf>,
}

impl SandboxConfig {
    pub fn new(command: Vec<OsString>) -> Result<Self, ConfigError> {
        if command.is_empty() {
            return Err(ConfigError::MissingCommand);
        }
        Ok(Self {
            command,
            empty_home: false,
            empty_proc: false,
            strict: false,
            overlay_dir: None,
        })
    }

    pub fn namespaces(&self) -> Namespaces {
        let mut set = Namespaces::MOUNT | Namespaces::USER;
        if self.empty_proc {
            set |= Namespaces::PID;
        }
        if self.strict {
            set |= Namespaces::PID | Namespaces::IPC;
        }
        set
    }

    /// Directory names excluded from the generic overlay pass for this
    /// configuration.
    pub fn is_skip_dir(&self, name: &std::ffi::OsStr) -> bool {
        if self.empty_home && name == HOME_DIR {
            return true;
        }
        SKIP_DIRS.iter().any(|skip| name == *skip)
    }
}
