use std::{
    ffi::{OsStr, OsString},
    ops::Deref,
    path::Path,
};

use nix::{mount::MsFlags, sys::stat::Mode};
use once_cell::sync::Lazy;
use procfs::process::{MountOptFields, Process};
use thiserror::Error;

macro_rules! make_os_str {
    ($val: expr) => {
        Lazy::new(move || {
            static VAL: &'static str = $val;
            let val = Box::new(OsString::from(VAL));
            let val = Box::leak(val);
            let os: &'static OsStr = val.as_os_str();
            os
        })
    };
}

static OVERLAY: Lazy<&'static OsStr> = make_os_str!("overlay");
static TMPFS: Lazy<&'static OsStr> = make_os_str!("tmpfs");
static PROC: Lazy<&'static OsStr> = make_os_str!("proc");

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountType {
    Overlay,
    TmpFs,
    Proc,
}

impl AsRef<OsStr> for MountType {
    fn as_ref(&self) -> &OsStr {
        match self {
            MountType::Overlay => OVERLAY.deref(),
            MountType::TmpFs => TMPFS.deref(),
            MountType::Proc => PROC.deref(),
        }
    }
}

#[derive(Debug, Error)]
pub enum SyscallError {
    #[error("an OS error occurred: {0}")]
    Os(#[from] nix::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SyscallError>;

/// The mutating system calls the sandbox setup performs, as a seam so the
/// composition logic can be exercised against a recording mock.
pub trait Syscall {
    fn mount(
        &self,
        source: Option<&Path>,
        target: &Path,
        fstype: Option<MountType>,
        flags: MsFlags,
        data: Option<&OsStr>,
    ) -> Result<()>;

    fn create_dir(&self, path: &Path, mode: Mode) -> Result<()>;
}

#[derive(Debug, Clone, Copy)]
pub struct NixSyscall;

impl Syscall for NixSyscall {
    #[tracing::instrument(level = "trace", skip(self))]
    fn mount(
        &self,
        source: Option<&Path>,
        target: &Path,
        fstype: Option<MountType>,
        flags: MsFlags,
        data: Option<&OsStr>,
    ) -> Result<()> {
        let fstype = fstype.as_ref().map(AsRef::<OsStr>::as_ref);
        nix::mount::mount(source, target, fstype, flags, data)?;
        Ok(())
    }

    #[tracing::instrument(level = "trace", skip(self))]
    fn create_dir(&self, path: &Path, mode: Mode) -> Result<()> {
        nix::unistd::mkdir(path, mode)?;
        Ok(())
    }
}

/// Remounts `/` as a recursive private mount when the host made it shared.
///
/// Without this, overlay mounts created inside the new mount namespace could
/// propagate back to the host through a shared peer group.
pub fn make_root_private(sys: &impl Syscall) -> anyhow::Result<()> {
    use anyhow::Context;

    let myself = Process::myself().context("while reading the current process's mount table")?;
    let mountinfo = myself
        .mountinfo()
        .context("while listing the current process's mounts")?;

    let root_is_shared = mountinfo
        .into_iter()
        .filter(|mi| mi.mount_point == Path::new("/"))
        .any(|mi| {
            mi.opt_fields
                .iter()
                .any(|field| matches!(field, MountOptFields::Shared(_)))
        });

    if root_is_shared {
        sys.mount(
            None,
            Path::new("/"),
            None,
            MsFlags::MS_PRIVATE | MsFlags::MS_REC,
            None,
        )
        .context("while making / a private mount")?;
    }

    Ok(())
}
