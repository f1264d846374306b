use std::{
    ffi::{OsStr, OsString},
    path::{Path, PathBuf},
};

use nix::{mount::MsFlags, sys::stat::Mode, unistd::Uid};
use thiserror::Error;

use super::{
    config::SandboxConfig,
    syscall::{MountType, Syscall, SyscallError},
};

#[derive(Debug, Error)]
pub enum OverlayError {
    #[error("failed to enumerate {path}")]
    ReadRoot {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to prepare the overlay directories for {path}")]
    Prepare {
        path: PathBuf,
        #[source]
        source: SyscallError,
    },
    #[error("failed to mount an overlay over {path}")]
    Mount {
        path: PathBuf,
        #[source]
        source: SyscallError,
    },
    #[error("failed to mount tmpfs over {path}")]
    Home {
        path: PathBuf,
        #[source]
        source: SyscallError,
    },
    #[error("environment variable $HOME not set")]
    HomeUnset,
    #[error("failed to create the home directory {path}")]
    HomeCreate {
        path: PathBuf,
        #[source]
        source: SyscallError,
    },
    #[error("failed to mount a fresh proc instance over /proc")]
    Proc(#[source] SyscallError),
}

pub(crate) fn tmpfs_flags() -> MsFlags {
    MsFlags::MS_NOSUID
        | MsFlags::MS_NODEV
        | MsFlags::MS_NOEXEC
        | MsFlags::MS_STRICTATIME
        | MsFlags::MS_REC
}

fn proc_flags() -> MsFlags {
    MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC | MsFlags::MS_NODEV | MsFlags::MS_REC
}

/// Overlays every top-level directory of `root` that is not in the skip-set.
///
/// Each directory gets its own `<scratch>/<name>/upper` and
/// `<scratch>/<name>/work` pair, created before the mount. The mounts are
/// independent of each other and are processed in the filesystem's native
/// enumeration order; the first failure aborts the whole composition and
/// already-established overlays are abandoned in place.
pub fn compose(
    sys: &impl Syscall,
    root: &Path,
    scratch: &Path,
    config: &SandboxConfig,
) -> Result<(), OverlayError> {
    let entries = std::fs::read_dir(root).map_err(|source| OverlayError::ReadRoot {
        path: root.to_path_buf(),
        source,
    })?;

    for entry in entries {
        let entry = entry.map_err(|source| OverlayError::ReadRoot {
            path: root.to_path_buf(),
            source,
        })?;
        let file_type = entry.file_type().map_err(|source| OverlayError::ReadRoot {
            path: entry.path(),
            source,
        })?;
        // Directories only; symlinks to directories stay untouched.
        if !file_type.is_dir() {
            continue;
        }
        let name = entry.file_name();
        if config.is_skip_dir(name.as_os_str()) {
            continue;
        }

        tracing::info!(name = ?name, "overlaying");
        mount_overlay(sys, root, scratch, name.as_os_str())?;
    }

    Ok(())
}

fn mount_overlay(
    sys: &impl Syscall,
    root: &Path,
    scratch: &Path,
    name: &OsStr,
) -> Result<(), OverlayError> {
    let lower = root.join(name);
    let base = scratch.join(name);
    let upper = base.join("upper");
    let work = base.join("work");

    for dir in [&base, &upper, &work] {
        sys.create_dir(dir, Mode::from_bits_truncate(0o755))
            .map_err(|source| OverlayError::Prepare {
                path: dir.clone(),
                source,
            })?;
    }

    let mut data = OsString::from("lowerdir=");
    data.push(lower.as_os_str());
    data.push(",upperdir=");
    data.push(upper.as_os_str());
    data.push(",workdir=");
    data.push(work.as_os_str());

    sys.mount(
        Some(Path::new("overlay")),
        lower.as_path(),
        Some(MountType::Overlay),
        MsFlags::empty(),
        Some(data.as_os_str()),
    )
    .map_err(|source| OverlayError::Mount {
        path: lower.clone(),
        source,
    })
}

/// Replaces the home directory with an empty tmpfs.
///
/// The privileged identity gets `/root` (mode 700), everyone else `/home`
/// (mode 755) plus their `$HOME` re-created inside the now-empty mount.
pub fn provision_home(
    sys: &impl Syscall,
    uid: Uid,
    home: Option<PathBuf>,
) -> Result<(), OverlayError> {
    let (target, mode) = if uid.is_root() {
        ("/root", "mode=700")
    } else {
        ("/home", "mode=755")
    };

    sys.mount(
        Some(Path::new("tmpfs")),
        Path::new(target),
        Some(MountType::TmpFs),
        tmpfs_flags(),
        Some(OsStr::new(mode)),
    )
    .map_err(|source| OverlayError::Home {
        path: PathBuf::from(target),
        source,
    })?;

    if !uid.is_root() {
        let home = home.ok_or(OverlayError::HomeUnset)?;
        sys.create_dir(home.as_path(), Mode::from_bits_truncate(0o755))
            .map_err(|source| OverlayError::HomeCreate { path: home, source })?;
    }

    tracing::info!(%uid, "created empty home");
    Ok(())
}

/// Mounts a fresh proc instance over `/proc`, scoped to the PID namespace of
/// the calling process.
pub fn provision_proc(sys: &impl Syscall) -> Result<(), OverlayError> {
    sys.mount(
        Some(Path::new("proc")),
        Path::new("/proc"),
        Some(MountType::Proc),
        proc_flags(),
        None,
    )
    .map_err(OverlayError::Proc)
}

#[cfg(test)]
mod test {
    use std::{
        ffi::{OsStr, OsString},
        path::{Path, PathBuf},
    };

    use nix::unistd::Uid;
    use pretty_assertions::assert_eq;

    use super::{compose, provision_home, provision_proc, OverlayError};
    use crate::linux::{
        syscall::mock::{Call, RecordingSyscall},
        SandboxConfig,
    };

    fn config(empty_home: bool) -> SandboxConfig {
        let mut config = SandboxConfig::new(vec![OsString::from("/bin/true")]).unwrap();
        config.empty_home = empty_home;
        config
    }

    fn fake_root(dirs: &[&str], files: &[&str]) -> std::io::Result<PathBuf> {
        let root = ovjail_util::io::ScratchDir::new_in(std::env::temp_dir().join("ovjail-overlay"))?
            .into_path();
        for dir in dirs {
            std::fs::create_dir(root.join(dir))?;
        }
        for file in files {
            std::fs::write(root.join(file), b"")?;
        }
        Ok(root)
    }

    fn mounted_targets(sys: &RecordingSyscall) -> Vec<PathBuf> {
        let mut targets: Vec<PathBuf> = sys
            .mounts()
            .into_iter()
            .map(|call| match call {
                Call::Mount { target, .. } => target,
                other => panic!("unexpected call {:?}", other),
            })
            .collect();
        targets.sort();
        targets
    }

    #[test]
    fn skips_the_default_skip_set() -> anyhow::Result<()> {
        let root = fake_root(&["a", "b", "proc", "dev"], &["not-a-dir"])?;
        let scratch = root.join("scratch");
        let sys = RecordingSyscall::default();

        compose(&sys, &root, &scratch, &config(false))?;

        assert_eq!(mounted_targets(&sys), vec![root.join("a"), root.join("b")]);

        std::fs::remove_dir_all(root)?;
        Ok(())
    }

    #[test]
    fn home_is_left_to_the_provisioner_when_emptied() -> anyhow::Result<()> {
        let root = fake_root(&["a", "home"], &[])?;
        let scratch = root.join("scratch");
        let sys = RecordingSyscall::default();

        compose(&sys, &root, &scratch, &config(true))?;
        assert_eq!(mounted_targets(&sys), vec![root.join("a")]);

        let sys = RecordingSyscall::default();
        compose(&sys, &root, &scratch, &config(false))?;
        assert_eq!(
            mounted_targets(&sys),
            vec![root.join("a"), root.join("home")]
        );

        std::fs::remove_dir_all(root)?;
        Ok(())
    }

    #[test]
    fn upper_and_work_exist_before_each_mount() -> anyhow::Result<()> {
        let root = fake_root(&["a", "b"], &[])?;
        let scratch = root.join("scratch");
        let sys = RecordingSyscall::default();

        compose(&sys, &root, &scratch, &config(false))?;

        let calls = sys.calls.borrow();
        for (index, call) in calls.iter().enumerate() {
            if let Call::Mount { target, data, .. } = call {
                let name = target.file_name().unwrap();
                let upper = scratch.join(name).join("upper");
                let work = scratch.join(name).join("work");
                let preceding = &calls[..index];

                for dir in [&upper, &work] {
                    assert!(
                        preceding.iter().any(|call| matches!(
                            call,
                            Call::CreateDir { path, .. } if path == dir
                        )),
                        "{:?} was not created before mounting {:?}",
                        dir,
                        target
                    );
                }

                let mut expected = OsString::from("lowerdir=");
                expected.push(target.as_os_str());
                expected.push(",upperdir=");
                expected.push(upper.as_os_str());
                expected.push(",workdir=");
                expected.push(work.as_os_str());
                assert_eq!(data.as_deref(), Some(expected.as_os_str()));
            }
        }

        std::fs::remove_dir_all(root)?;
        Ok(())
    }

    #[test]
    fn first_mount_failure_aborts_the_composition() -> anyhow::Result<()> {
        let root = fake_root(&["a", "b", "c"], &[])?;
        let scratch = root.join("scratch");
        let sys = RecordingSyscall {
            fail_mount_at: Some(0),
            ..Default::default()
        };

        let result = compose(&sys, &root, &scratch, &config(false));
        assert!(matches!(result, Err(OverlayError::Mount { .. })));
        assert_eq!(sys.mounts().len(), 1);

        std::fs::remove_dir_all(root)?;
        Ok(())
    }

    #[test]
    fn home_provisioning_for_the_privileged_identity() -> anyhow::Result<()> {
        let sys = RecordingSyscall::default();
        provision_home(&sys, Uid::from_raw(0), None)?;

        match &sys.mounts()[..] {
            [Call::Mount { target, data, .. }] => {
                assert_eq!(target, Path::new("/root"));
                assert_eq!(data.as_deref(), Some(OsStr::new("mode=700")));
            }
            other => panic!("unexpected calls {:?}", other),
        }
        Ok(())
    }

    #[test]
    fn home_provisioning_recreates_the_unprivileged_home() -> anyhow::Result<()> {
        let sys = RecordingSyscall::default();
        provision_home(&sys, Uid::from_raw(1000), Some(PathBuf::from("/home/user")))?;

        let calls = sys.calls.borrow();
        assert_eq!(calls.len(), 2);
        assert!(matches!(
            &calls[0],
            Call::Mount { target, .. } if target == Path::new("/home")
        ));
        assert!(matches!(
            &calls[1],
            Call::CreateDir { path, mode } if path == Path::new("/home/user") && *mode == 0o755
        ));
        Ok(())
    }

    #[test]
    fn home_provisioning_requires_home_for_unprivileged_identities() {
        let sys = RecordingSyscall::default();
        let result = provision_home(&sys, Uid::from_raw(1000), None);
        assert!(matches!(result, Err(OverlayError::HomeUnset)));
    }

    #[test]
    fn proc_provisioning_mounts_a_fresh_instance() -> anyhow::Result<()> {
        let sys = RecordingSyscall::default();
        provision_proc(&sys)?;

        match &sys.mounts()[..] {
            [Call::Mount { target, flags, .. }] => {
                assert_eq!(target, Path::new("/proc"));
                assert!(flags.contains(nix::mount::MsFlags::MS_NOSUID));
                assert!(flags.contains(nix::mount::MsFlags::MS_NOEXEC));
                assert!(flags.contains(nix::mount::MsFlags::MS_NODEV));
            }
            other => panic!("unexpected calls {:?}", other),
        }
        Ok(())
    }
}
