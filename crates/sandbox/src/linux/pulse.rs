use std::{
    io::Write,
    path::{Path, PathBuf},
};

use thiserror::Error;

/// The system-wide PulseAudio client configuration.
const SYSTEM_CONF: &str = "/etc/pulse/client.conf";

/// The directive appended to the local copy. Shared-memory transport cannot
/// cross the IPC/PID isolation boundary, so the client must be told not to
/// use it.
const DISABLE_SHM: &str = "\nenable-shm = no\n";

#[derive(Debug, Error)]
pub enum PulseError {
    #[error("environment variable $HOME not set")]
    HomeUnset,
    #[error("failed to write the local pulse configuration at {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PulseSetup {
    /// PulseAudio is not installed; nothing to do.
    SkippedNoSystemConf,
    /// The local configuration was created and the shm directive appended.
    Created,
    /// A local configuration already existed; it was left untouched, so a
    /// stale copy never gains the shm directive.
    AlreadyPresent,
}

/// Copies the system PulseAudio client configuration into the sandboxed home
/// and disables shared-memory transport, so audio keeps working across the
/// isolation boundary.
pub fn setup_default() -> Result<PulseSetup, PulseError> {
    let home = std::env::var_os("HOME").ok_or(PulseError::HomeUnset)?;
    setup(Path::new(SYSTEM_CONF), Path::new(&home))
}

pub fn setup(system_conf: &Path, home: &Path) -> Result<PulseSetup, PulseError> {
    if !system_conf.exists() {
        tracing::warn!("pulseaudio not installed, skipping config creation");
        return Ok(PulseSetup::SkippedNoSystemConf);
    }

    let pulse_dir = home.join(".config").join("pulse");
    create_dir_0700(&home.join(".config"))?;
    create_dir_0700(&pulse_dir)?;

    let local_conf = pulse_dir.join("client.conf");
    if local_conf.exists() {
        tracing::info!(path = ?local_conf, "local pulse configuration already present");
        return Ok(PulseSetup::AlreadyPresent);
    }

    std::fs::copy(system_conf, &local_conf).map_err(|source| PulseError::Io {
        path: local_conf.clone(),
        source,
    })?;

    let mut file = std::fs::OpenOptions::new()
        .append(true)
        .open(&local_conf)
        .map_err(|source| PulseError::Io {
            path: local_conf.clone(),
            source,
        })?;
    file.write_all(DISABLE_SHM.as_bytes())
        .map_err(|source| PulseError::Io {
            path: local_conf.clone(),
            source,
        })?;

    tracing::info!(path = ?local_conf, "local pulse configuration created");
    Ok(PulseSetup::Created)
}

fn create_dir_0700(path: &Path) -> Result<(), PulseError> {
    use std::os::unix::fs::DirBuilderExt;

    match std::fs::DirBuilder::new().mode(0o700).create(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
        Err(source) => Err(PulseError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::{setup, PulseSetup, DISABLE_SHM};

    struct Fixture {
        root: std::path::PathBuf,
    }

    impl Fixture {
        fn new(name: &str, with_system_conf: bool) -> std::io::Result<Self> {
            let root = std::env::temp_dir().join(format!("ovjail-pulse-{}", name));
            let _ = std::fs::remove_dir_all(&root);
            std::fs::create_dir_all(root.join("home"))?;
            if with_system_conf {
                std::fs::write(root.join("client.conf"), "autospawn = yes\n")?;
            }
            Ok(Self { root })
        }

        fn system_conf(&self) -> std::path::PathBuf {
            self.root.join("client.conf")
        }

        fn home(&self) -> std::path::PathBuf {
            self.root.join("home")
        }

        fn local_conf(&self) -> std::path::PathBuf {
            self.home().join(".config").join("pulse").join("client.conf")
        }
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            std::fs::remove_dir_all(&self.root).ok();
        }
    }

    #[test]
    fn skips_when_pulse_is_not_installed() -> anyhow::Result<()> {
        let fixture = Fixture::new("absent", false)?;
        let outcome = setup(&fixture.system_conf(), &fixture.home())?;

        assert_eq!(outcome, PulseSetup::SkippedNoSystemConf);
        assert!(!fixture.home().join(".config").exists());
        Ok(())
    }

    #[test]
    fn copies_and_appends_on_first_creation() -> anyhow::Result<()> {
        let fixture = Fixture::new("create", true)?;
        let outcome = setup(&fixture.system_conf(), &fixture.home())?;

        assert_eq!(outcome, PulseSetup::Created);
        let contents = std::fs::read_to_string(fixture.local_conf())?;
        assert_eq!(contents, format!("autospawn = yes\n{}", DISABLE_SHM));
        Ok(())
    }

    #[test]
    fn second_invocation_leaves_the_file_alone() -> anyhow::Result<()> {
        let fixture = Fixture::new("repeat", true)?;
        setup(&fixture.system_conf(), &fixture.home())?;
        let first = std::fs::read_to_string(fixture.local_conf())?;

        let outcome = setup(&fixture.system_conf(), &fixture.home())?;
        assert_eq!(outcome, PulseSetup::AlreadyPresent);
        assert_eq!(std::fs::read_to_string(fixture.local_conf())?, first);
        Ok(())
    }

    #[test]
    fn stale_local_file_never_gains_the_directive() -> anyhow::Result<()> {
        // Current behavior, preserved on purpose: the directive is appended
        // only when the copy happens in the same invocation.
        let fixture = Fixture::new("stale", true)?;
        std::fs::create_dir_all(fixture.local_conf().parent().unwrap())?;
        std::fs::write(fixture.local_conf(), "daemon-binary = /usr/bin/pulseaudio\n")?;

        let outcome = setup(&fixture.system_conf(), &fixture.home())?;
        assert_eq!(outcome, PulseSetup::AlreadyPresent);

        let contents = std::fs::read_to_string(fixture.local_conf())?;
        assert!(!contents.contains("enable-shm"));
        Ok(())
    }
}
