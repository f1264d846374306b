use std::{
    path::{Path, PathBuf},
    sync::atomic::AtomicUsize,
};

use rand::seq::SliceRandom;

const CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
static COUNTER: AtomicUsize = AtomicUsize::new(0);

/// A uniquely named directory created under a parent directory.
///
/// Unlike a temporary directory, a `ScratchDir` is never removed. Overlay
/// upper/work areas and emptied mounts live in it, and its lifetime is left
/// to the operator (or to the mount namespace being torn down).
pub struct ScratchDir {
    path: PathBuf,
}

impl ScratchDir {
    pub fn new_in(parent: impl AsRef<Path>) -> std::io::Result<ScratchDir> {
        const MAX_RETRIES: u32 = 1024;
        let parent = parent.as_ref();
        std::fs::create_dir_all(parent)?;

        let mut rng = rand::thread_rng();
        for _ in 0..MAX_RETRIES {
            let date = std::time::SystemTime::now();
            let duration = date
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs();
            let suffix = CHARS
                .choose_multiple(&mut rng, 8)
                .map(|v| *v as char)
                .collect::<String>();
            let name = format!(
                "ovjail-{:x}-{:x}-{}",
                COUNTER.fetch_add(1, std::sync::atomic::Ordering::SeqCst),
                duration,
                suffix
            );
            let path = parent.join(name);
            match std::fs::create_dir(path.as_path()) {
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    continue;
                }
                Err(e) => return Err(e),
                Ok(_) => return Ok(ScratchDir { path }),
            }
        }

        Err(std::io::ErrorKind::AlreadyExists.into())
    }

    pub fn as_path(&self) -> &Path {
        self.path.as_path()
    }

    pub fn into_path(self) -> PathBuf {
        self.path
    }
}

impl std::fmt::Debug for ScratchDir {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.path.fmt(f)
    }
}
