use std::os::fd::{AsRawFd, OwnedFd};

use nix::errno::Errno;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BarrierError {
    #[error("failed to create the synchronization pipe")]
    Create(#[source] nix::Error),
    #[error("failed to read from the synchronization pipe")]
    Read(#[source] nix::Error),
    #[error("unexpected data on the synchronization pipe")]
    ProtocolViolation,
}

/// Creates a one-shot barrier between the privileged process and the
/// namespaced process.
///
/// This is a pure closure signal over a pipe: the privileged side holds the
/// write end and never writes to it; the namespaced side blocks on the read
/// end until the write end is closed. Anything actually written is a
/// protocol violation.
pub fn new() -> Result<(BarrierGuard, BarrierWait), BarrierError> {
    let (read, write) = nix::unistd::pipe().map_err(BarrierError::Create)?;
    Ok((BarrierGuard { fd: Some(write) }, BarrierWait { fd: read }))
}

/// The release side of the barrier.
///
/// Dropping the guard releases the barrier, so the namespaced process can
/// never be left blocked by an error path on the privileged side.
#[derive(Debug)]
pub struct BarrierGuard {
    fd: Option<OwnedFd>,
}

impl BarrierGuard {
    /// Releases the barrier by closing the write end.
    pub fn release(mut self) {
        self.fd.take();
    }

    /// The raw write-end descriptor, for the namespaced process to close its
    /// inherited copy. The child holding this end open would deadlock it
    /// against itself.
    pub fn raw_fd(&self) -> i32 {
        self.fd.as_ref().map(|fd| fd.as_raw_fd()).unwrap_or(-1)
    }

    #[cfg(test)]
    fn into_fd(mut self) -> Option<OwnedFd> {
        self.fd.take()
    }
}

/// The wait side of the barrier, consumed by the namespaced process as its
/// very first action.
#[derive(Debug)]
pub struct BarrierWait {
    fd: OwnedFd,
}

impl BarrierWait {
    /// Blocks until the write end is closed.
    ///
    /// There is deliberately no timeout; the guard on the other side is
    /// responsible for always releasing.
    pub fn wait(self) -> Result<(), BarrierError> {
        let mut buf = [0u8; 1];
        loop {
            match nix::unistd::read(self.fd.as_raw_fd(), &mut buf) {
                Ok(0) => return Ok(()),
                Ok(_) => return Err(BarrierError::ProtocolViolation),
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(BarrierError::Read(e)),
            }
        }
    }
}
