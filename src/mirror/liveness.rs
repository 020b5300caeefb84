//! Checks that keep the engine from compressing a file the game server is
//! still writing.

use std::fs;
use std::io;
use std::path::Path;
use std::thread;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Ready,
    /// Another process holds the file exclusively (or it cannot be opened)
    Locked,
    Growing { before: u64, after: u64 },
}

impl Liveness {
    pub fn is_ready(&self) -> bool {
        matches!(self, Liveness::Ready)
    }
}

/// Lock check first, then the size sample. Blocks for `sample`.
pub fn check(path: &Path, sample: Duration) -> Liveness {
    if is_locked(path) {
        debug!("File in use: {}", path.display());
        return Liveness::Locked;
    }

    match size_change(path, sample) {
        Some((before, after)) => {
            debug!("File is growing: {} ({} -> {} bytes)", path.display(), before, after);
            Liveness::Growing { before, after }
        }
        None => Liveness::Ready,
    }
}

/// Sizes before and after the sampling window when they differ. A file
/// whose metadata cannot be read counts as changing.
fn size_change(path: &Path, sample: Duration) -> Option<(u64, u64)> {
    let before = match fs::metadata(path) {
        Ok(meta) => meta.len(),
        Err(_) => return Some((0, 0)),
    };
    if !sample.is_zero() {
        thread::sleep(sample);
    }
    let after = match fs::metadata(path) {
        Ok(meta) => meta.len(),
        Err(_) => return Some((before, 0)),
    };

    (before != after).then_some((before, after))
}

/// Try for an exclusive advisory lock without blocking. A writer holding
/// one means the file is busy.
#[cfg(unix)]
pub fn is_locked(path: &Path) -> bool {
    let file = match fs::File::open(path) {
        Ok(file) => file,
        Err(e) => {
            debug!("Cannot open {}: {}", path.display(), e);
            return true;
        }
    };

    let mut lock = fd_lock::RwLock::new(file);
    let busy = match lock.try_write() {
        Ok(_guard) => false,
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => true,
        Err(e) => {
            // ENOLCK and friends on network mounts: no lock support, not busy
            debug!("Advisory locks unsupported for {}: {}", path.display(), e);
            false
        }
    };
    busy
}

#[cfg(windows)]
pub fn is_locked(path: &Path) -> bool {
    use std::os::windows::fs::OpenOptionsExt;

    match fs::OpenOptions::new().read(true).share_mode(0).open(path) {
        Ok(_) => false,
        Err(e) => {
            debug!("Cannot open {} exclusively: {}", path.display(), e);
            true
        }
    }
}

#[cfg(not(any(unix, windows)))]
pub fn is_locked(_path: &Path) -> bool {
    false
}
