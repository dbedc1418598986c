#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::time::{Duration, Instant};

const RETRY_BACKOFF: Duration = Duration::from_millis(25);

/// Advisory cross-process lock over the store's sidecar lock file.
///
/// One lock serializes all mutators of the job database across concurrent
/// tool invocations. Acquisition is bounded: it retries a non-blocking
/// exclusive lock with backoff until the timeout, then fails loudly.
#[derive(Debug)]
pub struct FileLock {
    path: PathBuf,
}

/// Held lock. Released on drop, on every exit path.
pub struct LockGuard {
    _held: imp::Held,
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("LockGuard")
    }
}

#[derive(Debug)]
pub enum LockError {
    Io(std::io::Error),
    Timeout { waited_ms: u64 },
}

impl std::fmt::Display for LockError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(err) => write!(f, "lock io: {err}"),
            Self::Timeout { waited_ms } => {
                write!(f, "lock not acquired after {waited_ms}ms")
            }
        }
    }
}

impl std::error::Error for LockError {}

impl From<std::io::Error> for LockError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl FileLock {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn acquire(&self, timeout: Duration) -> Result<LockGuard, LockError> {
        let started = Instant::now();
        loop {
            if let Some(held) = imp::try_acquire(&self.path)? {
                return Ok(LockGuard { _held: held });
            }
            let waited = started.elapsed();
            if waited >= timeout {
                return Err(LockError::Timeout {
                    waited_ms: waited.as_millis() as u64,
                });
            }
            std::thread::sleep(RETRY_BACKOFF.min(timeout - waited));
        }
    }
}

#[cfg(unix)]
mod imp {
    use nix::fcntl::{Flock, FlockArg};
    use std::fs::{File, OpenOptions};
    use std::path::Path;

    pub(super) struct Held(#[allow(dead_code)] Flock<File>);

    pub(super) fn try_acquire(path: &Path) -> std::io::Result<Option<Held>> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(flock) => Ok(Some(Held(flock))),
            Err((_, errno)) if errno == nix::errno::Errno::EWOULDBLOCK => Ok(None),
            Err((_, errno)) => Err(std::io::Error::from_raw_os_error(errno as i32)),
        }
    }
}

#[cfg(not(unix))]
mod imp {
    use std::fs::OpenOptions;
    use std::path::{Path, PathBuf};

    pub(super) struct Held {
        path: PathBuf,
    }

    impl Drop for Held {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.path);
        }
    }

    pub(super) fn try_acquire(path: &Path) -> std::io::Result<Option<Held>> {
        match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(_) => Ok(Some(Held {
                path: path.to_path_buf(),
            })),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => Ok(None),
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_lock_path(label: &str) -> PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        std::env::temp_dir().join(format!(
            "jt_lock_{label}_{}_{nanos}.lock",
            std::process::id()
        ))
    }

    #[test]
    fn second_holder_times_out_then_succeeds_after_release() {
        let path = temp_lock_path("contention");
        let first = FileLock::new(&path);
        let second = FileLock::new(&path);

        let guard = first.acquire(Duration::from_millis(200)).expect("acquire");
        let err = second
            .acquire(Duration::from_millis(80))
            .expect_err("held lock must not be re-acquired");
        assert!(matches!(err, LockError::Timeout { .. }));

        drop(guard);
        let reacquired = second.acquire(Duration::from_millis(200));
        assert!(reacquired.is_ok());
    }
}
