use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use fs2::FileExt;
use tracing::warn;

use crate::error::LockError;
use crate::util::sha256_hex;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Options for a single lock acquisition. Exclusive and blocking by default.
#[derive(Debug, Clone, Copy, Default)]
pub struct LockOptions {
    pub shared: bool,
    pub timeout: Option<Duration>,
}

/// Named advisory locks backed by on-disk lock files.
///
/// A lock name maps to a single file under the locks directory via a stable
/// hash. Within one process the locks are re-entrant: the OS-level file lock
/// is taken on the first acquisition and released when the hold count drops
/// to zero. Held OS locks are released on process exit by file-lock
/// semantics, normal or aborted.
#[derive(Debug)]
pub struct LockManager {
    locks_dir: PathBuf,
    held: Mutex<HashMap<String, Held>>,
}

#[derive(Debug)]
struct Held {
    file: File,
    count: u32,
}

impl LockManager {
    pub fn new(locks_dir: PathBuf) -> Self {
        Self {
            locks_dir,
            held: Mutex::new(HashMap::new()),
        }
    }

    fn lock_file_path(&self, name: &str) -> PathBuf {
        self.locks_dir.join(format!("{}.lock", sha256_hex(&[name])))
    }

    /// Acquire the named lock. Re-entrant for a name already held by this
    /// process; otherwise blocks (or times out) on the on-disk lock.
    pub async fn lock(
        self: &Arc<Self>,
        name: &str,
        opts: LockOptions,
    ) -> Result<LockGuard, LockError> {
        {
            let mut held = self.held.lock().expect("lock table poisoned");
            if let Some(entry) = held.get_mut(name) {
                entry.count += 1;
                return Ok(LockGuard {
                    manager: Arc::clone(self),
                    name: name.to_string(),
                });
            }
        }

        let path = self.lock_file_path(name);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|source| LockError::Acquire {
                name: name.to_string(),
                source,
            })?;

        let started = Instant::now();
        loop {
            let attempt = if opts.shared {
                FileExt::try_lock_shared(&file)
            } else {
                FileExt::try_lock_exclusive(&file)
            };
            match attempt {
                Ok(()) => break,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    if let Some(timeout) = opts.timeout {
                        if started.elapsed() >= timeout {
                            return Err(LockError::Timeout {
                                name: name.to_string(),
                                seconds: timeout.as_secs(),
                            });
                        }
                    }
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
                Err(source) => {
                    return Err(LockError::Acquire {
                        name: name.to_string(),
                        source,
                    })
                }
            }
        }

        let mut held = self.held.lock().expect("lock table poisoned");
        held.insert(name.to_string(), Held { file, count: 1 });
        Ok(LockGuard {
            manager: Arc::clone(self),
            name: name.to_string(),
        })
    }

    /// Decrement the hold count; release the OS lock when it reaches zero.
    pub fn unlock(&self, name: &str) -> Result<(), LockError> {
        let mut held = self.held.lock().expect("lock table poisoned");
        let entry = held.get_mut(name).ok_or_else(|| LockError::NotHeld {
            name: name.to_string(),
        })?;
        entry.count -= 1;
        if entry.count == 0 {
            let entry = held.remove(name).expect("entry checked above");
            if let Err(e) = fs2::FileExt::unlock(&entry.file) {
                warn!(lock = %name, error = %e, "failed to release file lock");
            }
        }
        Ok(())
    }

    #[cfg(test)]
    fn hold_count(&self, name: &str) -> u32 {
        self.held
            .lock()
            .expect("lock table poisoned")
            .get(name)
            .map(|h| h.count)
            .unwrap_or(0)
    }
}

/// Scoped hold on a named lock; releases on drop.
#[derive(Debug)]
pub struct LockGuard {
    manager: Arc<LockManager>,
    name: String,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = self.manager.unlock(&self.name) {
            warn!(lock = %self.name, error = %e, "unlock on drop failed");
        }
    }
}

/// Lock name for mutating work on one image layer. Keyed by a hash of the
/// full image ref so concurrent builds of different layers never contend.
pub fn image_lock_name(image_ref: &str) -> String {
    format!("image.{}", sha256_hex(&[image_ref]))
}
