//! Advisory manifest lock backed by an exclusively created lock file.
//!
//! Every lock file carries a nonce naming its owner. Removal, whether on
//! release or when breaking an abandoned lock, first renames the file aside
//! and only deletes it if the nonce is the one expected, so a lock taken over
//! in the meantime is put back instead of being deleted.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tracing::{debug, warn};

use crate::error::{StoreError, StoreResult};

/// Delay between lock acquisition attempts.
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(5);

static NEXT_NONCE: AtomicU64 = AtomicU64::new(0);

/// Held manifest lock; the lock file is removed on drop if it is still ours.
#[derive(Debug)]
pub struct ManifestLock {
    path: PathBuf,
    nonce: String,
}

impl ManifestLock {
    /// Tries to take the lock at `path`, waiting up to `timeout`.
    ///
    /// Returns `Ok(None)` when another writer kept the lock for the whole
    /// wait. Lock files older than `stale_after` are assumed to belong to a
    /// crashed writer and are broken.
    pub fn acquire(
        path: &Path,
        timeout: Duration,
        stale_after: Duration,
    ) -> StoreResult<Option<Self>> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|err| StoreError::io(format!("create {}", parent.display()), err))?;
        }
        let nonce = new_nonce();
        let deadline = Instant::now() + timeout;
        loop {
            match OpenOptions::new().write(true).create_new(true).open(path) {
                Ok(mut file) => {
                    let owner = format!("pid={}\nnonce={nonce}\n", std::process::id());
                    if let Err(err) = file.write_all(owner.as_bytes()) {
                        let _ = fs::remove_file(path);
                        return Err(StoreError::io(format!("write lock {}", path.display()), err));
                    }
                    return Ok(Some(Self {
                        path: path.to_path_buf(),
                        nonce,
                    }));
                }
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                    if let Some(observed) = stale_owner(path, stale_after) {
                        if remove_if_owned(path, observed.as_deref(), &nonce) {
                            warn!(lock = %path.display(), "broke stale manifest lock");
                        }
                        continue;
                    }
                    if Instant::now() >= deadline {
                        debug!(lock = %path.display(), "manifest lock wait timed out");
                        return Ok(None);
                    }
                    thread::sleep(LOCK_POLL_INTERVAL);
                }
                Err(err) => {
                    return Err(StoreError::io(
                        format!("create lock {}", path.display()),
                        err,
                    ));
                }
            }
        }
    }
}

impl Drop for ManifestLock {
    fn drop(&mut self) {
        if read_nonce(&self.path).as_deref() != Some(self.nonce.as_str()) {
            debug!(lock = %self.path.display(), "manifest lock was taken over; leaving it");
            return;
        }
        remove_if_owned(&self.path, Some(&self.nonce), &self.nonce);
    }
}

fn new_nonce() -> String {
    let seq = NEXT_NONCE.fetch_add(1, Ordering::Relaxed);
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos())
        .unwrap_or(0);
    format!("{nanos:x}-{:x}-{seq:x}", std::process::id())
}

fn read_nonce(path: &Path) -> Option<String> {
    let contents = fs::read_to_string(path).ok()?;
    contents
        .lines()
        .find_map(|line| line.strip_prefix("nonce="))
        .map(str::to_string)
}

/// Returns the nonce of a lock file that has outlived `stale_after`.
///
/// The outer `Option` is whether the lock is stale; the inner one is its
/// nonce, absent for lock files written without one.
fn stale_owner(path: &Path, stale_after: Duration) -> Option<Option<String>> {
    let modified = fs::metadata(path).ok()?.modified().ok()?;
    let age = SystemTime::now()
        .duration_since(modified)
        .unwrap_or(Duration::ZERO);
    (age >= stale_after).then(|| read_nonce(path))
}

/// Removes the lock at `path` only if it still carries `expected`.
///
/// The file is renamed to `<lock>.stale-<tag>` first, so no other lock file
/// can be deleted by mistake. A moved file with a different owner is linked
/// back into place. Returns whether the expected lock was removed.
fn remove_if_owned(path: &Path, expected: Option<&str>, tag: &str) -> bool {
    let aside = path.with_extension(format!("lock.stale-{tag}"));
    if fs::rename(path, &aside).is_err() {
        // Already gone or already moved by another waiter.
        return false;
    }
    let owned = read_nonce(&aside).as_deref() == expected;
    if !owned {
        if let Err(err) = fs::hard_link(&aside, path) {
            warn!(
                lock = %path.display(),
                error = %err,
                "could not restore a manifest lock moved aside"
            );
        }
    }
    let _ = fs::remove_file(&aside);
    owned
}
