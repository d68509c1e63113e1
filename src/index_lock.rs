//! Advisory lock over the index and serial file pair.
//!
//! The lock is a marker file next to the index (`index.txt.lock`) holding the acquisition time
//! as milliseconds since the epoch. Its existence alone means "locked". The marker is created
//! with `O_CREAT | O_EXCL`, so two issuers racing for it cannot both win.
//!
//! A marker left behind by a crashed process blocks issuance until it is removed by hand,
//! unless a lease is configured: markers older than the lease are then treated as abandoned.
//! Taking over an abandoned marker goes through a second exclusive marker
//! (`index.txt.lock.takeover`), so only one contender can remove it, and only while it still
//! carries the stale timestamp.

use chrono::{DateTime, TimeZone, Utc};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::error::{PkiError, Result};

const LOCK_SUFFIX: &str = ".lock";
const TAKEOVER_SUFFIX: &str = ".lock.takeover";
const MAX_ATTEMPTS: u32 = 2;

#[derive(Debug, Clone)]
pub struct IndexLock {
    path: PathBuf,
    takeover_path: PathBuf,
    lease: Option<Duration>,
}

impl IndexLock {
    /// Lock guarding the given index file.
    pub fn for_index(index_path: &Path) -> Self {
        let with_suffix = |suffix: &str| {
            let mut path = index_path.as_os_str().to_owned();
            path.push(suffix);
            PathBuf::from(path)
        };
        Self {
            path: with_suffix(LOCK_SUFFIX),
            takeover_path: with_suffix(TAKEOVER_SUFFIX),
            lease: None,
        }
    }

    pub fn with_lease(mut self, lease: Option<Duration>) -> Self {
        self.lease = lease;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Take the lock.
    ///
    /// # Errors
    /// * `PkiError::Locked` - the marker exists; carries the time it was written
    /// * `PkiError::Io` - the marker could not be created or read
    pub async fn acquire(&self) -> Result<IndexLockGuard> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.try_create().await {
                Ok(guard) => return Ok(guard),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
                Err(e) => {
                    return Err(PkiError::io(
                        format!("Failed to create lock {}", self.path.display()),
                        e,
                    ))
                }
            }

            let acquired_at = match self.holder().await? {
                Some(acquired_at) => acquired_at,
                // released between our create and read
                None if attempt < MAX_ATTEMPTS => continue,
                None => Utc::now(),
            };

            if attempt < MAX_ATTEMPTS && self.lease_expired(acquired_at) {
                self.take_over(acquired_at).await?;
                continue;
            }

            return Err(PkiError::Locked { acquired_at });
        }
    }

    /// Acquisition time of the current marker, `None` when the index is free.
    pub async fn holder(&self) -> Result<Option<DateTime<Utc>>> {
        let data = match fs::read_to_string(&self.path).await {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(PkiError::io(
                    format!("Failed to read lock {}", self.path.display()),
                    e,
                ))
            }
        };

        if let Some(stamp) = data
            .trim()
            .parse::<i64>()
            .ok()
            .and_then(|millis| Utc.timestamp_millis_opt(millis).single())
        {
            return Ok(Some(stamp));
        }

        // Unreadable content, fall back to the file's mtime
        match fs::metadata(&self.path).await {
            Ok(meta) => Ok(Some(
                meta.modified()
                    .map(DateTime::<Utc>::from)
                    .unwrap_or_else(|_| Utc::now()),
            )),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(PkiError::io(
                format!("Failed to stat lock {}", self.path.display()),
                e,
            )),
        }
    }

    /// Delete the marker regardless of who created it. Also clears a takeover marker left by a
    /// process that died mid-takeover.
    pub async fn release(&self) -> Result<()> {
        remove_marker(&self.path).await?;
        match fs::remove_file(&self.takeover_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(PkiError::io(
                format!("Failed to remove {}", self.takeover_path.display()),
                e,
            )),
        }
    }

    /// Remove the marker if it still carries the `stale` timestamp.
    ///
    /// Returns without doing anything when another contender is already taking over; the
    /// caller then retries and reports `Locked` if that contender won.
    async fn take_over(&self, stale: DateTime<Utc>) -> Result<()> {
        let takeover = match create_marker(&self.takeover_path).await {
            Ok(guard) => guard,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => return Ok(()),
            Err(e) => {
                return Err(PkiError::io(
                    format!("Failed to create {}", self.takeover_path.display()),
                    e,
                ))
            }
        };

        let removed = match self.holder().await {
            Ok(Some(current)) if current == stale => {
                warn!(
                    lock = %self.path.display(),
                    acquired_at = %stale.to_rfc3339(),
                    "removing abandoned index lock"
                );
                remove_marker(&self.path).await
            }
            // replaced by a fresh lock or already gone
            Ok(_) => Ok(()),
            Err(e) => Err(e),
        };
        takeover.release().await?;
        removed
    }

    fn lease_expired(&self, acquired_at: DateTime<Utc>) -> bool {
        match self.lease {
            Some(lease) => (Utc::now() - acquired_at)
                .to_std()
                .map(|age| age > lease)
                .unwrap_or(false),
            None => false,
        }
    }

    async fn try_create(&self) -> std::io::Result<IndexLockGuard> {
        create_marker(&self.path).await
    }
}

/// Exclusively create a marker holding the current time in milliseconds.
async fn create_marker(path: &Path) -> std::io::Result<IndexLockGuard> {
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await?;

    let acquired_at = Utc::now();
    let guard = IndexLockGuard {
        path: path.to_path_buf(),
        acquired_at,
        released: false,
    };
    // On failure the guard is dropped and takes the half-written marker with it
    file.write_all(format!("{}\n", acquired_at.timestamp_millis()).as_bytes())
        .await?;
    file.sync_all().await?;

    debug!(lock = %path.display(), "created lock marker");
    Ok(guard)
}

/// Proof of holding the index lock.
///
/// Call [`IndexLockGuard::release`] on every path. If the guard is dropped without it (panic,
/// cancelled future) the marker is removed synchronously in `Drop`.
#[derive(Debug)]
pub struct IndexLockGuard {
    path: PathBuf,
    acquired_at: DateTime<Utc>,
    released: bool,
}

impl IndexLockGuard {
    pub fn acquired_at(&self) -> DateTime<Utc> {
        self.acquired_at
    }

    pub async fn release(mut self) -> Result<()> {
        self.released = true;
        remove_marker(&self.path).await?;
        debug!(lock = %self.path.display(), "released index lock");
        Ok(())
    }
}

impl Drop for IndexLockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => warn!(lock = %self.path.display(), "index lock released on drop"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!(lock = %self.path.display(), error = %e, "failed to remove index lock"),
        }
    }
}

async fn remove_marker(path: &Path) -> Result<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => {
            warn!(lock = %path.display(), "index lock was already removed");
            Ok(())
        }
        Err(e) => Err(PkiError::io(
            format!("Failed to remove lock {}", path.display()),
            e,
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lock_in(dir: &tempfile::TempDir) -> IndexLock {
        IndexLock::for_index(&dir.path().join("index.txt"))
    }

    #[test]
    fn test_lock_path_is_next_to_index() {
        let lock = IndexLock::for_index(Path::new("/srv/pki/index.txt"));
        assert_eq!(lock.path(), Path::new("/srv/pki/index.txt.lock"));
    }

    #[tokio::test]
    async fn test_acquire_writes_millis_and_release_removes() {
        let dir = tempfile::TempDir::new().unwrap();
        let lock = lock_in(&dir);

        let guard = lock.acquire().await.unwrap();
        let contents = std::fs::read_to_string(lock.path()).unwrap();
        assert_eq!(contents, format!("{}\n", guard.acquired_at().timestamp_millis()));
        assert_eq!(
            lock.holder().await.unwrap().map(|t| t.timestamp_millis()),
            Some(guard.acquired_at().timestamp_millis())
        );

        guard.release().await.unwrap();
        assert!(!lock.path().exists());
        assert_eq!(lock.holder().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_second_acquire_reports_original_timestamp() {
        let dir = tempfile::TempDir::new().unwrap();
        let lock = lock_in(&dir);
        std::fs::write(lock.path(), "1700000000000\n").unwrap();

        match lock.acquire().await {
            Err(PkiError::Locked { acquired_at }) => {
                assert_eq!(acquired_at.timestamp_millis(), 1_700_000_000_000);
            }
            other => panic!("expected Locked, got {:?}", other),
        }
        // a failed acquire never touches the existing marker
        assert_eq!(
            std::fs::read_to_string(lock.path()).unwrap(),
            "1700000000000\n"
        );
    }

    #[tokio::test]
    async fn test_concurrent_acquire_has_single_winner() {
        let dir = tempfile::TempDir::new().unwrap();
        let lock = lock_in(&dir);

        let (a, b) = tokio::join!(lock.acquire(), lock.acquire());
        let winners = [a.is_ok(), b.is_ok()].iter().filter(|ok| **ok).count();
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_drop_removes_marker() {
        let dir = tempfile::TempDir::new().unwrap();
        let lock = lock_in(&dir);
        {
            let _guard = lock.acquire().await.unwrap();
            assert!(lock.path().exists());
        }
        assert!(!lock.path().exists());
    }

    #[tokio::test]
    async fn test_stale_marker_without_lease_blocks() {
        let dir = tempfile::TempDir::new().unwrap();
        let lock = lock_in(&dir);
        std::fs::write(lock.path(), "1000\n").unwrap();

        assert!(matches!(lock.acquire().await, Err(PkiError::Locked { .. })));
    }

    #[tokio::test]
    async fn test_expired_lease_is_taken_over() {
        let dir = tempfile::TempDir::new().unwrap();
        let lock = lock_in(&dir).with_lease(Some(Duration::from_secs(60)));
        std::fs::write(lock.path(), "1000\n").unwrap();

        let guard = lock.acquire().await.unwrap();
        assert!(guard.acquired_at() > Utc.timestamp_millis_opt(1000).unwrap());
        assert!(!lock.takeover_path.exists());
        guard.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_takeover_keeps_fresh_marker() {
        let dir = tempfile::TempDir::new().unwrap();
        let lock = lock_in(&dir).with_lease(Some(Duration::from_secs(60)));
        // another contender already replaced the stale marker with its own
        let fresh = lock.acquire().await.unwrap();

        lock.take_over(Utc.timestamp_millis_opt(1000).unwrap())
            .await
            .unwrap();

        assert!(lock.path().exists());
        assert!(!lock.takeover_path.exists());
        fresh.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_takeover_in_progress_is_left_alone() {
        let dir = tempfile::TempDir::new().unwrap();
        let lock = lock_in(&dir).with_lease(Some(Duration::from_secs(60)));
        std::fs::write(lock.path(), "1000\n").unwrap();
        std::fs::write(&lock.takeover_path, "1000\n").unwrap();

        assert!(matches!(lock.acquire().await, Err(PkiError::Locked { .. })));
        assert_eq!(std::fs::read_to_string(lock.path()).unwrap(), "1000\n");

        // operator recovery clears both markers
        lock.release().await.unwrap();
        assert!(!lock.takeover_path.exists());
        assert!(lock.acquire().await.is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_takeover_has_single_winner() {
        let dir = tempfile::TempDir::new().unwrap();
        let lock = lock_in(&dir).with_lease(Some(Duration::from_secs(60)));

        for round in 0..50 {
            std::fs::write(lock.path(), "1000\n").unwrap();

            let tasks: Vec<_> = (0..8)
                .map(|_| {
                    let lock = lock.clone();
                    tokio::spawn(async move { lock.acquire().await })
                })
                .collect();
            let mut guards = Vec::new();
            for task in tasks {
                match task.await.unwrap() {
                    Ok(guard) => guards.push(guard),
                    Err(PkiError::Locked { .. }) => {}
                    Err(e) => panic!("unexpected error: {:?}", e),
                }
            }

            assert_eq!(guards.len(), 1, "round {}", round);
            assert!(!lock.takeover_path.exists());
            for guard in guards {
                guard.release().await.unwrap();
            }
        }
    }

    #[tokio::test]
    async fn test_fresh_marker_within_lease_blocks() {
        let dir = tempfile::TempDir::new().unwrap();
        let lock = lock_in(&dir).with_lease(Some(Duration::from_secs(3600)));
        std::fs::write(lock.path(), format!("{}\n", Utc::now().timestamp_millis())).unwrap();

        assert!(matches!(lock.acquire().await, Err(PkiError::Locked { .. })));
    }

    #[tokio::test]
    async fn test_unparsable_marker_uses_mtime() {
        let dir = tempfile::TempDir::new().unwrap();
        let lock = lock_in(&dir);
        std::fs::write(lock.path(), "garbage").unwrap();

        let holder = lock.holder().await.unwrap().unwrap();
        assert!((Utc::now() - holder).num_seconds().abs() < 60);
    }

    #[tokio::test]
    async fn test_release_is_unconditional() {
        let dir = tempfile::TempDir::new().unwrap();
        let lock = lock_in(&dir);
        std::fs::write(lock.path(), "42\n").unwrap();

        lock.release().await.unwrap();
        assert!(!lock.path().exists());
        // releasing a free index is not an error
        lock.release().await.unwrap();
    }
}
