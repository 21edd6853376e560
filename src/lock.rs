//! File-based locking for index files.
//!
//! Saving and loading take an advisory lock on a sibling `<file>.lock`, so
//! concurrent saves to one path never interleave and a load never observes
//! a half-written file. Saves hold the lock exclusively, loads shared.

use std::ffi::OsString;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use fs2::FileExt;

use crate::error::Result;

/// RAII guard that holds a lock on an index file.
///
/// The lock is released when the guard is dropped.
pub struct IndexFileLock {
    file: File,
}

/// Path of the lock file guarding `index_path`.
pub fn lock_path(index_path: &Path) -> PathBuf {
    let mut name = OsString::from(index_path.as_os_str());
    name.push(".lock");
    PathBuf::from(name)
}

fn open_lock_file(index_path: &Path) -> Result<File> {
    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(lock_path(index_path))?;
    Ok(file)
}

impl IndexFileLock {
    /// Acquire an exclusive lock, blocking while another holder exists.
    ///
    /// # Arguments
    ///
    /// * `index_path` - Path of the index file (not of the lock file)
    pub fn exclusive(index_path: &Path) -> Result<Self> {
        let file = open_lock_file(index_path)?;
        file.lock_exclusive()?;
        Ok(Self { file })
    }

    /// Acquire a shared lock, blocking while an exclusive holder exists.
    ///
    /// An existing lock file is opened read-only. When there is none and it
    /// cannot be created (a read-only directory, say), no writer can lock
    /// the index either, so `Ok(None)` is returned and the caller reads
    /// unlocked.
    pub fn shared(index_path: &Path) -> Result<Option<Self>> {
        let lock = lock_path(index_path);
        let file = match File::open(&lock).or_else(|_| open_lock_file(index_path)) {
            Ok(file) => file,
            Err(err) => {
                tracing::debug!(path = %lock.display(), error = %err, "index.lock.unavailable");
                return Ok(None);
            }
        };
        file.lock_shared()?;
        Ok(Some(Self { file }))
    }
}

impl Drop for IndexFileLock {
    fn drop(&mut self) {
        // Ignore errors since we're in Drop
        let _ = self.file.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier, Mutex};
    use std::thread;
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn test_lock_path_appends_suffix() {
        assert_eq!(
            lock_path(Path::new("/tmp/points.idx")),
            PathBuf::from("/tmp/points.idx.lock")
        );
    }

    #[test]
    fn test_lock_acquire_release() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("index.idx");

        let guard = IndexFileLock::exclusive(&path).unwrap();
        assert!(lock_path(&path).exists());
        drop(guard);

        let _guard2 = IndexFileLock::exclusive(&path).unwrap();
    }

    #[test]
    fn test_shared_blocks_exclusive() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("index.idx");

        let _reader = IndexFileLock::shared(&path).unwrap().unwrap();
        let _second = IndexFileLock::shared(&path).unwrap().unwrap();
        let other = File::open(lock_path(&path)).unwrap();
        assert!(other.try_lock_exclusive().is_err());
    }

    #[test]
    fn test_shared_reuses_existing_lock_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("index.idx");
        drop(IndexFileLock::exclusive(&path).unwrap());

        let _reader = IndexFileLock::shared(&path).unwrap().unwrap();
        let entries = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(entries, 1);
    }

    #[test]
    fn test_shared_without_creatable_lock_file() {
        let dir = TempDir::new().unwrap();
        // The index name fits the file-name limit, `<name>.lock` does not.
        let path = dir.path().join("i".repeat(252));
        std::fs::write(&path, b"index").unwrap();

        assert!(IndexFileLock::shared(&path).unwrap().is_none());
        assert!(IndexFileLock::exclusive(&path).is_err());
    }

    #[test]
    fn test_exclusive_lock_serializes_holders() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("index.idx");
        let barrier = Arc::new(Barrier::new(2));
        let events = Arc::new(Mutex::new(Vec::new()));

        let handles: Vec<_> = (0..2)
            .map(|t| {
                let path = path.clone();
                let barrier = Arc::clone(&barrier);
                let events = Arc::clone(&events);
                thread::spawn(move || {
                    barrier.wait();
                    let _guard = IndexFileLock::exclusive(&path).unwrap();
                    events.lock().unwrap().push((t, "acquired"));
                    thread::sleep(Duration::from_millis(30));
                    events.lock().unwrap().push((t, "released"));
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        // Holders never overlap: events alternate acquired/released.
        let events = events.lock().unwrap();
        assert_eq!(events.len(), 4);
        assert_eq!(events[0].0, events[1].0);
        assert_eq!(events[1].1, "released");
        assert_eq!(events[2].0, events[3].0);
    }
}
