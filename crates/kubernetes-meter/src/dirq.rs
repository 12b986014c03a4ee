//! Simple directory queue
//!
//! On-disk layout shared with the producer side of the pipeline:
//!
//! ```text
//! <queue>/
//!   65a1b2c0/                  intermediate directory (time bucket, 8 hex digits)
//!     65a1b2f30c8a4e           element (14 hex digits)
//!     65a1b2f30c8a4e.lck       hard link held by the consumer that claimed it
//!     65a1b2f4000017.tmp       element still being written
//! ```
//!
//! An element is claimed by hard-linking it to `<element>.lck`. Link
//! creation is atomic, so at most one consumer holds a given claim; a
//! failed link is contention, not an error. There is no claim expiry
//! unless [`DirQueue::purge`] is given a maximum lock age.

use chrono::Utc;
use gratia_common::{GratiaError, Result};
use regex::Regex;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::{Duration, SystemTime};
use tracing::{debug, warn};
use uuid::Uuid;

/// Time bucket for intermediate directories, in seconds
pub const GRANULARITY_SECS: u64 = 60;

/// Default age after which an abandoned `.tmp` file is purged
pub const DEFAULT_MAX_TEMP_AGE: Duration = Duration::from_secs(300);

const LOCK_SUFFIX: &str = ".lck";
const TEMP_SUFFIX: &str = ".tmp";

#[allow(clippy::unwrap_used)]
static DIRECTORY_NAME: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[0-9a-f]{8}$").unwrap());

#[allow(clippy::unwrap_used)]
static ELEMENT_NAME: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[0-9a-f]{14}$").unwrap());

/// What a purge pass cleaned up
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeReport {
    pub temp_files: usize,
    pub stale_locks: usize,
    pub directories: usize,
}

/// File-backed queue of opaque byte payloads
#[derive(Debug, Clone)]
pub struct DirQueue {
    path: PathBuf,
}

impl DirQueue {
    /// Open (creating if needed) the queue rooted at `path`
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        fs::create_dir_all(&path)?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Store a new element and return its name
    pub fn add(&self, data: &[u8]) -> Result<String> {
        loop {
            let now = Utc::now();
            let secs = now.timestamp().max(0) as u64;
            let dir = format!("{:08x}", secs - secs % GRANULARITY_SECS);
            let dir_path = self.path.join(&dir);
            fs::create_dir_all(&dir_path)?;

            let rnd = Uuid::new_v4().as_bytes()[0] & 0x0f;
            let element = format!("{:08x}{:05x}{:01x}", secs, now.timestamp_subsec_micros(), rnd);
            let final_path = dir_path.join(&element);
            let temp_path = dir_path.join(format!("{}{}", element, TEMP_SUFFIX));

            fs::write(&temp_path, data)?;
            match fs::hard_link(&temp_path, &final_path) {
                Ok(()) => {
                    fs::remove_file(&temp_path)?;
                    return Ok(format!("{}/{}", dir, element));
                },
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    fs::remove_file(&temp_path)?;
                },
                Err(e) => {
                    let _ = fs::remove_file(&temp_path);
                    return Err(e.into());
                },
            }
        }
    }

    /// Element names in queue order
    pub fn names(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for dir in self.directories()? {
            for element in list_matching(&self.path.join(&dir), &ELEMENT_NAME)? {
                names.push(format!("{}/{}", dir, element));
            }
        }
        Ok(names)
    }

    pub fn count(&self) -> Result<usize> {
        Ok(self.names()?.len())
    }

    /// Claim an element for exclusive use
    ///
    /// Returns `None` when another consumer holds the claim or the element
    /// no longer exists.
    pub fn try_acquire(&self, name: &str) -> Result<Option<Lease<'_>>> {
        let path = self.element_path(name)?;
        let lock = lock_path(&path);

        match fs::hard_link(&path, &lock) {
            Ok(()) => {},
            Err(e) if matches!(e.kind(), ErrorKind::AlreadyExists | ErrorKind::NotFound) => {
                return Ok(None);
            },
            Err(e) => return Err(e.into()),
        }

        // Refresh the mtime shared with the lock link so purge measures lock age from now.
        // The element can vanish between link and touch if another consumer removed it.
        let touched = fs::OpenOptions::new()
            .write(true)
            .open(&path)
            .and_then(|f| f.set_modified(SystemTime::now()));
        match touched {
            Ok(()) => {},
            Err(e) if e.kind() == ErrorKind::NotFound => {
                let _ = fs::remove_file(&lock);
                return Ok(None);
            },
            Err(e) => {
                let _ = fs::remove_file(&lock);
                return Err(e.into());
            },
        }

        Ok(Some(Lease {
            queue: self,
            name: name.to_string(),
            path,
            lock,
            held: true,
        }))
    }

    /// Clean up after crashed writers and consumers
    ///
    /// Removes `.tmp` files older than `max_temp_age`, breaks locks older
    /// than `max_lock_age` when one is given, and deletes empty
    /// intermediate directories other than the newest.
    pub fn purge(&self, max_temp_age: Duration, max_lock_age: Option<Duration>) -> Result<PurgeReport> {
        let mut report = PurgeReport::default();
        let dirs = self.directories()?;
        let now = SystemTime::now();

        for (index, dir) in dirs.iter().enumerate() {
            let dir_path = self.path.join(dir);
            let mut remaining = 0;

            for entry in fs::read_dir(&dir_path)? {
                let entry = entry?;
                let name = entry.file_name().to_string_lossy().to_string();
                let age = entry
                    .metadata()
                    .and_then(|m| m.modified())
                    .ok()
                    .and_then(|modified| now.duration_since(modified).ok())
                    .unwrap_or_default();

                if name.ends_with(TEMP_SUFFIX) && age > max_temp_age {
                    warn!(element = %format!("{}/{}", dir, name), age_secs = age.as_secs(), "Removing stale temporary element");
                    remove_if_present(&entry.path())?;
                    report.temp_files += 1;
                } else if name.ends_with(LOCK_SUFFIX) && max_lock_age.is_some_and(|max| age > max) {
                    warn!(element = %format!("{}/{}", dir, name), age_secs = age.as_secs(), "Breaking stale lock");
                    remove_if_present(&entry.path())?;
                    report.stale_locks += 1;
                } else {
                    remaining += 1;
                }
            }

            if remaining == 0 && index + 1 < dirs.len() {
                match fs::remove_dir(&dir_path) {
                    Ok(()) => report.directories += 1,
                    // A producer may have added an element meanwhile
                    Err(e) => debug!(dir = %dir, error = %e, "Keeping intermediate directory"),
                }
            }
        }

        Ok(report)
    }

    fn directories(&self) -> Result<Vec<String>> {
        list_matching(&self.path, &DIRECTORY_NAME)
    }

    fn element_path(&self, name: &str) -> Result<PathBuf> {
        match name.split_once('/') {
            Some((dir, element)) if DIRECTORY_NAME.is_match(dir) && ELEMENT_NAME.is_match(element) => {
                Ok(self.path.join(dir).join(element))
            },
            _ => Err(GratiaError::queue(format!("invalid element name '{}'", name))),
        }
    }
}

/// Exclusive claim on one queue element
///
/// The claim is released when the lease is dropped, on every exit path.
/// [`Lease::remove`] consumes the lease and deletes the element instead.
#[derive(Debug)]
pub struct Lease<'q> {
    queue: &'q DirQueue,
    name: String,
    path: PathBuf,
    lock: PathBuf,
    held: bool,
}

impl Lease<'_> {
    /// Element name, `dir/elem`
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn read(&self) -> Result<Vec<u8>> {
        Ok(fs::read(&self.path)?)
    }

    /// Give the claim back, leaving the element queued
    pub fn release(mut self) -> Result<()> {
        self.held = false;
        fs::remove_file(&self.lock)?;
        Ok(())
    }

    /// Delete the element from the queue
    pub fn remove(mut self) -> Result<()> {
        fs::remove_file(&self.path)?;
        self.held = false;
        fs::remove_file(&self.lock)?;
        debug!(queue = %self.queue.path.display(), element = %self.name, "Removed element");
        Ok(())
    }
}

impl Drop for Lease<'_> {
    fn drop(&mut self) {
        if self.held {
            if let Err(e) = fs::remove_file(&self.lock) {
                warn!(element = %self.name, error = %e, "Failed to release queue claim");
            }
        }
    }
}

fn lock_path(element: &Path) -> PathBuf {
    let mut lock = element.as_os_str().to_owned();
    lock.push(LOCK_SUFFIX);
    PathBuf::from(lock)
}

fn list_matching(dir: &Path, pattern: &Regex) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in fs::read_dir(dir)? {
        let name = entry?.file_name().to_string_lossy().to_string();
        if pattern.is_match(&name) {
            names.push(name);
        }
    }
    names.sort();
    Ok(names)
}

fn remove_if_present(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
        _ => Ok(()),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn queue() -> (tempfile::TempDir, DirQueue) {
        let dir = tempfile::tempdir().unwrap();
        let queue = DirQueue::open(dir.path().join("queue")).unwrap();
        (dir, queue)
    }

    #[test]
    fn test_add_and_list_in_order() {
        let (_dir, queue) = queue();
        let first = queue.add(b"one").unwrap();
        let second = queue.add(b"two").unwrap();

        let names = queue.names().unwrap();
        assert_eq!(names.len(), 2);
        assert!(names.contains(&first) && names.contains(&second));
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);
        assert_eq!(queue.count().unwrap(), 2);
    }

    #[test]
    fn test_claim_is_exclusive() {
        let (_dir, queue) = queue();
        let name = queue.add(b"payload").unwrap();

        let lease = queue.try_acquire(&name).unwrap().unwrap();
        assert_eq!(lease.read().unwrap(), b"payload");
        assert!(queue.try_acquire(&name).unwrap().is_none());

        lease.release().unwrap();
        assert!(queue.try_acquire(&name).unwrap().is_some());
    }

    #[test]
    fn test_drop_releases_claim() {
        let (_dir, queue) = queue();
        let name = queue.add(b"payload").unwrap();

        {
            let _lease = queue.try_acquire(&name).unwrap().unwrap();
        }
        assert!(queue.try_acquire(&name).unwrap().is_some());
    }

    #[test]
    fn test_lock_files_are_not_elements() {
        let (_dir, queue) = queue();
        let name = queue.add(b"payload").unwrap();
        let _lease = queue.try_acquire(&name).unwrap().unwrap();

        assert_eq!(queue.names().unwrap(), vec![name]);
    }

    #[test]
    fn test_remove() {
        let (_dir, queue) = queue();
        let name = queue.add(b"payload").unwrap();

        queue.try_acquire(&name).unwrap().unwrap().remove().unwrap();
        assert_eq!(queue.count().unwrap(), 0);
        assert!(queue.try_acquire(&name).unwrap().is_none());
    }

    #[test]
    fn test_invalid_names_rejected() {
        let (_dir, queue) = queue();
        assert!(queue.try_acquire("../../etc/passwd").is_err());
        assert!(queue.try_acquire("0000000g/00000000000000").is_err());
    }

    #[test]
    fn test_purge_breaks_only_configured_locks() {
        let (_dir, queue) = queue();
        let name = queue.add(b"payload").unwrap();
        let lease = queue.try_acquire(&name).unwrap().unwrap();
        std::mem::forget(lease);

        let report = queue.purge(DEFAULT_MAX_TEMP_AGE, None).unwrap();
        assert_eq!(report.stale_locks, 0);
        assert!(queue.try_acquire(&name).unwrap().is_none());

        std::thread::sleep(Duration::from_millis(20));
        let report = queue.purge(DEFAULT_MAX_TEMP_AGE, Some(Duration::from_millis(1))).unwrap();
        assert_eq!(report.stale_locks, 1);
        assert!(queue.try_acquire(&name).unwrap().is_some());
    }

    #[test]
    fn test_purge_removes_empty_old_directories() {
        let (_dir, queue) = queue();
        fs::create_dir_all(queue.path().join("00000001")).unwrap();
        queue.add(b"payload").unwrap();

        let report = queue.purge(DEFAULT_MAX_TEMP_AGE, None).unwrap();
        assert_eq!(report.directories, 1);
        assert!(!queue.path().join("00000001").exists());
        assert_eq!(queue.count().unwrap(), 1);
    }
}
