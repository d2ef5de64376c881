//! Disk-backed cache store.
//!
//! Entries live under the cache root as `aa/bb/<hash16>.entry` files, fanned
//! out by the top two bytes of the key hash. Writes go to a uniquely-named
//! temp file in the target directory and are renamed into place, so readers
//! observe either the previous entry or the complete new one. A crash leaves
//! at worst an orphaned temp file, which the startup sweep removes.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::entry::CacheEntry;
use super::key::CacheKey;
use super::store::{CacheStore, StoreError};

/// Filesystem implementation of [`CacheStore`].
///
/// Size accounting is approximate: an `AtomicU64` tracks bytes on disk and
/// is rebuilt from a full sweep at startup. When a write pushes usage past
/// the configured limit, the store evicts oldest-modified entries until
/// usage drops to 90% of the limit. Revalidation rewrites an entry file and
/// thereby refreshes its modification time, so frequently revalidated
/// entries are evicted last.
pub struct DiskStore {
    root: PathBuf,
    max_size_bytes: u64,
    current_size: AtomicU64,
    tmp_seq: AtomicU64,
}

impl DiskStore {
    /// Fraction of the size limit to keep after an eviction pass, so each
    /// pass buys headroom instead of evicting one file per write.
    const EVICT_HEADROOM_PERCENT: u64 = 90;

    /// Opens (or creates) the store rooted at `root`.
    ///
    /// Sweeps the directory tree: undecodable or leftover files are deleted,
    /// valid entries are counted toward the size accounting. Corrupt data
    /// found here is discarded before it can ever be served.
    pub fn open(root: impl Into<PathBuf>, max_size_bytes: u64) -> Result<Self, StoreError> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        let initial_size = sweep(&root)?;
        debug!(
            root = %root.display(),
            bytes = initial_size,
            "cache store opened"
        );
        Ok(Self {
            root,
            max_size_bytes,
            current_size: AtomicU64::new(initial_size),
            tmp_seq: AtomicU64::new(0),
        })
    }

    /// Bytes currently attributed to stored entries.
    pub fn current_size_bytes(&self) -> u64 {
        self.current_size.load(Ordering::Relaxed)
    }

    pub fn max_size_bytes(&self) -> u64 {
        self.max_size_bytes
    }

    fn path_for(&self, key: &CacheKey) -> PathBuf {
        let (dir1, dir2, filename) = key.to_path_components();
        self.root.join(dir1).join(dir2).join(filename)
    }

    fn evict_to(&self, target: u64) {
        let current = self.current_size_bytes();
        if current <= target {
            return;
        }

        let mut files: Vec<(PathBuf, u64, SystemTime)> = Vec::new();
        if let Err(e) = collect_entry_files(&self.root, &mut files) {
            warn!(error = %e, "cache eviction scan failed");
            return;
        }
        files.sort_by_key(|(_, _, mtime)| *mtime);

        let need = current.saturating_sub(target);
        let mut freed = 0u64;
        let mut evicted = 0usize;
        for (path, len, _) in files {
            if freed >= need {
                break;
            }
            if std::fs::remove_file(&path).is_ok() {
                freed += len;
                evicted += 1;
            }
        }
        self.current_size.fetch_sub(freed, Ordering::Relaxed);
        debug!(evicted, freed, "cache evicted oldest entries");
    }
}

#[async_trait]
impl CacheStore for DiskStore {
    async fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>, StoreError> {
        let path = self.path_for(key);
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        match CacheEntry::decode(&raw) {
            Ok(entry) => Ok(Some(entry)),
            Err(e) => {
                // Corrupt or truncated on disk: drop it and report a miss.
                warn!(path = %path.display(), error = %e, "discarding corrupt cache entry");
                if tokio::fs::remove_file(&path).await.is_ok() {
                    self.current_size
                        .fetch_sub(raw.len() as u64, Ordering::Relaxed);
                }
                Ok(None)
            }
        }
    }

    async fn put(&self, key: &CacheKey, entry: &CacheEntry) -> Result<(), StoreError> {
        let raw = entry.encode()?;
        let path = self.path_for(key);
        let parent = path
            .parent()
            .expect("entry path always has a shard directory parent");
        tokio::fs::create_dir_all(parent).await?;

        // Unique temp name per write: concurrent puts for the same key must
        // not scribble over each other's staging file.
        let seq = self.tmp_seq.fetch_add(1, Ordering::Relaxed);
        let tmp = parent.join(format!(
            "{}.{seq}.tmp",
            path.file_name()
                .expect("entry path always has a file name")
                .to_string_lossy()
        ));

        tokio::fs::write(&tmp, &raw).await?;

        let replaced_len = match tokio::fs::metadata(&path).await {
            Ok(meta) => meta.len(),
            Err(_) => 0,
        };
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }

        let new_len = raw.len() as u64;
        self.current_size.fetch_add(new_len, Ordering::Relaxed);
        self.current_size.fetch_sub(replaced_len, Ordering::Relaxed);

        if self.current_size_bytes() > self.max_size_bytes {
            self.evict_to(self.max_size_bytes * Self::EVICT_HEADROOM_PERCENT / 100);
        }
        Ok(())
    }

    async fn delete(&self, key: &CacheKey) -> Result<(), StoreError> {
        let path = self.path_for(key);
        let len = match tokio::fs::metadata(&path).await {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                self.current_size.fetch_sub(len, Ordering::Relaxed);
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Walks the cache tree, deleting anything that is not a decodable entry
/// file (interrupted temp files, truncated entries) and returning the total
/// size of what remains.
fn sweep(root: &Path) -> io::Result<u64> {
    let mut total = 0u64;
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for dirent in std::fs::read_dir(&dir)? {
            let dirent = dirent?;
            let path = dirent.path();
            if path.is_dir() {
                stack.push(path);
                continue;
            }

            let valid = path.extension().is_some_and(|ext| ext == "entry")
                && std::fs::read(&path)
                    .is_ok_and(|raw| CacheEntry::decode(&raw).is_ok());
            if valid {
                total += dirent.metadata()?.len();
            } else {
                warn!(path = %path.display(), "sweeping unreadable cache file");
                let _ = std::fs::remove_file(&path);
            }
        }
    }
    Ok(total)
}

fn collect_entry_files(
    root: &Path,
    files: &mut Vec<(PathBuf, u64, SystemTime)>,
) -> io::Result<()> {
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for dirent in std::fs::read_dir(&dir)? {
            let dirent = dirent?;
            let path = dirent.path();
            if path.is_dir() {
                stack.push(path);
            } else if path.extension().is_some_and(|ext| ext == "entry") {
                let meta = dirent.metadata()?;
                files.push((path, meta.len(), meta.modified()?));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{Headers, Method};
    use bytes::Bytes;
    use std::time::Duration;
    use tempfile::tempdir;

    fn key(target: &str) -> CacheKey {
        CacheKey::from_request(&Method::Get, target).unwrap()
    }

    fn entry(body: &[u8]) -> CacheEntry {
        let mut headers = Headers::new();
        headers.insert("Content-Type", "text/plain");
        CacheEntry::new(200, headers, Bytes::copy_from_slice(body), 300)
    }

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let dir = tempdir().unwrap();
        let store = DiskStore::open(dir.path(), 1024 * 1024).unwrap();
        let k = key("/hello");

        store.put(&k, &entry(b"hello world")).await.unwrap();
        let got = store.get(&k).await.unwrap().expect("entry present");
        assert_eq!(got.body().as_ref(), b"hello world");
        assert_eq!(got.headers().get("content-type"), Some("text/plain"));
        assert_eq!(got.status(), 200);
    }

    #[tokio::test]
    async fn missing_key_is_a_miss() {
        let dir = tempdir().unwrap();
        let store = DiskStore::open(dir.path(), 1024 * 1024).unwrap();
        assert!(store.get(&key("/absent")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_removes_entry() {
        let dir = tempdir().unwrap();
        let store = DiskStore::open(dir.path(), 1024 * 1024).unwrap();
        let k = key("/x");

        store.put(&k, &entry(b"data")).await.unwrap();
        store.delete(&k).await.unwrap();
        assert!(store.get(&k).await.unwrap().is_none());
        assert_eq!(store.current_size_bytes(), 0);

        // Deleting again is not an error.
        store.delete(&k).await.unwrap();
    }

    #[tokio::test]
    async fn corrupt_entry_is_discarded_on_read() {
        let dir = tempdir().unwrap();
        let store = DiskStore::open(dir.path(), 1024 * 1024).unwrap();
        let k = key("/truncated");

        store.put(&k, &entry(b"full body here")).await.unwrap();

        // Truncate the file behind the store's back.
        let path = store.path_for(&k);
        let raw = std::fs::read(&path).unwrap();
        std::fs::write(&path, &raw[..raw.len() - 3]).unwrap();

        assert!(store.get(&k).await.unwrap().is_none());
        assert!(!path.exists(), "corrupt file deleted");
    }

    #[tokio::test]
    async fn startup_sweep_discards_corrupt_and_counts_valid() {
        let dir = tempdir().unwrap();
        let k = key("/kept");
        {
            let store = DiskStore::open(dir.path(), 1024 * 1024).unwrap();
            store.put(&k, &entry(b"kept")).await.unwrap();
        }
        // Plant garbage: a bogus entry file and an orphaned temp file.
        let bogus = dir.path().join("00").join("00");
        std::fs::create_dir_all(&bogus).unwrap();
        std::fs::write(bogus.join("0000000000000000.entry"), b"not an entry").unwrap();
        std::fs::write(bogus.join("0000000000000000.entry.0.tmp"), b"leftover").unwrap();

        let store = DiskStore::open(dir.path(), 1024 * 1024).unwrap();
        assert!(store.get(&k).await.unwrap().is_some(), "valid entry survives");
        assert!(!bogus.join("0000000000000000.entry").exists());
        assert!(!bogus.join("0000000000000000.entry.0.tmp").exists());
        assert!(store.current_size_bytes() > 0);
    }

    #[tokio::test]
    async fn eviction_drops_oldest_entries_first() {
        let dir = tempdir().unwrap();
        // Each entry is ~200 bytes encoded; cap the store at roughly three.
        let store = DiskStore::open(dir.path(), 600).unwrap();

        let old = key("/old");
        let mid = key("/mid");
        store.put(&old, &entry(&[b'a'; 100])).await.unwrap();
        store.put(&mid, &entry(&[b'b'; 100])).await.unwrap();

        // Backdate so modification order is unambiguous.
        for (k, age) in [(&old, 300), (&mid, 200)] {
            let f = std::fs::File::options()
                .append(true)
                .open(store.path_for(k))
                .unwrap();
            f.set_modified(SystemTime::now() - Duration::from_secs(age))
                .unwrap();
        }

        let fresh = key("/fresh");
        store.put(&fresh, &entry(&[b'c'; 300])).await.unwrap();

        assert!(
            store.current_size_bytes() <= 600,
            "size bounded after eviction"
        );
        assert!(store.get(&old).await.unwrap().is_none(), "oldest evicted");
        assert!(store.get(&fresh).await.unwrap().is_some(), "newest kept");
    }

    #[tokio::test]
    async fn replacing_an_entry_does_not_double_count() {
        let dir = tempdir().unwrap();
        let store = DiskStore::open(dir.path(), 1024 * 1024).unwrap();
        let k = key("/same");

        store.put(&k, &entry(b"version one")).await.unwrap();
        let after_first = store.current_size_bytes();
        store.put(&k, &entry(b"version two")).await.unwrap();
        assert_eq!(store.current_size_bytes(), after_first);
    }
}
