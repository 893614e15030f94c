//! Directory existence cache. Avoids repeated `stat()`/`mkdir` syscalls from
//! `create_dir_all()` on directories that already exist.
//!
//! Entries never expire: nothing in this system removes directories at runtime.

use std::collections::HashSet;
use std::fs;
use std::io;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};

use worldsave_core::{LockLevel, OrderedMutex, global_metrics};

/// Memoized set of directories known to exist.
#[derive(Debug)]
pub struct DirCache {
    known: OrderedMutex<HashSet<PathBuf>>,
}

impl Default for DirCache {
    fn default() -> Self {
        Self::new()
    }
}

impl DirCache {
    #[must_use]
    pub fn new() -> Self {
        Self {
            known: OrderedMutex::new(LockLevel::StorageDirCache, HashSet::new()),
        }
    }

    /// Create a directory (and parents) only if we haven't already created it.
    pub fn ensure(&self, dir: &Path) -> io::Result<()> {
        if self.known.lock().contains(dir) {
            global_metrics().storage.dir_cache_hits_total.inc();
            return Ok(());
        }
        global_metrics().storage.dir_cache_misses_total.inc();

        match fs::create_dir_all(dir) {
            Ok(()) => {}
            // Lost a race with another creator; the directory is there.
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists && dir.is_dir() => {}
            Err(e) => return Err(e),
        }
        self.known.lock().insert(dir.to_path_buf());
        Ok(())
    }

    /// Create the parent directory of `path`, if it has one.
    pub fn ensure_parent(&self, path: &Path) -> io::Result<()> {
        match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => self.ensure(parent),
            _ => Ok(()),
        }
    }

    #[must_use]
    pub fn contains(&self, dir: &Path) -> bool {
        self.known.lock().contains(dir)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.known.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forget every known directory.
    pub fn reset(&self) {
        self.known.lock().clear();
    }
}

static DIR_CACHE: LazyLock<DirCache> = LazyLock::new(DirCache::new);

/// The process-wide cache used by [`ensure_dir`].
#[must_use]
pub fn global_dir_cache() -> &'static DirCache {
    &DIR_CACHE
}

/// Create `dir` (and parents) through the process-wide cache.
pub fn ensure_dir(dir: &Path) -> io::Result<()> {
    DIR_CACHE.ensure(dir)
}

/// Which cache a store writes through: the process-wide one, or an owned
/// instance (tests and embedders that need isolation).
#[derive(Debug, Clone, Default)]
pub enum DirCacheHandle {
    #[default]
    Global,
    Owned(Arc<DirCache>),
}

impl DirCacheHandle {
    /// A fresh, unshared cache.
    #[must_use]
    pub fn isolated() -> Self {
        Self::Owned(Arc::new(DirCache::new()))
    }
}

impl Deref for DirCacheHandle {
    type Target = DirCache;

    fn deref(&self) -> &DirCache {
        match self {
            Self::Global => global_dir_cache(),
            Self::Owned(cache) => cache,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn ensure_creates_nested_dirs_and_remembers_them() {
        let tmp = TempDir::new().unwrap();
        let cache = DirCache::new();
        let dir = tmp.path().join("a/b/c");

        cache.ensure(&dir).unwrap();
        assert!(dir.is_dir());
        assert!(cache.contains(&dir));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn cached_entry_skips_filesystem() {
        let tmp = TempDir::new().unwrap();
        let cache = DirCache::new();
        let dir = tmp.path().join("gone");

        cache.ensure(&dir).unwrap();
        fs::remove_dir(&dir).unwrap();

        // The cache trusts its memory; no syscall, so the dir is not recreated.
        cache.ensure(&dir).unwrap();
        assert!(!dir.exists());

        cache.reset();
        assert!(cache.is_empty());
        cache.ensure(&dir).unwrap();
        assert!(dir.is_dir());
    }

    #[test]
    fn existing_directory_is_accepted() {
        let tmp = TempDir::new().unwrap();
        let cache = DirCache::new();
        cache.ensure(tmp.path()).unwrap();
        assert!(cache.contains(tmp.path()));
    }

    #[test]
    fn file_in_the_way_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let cache = DirCache::new();
        let blocker = tmp.path().join("blocker");
        fs::write(&blocker, b"x").unwrap();

        assert!(cache.ensure(&blocker).is_err());
        assert!(!cache.contains(&blocker));
    }

    #[test]
    fn ensure_parent_handles_bare_file_names() {
        let cache = DirCache::new();
        cache.ensure_parent(Path::new("file.json")).unwrap();
        assert!(cache.is_empty());
    }

    #[test]
    fn ensure_dir_goes_through_the_global_cache() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("global/nested");

        ensure_dir(&dir).unwrap();
        assert!(dir.is_dir());
        assert!(global_dir_cache().contains(&dir));
        // Second call is a cache hit.
        ensure_dir(&dir).unwrap();
    }

    #[test]
    fn handles_resolve_to_the_right_cache() {
        let global = DirCacheHandle::default();
        assert!(std::ptr::eq(&*global, global_dir_cache()));

        let tmp = TempDir::new().unwrap();
        let owned = DirCacheHandle::isolated();
        let clone = owned.clone();
        owned.ensure(&tmp.path().join("x")).unwrap();
        assert!(clone.contains(&tmp.path().join("x")));
        assert!(!global_dir_cache().contains(&tmp.path().join("x")));
    }

    #[test]
    fn concurrent_creators_all_succeed() {
        let tmp = TempDir::new().unwrap();
        let cache = std::sync::Arc::new(DirCache::new());
        let dir = tmp.path().join("shared/deep");

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = std::sync::Arc::clone(&cache);
                let dir = dir.clone();
                std::thread::spawn(move || cache.ensure(&dir))
            })
            .collect();
        for h in handles {
            h.join().expect("thread panicked").unwrap();
        }
        assert!(dir.is_dir());
        assert!(cache.contains(&dir));
    }
}
