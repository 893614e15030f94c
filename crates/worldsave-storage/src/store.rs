//! One-file-per-record entity stores.
//!
//! Each store keeps its records in memory and persists them through its own
//! [`SaveQueue`]: mutations are cheap, and the file `<root>/<KIND>/<id>.json`
//! converges to the latest in-memory state shortly afterwards.

use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use worldsave_core::{
    Agent, Config, Gimmick, Inventory, LockLevel, Location, OrderedRwLock, Record,
    StorageMetricsSnapshot, User, global_metrics, validate_record_id,
};

use crate::atomic::{RenameRetryPolicy, TEMP_SUFFIX, sweep_stale_temp_files, write_json_atomic};
use crate::dir_cache::DirCacheHandle;
use crate::save_queue::{SaveQueue, SaveQueueStats, SaveTicket};
use crate::{Result, StorageError};

const RECORD_EXT: &str = ".json";

/// Error sink shared by every store of a [`World`]: `(kind, id, error)`.
pub type StoreErrorSink = Arc<dyn Fn(&'static str, &str, &StorageError) + Send + Sync>;

/// Knobs for opening a store.
#[derive(Clone)]
pub struct StoreOptions {
    pub dirs: DirCacheHandle,
    pub rename_policy: RenameRetryPolicy,
    pub save_delay: Duration,
    pub save_cooldown: Duration,
    /// `None` logs failures with `tracing::warn!`.
    pub on_error: Option<StoreErrorSink>,
}

impl StoreOptions {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            dirs: DirCacheHandle::Global,
            rename_policy: RenameRetryPolicy::from_config(config),
            save_delay: config.save_delay(),
            save_cooldown: config.save_cooldown(),
            on_error: None,
        }
    }

    #[must_use]
    pub fn with_dirs(mut self, dirs: DirCacheHandle) -> Self {
        self.dirs = dirs;
        self
    }

    #[must_use]
    pub fn with_on_error<F>(mut self, on_error: F) -> Self
    where
        F: Fn(&'static str, &str, &StorageError) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(on_error));
        self
    }
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

fn checked_id(id: &str) -> Result<&str> {
    validate_record_id(id).map_err(|_| StorageError::InvalidKey(id.to_string()))
}

fn record_path(dir: &Path, id: &str) -> PathBuf {
    dir.join(format!("{id}{RECORD_EXT}"))
}

// ---------------------------------------------------------------------------
// EntityStore
// ---------------------------------------------------------------------------

/// In-memory records of one kind, persisted through a coalescing save queue.
pub struct EntityStore<R: Record> {
    dir: PathBuf,
    records: Arc<OrderedRwLock<HashMap<String, R>>>,
    queue: SaveQueue<String>,
}

impl<R: Record> EntityStore<R> {
    /// Open `<root>/<KIND>/` with settings taken from `config`.
    pub fn open(root: &Path, config: &Config) -> Result<Self> {
        Self::open_with(root, &StoreOptions::from_config(config))
    }

    pub fn open_with(root: &Path, opts: &StoreOptions) -> Result<Self> {
        let dir = root.join(R::KIND);
        opts.dirs.ensure(&dir)?;
        let loaded = load_records::<R>(&dir)?;
        tracing::debug!(kind = R::KIND, dir = %dir.display(), count = loaded.len(), "store opened");

        let records = Arc::new(OrderedRwLock::new(LockLevel::StorageRecords, loaded));

        let save_records = Arc::clone(&records);
        let save_dir = dir.clone();
        let save_dirs = opts.dirs.clone();
        let policy = opts.rename_policy;
        let save = move |id: &String| -> Result<()> {
            // Snapshot under the read lock; never hold it across file I/O.
            let current = save_records.read().get(id).cloned();
            let Some(record) = current else {
                return Err(StorageError::NotFound {
                    kind: R::KIND,
                    id: id.clone(),
                });
            };
            write_json_atomic(&record_path(&save_dir, id), &record, &save_dirs, policy)
        };

        let mut builder = SaveQueue::builder(opts.save_delay, save)
            .cooldown(opts.save_cooldown)
            .name(R::KIND);
        if let Some(sink) = opts.on_error.clone() {
            builder = builder.on_error(move |id: &String, err: &StorageError| sink(R::KIND, id, err));
        }

        Ok(Self {
            dir,
            records,
            queue: builder.build()?,
        })
    }

    #[must_use]
    pub const fn kind(&self) -> &'static str {
        R::KIND
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File that holds (or will hold) record `id`.
    #[must_use]
    pub fn path_for(&self, id: &str) -> PathBuf {
        record_path(&self.dir, id)
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<R> {
        self.records.read().get(id).cloned()
    }

    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.records.read().contains_key(id)
    }

    /// All ids, sorted.
    #[must_use]
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.records.read().keys().cloned().collect();
        ids.sort_unstable();
        ids
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Create a default record for `id` and schedule its first save.
    pub fn create(&self, id: &str) -> Result<R> {
        let record = R::with_id(checked_id(id)?);
        self.insert(record.clone())?;
        Ok(record)
    }

    /// Add a fully built record and schedule its first save.
    pub fn insert(&self, record: R) -> Result<SaveTicket> {
        let id = checked_id(record.id())?.to_string();
        {
            let mut records = self.records.write();
            match records.entry(id.clone()) {
                Entry::Occupied(_) => {
                    return Err(StorageError::AlreadyExists { kind: R::KIND, id });
                }
                Entry::Vacant(slot) => {
                    slot.insert(record);
                }
            }
        }
        Ok(self.queue.request_save(id))
    }

    /// Existing record for `id`, or a freshly created (and scheduled) default.
    pub fn get_or_create(&self, id: &str) -> Result<R> {
        let id = checked_id(id)?;
        let (record, created) = {
            let mut records = self.records.write();
            match records.entry(id.to_string()) {
                Entry::Occupied(slot) => (slot.get().clone(), false),
                Entry::Vacant(slot) => (slot.insert(R::with_id(id)).clone(), true),
            }
        };
        if created {
            let _ = self.queue.request_save(id.to_string());
        }
        Ok(record)
    }

    /// Mutate record `id` in place and schedule a save.
    ///
    /// The returned ticket resolves once a flush that includes this mutation
    /// has run; failures are reported to the error sink, not here.
    pub fn update<F>(&self, id: &str, mutate: F) -> Result<SaveTicket>
    where
        F: FnOnce(&mut R),
    {
        {
            let mut records = self.records.write();
            let Some(record) = records.get_mut(id) else {
                return Err(StorageError::NotFound {
                    kind: R::KIND,
                    id: id.to_string(),
                });
            };
            mutate(record);
            record.touch();
        }
        Ok(self.queue.request_save(id.to_string()))
    }

    /// Expedite pending saves and wait (bounded) until all are written.
    pub fn flush(&self, timeout: Duration) -> bool {
        self.queue.flush_pending(timeout)
    }

    #[must_use]
    pub fn stats(&self) -> SaveQueueStats {
        self.queue.stats()
    }

    /// Remove temp files abandoned by crashed writers in this store's directory.
    pub fn sweep_temp_files(&self) -> Result<usize> {
        sweep_stale_temp_files(&self.dir)
    }
}

fn load_records<R: Record>(dir: &Path) -> Result<HashMap<String, R>> {
    let mut records = HashMap::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if name.starts_with('.') || name.ends_with(TEMP_SUFFIX) {
            continue;
        }
        let Some(id) = name.strip_suffix(RECORD_EXT) else {
            continue;
        };
        if validate_record_id(id).is_err() || !path.is_file() {
            continue;
        }

        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(path = %path.display(), "skipping unreadable record: {e}");
                continue;
            }
        };
        match serde_json::from_slice::<R>(&bytes) {
            Ok(record) => {
                if !record.id().is_empty() && record.id() != id {
                    tracing::warn!(
                        path = %path.display(),
                        embedded = record.id(),
                        "record id differs from file name; keyed by file name"
                    );
                }
                records.insert(id.to_string(), record);
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), "skipping corrupt record: {e}");
            }
        }
    }
    Ok(records)
}

// ---------------------------------------------------------------------------
// World
// ---------------------------------------------------------------------------

/// Per-kind queue stats plus the process-wide storage counters.
#[derive(Debug, Clone, Serialize)]
pub struct WorldStats {
    pub stores: BTreeMap<&'static str, SaveQueueStats>,
    pub metrics: StorageMetricsSnapshot,
}

/// The five entity stores over one storage root.
pub struct World {
    root: PathBuf,
    pub agents: EntityStore<Agent>,
    pub users: EntityStore<User>,
    pub locations: EntityStore<Location>,
    pub inventories: EntityStore<Inventory>,
    pub gimmicks: EntityStore<Gimmick>,
}

impl World {
    /// Open every store under `config.storage_root`.
    pub fn open(config: &Config) -> Result<Self> {
        Self::open_with(&config.storage_root, &StoreOptions::from_config(config))
    }

    pub fn open_with(root: &Path, opts: &StoreOptions) -> Result<Self> {
        Ok(Self {
            root: root.to_path_buf(),
            agents: EntityStore::open_with(root, opts)?,
            users: EntityStore::open_with(root, opts)?,
            locations: EntityStore::open_with(root, opts)?,
            inventories: EntityStore::open_with(root, opts)?,
            gimmicks: EntityStore::open_with(root, opts)?,
        })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Flush every store within one shared deadline.
    pub fn flush_all(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let remaining = || deadline.saturating_duration_since(Instant::now());
        // Non-short-circuiting so every store gets its chance.
        let results = [
            self.agents.flush(remaining()),
            self.users.flush(remaining()),
            self.locations.flush(remaining()),
            self.inventories.flush(remaining()),
            self.gimmicks.flush(remaining()),
        ];
        results.iter().all(|ok| *ok)
    }

    #[must_use]
    pub fn stats(&self) -> WorldStats {
        let stores = BTreeMap::from([
            (self.agents.kind(), self.agents.stats()),
            (self.users.kind(), self.users.stats()),
            (self.locations.kind(), self.locations.stats()),
            (self.inventories.kind(), self.inventories.stats()),
            (self.gimmicks.kind(), self.gimmicks.stats()),
        ]);
        WorldStats {
            stores,
            metrics: global_metrics().storage.snapshot(),
        }
    }

    /// Sweep stale temp files from every store directory.
    pub fn sweep_temp_files(&self) -> Result<usize> {
        Ok(self.agents.sweep_temp_files()?
            + self.users.sweep_temp_files()?
            + self.locations.sweep_temp_files()?
            + self.inventories.sweep_temp_files()?
            + self.gimmicks.sweep_temp_files()?)
    }

    /// Sorted ids of `kind`, or `None` for an unknown kind.
    #[must_use]
    pub fn ids_of(&self, kind: &str) -> Option<Vec<String>> {
        match kind {
            k if k == Agent::KIND => Some(self.agents.ids()),
            k if k == User::KIND => Some(self.users.ids()),
            k if k == Location::KIND => Some(self.locations.ids()),
            k if k == Inventory::KIND => Some(self.inventories.ids()),
            k if k == Gimmick::KIND => Some(self.gimmicks.ids()),
            _ => None,
        }
    }

    /// Record `kind/id` as JSON. `Ok(None)` for an unknown kind, `NotFound`
    /// for an unknown id.
    pub fn record_json(&self, kind: &str, id: &str) -> Result<Option<serde_json::Value>> {
        fn to_json<R: Record>(store: &EntityStore<R>, id: &str) -> Result<serde_json::Value> {
            let record = store.get(id).ok_or_else(|| StorageError::NotFound {
                kind: R::KIND,
                id: id.to_string(),
            })?;
            Ok(serde_json::to_value(record)?)
        }

        let value = match kind {
            k if k == Agent::KIND => to_json(&self.agents, id)?,
            k if k == User::KIND => to_json(&self.users, id)?,
            k if k == Location::KIND => to_json(&self.locations, id)?,
            k if k == Inventory::KIND => to_json(&self.inventories, id)?,
            k if k == Gimmick::KIND => to_json(&self.gimmicks, id)?,
            _ => return Ok(None),
        };
        Ok(Some(value))
    }
}
