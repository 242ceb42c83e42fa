//! Vault session: key state, engine, metadata index and content cache.
//!
//! Lock order, outermost first: per-file lock → metadata → content cache →
//! shard store. No guard is held across a call that takes an earlier lock.
//!
//! Replacing or reshuffling a file writes the new shards first, hands the new
//! layout to the caller's commit hook (where it is persisted), swaps the
//! metadata entry, and only then deletes the old shards. A failure at any step
//! before the delete leaves the previous version readable from both memory and
//! whatever the caller persisted.

use std::collections::{HashMap, VecDeque};
use std::io::Read;
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use sigma_core::{FileId, SigmaError, SigmaResult};
use sigma_crypto::KeyState;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::engine::DimensionalScatterEngine;
use crate::scattered::{GatherOutput, ScatteredFile};

/// Outcome of one reshuffle pass. A failing file does not stop the pass.
#[derive(Debug, Default)]
pub struct ReshufflePass {
    /// Files whose new layout was committed.
    pub moved: Vec<FileId>,
    /// Files left at their old layout, with the reason.
    pub failed: Vec<(FileId, SigmaError)>,
}

impl ReshufflePass {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Plaintext cache with a byte budget; oldest entries are evicted first.
/// Entries are wiped when evicted or dropped.
#[derive(Default)]
struct ContentCache {
    entries: HashMap<FileId, Zeroizing<Vec<u8>>>,
    order: VecDeque<FileId>,
    bytes: usize,
    capacity: usize,
}

impl ContentCache {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            ..Self::default()
        }
    }

    fn get(&self, id: &FileId) -> Option<Vec<u8>> {
        self.entries.get(id).map(|d| d.to_vec())
    }

    fn insert(&mut self, id: FileId, data: &[u8]) {
        self.remove(&id);
        if data.len() > self.capacity {
            return;
        }
        while self.bytes + data.len() > self.capacity {
            match self.order.pop_front() {
                Some(old) => {
                    if let Some(evicted) = self.entries.remove(&old) {
                        self.bytes -= evicted.len();
                    }
                }
                None => break,
            }
        }
        self.bytes += data.len();
        self.entries.insert(id, Zeroizing::new(data.to_vec()));
        self.order.push_back(id);
    }

    fn remove(&mut self, id: &FileId) {
        if let Some(old) = self.entries.remove(id) {
            self.bytes -= old.len();
            self.order.retain(|o| o != id);
        }
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
        self.bytes = 0;
    }
}

pub struct Session {
    state: Arc<KeyState>,
    engine: DimensionalScatterEngine,
    metadata: RwLock<HashMap<FileId, ScatteredFile>>,
    cache: RwLock<ContentCache>,
    file_locks: Mutex<HashMap<FileId, Arc<Mutex<()>>>>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("mode", &self.state.mode())
            .field("files", &self.meta_read().len())
            .finish_non_exhaustive()
    }
}

impl Session {
    /// `cache_bytes` of zero disables the content cache.
    pub fn open(state: Arc<KeyState>, engine: DimensionalScatterEngine, cache_bytes: usize) -> Self {
        info!(mode = %state.mode(), cache_bytes, "session opened");
        Self {
            state,
            engine,
            metadata: RwLock::new(HashMap::new()),
            cache: RwLock::new(ContentCache::with_capacity(cache_bytes)),
            file_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn key_state(&self) -> &Arc<KeyState> {
        &self.state
    }

    pub fn engine(&self) -> &DimensionalScatterEngine {
        &self.engine
    }

    /// Register a previously persisted file without touching its shards.
    pub fn load(&self, file: ScatteredFile) {
        self.meta_write().insert(file.file_id, file);
    }

    pub fn record(&self, id: &FileId) -> Option<ScatteredFile> {
        self.meta_read().get(id).cloned()
    }

    pub fn file_ids(&self) -> Vec<FileId> {
        let mut ids: Vec<FileId> = self.meta_read().keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn store(&self, id: FileId, data: &[u8]) -> SigmaResult<ScatteredFile> {
        self.store_reader(id, data, Some(data.len() as u64))
    }

    /// Scatter a new version of `id`. Concurrent stores of one id are
    /// serialized; different ids proceed in parallel.
    pub fn store_reader<R: Read>(
        &self,
        id: FileId,
        reader: R,
        total_size: Option<u64>,
    ) -> SigmaResult<ScatteredFile> {
        self.store_reader_with(id, reader, total_size, |_| Ok(()))
    }

    /// [`store_reader`](Self::store_reader) with `commit` run on the new
    /// layout once its shards are written and before the previous version's
    /// shards are deleted. If `commit` fails the new shards are discarded and
    /// the previous version stays current.
    pub fn store_reader_with<R, C>(
        &self,
        id: FileId,
        reader: R,
        total_size: Option<u64>,
        commit: C,
    ) -> SigmaResult<ScatteredFile>
    where
        R: Read,
        C: FnOnce(&ScatteredFile) -> SigmaResult<()>,
    {
        let lock = self.file_lock(id);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());

        let file = self
            .engine
            .scatter_reader(&self.state, id, reader, total_size)?;
        if let Err(e) = commit(&file) {
            self.engine.discard(&file, self.engine.params().secure_wipe);
            return Err(e);
        }
        let previous = self.meta_write().insert(id, file.clone());
        self.cache_write().remove(&id);

        if let Some(old) = previous {
            if let Err(e) = self.engine.delete(&old, self.engine.params().secure_wipe) {
                warn!(file = %id, error = %e, "previous version's shards not fully removed");
            }
        }
        debug!(file = %id, bytes = file.original_len, "stored");
        Ok(file)
    }

    pub fn retrieve(&self, id: &FileId) -> SigmaResult<GatherOutput> {
        let lock = self.file_lock(*id);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());

        let file = self.record(id).ok_or_else(|| SigmaError::Gather {
            file_id: *id,
            reason: "unknown file".into(),
        })?;
        if let Some(data) = self.cache_read().get(id) {
            debug!(file = %id, "content cache hit");
            return Ok(GatherOutput { data, partial: None });
        }

        let out = self.engine.gather(&self.state, &file)?;
        if out.partial.is_none() {
            self.cache_write().insert(*id, &out.data);
        }
        Ok(out)
    }

    /// Remove `id` and its shards. Returns false if it was not stored.
    pub fn delete(&self, id: &FileId) -> SigmaResult<bool> {
        let lock = self.file_lock(*id);
        let guard = lock.lock().unwrap_or_else(|e| e.into_inner());

        let Some(file) = self.meta_write().remove(id) else {
            drop(guard);
            self.prune_lock(id, &lock);
            return Ok(false);
        };
        self.cache_write().remove(id);
        let result = self.engine.delete(&file, self.engine.params().secure_wipe);
        drop(guard);
        self.prune_lock(id, &lock);
        result?;
        info!(file = %id, "deleted");
        Ok(true)
    }

    /// Re-scatter every file whose time bucket has expired.
    pub fn reshuffle_due(&self, now: u64) -> ReshufflePass {
        self.reshuffle_due_with(now, |_| Ok(()))
    }

    /// Reshuffle pass with `commit` run on each file's new layout before its
    /// old shards are deleted. A file whose rescatter or commit fails keeps
    /// its old layout and the pass moves on to the next file.
    pub fn reshuffle_due_with<C>(&self, now: u64, mut commit: C) -> ReshufflePass
    where
        C: FnMut(&ScatteredFile) -> SigmaResult<()>,
    {
        let mut pass = ReshufflePass::default();
        for id in self.file_ids() {
            let lock = self.file_lock(id);
            let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());

            let Some(file) = self.record(&id) else {
                continue;
            };
            if !self.engine.temporal().is_due(file.temporal_bucket, now) {
                continue;
            }
            match self.engine.reshuffle_with(&self.state, &file, now, &mut commit) {
                Ok(next) => {
                    self.meta_write().insert(id, next);
                    pass.moved.push(id);
                }
                Err(e) => {
                    warn!(file = %id, error = %e, "reshuffle failed; keeping previous layout");
                    pass.failed.push((id, e));
                }
            }
        }
        if !pass.moved.is_empty() || !pass.failed.is_empty() {
            info!(moved = pass.moved.len(), failed = pass.failed.len(), "reshuffle pass complete");
        }
        pass
    }

    /// End the session: wipe cached plaintext and hand back the metadata.
    pub fn close(self) -> Vec<ScatteredFile> {
        self.cache_write().clear();
        let mut files: Vec<ScatteredFile> = self
            .metadata
            .into_inner()
            .unwrap_or_else(|e| e.into_inner())
            .into_values()
            .collect();
        files.sort_by_key(|f| f.file_id);
        info!(files = files.len(), "session closed");
        files
    }

    fn file_lock(&self, id: FileId) -> Arc<Mutex<()>> {
        Arc::clone(self.file_locks().entry(id).or_default())
    }

    /// Drop `id`'s lock entry unless another caller holds a clone of it.
    fn prune_lock(&self, id: &FileId, lock: &Arc<Mutex<()>>) {
        let mut locks = self.file_locks();
        let ours = locks.get(id).is_some_and(|l| Arc::ptr_eq(l, lock));
        // One reference in the map, one held by the caller.
        if ours && Arc::strong_count(lock) == 2 {
            locks.remove(id);
        }
    }

    #[cfg(test)]
    fn lock_entries(&self) -> usize {
        self.file_locks().len()
    }

    fn file_locks(&self) -> MutexGuard<'_, HashMap<FileId, Arc<Mutex<()>>>> {
        self.file_locks.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn meta_read(&self) -> RwLockReadGuard<'_, HashMap<FileId, ScatteredFile>> {
        self.metadata.read().unwrap_or_else(|e| e.into_inner())
    }

    fn meta_write(&self) -> RwLockWriteGuard<'_, HashMap<FileId, ScatteredFile>> {
        self.metadata.write().unwrap_or_else(|e| e.into_inner())
    }

    fn cache_read(&self) -> RwLockReadGuard<'_, ContentCache> {
        self.cache.read().unwrap_or_else(|e| e.into_inner())
    }

    fn cache_write(&self) -> RwLockWriteGuard<'_, ContentCache> {
        self.cache.write().unwrap_or_else(|e| e.into_inner())
    }
}
