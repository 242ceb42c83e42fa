//! The dimensional scatter engine.
//!
//! Per chunk of input:
//!
//! ```text
//! chunk ──pad──▶ [d0 .. dk-1] ──mix──▶ [m0 .. mk-1] ──RS──▶ [m0 .. mk-1 p0 .. pm-1]
//!                                                              │
//!        coordinate(chunk·n + s) ◀── projection(key, file, topology seed, bucket)
//!                                                              ▼
//!                                                     store.put(coord, shard)
//! ```
//!
//! Gather runs the same pipeline backwards. Shards whose keyed checksum does
//! not match are treated as lost; up to `parity_shards` per chunk are rebuilt.
//!
//! Each scatter, gather or reshuffle takes its whole per-chunk working set
//! from the shared [`MemoryBudget`] once, up front, and carves its buffers
//! from that.

use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Duration;

use rayon::prelude::*;
use sigma_core::config::SigmaConfig;
use sigma_core::{unix_now, FileId, SigmaError, SigmaResult};
use sigma_crypto::ct::ct_eq_32;
use sigma_crypto::KeyState;
use tracing::{debug, info, warn};

use crate::buffer::{BufferLease, MemoryBudget, WorkingSet};
use crate::entropy::{self, EntropyParams, StreamContext};
use crate::keys::ScatterKeys;
use crate::projector::{shard_offset, AxisSizes, DimensionalCoordinate, FileProjection, Projector};
use crate::redundancy::{RedundancyError, ReedSolomon};
use crate::scattered::{GatherOutput, PartialIntegrity, ScatteredFile, ShardRef};
use crate::store::ShardStore;
use crate::stream::StreamingProcessor;
use crate::temporal::{self, TemporalVariance};
use crate::topology::{self, SEED_PREFIX_LEN};

/// Validated engine parameters.
#[derive(Debug, Clone)]
pub struct EngineParams {
    pub chunk_size: usize,
    pub axis_sizes: AxisSizes,
    pub data_shards: usize,
    pub parity_shards: usize,
    pub reshuffle_interval_secs: u64,
    pub entropy: EntropyParams,
    pub memory_ceiling: usize,
    pub backpressure_timeout: Duration,
    pub secure_wipe: bool,
}

impl EngineParams {
    pub fn from_config(cfg: &SigmaConfig) -> SigmaResult<Self> {
        cfg.validate()?;
        let params = Self {
            chunk_size: cfg.engine.chunk_size,
            axis_sizes: AxisSizes::new(cfg.engine.axis_sizes)?,
            data_shards: cfg.redundancy.data_shards as usize,
            parity_shards: cfg.redundancy.parity_shards as usize,
            reshuffle_interval_secs: cfg.temporal.reshuffle_interval_secs,
            entropy: EntropyParams::try_from(&cfg.entropy)?,
            memory_ceiling: cfg.memory.ceiling_bytes(),
            backpressure_timeout: Duration::from_millis(cfg.memory.backpressure_timeout_ms),
            secure_wipe: cfg.vault.secure_wipe,
        };
        params.validate()?;
        Ok(params)
    }

    /// Peak bytes one scatter or gather of a full chunk holds at once.
    pub fn working_set(&self) -> usize {
        working_set_bytes(self.chunk_size, self.data_shards, self.parity_shards)
    }

    pub fn validate(&self) -> SigmaResult<()> {
        // The topology seed is read from the first chunk alone.
        if self.chunk_size < SEED_PREFIX_LEN || u32::try_from(self.chunk_size).is_err() {
            return Err(SigmaError::config(format!(
                "chunk_size must be in {SEED_PREFIX_LEN}..=u32::MAX, got {}",
                self.chunk_size
            )));
        }
        if self.data_shards == 0 || self.data_shards + self.parity_shards > 255 {
            return Err(SigmaError::config(format!(
                "invalid shard layout {}+{}",
                self.data_shards, self.parity_shards
            )));
        }
        self.entropy.validate()?;
        if self.working_set() > self.memory_ceiling {
            return Err(SigmaError::config(format!(
                "memory ceiling of {} bytes is below the {} byte working set of one chunk",
                self.memory_ceiling,
                self.working_set()
            )));
        }
        Ok(())
    }
}

impl Default for EngineParams {
    fn default() -> Self {
        Self {
            chunk_size: 1024 * 1024,
            axis_sizes: AxisSizes::default(),
            data_shards: 6,
            parity_shards: 2,
            reshuffle_interval_secs: 3600,
            entropy: EntropyParams::default(),
            memory_ceiling: 100 * 1024 * 1024,
            backpressure_timeout: Duration::from_secs(5),
            secure_wipe: true,
        }
    }
}

pub struct DimensionalScatterEngine {
    params: EngineParams,
    store: Arc<dyn ShardStore>,
    budget: Arc<MemoryBudget>,
    rs: ReedSolomon,
    projector: Projector,
    temporal: TemporalVariance,
}

impl std::fmt::Debug for DimensionalScatterEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DimensionalScatterEngine")
            .field("params", &self.params)
            .field("budget", &self.budget)
            .finish_non_exhaustive()
    }
}

impl DimensionalScatterEngine {
    pub fn new(params: EngineParams, store: Arc<dyn ShardStore>) -> SigmaResult<Self> {
        params.validate()?;
        let rs = ReedSolomon::new(params.data_shards, params.parity_shards)
            .map_err(|e| SigmaError::config(e.to_string()))?;
        let budget = MemoryBudget::new(params.memory_ceiling);
        Ok(Self {
            projector: Projector::new(params.axis_sizes),
            temporal: TemporalVariance::new(params.reshuffle_interval_secs)?,
            params,
            store,
            budget,
            rs,
        })
    }

    pub fn from_config(cfg: &SigmaConfig, store: Arc<dyn ShardStore>) -> SigmaResult<Self> {
        Self::new(EngineParams::from_config(cfg)?, store)
    }

    pub fn params(&self) -> &EngineParams {
        &self.params
    }

    pub fn budget(&self) -> &Arc<MemoryBudget> {
        &self.budget
    }

    pub fn store(&self) -> &Arc<dyn ShardStore> {
        &self.store
    }

    pub fn temporal(&self) -> &TemporalVariance {
        &self.temporal
    }

    pub fn scatter(&self, state: &KeyState, file_id: FileId, data: &[u8]) -> SigmaResult<ScatteredFile> {
        self.scatter_at(state, file_id, data, unix_now())
    }

    pub fn scatter_at(
        &self,
        state: &KeyState,
        file_id: FileId,
        data: &[u8],
        now: u64,
    ) -> SigmaResult<ScatteredFile> {
        self.scatter_reader_at(state, file_id, data, Some(data.len() as u64), now)
    }

    pub fn scatter_reader<R: Read>(
        &self,
        state: &KeyState,
        file_id: FileId,
        reader: R,
        total_size: Option<u64>,
    ) -> SigmaResult<ScatteredFile> {
        self.scatter_reader_at(state, file_id, reader, total_size, unix_now())
    }

    /// Stream `reader` into shards. Only one chunk of input is resident at a
    /// time. On failure every shard already written is deleted again.
    pub fn scatter_reader_at<R: Read>(
        &self,
        state: &KeyState,
        file_id: FileId,
        reader: R,
        total_size: Option<u64>,
        now: u64,
    ) -> SigmaResult<ScatteredFile> {
        let keys = ScatterKeys::derive(state)?;
        let bucket = self.temporal.bucket(now);
        let mut file = ScatteredFile {
            file_id,
            original_len: 0,
            chunk_size: self.params.chunk_size as u32,
            data_shards: self.params.data_shards as u8,
            parity_shards: self.params.parity_shards as u8,
            temporal_bucket: bucket,
            topology_seed: topology::seed(&keys, &[]),
            entropy: self.params.entropy,
            shard_coordinates: Vec::new(),
            shard_refs: Vec::new(),
        };
        let mut projection: Option<FileProjection> = None;

        let ws = self.budget.working_set(self.params.working_set(), self.params.backpressure_timeout)?;
        let stream = StreamingProcessor::new(
            self.params.chunk_size,
            Arc::clone(ws.budget()),
            self.params.backpressure_timeout,
        );
        let result = stream.for_each_chunk(reader, total_size, |index, chunk| {
            if index == 0 {
                // chunk_size >= SEED_PREFIX_LEN, so this is the whole prefix.
                file.topology_seed = topology::seed(&keys, chunk);
            }
            let projection = projection.get_or_insert_with(|| {
                self.projection(&keys, &file_id, &file.topology_seed, bucket)
            });
            self.scatter_chunk(&keys, &self.rs, &ws, &mut file, projection, index, chunk)
        });

        match result {
            Ok(total) => {
                file.original_len = total;
                info!(
                    file = %file_id,
                    bytes = total,
                    shards = file.shard_refs.len(),
                    bucket,
                    "file scattered"
                );
                Ok(file)
            }
            Err(e) => {
                self.discard(&file, self.params.secure_wipe);
                Err(e)
            }
        }
    }

    fn projection(
        &self,
        keys: &ScatterKeys,
        file_id: &FileId,
        seed: &topology::TopologySeed,
        bucket: u64,
    ) -> FileProjection {
        self.projector.for_file(
            keys,
            file_id,
            &topology::offsets(seed),
            &temporal::modifiers(keys, bucket),
        )
    }

    /// Mix, encode and store one chunk, appending its shards to `file`.
    #[allow(clippy::too_many_arguments)]
    fn scatter_chunk(
        &self,
        keys: &ScatterKeys,
        rs: &ReedSolomon,
        ws: &WorkingSet,
        file: &mut ScatteredFile,
        projection: &FileProjection,
        index: u64,
        chunk: &[u8],
    ) -> SigmaResult<()> {
        let file_id = file.file_id;
        let n = rs.total_shards();
        let k = rs.data_shards();
        let shard_len = rs.shard_len(chunk.len());

        let mut work = ws.allocate(n * shard_len)?;
        work[..chunk.len()].copy_from_slice(chunk);

        let coords = (0..n)
            .map(|s| shard_offset(index, n, s).map(|o| projection.coordinate(o)))
            .collect::<SigmaResult<Vec<DimensionalCoordinate>>>()?;
        let anchor = coords[0];
        let weight = entropy::chunk_weight(keys, &file.entropy, &anchor, file.temporal_bucket);
        let ctx = StreamContext {
            file_id: &file_id,
            chunk_index: index,
            anchor: &anchor,
            bucket: file.temporal_bucket,
        };
        entropy::mix_in_place(keys, &ctx, weight, &mut work[..k * shard_len]);
        rs.encode(&mut work, shard_len)
            .map_err(|e| SigmaError::scatter(file_id, e))?;

        let base = file.shard_refs.len() as u64;
        let store = &self.store;
        let written: Vec<std::io::Result<ShardRef>> = work
            .par_chunks(shard_len)
            .zip(coords.par_iter())
            .enumerate()
            .map(|(s, (bytes, coord))| -> std::io::Result<ShardRef> {
                let handle = store.put(coord, bytes)?;
                Ok(ShardRef {
                    handle,
                    checksum: shard_checksum(keys, &file_id, base + s as u64, bytes),
                })
            })
            .collect();

        let mut refs = Vec::with_capacity(n);
        let mut failure = None;
        for r in written {
            match r {
                Ok(r) => refs.push(r),
                Err(e) => failure = failure.or(Some(e)),
            }
        }
        if let Some(e) = failure {
            for r in &refs {
                if let Err(cleanup) = store.delete(&r.handle, self.params.secure_wipe) {
                    warn!(file = %file_id, shard = %r.handle, error = %cleanup, "orphaned shard after failed put");
                }
            }
            return Err(SigmaError::scatter(file_id, e));
        }

        debug!(file = %file_id, chunk = index, len = chunk.len(), shard_len, weight, "chunk scattered");
        file.shard_coordinates.extend(coords);
        file.shard_refs.extend(refs);
        Ok(())
    }

    /// Gather into memory. The output grows chunk by chunk; it is never
    /// sized up front from the record.
    pub fn gather(&self, state: &KeyState, file: &ScatteredFile) -> SigmaResult<GatherOutput> {
        let mut data = Vec::new();
        let partial = self.gather_to_writer(state, file, &mut data)?;
        Ok(GatherOutput { data, partial })
    }

    /// Reassemble `file` chunk by chunk into `writer`.
    pub fn gather_to_writer<W: Write>(
        &self,
        state: &KeyState,
        file: &ScatteredFile,
        mut writer: W,
    ) -> SigmaResult<Option<PartialIntegrity>> {
        let keys = ScatterKeys::derive(state)?;
        let rs = layout_of(file)?;
        let ws = self.file_working_set(file)?;
        let partial = self.gather_chunks(&keys, &rs, &ws, file, |_, chunk| {
            writer.write_all(chunk)?;
            Ok(())
        })?;
        writer.flush()?;
        Ok(partial)
    }

    /// Working set for one chunk of `file`'s recorded layout. A layout too
    /// large for the ceiling fails here, before anything is allocated.
    fn file_working_set(&self, file: &ScatteredFile) -> SigmaResult<WorkingSet> {
        let chunk = file.chunk_len(0).max(1);
        let bytes = working_set_bytes(chunk, file.data_shards as usize, file.parity_shards as usize);
        self.budget.working_set(bytes, self.params.backpressure_timeout)
    }

    fn gather_chunks<F>(
        &self,
        keys: &ScatterKeys,
        rs: &ReedSolomon,
        ws: &WorkingSet,
        file: &ScatteredFile,
        mut sink: F,
    ) -> SigmaResult<Option<PartialIntegrity>>
    where
        F: FnMut(u64, &[u8]) -> SigmaResult<()>,
    {
        let mut repaired = Vec::new();

        if file.original_len == 0 && !topology::verify(keys, &[], &file.topology_seed) {
            return Err(self.topology_mismatch(file));
        }
        for index in 0..file.chunk_count() {
            let chunk = self.gather_chunk(keys, rs, ws, file, index, &mut repaired)?;
            if index == 0 && !topology::verify(keys, &chunk, &file.topology_seed) {
                return Err(self.topology_mismatch(file));
            }
            sink(index, &chunk)?;
        }

        let partial = (!repaired.is_empty()).then(|| PartialIntegrity {
            file_id: file.file_id,
            repaired,
        });
        match &partial {
            Some(p) => warn!(
                file = %file.file_id,
                repaired = p.repaired.len(),
                "file gathered with partial integrity"
            ),
            None => info!(file = %file.file_id, bytes = file.original_len, "file gathered"),
        }
        Ok(partial)
    }

    fn topology_mismatch(&self, file: &ScatteredFile) -> SigmaError {
        SigmaError::Integrity {
            file_id: file.file_id,
            lost: file.shards_per_chunk(),
            tolerated: file.parity_shards as usize,
        }
    }

    /// Fetch, verify, repair and unmix one chunk.
    fn gather_chunk(
        &self,
        keys: &ScatterKeys,
        rs: &ReedSolomon,
        ws: &WorkingSet,
        file: &ScatteredFile,
        index: u64,
        repaired: &mut Vec<usize>,
    ) -> SigmaResult<BufferLease> {
        let file_id = file.file_id;
        let n = rs.total_shards();
        let k = rs.data_shards();
        let tolerated = rs.parity_shards();
        let chunk_len = file.chunk_len(index);
        let shard_len = rs.shard_len(chunk_len);
        let base = usize::try_from(index)
            .ok()
            .and_then(|i| i.checked_mul(n))
            .ok_or_else(|| SigmaError::overflow(format!("chunk index {index} out of range")))?;
        let refs = file.chunk_refs(index);

        let fetch = ws.reserve(n * shard_len)?;
        let store = &self.store;
        let mut shards = refs
            .par_iter()
            .enumerate()
            .map(|(s, r)| -> SigmaResult<Option<Vec<u8>>> {
                let bytes = store
                    .get(&r.handle)
                    .map_err(|e| SigmaError::gather(file_id, e))?;
                Ok(bytes.filter(|b| {
                    b.len() == shard_len
                        && ct_eq_32(
                            &shard_checksum(keys, &file_id, (base + s) as u64, b),
                            &r.checksum,
                        )
                }))
            })
            .collect::<SigmaResult<Vec<Option<Vec<u8>>>>>()?;

        let missing = shards.iter().filter(|s| s.is_none()).count();
        if missing > tolerated {
            return Err(SigmaError::Integrity {
                file_id,
                lost: missing,
                tolerated,
            });
        }
        if missing > 0 {
            let rebuilt = rs.reconstruct(&mut shards).map_err(|e| match e {
                RedundancyError::TooFewShards { present, .. } => SigmaError::Integrity {
                    file_id,
                    lost: n - present,
                    tolerated,
                },
                other => SigmaError::gather(file_id, other),
            })?;
            debug!(file = %file_id, chunk = index, rebuilt = ?rebuilt, "shards rebuilt from parity");
            repaired.extend(rebuilt.into_iter().map(|s| base + s));
        }

        let mut out = ws.allocate(k * shard_len)?;
        for (dst, src) in out.chunks_mut(shard_len).zip(shards.iter()) {
            if let Some(src) = src {
                dst.copy_from_slice(src);
            }
        }
        drop(shards);
        drop(fetch);

        let anchor = file.shard_coordinates[base];
        let weight = entropy::chunk_weight(keys, &file.entropy, &anchor, file.temporal_bucket);
        let ctx = StreamContext {
            file_id: &file_id,
            chunk_index: index,
            anchor: &anchor,
            bucket: file.temporal_bucket,
        };
        entropy::unmix_in_place(keys, &ctx, weight, &mut out);
        out.truncate(chunk_len);
        debug!(file = %file_id, chunk = index, len = chunk_len, "chunk gathered");
        Ok(out)
    }

    /// Re-scatter `file` into the current time bucket if its bucket has
    /// expired. Old shards are deleted only after every new shard is written.
    pub fn reshuffle_if_due(
        &self,
        state: &KeyState,
        file: &ScatteredFile,
        now: u64,
    ) -> SigmaResult<ScatteredFile> {
        self.reshuffle_with(state, file, now, |_| Ok(()))
    }

    /// Like [`reshuffle_if_due`](Self::reshuffle_if_due), with `commit`
    /// called on the new layout after its shards are written and before the
    /// old shards are deleted. If `commit` fails the new shards are discarded
    /// and the old layout stays valid.
    pub fn reshuffle_with<C>(
        &self,
        state: &KeyState,
        file: &ScatteredFile,
        now: u64,
        commit: C,
    ) -> SigmaResult<ScatteredFile>
    where
        C: FnOnce(&ScatteredFile) -> SigmaResult<()>,
    {
        let Some(next) = self.rescatter(state, file, now)? else {
            return Ok(file.clone());
        };
        if let Err(e) = commit(&next) {
            self.discard(&next, self.params.secure_wipe);
            return Err(e);
        }
        if let Err(e) = self.delete(file, self.params.secure_wipe) {
            warn!(file = %file.file_id, error = %e, "old shards not fully removed after reshuffle");
        }
        info!(
            file = %file.file_id,
            from = file.temporal_bucket,
            to = next.temporal_bucket,
            "file reshuffled"
        );
        Ok(next)
    }

    /// Write `file`'s content into the current bucket's layout without
    /// touching the old shards. `None` if the bucket has not expired.
    fn rescatter(&self, state: &KeyState, file: &ScatteredFile, now: u64) -> SigmaResult<Option<ScatteredFile>> {
        if !self.temporal.is_due(file.temporal_bucket, now) {
            return Ok(None);
        }
        let keys = ScatterKeys::derive(state)?;
        let rs = layout_of(file)?;
        let ws = self.file_working_set(file)?;
        let bucket = self.temporal.bucket(now);
        let mut next = ScatteredFile {
            temporal_bucket: bucket,
            shard_coordinates: Vec::with_capacity(file.shard_coordinates.len()),
            shard_refs: Vec::with_capacity(file.shard_refs.len()),
            ..file.clone()
        };
        let projection = self.projection(&keys, &file.file_id, &file.topology_seed, bucket);

        let partial = self.gather_chunks(&keys, &rs, &ws, file, |index, chunk| {
            self.scatter_chunk(&keys, &rs, &ws, &mut next, &projection, index, chunk)
        });
        match partial {
            Ok(Some(_)) => info!(file = %file.file_id, "damaged shards replaced during reshuffle"),
            Ok(None) => {}
            Err(e) => {
                self.discard(&next, self.params.secure_wipe);
                return Err(e);
            }
        }
        Ok(Some(next))
    }

    /// Delete every shard of `file`. Attempts all shards and reports the
    /// first failure.
    pub fn delete(&self, file: &ScatteredFile, wipe: bool) -> SigmaResult<()> {
        let store = &self.store;
        let failures: Vec<std::io::Error> = file
            .shard_refs
            .par_iter()
            .filter_map(|r| store.delete(&r.handle, wipe).err())
            .collect();
        match failures.into_iter().next() {
            Some(e) => Err(SigmaError::scatter(file.file_id, e)),
            None => {
                debug!(file = %file.file_id, shards = file.shard_refs.len(), wipe, "shards deleted");
                Ok(())
            }
        }
    }

    /// Best-effort removal of shards nothing refers to yet.
    pub fn discard(&self, file: &ScatteredFile, wipe: bool) {
        if let Err(e) = self.delete(file, wipe) {
            warn!(file = %file.file_id, error = %e, "cleanup of partially written shards failed");
        }
    }
}

/// `chunk + 2 * n * shard_len`: input chunk plus encode buffer on scatter,
/// fetched shards plus output on gather, and output plus encode buffer on
/// reshuffle all fit.
fn working_set_bytes(chunk_size: usize, data_shards: usize, parity_shards: usize) -> usize {
    let n = data_shards.saturating_add(parity_shards);
    let shard_len = chunk_size.div_ceil(data_shards.max(1)).max(1);
    chunk_size.saturating_add(n.saturating_mul(shard_len).saturating_mul(2))
}

/// Reed-Solomon codec matching a file's recorded layout.
fn layout_of(file: &ScatteredFile) -> SigmaResult<ReedSolomon> {
    if !file.is_consistent() || (file.original_len > 0 && file.chunk_size == 0) {
        return Err(SigmaError::format(format!(
            "inconsistent shard table for file {}",
            file.file_id
        )));
    }
    ReedSolomon::new(file.data_shards as usize, file.parity_shards as usize)
        .map_err(|e| SigmaError::format(e.to_string()))
}

/// Keyed checksum binding shard bytes to their file and position.
fn shard_checksum(keys: &ScatterKeys, file_id: &FileId, index: u64, bytes: &[u8]) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new_keyed(&keys.checksum);
    hasher.update(file_id.as_bytes());
    hasher.update(&index.to_be_bytes());
    hasher.update(bytes);
    *hasher.finalize().as_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryShardStore, ShardHandle};

    fn small_params() -> EngineParams {
        EngineParams {
            chunk_size: 256,
            memory_ceiling: 64 * 1024,
            ..EngineParams::default()
        }
    }

    fn engine() -> (DimensionalScatterEngine, Arc<MemoryShardStore>) {
        let store = Arc::new(MemoryShardStore::new());
        let engine = DimensionalScatterEngine::new(small_params(), store.clone()).unwrap();
        (engine, store)
    }

    fn state(seed: u8) -> KeyState {
        KeyState::from_master_bytes([seed; 64])
    }

    const ID: FileId = FileId::from_bytes([1; 16]);

    #[test]
    fn test_roundtrip_multi_chunk() {
        let (engine, store) = engine();
        let data: Vec<u8> = (0..1000u32).map(|i| (i * 7) as u8).collect();
        let file = engine.scatter_at(&state(1), ID, &data, 10).unwrap();
        assert_eq!(file.chunk_count(), 4);
        assert_eq!(file.shard_refs.len(), 32);
        assert_eq!(store.len(), 32);
        let out = engine.gather(&state(1), &file).unwrap();
        assert_eq!(out.data, data);
        assert!(out.partial.is_none());
        assert_eq!(engine.budget().in_use(), 0);
    }

    #[test]
    fn test_empty_roundtrip() {
        let (engine, store) = engine();
        let file = engine.scatter(&state(1), ID, &[]).unwrap();
        assert_eq!(file.original_len, 0);
        assert!(file.shard_refs.is_empty());
        assert!(store.is_empty());
        assert!(engine.gather(&state(1), &file).unwrap().data.is_empty());
    }

    #[test]
    fn test_wrong_key_is_integrity_failure() {
        let (engine, _) = engine();
        let file = engine.scatter_at(&state(1), ID, b"some content", 0).unwrap();
        let err = engine.gather(&state(2), &file).unwrap_err();
        assert!(matches!(err, SigmaError::Integrity { .. }));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_reshuffle_not_due_is_identity() {
        let (engine, _) = engine();
        let file = engine.scatter_at(&state(1), ID, b"abc", 100).unwrap();
        let same = engine.reshuffle_if_due(&state(1), &file, 200).unwrap();
        assert_eq!(same, file);
    }

    #[test]
    fn test_params_reject_small_ceiling() {
        let params = EngineParams {
            chunk_size: 1024,
            memory_ceiling: 2048,
            ..EngineParams::default()
        };
        assert!(matches!(params.validate(), Err(SigmaError::Config(_))));
    }

    #[test]
    fn test_params_from_default_config() {
        let params = EngineParams::from_config(&SigmaConfig::default()).unwrap();
        assert_eq!(params.chunk_size, 1024 * 1024);
        assert_eq!((params.data_shards, params.parity_shards), (6, 2));
        assert!(params.working_set() <= params.memory_ceiling);
    }

    #[test]
    fn test_inconsistent_record_rejected() {
        let (engine, _) = engine();
        let mut file = engine.scatter_at(&state(1), ID, &[9u8; 300], 0).unwrap();
        file.shard_refs.pop();
        assert!(matches!(engine.gather(&state(1), &file), Err(SigmaError::Format(_))));
    }

    #[test]
    fn test_chunk_size_must_cover_topology_prefix() {
        let params = EngineParams {
            chunk_size: SEED_PREFIX_LEN - 1,
            ..small_params()
        };
        assert!(matches!(params.validate(), Err(SigmaError::Config(_))));
        let params = EngineParams {
            chunk_size: SEED_PREFIX_LEN,
            ..small_params()
        };
        params.validate().unwrap();
    }

    #[test]
    fn test_oversized_record_layout_is_refused() {
        let (engine, _) = engine();
        let mut file = engine.scatter_at(&state(1), ID, &[5u8; 10], 0).unwrap();
        // Still one chunk and a consistent table, but a 4 GiB chunk.
        file.chunk_size = u32::MAX;
        file.original_len = u32::MAX as u64;
        let err = engine.gather(&state(1), &file).unwrap_err();
        assert!(matches!(err, SigmaError::Allocation { .. }), "{err:?}");
        assert_eq!(engine.budget().in_use(), 0);
    }

    /// Fails every put from the `fail_at`-th on.
    struct FlakyStore {
        inner: MemoryShardStore,
        puts: std::sync::atomic::AtomicUsize,
        fail_at: usize,
    }

    impl ShardStore for FlakyStore {
        fn put(&self, coord: &DimensionalCoordinate, bytes: &[u8]) -> std::io::Result<ShardHandle> {
            let n = self.puts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            if n >= self.fail_at {
                return Err(std::io::Error::other("device full"));
            }
            self.inner.put(coord, bytes)
        }

        fn get(&self, handle: &ShardHandle) -> std::io::Result<Option<Vec<u8>>> {
            self.inner.get(handle)
        }

        fn delete(&self, handle: &ShardHandle, wipe: bool) -> std::io::Result<()> {
            self.inner.delete(handle, wipe)
        }
    }

    #[test]
    fn test_failed_put_leaves_no_shards() {
        // Fails inside the second chunk, after the first chunk's shards landed.
        let store = Arc::new(FlakyStore {
            inner: MemoryShardStore::new(),
            puts: Default::default(),
            fail_at: 11,
        });
        let engine = DimensionalScatterEngine::new(small_params(), store.clone()).unwrap();
        let err = engine.scatter_at(&state(1), ID, &[3u8; 1000], 0).unwrap_err();
        assert!(matches!(err, SigmaError::Scatter { .. }));
        assert!(store.inner.is_empty());
        assert_eq!(engine.budget().in_use(), 0);
    }

    #[test]
    fn test_mixed_operations_share_a_one_chunk_ceiling() {
        let params = EngineParams {
            memory_ceiling: small_params().working_set(),
            ..small_params()
        };
        let store = Arc::new(MemoryShardStore::new());
        let engine = DimensionalScatterEngine::new(params, store).unwrap();
        let key = state(1);
        let interval = engine.temporal().interval_secs();

        std::thread::scope(|scope| {
            for t in 0..4u8 {
                let (engine, key) = (&engine, &key);
                scope.spawn(move || {
                    let id = FileId::from_bytes([t; 16]);
                    let data: Vec<u8> = (0..700u32).map(|i| (i as u8) ^ t).collect();
                    for round in 0..5u64 {
                        let file = engine.scatter_at(key, id, &data, round * interval).unwrap();
                        assert_eq!(engine.gather(key, &file).unwrap().data, data);
                        let moved = engine
                            .reshuffle_if_due(key, &file, (round + 1) * interval)
                            .unwrap();
                        assert_eq!(engine.gather(key, &moved).unwrap().data, data);
                        engine.delete(&moved, false).unwrap();
                    }
                });
            }
        });
        assert_eq!(engine.budget().in_use(), 0);
    }
}
