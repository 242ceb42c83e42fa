//! Metadata of a scattered file and the results of gathering it.

use serde::{Deserialize, Serialize};
use sigma_core::FileId;

use crate::entropy::EntropyParams;
use crate::projector::DimensionalCoordinate;
use crate::store::ShardHandle;
use crate::topology::TopologySeed;

/// Where one shard lives and what its bytes must hash to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardRef {
    pub handle: ShardHandle,
    pub checksum: [u8; 32],
}

/// Everything needed (besides the key) to gather a file back.
///
/// Shards are laid out chunk-major: chunk `c`, shard `s` is at index
/// `c * shards_per_chunk() + s` in both `shard_coordinates` and `shard_refs`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScatteredFile {
    pub file_id: FileId,
    pub original_len: u64,
    pub chunk_size: u32,
    pub data_shards: u8,
    pub parity_shards: u8,
    pub temporal_bucket: u64,
    pub topology_seed: TopologySeed,
    pub entropy: EntropyParams,
    pub shard_coordinates: Vec<DimensionalCoordinate>,
    pub shard_refs: Vec<ShardRef>,
}

impl ScatteredFile {
    pub fn shards_per_chunk(&self) -> usize {
        self.data_shards as usize + self.parity_shards as usize
    }

    pub fn chunk_count(&self) -> u64 {
        if self.chunk_size == 0 {
            return 0;
        }
        self.original_len.div_ceil(self.chunk_size as u64)
    }

    /// Plaintext length of chunk `index`.
    pub fn chunk_len(&self, index: u64) -> usize {
        let start = index.saturating_mul(self.chunk_size as u64);
        self.original_len
            .saturating_sub(start)
            .min(self.chunk_size as u64) as usize
    }

    /// Shard refs of one chunk.
    pub fn chunk_refs(&self, index: u64) -> &[ShardRef] {
        let n = self.shards_per_chunk();
        let start = (index as usize).saturating_mul(n).min(self.shard_refs.len());
        let end = start.saturating_add(n).min(self.shard_refs.len());
        &self.shard_refs[start..end]
    }

    /// Structural consistency of the shard tables.
    pub fn is_consistent(&self) -> bool {
        let expected = self.chunk_count().saturating_mul(self.shards_per_chunk() as u64);
        self.data_shards > 0
            && self.shard_refs.len() as u64 == expected
            && self.shard_coordinates.len() == self.shard_refs.len()
    }
}

/// Gather succeeded only after rebuilding some shards from parity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartialIntegrity {
    pub file_id: FileId,
    /// Global indices (into `shard_refs`) of the shards that were rebuilt.
    pub repaired: Vec<usize>,
}

#[derive(Debug)]
pub struct GatherOutput {
    pub data: Vec<u8>,
    pub partial: Option<PartialIntegrity>,
}
