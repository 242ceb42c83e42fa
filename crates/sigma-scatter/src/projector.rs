//! Dimensional projection: (file, shard sequence number) → 8-axis coordinate
//!
//! ```text
//! coord[d] = (H(k_coord, d, file_id) + o + topo[d] + temporal[d]) mod axis_size[d]
//! ```
//!
//! Everything except `o` is fixed per file and bucket, so the per-file base is
//! computed once and each shard costs eight `u128` additions and reductions.
//! For a fixed base, `o ↦ coord[d]` is a bijection on each axis.

use serde::{Deserialize, Serialize};
use sigma_core::config::{AXIS_COUNT, DEFAULT_AXIS_SIZES};
use sigma_core::{FileId, SigmaError, SigmaResult};

use crate::keys::ScatterKeys;

/// The eight projection axes, in coordinate order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Axis {
    Spatial,
    Temporal,
    Entropic,
    Semantic,
    Fractal,
    Phase,
    Topological,
    Holographic,
}

impl Axis {
    pub const ALL: [Axis; AXIS_COUNT] = [
        Axis::Spatial,
        Axis::Temporal,
        Axis::Entropic,
        Axis::Semantic,
        Axis::Fractal,
        Axis::Phase,
        Axis::Topological,
        Axis::Holographic,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            Axis::Spatial => "spatial",
            Axis::Temporal => "temporal",
            Axis::Entropic => "entropic",
            Axis::Semantic => "semantic",
            Axis::Fractal => "fractal",
            Axis::Phase => "phase",
            Axis::Topological => "topological",
            Axis::Holographic => "holographic",
        }
    }
}

/// A point in the 8-axis address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DimensionalCoordinate(pub [u64; AXIS_COUNT]);

impl DimensionalCoordinate {
    pub const ENCODED_LEN: usize = AXIS_COUNT * 8;

    pub fn get(&self, axis: Axis) -> u64 {
        self.0[axis.index()]
    }

    /// Big-endian, axis order.
    pub fn to_bytes(&self) -> [u8; Self::ENCODED_LEN] {
        let mut out = [0u8; Self::ENCODED_LEN];
        for (chunk, v) in out.chunks_exact_mut(8).zip(self.0.iter()) {
            chunk.copy_from_slice(&v.to_be_bytes());
        }
        out
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.to_bytes())
    }
}

impl std::fmt::Display for DimensionalCoordinate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("(")?;
        for (i, v) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{v}")?;
        }
        f.write_str(")")
    }
}

/// Per-axis moduli. Each must be at least 2.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AxisSizes([u64; AXIS_COUNT]);

impl AxisSizes {
    pub fn new(sizes: [u64; AXIS_COUNT]) -> SigmaResult<Self> {
        if let Some((axis, size)) = sizes.iter().enumerate().find(|(_, s)| **s < 2) {
            return Err(SigmaError::config(format!(
                "axis {} size must be >= 2, got {size}",
                Axis::ALL[axis].name()
            )));
        }
        Ok(Self(sizes))
    }

    pub fn get(&self, axis: Axis) -> u64 {
        self.0[axis.index()]
    }

    pub fn as_array(&self) -> &[u64; AXIS_COUNT] {
        &self.0
    }

    /// log2 of the address space size.
    pub fn address_bits(&self) -> f64 {
        self.0.iter().map(|s| (*s as f64).log2()).sum()
    }
}

impl Default for AxisSizes {
    fn default() -> Self {
        Self(DEFAULT_AXIS_SIZES)
    }
}

/// Shard sequence number `chunk_index * shards_per_chunk + shard_index`.
pub fn shard_offset(chunk_index: u64, shards_per_chunk: usize, shard_index: usize) -> SigmaResult<u64> {
    chunk_index
        .checked_mul(shards_per_chunk as u64)
        .and_then(|o| o.checked_add(shard_index as u64))
        .ok_or_else(|| {
            SigmaError::overflow(format!(
                "shard offset for chunk {chunk_index} shard {shard_index} exceeds u64"
            ))
        })
}

#[derive(Debug, Clone)]
pub struct Projector {
    sizes: AxisSizes,
}

impl Projector {
    pub fn new(sizes: AxisSizes) -> Self {
        Self { sizes }
    }

    pub fn sizes(&self) -> &AxisSizes {
        &self.sizes
    }

    /// Fix the per-file terms. `topology` and `temporal` are the per-axis
    /// offsets from the content seed and the time bucket.
    pub fn for_file(
        &self,
        keys: &ScatterKeys,
        file_id: &FileId,
        topology: &[u64; AXIS_COUNT],
        temporal: &[u64; AXIS_COUNT],
    ) -> FileProjection {
        let mut base = [0u64; AXIS_COUNT];
        for axis in Axis::ALL {
            let d = axis.index();
            let size = self.sizes.0[d] as u128;
            let h = axis_hash(keys, axis, file_id) as u128;
            base[d] = ((h + topology[d] as u128 + temporal[d] as u128) % size) as u64;
        }
        FileProjection {
            base,
            sizes: self.sizes,
        }
    }
}

fn axis_hash(keys: &ScatterKeys, axis: Axis, file_id: &FileId) -> u64 {
    let mut hasher = blake3::Hasher::new_keyed(&keys.coord);
    hasher.update(b"axis");
    hasher.update(&[axis.index() as u8]);
    hasher.update(file_id.as_bytes());
    let digest = hasher.finalize();
    let mut word = [0u8; 8];
    word.copy_from_slice(&digest.as_bytes()[..8]);
    u64::from_be_bytes(word)
}

/// Projection with the per-file terms folded in.
#[derive(Debug, Clone)]
pub struct FileProjection {
    base: [u64; AXIS_COUNT],
    sizes: AxisSizes,
}

impl FileProjection {
    pub fn coordinate(&self, offset: u64) -> DimensionalCoordinate {
        let mut coord = [0u64; AXIS_COUNT];
        for (d, c) in coord.iter_mut().enumerate() {
            let size = self.sizes.0[d] as u128;
            *c = ((self.base[d] as u128 + offset as u128) % size) as u64;
        }
        DimensionalCoordinate(coord)
    }
}
