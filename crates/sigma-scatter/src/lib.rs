//! sigma-scatter: dimensional scatter/gather with holographic redundancy
//!
//! # Overview
//! - `projector`: 8-axis coordinate projection keyed by master key, file and bucket
//! - `entropy`: reversible per-byte blending with a keyed entropy stream
//! - `topology`: content prefix seeds the file's own layout
//! - `temporal`: time-bucketed coordinate drift and re-scatter scheduling
//! - `redundancy`: GF(2^8) Reed-Solomon; any `k` of `k + m` shards rebuild a chunk
//! - `buffer` / `stream`: memory-ceiling accounting and fixed-size chunk streaming
//! - `engine`: the scatter/gather/reshuffle pipeline over a [`ShardStore`]
//! - `record`: binary vault header and file records
//! - `session`: key state, metadata index and content cache for one open vault

pub mod buffer;
pub mod engine;
pub mod entropy;
pub mod keys;
pub mod projector;
pub mod record;
pub mod redundancy;
pub mod scattered;
pub mod session;
pub mod store;
pub mod stream;
pub mod temporal;
pub mod topology;

// Convenience re-exports for the most common operations
pub use buffer::{BufferLease, MemoryBudget, WorkingSet};
pub use engine::{DimensionalScatterEngine, EngineParams};
pub use entropy::EntropyParams;
pub use projector::{Axis, AxisSizes, DimensionalCoordinate};
pub use record::{decode_record, encode_record, VaultHeader};
pub use redundancy::ReedSolomon;
pub use scattered::{GatherOutput, PartialIntegrity, ScatteredFile, ShardRef};
pub use session::{ReshufflePass, Session};
pub use store::{DirShardStore, MemoryShardStore, ShardHandle, ShardStore};
pub use stream::StreamingProcessor;
pub use temporal::TemporalVariance;
