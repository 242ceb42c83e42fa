//! Temporal variance: coordinates drift with a time bucket.

use sigma_core::config::AXIS_COUNT;
use sigma_core::{SigmaError, SigmaResult};

use crate::keys::ScatterKeys;

#[derive(Debug, Clone, Copy)]
pub struct TemporalVariance {
    interval_secs: u64,
}

impl TemporalVariance {
    pub fn new(interval_secs: u64) -> SigmaResult<Self> {
        if interval_secs == 0 {
            return Err(SigmaError::config("reshuffle interval must be > 0"));
        }
        Ok(Self { interval_secs })
    }

    pub fn interval_secs(&self) -> u64 {
        self.interval_secs
    }

    pub fn bucket(&self, now: u64) -> u64 {
        now / self.interval_secs
    }

    /// A file recorded under `recorded_bucket` is due for re-scatter once the
    /// clock has moved into a later bucket.
    pub fn is_due(&self, recorded_bucket: u64, now: u64) -> bool {
        self.bucket(now) != recorded_bucket
    }
}

/// Per-axis modifiers for a bucket.
pub fn modifiers(keys: &ScatterKeys, bucket: u64) -> [u64; AXIS_COUNT] {
    let mut hasher = blake3::Hasher::new_keyed(&keys.temporal);
    hasher.update(&bucket.to_be_bytes());
    let mut raw = [0u8; AXIS_COUNT * 8];
    hasher.finalize_xof().fill(&mut raw);
    let mut out = [0u64; AXIS_COUNT];
    for (m, bytes) in out.iter_mut().zip(raw.chunks_exact(8)) {
        let mut word = [0u8; 8];
        word.copy_from_slice(bytes);
        *m = u64::from_be_bytes(word);
    }
    out
}
