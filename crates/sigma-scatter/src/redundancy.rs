//! Holographic redundancy: systematic Reed–Solomon over GF(2^8).
//!
//! Each chunk becomes `k` data shards followed by `m` parity shards; any `k`
//! of the `k + m` rebuild the rest. The field arithmetic and the decode
//! matrix come from `reed-solomon-erasure`; this wrapper fixes the in-place
//! buffer layout the engine uses and allows `m = 0`.

use reed_solomon_erasure::galois_8;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RedundancyError {
    #[error("invalid shard layout: {0}")]
    Layout(String),

    #[error("only {present} of the {required} required shards are available")]
    TooFewShards { present: usize, required: usize },

    #[error("erasure codec: {0}")]
    Codec(String),
}

impl From<reed_solomon_erasure::Error> for RedundancyError {
    fn from(e: reed_solomon_erasure::Error) -> Self {
        RedundancyError::Codec(format!("{e:?}"))
    }
}

pub struct ReedSolomon {
    data_shards: usize,
    parity_shards: usize,
    /// `None` when there is no parity to compute.
    codec: Option<galois_8::ReedSolomon>,
}

impl std::fmt::Debug for ReedSolomon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReedSolomon")
            .field("data_shards", &self.data_shards)
            .field("parity_shards", &self.parity_shards)
            .finish()
    }
}

impl ReedSolomon {
    pub fn new(data_shards: usize, parity_shards: usize) -> Result<Self, RedundancyError> {
        if data_shards == 0 {
            return Err(RedundancyError::Layout("data_shards must be > 0".into()));
        }
        if data_shards + parity_shards > 255 {
            return Err(RedundancyError::Layout(format!(
                "data_shards + parity_shards must be <= 255, got {}",
                data_shards + parity_shards
            )));
        }
        let codec = match parity_shards {
            0 => None,
            m => Some(galois_8::ReedSolomon::new(data_shards, m)?),
        };
        Ok(Self {
            data_shards,
            parity_shards,
            codec,
        })
    }

    pub fn data_shards(&self) -> usize {
        self.data_shards
    }

    pub fn parity_shards(&self) -> usize {
        self.parity_shards
    }

    pub fn total_shards(&self) -> usize {
        self.data_shards + self.parity_shards
    }

    /// Length of each shard for a chunk of `chunk_len` bytes (never zero).
    pub fn shard_len(&self, chunk_len: usize) -> usize {
        chunk_len.div_ceil(self.data_shards).max(1)
    }

    /// Encode parity in place. `buf` holds all shards back to back; the first
    /// `data_shards * shard_len` bytes are the data, the rest is overwritten.
    pub fn encode(&self, buf: &mut [u8], shard_len: usize) -> Result<(), RedundancyError> {
        if shard_len == 0 || buf.len() != shard_len * self.total_shards() {
            return Err(RedundancyError::Layout(format!(
                "buffer of {} bytes does not hold {} shards of {shard_len}",
                buf.len(),
                self.total_shards()
            )));
        }
        let Some(codec) = &self.codec else {
            return Ok(());
        };
        let mut shards: Vec<&mut [u8]> = buf.chunks_exact_mut(shard_len).collect();
        codec.encode(&mut shards)?;
        Ok(())
    }

    /// Fill every `None` shard from any `data_shards` present ones and return
    /// the indices that were rebuilt.
    pub fn reconstruct(&self, shards: &mut [Option<Vec<u8>>]) -> Result<Vec<usize>, RedundancyError> {
        let n = self.total_shards();
        if shards.len() != n {
            return Err(RedundancyError::Layout(format!(
                "expected {n} shards, got {}",
                shards.len()
            )));
        }
        let missing: Vec<usize> = (0..n).filter(|i| shards[*i].is_none()).collect();
        if missing.is_empty() {
            return Ok(missing);
        }
        let present = n - missing.len();
        let too_few = RedundancyError::TooFewShards {
            present,
            required: self.data_shards,
        };
        let Some(codec) = &self.codec else {
            return Err(too_few);
        };
        if present < self.data_shards {
            return Err(too_few);
        }
        codec.reconstruct(shards).map_err(|e| match e {
            reed_solomon_erasure::Error::TooFewShardsPresent => too_few,
            reed_solomon_erasure::Error::IncorrectShardSize => {
                RedundancyError::Layout("shards differ in length".into())
            }
            other => other.into(),
        })?;
        Ok(missing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_layout_limits() {
        assert!(ReedSolomon::new(0, 2).is_err());
        assert!(ReedSolomon::new(200, 56).is_err());
        assert!(ReedSolomon::new(200, 55).is_ok());
        assert_eq!(ReedSolomon::new(6, 2).unwrap().shard_len(0), 1);
        assert_eq!(ReedSolomon::new(6, 2).unwrap().shard_len(13), 3);
    }

    fn encoded(rs: &ReedSolomon, data: &[u8]) -> (Vec<u8>, usize) {
        let shard_len = rs.shard_len(data.len());
        let mut buf = vec![0u8; shard_len * rs.total_shards()];
        buf[..data.len()].copy_from_slice(data);
        rs.encode(&mut buf, shard_len).unwrap();
        (buf, shard_len)
    }

    #[test]
    fn test_data_shards_stay_systematic() {
        let rs = ReedSolomon::new(4, 2).unwrap();
        let data = b"systematic layout: data comes first";
        let (buf, _) = encoded(&rs, data);
        assert_eq!(&buf[..data.len()], data);
    }

    #[test]
    fn test_every_erasure_pattern_6_2() {
        let rs = ReedSolomon::new(6, 2).unwrap();
        let data: Vec<u8> = (0..600u32).map(|i| (i * 31 % 251) as u8).collect();
        let (buf, shard_len) = encoded(&rs, &data);
        let original: Vec<Vec<u8>> = buf.chunks(shard_len).map(<[u8]>::to_vec).collect();

        for a in 0..8 {
            for b in a..8 {
                let mut shards: Vec<Option<Vec<u8>>> = original.iter().cloned().map(Some).collect();
                shards[a] = None;
                shards[b] = None;
                let repaired = rs.reconstruct(&mut shards).unwrap();
                assert!(repaired.contains(&a) && repaired.contains(&b));
                let got: Vec<Vec<u8>> = shards.into_iter().map(|s| s.unwrap()).collect();
                assert_eq!(got, original, "erasures {a},{b}");
            }
        }
    }

    #[test]
    fn test_too_many_erasures() {
        let rs = ReedSolomon::new(4, 2).unwrap();
        let (buf, shard_len) = encoded(&rs, b"some data to protect");
        let mut shards: Vec<Option<Vec<u8>>> = buf.chunks(shard_len).map(|s| Some(s.to_vec())).collect();
        shards[0] = None;
        shards[2] = None;
        shards[5] = None;
        assert_eq!(
            rs.reconstruct(&mut shards),
            Err(RedundancyError::TooFewShards { present: 3, required: 4 })
        );
    }

    #[test]
    fn test_no_parity_is_passthrough() {
        let rs = ReedSolomon::new(3, 0).unwrap();
        let (buf, _) = encoded(&rs, b"abcdef");
        assert_eq!(&buf, b"abcdef");

        let mut shards = vec![Some(b"ab".to_vec()), None, Some(b"ef".to_vec())];
        assert!(matches!(
            rs.reconstruct(&mut shards),
            Err(RedundancyError::TooFewShards { present: 2, required: 3 })
        ));
    }

    #[test]
    fn test_encode_rejects_bad_buffer() {
        let rs = ReedSolomon::new(2, 1).unwrap();
        let mut buf = vec![0u8; 10];
        assert!(rs.encode(&mut buf, 3).is_err());
    }

    #[test]
    fn test_mismatched_shard_lengths() {
        let rs = ReedSolomon::new(2, 1).unwrap();
        let mut shards = vec![Some(vec![1u8; 4]), Some(vec![2u8; 5]), None];
        assert!(matches!(rs.reconstruct(&mut shards), Err(RedundancyError::Layout(_))));
    }

    proptest! {
        #[test]
        fn prop_reconstruct_any_k(data in proptest::collection::vec(any::<u8>(), 1..2000),
                                  k in 1usize..10, m in 0usize..5, seed in any::<u64>()) {
            let rs = ReedSolomon::new(k, m).unwrap();
            let (buf, shard_len) = encoded(&rs, &data);
            let original: Vec<Vec<u8>> = buf.chunks(shard_len).map(<[u8]>::to_vec).collect();
            let mut shards: Vec<Option<Vec<u8>>> = original.iter().cloned().map(Some).collect();
            // Erase up to m shards chosen from the seed.
            let mut s = seed;
            for _ in 0..m {
                let idx = (s % (k + m) as u64) as usize;
                shards[idx] = None;
                s = s.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            }
            rs.reconstruct(&mut shards).unwrap();
            let got: Vec<Vec<u8>> = shards.into_iter().map(|s| s.unwrap()).collect();
            prop_assert_eq!(got, original);
        }
    }
}
