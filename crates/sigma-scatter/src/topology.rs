//! Self-referential topology: the content's own prefix seeds its layout.
//!
//! The seed is a keyed hash of the first (up to) 32 bytes of the content. It
//! shifts every axis of every shard of the file, and is recorded so gather can
//! check the reassembled prefix against it.

use sigma_core::config::AXIS_COUNT;
use sigma_crypto::ct::ct_eq_32;

use crate::keys::ScatterKeys;

/// Bytes of content prefix that feed the seed.
pub const SEED_PREFIX_LEN: usize = 32;

pub type TopologySeed = [u8; 32];

pub fn seed(keys: &ScatterKeys, content: &[u8]) -> TopologySeed {
    let prefix = &content[..content.len().min(SEED_PREFIX_LEN)];
    let mut hasher = blake3::Hasher::new_keyed(&keys.topology);
    hasher.update(&(prefix.len() as u8).to_be_bytes());
    hasher.update(prefix);
    *hasher.finalize().as_bytes()
}

/// Per-axis offsets: four seed bytes per axis, big-endian.
pub fn offsets(seed: &TopologySeed) -> [u64; AXIS_COUNT] {
    let mut out = [0u64; AXIS_COUNT];
    for (o, bytes) in out.iter_mut().zip(seed.chunks_exact(4)) {
        *o = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as u64;
    }
    out
}

/// Constant-time check of a reassembled prefix against the recorded seed.
pub fn verify(keys: &ScatterKeys, content: &[u8], expected: &TopologySeed) -> bool {
    ct_eq_32(&seed(keys, content), expected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sigma_crypto::KeyState;

    fn keys() -> ScatterKeys {
        ScatterKeys::derive(&KeyState::from_master_bytes([8u8; 64])).unwrap()
    }

    #[test]
    fn test_seed_uses_prefix_only() {
        let k = keys();
        let mut a = vec![7u8; 100];
        let b = a.clone();
        a[50] = 0;
        assert_eq!(seed(&k, &a), seed(&k, &b));
        a[31] = 0;
        assert_ne!(seed(&k, &a), seed(&k, &b));
    }

    #[test]
    fn test_short_and_empty_content() {
        let k = keys();
        assert_ne!(seed(&k, b""), seed(&k, b"\0"));
        assert!(verify(&k, b"", &seed(&k, b"")));
        assert!(verify(&k, b"abc", &seed(&k, b"abc")));
        assert!(!verify(&k, b"abd", &seed(&k, b"abc")));
    }

    #[test]
    fn test_offsets_spread_seed() {
        let mut s = [0u8; 32];
        s[3] = 1;
        s[31] = 2;
        let o = offsets(&s);
        assert_eq!(o[0], 1);
        assert_eq!(o[7], 2);
        assert!(o[1..7].iter().all(|v| *v == 0));
    }
}
