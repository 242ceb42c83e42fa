//! Scatter sub-keys: master key → independent per-purpose keys

use hkdf::Hkdf;
use sha2::Sha512;
use sigma_core::{SigmaError, SigmaResult};
use sigma_crypto::KeyState;
use zeroize::{Zeroize, ZeroizeOnDrop};

pub const SUBKEY_SIZE: usize = 32;

/// Keys for each scatter concern, expanded from the master key with
/// HKDF-SHA512 under distinct info strings. Zeroized on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct ScatterKeys {
    pub(crate) coord: [u8; SUBKEY_SIZE],
    pub(crate) temporal: [u8; SUBKEY_SIZE],
    pub(crate) entropy: [u8; SUBKEY_SIZE],
    pub(crate) ratio: [u8; SUBKEY_SIZE],
    pub(crate) topology: [u8; SUBKEY_SIZE],
    pub(crate) checksum: [u8; SUBKEY_SIZE],
    pub(crate) record: [u8; SUBKEY_SIZE],
}

impl ScatterKeys {
    pub fn derive(state: &KeyState) -> SigmaResult<Self> {
        let hkdf = Hkdf::<Sha512>::new(None, state.master_key().as_bytes());
        Ok(Self {
            coord: hkdf_expand(&hkdf, b"sigma-scatter-coord")?,
            temporal: hkdf_expand(&hkdf, b"sigma-scatter-temporal")?,
            entropy: hkdf_expand(&hkdf, b"sigma-scatter-entropy")?,
            ratio: hkdf_expand(&hkdf, b"sigma-scatter-ratio")?,
            topology: hkdf_expand(&hkdf, b"sigma-scatter-topology")?,
            checksum: hkdf_expand(&hkdf, b"sigma-scatter-checksum")?,
            record: hkdf_expand(&hkdf, b"sigma-scatter-record")?,
        })
    }
}

fn hkdf_expand(hkdf: &Hkdf<Sha512>, info: &[u8]) -> SigmaResult<[u8; SUBKEY_SIZE]> {
    let mut okm = [0u8; SUBKEY_SIZE];
    hkdf.expand(info, &mut okm)
        .map_err(|e| SigmaError::Other(anyhow::anyhow!("HKDF expand failed: {e}")))?;
    Ok(okm)
}

impl std::fmt::Debug for ScatterKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScatterKeys").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subkeys_independent() {
        let keys = ScatterKeys::derive(&KeyState::from_master_bytes([3u8; 64])).unwrap();
        let all = [
            keys.coord,
            keys.temporal,
            keys.entropy,
            keys.ratio,
            keys.topology,
            keys.checksum,
            keys.record,
        ];
        for i in 0..all.len() {
            for j in (i + 1)..all.len() {
                assert_ne!(all[i], all[j]);
            }
        }
    }

    #[test]
    fn test_subkeys_follow_master() {
        let a = ScatterKeys::derive(&KeyState::from_master_bytes([1u8; 64])).unwrap();
        let b = ScatterKeys::derive(&KeyState::from_master_bytes([1u8; 64])).unwrap();
        let c = ScatterKeys::derive(&KeyState::from_master_bytes([2u8; 64])).unwrap();
        assert_eq!(a.coord, b.coord);
        assert_ne!(a.coord, c.coord);
    }
}
