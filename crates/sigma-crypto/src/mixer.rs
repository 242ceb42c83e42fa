//! Hybrid mixer: device key + user key → 512-bit master key
//!
//! ```text
//! PRK = SHA-512("sigma-hybrid-mixer-v1" ‖ salt ‖ device ‖ user ‖ u64be(|device|) ‖ u64be(|user|))
//! T_r = SHA-512(T_{r-1} ‖ PRK ‖ u32be(r))        r = 1..=rounds, T_0 = ∅
//! master = T_1 ⊕ T_2 ⊕ … ⊕ T_rounds
//! ```

use sha2::{Digest, Sha512};
use sigma_core::config::MixerConfig;
use sigma_core::{SigmaError, SigmaResult};
use zeroize::Zeroizing;

use crate::{MASTER_KEY_SIZE, SALT_SIZE};

const MIXER_DOMAIN: &[u8] = b"sigma-hybrid-mixer-v1";

/// Upper bound on expansion rounds.
pub const MAX_ROUNDS: u32 = 64;

#[derive(Debug, Clone)]
pub struct MixerParams {
    /// Expansion rounds folded into the output (default: 4)
    pub rounds: u32,
}

impl Default for MixerParams {
    fn default() -> Self {
        Self { rounds: 4 }
    }
}

impl TryFrom<&MixerConfig> for MixerParams {
    type Error = SigmaError;

    fn try_from(cfg: &MixerConfig) -> SigmaResult<Self> {
        let params = Self { rounds: cfg.rounds };
        params.validate()?;
        Ok(params)
    }
}

impl MixerParams {
    pub fn validate(&self) -> SigmaResult<()> {
        if self.rounds == 0 || self.rounds > MAX_ROUNDS {
            return Err(SigmaError::config(format!(
                "mixer rounds must be in 1..={MAX_ROUNDS}, got {}",
                self.rounds
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct HybridMixer {
    params: MixerParams,
}

impl HybridMixer {
    pub fn new(params: MixerParams) -> SigmaResult<Self> {
        params.validate()?;
        Ok(Self { params })
    }

    pub fn rounds(&self) -> u32 {
        self.params.rounds
    }

    /// Combine the two key inputs. Either slot may carry the same key when
    /// only one factor participates.
    pub fn mix(
        &self,
        device_key: &[u8],
        user_key: &[u8],
        salt: &[u8; SALT_SIZE],
    ) -> Zeroizing<[u8; MASTER_KEY_SIZE]> {
        let mut hasher = Sha512::new();
        hasher.update(MIXER_DOMAIN);
        hasher.update(salt);
        hasher.update(device_key);
        hasher.update(user_key);
        hasher.update((device_key.len() as u64).to_be_bytes());
        hasher.update((user_key.len() as u64).to_be_bytes());
        let mut prk = Zeroizing::new([0u8; MASTER_KEY_SIZE]);
        prk.copy_from_slice(&hasher.finalize());

        let mut master = Zeroizing::new([0u8; MASTER_KEY_SIZE]);
        let mut prev = Zeroizing::new([0u8; MASTER_KEY_SIZE]);
        for round in 1..=self.params.rounds {
            let mut hasher = Sha512::new();
            if round > 1 {
                hasher.update(&prev[..]);
            }
            hasher.update(&prk[..]);
            hasher.update(round.to_be_bytes());
            prev.copy_from_slice(&hasher.finalize());
            for (m, t) in master.iter_mut().zip(prev.iter()) {
                *m ^= t;
            }
        }
        master
    }
}
