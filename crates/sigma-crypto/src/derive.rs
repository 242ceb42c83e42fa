//! KeyState derivation: fingerprint + user secret → mixer → KeyState

use sigma_core::config::SigmaConfig;
use sigma_core::{SigmaError, SigmaResult};
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::ct::ct_eq_32;
use crate::fingerprint::{Collector, FingerprintSource};
use crate::kdf::{derive_user_key, derive_user_key_pinned, KdfAlgorithm, KdfParams, UserSecret};
use crate::mixer::{HybridMixer, MixerParams};
use crate::state::{KeyMode, KeySalts, KeyState, MasterKey};
use crate::{FINGERPRINT_HASH_SIZE, MASTER_KEY_SIZE};

/// Per-call derivation options.
#[derive(Debug, Clone, Default)]
pub struct DeriveOptions {
    /// Collect and check the fingerprint even when the mode does not mix it in.
    pub device_required: bool,
    /// Fingerprint hash the vault was bound to at creation.
    pub bound_fingerprint: Option<[u8; FINGERPRINT_HASH_SIZE]>,
    /// Re-derive with exactly this KDF instead of choosing one.
    pub pinned_kdf: Option<KdfAlgorithm>,
}

#[derive(Debug, Clone)]
pub struct KeyDeriver {
    kdf: KdfParams,
    mixer: HybridMixer,
    collector: Collector,
}

impl Default for KeyDeriver {
    fn default() -> Self {
        Self {
            kdf: KdfParams::default(),
            mixer: HybridMixer::default(),
            collector: Collector::detect(),
        }
    }
}

impl KeyDeriver {
    pub fn new(kdf: KdfParams, mixer: MixerParams, collector: Collector) -> SigmaResult<Self> {
        Ok(Self {
            kdf,
            mixer: HybridMixer::new(mixer)?,
            collector,
        })
    }

    pub fn from_config(config: &SigmaConfig, collector: Collector) -> SigmaResult<Self> {
        Self::new(
            KdfParams::from(&config.kdf),
            MixerParams::try_from(&config.mixer)?,
            collector,
        )
    }

    pub fn collector(&self) -> &Collector {
        &self.collector
    }

    /// Derive a KeyState.
    ///
    /// When the device participates (or `device_required` is set) and a bound
    /// fingerprint is given, the fresh fingerprint must match it. Without a
    /// bound fingerprint the fresh hash is carried on the result so the caller
    /// can persist the binding.
    pub fn derive(
        &self,
        mode: KeyMode,
        secret: Option<&UserSecret>,
        salts: &KeySalts,
        options: &DeriveOptions,
    ) -> SigmaResult<KeyState> {
        let secret = if mode.uses_secret() {
            match secret {
                Some(s) if !s.is_empty() => Some(s),
                Some(_) => return Err(SigmaError::InvalidSecret("passphrase is empty".into())),
                None => {
                    return Err(SigmaError::InvalidSecret(format!(
                        "{mode} mode requires a user secret"
                    )))
                }
            }
        } else {
            None
        };

        let mut device_key: Option<Zeroizing<[u8; MASTER_KEY_SIZE]>> = None;
        let mut fingerprint_hash = None;
        if mode.uses_device() || options.device_required {
            let fingerprint = self.collector.fingerprint();
            if !fingerprint.has_hardware_ids() {
                warn!(
                    strategy = self.collector.name(),
                    "device fingerprint has no hardware identifiers"
                );
            }
            let hash = fingerprint.hash();
            if !binding_holds(&hash, options.bound_fingerprint.as_ref()) {
                return Err(SigmaError::DeviceBinding);
            }
            if mode.uses_device() {
                device_key = Some(fingerprint.device_key());
            }
            fingerprint_hash = Some(hash);
        }

        let (user_key, kdf) = match secret {
            Some(secret) => {
                let (key, algorithm) = match options.pinned_kdf {
                    Some(algorithm) => (
                        derive_user_key_pinned(secret, &salts.user_salt, &self.kdf, algorithm)?,
                        algorithm,
                    ),
                    None => derive_user_key(secret, &salts.user_salt, &self.kdf)?.into_key()?,
                };
                (Some(key), Some(algorithm))
            }
            None => (None, None),
        };

        let master = match (&device_key, &user_key) {
            (Some(d), Some(u)) => self.mixer.mix(&d[..], &u[..], &salts.mixer_salt),
            (Some(d), None) => self.mixer.mix(&d[..], &d[..], &salts.mixer_salt),
            (None, Some(u)) => self.mixer.mix(&u[..], &u[..], &salts.mixer_salt),
            (None, None) => {
                return Err(SigmaError::InvalidSecret(
                    "no key material for the requested mode".into(),
                ))
            }
        };
        debug!(%mode, rounds = self.mixer.rounds(), "hybrid mixer complete");
        info!(%mode, kdf = ?kdf, device_bound = fingerprint_hash.is_some(), "key state derived");

        Ok(KeyState::new(
            MasterKey::from_bytes(*master),
            mode,
            *salts,
            kdf,
            fingerprint_hash,
            sigma_core::unix_now(),
        ))
    }
}

/// Derive a KeyState with default parameters and the detected collector.
pub fn derive_key(
    mode: KeyMode,
    secret: Option<&UserSecret>,
    salts: &KeySalts,
) -> SigmaResult<KeyState> {
    KeyDeriver::default().derive(mode, secret, salts, &DeriveOptions::default())
}

/// One constant-time compare runs whether or not the vault is bound, so an
/// unbound unlock does not finish measurably faster.
fn binding_holds(hash: &[u8; FINGERPRINT_HASH_SIZE], bound: Option<&[u8; FINGERPRINT_HASH_SIZE]>) -> bool {
    let dummy = [0u8; FINGERPRINT_HASH_SIZE];
    let matched = std::hint::black_box(ct_eq_32(hash, bound.unwrap_or(&dummy)));
    bound.is_none() || matched
}
