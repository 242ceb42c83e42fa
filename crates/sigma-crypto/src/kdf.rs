//! User key derivation: passphrase (+ optional factors) → 512-bit user key
//!
//! Argon2id is the primary function. PBKDF2-HMAC-SHA512 is the one permitted
//! degradation, used when Argon2id is compiled out, rejects its parameters,
//! or the deployment asks for it. The caller always learns which one ran.

use secrecy::{ExposeSecret, SecretSlice, SecretString};
use serde::{Deserialize, Serialize};
use sha2::Sha512;
use sigma_core::config::KdfConfig;
use sigma_core::{SigmaError, SigmaResult};
use tracing::warn;
use zeroize::Zeroizing;

use crate::{MASTER_KEY_SIZE, SALT_SIZE};

/// 512-bit KDF output, zeroized on drop.
pub type UserKey = Zeroizing<[u8; MASTER_KEY_SIZE]>;

/// What the user knows: a passphrase plus optional labelled factors
/// (key file contents, hardware token response, ...).
pub struct UserSecret {
    passphrase: SecretString,
    factors: Vec<(String, SecretSlice<u8>)>,
}

impl UserSecret {
    pub fn new(passphrase: SecretString) -> Self {
        Self {
            passphrase,
            factors: Vec::new(),
        }
    }

    pub fn from_passphrase(passphrase: &str) -> Self {
        Self::new(SecretString::from(passphrase))
    }

    /// Add an auxiliary factor. Factor order matters.
    pub fn with_factor(mut self, label: impl Into<String>, bytes: Vec<u8>) -> Self {
        self.factors.push((label.into(), SecretSlice::from(bytes)));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.passphrase.expose_secret().is_empty()
    }

    /// Length-prefixed KDF input: passphrase, then each factor as
    /// `label, bytes`.
    fn kdf_input(&self) -> Zeroizing<Vec<u8>> {
        let mut out = Zeroizing::new(Vec::new());
        put(&mut out, self.passphrase.expose_secret().as_bytes());
        for (label, bytes) in &self.factors {
            put(&mut out, label.as_bytes());
            put(&mut out, bytes.expose_secret());
        }
        out
    }
}

impl std::fmt::Debug for UserSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserSecret")
            .field("passphrase", &"[REDACTED]")
            .field(
                "factors",
                &self.factors.iter().map(|(l, _)| l.as_str()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

fn put(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    out.extend_from_slice(bytes);
}

/// KDF cost parameters
#[derive(Debug, Clone)]
pub struct KdfParams {
    /// Memory cost in KiB (default: 65536 = 64 MiB)
    pub mem_cost_kib: u32,
    /// Time cost / iterations (default: 3)
    pub time_cost: u32,
    /// Parallelism (default: 4)
    pub parallelism: u32,
    /// PBKDF2 iterations for the fallback (default: 600000)
    pub pbkdf2_rounds: u32,
    /// Skip Argon2id entirely
    pub prefer_fallback: bool,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self::from(&KdfConfig::default())
    }
}

impl From<&KdfConfig> for KdfParams {
    fn from(cfg: &KdfConfig) -> Self {
        Self {
            mem_cost_kib: cfg.argon2_mem_cost_kib,
            time_cost: cfg.argon2_time_cost,
            parallelism: cfg.argon2_parallelism,
            pbkdf2_rounds: cfg.pbkdf2_rounds,
            prefer_fallback: cfg.prefer_fallback,
        }
    }
}

/// Which function produced a user key. Recorded in the vault header so
/// unlock re-derives with the same one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KdfAlgorithm {
    Argon2id,
    Pbkdf2Sha512,
}

impl KdfAlgorithm {
    pub fn code(self) -> u8 {
        match self {
            KdfAlgorithm::Argon2id => 1,
            KdfAlgorithm::Pbkdf2Sha512 => 2,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(KdfAlgorithm::Argon2id),
            2 => Some(KdfAlgorithm::Pbkdf2Sha512),
            _ => None,
        }
    }
}

impl std::fmt::Display for KdfAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KdfAlgorithm::Argon2id => f.write_str("argon2id"),
            KdfAlgorithm::Pbkdf2Sha512 => f.write_str("pbkdf2-sha512"),
        }
    }
}

/// Result of a user key derivation.
pub enum KdfOutcome {
    Primary(UserKey),
    Fallback { key: UserKey, reason: String },
    Unavailable(String),
}

impl KdfOutcome {
    pub fn algorithm(&self) -> Option<KdfAlgorithm> {
        match self {
            KdfOutcome::Primary(_) => Some(KdfAlgorithm::Argon2id),
            KdfOutcome::Fallback { .. } => Some(KdfAlgorithm::Pbkdf2Sha512),
            KdfOutcome::Unavailable(_) => None,
        }
    }

    /// Collapse to the key and the algorithm that produced it.
    pub fn into_key(self) -> SigmaResult<(UserKey, KdfAlgorithm)> {
        match self {
            KdfOutcome::Primary(key) => Ok((key, KdfAlgorithm::Argon2id)),
            KdfOutcome::Fallback { key, .. } => Ok((key, KdfAlgorithm::Pbkdf2Sha512)),
            KdfOutcome::Unavailable(reason) => Err(SigmaError::KdfUnavailable(reason)),
        }
    }
}

impl std::fmt::Debug for KdfOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KdfOutcome::Primary(_) => f.write_str("Primary([REDACTED])"),
            KdfOutcome::Fallback { reason, .. } => f
                .debug_struct("Fallback")
                .field("key", &"[REDACTED]")
                .field("reason", reason)
                .finish(),
            KdfOutcome::Unavailable(reason) => f.debug_tuple("Unavailable").field(reason).finish(),
        }
    }
}

/// Derive the user key, preferring Argon2id and falling back to PBKDF2.
///
/// An empty passphrase is rejected before any work is done.
pub fn derive_user_key(
    secret: &UserSecret,
    salt: &[u8; SALT_SIZE],
    params: &KdfParams,
) -> SigmaResult<KdfOutcome> {
    if secret.is_empty() {
        return Err(SigmaError::InvalidSecret("passphrase is empty".into()));
    }
    let input = secret.kdf_input();

    let reason = if params.prefer_fallback {
        "fallback preferred by configuration".to_string()
    } else {
        match argon2id(&input, salt, params) {
            Ok(key) => return Ok(KdfOutcome::Primary(key)),
            Err(reason) => reason,
        }
    };

    match pbkdf2_sha512(&input, salt, params.pbkdf2_rounds) {
        Ok(key) => {
            warn!(%reason, rounds = params.pbkdf2_rounds, "using PBKDF2-HMAC-SHA512 fallback KDF");
            Ok(KdfOutcome::Fallback { key, reason })
        }
        Err(fallback_reason) => Ok(KdfOutcome::Unavailable(format!(
            "{reason}; {fallback_reason}"
        ))),
    }
}

/// Derive with exactly the given algorithm. Used at unlock, where the vault
/// header names the function that created the key.
pub fn derive_user_key_pinned(
    secret: &UserSecret,
    salt: &[u8; SALT_SIZE],
    params: &KdfParams,
    algorithm: KdfAlgorithm,
) -> SigmaResult<UserKey> {
    if secret.is_empty() {
        return Err(SigmaError::InvalidSecret("passphrase is empty".into()));
    }
    let input = secret.kdf_input();
    let key = match algorithm {
        KdfAlgorithm::Argon2id => argon2id(&input, salt, params),
        KdfAlgorithm::Pbkdf2Sha512 => pbkdf2_sha512(&input, salt, params.pbkdf2_rounds),
    };
    key.map_err(SigmaError::KdfUnavailable)
}

#[cfg(feature = "argon2")]
fn argon2id(input: &[u8], salt: &[u8], params: &KdfParams) -> Result<UserKey, String> {
    use argon2::{Algorithm, Argon2, Params, Version};

    let argon2_params = Params::new(
        params.mem_cost_kib,
        params.time_cost,
        params.parallelism,
        Some(MASTER_KEY_SIZE),
    )
    .map_err(|e| format!("invalid Argon2id params: {e}"))?;

    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, argon2_params);

    let mut key = Zeroizing::new([0u8; MASTER_KEY_SIZE]);
    argon2
        .hash_password_into(input, salt, &mut key[..])
        .map_err(|e| format!("Argon2id KDF failed: {e}"))?;
    Ok(key)
}

#[cfg(not(feature = "argon2"))]
fn argon2id(_input: &[u8], _salt: &[u8], _params: &KdfParams) -> Result<UserKey, String> {
    Err("Argon2id support not compiled in".into())
}

fn pbkdf2_sha512(input: &[u8], salt: &[u8], rounds: u32) -> Result<UserKey, String> {
    if rounds == 0 {
        return Err("PBKDF2 rounds must be > 0".into());
    }
    let mut key = Zeroizing::new([0u8; MASTER_KEY_SIZE]);
    pbkdf2::pbkdf2_hmac::<Sha512>(input, salt, rounds, &mut key[..]);
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_params() -> KdfParams {
        KdfParams {
            mem_cost_kib: 1024,
            time_cost: 1,
            parallelism: 1,
            pbkdf2_rounds: 1000,
            prefer_fallback: false,
        }
    }

    #[test]
    fn test_kdf_deterministic() {
        let secret = UserSecret::from_passphrase("test-passphrase-123");
        let salt = [1u8; SALT_SIZE];

        let (k1, a1) = derive_user_key(&secret, &salt, &fast_params())
            .unwrap()
            .into_key()
            .unwrap();
        let (k2, a2) = derive_user_key(&secret, &salt, &fast_params())
            .unwrap()
            .into_key()
            .unwrap();

        assert_eq!(*k1, *k2, "KDF must be deterministic");
        assert_eq!(a1, a2);
    }

    #[cfg(feature = "argon2")]
    #[test]
    fn test_primary_is_argon2id() {
        let secret = UserSecret::from_passphrase("pw");
        let outcome = derive_user_key(&secret, &[0u8; SALT_SIZE], &fast_params()).unwrap();
        assert_eq!(outcome.algorithm(), Some(KdfAlgorithm::Argon2id));
    }

    #[test]
    fn test_kdf_different_passphrases() {
        let salt = [1u8; SALT_SIZE];
        let a = derive_user_key_pinned(
            &UserSecret::from_passphrase("passphrase-a"),
            &salt,
            &fast_params(),
            KdfAlgorithm::Pbkdf2Sha512,
        )
        .unwrap();
        let b = derive_user_key_pinned(
            &UserSecret::from_passphrase("passphrase-b"),
            &salt,
            &fast_params(),
            KdfAlgorithm::Pbkdf2Sha512,
        )
        .unwrap();
        assert_ne!(*a, *b, "different passphrases must produce different keys");
    }

    #[test]
    fn test_kdf_different_salts() {
        let secret = UserSecret::from_passphrase("same-passphrase");
        let a = derive_user_key_pinned(&secret, &[1u8; SALT_SIZE], &fast_params(), KdfAlgorithm::Pbkdf2Sha512)
            .unwrap();
        let b = derive_user_key_pinned(&secret, &[2u8; SALT_SIZE], &fast_params(), KdfAlgorithm::Pbkdf2Sha512)
            .unwrap();
        assert_ne!(*a, *b, "different salts must produce different keys");
    }

    #[test]
    fn test_factor_changes_key() {
        let salt = [3u8; SALT_SIZE];
        let plain = UserSecret::from_passphrase("pw");
        let with_file = UserSecret::from_passphrase("pw").with_factor("keyfile", vec![1, 2, 3]);
        let a = derive_user_key_pinned(&plain, &salt, &fast_params(), KdfAlgorithm::Pbkdf2Sha512).unwrap();
        let b = derive_user_key_pinned(&with_file, &salt, &fast_params(), KdfAlgorithm::Pbkdf2Sha512).unwrap();
        assert_ne!(*a, *b);
    }

    #[test]
    fn test_empty_passphrase_rejected() {
        let secret = UserSecret::from_passphrase("");
        let err = derive_user_key(&secret, &[0u8; SALT_SIZE], &fast_params()).unwrap_err();
        assert!(matches!(err, SigmaError::InvalidSecret(_)));
    }

    #[test]
    fn test_prefer_fallback_uses_pbkdf2() {
        let params = KdfParams {
            prefer_fallback: true,
            ..fast_params()
        };
        let outcome = derive_user_key(&UserSecret::from_passphrase("pw"), &[0u8; SALT_SIZE], &params).unwrap();
        assert!(matches!(outcome, KdfOutcome::Fallback { .. }));
        assert_eq!(outcome.algorithm(), Some(KdfAlgorithm::Pbkdf2Sha512));
    }

    #[test]
    fn test_rejected_argon2_params_fall_back() {
        // Argon2 requires at least 8 KiB per lane.
        let params = KdfParams {
            mem_cost_kib: 1,
            ..fast_params()
        };
        let outcome = derive_user_key(&UserSecret::from_passphrase("pw"), &[0u8; SALT_SIZE], &params).unwrap();
        match outcome {
            KdfOutcome::Fallback { reason, .. } => assert!(reason.contains("Argon2")),
            other => panic!("expected fallback, got {other:?}"),
        }
    }

    #[test]
    fn test_unavailable_when_nothing_can_run() {
        let params = KdfParams {
            prefer_fallback: true,
            pbkdf2_rounds: 0,
            ..fast_params()
        };
        let outcome = derive_user_key(&UserSecret::from_passphrase("pw"), &[0u8; SALT_SIZE], &params).unwrap();
        assert!(matches!(outcome, KdfOutcome::Unavailable(_)));
        assert!(matches!(outcome.into_key(), Err(SigmaError::KdfUnavailable(_))));
    }

    #[test]
    fn test_pinned_matches_outcome() {
        let secret = UserSecret::from_passphrase("pin me");
        let salt = [9u8; SALT_SIZE];
        let (key, alg) = derive_user_key(&secret, &salt, &fast_params())
            .unwrap()
            .into_key()
            .unwrap();
        let again = derive_user_key_pinned(&secret, &salt, &fast_params(), alg).unwrap();
        assert_eq!(*key, *again);
    }

    #[test]
    fn test_algorithm_codes() {
        for alg in [KdfAlgorithm::Argon2id, KdfAlgorithm::Pbkdf2Sha512] {
            assert_eq!(KdfAlgorithm::from_code(alg.code()), Some(alg));
        }
        assert_eq!(KdfAlgorithm::from_code(0), None);
    }

    #[test]
    fn test_debug_redacts() {
        let secret = UserSecret::from_passphrase("hunter2").with_factor("yubikey", vec![0xAA]);
        let dbg = format!("{secret:?}");
        assert!(!dbg.contains("hunter2"));
        assert!(dbg.contains("yubikey"));
    }
}
