//! Derived key state shared by the scatter engine.

use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::kdf::KdfAlgorithm;
use crate::{FINGERPRINT_HASH_SIZE, MASTER_KEY_SIZE, SALT_SIZE};

/// Which factors participate in the master key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyMode {
    Hybrid,
    DeviceOnly,
    UserOnly,
}

impl KeyMode {
    pub fn code(self) -> u8 {
        match self {
            KeyMode::Hybrid => 1,
            KeyMode::DeviceOnly => 2,
            KeyMode::UserOnly => 3,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(KeyMode::Hybrid),
            2 => Some(KeyMode::DeviceOnly),
            3 => Some(KeyMode::UserOnly),
            _ => None,
        }
    }

    pub fn uses_device(self) -> bool {
        matches!(self, KeyMode::Hybrid | KeyMode::DeviceOnly)
    }

    pub fn uses_secret(self) -> bool {
        matches!(self, KeyMode::Hybrid | KeyMode::UserOnly)
    }
}

impl std::fmt::Display for KeyMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeyMode::Hybrid => f.write_str("hybrid"),
            KeyMode::DeviceOnly => f.write_str("device-only"),
            KeyMode::UserOnly => f.write_str("user-only"),
        }
    }
}

impl std::str::FromStr for KeyMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hybrid" => Ok(KeyMode::Hybrid),
            "device-only" | "device" => Ok(KeyMode::DeviceOnly),
            "user-only" | "user" => Ok(KeyMode::UserOnly),
            other => Err(format!("unknown key mode: {other}")),
        }
    }
}

/// Salts persisted in the vault header. Not secret.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeySalts {
    pub user_salt: [u8; SALT_SIZE],
    pub mixer_salt: [u8; SALT_SIZE],
}

impl KeySalts {
    /// Fresh random salts for a new vault.
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let mut user_salt = [0u8; SALT_SIZE];
        let mut mixer_salt = [0u8; SALT_SIZE];
        rng.fill_bytes(&mut user_salt);
        rng.fill_bytes(&mut mixer_salt);
        Self {
            user_salt,
            mixer_salt,
        }
    }
}

/// The 512-bit master key. Zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct MasterKey {
    bytes: [u8; MASTER_KEY_SIZE],
}

impl MasterKey {
    pub fn from_bytes(bytes: [u8; MASTER_KEY_SIZE]) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; MASTER_KEY_SIZE] {
        &self.bytes
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Everything the engine needs from key derivation. Immutable once built.
#[derive(Debug, Clone)]
pub struct KeyState {
    master_key: MasterKey,
    mode: KeyMode,
    salts: KeySalts,
    kdf: Option<KdfAlgorithm>,
    fingerprint_hash: Option<[u8; FINGERPRINT_HASH_SIZE]>,
    creation_time: u64,
}

impl KeyState {
    pub fn new(
        master_key: MasterKey,
        mode: KeyMode,
        salts: KeySalts,
        kdf: Option<KdfAlgorithm>,
        fingerprint_hash: Option<[u8; FINGERPRINT_HASH_SIZE]>,
        creation_time: u64,
    ) -> Self {
        Self {
            master_key,
            mode,
            salts,
            kdf,
            fingerprint_hash,
            creation_time,
        }
    }

    /// Build a key state directly from master key bytes, without any KDF.
    /// Test fixtures and benches use this to skip the memory-hard step.
    pub fn from_master_bytes(bytes: [u8; MASTER_KEY_SIZE]) -> Self {
        Self::new(
            MasterKey::from_bytes(bytes),
            KeyMode::UserOnly,
            KeySalts {
                user_salt: [0u8; SALT_SIZE],
                mixer_salt: [0u8; SALT_SIZE],
            },
            None,
            None,
            sigma_core::unix_now(),
        )
    }

    pub fn master_key(&self) -> &MasterKey {
        &self.master_key
    }

    pub fn mode(&self) -> KeyMode {
        self.mode
    }

    pub fn salts(&self) -> &KeySalts {
        &self.salts
    }

    /// The user KDF that produced this key; `None` for device-only keys.
    pub fn kdf(&self) -> Option<KdfAlgorithm> {
        self.kdf
    }

    pub fn fingerprint_hash(&self) -> Option<&[u8; FINGERPRINT_HASH_SIZE]> {
        self.fingerprint_hash.as_ref()
    }

    pub fn creation_time(&self) -> u64 {
        self.creation_time
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_salts_random() {
        let a = KeySalts::generate();
        let b = KeySalts::generate();
        assert_ne!(a.user_salt, b.user_salt);
        assert_ne!(a.user_salt, a.mixer_salt);
    }

    #[test]
    fn test_mode_codes_and_names() {
        for mode in [KeyMode::Hybrid, KeyMode::DeviceOnly, KeyMode::UserOnly] {
            assert_eq!(KeyMode::from_code(mode.code()), Some(mode));
            assert_eq!(mode.to_string().parse::<KeyMode>().unwrap(), mode);
        }
        assert_eq!(KeyMode::from_code(9), None);
        assert!("both".parse::<KeyMode>().is_err());
    }

    #[test]
    fn test_master_key_debug_redacted() {
        let state = KeyState::from_master_bytes([0xEE; MASTER_KEY_SIZE]);
        let dbg = format!("{state:?}");
        assert!(dbg.contains("REDACTED"));
        assert!(!dbg.contains("238, 238"));
    }

    #[test]
    fn test_key_state_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<KeyState>();
    }
}
