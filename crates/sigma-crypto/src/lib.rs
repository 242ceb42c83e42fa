//! sigma-crypto: hybrid key derivation for SigmaVault
//!
//! A vault key binds two independent inputs: something the machine is and
//! something the user knows.
//!
//! ```text
//! DeviceFingerprint ── BLAKE3 XOF ──────────────┐
//!                                               ├─ HybridMixer (SHA-512, r rounds) ─▶ MasterKey (512-bit)
//! UserSecret ── Argon2id | PBKDF2-SHA512 ───────┘
//! ```
//!
//! The resulting [`KeyState`] is immutable, zeroized on drop, and shared by
//! reference across worker threads.

pub mod ct;
pub mod derive;
pub mod fingerprint;
pub mod kdf;
pub mod mixer;
pub mod state;
pub mod verify;

pub use derive::{derive_key, DeriveOptions, KeyDeriver};
pub use fingerprint::{Collector, DeviceFingerprint, FingerprintSource, RawFingerprintParts};
pub use kdf::{derive_user_key, derive_user_key_pinned, KdfAlgorithm, KdfOutcome, KdfParams, UserSecret};
pub use mixer::{HybridMixer, MixerParams};
pub use state::{KeyMode, KeySalts, KeyState, MasterKey};
pub use verify::verify_device;

/// Size of the master key in bytes (512-bit)
pub const MASTER_KEY_SIZE: usize = 64;

/// Size of each persisted salt
pub const SALT_SIZE: usize = 32;

/// Size of a fingerprint hash
pub const FINGERPRINT_HASH_SIZE: usize = 32;
