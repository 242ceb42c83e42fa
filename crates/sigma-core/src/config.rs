use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{SigmaError, SigmaResult};

/// Lower bound of the entropic mix ratio, in permille.
pub const RATIO_FLOOR_PERMILLE: u16 = 300;
/// Upper bound of the entropic mix ratio, in permille.
pub const RATIO_CEIL_PERMILLE: u16 = 700;

/// Number of projection axes.
pub const AXIS_COUNT: usize = 8;

/// Default per-axis moduli, in axis order
/// (Spatial, Temporal, Entropic, Semantic, Fractal, Phase, Topological, Holographic).
pub const DEFAULT_AXIS_SIZES: [u64; AXIS_COUNT] = [
    4_294_967_291,
    2_147_483_647,
    1_000_000_007,
    998_244_353,
    16_777_213,
    65_521,
    1_048_573,
    262_139,
];

/// Top-level configuration (loaded from sigma.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SigmaConfig {
    pub engine: EngineConfig,
    pub redundancy: RedundancyConfig,
    pub temporal: TemporalConfig,
    pub entropy: EntropyConfig,
    pub memory: MemoryConfig,
    pub kdf: KdfConfig,
    pub mixer: MixerConfig,
    pub vault: VaultConfig,
    pub logging: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Streaming chunk size in bytes (default: 1 MiB)
    pub chunk_size: usize,
    /// Per-axis coordinate moduli
    pub axis_sizes: [u64; AXIS_COUNT],
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedundancyConfig {
    /// Data shards per chunk
    pub data_shards: u8,
    /// Parity shards per chunk; also the number of losses tolerated
    pub parity_shards: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TemporalConfig {
    /// Length of one time bucket in seconds (default: 3600)
    pub reshuffle_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EntropyConfig {
    pub ratio_min_permille: u16,
    pub ratio_max_permille: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Peak working-memory ceiling in MiB (default: 100)
    pub ceiling_mb: u64,
    /// How long an allocation waits for memory to be released before failing
    pub backpressure_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KdfConfig {
    /// Argon2id memory cost in KiB (default: 65536 = 64 MiB)
    pub argon2_mem_cost_kib: u32,
    /// Argon2id time cost (default: 3)
    pub argon2_time_cost: u32,
    /// Argon2id parallelism (default: 4)
    pub argon2_parallelism: u32,
    /// PBKDF2-HMAC-SHA512 iterations used by the fallback (default: 600000)
    pub pbkdf2_rounds: u32,
    /// Skip Argon2id and go straight to the fallback
    pub prefer_fallback: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MixerConfig {
    /// Expansion rounds folded into the master key (default: 4)
    pub rounds: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    /// Vault directory (header, records, shards)
    pub dir: PathBuf,
    /// Overwrite shard bytes before deleting them
    pub secure_wipe: bool,
    /// Session content cache budget in MiB (0 disables the cache)
    pub content_cache_mb: u64,
    /// Require the device fingerprint to match on unlock
    pub device_required: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level (default: info)
    pub level: String,
    /// Log format: "json" or "text"
    pub format: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1024 * 1024,
            axis_sizes: DEFAULT_AXIS_SIZES,
        }
    }
}

impl Default for RedundancyConfig {
    fn default() -> Self {
        Self {
            data_shards: 6,
            parity_shards: 2,
        }
    }
}

impl Default for TemporalConfig {
    fn default() -> Self {
        Self {
            reshuffle_interval_secs: 3600,
        }
    }
}

impl Default for EntropyConfig {
    fn default() -> Self {
        Self {
            ratio_min_permille: RATIO_FLOOR_PERMILLE,
            ratio_max_permille: RATIO_CEIL_PERMILLE,
        }
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            ceiling_mb: 100,
            backpressure_timeout_ms: 5000,
        }
    }
}

impl Default for KdfConfig {
    fn default() -> Self {
        Self {
            argon2_mem_cost_kib: 65536,
            argon2_time_cost: 3,
            argon2_parallelism: 4,
            pbkdf2_rounds: 600_000,
            prefer_fallback: false,
        }
    }
}

impl Default for MixerConfig {
    fn default() -> Self {
        Self { rounds: 4 }
    }
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("~/.local/share/sigma/vault"),
            secure_wipe: true,
            content_cache_mb: 16,
            device_required: false,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
        }
    }
}

impl SigmaConfig {
    /// Load from a TOML file, falling back to defaults when it does not exist.
    pub fn load(path: &Path) -> SigmaResult<Self> {
        let config: SigmaConfig = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            toml::from_str(&content)
                .map_err(|e| SigmaError::config(format!("parsing {}: {e}", path.display())))?
        } else {
            tracing::warn!(path = %path.display(), "config file not found, using defaults");
            SigmaConfig::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Range checks across all sections.
    pub fn validate(&self) -> SigmaResult<()> {
        self.engine.validate()?;
        self.redundancy.validate()?;
        self.temporal.validate()?;
        self.entropy.validate()?;
        if self.memory.ceiling_mb == 0 {
            return Err(SigmaError::config("memory.ceiling_mb must be > 0"));
        }
        if self.mixer.rounds == 0 || self.mixer.rounds > 64 {
            return Err(SigmaError::config(format!(
                "mixer.rounds must be in 1..=64, got {}",
                self.mixer.rounds
            )));
        }
        if self.logging.format != "json" && self.logging.format != "text" {
            return Err(SigmaError::config(format!(
                "logging.format must be \"json\" or \"text\", got {:?}",
                self.logging.format
            )));
        }
        Ok(())
    }
}

impl EngineConfig {
    pub fn validate(&self) -> SigmaResult<()> {
        if self.chunk_size < 64 {
            return Err(SigmaError::config(format!(
                "engine.chunk_size must be at least 64 bytes, got {}",
                self.chunk_size
            )));
        }
        for (axis, size) in self.axis_sizes.iter().enumerate() {
            if *size < 2 {
                return Err(SigmaError::config(format!(
                    "engine.axis_sizes[{axis}] must be >= 2, got {size}"
                )));
            }
        }
        Ok(())
    }
}

impl RedundancyConfig {
    pub fn validate(&self) -> SigmaResult<()> {
        if self.data_shards == 0 {
            return Err(SigmaError::config("redundancy.data_shards must be > 0"));
        }
        let total = self.data_shards as usize + self.parity_shards as usize;
        if total > 255 {
            return Err(SigmaError::config(format!(
                "redundancy: data_shards + parity_shards must be <= 255, got {total}"
            )));
        }
        Ok(())
    }

    pub fn total_shards(&self) -> usize {
        self.data_shards as usize + self.parity_shards as usize
    }
}

impl TemporalConfig {
    pub fn validate(&self) -> SigmaResult<()> {
        if self.reshuffle_interval_secs == 0 {
            return Err(SigmaError::config(
                "temporal.reshuffle_interval_secs must be > 0",
            ));
        }
        Ok(())
    }
}

impl EntropyConfig {
    pub fn validate(&self) -> SigmaResult<()> {
        let (lo, hi) = (self.ratio_min_permille, self.ratio_max_permille);
        if lo < RATIO_FLOOR_PERMILLE || hi > RATIO_CEIL_PERMILLE || lo > hi {
            return Err(SigmaError::config(format!(
                "entropy ratio must satisfy {RATIO_FLOOR_PERMILLE} <= min <= max <= {RATIO_CEIL_PERMILLE} (permille), got {lo}..{hi}"
            )));
        }
        Ok(())
    }
}

impl MemoryConfig {
    pub fn ceiling_bytes(&self) -> usize {
        (self.ceiling_mb as usize).saturating_mul(1024 * 1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let toml_str = r#"
[engine]
chunk_size = 65536
axis_sizes = [101, 103, 107, 109, 113, 127, 131, 137]

[redundancy]
data_shards = 10
parity_shards = 4

[temporal]
reshuffle_interval_secs = 600

[entropy]
ratio_min_permille = 400
ratio_max_permille = 600

[memory]
ceiling_mb = 256
backpressure_timeout_ms = 100

[kdf]
argon2_mem_cost_kib = 131072
argon2_time_cost = 4
argon2_parallelism = 8
pbkdf2_rounds = 1000000
prefer_fallback = true

[mixer]
rounds = 8

[vault]
dir = "/var/lib/sigma"
secure_wipe = false
content_cache_mb = 0
device_required = true

[logging]
level = "debug"
format = "json"
"#;
        let config: SigmaConfig = toml::from_str(toml_str).unwrap();
        config.validate().unwrap();

        assert_eq!(config.engine.chunk_size, 65536);
        assert_eq!(config.engine.axis_sizes[7], 137);
        assert_eq!(config.redundancy.total_shards(), 14);
        assert_eq!(config.temporal.reshuffle_interval_secs, 600);
        assert_eq!(config.entropy.ratio_min_permille, 400);
        assert_eq!(config.memory.ceiling_bytes(), 256 * 1024 * 1024);
        assert!(config.kdf.prefer_fallback);
        assert_eq!(config.mixer.rounds, 8);
        assert_eq!(config.vault.dir, PathBuf::from("/var/lib/sigma"));
        assert!(config.vault.device_required);
        assert_eq!(config.logging.format, "json");
    }

    #[test]
    fn test_parse_defaults() {
        let config: SigmaConfig = toml::from_str("").unwrap();
        config.validate().unwrap();

        assert_eq!(config.engine.chunk_size, 1024 * 1024);
        assert_eq!(config.engine.axis_sizes, DEFAULT_AXIS_SIZES);
        assert_eq!(config.redundancy.data_shards, 6);
        assert_eq!(config.redundancy.parity_shards, 2);
        assert_eq!(config.memory.ceiling_mb, 100);
        assert_eq!(config.kdf.argon2_mem_cost_kib, 65536);
        assert_eq!(config.mixer.rounds, 4);
        assert!(config.vault.secure_wipe);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_parse_partial_config() {
        let toml_str = r#"
[redundancy]
parity_shards = 3
"#;
        let config: SigmaConfig = toml::from_str(toml_str).unwrap();

        // Overridden
        assert_eq!(config.redundancy.parity_shards, 3);
        // Defaults
        assert_eq!(config.redundancy.data_shards, 6);
        assert_eq!(config.temporal.reshuffle_interval_secs, 3600);
    }

    #[test]
    fn test_validate_rejects_bad_ranges() {
        let mut config = SigmaConfig::default();
        config.entropy.ratio_min_permille = 200;
        assert!(config.validate().is_err());

        let mut config = SigmaConfig::default();
        config.redundancy.data_shards = 200;
        config.redundancy.parity_shards = 100;
        assert!(config.validate().is_err());

        let mut config = SigmaConfig::default();
        config.engine.axis_sizes[3] = 1;
        assert!(config.validate().is_err());

        let mut config = SigmaConfig::default();
        config.temporal.reshuffle_interval_secs = 0;
        assert!(config.validate().is_err());

        let mut config = SigmaConfig::default();
        config.mixer.rounds = 0;
        assert!(config.validate().is_err());

        let mut config = SigmaConfig::default();
        config.logging.format = "xml".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = SigmaConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.redundancy.data_shards, 6);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sigma.toml");
        std::fs::write(&path, "[mixer]\nrounds = 6\n").unwrap();
        let config = SigmaConfig::load(&path).unwrap();
        assert_eq!(config.mixer.rounds, 6);
    }

    #[test]
    fn test_serialize_roundtrip() {
        let config = SigmaConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: SigmaConfig = toml::from_str(&toml_str).unwrap();

        assert_eq!(config.engine.axis_sizes, parsed.engine.axis_sizes);
        assert_eq!(config.vault.dir, parsed.vault.dir);
        assert_eq!(config.kdf.pbkdf2_rounds, parsed.kdf.pbkdf2_rounds);
    }
}
