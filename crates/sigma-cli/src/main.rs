//! sigma: SigmaVault command-line interface
//!
//! Commands:
//!   init                  - create a vault: derive the key, write the header
//!   store <path>          - scatter a local file into the vault
//!   retrieve <name>       - gather a file back (to a path or stdout)
//!   delete <name>         - remove a file and wipe its shards
//!   list                  - show stored files
//!   reshuffle             - re-scatter files whose time bucket has expired
//!   verify-device         - check this machine against the vault's binding
//!   config show           - display current configuration
//!
//! Vault layout under `vault.dir`:
//!   vault.hdr             - key-derivation header (salts, mode, kdf, binding)
//!   index.json            - logical name → file id
//!   records/{id}.rec      - one scattered-file record per file
//!   shards/               - shard store

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use zeroize::Zeroizing;

use sigma_core::config::SigmaConfig;
use sigma_core::{unix_now, FileId, SigmaError};
use sigma_crypto::{verify_device, Collector, DeriveOptions, KeyDeriver, KeyMode, KeySalts, KeyState, UserSecret};
use sigma_scatter::{
    decode_record, encode_record, DimensionalScatterEngine, DirShardStore, ScatteredFile, Session,
    VaultHeader,
};

// ── CLI structure ──────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "sigma",
    version,
    about = "SigmaVault dimensional storage client",
    long_about = "sigma: store files as key-, content- and time-dependent scattered shards"
)]
struct Cli {
    /// Path to sigma.toml configuration file
    #[arg(long, short = 'c', env = "SIGMA_CONFIG", default_value = "~/.config/sigma/config.toml")]
    config: PathBuf,

    /// Vault directory (overrides vault.dir)
    #[arg(long, env = "SIGMA_VAULT")]
    vault: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); overrides logging.level
    #[arg(long, env = "SIGMA_LOG")]
    log: Option<String>,

    /// Log format; overrides logging.format
    #[arg(long, env = "SIGMA_LOG_FORMAT")]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Debug, ValueEnum)]
enum LogFormat {
    Json,
    Text,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ModeArg {
    /// Device fingerprint and passphrase
    Hybrid,
    /// Device fingerprint only
    DeviceOnly,
    /// Passphrase only (portable vault)
    UserOnly,
}

impl From<ModeArg> for KeyMode {
    fn from(m: ModeArg) -> Self {
        match m {
            ModeArg::Hybrid => KeyMode::Hybrid,
            ModeArg::DeviceOnly => KeyMode::DeviceOnly,
            ModeArg::UserOnly => KeyMode::UserOnly,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a new vault
    Init {
        #[arg(long, value_enum, default_value = "hybrid")]
        mode: ModeArg,
        /// Replace an existing vault header (existing files become unreadable)
        #[arg(long)]
        force: bool,
    },

    /// Scatter a local file into the vault
    Store {
        /// Local file
        path: PathBuf,
        /// Logical name in the vault (default: file name)
        #[arg(long, short = 'n')]
        name: Option<String>,
        #[arg(long)]
        json: bool,
    },

    /// Gather a file back out of the vault
    Retrieve {
        name: String,
        /// Output path (default: stdout)
        #[arg(long, short = 'o')]
        output: Option<PathBuf>,
    },

    /// Remove a file and its shards
    Delete { name: String },

    /// List stored files
    List {
        #[arg(long)]
        json: bool,
    },

    /// Re-scatter every file whose time bucket has expired
    Reshuffle,

    /// Check this machine's fingerprint against the vault binding
    #[command(name = "verify-device")]
    VerifyDevice,

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the active configuration (merged defaults + config file)
    Show,
}

// ── Entry point ───────────────────────────────────────────────────────────────

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = expand_tilde(&cli.config);
    let config = SigmaConfig::load(&config_path)
        .with_context(|| format!("loading config: {}", config_path.display()))?;

    let level = cli.log.clone().unwrap_or_else(|| config.logging.level.clone());
    let format = cli.log_format.clone().unwrap_or(if config.logging.format == "json" {
        LogFormat::Json
    } else {
        LogFormat::Text
    });
    init_logging(&level, &format);

    let vault = Vault::new(
        cli.vault
            .as_deref()
            .map(expand_tilde)
            .unwrap_or_else(|| expand_tilde(&config.vault.dir)),
    );
    info!(version = env!("CARGO_PKG_VERSION"), vault = %vault.root.display(), "sigma starting");

    match cli.command {
        Commands::Init { mode, force } => cmd_init(&config, &vault, mode.into(), force),
        Commands::Store { path, name, json } => cmd_store(&config, &vault, &path, name, json),
        Commands::Retrieve { name, output } => cmd_retrieve(&config, &vault, &name, output.as_deref()),
        Commands::Delete { name } => cmd_delete(&config, &vault, &name),
        Commands::List { json } => cmd_list(&vault, json),
        Commands::Reshuffle => cmd_reshuffle(&config, &vault),
        Commands::VerifyDevice => cmd_verify_device(&vault),
        Commands::Config { action: ConfigAction::Show } => cmd_config_show(&config, &config_path),
    }
}

fn init_logging(level: &str, format: &LogFormat) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    // Logs go to stderr so `retrieve` can stream file content on stdout.
    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}

// ── Vault directory ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexEntry {
    file_id: String,
    size: u64,
    stored_at: u64,
}

type Index = BTreeMap<String, IndexEntry>;

struct Vault {
    root: PathBuf,
}

impl Vault {
    fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn header_path(&self) -> PathBuf {
        self.root.join("vault.hdr")
    }

    fn index_path(&self) -> PathBuf {
        self.root.join("index.json")
    }

    fn shards_dir(&self) -> PathBuf {
        self.root.join("shards")
    }

    fn record_path(&self, id: &FileId) -> PathBuf {
        self.root.join("records").join(format!("{id}.rec"))
    }

    fn read_header(&self) -> Result<VaultHeader> {
        let path = self.header_path();
        let bytes = std::fs::read(&path)
            .with_context(|| format!("reading vault header {} (run `sigma init` first)", path.display()))?;
        VaultHeader::decode(&bytes).with_context(|| format!("decoding vault header {}", path.display()))
    }

    fn read_index(&self) -> Result<Index> {
        let path = self.index_path();
        if !path.exists() {
            return Ok(Index::new());
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("reading index: {}", path.display()))?;
        serde_json::from_str(&content).with_context(|| format!("parsing index: {}", path.display()))
    }

    fn write_index(&self, index: &Index) -> Result<()> {
        let json = serde_json::to_vec_pretty(index).context("serializing index")?;
        write_atomic(&self.index_path(), &json)
    }

    fn read_record(&self, state: &KeyState, header: &VaultHeader, id: &FileId) -> Result<ScatteredFile> {
        let path = self.record_path(id);
        let bytes = std::fs::read(&path).with_context(|| format!("reading record {}", path.display()))?;
        let (rec_header, file) =
            decode_record(state, &bytes).with_context(|| format!("decoding record {}", path.display()))?;
        if &rec_header != header {
            anyhow::bail!("record {} was written under a different vault header", path.display());
        }
        Ok(file)
    }

    fn write_record(&self, state: &KeyState, header: &VaultHeader, file: &ScatteredFile) -> Result<()> {
        let bytes = encode_record(state, header, file).context("encoding record")?;
        write_atomic(&self.record_path(&file.file_id), &bytes)
    }

    fn lookup(&self, name: &str) -> Result<(Index, FileId)> {
        let index = self.read_index()?;
        let entry = index
            .get(name)
            .with_context(|| format!("no file named {name:?} in the vault"))?;
        let id = FileId::from_hex(&entry.file_id)
            .with_context(|| format!("corrupt index entry for {name:?}"))?;
        Ok((index, id))
    }
}

/// Write via a temp file + rename so readers never see a partial file.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .with_context(|| format!("no parent directory for {}", path.display()))?;
    std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    let tmp = path.with_extension("tmp");
    {
        let mut f = std::fs::File::create(&tmp).with_context(|| format!("creating {}", tmp.display()))?;
        f.write_all(bytes)?;
        f.sync_all()?;
    }
    std::fs::rename(&tmp, path).with_context(|| format!("renaming into {}", path.display()))
}

/// Stable file id for a logical name.
fn file_id_for(name: &str) -> FileId {
    let digest = blake3::derive_key("sigma cli file id v1", name.as_bytes());
    let mut id = [0u8; 16];
    id.copy_from_slice(&digest[..16]);
    FileId::from_bytes(id)
}

// ── Key handling ──────────────────────────────────────────────────────────────

fn read_passphrase(confirm: bool) -> Result<UserSecret> {
    if let Ok(p) = std::env::var("SIGMA_PASSPHRASE") {
        let p = Zeroizing::new(p);
        return Ok(UserSecret::from_passphrase(&p));
    }
    let first = Zeroizing::new(
        rpassword::prompt_password("Vault passphrase: ").context("reading passphrase")?,
    );
    if confirm {
        let second = Zeroizing::new(
            rpassword::prompt_password("Confirm passphrase: ").context("reading passphrase")?,
        );
        if *first != *second {
            anyhow::bail!("passphrases do not match");
        }
    }
    Ok(UserSecret::from_passphrase(&first))
}

fn unlock(config: &SigmaConfig, header: &VaultHeader) -> Result<KeyState> {
    let deriver = KeyDeriver::from_config(config, Collector::detect()).context("configuring key derivation")?;
    let secret = if header.mode.uses_secret() {
        Some(read_passphrase(false)?)
    } else {
        None
    };
    let options = DeriveOptions {
        device_required: config.vault.device_required,
        bound_fingerprint: header.fingerprint_hash,
        pinned_kdf: header.kdf,
    };
    deriver
        .derive(header.mode, secret.as_ref(), &header.salts, &options)
        .context("unlocking vault")
}

fn open_session(config: &SigmaConfig, vault: &Vault, header: &VaultHeader) -> Result<Session> {
    let state = unlock(config, header)?;
    let store = DirShardStore::open(vault.shards_dir())
        .with_context(|| format!("opening shard store {}", vault.shards_dir().display()))?;
    let engine = DimensionalScatterEngine::from_config(config, Arc::new(store)).context("configuring engine")?;
    let cache_bytes = (config.vault.content_cache_mb as usize).saturating_mul(1024 * 1024);
    Ok(Session::open(Arc::new(state), engine, cache_bytes))
}

// ── Progress bar helpers ──────────────────────────────────────────────────────

fn make_progress_bar(total: u64, prefix: &str) -> Result<ProgressBar> {
    let pb = ProgressBar::new(total);
    pb.set_style(
        ProgressStyle::with_template("{prefix:.bold} [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg}")?
            .progress_chars("=>-"),
    );
    pb.set_prefix(prefix.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    Ok(pb)
}

fn make_spinner(prefix: &str) -> Result<ProgressBar> {
    let pb = ProgressBar::new_spinner();
    pb.set_style(ProgressStyle::with_template("{prefix:.bold} {spinner} {msg}")?);
    pb.set_prefix(prefix.to_string());
    pb.enable_steady_tick(Duration::from_millis(80));
    Ok(pb)
}

// ── `sigma init` ──────────────────────────────────────────────────────────────

fn cmd_init(config: &SigmaConfig, vault: &Vault, mode: KeyMode, force: bool) -> Result<()> {
    if vault.header_path().exists() && !force {
        anyhow::bail!(
            "vault already initialised at {} (use --force to replace it)",
            vault.root.display()
        );
    }
    let secret = if mode.uses_secret() {
        Some(read_passphrase(true)?)
    } else {
        None
    };

    let pb = make_spinner("init")?;
    pb.set_message("deriving key...");
    let deriver = KeyDeriver::from_config(config, Collector::detect()).context("configuring key derivation")?;
    let options = DeriveOptions {
        device_required: config.vault.device_required,
        ..DeriveOptions::default()
    };
    let state = deriver
        .derive(mode, secret.as_ref(), &KeySalts::generate(), &options)
        .context("deriving vault key")?;
    let header = VaultHeader::from_state(&state);
    write_atomic(&vault.header_path(), &header.encode()?)?;
    std::fs::create_dir_all(vault.shards_dir())?;
    pb.finish_with_message("done".to_string());

    println!("Vault created: {}", vault.root.display());
    println!("  mode:     {}", header.mode);
    match header.kdf {
        Some(kdf) => println!("  kdf:      {kdf}"),
        None => println!("  kdf:      none"),
    }
    match &header.fingerprint_hash {
        Some(fp) => println!("  device:   bound ({})", &hex::encode(fp)[..16]),
        None => println!("  device:   not bound"),
    }
    Ok(())
}

// ── `sigma store` ─────────────────────────────────────────────────────────────

fn cmd_store(config: &SigmaConfig, vault: &Vault, path: &Path, name: Option<String>, json: bool) -> Result<()> {
    let name = match name {
        Some(n) => n,
        None => path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .with_context(|| format!("cannot derive a name from {}", path.display()))?,
    };
    let header = vault.read_header()?;
    let session = open_session(config, vault, &header)?;
    let id = file_id_for(&name);

    let file = std::fs::File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let size = file.metadata()?.len();
    let pb = make_progress_bar(size, "store")?;
    pb.set_message(name.clone());

    // Load the previous version so its shards are released on replace.
    let state = Arc::clone(session.key_state());
    let previous = if vault.record_path(&id).exists() {
        Some(vault.read_record(&state, &header, &id)?)
    } else {
        None
    };
    if let Some(prev) = &previous {
        session.load(prev.clone());
    }
    let mut index = vault.read_index()?;
    let scattered = session
        .store_reader_with(id, pb.wrap_read(file), Some(size), |new| {
            commit_stored(vault, &state, &header, &mut index, &name, new, previous.as_ref())
                .map_err(SigmaError::from)
        })
        .with_context(|| format!("storing {}", path.display()))?;
    pb.finish_with_message("done".to_string());
    session.close();

    if json {
        let out = serde_json::json!({
            "name": name,
            "file_id": id.to_hex(),
            "bytes": scattered.original_len,
            "chunks": scattered.chunk_count(),
            "shards": scattered.shard_refs.len(),
            "bucket": scattered.temporal_bucket,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        println!("Stored {name}:");
        println!("  id:      {id}");
        println!("  bytes:   {}", fmt_bytes(scattered.original_len));
        println!("  chunks:  {}", scattered.chunk_count());
        println!(
            "  shards:  {} ({}+{} per chunk)",
            scattered.shard_refs.len(),
            scattered.data_shards,
            scattered.parity_shards
        );
    }
    Ok(())
}

/// Persist a new version: record first, then its index entry. If the index
/// cannot be written the previous record is put back.
#[allow(clippy::too_many_arguments)]
fn commit_stored(
    vault: &Vault,
    state: &KeyState,
    header: &VaultHeader,
    index: &mut Index,
    name: &str,
    file: &ScatteredFile,
    previous: Option<&ScatteredFile>,
) -> Result<()> {
    vault.write_record(state, header, file)?;
    index.insert(
        name.to_string(),
        IndexEntry {
            file_id: file.file_id.to_hex(),
            size: file.original_len,
            stored_at: unix_now(),
        },
    );
    if let Err(e) = vault.write_index(index) {
        let undo = match previous {
            Some(prev) => vault.write_record(state, header, prev),
            None => std::fs::remove_file(vault.record_path(&file.file_id)).map_err(Into::into),
        };
        if let Err(undo) = undo {
            warn!(file = %file.file_id, error = %undo, "could not roll back record after index write failed");
        }
        return Err(e);
    }
    Ok(())
}

// ── `sigma retrieve` ──────────────────────────────────────────────────────────

fn cmd_retrieve(config: &SigmaConfig, vault: &Vault, name: &str, output: Option<&Path>) -> Result<()> {
    let header = vault.read_header()?;
    let (_, id) = vault.lookup(name)?;
    let session = open_session(config, vault, &header)?;
    let file = vault.read_record(session.key_state(), &header, &id)?;

    let partial = match output {
        Some(out) => {
            let pb = make_progress_bar(file.original_len, "retrieve")?;
            pb.set_message(name.to_string());
            let tmp = out.with_extension("partial");
            let f = std::fs::File::create(&tmp).with_context(|| format!("creating {}", tmp.display()))?;
            let partial = match session
                .engine()
                .gather_to_writer(session.key_state(), &file, pb.wrap_write(f))
            {
                Ok(p) => p,
                Err(e) => {
                    if let Err(cleanup) = std::fs::remove_file(&tmp) {
                        warn!(path = %tmp.display(), error = %cleanup, "partial output left behind");
                    }
                    return Err(e).with_context(|| format!("retrieving {name}"));
                }
            };
            std::fs::rename(&tmp, out).with_context(|| format!("renaming into {}", out.display()))?;
            pb.finish_with_message("done".to_string());
            partial
        }
        None => {
            let stdout = std::io::stdout();
            session
                .engine()
                .gather_to_writer(session.key_state(), &file, stdout.lock())
                .with_context(|| format!("retrieving {name}"))?
        }
    };

    if let Some(p) = partial {
        warn!(file = %id, repaired = p.repaired.len(), "damaged shards were rebuilt from parity");
        eprintln!(
            "warning: {} shard(s) of {name} were rebuilt; run `sigma store` again to rewrite them",
            p.repaired.len()
        );
    }
    session.close();
    Ok(())
}

// ── `sigma delete` ────────────────────────────────────────────────────────────

fn cmd_delete(config: &SigmaConfig, vault: &Vault, name: &str) -> Result<()> {
    let header = vault.read_header()?;
    let (mut index, id) = vault.lookup(name)?;
    let session = open_session(config, vault, &header)?;
    session.load(vault.read_record(session.key_state(), &header, &id)?);
    session.delete(&id).with_context(|| format!("deleting {name}"))?;
    session.close();

    let record = vault.record_path(&id);
    std::fs::remove_file(&record).with_context(|| format!("removing {}", record.display()))?;
    index.remove(name);
    vault.write_index(&index)?;
    println!("Deleted {name}");
    Ok(())
}

// ── `sigma list` ──────────────────────────────────────────────────────────────

fn cmd_list(vault: &Vault, json: bool) -> Result<()> {
    let index = vault.read_index()?;
    if json {
        println!("{}", serde_json::to_string_pretty(&index)?);
        return Ok(());
    }
    println!("Vault: {}", vault.root.display());
    println!("Files: {}", index.len());
    for (name, entry) in &index {
        println!("  {:<32} {:>10}  {}", name, fmt_bytes(entry.size), entry.file_id);
    }
    Ok(())
}

// ── `sigma reshuffle` ─────────────────────────────────────────────────────────

fn cmd_reshuffle(config: &SigmaConfig, vault: &Vault) -> Result<()> {
    let header = vault.read_header()?;
    let index = vault.read_index()?;
    let session = open_session(config, vault, &header)?;
    let state = Arc::clone(session.key_state());
    let mut names = BTreeMap::new();
    for (name, entry) in &index {
        let id = FileId::from_hex(&entry.file_id).context("corrupt index entry")?;
        session.load(vault.read_record(&state, &header, &id)?);
        names.insert(id, name.as_str());
    }

    let pb = make_spinner("reshuffle")?;
    pb.set_message(format!("{} files", index.len()));
    // Each moved file's record is rewritten before its old shards go.
    let pass = session.reshuffle_due_with(unix_now(), |file| {
        vault.write_record(&state, &header, file).map_err(SigmaError::from)
    });
    pb.finish_with_message("done".to_string());
    session.close();

    for (id, e) in &pass.failed {
        let name = names.get(id).copied().unwrap_or("?");
        eprintln!("warning: {name} ({id}) kept its previous layout: {e}");
    }
    println!("Reshuffled {} of {} files", pass.moved.len(), index.len());
    if !pass.is_clean() {
        anyhow::bail!("{} file(s) could not be reshuffled", pass.failed.len());
    }
    Ok(())
}

// ── `sigma verify-device` ─────────────────────────────────────────────────────

fn cmd_verify_device(vault: &Vault) -> Result<()> {
    let header = vault.read_header()?;
    if header.fingerprint_hash.is_none() {
        println!("Vault is not bound to a device");
        return Ok(());
    }
    if verify_device(&Collector::detect(), header.fingerprint_hash.as_ref()) {
        println!("Device matches the vault binding");
        Ok(())
    } else {
        anyhow::bail!("this device does not match the vault binding")
    }
}

// ── `sigma config show` ───────────────────────────────────────────────────────

fn cmd_config_show(config: &SigmaConfig, config_path: &Path) -> Result<()> {
    if config_path.exists() {
        println!("# Configuration from: {}", config_path.display());
    } else {
        println!("# Configuration: defaults (no file at {})", config_path.display());
    }
    println!();
    let rendered = toml::to_string_pretty(config).context("serializing config to TOML")?;
    print!("{rendered}");
    Ok(())
}

// ── Helpers ───────────────────────────────────────────────────────────────────

/// Expand `~` in path to the user's home directory
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        let home = std::env::var("HOME").unwrap_or_default();
        PathBuf::from(home).join(rest)
    } else {
        path.to_path_buf()
    }
}

fn fmt_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses() {
        use clap::CommandFactory;
        Cli::command().debug_assert();

        let cli = Cli::try_parse_from(["sigma", "--vault", "/tmp/v", "init", "--mode", "user-only"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Init {
                mode: ModeArg::UserOnly,
                force: false
            }
        ));
    }

    #[test]
    fn test_file_id_is_stable_per_name() {
        assert_eq!(file_id_for("notes.txt"), file_id_for("notes.txt"));
        assert_ne!(file_id_for("notes.txt"), file_id_for("notes.txt.bak"));
    }

    #[test]
    fn test_fmt_bytes() {
        assert_eq!(fmt_bytes(512), "512 B");
        assert_eq!(fmt_bytes(2048), "2.0 KB");
        assert_eq!(fmt_bytes(3 * 1024 * 1024), "3.0 MB");
    }

    #[test]
    fn test_expand_tilde_leaves_absolute_paths() {
        assert_eq!(expand_tilde(Path::new("/var/lib/sigma")), PathBuf::from("/var/lib/sigma"));
    }

    #[test]
    fn test_index_and_record_files() {
        let tmp = tempfile::tempdir().unwrap();
        let vault = Vault::new(tmp.path().to_path_buf());
        assert!(vault.read_index().unwrap().is_empty());

        let mut index = Index::new();
        index.insert(
            "a.txt".into(),
            IndexEntry {
                file_id: file_id_for("a.txt").to_hex(),
                size: 3,
                stored_at: 1,
            },
        );
        vault.write_index(&index).unwrap();
        let (_, id) = vault.lookup("a.txt").unwrap();
        assert_eq!(id, file_id_for("a.txt"));
        assert!(vault.lookup("b.txt").is_err());

        let header = VaultHeader {
            mode: KeyMode::UserOnly,
            kdf: None,
            salts: KeySalts {
                user_salt: [1; 32],
                mixer_salt: [2; 32],
            },
            fingerprint_hash: None,
        };
        let file = ScatteredFile {
            file_id: id,
            original_len: 0,
            chunk_size: 64,
            data_shards: 6,
            parity_shards: 2,
            temporal_bucket: 0,
            topology_seed: [0; 32],
            entropy: Default::default(),
            shard_coordinates: Vec::new(),
            shard_refs: Vec::new(),
        };
        let state = KeyState::from_master_bytes([8; 64]);
        vault.write_record(&state, &header, &file).unwrap();
        assert_eq!(vault.read_record(&state, &header, &id).unwrap(), file);

        let other = VaultHeader {
            mode: KeyMode::Hybrid,
            ..header.clone()
        };
        assert!(vault.read_record(&state, &other, &id).is_err());
        let stranger = KeyState::from_master_bytes([9; 64]);
        assert!(vault.read_record(&stranger, &header, &id).is_err());
    }
}
