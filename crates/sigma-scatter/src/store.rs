//! Shard stores: where shard bytes physically live.
//!
//! The engine owns only [`ShardHandle`]s; the store owns the bytes. A store
//! never overwrites an occupied slot: a put at an already used coordinate gets
//! a distinct handle.
//!
//! Directory layout: `{root}/{hex[0..2]}/{hex[2..4]}/{hex}` (two-level sharding).

use std::collections::HashMap;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::projector::DimensionalCoordinate;

/// Opaque store-assigned shard name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShardHandle(Vec<u8>);

impl ShardHandle {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Display for ShardHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.0))
    }
}

/// Backend for shard bytes. Implementations must be safe to call from many
/// threads at once.
pub trait ShardStore: Send + Sync {
    /// Store `bytes` at `coord` and return the handle to read them back.
    fn put(&self, coord: &DimensionalCoordinate, bytes: &[u8]) -> io::Result<ShardHandle>;

    /// `Ok(None)` when the shard does not exist.
    fn get(&self, handle: &ShardHandle) -> io::Result<Option<Vec<u8>>>;

    /// Remove a shard; with `wipe`, overwrite its bytes first. Deleting a
    /// missing shard is not an error.
    fn delete(&self, handle: &ShardHandle, wipe: bool) -> io::Result<()>;
}

fn handle_name(coord: &DimensionalCoordinate, attempt: u32) -> String {
    if attempt == 0 {
        coord.to_hex()
    } else {
        format!("{}-{attempt}", coord.to_hex())
    }
}

/// In-memory store for tests and ephemeral vaults.
#[derive(Debug, Default)]
pub struct MemoryShardStore {
    shards: RwLock<HashMap<ShardHandle, Vec<u8>>>,
}

impl MemoryShardStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn contains(&self, handle: &ShardHandle) -> bool {
        self.read().contains_key(handle)
    }

    /// Flip one byte of a stored shard (for testing)
    pub fn corrupt(&self, handle: &ShardHandle, index: usize) -> bool {
        let mut shards = self.write();
        match shards.get_mut(handle) {
            Some(bytes) if !bytes.is_empty() => {
                let i = index % bytes.len();
                bytes[i] ^= 0xFF;
                true
            }
            _ => false,
        }
    }

    /// Drop a shard without going through `delete` (for testing)
    pub fn remove(&self, handle: &ShardHandle) -> bool {
        self.write().remove(handle).is_some()
    }

    /// Copy of a stored shard (for testing)
    pub fn raw(&self, handle: &ShardHandle) -> Option<Vec<u8>> {
        self.read().get(handle).cloned()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<ShardHandle, Vec<u8>>> {
        self.shards.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<ShardHandle, Vec<u8>>> {
        self.shards.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl ShardStore for MemoryShardStore {
    fn put(&self, coord: &DimensionalCoordinate, bytes: &[u8]) -> io::Result<ShardHandle> {
        let mut shards = self.write();
        let mut attempt = 0u32;
        loop {
            let handle = ShardHandle(handle_name(coord, attempt).into_bytes());
            if !shards.contains_key(&handle) {
                shards.insert(handle.clone(), bytes.to_vec());
                return Ok(handle);
            }
            attempt += 1;
        }
    }

    fn get(&self, handle: &ShardHandle) -> io::Result<Option<Vec<u8>>> {
        Ok(self.read().get(handle).cloned())
    }

    fn delete(&self, handle: &ShardHandle, wipe: bool) -> io::Result<()> {
        if let Some(mut bytes) = self.write().remove(handle) {
            if wipe {
                zeroize::Zeroize::zeroize(&mut bytes);
            }
        }
        Ok(())
    }
}

/// Directory-backed store. Writes are atomic (temp file → rename).
#[derive(Debug)]
pub struct DirShardStore {
    root: PathBuf,
    /// Serializes slot allocation so concurrent puts never share a name.
    claim: Mutex<()>,
}

impl DirShardStore {
    pub fn open(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            claim: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, name: &str) -> io::Result<PathBuf> {
        if name.len() < 4 || !name.bytes().all(|b| b.is_ascii_hexdigit() || b == b'-') {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("malformed shard handle: {name}"),
            ));
        }
        Ok(self.root.join(&name[..2]).join(&name[2..4]).join(name))
    }

    fn handle_path(&self, handle: &ShardHandle) -> io::Result<PathBuf> {
        let name = std::str::from_utf8(handle.as_bytes())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "shard handle is not UTF-8"))?;
        self.path_for(name)
    }
}

fn remove_tmp(tmp: &Path) {
    match std::fs::remove_file(tmp) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %tmp.display(), error = %e, "stale shard temp file left behind"),
    }
}

impl ShardStore for DirShardStore {
    fn put(&self, coord: &DimensionalCoordinate, bytes: &[u8]) -> io::Result<ShardHandle> {
        let base = self.path_for(&coord.to_hex())?;
        let dir = base
            .parent()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "shard path has no parent"))?;
        std::fs::create_dir_all(dir)?;

        let mut nonce = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut nonce);
        let tmp = dir.join(format!(".{}.tmp", hex::encode(nonce)));
        let written = std::fs::File::create(&tmp).and_then(|mut file| {
            file.write_all(bytes)?;
            file.sync_all()
        });
        if let Err(e) = written {
            remove_tmp(&tmp);
            return Err(e);
        }

        let _claim = self.claim.lock().unwrap_or_else(|e| e.into_inner());
        let mut attempt = 0u32;
        loop {
            let name = handle_name(coord, attempt);
            let path = self.path_for(&name)?;
            if !path.exists() {
                if let Err(e) = std::fs::rename(&tmp, &path) {
                    remove_tmp(&tmp);
                    return Err(e);
                }
                debug!(shard = %name, len = bytes.len(), "shard written");
                return Ok(ShardHandle(name.into_bytes()));
            }
            attempt += 1;
        }
    }

    fn get(&self, handle: &ShardHandle) -> io::Result<Option<Vec<u8>>> {
        match std::fs::read(self.handle_path(handle)?) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn delete(&self, handle: &ShardHandle, wipe: bool) -> io::Result<()> {
        let path = self.handle_path(handle)?;
        if wipe {
            match std::fs::metadata(&path) {
                Ok(meta) => {
                    let mut file = std::fs::OpenOptions::new().write(true).open(&path)?;
                    file.write_all(&vec![0u8; meta.len() as usize])?;
                    file.sync_all()?;
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
                Err(e) => return Err(e),
            }
        }
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}
