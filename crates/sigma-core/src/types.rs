use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Size of a file identifier in bytes.
pub const FILE_ID_SIZE: usize = 16;

/// Opaque 16-byte identifier of a logical file inside a vault.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FileId([u8; FILE_ID_SIZE]);

impl FileId {
    pub const fn from_bytes(bytes: [u8; FILE_ID_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; FILE_ID_SIZE] {
        &self.0
    }

    /// Lowercase hex (32 chars)
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse a 32-char hex string
    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let mut out = [0u8; FILE_ID_SIZE];
        hex::decode_to_slice(s, &mut out)?;
        Ok(Self(out))
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FileId({})", self.to_hex())
    }
}

impl FromStr for FileId {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl From<[u8; FILE_ID_SIZE]> for FileId {
    fn from(bytes: [u8; FILE_ID_SIZE]) -> Self {
        Self(bytes)
    }
}

/// Current Unix time in seconds. A clock set before the epoch reads as 0.
pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
