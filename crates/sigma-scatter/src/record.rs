//! Persisted vault header and scattered-file records.
//!
//! Every block is framed as `u32 body_len | body | digest(body)`, big-endian,
//! fixed-width, no padding. The header digest is plain blake3 because the
//! header is read before any key exists. File records are authenticated with
//! blake3 keyed by a sub-key of the master key, so a record can only be read
//! back by the vault that wrote it.
//!
//! Header body (100 bytes):
//! `version(1) mode(1) kdf(1) user_salt(32) mixer_salt(32) has_fp(1) fingerprint_hash(32)`
//!
//! A file record body is the header body followed by:
//! `file_id(16) original_len(8) chunk_size(4) data_shards(1) parity_shards(1)
//!  temporal_bucket(8) topology_seed(32) ratio_min(2) ratio_max(2) shard_count(4)`,
//! then the coordinates axis-major (8 × shard_count × u64), then per shard
//! `handle_len(2) handle checksum(32)`.

use sigma_core::config::AXIS_COUNT;
use sigma_core::{FileId, SigmaError, SigmaResult, FILE_ID_SIZE};
use sigma_crypto::ct::ct_eq_32;
use sigma_crypto::{KdfAlgorithm, KeyMode, KeySalts, KeyState, FINGERPRINT_HASH_SIZE, SALT_SIZE};

use crate::entropy::EntropyParams;
use crate::keys::ScatterKeys;
use crate::projector::DimensionalCoordinate;
use crate::scattered::{ScatteredFile, ShardRef};
use crate::store::ShardHandle;

pub const RECORD_VERSION: u8 = 1;

/// Body size of a bare vault header.
pub const HEADER_BODY_SIZE: usize = 3 + 2 * SALT_SIZE + 1 + FINGERPRINT_HASH_SIZE;

const FRAME_LEN_SIZE: usize = 4;
const FRAME_HASH_SIZE: usize = 32;

/// Key-derivation inputs that must survive between sessions. Contains no
/// secret material.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VaultHeader {
    pub mode: KeyMode,
    pub kdf: Option<KdfAlgorithm>,
    pub salts: KeySalts,
    pub fingerprint_hash: Option<[u8; FINGERPRINT_HASH_SIZE]>,
}

impl VaultHeader {
    pub fn from_state(state: &KeyState) -> Self {
        Self {
            mode: state.mode(),
            kdf: state.kdf(),
            salts: *state.salts(),
            fingerprint_hash: state.fingerprint_hash().copied(),
        }
    }

    fn write_body(&self, out: &mut Vec<u8>) {
        out.push(RECORD_VERSION);
        out.push(self.mode.code());
        out.push(self.kdf.map(KdfAlgorithm::code).unwrap_or(0));
        out.extend_from_slice(&self.salts.user_salt);
        out.extend_from_slice(&self.salts.mixer_salt);
        match &self.fingerprint_hash {
            Some(fp) => {
                out.push(1);
                out.extend_from_slice(fp);
            }
            None => {
                out.push(0);
                out.extend_from_slice(&[0u8; FINGERPRINT_HASH_SIZE]);
            }
        }
    }

    fn read_body(r: &mut Reader<'_>) -> SigmaResult<Self> {
        let version = r.u8()?;
        if version != RECORD_VERSION {
            return Err(SigmaError::format(format!("unsupported record version {version}")));
        }
        let mode_code = r.u8()?;
        let mode = KeyMode::from_code(mode_code)
            .ok_or_else(|| SigmaError::format(format!("unknown key mode {mode_code}")))?;
        let kdf = match r.u8()? {
            0 => None,
            code => Some(
                KdfAlgorithm::from_code(code)
                    .ok_or_else(|| SigmaError::format(format!("unknown kdf algorithm {code}")))?,
            ),
        };
        let salts = KeySalts {
            user_salt: r.array()?,
            mixer_salt: r.array()?,
        };
        let has_fp = r.u8()?;
        let fp: [u8; FINGERPRINT_HASH_SIZE] = r.array()?;
        let fingerprint_hash = match has_fp {
            0 => None,
            1 => Some(fp),
            other => return Err(SigmaError::format(format!("invalid fingerprint flag {other}"))),
        };
        Ok(Self {
            mode,
            kdf,
            salts,
            fingerprint_hash,
        })
    }

    /// Framed header block.
    pub fn encode(&self) -> SigmaResult<Vec<u8>> {
        let mut body = Vec::with_capacity(HEADER_BODY_SIZE);
        self.write_body(&mut body);
        frame(&body, None)
    }

    pub fn decode(bytes: &[u8]) -> SigmaResult<Self> {
        let body = unframe(bytes, None)?;
        let mut r = Reader::new(body);
        let header = Self::read_body(&mut r)?;
        r.finish()?;
        Ok(header)
    }
}

/// Serialize a scattered file together with the header it was written under,
/// authenticated under `state`'s record key.
pub fn encode_record(state: &KeyState, header: &VaultHeader, file: &ScatteredFile) -> SigmaResult<Vec<u8>> {
    let count = u32::try_from(file.shard_refs.len())
        .map_err(|_| SigmaError::overflow("shard count exceeds u32"))?;
    if file.shard_coordinates.len() != file.shard_refs.len() {
        return Err(SigmaError::format("coordinate and shard tables differ in length"));
    }

    let mut body = Vec::with_capacity(
        HEADER_BODY_SIZE + 112 + file.shard_refs.len() * (AXIS_COUNT * 8 + 2 + 32 + 64),
    );
    header.write_body(&mut body);
    body.extend_from_slice(file.file_id.as_bytes());
    body.extend_from_slice(&file.original_len.to_be_bytes());
    body.extend_from_slice(&file.chunk_size.to_be_bytes());
    body.push(file.data_shards);
    body.push(file.parity_shards);
    body.extend_from_slice(&file.temporal_bucket.to_be_bytes());
    body.extend_from_slice(&file.topology_seed);
    body.extend_from_slice(&file.entropy.ratio_min_permille.to_be_bytes());
    body.extend_from_slice(&file.entropy.ratio_max_permille.to_be_bytes());
    body.extend_from_slice(&count.to_be_bytes());

    for axis in 0..AXIS_COUNT {
        for coord in &file.shard_coordinates {
            body.extend_from_slice(&coord.0[axis].to_be_bytes());
        }
    }
    for r in &file.shard_refs {
        let handle = r.handle.as_bytes();
        let len = u16::try_from(handle.len())
            .map_err(|_| SigmaError::overflow("shard handle longer than u16::MAX"))?;
        body.extend_from_slice(&len.to_be_bytes());
        body.extend_from_slice(handle);
        body.extend_from_slice(&r.checksum);
    }
    let keys = ScatterKeys::derive(state)?;
    frame(&body, Some(&keys.record))
}

/// Parse a record written by [`encode_record`]. A record written under a
/// different key fails authentication before any field is read.
pub fn decode_record(state: &KeyState, bytes: &[u8]) -> SigmaResult<(VaultHeader, ScatteredFile)> {
    let keys = ScatterKeys::derive(state)?;
    let body = unframe(bytes, Some(&keys.record))?;
    let mut r = Reader::new(body);
    let header = VaultHeader::read_body(&mut r)?;

    let file_id = FileId::from_bytes(r.array::<FILE_ID_SIZE>()?);
    let original_len = r.u64()?;
    let chunk_size = r.u32()?;
    let data_shards = r.u8()?;
    let parity_shards = r.u8()?;
    let temporal_bucket = r.u64()?;
    let topology_seed = r.array::<32>()?;
    let entropy = EntropyParams::new(r.u16()?, r.u16()?)
        .map_err(|e| SigmaError::format(format!("entropy parameters: {e}")))?;
    let count = r.u32()? as usize;

    // Bound the allocation by what the remaining bytes can actually hold.
    let min_per_shard = AXIS_COUNT * 8 + 2 + 32;
    if count.saturating_mul(min_per_shard) > r.remaining() {
        return Err(SigmaError::format(format!(
            "record claims {count} shards but only {} bytes remain",
            r.remaining()
        )));
    }

    let mut coords = vec![[0u64; AXIS_COUNT]; count];
    for axis in 0..AXIS_COUNT {
        for c in coords.iter_mut() {
            c[axis] = r.u64()?;
        }
    }
    let mut shard_refs = Vec::with_capacity(count);
    for _ in 0..count {
        let len = r.u16()? as usize;
        let handle = ShardHandle::from_bytes(r.take(len)?.to_vec());
        shard_refs.push(ShardRef {
            handle,
            checksum: r.array()?,
        });
    }
    r.finish()?;

    let file = ScatteredFile {
        file_id,
        original_len,
        chunk_size,
        data_shards,
        parity_shards,
        temporal_bucket,
        topology_seed,
        entropy,
        shard_coordinates: coords.into_iter().map(DimensionalCoordinate).collect(),
        shard_refs,
    };
    if !file.is_consistent() {
        return Err(SigmaError::format(format!(
            "record for {file_id}: {} shards do not fit {} chunks of {}+{}",
            file.shard_refs.len(),
            file.chunk_count(),
            data_shards,
            parity_shards
        )));
    }
    Ok((header, file))
}

fn digest(body: &[u8], key: Option<&[u8; 32]>) -> [u8; FRAME_HASH_SIZE] {
    match key {
        Some(key) => *blake3::keyed_hash(key, body).as_bytes(),
        None => *blake3::hash(body).as_bytes(),
    }
}

fn frame(body: &[u8], key: Option<&[u8; 32]>) -> SigmaResult<Vec<u8>> {
    let len = u32::try_from(body.len()).map_err(|_| SigmaError::overflow("record body exceeds u32"))?;
    let mut out = Vec::with_capacity(FRAME_LEN_SIZE + body.len() + FRAME_HASH_SIZE);
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(body);
    out.extend_from_slice(&digest(body, key));
    Ok(out)
}

fn unframe<'a>(bytes: &'a [u8], key: Option<&[u8; 32]>) -> SigmaResult<&'a [u8]> {
    let mut r = Reader::new(bytes);
    let len = r.u32()? as usize;
    let body = r.take(len)?;
    let expected: [u8; FRAME_HASH_SIZE] = r.array()?;
    r.finish()?;
    if !ct_eq_32(&digest(body, key), &expected) {
        return Err(SigmaError::format("record authentication failed"));
    }
    Ok(body)
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> SigmaResult<&'a [u8]> {
        if n > self.remaining() {
            return Err(SigmaError::format(format!(
                "truncated record: need {n} bytes at offset {}, {} left",
                self.pos,
                self.remaining()
            )));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn array<const N: usize>(&mut self) -> SigmaResult<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> SigmaResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> SigmaResult<u16> {
        Ok(u16::from_be_bytes(self.array()?))
    }

    fn u32(&mut self) -> SigmaResult<u32> {
        Ok(u32::from_be_bytes(self.array()?))
    }

    fn u64(&mut self) -> SigmaResult<u64> {
        Ok(u64::from_be_bytes(self.array()?))
    }

    fn finish(&self) -> SigmaResult<()> {
        if self.remaining() != 0 {
            return Err(SigmaError::format(format!(
                "{} trailing bytes after record",
                self.remaining()
            )));
        }
        Ok(())
    }
}
