//! Bounded-memory streaming and concurrent use of one engine.

use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

use sigma_core::FileId;
use sigma_crypto::KeyState;
use sigma_scatter::{DimensionalScatterEngine, EngineParams, MemoryShardStore};

/// Deterministic pseudo-random byte source that never holds its output.
struct Generator {
    state: u64,
    remaining: u64,
}

impl Generator {
    fn new(seed: u64, len: u64) -> Self {
        Self {
            state: seed | 1,
            remaining: len,
        }
    }
}

impl Read for Generator {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = buf.len().min(self.remaining as usize);
        for b in &mut buf[..n] {
            // xorshift64
            self.state ^= self.state << 13;
            self.state ^= self.state >> 7;
            self.state ^= self.state << 17;
            *b = self.state as u8;
        }
        self.remaining -= n as u64;
        Ok(n)
    }
}

fn hash_reader(mut r: impl Read) -> blake3::Hash {
    let mut hasher = blake3::Hasher::new();
    std::io::copy(&mut r, &mut hasher).unwrap();
    hasher.finalize()
}

const MIB: usize = 1024 * 1024;

#[test]
fn streaming_scatter_stays_under_ceiling() {
    let ceiling = 512 * 1024;
    let params = EngineParams {
        chunk_size: 64 * 1024,
        memory_ceiling: ceiling,
        ..EngineParams::default()
    };
    let engine =
        DimensionalScatterEngine::new(params, Arc::new(MemoryShardStore::new())).unwrap();
    let state = KeyState::from_master_bytes([0x11; 64]);
    let id = FileId::from_bytes([0x22; 16]);
    let len = 8 * MIB as u64;

    let file = engine
        .scatter_reader_at(&state, id, Generator::new(7, len), Some(len), 0)
        .unwrap();
    assert_eq!(file.original_len, len);
    assert_eq!(file.chunk_count(), 128);
    assert!(engine.budget().peak() <= ceiling);
    assert_eq!(engine.budget().in_use(), 0);

    engine.budget().reset_peak();
    let mut hasher = blake3::Hasher::new();
    let partial = engine.gather_to_writer(&state, &file, &mut hasher).unwrap();
    assert!(partial.is_none());
    assert_eq!(hasher.finalize(), hash_reader(Generator::new(7, len)));
    assert!(engine.budget().peak() <= ceiling);
}

#[test]
fn reader_shorter_than_declared_size_still_roundtrips() {
    let engine = DimensionalScatterEngine::new(
        EngineParams {
            chunk_size: 1000,
            memory_ceiling: MIB,
            ..EngineParams::default()
        },
        Arc::new(MemoryShardStore::new()),
    )
    .unwrap();
    let state = KeyState::from_master_bytes([1; 64]);
    let file = engine
        .scatter_reader_at(&state, FileId::from_bytes([1; 16]), Generator::new(3, 2500), Some(9999), 0)
        .unwrap();
    assert_eq!(file.original_len, 2500);
    let out = engine.gather(&state, &file).unwrap();
    assert_eq!(blake3::hash(&out.data), hash_reader(Generator::new(3, 2500)));
}

#[test]
fn concurrent_files_share_one_budget() {
    let params = EngineParams {
        chunk_size: 16 * 1024,
        memory_ceiling: 256 * 1024,
        backpressure_timeout: Duration::from_secs(30),
        ..EngineParams::default()
    };
    let ceiling = params.memory_ceiling;
    let engine =
        DimensionalScatterEngine::new(params, Arc::new(MemoryShardStore::new())).unwrap();
    let state = KeyState::from_master_bytes([0x33; 64]);

    std::thread::scope(|s| {
        for t in 0..8u8 {
            let (engine, state) = (&engine, &state);
            s.spawn(move || {
                let id = FileId::from_bytes([t; 16]);
                let len = 200_000 + t as u64 * 1_111;
                let file = engine
                    .scatter_reader_at(state, id, Generator::new(t as u64, len), Some(len), 0)
                    .unwrap();
                let out = engine.gather(state, &file).unwrap();
                assert_eq!(
                    blake3::hash(&out.data),
                    hash_reader(Generator::new(t as u64, len))
                );
            });
        }
    });
    assert!(engine.budget().peak() <= ceiling);
    assert_eq!(engine.budget().in_use(), 0);
}
