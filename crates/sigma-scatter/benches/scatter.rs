use std::sync::Arc;

use sigma_core::FileId;
use sigma_crypto::KeyState;
use sigma_scatter::entropy::{mix_in_place, StreamContext};
use sigma_scatter::keys::ScatterKeys;
use sigma_scatter::{
    DimensionalCoordinate, DimensionalScatterEngine, EngineParams, MemoryShardStore, ReedSolomon,
};

fn make_data(size: usize) -> Vec<u8> {
    // Semi-realistic data: repeating pattern with some entropy
    (0..size)
        .map(|i| (i.wrapping_mul(7) ^ (i >> 3)) as u8)
        .collect()
}

fn engine() -> DimensionalScatterEngine {
    let params = EngineParams {
        chunk_size: 256 * 1024,
        memory_ceiling: 16 * 1024 * 1024,
        ..EngineParams::default()
    };
    DimensionalScatterEngine::new(params, Arc::new(MemoryShardStore::new())).unwrap()
}

#[divan::bench(args = [1024, 65536, 1048576])]
fn entropy_mix(bencher: divan::Bencher, size: usize) {
    let keys = ScatterKeys::derive(&KeyState::from_master_bytes([1; 64])).unwrap();
    let id = FileId::from_bytes([1; 16]);
    let anchor = DimensionalCoordinate([3; 8]);
    let ctx = StreamContext { file_id: &id, chunk_index: 0, anchor: &anchor, bucket: 0 };
    let mut data = make_data(size);
    bencher
        .counter(divan::counter::BytesCount::new(size))
        .bench_local(|| mix_in_place(&keys, &ctx, 129, divan::black_box(&mut data)));
}

#[divan::bench(args = [65536, 1048576])]
fn rs_encode(bencher: divan::Bencher, size: usize) {
    let rs = ReedSolomon::new(6, 2).unwrap();
    let shard_len = rs.shard_len(size);
    let mut buf = make_data(shard_len * rs.total_shards());
    bencher
        .counter(divan::counter::BytesCount::new(size))
        .bench_local(|| rs.encode(divan::black_box(&mut buf), shard_len).unwrap());
}

#[divan::bench(args = [1024, 65536, 1048576, 4194304])]
fn scatter(bencher: divan::Bencher, size: usize) {
    let engine = engine();
    let state = KeyState::from_master_bytes([2; 64]);
    let data = make_data(size);
    bencher
        .counter(divan::counter::BytesCount::new(size))
        .bench_local(|| {
            let file = engine
                .scatter_at(&state, FileId::from_bytes([9; 16]), divan::black_box(&data), 0)
                .unwrap();
            engine.delete(&file, false).unwrap();
        });
}

#[divan::bench(args = [1024, 65536, 1048576, 4194304])]
fn gather(bencher: divan::Bencher, size: usize) {
    let engine = engine();
    let state = KeyState::from_master_bytes([2; 64]);
    let file = engine
        .scatter_at(&state, FileId::from_bytes([9; 16]), &make_data(size), 0)
        .unwrap();
    bencher
        .counter(divan::counter::BytesCount::new(size))
        .bench(|| engine.gather(&state, divan::black_box(&file)).unwrap());
}

fn main() {
    divan::main();
}
