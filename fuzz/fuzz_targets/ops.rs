#![no_main]

use libfuzzer_sys::{fuzz_mutator, fuzz_target, fuzzer_mutate};
use mutatis::Session;
use seglist::Config;
use seglist_fuzzing::Ops;

const HEAP_CAPACITY: usize = 1 << 20; // 1MiB

/// Every input is replayed against each of these heap shapes.
const CONFIGS: [Config; 3] = [
    Config::new(),
    // No initial chunk: every fit miss grows the heap by exactly the block.
    Config::new().with_chunk_size(0),
    // Only empty requests map to the minimum-size block.
    Config::new().with_chunk_size(256).with_minimum_block_request(0),
];

const fn bincode_config() -> impl bincode::config::Config {
    bincode::config::standard()
        .with_little_endian()
        .with_fixed_int_encoding()
}

fn decode(data: &[u8]) -> Option<Ops> {
    bincode::decode_from_slice::<Ops, _>(data, bincode_config())
        .ok()
        .map(|(ops, _)| ops)
}

/// Encode `ops` into `data`, dropping trailing ops until they fit.
fn encode(mut ops: Ops, data: &mut [u8]) -> Option<usize> {
    loop {
        if let Ok(len) = bincode::encode_into_slice(&ops, data, bincode_config()) {
            return Some(len);
        }
        if !ops.pop() {
            return None;
        }
    }
}

fuzz_mutator!(|data: &mut [u8], size: usize, max_size: usize, seed: u32| {
    let _ = env_logger::try_init();

    // Leave roughly one in eight inputs to libFuzzer's byte-level mutations.
    if seed.count_ones() % 8 == 0 {
        return fuzzer_mutate(data, size, max_size);
    }

    let mut ops = decode(&data[..size]).unwrap_or_default();
    let mut session = Session::new().seed(seed.into()).shrink(max_size < size);
    if session.mutate(&mut ops).is_ok() {
        if let Some(len) = encode(ops, &mut *data) {
            return len;
        }
    }

    fuzzer_mutate(data, size, max_size)
});

fuzz_target!(|data: &[u8]| {
    let _ = env_logger::try_init();
    let Some(ops) = decode(data) else {
        return;
    };
    for config in CONFIGS {
        if let Err(e) = ops.run_with_config(HEAP_CAPACITY, config) {
            panic!("error with {config:?}: {e}");
        }
    }
});
