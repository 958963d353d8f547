//! Benchmark utilities.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use keelson_core::{Collaborators, Config, CoreResult, Engine, Mutation};
use rand::Rng;

/// Generate random payload bytes of the specified size.
pub fn random_payload(size: usize) -> Vec<u8> {
    let mut rng = rand::thread_rng();
    (0..size).map(|_| rng.gen()).collect()
}

/// Generate a batch of inserts with distinct keys and random payloads.
pub fn insert_batch(count: usize, payload_size: usize) -> Vec<Mutation> {
    (0..count)
        .map(|i| {
            Mutation::insert(format!("bench-{i:08}").into_bytes(), random_payload(payload_size))
                .with_source_text(format!("{i}"))
        })
        .collect()
}

/// Open an in-memory engine over local collaborators.
pub fn bench_engine() -> CoreResult<Engine> {
    Engine::open_in_memory(Config::new(), Collaborators::local())
}
