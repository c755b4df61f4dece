//! Performance benchmarks for the swap buffer and reload targets.
//!
//! Run with: `cargo bench -p hotload`

#![allow(clippy::unwrap_used)]

use std::time::Duration;

use divan::Bencher;
use hotload::{ReloadSpec, Resource, SwapBuffer, Target};

fn main() {
    divan::main();
}

// ============================================================================
// Swap Buffer
// ============================================================================

fn published(value: Vec<u64>) -> SwapBuffer<Vec<u64>> {
    let buffer = SwapBuffer::new();
    buffer.publish(value).unwrap();
    buffer
}

#[divan::bench]
fn borrow_and_release(bencher: Bencher) {
    let buffer = published((0..64).collect());
    bencher.bench_local(|| {
        let lease = buffer.borrow().unwrap();
        divan::black_box(lease.len())
    });
}

#[divan::bench(threads = [1, 2, 4, 8])]
fn borrow_contended(bencher: Bencher) {
    let buffer = published((0..64).collect());
    bencher.bench(|| {
        let lease = buffer.borrow().unwrap();
        divan::black_box(lease[7])
    });
}

#[divan::bench]
fn publish_unborrowed(bencher: Bencher) {
    let buffer = SwapBuffer::with_retire_interval(Duration::from_millis(1));
    bencher.bench_local(|| buffer.publish(divan::black_box(42u64)).unwrap());
}

// ============================================================================
// Target
// ============================================================================

struct Table {
    rows: Vec<u64>,
}

impl Resource for Table {
    type Config = usize;
    type Input = usize;
    type Output = u64;
    type Error = std::io::Error;

    fn init(&mut self, size: &usize) -> Result<(), std::io::Error> {
        self.rows = (0..*size as u64).collect();
        Ok(())
    }

    fn process(&self, idx: usize) -> Result<u64, std::io::Error> {
        Ok(self.rows[idx % self.rows.len()])
    }

    fn signature(&self) -> u64 {
        1
    }

    fn reload_spec(&self) -> ReloadSpec {
        ReloadSpec::Periodic(Duration::from_secs(3600))
    }
}

#[divan::bench]
fn target_process(bencher: Bencher) {
    let target = Target::new(|| Table { rows: Vec::new() }, 1024);
    target.load().unwrap();
    bencher.bench_local(|| target.process(divan::black_box(513)).unwrap());
}

#[divan::bench]
fn baseline_vec_index(bencher: Bencher) {
    let rows: Vec<u64> = (0..1024).collect();
    bencher.bench_local(|| rows[divan::black_box(513) % rows.len()]);
}
