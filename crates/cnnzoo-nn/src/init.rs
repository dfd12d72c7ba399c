//! Parameter initialization.
//!
//! Every layer draws its weights from a process-wide seed counter, so a
//! sequence of constructions following [`manual_seed`] is reproducible.

use std::sync::atomic::{AtomicU64, Ordering};

use cnnzoo_core::Tensor;

static NEXT_SEED: AtomicU64 = AtomicU64::new(42);

/// Reset the seed counter used by subsequent layer constructions.
pub fn manual_seed(seed: u64) {
    NEXT_SEED.store(seed, Ordering::SeqCst);
}

/// Take the next seed from the counter.
pub fn next_seed() -> u64 {
    NEXT_SEED.fetch_add(1, Ordering::SeqCst)
}

/// Uniform in `[-bound, bound)`.
pub fn uniform(shape: Vec<usize>, bound: f64) -> Tensor<f32> {
    Tensor::rand_uniform(shape, -bound, bound, Some(next_seed()))
}

/// Kaiming-uniform with `a = sqrt(5)`, which reduces to a bound of `1 / sqrt(fan_in)`.
pub fn kaiming_uniform(shape: Vec<usize>, fan_in: usize) -> Tensor<f32> {
    uniform(shape, 1.0 / (fan_in.max(1) as f64).sqrt())
}
