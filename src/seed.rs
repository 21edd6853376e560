//! Process-wide random seed source.
//!
//! Seeds not given explicitly are drawn from one shared generator, lazily
//! seeded from OS entropy and guarded by its own lock. Reproducibility comes
//! only from explicit seeds: nothing should rely on the shared generator's
//! state across calls.

use std::sync::OnceLock;

use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Seeds are drawn from `0..SEED_LIMIT`.
pub const SEED_LIMIT: u64 = 1 << 30;

static SHARED: OnceLock<Mutex<ChaCha8Rng>> = OnceLock::new();

fn shared() -> &'static Mutex<ChaCha8Rng> {
    SHARED.get_or_init(|| Mutex::new(ChaCha8Rng::from_entropy()))
}

/// Draws a fresh seed from the shared generator.
pub fn draw_seed() -> u64 {
    shared().lock().gen_range(0..SEED_LIMIT)
}

/// The explicit seed when given, otherwise a fresh draw.
pub fn resolve_seed(explicit: Option<u64>) -> u64 {
    explicit.unwrap_or_else(draw_seed)
}

/// `count` seeds derived deterministically from `base`.
pub fn derive_seeds(base: u64, count: usize) -> Vec<u64> {
    let mut rng = ChaCha8Rng::seed_from_u64(base);
    (0..count).map(|_| rng.gen_range(0..SEED_LIMIT)).collect()
}

/// `count` seeds for retrying an attempt seeded with `seed`.
///
/// Drawn from a separate stream, so they do not repeat the seeds
/// [`derive_seeds`] produces for the same value.
pub fn retry_seeds(seed: u64, count: usize) -> Vec<u64> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    rng.set_stream(1);
    (0..count).map(|_| rng.gen_range(0..SEED_LIMIT)).collect()
}
