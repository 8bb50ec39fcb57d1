use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Derive `n` sub-seeds from `seed`.
///
/// The sub-seeds are consecutive draws of a `StdRng` seeded with `seed`, so
/// the result is a pure function of `(seed, n)` and the first `k` sub-seeds
/// do not depend on `n`.
pub fn split_seed(seed: u64, n: usize) -> Vec<u64> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n).map(|_| rng.random::<u64>()).collect()
}
