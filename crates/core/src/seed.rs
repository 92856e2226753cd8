//! Sampler seed generation.

/// A fresh random seed for a job that did not ask for one.
///
/// Seeds are 32-bit so they survive a round trip through any JSON number
/// and fit the `BIGINT` seed column without sign issues.
pub fn random_seed() -> u32 {
    rand::random::<u32>()
}

/// Use `requested` when present, otherwise draw a random seed.
pub fn resolve_seed(requested: Option<u32>) -> u32 {
    requested.unwrap_or_else(random_seed)
}
