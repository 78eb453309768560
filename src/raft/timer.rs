use rand::Rng;
use std::time::Duration;

/// Draws a timeout uniformly from `[base, 2 * base)`. Redrawing per tick
/// keeps concurrent candidates from splitting votes forever.
pub fn random_timeout(base: Duration) -> Duration {
    let base_ms = (base.as_millis() as u64).max(1);
    let mut rng = rand::thread_rng();
    Duration::from_millis(rng.gen_range(base_ms..base_ms * 2))
}
