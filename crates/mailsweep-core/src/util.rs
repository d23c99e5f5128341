//! Small shared helpers.

use std::time::{SystemTime, UNIX_EPOCH};

/// Cheap pseudo-random jitter in `0..max_ms`, seeded from the wall clock.
/// Good enough to de-synchronise worker startups; not a real RNG.
pub fn jitter_ms(max_ms: u64) -> u64 {
    if max_ms == 0 {
        return 0;
    }
    let seed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0x9e3779b97f4a7c15);
    let mut x = seed | 1;
    x ^= x << 13;
    x ^= x >> 7;
    x ^= x << 17;
    x % max_ms
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jitter_stays_in_range() {
        for _ in 0..100 {
            assert!(jitter_ms(600) < 600);
        }
        assert_eq!(jitter_ms(0), 0);
    }
}
