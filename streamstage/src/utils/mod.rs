//! Timestamp, identifier and timing helpers.

pub mod timestamps;

pub use timestamps::{iso_timestamp, now_utc, Timestamp};

use rand::Rng;
use std::time::Duration;
use uuid::Uuid;

/// Generates a time-ordered identifier for one reconciler run.
///
/// Run ids appear in every emitted event so passes from different
/// processes working on the same stage can be told apart.
#[must_use]
pub fn generate_run_id() -> Uuid {
    Uuid::now_v7()
}

/// Returns `base` stretched by a random fraction in `[0, jitter]`.
#[must_use]
pub fn jittered(base: Duration, jitter: f64) -> Duration {
    if jitter <= 0.0 || base.is_zero() {
        return base;
    }
    let factor = rand::thread_rng().gen_range(0.0..=jitter);
    base + base.mul_f64(factor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_id_is_v7() {
        let id = generate_run_id();
        assert_eq!(id.get_version_num(), 7);
        assert_ne!(id, generate_run_id());
    }

    #[test]
    fn test_jittered_stays_in_range() {
        let base = Duration::from_millis(100);
        for _ in 0..50 {
            let d = jittered(base, 0.5);
            assert!(d >= base);
            assert!(d <= Duration::from_millis(150));
        }
        assert_eq!(jittered(base, 0.0), base);
        assert_eq!(jittered(Duration::ZERO, 0.5), Duration::ZERO);
    }
}
