use std::time::Instant;

mod history;

pub use history::History;

/// Seconds from `t` to `now`, zero if `t` is in the future.
#[inline]
pub(crate) fn age_secs(now: Instant, t: Instant) -> f64 {
    now.saturating_duration_since(t).as_secs_f64()
}

/// Truncate to a whole percentage in `0..=100`.
#[inline]
pub(crate) fn to_percent(v: f64) -> u8 {
    if v.is_nan() {
        return 0;
    }
    v.clamp(0.0, 100.0) as u8
}

#[cfg(test)]
mod test {
    use std::time::{Duration, Instant};

    use super::*;

    #[test]
    fn age_never_negative() {
        let now = Instant::now();
        assert_eq!(age_secs(now, now + Duration::from_secs(1)), 0.0);
        assert_eq!(age_secs(now + Duration::from_millis(1500), now), 1.5);
    }

    #[test]
    fn percent_truncates_and_clamps() {
        assert_eq!(to_percent(99.9), 99);
        assert_eq!(to_percent(-3.0), 0);
        assert_eq!(to_percent(250.0), 100);
        assert_eq!(to_percent(f64::NAN), 0);
    }
}
