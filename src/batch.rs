use std::time::{Duration, Instant};

use serde::Serialize;

use crate::config::BatchSettings;
use crate::stats::{Factor, ListStats};
use crate::util::History;

/// Number of delays remembered in each of the two delay histories.
pub const DELAY_RECS: usize = 64;

/// One window's batching state.
///
/// Created when the window is mapped, dropped when it closes. The
/// [`calculate_batch_delay`][crate::calculate_batch_delay] loop updates
/// `delay`, and the send scheduler reads it back to decide how long to
/// accumulate damage before flushing.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Current delay in milliseconds.
    pub delay: f64,
    /// Lower bound in milliseconds.
    pub min_delay: f64,
    /// Upper bound in milliseconds.
    pub max_delay: f64,
    /// Never drop below `min_delay`.
    pub always: bool,
    /// Minimum interval between recalculations.
    pub recalculate_delay: Duration,
    /// Event count per `time_unit` that forces batching.
    pub max_events: usize,
    /// Pixel count per `time_unit` that forces batching.
    pub max_pixels: u64,
    /// Counting window for `max_events` and `max_pixels`.
    pub time_unit: Duration,
    /// Delays the controller decided on.
    pub last_delays: History<(Instant, f64)>,
    /// Delays the send scheduler actually waited.
    pub last_actual_delays: History<(Instant, f64)>,
    /// Time of the last recalculation.
    pub last_updated: Option<Instant>,
    /// Factors used by the last recalculation.
    pub factors: Vec<Factor>,
}

impl BatchConfig {
    /// New config with the delay at `start_delay`.
    pub fn new(settings: &BatchSettings) -> Self {
        BatchConfig {
            delay: settings.start_delay,
            min_delay: settings.min_delay,
            max_delay: settings.max_delay,
            always: settings.always,
            recalculate_delay: settings.recalculate_delay,
            max_events: settings.max_events,
            max_pixels: settings.max_pixels,
            time_unit: settings.time_unit,
            last_delays: History::new(DELAY_RECS),
            last_actual_delays: History::new(DELAY_RECS),
            last_updated: None,
            factors: Vec::new(),
        }
    }

    /// Copy of the tuning with empty histories, for a derived region such as
    /// a video area split off the window.
    pub fn fork(&self) -> Self {
        BatchConfig {
            last_delays: History::new(DELAY_RECS),
            last_actual_delays: History::new(DELAY_RECS),
            last_updated: None,
            factors: Vec::new(),
            ..self.clone()
        }
    }

    /// Record the delay the controller asked for.
    pub fn record_delay(&self, now: Instant, delay: f64) {
        self.last_delays.push((now, delay));
    }

    /// Record the delay the send scheduler actually waited.
    pub fn record_actual_delay(&self, now: Instant, delay: f64) {
        self.last_actual_delays.push((now, delay));
    }

    /// Whether `recalculate_delay` has passed since the last recalculation.
    pub fn is_due(&self, now: Instant) -> bool {
        match self.last_updated {
            None => true,
            Some(t) => now.saturating_duration_since(t) > self.recalculate_delay,
        }
    }

    /// The current delay as a [`Duration`] for the send scheduler.
    pub fn delay_duration(&self) -> Duration {
        Duration::from_secs_f64(self.delay.max(0.0) / 1000.0)
    }

    /// Summary for diagnostics.
    pub fn info(&self) -> BatchInfo {
        let values = |h: &History<(Instant, f64)>| ListStats::new(h.snapshot().into_iter().map(|(_, d)| d));
        BatchInfo {
            delay: self.delay,
            min_delay: self.min_delay,
            max_delay: self.max_delay,
            always: self.always,
            delays: values(&self.last_delays),
            actual_delays: values(&self.last_actual_delays),
            factors: self.factors.clone(),
        }
    }
}

/// Snapshot of a [`BatchConfig`].
#[derive(Debug, Clone, Serialize)]
pub struct BatchInfo {
    /// Current delay in milliseconds.
    pub delay: f64,
    /// Lower bound in milliseconds.
    pub min_delay: f64,
    /// Upper bound in milliseconds.
    pub max_delay: f64,
    /// Whether the minimum is always enforced.
    pub always: bool,
    /// Stats over the decided delays.
    pub delays: Option<ListStats>,
    /// Stats over the actual delays.
    pub actual_delays: Option<ListStats>,
    /// Factors used by the last recalculation.
    pub factors: Vec<Factor>,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn starts_at_start_delay() {
        let b = BatchConfig::new(&BatchSettings::default());
        assert_eq!(b.delay, 50.0);
        assert_eq!(b.min_delay, 5.0);
        assert_eq!(b.max_delay, 15_000.0);
        assert!(b.last_delays.is_empty());
        assert_eq!(b.last_delays.capacity(), DELAY_RECS);
        assert_eq!(b.delay_duration(), Duration::from_millis(50));
    }

    #[test]
    fn due_after_recalculate_delay() {
        let now = Instant::now();
        let mut b = BatchConfig::new(&BatchSettings::default());
        assert!(b.is_due(now));

        b.last_updated = Some(now);
        assert!(!b.is_due(now + Duration::from_millis(40)));
        assert!(b.is_due(now + Duration::from_millis(41)));
    }

    #[test]
    fn fork_keeps_tuning_not_history() {
        let now = Instant::now();
        let mut b = BatchConfig::new(&BatchSettings::default());
        b.delay = 120.0;
        b.last_updated = Some(now);
        b.record_delay(now, 120.0);
        b.record_actual_delay(now, 130.0);

        let f = b.fork();
        assert_eq!(f.delay, 120.0);
        assert_eq!(f.last_updated, None);
        assert!(f.last_delays.is_empty());
        assert!(f.last_actual_delays.is_empty());

        // Plain clone copies the histories, detached.
        let c = b.clone();
        b.record_delay(now, 1.0);
        assert_eq!(c.last_delays.len(), 1);
        assert_eq!(b.last_delays.len(), 2);
    }

    #[test]
    fn info_serializes() {
        let now = Instant::now();
        let b = BatchConfig::new(&BatchSettings::default());
        b.record_actual_delay(now, 40.0);
        b.record_actual_delay(now, 60.0);

        let info = b.info();
        assert!(info.delays.is_none());
        assert_eq!(info.actual_delays.as_ref().map(|s| s.avg), Some(50.0));

        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["delay"], 50.0);
        assert_eq!(json["actual_delays"]["count"], 2);
    }
}
