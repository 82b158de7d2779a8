use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde::Serialize;

use crate::batch::{BatchConfig, BatchInfo};
use crate::calculator::{calculate_batch_delay, may_calculate_batch_delay, DelayDecision};
use crate::config::Config;
use crate::debug::{Decision, DelayLog};
use crate::error::TuneError;
use crate::global::{GlobalStatistics, WindowId};
use crate::tuner::{Tuning, VideoEncoder, VideoTuner};
use crate::window::{WindowInfo, WindowStatistics};

/// Shared handle to a window's encoder.
pub type SharedEncoder = Arc<Mutex<dyn VideoEncoder>>;

/// The part of a window that is recalculated, always under one lock.
#[derive(Debug)]
pub struct WindowState {
    /// Current width and height.
    pub dimensions: (u32, u32),
    /// Batching state.
    pub batch: BatchConfig,
    /// Telemetry.
    pub stats: WindowStatistics,
}

/// Everything the control loops need for one window.
///
/// Recalculations of one window are serialized by an internal lock, while
/// different windows proceed in parallel against the shared
/// [`GlobalStatistics`]. Connection level averages are refreshed by the
/// owner of the `GlobalStatistics` with [`GlobalStatistics::update_averages`].
pub struct WindowSource {
    wid: WindowId,
    global: Arc<GlobalStatistics>,
    state: Mutex<WindowState>,
    tuner: VideoTuner,
    encoder: Option<SharedEncoder>,
    log: Option<Arc<DelayLog>>,
}

impl WindowSource {
    /// New window using `config` and sharing `global` with its siblings.
    pub fn new(wid: WindowId, dimensions: (u32, u32), config: &Config, global: Arc<GlobalStatistics>) -> Self {
        let math = global.math().clone();
        WindowSource {
            wid,
            state: Mutex::new(WindowState {
                dimensions,
                batch: BatchConfig::new(config.batch()),
                stats: WindowStatistics::with_math(math.clone()),
            }),
            tuner: VideoTuner::with_math(config.tuner().clone(), math),
            global,
            encoder: None,
            log: None,
        }
    }

    /// Tune `encoder` from [`WindowSource::tune_encoder`].
    pub fn with_encoder(mut self, encoder: SharedEncoder) -> Self {
        self.encoder = Some(encoder);
        self
    }

    /// Record every decision in `log`.
    pub fn with_log(mut self, log: Arc<DelayLog>) -> Self {
        self.log = Some(log);
        self
    }

    /// The window id.
    pub fn wid(&self) -> WindowId {
        self.wid
    }

    /// The connection statistics.
    pub fn global(&self) -> &Arc<GlobalStatistics> {
        &self.global
    }

    /// The current delay in milliseconds.
    pub fn delay(&self) -> f64 {
        self.state.lock().batch.delay
    }

    /// The window was resized.
    pub fn resize(&self, dimensions: (u32, u32)) {
        self.state.lock().dimensions = dimensions;
    }

    /// Run `f` with the window state locked.
    pub fn with_state<R>(&self, f: impl FnOnce(&mut WindowState) -> R) -> R {
        f(&mut *self.state.lock())
    }

    /// A damage event of `pixels` arrived.
    ///
    /// Records it and recalculates the delay if due.
    pub fn on_damage(&self, now: Instant, pixels: u64) -> Option<DelayDecision> {
        self.global.record_damage_event(now, self.wid, pixels);

        let decision = {
            let mut lock = self.state.lock();
            let s = &mut *lock;
            s.stats.record_damage_event(now);
            if !s.batch.is_due(now) {
                return None;
            }
            s.stats.update_averages(now);
            may_calculate_batch_delay(now, self.wid, s.dimensions, &mut s.batch, &self.global, &mut s.stats)
        };

        self.record(decision)
    }

    /// Recalculate the delay now, regardless of when it last was.
    pub fn recalculate(&self, now: Instant) -> Option<DelayDecision> {
        let decision = {
            let mut lock = self.state.lock();
            let s = &mut *lock;
            s.stats.update_averages(now);
            calculate_batch_delay(now, self.wid, s.dimensions, &mut s.batch, &self.global, &mut s.stats)
        };

        self.record(decision)
    }

    /// Retune the encoder, if there is one.
    pub fn tune_encoder(&self, now: Instant) -> Result<Option<Tuning>, TuneError> {
        let Some(encoder) = &self.encoder else {
            return Ok(None);
        };

        let (speed, quality) = {
            let mut lock = self.state.lock();
            let s = &mut *lock;
            self.tuner
                .compute(now, s.dimensions, &s.batch, &self.global, &mut s.stats)
        };

        // Window lock released before waiting on the encoder.
        let tuning = self.tuner.apply(self.wid, speed, quality, &**encoder)?;

        if let Some(log) = &self.log {
            log.add(Decision::Tuning {
                wid: self.wid,
                tuning,
            });
        }

        Ok(Some(tuning))
    }

    /// Summary for diagnostics.
    pub fn info(&self) -> WindowSourceInfo {
        let lock = self.state.lock();
        WindowSourceInfo {
            wid: self.wid,
            dimensions: lock.dimensions,
            batch: lock.batch.info(),
            stats: lock.stats.info(),
        }
    }

    fn record(&self, decision: Option<DelayDecision>) -> Option<DelayDecision> {
        if let (Some(log), Some(d)) = (&self.log, &decision) {
            log.add(Decision::Delay(d.clone()));
        }
        decision
    }
}

/// Snapshot of a [`WindowSource`].
#[derive(Debug, Clone, Serialize)]
pub struct WindowSourceInfo {
    /// The window.
    pub wid: WindowId,
    /// Width and height.
    pub dimensions: (u32, u32),
    /// Batching state.
    pub batch: BatchInfo,
    /// Telemetry.
    pub stats: WindowInfo,
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::*;
    use crate::error::EncoderError;

    struct Closed;

    impl VideoEncoder for Closed {
        fn is_closed(&self) -> bool {
            true
        }

        fn set_encoding_speed(&mut self, _: u8) -> Result<(), EncoderError> {
            Err(EncoderError::new("closed"))
        }

        fn set_encoding_quality(&mut self, _: u8) -> Result<(), EncoderError> {
            Err(EncoderError::new("closed"))
        }
    }

    fn source() -> WindowSource {
        WindowSource::new(1, (640, 480), &Config::new(), Arc::new(GlobalStatistics::new()))
    }

    #[test]
    fn damage_rate_limited() {
        let w = source();
        let now = Instant::now();

        // First event: nothing to go on yet.
        assert_eq!(w.on_damage(now, 1000), None);
        assert_eq!(w.delay(), 50.0);
        assert_eq!(w.global().damage_events_since(1, now), (1, 1000));

        // A long idle period then lets the damage-rate factor act.
        let later = now + Duration::from_secs(3);
        let d = w.recalculate(later).unwrap();
        assert!(d.delay < 50.0);
        assert_eq!(w.delay(), d.delay);
    }

    #[test]
    fn no_encoder() {
        let w = source();
        assert_eq!(w.tune_encoder(Instant::now()).unwrap(), None);
    }

    #[test]
    fn closed_encoder_skipped() {
        let log = Arc::new(DelayLog::new(100));
        let w = source()
            .with_encoder(Arc::new(Mutex::new(Closed)))
            .with_log(log.clone());
        let t = w.tune_encoder(Instant::now()).unwrap().unwrap();
        assert!(!t.applied);
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn info_snapshot() {
        let w = source();
        w.resize((100, 50));
        let info = w.info();
        assert_eq!(info.wid, 1);
        assert_eq!(info.dimensions, (100, 50));
        assert_eq!(info.batch.delay, 50.0);
        assert_eq!(w.with_state(|s| s.stats.pending_acks()), 0);
    }

    #[test]
    fn window_source_is_send_sync() {
        fn is_send<T: Send>(_t: &T) {}
        fn is_sync<T: Sync>(_t: &T) {}
        let w = source();
        is_send(&w);
        is_sync(&w);
    }
}
