//! Video encoder speed and quality control loop.

use std::time::Instant;

use parking_lot::Mutex;
use serde::Serialize;

use crate::batch::BatchConfig;
use crate::calculator::get_low_limit;
use crate::config::TunerSettings;
use crate::error::{EncoderError, TuneError};
use crate::global::{GlobalStatistics, WindowId};
use crate::stats::{default_math, logp, Math, TimedValue};
use crate::util::{to_percent, History};
use crate::window::{Backlog, WindowStatistics};

/// Values remembered for smoothing speed and quality.
pub const TUNING_RECS: usize = 100;

/// Decode speed in pixels per second below which the client is late.
pub const TARGET_DECODE_SPEED: f64 = 2_000_000.0;

/// A video encoder that can be retuned while it runs.
///
/// The encoder is shared with the thread compressing frames and guarded by
/// a [`Mutex`]. It may be closed at any time, in which case tuning is
/// skipped.
pub trait VideoEncoder: Send {
    /// Whether the encoder has been closed.
    fn is_closed(&self) -> bool;

    /// 0 is highest compression and slowest, 100 lowest and fastest.
    fn set_encoding_speed(&mut self, speed: u8) -> Result<(), EncoderError>;

    /// 0 is lowest quality and bandwidth, 100 the highest.
    fn set_encoding_quality(&mut self, quality: u8) -> Result<(), EncoderError>;
}

/// Result of one tuning pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Tuning {
    /// Encoding speed, 0-100.
    pub speed: u8,
    /// Encoding quality, 0-100.
    pub quality: u8,
    /// False if the encoder was closed and nothing was set.
    pub applied: bool,
}

/// Per-window encoder tuner.
///
/// Keeps the speed and quality history used to smooth consecutive targets.
#[derive(Debug, Clone)]
pub struct VideoTuner {
    math: Math,
    settings: TunerSettings,
    speed_history: History<TimedValue>,
    quality_history: History<TimedValue>,
}

impl VideoTuner {
    /// New tuner using the default math backend.
    pub fn new(settings: TunerSettings) -> Self {
        VideoTuner::with_math(settings, default_math())
    }

    /// New tuner computing with `math`.
    pub fn with_math(settings: TunerSettings, math: Math) -> Self {
        VideoTuner {
            math,
            settings,
            speed_history: History::new(TUNING_RECS),
            quality_history: History::new(TUNING_RECS),
        }
    }

    /// The overrides in use.
    pub fn settings(&self) -> &TunerSettings {
        &self.settings
    }

    /// Past speed targets.
    pub fn speed_history(&self) -> &History<TimedValue> {
        &self.speed_history
    }

    /// Past quality targets.
    pub fn quality_history(&self) -> &History<TimedValue> {
        &self.quality_history
    }

    /// Unsmoothed speed target, 0.0 to 100.0.
    ///
    /// Goes faster when damage takes longer to process than the delay
    /// allows for, or when the client decodes slowly.
    pub fn target_speed(
        &self,
        dimensions: (u32, u32),
        batch: &BatchConfig,
        global: &GlobalStatistics,
        stats: &WindowStatistics,
    ) -> f64 {
        let low_limit = get_low_limit(global.mmap_enabled(), dimensions);

        let min_damage_latency = 0.020 + 0.050 * low_limit / 1024.0 / 1024.0;
        let target_damage_latency = min_damage_latency + 10.0 * batch.delay / 1000.0;
        let damage_lateness = ((stats.avg_damage_in_latency - target_damage_latency) * 5.0).max(0.0);
        let decode_lateness = match stats.avg_decode_speed {
            Some(s) if s > 0.0 => TARGET_DECODE_SPEED / s,
            _ => 0.0,
        };

        let target = damage_lateness.max(decode_lateness).max(0.0);

        trace!(
            "Speed target_damage_latency={:.3} damage_lateness={:.2} decode_lateness={:.2}",
            target_damage_latency,
            damage_lateness,
            decode_lateness
        );

        100.0 * target.min(1.0)
    }

    /// Unsmoothed quality target, 0.0 to 100.0.
    ///
    /// Lowers quality when packets back up, when batching more than the
    /// minimum, or when the client latency rises above the target.
    pub fn target_quality(
        &self,
        dimensions: (u32, u32),
        batch: &BatchConfig,
        global: &GlobalStatistics,
        stats: &WindowStatistics,
        backlog: Backlog,
    ) -> f64 {
        let low_limit = get_low_limit(global.mmap_enabled(), dimensions);

        let packets_bl = 1.0 - logp(backlog.packets as f64 / low_limit);
        let batch_q = batch.min_delay / batch.min_delay.max(batch.delay);
        let mut target = packets_bl.min(batch_q);

        let recent = global.recent_client_latency();
        let mut latency_q = None;
        if global.has_client_latency() && recent > 0.0 {
            let q = 6.0 * stats.target_latency / recent;
            target = target.min(q);
            latency_q = Some(q);
        }

        trace!(
            "Quality packets_bl={:.2} batch_q={:.2} latency_q={:?}",
            packets_bl,
            batch_q,
            latency_q
        );

        100.0 * target.max(0.0).min(1.0)
    }

    /// Computes the next `(speed, quality)` and records the targets.
    ///
    /// Fixed values from the settings are returned as is and not recorded.
    pub fn compute(
        &self,
        now: Instant,
        dimensions: (u32, u32),
        batch: &BatchConfig,
        global: &GlobalStatistics,
        stats: &mut WindowStatistics,
    ) -> (u8, u8) {
        let speed = match self.settings.fixed_speed {
            Some(s) => s,
            None => {
                let target = self.target_speed(dimensions, batch, global, stats);
                let v = self.smooth(now, &self.speed_history, target, 1.2);
                to_percent(v)
            }
        };

        let quality = match self.settings.fixed_quality {
            Some(q) => q,
            None => {
                let backlog = stats.get_backlog(now);
                let target = self.target_quality(dimensions, batch, global, stats, backlog);
                let v = self.smooth(now, &self.quality_history, target, 1.1);
                to_percent(v)
            }
        };

        (speed, quality)
    }

    // Smooths `target` against the history, then remembers it.
    fn smooth(&self, now: Instant, history: &History<TimedValue>, target: f64, power: f64) -> f64 {
        let mut samples = history.snapshot();
        samples.push((now, target));
        let v = self
            .math
            .time_weighted_average(now, &samples, 0.1, power)
            .unwrap_or(target);
        history.push((now, target));
        v
    }

    /// Computes new settings and applies them to `encoder`.
    ///
    /// See [`VideoTuner::apply`] for the locking.
    #[allow(clippy::too_many_arguments)]
    pub fn update_video_encoder<E: VideoEncoder + ?Sized>(
        &self,
        now: Instant,
        wid: WindowId,
        dimensions: (u32, u32),
        batch: &BatchConfig,
        global: &GlobalStatistics,
        stats: &mut WindowStatistics,
        encoder: &Mutex<E>,
    ) -> Result<Tuning, TuneError> {
        let (speed, quality) = self.compute(now, dimensions, batch, global, stats);
        self.apply(wid, speed, quality, encoder)
    }

    /// Sets `speed` and `quality` on `encoder`.
    ///
    /// The lock is held only while the encoder is called and is released on
    /// every path, including encoder errors, which are returned. A closed
    /// encoder is skipped. Callers must not hold other window locks here,
    /// the encoder thread may keep this one for a whole frame.
    pub fn apply<E: VideoEncoder + ?Sized>(
        &self,
        wid: WindowId,
        speed: u8,
        quality: u8,
        encoder: &Mutex<E>,
    ) -> Result<Tuning, TuneError> {
        let mut lock = match self.settings.lock_timeout {
            None => encoder.lock(),
            Some(t) => encoder.try_lock_for(t).ok_or(TuneError::LockTimeout(t))?,
        };

        if lock.is_closed() {
            debug!("Encoder for {} closed, skip tuning", wid);
            return Ok(Tuning {
                speed,
                quality,
                applied: false,
            });
        }

        lock.set_encoding_speed(speed)?;
        lock.set_encoding_quality(quality)?;

        debug!("Encoder for {} speed={} quality={}", wid, speed, quality);
        crate::log_stat!("VIDEO_TUNING", wid, speed, quality);

        Ok(Tuning {
            speed,
            quality,
            applied: true,
        })
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::*;
    use crate::config::BatchSettings;

    #[derive(Debug, Default)]
    struct Enc {
        closed: bool,
        speed: Option<u8>,
        quality: Option<u8>,
    }

    impl VideoEncoder for Enc {
        fn is_closed(&self) -> bool {
            self.closed
        }

        fn set_encoding_speed(&mut self, speed: u8) -> Result<(), EncoderError> {
            self.speed = Some(speed);
            Ok(())
        }

        fn set_encoding_quality(&mut self, quality: u8) -> Result<(), EncoderError> {
            self.quality = Some(quality);
            Ok(())
        }
    }

    fn fixture() -> (BatchConfig, GlobalStatistics, WindowStatistics) {
        (
            BatchConfig::new(&BatchSettings::default()),
            GlobalStatistics::new(),
            WindowStatistics::new(),
        )
    }

    #[test]
    fn speed_without_lateness() {
        let (b, g, mut s) = fixture();
        s.avg_damage_in_latency = 0.0;
        let t = VideoTuner::new(TunerSettings::default());
        assert_eq!(t.target_speed((100, 100), &b, &g, &s), 0.0);
    }

    #[test]
    fn decode_speed_drives_speed() {
        let (b, g, mut s) = fixture();
        s.avg_damage_in_latency = 0.0;
        s.avg_decode_speed = Some(4_000_000.0);
        let t = VideoTuner::new(TunerSettings::default());
        assert!((t.target_speed((100, 100), &b, &g, &s) - 50.0).abs() < 1e-9);
    }

    #[test]
    fn quality_follows_batch_delay() {
        let (mut b, g, s) = fixture();
        let t = VideoTuner::new(TunerSettings::default());

        b.delay = b.min_delay;
        let q = t.target_quality((100, 100), &b, &g, &s, Backlog::default());
        assert_eq!(q, 100.0);

        b.delay = 4.0 * b.min_delay;
        let q = t.target_quality((100, 100), &b, &g, &s, Backlog::default());
        assert!((q - 25.0).abs() < 1e-9);
    }

    #[test]
    fn smoothing_lags_a_jump() {
        let (mut b, g, mut s) = fixture();
        b.delay = 1.0;
        let t = VideoTuner::new(TunerSettings::default());
        let now = Instant::now();

        s.avg_damage_in_latency = 0.0;
        for i in 0..5 {
            let (speed, _) = t.compute(now + Duration::from_millis(i * 100), (100, 100), &b, &g, &mut s);
            assert_eq!(speed, 0);
        }

        s.avg_damage_in_latency = 0.5;
        let at = now + Duration::from_millis(500);
        let (speed, _) = t.compute(at, (100, 100), &b, &g, &mut s);
        assert!(speed > 0 && speed < 100, "{}", speed);
        assert_eq!(t.speed_history().len(), 6);
        assert_eq!(t.speed_history().last(), Some((at, 100.0)));
    }

    #[test]
    fn fixed_values_bypass() {
        let (b, g, mut s) = fixture();
        let settings = TunerSettings {
            fixed_speed: Some(33),
            fixed_quality: Some(77),
            lock_timeout: None,
        };
        let t = VideoTuner::new(settings);
        let enc = Mutex::new(Enc::default());

        let r = t
            .update_video_encoder(Instant::now(), 1, (100, 100), &b, &g, &mut s, &enc)
            .unwrap();
        assert_eq!(
            r,
            Tuning {
                speed: 33,
                quality: 77,
                applied: true
            }
        );
        assert_eq!(enc.lock().speed, Some(33));
        assert_eq!(enc.lock().quality, Some(77));
        assert!(t.speed_history().is_empty());
        assert!(t.quality_history().is_empty());
    }

    #[test]
    fn lock_timeout() {
        let (b, g, mut s) = fixture();
        let settings = TunerSettings {
            lock_timeout: Some(Duration::from_millis(10)),
            ..Default::default()
        };
        let t = VideoTuner::new(settings);
        let enc = Mutex::new(Enc::default());

        let held = enc.lock();
        let r = t.update_video_encoder(Instant::now(), 1, (100, 100), &b, &g, &mut s, &enc);
        assert!(matches!(r, Err(TuneError::LockTimeout(_))));
        drop(held);

        let r = t.update_video_encoder(Instant::now(), 1, (100, 100), &b, &g, &mut s, &enc);
        assert!(r.unwrap().applied);
    }
}
