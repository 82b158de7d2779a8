use std::time::Duration;

use crate::error::ConfigError;

/// Lowest delay in milliseconds the controller normally settles on.
pub const MIN_DELAY: f64 = 5.0;
/// Delay in milliseconds of a newly mapped window.
pub const START_DELAY: f64 = 50.0;
/// Highest delay in milliseconds.
pub const MAX_DELAY: f64 = 15_000.0;
/// Minimum interval between two recalculations for one window.
pub const RECALCULATE_DELAY: Duration = Duration::from_millis(40);
/// Damage events per time unit above which batching is forced.
pub const MAX_EVENTS: usize = 50;
/// Damaged pixels per time unit above which batching is forced.
pub const MAX_PIXELS: u64 = 1024 * 1024 * 50;
/// Window over which [`MAX_EVENTS`] and [`MAX_PIXELS`] are counted.
pub const TIME_UNIT: Duration = Duration::from_secs(1);

/// Per-window batching bounds and cadence.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchSettings {
    /// Lower bound for the delay in milliseconds. Default 5.
    pub min_delay: f64,
    /// Initial delay in milliseconds. Default 50.
    pub start_delay: f64,
    /// Upper bound for the delay in milliseconds. Default 15000.
    pub max_delay: f64,
    /// Minimum interval between two recalculations. Default 40ms.
    pub recalculate_delay: Duration,
    /// Damage events per `time_unit` that force batching. Default 50.
    pub max_events: usize,
    /// Damaged pixels per `time_unit` that force batching. Default 50 megapixels.
    pub max_pixels: u64,
    /// Counting window for `max_events` and `max_pixels`. Default 1s.
    pub time_unit: Duration,
    /// Never let the delay drop below `min_delay`. Default false.
    pub always: bool,
}

impl Default for BatchSettings {
    fn default() -> Self {
        BatchSettings {
            min_delay: MIN_DELAY,
            start_delay: START_DELAY,
            max_delay: MAX_DELAY,
            recalculate_delay: RECALCULATE_DELAY,
            max_events: MAX_EVENTS,
            max_pixels: MAX_PIXELS,
            time_unit: TIME_UNIT,
            always: false,
        }
    }
}

/// Video encoder tuning overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TunerSettings {
    /// Operator forced encoding speed, bypasses the heuristics.
    pub fixed_speed: Option<u8>,
    /// Operator forced encoding quality, bypasses the heuristics.
    pub fixed_quality: Option<u8>,
    /// Give up acquiring the encoder lock after this long. `None` blocks.
    pub lock_timeout: Option<Duration>,
}

/// Diagnostic dump of recent decisions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebugSettings {
    /// Record decisions in a [`DelayLog`][crate::DelayLog]. Default false.
    pub debug_delay: bool,
    /// Number of decisions kept before a dump. Default 1000.
    pub max_messages: usize,
    /// How often the scheduler dumps the log. Default 30s.
    pub dump_interval: Duration,
}

impl Default for DebugSettings {
    fn default() -> Self {
        DebugSettings {
            debug_delay: false,
            max_messages: 1000,
            dump_interval: Duration::from_secs(30),
        }
    }
}

/// Configuration for the batching engine.
///
/// ```
/// use std::time::Duration;
/// use damage_batch::Config;
///
/// let config = Config::new()
///     .set_min_delay(10.0)
///     .set_fixed_quality(Some(80))
///     .set_lock_timeout(Some(Duration::from_millis(100)));
///
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Config {
    pub(crate) batch: BatchSettings,
    pub(crate) tuner: TunerSettings,
    pub(crate) debug: DebugSettings,
}

impl Config {
    /// Creates a new default config.
    pub fn new() -> Self {
        Config::default()
    }

    /// Batching bounds and cadence.
    pub fn batch(&self) -> &BatchSettings {
        &self.batch
    }

    /// Encoder tuning overrides.
    pub fn tuner(&self) -> &TunerSettings {
        &self.tuner
    }

    /// Debug dump settings.
    pub fn debug(&self) -> &DebugSettings {
        &self.debug
    }

    /// Lower bound for the delay in milliseconds.
    ///
    /// Defaults to 5.
    pub fn set_min_delay(mut self, ms: f64) -> Self {
        self.batch.min_delay = ms;
        self
    }

    /// Initial delay in milliseconds.
    ///
    /// Defaults to 50.
    pub fn set_start_delay(mut self, ms: f64) -> Self {
        self.batch.start_delay = ms;
        self
    }

    /// Upper bound for the delay in milliseconds.
    ///
    /// Defaults to 15000.
    pub fn set_max_delay(mut self, ms: f64) -> Self {
        self.batch.max_delay = ms;
        self
    }

    /// Minimum interval between recalculations of one window.
    ///
    /// Defaults to 40ms.
    pub fn set_recalculate_delay(mut self, d: Duration) -> Self {
        self.batch.recalculate_delay = d;
        self
    }

    /// Event count per time unit that forces batching.
    pub fn set_max_events(mut self, n: usize) -> Self {
        self.batch.max_events = n;
        self
    }

    /// Pixel count per time unit that forces batching.
    pub fn set_max_pixels(mut self, n: u64) -> Self {
        self.batch.max_pixels = n;
        self
    }

    /// Keep the delay at or above the minimum at all times.
    pub fn set_always(mut self, enabled: bool) -> Self {
        self.batch.always = enabled;
        self
    }

    /// Force the encoder speed, `None` lets the tuner decide.
    pub fn set_fixed_speed(mut self, speed: Option<u8>) -> Self {
        self.tuner.fixed_speed = speed;
        self
    }

    /// Force the encoder quality, `None` lets the tuner decide.
    pub fn set_fixed_quality(mut self, quality: Option<u8>) -> Self {
        self.tuner.fixed_quality = quality;
        self
    }

    /// Bound the wait for the encoder lock.
    ///
    /// Defaults to `None`, which blocks until the lock is free.
    pub fn set_lock_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.tuner.lock_timeout = timeout;
        self
    }

    /// Record every decision for periodic dumping.
    pub fn set_debug_delay(mut self, enabled: bool) -> Self {
        self.debug.debug_delay = enabled;
        self
    }

    /// Number of decisions kept in the debug log.
    pub fn set_max_debug_messages(mut self, n: usize) -> Self {
        self.debug.max_messages = n;
        self
    }

    /// How often a scheduled [`DelayLog`][crate::DelayLog] is dumped.
    pub fn set_dump_interval(mut self, interval: Duration) -> Self {
        self.debug.dump_interval = interval;
        self
    }

    /// Check bounds are consistent.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let b = &self.batch;

        positive("min_delay", b.min_delay)?;
        positive("max_delay", b.max_delay)?;
        positive("start_delay", b.start_delay)?;

        if b.min_delay > b.max_delay || b.start_delay < b.min_delay || b.start_delay > b.max_delay {
            return Err(ConfigError::DelayBounds {
                min: b.min_delay,
                start: b.start_delay,
                max: b.max_delay,
            });
        }

        if b.time_unit.is_zero() {
            return Err(ConfigError::OutOfRange {
                name: "time_unit",
                value: 0.0,
            });
        }

        for (name, v) in [
            ("fixed_speed", self.tuner.fixed_speed),
            ("fixed_quality", self.tuner.fixed_quality),
        ] {
            if let Some(v) = v {
                if v > 100 {
                    return Err(ConfigError::OutOfRange {
                        name,
                        value: v as f64,
                    });
                }
            }
        }

        Ok(())
    }

    /// Default config overridden by environment variables.
    ///
    /// See [`Config::from_vars`] for the variables read.
    pub fn from_env() -> Result<Config, ConfigError> {
        Config::from_vars(std::env::vars())
    }

    /// Default config overridden by `(name, value)` pairs.
    ///
    /// | Name                      | Unit          |
    /// |---------------------------|---------------|
    /// | `BATCH_MIN_DELAY`         | ms            |
    /// | `BATCH_START_DELAY`       | ms            |
    /// | `BATCH_MAX_DELAY`         | ms            |
    /// | `BATCH_RECALCULATE_DELAY` | ms            |
    /// | `BATCH_ALWAYS`            | bool          |
    /// | `VIDEO_FIXED_SPEED`       | 0-100, -1 off |
    /// | `VIDEO_FIXED_QUALITY`     | 0-100, -1 off |
    /// | `VIDEO_LOCK_TIMEOUT`      | ms, 0 off     |
    /// | `DEBUG_DELAY`             | bool          |
    /// | `DEBUG_DUMP_INTERVAL`     | ms            |
    ///
    /// Unknown names are ignored. The result is validated.
    pub fn from_vars<I, K, V>(vars: I) -> Result<Config, ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut c = Config::default();

        for (k, v) in vars {
            let v = v.as_ref().trim();
            match k.as_ref() {
                "BATCH_MIN_DELAY" => c.batch.min_delay = parse_f64("BATCH_MIN_DELAY", v)?,
                "BATCH_START_DELAY" => c.batch.start_delay = parse_f64("BATCH_START_DELAY", v)?,
                "BATCH_MAX_DELAY" => c.batch.max_delay = parse_f64("BATCH_MAX_DELAY", v)?,
                "BATCH_RECALCULATE_DELAY" => {
                    c.batch.recalculate_delay = parse_millis("BATCH_RECALCULATE_DELAY", v)?
                }
                "BATCH_ALWAYS" => c.batch.always = parse_bool("BATCH_ALWAYS", v)?,
                "VIDEO_FIXED_SPEED" => c.tuner.fixed_speed = parse_percent("VIDEO_FIXED_SPEED", v)?,
                "VIDEO_FIXED_QUALITY" => {
                    c.tuner.fixed_quality = parse_percent("VIDEO_FIXED_QUALITY", v)?
                }
                "VIDEO_LOCK_TIMEOUT" => {
                    let d = parse_millis("VIDEO_LOCK_TIMEOUT", v)?;
                    c.tuner.lock_timeout = (!d.is_zero()).then_some(d);
                }
                "DEBUG_DELAY" => c.debug.debug_delay = parse_bool("DEBUG_DELAY", v)?,
                "DEBUG_DUMP_INTERVAL" => {
                    c.debug.dump_interval = parse_millis("DEBUG_DUMP_INTERVAL", v)?
                }
                _ => {}
            }
        }

        c.validate()?;
        Ok(c)
    }
}

fn positive(name: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(ConfigError::OutOfRange { name, value })
    }
}

fn invalid(name: &'static str, value: &str) -> ConfigError {
    ConfigError::Invalid {
        name,
        value: value.to_string(),
    }
}

fn parse_f64(name: &'static str, v: &str) -> Result<f64, ConfigError> {
    let x: f64 = v.parse().map_err(|_| invalid(name, v))?;
    if !x.is_finite() {
        return Err(invalid(name, v));
    }
    Ok(x)
}

fn parse_millis(name: &'static str, v: &str) -> Result<Duration, ConfigError> {
    let ms: u64 = v.parse().map_err(|_| invalid(name, v))?;
    Ok(Duration::from_millis(ms))
}

fn parse_bool(name: &'static str, v: &str) -> Result<bool, ConfigError> {
    match v.to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Ok(true),
        "0" | "false" | "off" | "no" => Ok(false),
        _ => Err(invalid(name, v)),
    }
}

/// Negative means "not fixed".
fn parse_percent(name: &'static str, v: &str) -> Result<Option<u8>, ConfigError> {
    let x: i64 = v.parse().map_err(|_| invalid(name, v))?;
    if x < 0 {
        return Ok(None);
    }
    if x > 100 {
        return Err(ConfigError::OutOfRange {
            name,
            value: x as f64,
        });
    }
    Ok(Some(x as u8))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults() {
        let c = Config::new();
        assert_eq!(c.batch().min_delay, 5.0);
        assert_eq!(c.batch().start_delay, 50.0);
        assert_eq!(c.batch().max_delay, 15_000.0);
        assert_eq!(c.batch().recalculate_delay, Duration::from_millis(40));
        assert_eq!(c.batch().max_pixels, 52_428_800);
        assert_eq!(c.tuner().fixed_speed, None);
        assert_eq!(c.tuner().lock_timeout, None);
        assert_eq!(c.debug().max_messages, 1000);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn bad_bounds() {
        let c = Config::new().set_min_delay(100.0).set_max_delay(50.0);
        assert!(matches!(c.validate(), Err(ConfigError::DelayBounds { .. })));

        let c = Config::new().set_start_delay(1.0);
        assert!(matches!(c.validate(), Err(ConfigError::DelayBounds { .. })));

        let c = Config::new().set_min_delay(0.0);
        assert!(matches!(
            c.validate(),
            Err(ConfigError::OutOfRange { name: "min_delay", .. })
        ));

        let c = Config::new().set_fixed_speed(Some(101));
        assert!(matches!(
            c.validate(),
            Err(ConfigError::OutOfRange { name: "fixed_speed", .. })
        ));
    }

    #[test]
    fn from_vars() {
        let c = Config::from_vars([
            ("BATCH_MIN_DELAY", "10"),
            ("BATCH_START_DELAY", "20.5"),
            ("BATCH_RECALCULATE_DELAY", "100"),
            ("BATCH_ALWAYS", "yes"),
            ("VIDEO_FIXED_SPEED", "-1"),
            ("VIDEO_FIXED_QUALITY", " 40 "),
            ("VIDEO_LOCK_TIMEOUT", "250"),
            ("DEBUG_DELAY", "On"),
            ("DEBUG_DUMP_INTERVAL", "5000"),
            ("HOME", "/root"),
        ])
        .unwrap();

        assert_eq!(c.batch().min_delay, 10.0);
        assert_eq!(c.batch().start_delay, 20.5);
        assert_eq!(c.batch().recalculate_delay, Duration::from_millis(100));
        assert!(c.batch().always);
        assert_eq!(c.tuner().fixed_speed, None);
        assert_eq!(c.tuner().fixed_quality, Some(40));
        assert_eq!(c.tuner().lock_timeout, Some(Duration::from_millis(250)));
        assert!(c.debug().debug_delay);
        assert_eq!(c.debug().dump_interval, Duration::from_secs(5));
    }

    #[test]
    fn from_vars_errors() {
        let e = Config::from_vars([("BATCH_ALWAYS", "maybe")]).unwrap_err();
        assert_eq!(
            e,
            ConfigError::Invalid {
                name: "BATCH_ALWAYS",
                value: "maybe".into()
            }
        );

        let e = Config::from_vars([("VIDEO_FIXED_QUALITY", "150")]).unwrap_err();
        assert!(matches!(e, ConfigError::OutOfRange { .. }));

        let e = Config::from_vars([("BATCH_MAX_DELAY", "1")]).unwrap_err();
        assert!(matches!(e, ConfigError::DelayBounds { .. }));

        let c = Config::from_vars([("VIDEO_LOCK_TIMEOUT", "0")]).unwrap();
        assert_eq!(c.tuner().lock_timeout, None);
    }
}
