//! Adaptive damage batching for remote display servers.
//!
//! A remote display server captures the changed regions ("damage") of each
//! window, encodes them and streams them to a client. Sending every change
//! as soon as it happens saturates the link and the client, while waiting
//! too long makes the display lag. This crate decides, per window, how long
//! to wait before flushing the accumulated damage, and for windows using a
//! video encoder, which speed and quality to encode with.
//!
//! This is a [Sans I/O][sansio] implementation. Nothing here reads a clock,
//! sleeps or sends anything: the caller feeds telemetry in, passes the
//! current [`Instant`][std::time::Instant] on every call, and reads the
//! resulting delay back. The only blocking point is the encoder lock taken
//! while tuning.
//!
//! # Usage
//!
//! ```
//! use std::sync::Arc;
//! use std::time::{Duration, Instant};
//!
//! use damage_batch::{Config, GlobalStatistics, WindowSource};
//!
//! let config = Config::new();
//! let global = Arc::new(GlobalStatistics::new());
//!
//! let window = WindowSource::new(1, (800, 600), &config, global.clone());
//!
//! let start = Instant::now();
//! window.on_damage(start, 800 * 600);
//!
//! // The client acked a packet sent 30ms ago and decoded it in 5ms.
//! let now = start + Duration::from_millis(40);
//! global.record_latency(now, 1, 5_000.0, start + Duration::from_millis(10), 800 * 600);
//! global.update_averages(now);
//!
//! window.recalculate(now);
//! let delay = window.delay();
//! assert!(delay >= 0.0 && delay <= config.batch().max_delay);
//! ```
//!
//! # Factors
//!
//! Every signal (client latency, queue lengths, damage processing time,
//! decode speed...) is turned into a [`Factor`]: a request to multiply the
//! current delay, with a weight. The new delay is the weighted blend of
//! those requests, anchored on the recent delays. See
//! [`calculate_batch_delay`] and [`update_batch_delay`].
//!
//! A signal without data casts no vote, and with no votes at all the delay
//! is left alone. A transient gap in telemetry never stalls the send path.
//!
//! # Threads
//!
//! [`GlobalStatistics`] is shared by all windows of a connection and only
//! needs `&self`. Each [`WindowSource`] serializes its own recalculations
//! behind a lock, so different windows can recalculate in parallel.
//!
//! [sansio]: https://sans-io.readthedocs.io

#![forbid(unsafe_code)]
#![allow(clippy::new_without_default)]
#![allow(clippy::manual_range_contains)]
#![deny(missing_docs)]

#[macro_use]
extern crate tracing;

mod batch;
pub use batch::{BatchConfig, BatchInfo, DELAY_RECS};

mod calculator;
pub use calculator::{calculate_batch_delay, get_low_limit, may_calculate_batch_delay};
pub use calculator::{update_batch_delay, DelayDecision, ABS_MIN_LATENCY, DEFAULT_LOW_LIMIT};

mod config;
pub use config::{BatchSettings, Config, DebugSettings, TunerSettings};
pub use config::{MAX_DELAY, MAX_EVENTS, MAX_PIXELS, MIN_DELAY, RECALCULATE_DELAY, START_DELAY, TIME_UNIT};

mod debug;
pub use debug::{Decision, DelayLog};

/// Various error types.
pub mod error;
pub use error::{ConfigError, EncoderError, TuneError};

mod global;
pub use global::{GlobalInfo, GlobalStatistics, LatencySummary, WindowId, DEFAULT_LATENCY, GLOBAL_RECS};

mod scheduler;
pub use scheduler::{Scheduler, SchedulerHandle, Task, MAX_TICK};

mod source;
pub use source::{SharedEncoder, WindowSource, WindowSourceInfo, WindowState};

pub mod stats;
pub use stats::Factor;

mod tuner;
pub use tuner::{Tuning, VideoEncoder, VideoTuner, TARGET_DECODE_SPEED, TUNING_RECS};

mod util;
pub use util::History;

mod window;
pub use window::{Backlog, PendingAck, WindowInfo, WindowStatistics, ACK_EXPIRY, WINDOW_RECS};

/// Log a CSV-like stat to stdout.
///
/// ````ignore
/// log_stat!("MY_STAT", 1, "hello", 3);
/// ````
///
/// will result in the following being printed
///
/// ````text
/// MY_STAT 1, hello, 3, {unix_timestamp_ms}
/// ````
///
/// These logs can be easily grepped for, parsed and graphed, or otherwise analyzed.
///
/// This macro turns into a NO-OP if the `_internal_dont_use_log_stats` feature is not enabled
macro_rules! log_stat {
    ($name:expr, $($arg:expr),+) => {
        #[cfg(feature = "_internal_dont_use_log_stats")]
        {
            use std::time::SystemTime;
            use std::io::{self, Write};

            let now = SystemTime::now();
            let since_epoch = now.duration_since(SystemTime::UNIX_EPOCH).unwrap_or_default();
            let unix_time_ms = since_epoch.as_millis();
            let mut lock = io::stdout().lock();
            let _ = write!(lock, "{} ", $name);

            $(
                let _ = write!(lock, "{},", $arg);
            )+
            let _ = writeln!(lock, "{}", unix_time_ms);
        }
    };
}
pub(crate) use log_stat;

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn global_is_send_sync() {
        fn is_send<T: Send>(_t: &T) {}
        fn is_sync<T: Sync>(_t: &T) {}
        let g = GlobalStatistics::new();
        is_send(&g);
        is_sync(&g);
    }

    #[test]
    fn math_backends_interchangeable() {
        let scalar = GlobalStatistics::with_math(Arc::new(stats::Scalar));
        let lanes = GlobalStatistics::with_math(Arc::new(stats::Lanes));
        let now = std::time::Instant::now();
        for g in [&scalar, &lanes] {
            g.record_packet_queue_size(now, 10);
        }
        assert_eq!(scalar.get_factors(now, 1.0), lanes.get_factors(now, 1.0));
    }
}
