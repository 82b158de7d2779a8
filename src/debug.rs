//! Diagnostic log of recent decisions.

use std::fmt;
use std::mem;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;

use crate::calculator::DelayDecision;
use crate::config::DebugSettings;
use crate::global::WindowId;
use crate::scheduler::Scheduler;
use crate::tuner::Tuning;

/// One decision taken by either control loop.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Decision {
    /// A batch delay recalculation.
    Delay(DelayDecision),
    /// An encoder tuning pass.
    Tuning {
        /// The window.
        wid: WindowId,
        /// What was computed.
        tuning: Tuning,
    },
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Decision::Delay(d) => {
                write!(f, "wid {} delay {:.1} -> {:.1}", d.wid, d.previous, d.delay)?;
                for x in &d.factors {
                    write!(f, "\n  {}", x)?;
                }
                Ok(())
            }
            Decision::Tuning { wid, tuning } => write!(
                f,
                "wid {} speed={} quality={} applied={}",
                wid, tuning.speed, tuning.quality, tuning.applied
            ),
        }
    }
}

/// Bounded list of the last decisions.
///
/// Dumped at `info` level once it holds `max_messages` entries, or whenever
/// [`DelayLog::dump`] is called, typically from a
/// [`Scheduler`][crate::Scheduler] task.
#[derive(Debug)]
pub struct DelayLog {
    max_messages: usize,
    entries: Mutex<Vec<Decision>>,
}

impl DelayLog {
    /// New log dumping every `max_messages` entries (minimum 1).
    pub fn new(max_messages: usize) -> Self {
        let max_messages = max_messages.max(1);
        DelayLog {
            max_messages,
            entries: Mutex::new(Vec::with_capacity(max_messages)),
        }
    }

    /// A log if `debug_delay` is enabled.
    pub fn from_settings(settings: &DebugSettings) -> Option<Self> {
        settings
            .debug_delay
            .then(|| DelayLog::new(settings.max_messages))
    }

    /// Append a decision, dumping if full.
    pub fn add(&self, decision: Decision) {
        let full = {
            let mut lock = self.entries.lock();
            lock.push(decision);
            if lock.len() >= self.max_messages {
                Some(mem::take(&mut *lock))
            } else {
                None
            }
        };
        if let Some(entries) = full {
            emit(&entries);
        }
    }

    /// Log and clear all entries. Returns how many there were.
    pub fn dump(&self) -> usize {
        let entries = mem::take(&mut *self.entries.lock());
        emit(&entries);
        entries.len()
    }

    /// Dump the log every `settings.dump_interval` from `scheduler`.
    pub fn schedule(self: &Arc<Self>, scheduler: &mut Scheduler, settings: &DebugSettings) {
        let log = Arc::clone(self);
        scheduler.add("delay-log-dump", settings.dump_interval, move |_| {
            log.dump();
        });
    }

    /// Copy of the current entries.
    pub fn entries(&self) -> Vec<Decision> {
        self.entries.lock().clone()
    }

    /// Number of entries held.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether the log is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

fn emit(entries: &[Decision]) {
    if entries.is_empty() {
        return;
    }
    info!("Last {} decisions:", entries.len());
    for e in entries {
        info!("{}", e);
    }
}

#[cfg(test)]
mod test {
    use std::time::{Duration, Instant};

    use super::*;
    use crate::stats::Factor;

    fn delay(wid: WindowId, delay: f64) -> Decision {
        Decision::Delay(DelayDecision {
            wid,
            previous: 50.0,
            delay,
            factors: vec![Factor::new("damage-rate", (0.5, 1.0))],
        })
    }

    #[test]
    fn dumps_when_full() {
        let log = DelayLog::new(3);
        log.add(delay(1, 40.0));
        log.add(delay(1, 30.0));
        assert_eq!(log.len(), 2);

        log.add(Decision::Tuning {
            wid: 1,
            tuning: Tuning {
                speed: 50,
                quality: 60,
                applied: true,
            },
        });
        assert!(log.is_empty());
    }

    #[test]
    fn dump_clears() {
        let log = DelayLog::new(100);
        log.add(delay(2, 10.0));
        assert_eq!(log.entries(), vec![delay(2, 10.0)]);
        assert_eq!(log.dump(), 1);
        assert_eq!(log.dump(), 0);
    }

    #[test]
    fn from_settings() {
        let mut s = DebugSettings::default();
        assert!(DelayLog::from_settings(&s).is_none());
        s.debug_delay = true;
        assert!(DelayLog::from_settings(&s).is_some());
    }

    #[test]
    fn scheduled_dump() {
        let settings = DebugSettings {
            debug_delay: true,
            dump_interval: Duration::from_secs(5),
            ..Default::default()
        };
        let log = Arc::new(DelayLog::from_settings(&settings).unwrap());
        let mut s = Scheduler::new();
        log.schedule(&mut s, &settings);

        let now = Instant::now();
        s.start(now);
        assert_eq!(s.poll_timeout(), Some(now + Duration::from_secs(5)));

        log.add(delay(1, 20.0));
        assert_eq!(s.handle_timeout(now + Duration::from_secs(4)), 0);
        assert_eq!(log.len(), 1);
        assert_eq!(s.handle_timeout(now + Duration::from_secs(5)), 1);
        assert!(log.is_empty());
    }

    #[test]
    fn display() {
        let s = delay(3, 12.34).to_string();
        assert!(s.starts_with("wid 3 delay 50.0 -> 12.3"));
        assert!(s.contains("damage-rate"));
    }
}
