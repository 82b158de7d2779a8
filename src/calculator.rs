//! The batch delay control loop.
//!
//! Every signal the window and the connection know about is turned into a
//! [`Factor`], a request to multiply the current delay by some amount with a
//! given weight. The new delay is the weighted blend of those requests,
//! anchored on a time weighted average of the recent delays.

use std::time::Instant;

use serde::Serialize;

use crate::batch::BatchConfig;
use crate::global::{GlobalStatistics, WindowId};
use crate::stats::{logp, Factor};
use crate::util::age_secs;
use crate::window::WindowStatistics;

/// Pixel count used as reference when the window size is not known.
pub const DEFAULT_LOW_LIMIT: f64 = 1024.0 * 1024.0;

/// Lowest latency target in seconds.
pub const ABS_MIN_LATENCY: f64 = 0.010;

/// Outcome of one recalculation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DelayDecision {
    /// The window.
    pub wid: WindowId,
    /// Delay before the recalculation, in milliseconds.
    pub previous: f64,
    /// New delay in milliseconds.
    pub delay: f64,
    /// Factors that were blended.
    pub factors: Vec<Factor>,
}

/// The number of pixels which can be considered "low" in terms of backlog.
///
/// One full frame of the window, or one megapixel when the size is not
/// known. Four times that with the mmap transport, which is much faster.
pub fn get_low_limit(mmap_enabled: bool, (width, height): (u32, u32)) -> f64 {
    let mut low_limit = DEFAULT_LOW_LIMIT;
    if width > 0 && height > 0 {
        low_limit = (width as f64 * height as f64).max(64.0);
    }
    if mmap_enabled {
        low_limit *= 4.0;
    }
    low_limit
}

/// Computes a new delay for window `wid`.
///
/// Refreshes `stats.target_latency` from the client latency, gathers the
/// window, connection and per-window queue factors and feeds them to
/// [`update_batch_delay`]. `None` if there was nothing to go on, in which
/// case `batch.delay` is unchanged.
pub fn calculate_batch_delay(
    now: Instant,
    wid: WindowId,
    dimensions: (u32, u32),
    batch: &mut BatchConfig,
    global: &GlobalStatistics,
    stats: &mut WindowStatistics,
) -> Option<DelayDecision> {
    let low_limit = get_low_limit(global.mmap_enabled(), dimensions);

    let mut factors: Vec<Option<Factor>> = stats
        .get_factors(now, low_limit, batch.delay)
        .into_iter()
        .map(Some)
        .collect();

    let latency = global.latency();
    stats.target_latency = stats.get_target_client_latency(now, latency.min, latency.avg, ABS_MIN_LATENCY);

    factors.extend(global.get_factors(now, low_limit).into_iter().map(Some));

    // Pixels waiting in the packet queue for this window only.
    let pixels = global.get_damage_pixels(wid);
    let fw = global
        .math()
        .queue_inspect(now, &pixels, 1.0, low_limit, f64::sqrt);
    factors.push(Factor::above("damage-packet-queue-pixels", fw, 0.01));

    let mut decision = update_batch_delay(now, batch, factors)?;
    decision.wid = wid;
    Some(decision)
}

/// Blends `factors` into a new delay.
///
/// `None` entries are signals that did not apply. Without any remaining
/// weight this is a no-op and returns `None`. The result is within
/// `[0, max_delay]`, or `[min_delay, max_delay]` when `always` is set.
///
/// The delay histories are read, not written: the send scheduler records
/// what it decided and waited through [`BatchConfig::record_delay`] and
/// [`BatchConfig::record_actual_delay`].
pub fn update_batch_delay<I>(now: Instant, batch: &mut BatchConfig, factors: I) -> Option<DelayDecision>
where
    I: IntoIterator<Item = Option<Factor>>,
{
    let current = batch.delay;
    let max_delay = batch.max_delay;

    // Older values matter less, and decay slower the more we batch already.
    let decay = (logp(current / batch.min_delay) / 5.0).max(1.0);

    let (mut tv, mut tw) = (0.0, 0.0);
    let history = batch
        .last_delays
        .snapshot()
        .into_iter()
        .chain(batch.last_actual_delays.snapshot());
    for (when, delay) in history {
        let age = age_secs(now, when) / decay;
        let w = 1.0 / (1.0 + age * age);
        tv += delay.max(0.0).min(max_delay) * w;
        tw += w;
    }
    let hist_w = tw;

    let mut valid = Vec::new();
    for f in factors.into_iter().flatten() {
        if !f.is_valid() {
            warn!("Invalid factor: {}", f);
            continue;
        }
        trace!("Factor {}", f);
        valid.push(f);
    }

    let total: f64 = valid.iter().map(|f| f.weight).sum();
    if total <= 0.0 {
        debug!("No weights yet, keep delay {:.1}", current);
        return None;
    }

    for f in &valid {
        let target = (current * f.factor).max(0.0).min(max_delay);
        let w = hist_w.max(1.0) * f.weight / total;
        tv += target * w;
        tw += w;
    }

    let floor = if batch.always { batch.min_delay } else { 0.0 };
    let delay = (tv / tw).max(floor).min(max_delay);

    debug!("Delay {:.1} -> {:.1} from {} factors", current, delay, valid.len());
    crate::log_stat!("BATCH_DELAY", current, delay, valid.len(), total);

    batch.delay = delay;
    batch.last_updated = Some(now);
    batch.factors = valid.clone();

    Some(DelayDecision {
        wid: 0,
        previous: current,
        delay,
        factors: valid,
    })
}

/// Rate limited [`calculate_batch_delay`].
///
/// Recalculates only once `recalculate_delay` has passed since the last
/// time. Afterwards, a window with a burst of damage in the last
/// `time_unit` (more than `max_events` events or `max_pixels` pixels) is
/// kept at `min_delay` or above, so that the burst gets batched. Forcing
/// counts as a recalculation even without any factors.
pub fn may_calculate_batch_delay(
    now: Instant,
    wid: WindowId,
    dimensions: (u32, u32),
    batch: &mut BatchConfig,
    global: &GlobalStatistics,
    stats: &mut WindowStatistics,
) -> Option<DelayDecision> {
    if !batch.is_due(now) {
        return None;
    }

    let mut decision = calculate_batch_delay(now, wid, dimensions, batch, global, stats);

    if batch.delay <= batch.min_delay {
        let since = now.checked_sub(batch.time_unit).unwrap_or(now);
        let (events, pixels) = global.damage_events_since(wid, since);
        if events > batch.max_events || pixels > batch.max_pixels {
            debug!(
                "Forcing batching for {}: {} events, {} pixels",
                wid, events, pixels
            );
            let previous = batch.delay;
            batch.delay = batch.min_delay;
            batch.last_updated = Some(now);
            match &mut decision {
                Some(d) => d.delay = batch.min_delay,
                None => {
                    decision = Some(DelayDecision {
                        wid,
                        previous,
                        delay: batch.min_delay,
                        factors: Vec::new(),
                    })
                }
            }
        }
    }

    decision
}
