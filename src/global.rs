use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::RwLock;
use serde::Serialize;

use crate::stats::{default_math, logp, Factor, ListStats, Math, Target, TimedValue};
use crate::util::History;

/// Identifies a window within one client connection.
pub type WindowId = u64;

/// Records kept per connection-wide history.
pub const GLOBAL_RECS: usize = 500;

/// Assumed latency in seconds until there is data.
pub const DEFAULT_LATENCY: f64 = 0.1;

// Factors with less weight are not worth blending.
const MIN_WEIGHT: f64 = 0.01;

/// Client round trip latency, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LatencySummary {
    /// Lowest latency seen.
    pub min: f64,
    /// Time weighted average.
    pub avg: f64,
    /// Average favouring the last few samples.
    pub recent: f64,
}

impl Default for LatencySummary {
    fn default() -> Self {
        LatencySummary {
            min: DEFAULT_LATENCY,
            avg: DEFAULT_LATENCY,
            recent: DEFAULT_LATENCY,
        }
    }
}

/// Telemetry shared by all windows of one client connection.
///
/// Written by the connection's receive and send paths, read concurrently by
/// every window recalculating its delay. Everything takes `&self` so one
/// instance can be shared in an `Arc`. Readers work on snapshots, never on
/// the live histories.
#[derive(Debug)]
pub struct GlobalStatistics {
    math: Math,
    // (wid, at, pixels, latency)
    client_latency: History<(WindowId, Instant, u64, f64)>,
    packet_qsizes: History<TimedValue>,
    compression_work_qsizes: History<TimedValue>,
    // (at, wid, pixels)
    damage_packet_qpixels: History<(Instant, WindowId, f64)>,
    // (wid, at, pixels)
    damage_last_events: History<(WindowId, Instant, u64)>,
    latency: RwLock<LatencySummary>,
    mmap_size: AtomicU64,
    mmap_free_size: AtomicI64,
    damage_events_count: AtomicU64,
}

impl Default for GlobalStatistics {
    fn default() -> Self {
        GlobalStatistics::new()
    }
}

impl GlobalStatistics {
    /// New empty statistics using the default math backend.
    pub fn new() -> Self {
        GlobalStatistics::with_math(default_math())
    }

    /// New empty statistics computing with `math`.
    pub fn with_math(math: Math) -> Self {
        GlobalStatistics {
            math,
            client_latency: History::new(GLOBAL_RECS),
            packet_qsizes: History::new(GLOBAL_RECS),
            compression_work_qsizes: History::new(GLOBAL_RECS),
            damage_packet_qpixels: History::new(GLOBAL_RECS),
            damage_last_events: History::new(GLOBAL_RECS),
            latency: RwLock::new(LatencySummary::default()),
            mmap_size: AtomicU64::new(0),
            mmap_free_size: AtomicI64::new(0),
            damage_events_count: AtomicU64::new(0),
        }
    }

    /// The math backend.
    pub fn math(&self) -> &Math {
        &self.math
    }

    /// Record a client ack for a damage packet.
    ///
    /// `decode_us` is the client reported decode time in microseconds, which
    /// is taken off the round trip. Returns the resulting latency in seconds.
    pub fn record_latency(
        &self,
        now: Instant,
        wid: WindowId,
        decode_us: f64,
        start_send_at: Instant,
        pixels: u64,
    ) -> f64 {
        let send_diff = now.saturating_duration_since(start_send_at).as_secs_f64();
        let send_latency = (send_diff - decode_us / 1_000_000.0).max(0.0);

        trace!(
            "Latency {:.1}ms round trip, {:.1}ms decoding {} pixels",
            send_diff * 1000.0,
            decode_us / 1000.0,
            pixels
        );

        {
            let mut lock = self.latency.write();
            if send_latency < lock.min {
                lock.min = send_latency;
            }
        }

        self.client_latency.push((wid, now, pixels, send_latency));
        send_latency
    }

    /// Record the packet queue length before a packet is added.
    pub fn record_packet_queue_size(&self, now: Instant, size: usize) {
        self.packet_qsizes.push((now, size as f64));
    }

    /// Record the compression work queue length before an item is added.
    pub fn record_compression_queue_size(&self, now: Instant, size: usize) {
        self.compression_work_qsizes.push((now, size as f64));
    }

    /// Record the pixels queued for `wid` before a packet is added.
    pub fn record_damage_packet_pixels(&self, now: Instant, wid: WindowId, pixels: u64) {
        self.damage_packet_qpixels.push((now, wid, pixels as f64));
    }

    /// Record a damage event as received from the window system.
    pub fn record_damage_event(&self, now: Instant, wid: WindowId, pixels: u64) {
        self.damage_last_events.push((wid, now, pixels));
        self.damage_events_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Set the shared memory area state. A zero size means no mmap transport.
    ///
    /// `free` may be negative when the last write did not fit.
    pub fn set_mmap(&self, size: u64, free: i64) {
        self.mmap_size.store(size, Ordering::Relaxed);
        self.mmap_free_size.store(free, Ordering::Relaxed);
    }

    /// Size of the shared memory area, 0 when not in use.
    pub fn mmap_size(&self) -> u64 {
        self.mmap_size.load(Ordering::Relaxed)
    }

    /// Whether the shared memory transport is active.
    pub fn mmap_enabled(&self) -> bool {
        self.mmap_size() > 0
    }

    /// Current latency summary.
    pub fn latency(&self) -> LatencySummary {
        *self.latency.read()
    }

    /// Lowest client latency seen, in seconds.
    pub fn min_client_latency(&self) -> f64 {
        self.latency.read().min
    }

    /// Average client latency, in seconds.
    pub fn avg_client_latency(&self) -> f64 {
        self.latency.read().avg
    }

    /// Recent client latency, in seconds.
    pub fn recent_client_latency(&self) -> f64 {
        self.latency.read().recent
    }

    /// Whether any client latency has been recorded.
    pub fn has_client_latency(&self) -> bool {
        !self.client_latency.is_empty()
    }

    /// Recompute the latency summary from the history.
    pub fn update_averages(&self, now: Instant) {
        let data: Vec<TimedValue> = self
            .client_latency
            .snapshot()
            .into_iter()
            .map(|(_, at, _, l)| (at, l))
            .collect();

        let Some((avg, recent)) = self.math.calculate_time_weighted_average(now, &data) else {
            return;
        };
        let min = data.iter().map(|(_, l)| *l).fold(f64::MAX, f64::min);

        *self.latency.write() = LatencySummary {
            min,
            avg: avg.max(0.001),
            recent: recent.max(0.001),
        };
    }

    /// Connection-wide factors. `low_limit` scales the pixel queue factor.
    pub fn get_factors(&self, now: Instant, low_limit: f64) -> Vec<Factor> {
        let math = &self.math;
        let mut factors = Vec::new();

        if self.has_client_latency() {
            // Keep client latency as low as can be.
            let lat = self.latency();
            let l = 0.005 + lat.min;
            let wm = logp(l / 0.020);
            let p = Target::default()
                .aim(0.8)
                .slope(0.005)
                .smoothing(f64::sqrt)
                .weight_multiplier(wm);
            let fw = math.calculate_for_target(l, lat.avg, lat.recent, &p);
            factors.extend(Factor::above("client-latency", fw, MIN_WEIGHT));
        }

        let qsizes = self.packet_qsizes.snapshot();
        let fw = math.queue_inspect(now, &qsizes, 1.0, 1.0, f64::sqrt);
        factors.extend(Factor::above("packet-queue-size", fw, MIN_WEIGHT));

        let qpixels: Vec<TimedValue> = self
            .damage_packet_qpixels
            .snapshot()
            .into_iter()
            .map(|(at, _, px)| (at, px))
            .collect();
        let fw = math.queue_inspect(now, &qpixels, 1.0, low_limit, f64::sqrt);
        factors.extend(Factor::above("packet-queue-pixels", fw, MIN_WEIGHT));

        // Each item holds a fair amount of memory and still has to go
        // through the other queues.
        let cwork = self.compression_work_qsizes.snapshot();
        let fw = math.queue_inspect(now, &cwork, 1.0, 1.0, logp);
        factors.extend(Factor::above("compression-work-queue", fw, MIN_WEIGHT));

        let size = self.mmap_size();
        if size > 0 {
            let free = self.mmap_free_size.load(Ordering::Relaxed);
            // Effective range 0.0 to ~1.2, aim for a third.
            let full = (1.0 - free as f64 / size as f64).max(0.0);
            let fw = (logp(3.0 * full), (3.0 * full).powi(2));
            factors.extend(Factor::above("mmap-area", fw, MIN_WEIGHT));
        }

        factors
    }

    /// `(time, pixels)` queued for `wid` only.
    pub fn get_damage_pixels(&self, wid: WindowId) -> Vec<TimedValue> {
        self.damage_packet_qpixels
            .filtered(|(_, w, _)| *w == wid)
            .into_iter()
            .map(|(at, _, px)| (at, px))
            .collect()
    }

    /// Number of damage events and their total pixels for `wid` since `since`.
    pub fn damage_events_since(&self, wid: WindowId, since: Instant) -> (usize, u64) {
        self.damage_last_events
            .filtered(|(w, at, _)| *w == wid && *at >= since)
            .into_iter()
            .fold((0, 0), |(n, px), (_, _, p)| (n + 1, px + p))
    }

    /// Summary for diagnostics.
    pub fn info(&self) -> GlobalInfo {
        let ms = |v: Vec<TimedValue>| ListStats::new(v.into_iter().map(|(_, x)| x));
        GlobalInfo {
            damage_events: self.damage_events_count.load(Ordering::Relaxed),
            latency_ms: ListStats::new(
                self.client_latency
                    .snapshot()
                    .into_iter()
                    .map(|(_, _, _, l)| l * 1000.0),
            ),
            latency: self.latency(),
            packet_queue: ms(self.packet_qsizes.snapshot()),
            compression_queue: ms(self.compression_work_qsizes.snapshot()),
            mmap_size: self.mmap_size(),
            mmap_free_size: self.mmap_free_size.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of a [`GlobalStatistics`].
#[derive(Debug, Clone, Serialize)]
pub struct GlobalInfo {
    /// Damage events received.
    pub damage_events: u64,
    /// Client latency samples in milliseconds.
    pub latency_ms: Option<ListStats>,
    /// Latency summary in seconds.
    pub latency: LatencySummary,
    /// Packet queue lengths.
    pub packet_queue: Option<ListStats>,
    /// Compression work queue lengths.
    pub compression_queue: Option<ListStats>,
    /// Shared memory area size.
    pub mmap_size: u64,
    /// Shared memory area free.
    pub mmap_free_size: i64,
}
