use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::stats::{default_math, logp, Average, Factor, ListStats, Math, Target, TimedSize, TimedValue};
use crate::util::{age_secs, History};

/// Records kept per window history.
pub const WINDOW_RECS: usize = 100;

/// Acks pending for longer than this are assumed lost.
pub const ACK_EXPIRY: Duration = Duration::from_secs(60);

// Assumed until there is data.
const DEFAULT_DAMAGE_LATENCY: f64 = 0.1;
const DEFAULT_NETWORK_LATENCY: f64 = 0.1;
const DEFAULT_TARGET_LATENCY: f64 = 0.1;
const DEFAULT_DECODE_LATENCY: f64 = 0.010;

/// A damage packet sent but not yet acknowledged by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingAck {
    /// When the packet was queued for sending.
    pub start_send_at: Instant,
    /// Connection byte counter when it was queued.
    pub start_bytes: u64,
    /// When the last byte went out, `None` while still being written.
    pub end_send_at: Option<Instant>,
    /// Connection byte counter after it was written.
    pub end_bytes: u64,
    /// Pixels in the packet.
    pub pixels: u64,
}

/// Unacknowledged outgoing data for one window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Backlog {
    /// Packets.
    pub packets: u64,
    /// Pixels in those packets.
    pub pixels: u64,
    /// Bytes in those packets.
    pub bytes: u64,
}

/// Telemetry for one window.
///
/// Owned by the window, so mutation goes through `&mut self`. The derived
/// values are public and refreshed by [`WindowStatistics::update_averages`].
#[derive(Debug, Clone)]
pub struct WindowStatistics {
    math: Math,
    // (at, pixels, actual delay, latency)
    damage_in_latency: History<(Instant, u64, f64, f64)>,
    damage_out_latency: History<(Instant, u64, f64, f64)>,
    // (at, pixels, decode µs)
    client_decode_time: History<TimedSize>,
    // (at, bytes, elapsed s)
    damage_send_speed: History<TimedSize>,
    damage_ack_pending: HashMap<u64, PendingAck>,
    last_damage_event_time: Option<Instant>,
    damage_events_count: u64,
    packet_count: u64,

    /// Latency the controller aims for, in seconds.
    pub target_latency: f64,
    /// Time from damage to packet queued, seconds.
    pub avg_damage_in_latency: f64,
    /// Recent time from damage to packet queued, seconds.
    pub recent_damage_in_latency: f64,
    /// Time from damage to packet sent, seconds.
    pub avg_damage_out_latency: f64,
    /// Recent time from damage to packet sent, seconds.
    pub recent_damage_out_latency: f64,
    /// Largest of the latencies above, at least 0.1s.
    pub max_latency: f64,
    /// Client decode speed in pixels per second.
    pub avg_decode_speed: Option<f64>,
    /// Recent client decode speed in pixels per second.
    pub recent_decode_speed: Option<f64>,
    /// Network send speed in bytes per second.
    pub avg_send_speed: Option<f64>,
    /// Recent network send speed in bytes per second.
    pub recent_send_speed: Option<f64>,
}

impl Default for WindowStatistics {
    fn default() -> Self {
        WindowStatistics::new()
    }
}

impl WindowStatistics {
    /// New empty statistics using the default math backend.
    pub fn new() -> Self {
        WindowStatistics::with_math(default_math())
    }

    /// New empty statistics computing with `math`.
    pub fn with_math(math: Math) -> Self {
        WindowStatistics {
            math,
            damage_in_latency: History::new(WINDOW_RECS),
            damage_out_latency: History::new(WINDOW_RECS),
            client_decode_time: History::new(WINDOW_RECS),
            damage_send_speed: History::new(WINDOW_RECS),
            damage_ack_pending: HashMap::new(),
            last_damage_event_time: None,
            damage_events_count: 0,
            packet_count: 0,
            target_latency: DEFAULT_TARGET_LATENCY,
            avg_damage_in_latency: DEFAULT_DAMAGE_LATENCY,
            recent_damage_in_latency: DEFAULT_DAMAGE_LATENCY,
            avg_damage_out_latency: DEFAULT_DAMAGE_LATENCY + DEFAULT_NETWORK_LATENCY,
            recent_damage_out_latency: DEFAULT_DAMAGE_LATENCY + DEFAULT_NETWORK_LATENCY,
            max_latency: DEFAULT_DAMAGE_LATENCY + DEFAULT_NETWORK_LATENCY,
            avg_decode_speed: None,
            recent_decode_speed: None,
            avg_send_speed: None,
            recent_send_speed: None,
        }
    }

    /// The math backend.
    pub fn math(&self) -> &Math {
        &self.math
    }

    /// A damage event arrived for this window.
    pub fn record_damage_event(&mut self, now: Instant) {
        self.last_damage_event_time = Some(now);
        self.damage_events_count += 1;
    }

    /// Time from damage to the packet being queued.
    pub fn record_damage_in_latency(&mut self, now: Instant, pixels: u64, actual_delay: f64, latency: f64) {
        self.damage_in_latency.push((now, pixels, actual_delay, latency));
    }

    /// Time from damage to the packet being sent.
    pub fn record_damage_out_latency(&mut self, now: Instant, pixels: u64, actual_delay: f64, latency: f64) {
        self.damage_out_latency.push((now, pixels, actual_delay, latency));
    }

    /// Client reported decode time in microseconds.
    pub fn record_client_decode_time(&mut self, now: Instant, pixels: u64, decode_us: f64) {
        self.client_decode_time.push((now, pixels as f64, decode_us));
    }

    /// Time it took to write `bytes` to the network.
    pub fn record_send_speed(&mut self, now: Instant, bytes: u64, elapsed: Duration) {
        self.damage_send_speed
            .push((now, bytes as f64, elapsed.as_secs_f64()));
    }

    /// A damage packet was queued for sending.
    pub fn damage_packet_sent(&mut self, seq: u64, start_send_at: Instant, start_bytes: u64, pixels: u64) {
        self.packet_count += 1;
        self.damage_ack_pending.insert(
            seq,
            PendingAck {
                start_send_at,
                start_bytes,
                end_send_at: None,
                end_bytes: start_bytes,
                pixels,
            },
        );
    }

    /// A queued damage packet has been written out. Also records the send speed.
    pub fn damage_packet_written(&mut self, seq: u64, end_send_at: Instant, end_bytes: u64) {
        let Some(ack) = self.damage_ack_pending.get_mut(&seq) else {
            debug!("Written packet not pending: {}", seq);
            return;
        };
        ack.end_send_at = Some(end_send_at);
        ack.end_bytes = end_bytes;

        let elapsed = end_send_at.saturating_duration_since(ack.start_send_at);
        let bytes = end_bytes.saturating_sub(ack.start_bytes);
        if !elapsed.is_zero() {
            self.record_send_speed(end_send_at, bytes, elapsed);
        }
    }

    /// The client acknowledged a damage packet.
    pub fn damage_packet_acked(&mut self, seq: u64) -> Option<PendingAck> {
        self.damage_ack_pending.remove(&seq)
    }

    /// Number of packets awaiting an ack.
    pub fn pending_acks(&self) -> usize {
        self.damage_ack_pending.len()
    }

    /// Refresh the derived latencies and speeds.
    pub fn update_averages(&mut self, now: Instant) {
        let math = &self.math;

        let latencies = |h: &History<(Instant, u64, f64, f64)>| -> Vec<TimedValue> {
            h.snapshot().into_iter().map(|(at, _, _, l)| (at, l)).collect()
        };

        if let Some((avg, recent)) = math.calculate_time_weighted_average(now, &latencies(&self.damage_in_latency)) {
            self.avg_damage_in_latency = avg;
            self.recent_damage_in_latency = recent;
        }

        if let Some((avg, recent)) = math.calculate_time_weighted_average(now, &latencies(&self.damage_out_latency)) {
            self.avg_damage_out_latency = avg;
            self.recent_damage_out_latency = recent;
        }

        // Decode times are in µs, speeds in pixels per second.
        let decode: Vec<TimedSize> = self
            .client_decode_time
            .snapshot()
            .into_iter()
            .map(|(at, px, us)| (at, px, us / 1_000_000.0))
            .collect();
        if let Some((avg, recent)) = math.calculate_timesize_weighted_average(now, &decode) {
            self.avg_decode_speed = Some(avg);
            self.recent_decode_speed = Some(recent);
        }

        let send = self.damage_send_speed.snapshot();
        if let Some((avg, recent)) = math.calculate_timesize_weighted_average(now, &send) {
            self.avg_send_speed = Some(avg);
            self.recent_send_speed = Some(recent);
        }

        self.max_latency = [
            0.1,
            self.avg_damage_in_latency,
            self.recent_damage_in_latency,
            self.avg_damage_out_latency,
            self.recent_damage_out_latency,
        ]
        .into_iter()
        .fold(f64::MIN, f64::max);
    }

    /// Window level factors.
    ///
    /// `pixel_count` is the window's low limit, `delay` the current batch
    /// delay in milliseconds.
    pub fn get_factors(&self, now: Instant, pixel_count: f64, delay: f64) -> Vec<Factor> {
        let math = &self.math;
        let mut factors = Vec::new();
        let mpixels = pixel_count / 1024.0 / 1024.0;

        let has_in = !self.damage_in_latency.is_empty();
        let has_out = !self.damage_out_latency.is_empty();

        if has_in {
            let target = 0.010 + 0.050 * mpixels;
            let p = Target::default().aim(0.8).slope(0.005).smoothing(f64::sqrt);
            let fw = math.calculate_for_target(
                target,
                self.avg_damage_in_latency,
                self.recent_damage_in_latency,
                &p,
            );
            factors.push(Factor::new("damage-processing-latency", fw));

            // Aim for processing to take longer than the delay so that
            // there is always a packet in flight.
            let md = 1.5 * (delay / 1000.0).max(0.005);
            let fa = (self.avg_damage_in_latency / md).sqrt();
            let fr = (self.recent_damage_in_latency / md).sqrt();
            let weight = (fa - 1.0).abs().max((fr - 1.0).abs());
            factors.push(Factor::new(
                "damage-processing-ratios",
                ((fa + fr * 2.0) / 3.0, weight),
            ));
        }

        if has_out {
            let target = 0.025 + 0.060 * mpixels;
            let p = Target::default().aim(0.8).slope(0.010).smoothing(f64::sqrt);
            let fw = math.calculate_for_target(
                target,
                self.avg_damage_out_latency,
                self.recent_damage_out_latency,
                &p,
            );
            factors.push(Factor::new("damage-out-latency", fw));
        }

        // The gap between "in" and "out" latency is the network.
        if has_in && has_out {
            let ad = (self.avg_damage_out_latency - self.avg_damage_in_latency).max(0.001);
            let rd = (self.recent_damage_out_latency - self.recent_damage_in_latency).max(0.001);
            // Low latencies matter less.
            let p = Average {
                weight_div: 0.040 / ad.max(rd),
                ..Default::default()
            };
            let fw = math.calculate_for_average(ad, rd, &p);
            factors.push(Factor::new("damage-network-delay", fw));
        }

        if let (Some(avg), Some(recent)) = (self.avg_send_speed, self.recent_send_speed) {
            if avg > 0.0 && recent > 0.0 {
                // Time to send 1MB, since the factors aim for lower values.
                let avg1mb = 1024.0 * 1024.0 / avg;
                let recent1mb = 1024.0 * 1024.0 / recent;
                // Only really matters when the speed is low.
                let minspeed = 128.0 * 1024.0;
                let p = Average {
                    weight_offset: 1.0,
                    weight_div: logp(recent.max(minspeed) / minspeed),
                    ..Default::default()
                };
                let fw = math.calculate_for_average(avg1mb, recent1mb, &p);
                factors.push(Factor::new("network-send-speed", fw));
            }
        }

        if let (Some(avg), Some(recent)) = (self.avg_decode_speed, self.recent_decode_speed) {
            if avg > 0.0 && recent > 0.0 {
                let avg1mb = 1024.0 * 1024.0 / avg;
                let recent1mb = 1024.0 * 1024.0 / recent;
                let p = Average {
                    weight_offset: 0.0,
                    weight_div: (recent / 4_000_000.0).max(0.25),
                    ..Default::default()
                };
                let fw = math.calculate_for_average(avg1mb, recent1mb, &p);
                factors.push(Factor::new("client-decode-speed", fw));
            }
        }

        if let Some(t) = self.last_damage_event_time {
            // Quiet windows can batch less, ignoring gaps that could just
            // be system latency.
            let elapsed = age_secs(now, t);
            let mtime = (elapsed - self.max_latency * 2.0).max(0.0);
            let target = (1.0 - mtime).max(0.0);
            factors.push(Factor::new("damage-rate", (target, mtime.sqrt())));
        }

        factors
    }

    /// Latency target derived from the client's baseline.
    ///
    /// Geometric mean of the minimum (+20%) and the average, capped at twice
    /// the minimum and not below `abs_min`, plus the decode time.
    pub fn get_target_client_latency(
        &self,
        now: Instant,
        min_client_latency: f64,
        avg_client_latency: f64,
        abs_min: f64,
    ) -> f64 {
        let decode: Vec<TimedValue> = self
            .client_decode_time
            .snapshot()
            .into_iter()
            .map(|(at, _, us)| (at, us / 1_000_000.0))
            .collect();
        let decoding_latency = self
            .math
            .calculate_time_weighted_average(now, &decode)
            .map(|(avg, _)| avg)
            .unwrap_or(DEFAULT_DECODE_LATENCY);

        let min_latency = abs_min.max(min_client_latency) * 1.2;
        let avg_latency = min_latency.max(avg_client_latency);
        let max_latency = 2.0 * min_latency;

        abs_min.max(max_latency.min((min_latency * avg_latency).sqrt())) + decoding_latency
    }

    /// Outgoing data the client should have acknowledged by now.
    ///
    /// Packets still being written or sent less than `target_latency` ago are
    /// not counted. Acks pending for longer than [`ACK_EXPIRY`] are dropped.
    pub fn get_backlog(&mut self, now: Instant) -> Backlog {
        let mut backlog = Backlog::default();
        let mut expired = Vec::new();

        for (seq, ack) in &self.damage_ack_pending {
            if ack.end_send_at.is_none() {
                continue;
            }
            let age = now.saturating_duration_since(ack.start_send_at);
            if age.as_secs_f64() < self.target_latency {
                continue;
            }
            if age > ACK_EXPIRY {
                expired.push(*seq);
                continue;
            }
            backlog.packets += 1;
            backlog.pixels += ack.pixels;
            backlog.bytes += ack.end_bytes.saturating_sub(ack.start_bytes);
        }

        if !expired.is_empty() {
            expired.sort_unstable();
            warn!("Expiring damage acks pending too long: {:?}", expired);
            for seq in expired {
                self.damage_ack_pending.remove(&seq);
            }
        }

        backlog
    }

    /// Summary for diagnostics.
    pub fn info(&self) -> WindowInfo {
        let ms = |h: &History<(Instant, u64, f64, f64)>| {
            ListStats::new(h.snapshot().into_iter().map(|(_, _, _, l)| l * 1000.0))
        };
        WindowInfo {
            damage_events: self.damage_events_count,
            packets_sent: self.packet_count,
            pending_acks: self.damage_ack_pending.len(),
            target_latency: self.target_latency,
            in_latency_ms: ms(&self.damage_in_latency),
            out_latency_ms: ms(&self.damage_out_latency),
            avg_decode_speed: self.avg_decode_speed,
            avg_send_speed: self.avg_send_speed,
        }
    }
}

/// Snapshot of a [`WindowStatistics`].
#[derive(Debug, Clone, Serialize)]
pub struct WindowInfo {
    /// Damage events seen.
    pub damage_events: u64,
    /// Damage packets sent.
    pub packets_sent: u64,
    /// Packets awaiting an ack.
    pub pending_acks: usize,
    /// Current latency target in seconds.
    pub target_latency: f64,
    /// Damage to queued latencies in milliseconds.
    pub in_latency_ms: Option<ListStats>,
    /// Damage to sent latencies in milliseconds.
    pub out_latency_ms: Option<ListStats>,
    /// Pixels per second.
    pub avg_decode_speed: Option<f64>,
    /// Bytes per second.
    pub avg_send_speed: Option<f64>,
}

#[cfg(test)]
mod test {
    use super::*;

    const MPIXEL: f64 = 1024.0 * 1024.0;

    #[test]
    fn defaults_without_data() {
        let mut s = WindowStatistics::new();
        let now = Instant::now();
        s.update_averages(now);
        assert_eq!(s.avg_damage_in_latency, 0.1);
        assert_eq!(s.max_latency, 0.2);
        assert_eq!(s.avg_decode_speed, None);
        assert!(s.get_factors(now, MPIXEL, 50.0).is_empty());
    }

    #[test]
    fn slow_processing_asks_for_more_delay() {
        let mut s = WindowStatistics::new();
        let start = Instant::now();
        for i in 0..10 {
            s.record_damage_in_latency(start + Duration::from_millis(10 * i), 1000, 10.0, 0.5);
        }
        let now = start + Duration::from_millis(100);
        s.update_averages(now);
        assert!((s.avg_damage_in_latency - 0.5).abs() < 1e-9);
        assert!((s.max_latency - 0.5).abs() < 1e-9);

        let factors = s.get_factors(now, MPIXEL, 50.0);
        let f = factors
            .iter()
            .find(|f| f.metric == "damage-processing-latency")
            .unwrap();
        assert!(f.factor > 1.0);
        assert!(factors.iter().any(|f| f.metric == "damage-processing-ratios"));
        assert!(factors.iter().all(|f| f.is_valid()));
    }

    #[test]
    fn network_delay_needs_both_latencies() {
        let mut s = WindowStatistics::new();
        let now = Instant::now();
        s.record_damage_out_latency(now, 1000, 10.0, 0.2);
        s.update_averages(now);
        let factors = s.get_factors(now, MPIXEL, 50.0);
        assert!(factors.iter().any(|f| f.metric == "damage-out-latency"));
        assert!(factors.iter().all(|f| f.metric != "damage-network-delay"));

        s.record_damage_in_latency(now, 1000, 10.0, 0.05);
        s.update_averages(now);
        let factors = s.get_factors(now, MPIXEL, 50.0);
        assert!(factors.iter().any(|f| f.metric == "damage-network-delay"));
    }

    #[test]
    fn decode_speed() {
        let mut s = WindowStatistics::new();
        let now = Instant::now();
        // 1 megapixel in 0.5s
        s.record_client_decode_time(now, 1_000_000, 500_000.0);
        s.update_averages(now);
        assert!((s.avg_decode_speed.unwrap() - 2_000_000.0).abs() < 1e-3);

        let factors = s.get_factors(now, MPIXEL, 50.0);
        let f = factors
            .iter()
            .find(|f| f.metric == "client-decode-speed")
            .unwrap();
        // Stable speed
        assert!((f.factor - 2.0).abs() < 1e-9);
    }

    #[test]
    fn damage_rate_slashes_when_idle() {
        let mut s = WindowStatistics::new();
        let t = Instant::now();
        s.record_damage_event(t);

        let factors = s.get_factors(t + Duration::from_millis(100), MPIXEL, 50.0);
        let f = factors.iter().find(|f| f.metric == "damage-rate").unwrap();
        assert_eq!((f.factor, f.weight), (1.0, 0.0));

        // 2.4s idle with a 0.2s max latency.
        let factors = s.get_factors(t + Duration::from_millis(2400), MPIXEL, 50.0);
        let f = factors.iter().find(|f| f.metric == "damage-rate").unwrap();
        assert_eq!(f.factor, 0.0);
        assert!((f.weight - 2.0_f64.sqrt()).abs() < 1e-9);
    }

    #[test]
    fn target_client_latency() {
        let s = WindowStatistics::new();
        let now = Instant::now();
        // min 0.05 -> 0.06, avg 0.1, sqrt(0.006) capped to 0.12 not hit.
        let t = s.get_target_client_latency(now, 0.05, 0.1, 0.010);
        assert!((t - (0.006_f64.sqrt() + 0.010)).abs() < 1e-9);

        // Large average is capped at twice the minimum.
        let t = s.get_target_client_latency(now, 0.05, 10.0, 0.010);
        assert!((t - (0.12 + 0.010)).abs() < 1e-9);

        // Nothing measured falls back to abs_min.
        let t = s.get_target_client_latency(now, 0.0, 0.0, 0.010);
        assert!((t - (0.012 + 0.010)).abs() < 1e-9);
    }

    #[test]
    fn backlog() {
        let mut s = WindowStatistics::new();
        s.target_latency = 0.1;
        let t = Instant::now();

        s.damage_packet_sent(1, t, 0, 100);
        s.damage_packet_written(1, t + Duration::from_millis(10), 1000);
        // Still being written.
        s.damage_packet_sent(2, t, 1000, 200);
        // Too recent.
        s.damage_packet_sent(3, t + Duration::from_millis(450), 1000, 400);
        s.damage_packet_written(3, t + Duration::from_millis(460), 1500);

        let b = s.get_backlog(t + Duration::from_millis(500));
        assert_eq!(
            b,
            Backlog {
                packets: 1,
                pixels: 100,
                bytes: 1000
            }
        );
        assert!(s.damage_packet_acked(1).is_some());
        assert!(s.damage_packet_acked(1).is_none());
        assert_eq!(s.get_backlog(t + Duration::from_millis(500)), Backlog::default());
    }

    #[test]
    fn backlog_expires_old_acks() {
        let mut s = WindowStatistics::new();
        let t = Instant::now();
        s.damage_packet_sent(7, t, 0, 100);
        s.damage_packet_written(7, t + Duration::from_millis(5), 10);
        assert_eq!(s.pending_acks(), 1);

        let b = s.get_backlog(t + Duration::from_secs(61));
        assert_eq!(b, Backlog::default());
        assert_eq!(s.pending_acks(), 0);
    }

    #[test]
    fn written_records_send_speed() {
        let mut s = WindowStatistics::new();
        let t = Instant::now();
        s.damage_packet_sent(1, t, 0, 100);
        s.damage_packet_written(1, t + Duration::from_millis(500), 512 * 1024);
        s.update_averages(t + Duration::from_millis(500));
        assert!((s.avg_send_speed.unwrap() - 1024.0 * 1024.0).abs() < 1e-3);

        let info = s.info();
        assert_eq!(info.packets_sent, 1);
        assert_eq!(info.pending_acks, 1);
    }
}
