//! Weighted averages and target-seeking factors.
//!
//! All formulas live in the provided methods of [`StatMath`]. An implementation
//! only supplies the inner fold over `(value, weight)` pairs, which is the hot
//! loop when a window recalculates. [`Scalar`] is the default, [`Lanes`] folds
//! four accumulators at a time. The free functions in this module use [`Scalar`].

use std::fmt;
use std::time::Instant;

use crate::util::age_secs;

/// `(event time, value)`.
pub type TimedValue = (Instant, f64);

/// `(event time, size, elapsed)` for throughput records, or
/// `(event time, size, value)` for size weighted records.
pub type TimedSize = (Instant, f64, f64);

/// Nonlinearity applied to a raw factor.
pub type Smoothing = fn(f64) -> f64;

const LN_SQRT_2: f64 = std::f64::consts::LN_2 / 2.0;

/// Logarithm base √2 of `1 + x`.
///
/// Compresses large ratios so that a single runaway signal cannot dominate the
/// weighted blend. `logp(0.0) == 0.0`.
#[inline]
pub fn logp(x: f64) -> f64 {
    (1.0 + x).ln() / LN_SQRT_2
}

/// Parameters for [`StatMath::calculate_for_target`].
#[derive(Debug, Clone, Copy)]
pub struct Target {
    /// Share of the average factor in the blend. Must be within `(0, 1)`.
    pub aim: f64,
    /// Divider applied to all values (i.e. a unit or reference scale).
    pub div: f64,
    /// Added to the denominators, the higher, the flatter the response.
    pub slope: f64,
    /// Applied to the blended factor and to the weight.
    pub smoothing: Smoothing,
    /// Multiplies the resulting weight.
    pub weight_multiplier: f64,
}

impl Default for Target {
    fn default() -> Self {
        Target {
            aim: 0.5,
            div: 1.0,
            slope: 0.1,
            smoothing: logp,
            weight_multiplier: 1.0,
        }
    }
}

impl Target {
    /// Set the aim.
    pub fn aim(mut self, aim: f64) -> Self {
        self.aim = aim;
        self
    }

    /// Set the divider.
    pub fn div(mut self, div: f64) -> Self {
        self.div = div;
        self
    }

    /// Set the slope.
    pub fn slope(mut self, slope: f64) -> Self {
        self.slope = slope;
        self
    }

    /// Set the smoothing function.
    pub fn smoothing(mut self, smoothing: Smoothing) -> Self {
        self.smoothing = smoothing;
        self
    }

    /// Set the weight multiplier.
    pub fn weight_multiplier(mut self, m: f64) -> Self {
        self.weight_multiplier = m;
        self
    }
}

/// Parameters for [`StatMath::calculate_for_average`].
#[derive(Debug, Clone, Copy)]
pub struct Average {
    /// Divider applied to both values.
    pub div: f64,
    /// Added to the weight before `weight_div` applies.
    pub weight_offset: f64,
    /// Divides the weight.
    pub weight_div: f64,
}

impl Default for Average {
    fn default() -> Self {
        Average {
            div: 1.0,
            weight_offset: 0.5,
            weight_div: 1.0,
        }
    }
}

/// Statistical primitives used by the batch delay and encoder tuning loops.
///
/// No implementation may change results beyond floating point rounding.
pub trait StatMath: fmt::Debug + Send + Sync {
    /// Folds `(value, weight)` pairs into `(Σ value·weight, Σ weight)`.
    fn fold(&self, pairs: &[(f64, f64)]) -> (f64, f64);

    /// Weighted mean of the sample values where each weight is
    /// `1 / (min_offset + age^recent_power)`, age in seconds since `now`.
    ///
    /// `None` if there are no samples.
    fn time_weighted_average(
        &self,
        now: Instant,
        samples: &[TimedValue],
        min_offset: f64,
        recent_power: f64,
    ) -> Option<f64> {
        assert!(min_offset > 0.0, "min_offset must be positive: {}", min_offset);
        let pairs: Vec<(f64, f64)> = samples
            .iter()
            .map(|&(t, v)| {
                let w = 1.0 / (min_offset + age_secs(now, t).powf(recent_power));
                (v, w)
            })
            .collect();
        weighted_mean(self.fold(&pairs))
    }

    /// Returns `(avg, recent)`, two time weighted means. The average uses
    /// `1 / (1 + age)`, the recent one the much steeper `1 / (0.1 + age²)`.
    ///
    /// `None` if there are no samples.
    fn calculate_time_weighted_average(
        &self,
        now: Instant,
        samples: &[TimedValue],
    ) -> Option<(f64, f64)> {
        let avg = self.time_weighted_average(now, samples, 1.0, 1.0)?;
        let recent = self.time_weighted_average(now, samples, 0.1, 2.0)?;
        Some((avg, recent))
    }

    /// Time weighted `(avg, recent)` throughput of `(time, size, elapsed)` records.
    ///
    /// Each record contributes `size / elapsed` and its weight is boosted by
    /// `logp(size / mean_size)` so that small records do not skew the result.
    /// Records with `elapsed <= 0` are skipped. `None` if nothing remains.
    fn calculate_timesize_weighted_average(
        &self,
        now: Instant,
        samples: &[TimedSize],
    ) -> Option<(f64, f64)> {
        let size_avg = mean_size(samples)?;
        let (avg, recent) = size_weighted_pairs(now, samples, size_avg, |size, elapsed| {
            (elapsed > 0.0).then(|| size / elapsed)
        });
        let avg = weighted_mean(self.fold(&avg))?;
        let recent = weighted_mean(self.fold(&recent))?;
        Some((avg, recent))
    }

    /// Time weighted `(avg, recent)` of `(time, size, value)` records with the
    /// same size boost as [`StatMath::calculate_timesize_weighted_average`].
    ///
    /// Records with `value <= 0` are skipped.
    fn calculate_size_weighted_average(
        &self,
        now: Instant,
        samples: &[TimedSize],
    ) -> Option<(f64, f64)> {
        let size_avg = mean_size(samples)?;
        let (avg, recent) =
            size_weighted_pairs(now, samples, size_avg, |_, value| (value > 0.0).then_some(value));
        let avg = weighted_mean(self.fold(&avg))?;
        let recent = weighted_mean(self.fold(&recent))?;
        Some((avg, recent))
    }

    /// `(factor, weight)` that pulls towards `target`.
    ///
    /// The factor is above 1.0 when `recent` is above the target (or above the
    /// average), asking for more delay. The weight grows with the distance of
    /// the factor from 1.0.
    fn calculate_for_target(&self, target: f64, avg: f64, recent: f64, p: &Target) -> (f64, f64) {
        assert!(p.aim > 0.0 && p.aim < 1.0, "aim must be within (0, 1): {}", p.aim);
        assert!(p.div > 0.0, "div must be positive: {}", p.div);

        let target = target / p.div;
        let avg = avg / p.div;
        let recent = recent / p.div;

        let target_factor = recent / (p.slope + target);
        let avg_factor = recent / (p.slope + avg);
        let aimed = p.aim * avg_factor + (1.0 - p.aim) * target_factor;

        let factor = (p.smoothing)(aimed);
        let off = 0.0_f64.max(1.0 - factor).max(factor - 1.0);
        let weight = (p.smoothing)(off) * p.weight_multiplier;

        (factor, weight)
    }

    /// `(factor, weight)` from how far `recent` is from `avg`, for metrics
    /// without a known optimum.
    fn calculate_for_average(&self, avg: f64, recent: f64, p: &Average) -> (f64, f64) {
        assert!(p.div > 0.0, "div must be positive: {}", p.div);
        assert!(avg > 0.0, "average must be positive: {}", avg);

        let factor = logp((recent / p.div) / (avg / p.div));
        let inverse = if factor > 0.0 { 1.0 / factor } else { 0.0 };
        let weight = 0.0_f64.max(factor.max(inverse) - 1.0 + p.weight_offset) / p.weight_div;

        (factor, weight)
    }

    /// Inspects a queue size history: is the queue getting longer or shorter
    /// than `target`.
    ///
    /// An empty history is neutral: `(1.0, 0.0)`.
    fn queue_inspect(
        &self,
        now: Instant,
        samples: &[TimedValue],
        target: f64,
        div: f64,
        smoothing: Smoothing,
    ) -> (f64, f64) {
        let Some((avg, recent)) = self.calculate_time_weighted_average(now, samples) else {
            return (1.0, 0.0);
        };
        let p = Target::default()
            .aim(0.25)
            .slope(1.0)
            .div(div)
            .smoothing(smoothing);
        self.calculate_for_target(target, avg, recent, &p)
    }
}

fn weighted_mean((tv, tw): (f64, f64)) -> Option<f64> {
    (tw > 0.0 && tw.is_finite()).then(|| tv / tw)
}

fn mean_size(samples: &[TimedSize]) -> Option<f64> {
    if samples.is_empty() {
        return None;
    }
    let mean = samples.iter().map(|s| s.1).sum::<f64>() / samples.len() as f64;
    (mean > 0.0).then_some(mean)
}

type Pairs = Vec<(f64, f64)>;

fn size_weighted_pairs<F>(now: Instant, samples: &[TimedSize], size_avg: f64, value: F) -> (Pairs, Pairs)
where
    F: Fn(f64, f64) -> Option<f64>,
{
    let mut avg = Vec::with_capacity(samples.len());
    let mut recent = Vec::with_capacity(samples.len());

    for &(t, size, x) in samples {
        let Some(v) = value(size, x) else {
            continue;
        };
        let pw = logp(size / size_avg);
        let age = age_secs(now, t);
        avg.push((v, pw / (1.0 + age)));
        recent.push((v, pw / (0.1 + age * age)));
    }

    (avg, recent)
}

/// Straightforward sequential fold.
#[derive(Debug, Clone, Copy, Default)]
pub struct Scalar;

impl StatMath for Scalar {
    fn fold(&self, pairs: &[(f64, f64)]) -> (f64, f64) {
        pairs
            .iter()
            .fold((0.0, 0.0), |(tv, tw), &(v, w)| (tv + v * w, tw + w))
    }
}

/// Fold with four independent accumulators, which the compiler can vectorize.
#[derive(Debug, Clone, Copy, Default)]
pub struct Lanes;

impl StatMath for Lanes {
    fn fold(&self, pairs: &[(f64, f64)]) -> (f64, f64) {
        let mut tv = [0.0_f64; 4];
        let mut tw = [0.0_f64; 4];

        let chunks = pairs.chunks_exact(4);
        let rest = chunks.remainder();

        for c in chunks {
            for i in 0..4 {
                tv[i] += c[i].0 * c[i].1;
                tw[i] += c[i].1;
            }
        }

        let mut v = (tv[0] + tv[1]) + (tv[2] + tv[3]);
        let mut w = (tw[0] + tw[1]) + (tw[2] + tw[3]);
        for &(x, y) in rest {
            v += x * y;
            w += y;
        }

        (v, w)
    }
}

/// See [`StatMath::time_weighted_average`].
pub fn time_weighted_average(
    now: Instant,
    samples: &[TimedValue],
    min_offset: f64,
    recent_power: f64,
) -> Option<f64> {
    Scalar.time_weighted_average(now, samples, min_offset, recent_power)
}

/// See [`StatMath::calculate_time_weighted_average`].
pub fn calculate_time_weighted_average(now: Instant, samples: &[TimedValue]) -> Option<(f64, f64)> {
    Scalar.calculate_time_weighted_average(now, samples)
}

/// See [`StatMath::calculate_timesize_weighted_average`].
pub fn calculate_timesize_weighted_average(
    now: Instant,
    samples: &[TimedSize],
) -> Option<(f64, f64)> {
    Scalar.calculate_timesize_weighted_average(now, samples)
}

/// See [`StatMath::calculate_size_weighted_average`].
pub fn calculate_size_weighted_average(now: Instant, samples: &[TimedSize]) -> Option<(f64, f64)> {
    Scalar.calculate_size_weighted_average(now, samples)
}

/// See [`StatMath::calculate_for_target`].
pub fn calculate_for_target(target: f64, avg: f64, recent: f64, p: &Target) -> (f64, f64) {
    Scalar.calculate_for_target(target, avg, recent, p)
}

/// See [`StatMath::calculate_for_average`].
pub fn calculate_for_average(avg: f64, recent: f64, p: &Average) -> (f64, f64) {
    Scalar.calculate_for_average(avg, recent, p)
}

/// See [`StatMath::queue_inspect`].
pub fn queue_inspect(
    now: Instant,
    samples: &[TimedValue],
    target: f64,
    div: f64,
    smoothing: Smoothing,
) -> (f64, f64) {
    Scalar.queue_inspect(now, samples, target, div, smoothing)
}
