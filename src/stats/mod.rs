//! Statistics shared by the batch delay and encoder tuning loops.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;

mod list;
pub mod math;

pub use list::ListStats;
pub use math::{logp, Average, Lanes, Scalar, StatMath, Target, TimedSize, TimedValue};

/// Shared handle to a math backend.
pub type Math = Arc<dyn StatMath>;

pub(crate) fn default_math() -> Math {
    Arc::new(Scalar)
}

/// One signal's vote on the next delay: multiply the current delay by
/// `factor`, with `weight` relative influence.
///
/// Only lives for the duration of one recalculation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Factor {
    /// Name of the signal.
    pub metric: &'static str,
    /// Requested change, 1.0 is "no change".
    pub factor: f64,
    /// Influence relative to the other factors.
    pub weight: f64,
}

impl Factor {
    /// Create a factor from a `(factor, weight)` pair.
    pub fn new(metric: &'static str, (factor, weight): (f64, f64)) -> Self {
        Factor {
            metric,
            factor,
            weight,
        }
    }

    /// Like [`Factor::new`] but `None` unless the weight exceeds `min_weight`.
    pub fn above(metric: &'static str, fw: (f64, f64), min_weight: f64) -> Option<Self> {
        (fw.1 > min_weight).then(|| Factor::new(metric, fw))
    }

    pub(crate) fn is_valid(&self) -> bool {
        self.factor.is_finite() && self.weight.is_finite() && self.weight >= 0.0
    }
}

impl fmt::Display for Factor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:<28}: {:.2},{:.2}", self.metric, self.factor, self.weight)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn above_threshold() {
        assert!(Factor::above("x", (1.2, 0.005), 0.01).is_none());
        assert_eq!(
            Factor::above("x", (1.2, 0.5), 0.01),
            Some(Factor::new("x", (1.2, 0.5)))
        );
    }

    #[test]
    fn validity() {
        assert!(Factor::new("ok", (0.0, 0.0)).is_valid());
        assert!(!Factor::new("nan", (f64::NAN, 1.0)).is_valid());
        assert!(!Factor::new("inf", (1.0, f64::INFINITY)).is_valid());
        assert!(!Factor::new("neg", (1.0, -0.5)).is_valid());
    }

    #[test]
    fn display() {
        let s = Factor::new("client-latency", (1.234, 0.5)).to_string();
        assert!(s.starts_with("client-latency"));
        assert!(s.ends_with("1.23,0.50"));
    }
}
