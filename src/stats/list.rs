use serde::Serialize;

/// Descriptive statistics over a list of values.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ListStats {
    /// Number of values.
    pub count: usize,
    /// Smallest value.
    pub min: f64,
    /// Largest value.
    pub max: f64,
    /// Arithmetic mean.
    pub avg: f64,
    /// Population standard deviation.
    pub std: f64,
    /// Coefficient of variation in percent, if the mean is not zero.
    pub cv_pct: Option<f64>,
    /// Geometric mean of the positive values.
    pub gm: Option<f64>,
    /// Harmonic mean of the non-zero values.
    pub h: Option<f64>,
    /// Deciles: `(10, p10)`, `(20, p20)` ... `(90, p90)`.
    pub percentiles: Vec<(u8, f64)>,
}

impl ListStats {
    /// Computes stats over a copy of `values`.
    ///
    /// The source is often a history another thread appends to, so it is
    /// always collected first. `None` for an empty list.
    pub fn new<I>(values: I) -> Option<ListStats>
    where
        I: IntoIterator<Item = f64>,
    {
        let mut values: Vec<f64> = values.into_iter().collect();
        if values.is_empty() {
            return None;
        }

        let n = values.len() as f64;
        let avg = values.iter().sum::<f64>() / n;
        let var = values.iter().map(|x| (x - avg).powi(2)).sum::<f64>() / n;
        let std = var.sqrt();

        // Geometric mean in log space to avoid overflowing the product.
        let (log_sum, positives) = values
            .iter()
            .filter(|x| **x > 0.0)
            .fold((0.0, 0_usize), |(s, c), x| (s + x.ln(), c + 1));
        let gm = (positives > 0).then(|| (log_sum / positives as f64).exp());

        let (inv_sum, non_zero) = values
            .iter()
            .filter(|x| **x != 0.0)
            .fold((0.0, 0_usize), |(s, c), x| (s + 1.0 / x, c + 1));
        let h = (inv_sum != 0.0).then(|| non_zero as f64 / inv_sum);

        values.sort_by(|a, b| a.total_cmp(b));
        let percentiles = (1..10)
            .map(|i| {
                let idx = values.len() * i / 10;
                ((i * 10) as u8, values[idx])
            })
            .collect();

        Some(ListStats {
            count: values.len(),
            min: values[0],
            max: values[values.len() - 1],
            avg,
            std,
            cv_pct: (avg != 0.0).then(|| 100.0 * std / avg),
            gm,
            h,
            percentiles,
        })
    }

    /// The `pct` percentile, if it is one of the deciles.
    pub fn percentile(&self, pct: u8) -> Option<f64> {
        self.percentiles
            .iter()
            .find(|(p, _)| *p == pct)
            .map(|(_, v)| *v)
    }
}
