//! Reporting utilities: percentile bands and formatted terminal output.

pub mod format;

pub use format::*;

use chrono::{DateTime, Utc};

use crate::domain::{ForecastBatch, Product};

/// Point forecast and sample percentiles for one product-hour.
#[derive(Debug, Clone, PartialEq)]
pub struct HourBand {
    pub timestamp: DateTime<Utc>,
    pub product: Product,
    pub point: f64,
    pub p10: f64,
    pub p50: f64,
    pub p90: f64,
    pub is_fallback: bool,
}

/// P10/P50/P90 of every record's samples, in batch order.
pub fn hour_bands(batch: &ForecastBatch) -> Vec<HourBand> {
    batch
        .records
        .iter()
        .map(|r| {
            let mut sorted = r.samples.clone();
            sorted.sort_by(f64::total_cmp);
            HourBand {
                timestamp: r.timestamp,
                product: r.product,
                point: r.point_forecast,
                p10: percentile(&sorted, 0.10),
                p50: percentile(&sorted, 0.50),
                p90: percentile(&sorted, 0.90),
                is_fallback: r.is_fallback,
            }
        })
        .collect()
}

/// Linear-interpolated percentile of sorted values (`NaN` when empty).
pub fn percentile(sorted: &[f64], q: f64) -> f64 {
    match sorted.len() {
        0 => f64::NAN,
        1 => sorted[0],
        n => {
            let pos = q.clamp(0.0, 1.0) * (n - 1) as f64;
            let lo = pos.floor() as usize;
            let hi = pos.ceil() as usize;
            let frac = pos - lo as f64;
            sorted[lo] + (sorted[hi] - sorted[lo]) * frac
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percentile_interpolates() {
        let v: Vec<f64> = (0..=10).map(f64::from).collect();
        assert_eq!(percentile(&v, 0.1), 1.0);
        assert_eq!(percentile(&v, 0.5), 5.0);
        assert_eq!(percentile(&[1.0, 2.0], 0.5), 1.5);
        assert!(percentile(&[], 0.5).is_nan());
    }
}
