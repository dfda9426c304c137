//! Probabilistic forecaster: point estimate plus Normal samples for one key.
//!
//! For a feature vector `x` and a model `(β0, β, σ)`:
//!
//! - point forecast `μ = β0 + β · x`
//! - `N` i.i.d. samples from `Normal(μ, σ)`
//!
//! The sample RNG is seeded from an FNV-1a fold of `(base seed, run date,
//! product, hour)` so a rerun of the same date reproduces the same samples on
//! any toolchain, while different dates and keys draw independent streams.
//!
//! Products that cannot settle negative are clipped at zero after sampling.

use std::collections::BTreeMap;

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use rand::prelude::*;
use rand::rngs::StdRng;
use rand_distr::Normal;

use crate::domain::{FeatureVector, ForecastRecord, ModelKey, ModelSpec, Product};
use crate::error::ModelExecutionError;
use crate::math::linear_predict;

#[derive(Debug, Clone)]
pub struct ProbabilisticForecaster {
    run_date: NaiveDate,
    seed: u64,
    sample_count: usize,
    generation_timestamp: DateTime<Utc>,
    /// Products whose values are floored at zero.
    non_negative: BTreeMap<Product, bool>,
}

impl ProbabilisticForecaster {
    pub fn new(
        run_date: NaiveDate,
        seed: u64,
        sample_count: usize,
        generation_timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            run_date,
            seed,
            sample_count,
            generation_timestamp,
            non_negative: BTreeMap::new(),
        }
    }

    /// Mark which products are clipped at zero.
    pub fn with_clipping(mut self, clip: impl IntoIterator<Item = (Product, bool)>) -> Self {
        self.non_negative.extend(clip);
        self
    }

    pub fn forecast(
        &self,
        features: &FeatureVector,
        spec: &ModelSpec,
    ) -> Result<ForecastRecord, ModelExecutionError> {
        let key = features.key();

        let mut betas = Vec::with_capacity(spec.coefficients.len());
        let mut xs = Vec::with_capacity(spec.coefficients.len());
        for (name, beta) in &spec.coefficients {
            let x = features
                .get(name)
                .ok_or_else(|| ModelExecutionError::MissingFeature {
                    key,
                    feature: name.clone(),
                })?;
            betas.push(*beta);
            xs.push(x);
        }

        let point = linear_predict(spec.intercept, &betas, &xs).ok_or_else(|| numerical(
            key,
            "non-finite point forecast (check coefficients and features)",
        ))?;

        let sigma = spec.residual_std;
        let normal = Normal::new(point, sigma)
            .map_err(|e| numerical(key, &format!("sample distribution error: {e}")))?;

        let mut rng = StdRng::seed_from_u64(sample_seed(self.seed, self.run_date, key));
        let mut samples: Vec<f64> = (0..self.sample_count)
            .map(|_| normal.sample(&mut rng))
            .collect();
        if samples.iter().any(|v| !v.is_finite()) {
            return Err(numerical(key, "non-finite sample"));
        }

        let mut point_forecast = point;
        if self.non_negative.get(&key.product).copied().unwrap_or(false) {
            point_forecast = point_forecast.max(0.0);
            for s in &mut samples {
                *s = s.max(0.0);
            }
        }

        Ok(ForecastRecord {
            timestamp: features.target_timestamp(),
            product: key.product,
            point_forecast,
            samples,
            generation_timestamp: self.generation_timestamp,
            is_fallback: false,
            fallback_reason: None,
        })
    }
}

fn numerical(key: ModelKey, detail: &str) -> ModelExecutionError {
    ModelExecutionError::NumericalError {
        key,
        detail: detail.to_string(),
    }
}

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Per-run, per-key seed.
pub fn sample_seed(seed: u64, run_date: NaiveDate, key: ModelKey) -> u64 {
    let mut hash = FNV_OFFSET;
    let mut fold = |bytes: &[u8]| {
        for &b in bytes {
            hash ^= u64::from(b);
            hash = hash.wrapping_mul(FNV_PRIME);
        }
    };
    fold(&seed.to_le_bytes());
    fold(&run_date.num_days_from_ce().to_le_bytes());
    fold(key.product.code().as_bytes());
    fold(&[key.hour_ending.get()]);
    hash
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{HourEnding, horizon_start};

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 6, 1).unwrap()
    }

    fn key(product: Product, h: u8) -> ModelKey {
        ModelKey::new(product, HourEnding::new(h).unwrap())
    }

    fn features(key: ModelKey, lag: f64) -> FeatureVector {
        let values = BTreeMap::from([("price_lag_short".to_string(), lag), ("load".to_string(), 40_000.0)]);
        FeatureVector::new(key, key.target_timestamp(date()), values)
    }

    fn spec(key: ModelKey, intercept: f64, sigma: f64) -> ModelSpec {
        ModelSpec {
            product: key.product,
            hour_ending: key.hour_ending,
            intercept,
            coefficients: BTreeMap::from([
                ("price_lag_short".to_string(), 0.5),
                ("load".to_string(), 0.001),
            ]),
            residual_std: sigma,
        }
    }

    fn forecaster(n: usize) -> ProbabilisticForecaster {
        ProbabilisticForecaster::new(date(), 7, n, horizon_start(date()))
    }

    #[test]
    fn point_is_linear_combination() {
        let k = key(Product::Dalmp, 3);
        let rec = forecaster(10).forecast(&features(k, 30.0), &spec(k, 5.0, 2.0)).unwrap();
        assert!((rec.point_forecast - (5.0 + 15.0 + 40.0)).abs() < 1e-9);
        assert_eq!(rec.samples.len(), 10);
        assert_eq!(rec.timestamp, k.target_timestamp(date()));
        assert!(!rec.is_fallback);
    }

    #[test]
    fn seed_is_fixed_across_builds() {
        assert_eq!(sample_seed(7, date(), key(Product::Dalmp, 1)), 0x73bd_5747_3742_c51d);
        assert_eq!(sample_seed(7, date(), key(Product::Dalmp, 2)), 0x73bd_5447_3742_c004);
    }

    #[test]
    fn samples_are_reproducible_per_key_and_date() {
        let k = key(Product::Rtlmp, 12);
        let f = forecaster(100);
        let a = f.forecast(&features(k, 30.0), &spec(k, 0.0, 5.0)).unwrap();
        let b = f.forecast(&features(k, 30.0), &spec(k, 0.0, 5.0)).unwrap();
        assert_eq!(a.samples, b.samples);

        let other_day = ProbabilisticForecaster::new(date().succ_opt().unwrap(), 7, 100, horizon_start(date()));
        let c = other_day.forecast(&features(k, 30.0), &spec(k, 0.0, 5.0)).unwrap();
        assert_ne!(a.samples, c.samples);
    }

    #[test]
    fn non_negative_products_are_clipped() {
        let k = key(Product::RegUp, 1);
        let f = forecaster(200).with_clipping([(Product::RegUp, true)]);
        let rec = f.forecast(&features(k, 0.0), &spec(k, -45.0, 10.0)).unwrap();
        assert_eq!(rec.point_forecast, 0.0);
        assert!(rec.samples.iter().all(|v| *v >= 0.0));

        let k = key(Product::Rtlmp, 1);
        let rec = f.forecast(&features(k, 0.0), &spec(k, -45.0, 10.0)).unwrap();
        assert!(rec.point_forecast < 0.0);
    }

    #[test]
    fn non_finite_results_are_numerical_errors() {
        let k = key(Product::Dalmp, 12);
        let err = forecaster(10)
            .forecast(&features(k, f64::INFINITY), &spec(k, 0.0, 1.0))
            .unwrap_err();
        assert!(matches!(err, ModelExecutionError::NumericalError { .. }));
    }

    #[test]
    fn missing_feature_is_reported() {
        let k = key(Product::Dalmp, 12);
        let mut s = spec(k, 0.0, 1.0);
        s.coefficients.insert("gen_wind".to_string(), 1.0);
        let err = forecaster(10).forecast(&features(k, 1.0), &s).unwrap_err();
        assert!(matches!(err, ModelExecutionError::MissingFeature { ref feature, .. } if feature == "gen_wind"));
    }
}
