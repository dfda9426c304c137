//! Feature assembly for one (product, hour) key.
//!
//! `as_of` is the start of the forecast horizon (`target_date 00:00Z`).
//! Everything stamped at or before `as_of` is history; the target hour for
//! hour ending `h` is `as_of + h hours`.
//!
//! Lag features use the product's own price at the same hour-of-day:
//!
//! - short: the most recent day with that hour in history
//!   (`target - 24h * ceil(h / 24)`)
//! - medium: one week before the short lag
//! - long: four weeks before the short lag
//!
//! The builder is pure: identical inputs give an identical vector.

use std::collections::BTreeMap;

use chrono::{DateTime, Datelike, Duration, Timelike, Utc};

use crate::data::{InputDataset, LOAD_SERIES, generation_series};
use crate::domain::{FeatureVector, ModelKey, Product};
use crate::error::FeatureError;

pub const HOUR_OF_DAY: &str = "hour_of_day";
pub const DAY_OF_WEEK: &str = "day_of_week";
pub const IS_WEEKEND: &str = "is_weekend";
pub const PRICE_LAG_SHORT: &str = "price_lag_short";
pub const PRICE_LAG_MEDIUM: &str = "price_lag_medium";
pub const PRICE_LAG_LONG: &str = "price_lag_long";
pub const LOAD: &str = "load";
pub const GEN_TOTAL: &str = "gen_total";
pub const LOAD_TO_GENERATION: &str = "load_to_generation";
pub const NET_LOAD: &str = "net_load";

const MEDIUM_LAG_DAYS: i64 = 7;
const LONG_LAG_DAYS: i64 = 28;

/// Features that do not depend on the configured fuel list.
const FIXED_FEATURES: [&str; 10] = [
    HOUR_OF_DAY,
    DAY_OF_WEEK,
    IS_WEEKEND,
    PRICE_LAG_SHORT,
    PRICE_LAG_MEDIUM,
    PRICE_LAG_LONG,
    LOAD,
    GEN_TOTAL,
    LOAD_TO_GENERATION,
    NET_LOAD,
];

/// Whether a model coefficient name can ever be produced by the builder.
pub fn is_known_feature(name: &str) -> bool {
    FIXED_FEATURES.contains(&name) || name.strip_prefix("gen_").is_some_and(|f| !f.is_empty())
}

#[derive(Debug, Clone)]
pub struct FeatureBuilder {
    fuels: Vec<String>,
}

impl FeatureBuilder {
    pub fn new(fuels: &[String]) -> Self {
        Self {
            fuels: fuels.to_vec(),
        }
    }

    pub fn build(
        &self,
        dataset: &InputDataset,
        key: ModelKey,
        as_of: DateTime<Utc>,
    ) -> Result<FeatureVector, FeatureError> {
        let hours = i64::from(key.hour_ending.get());
        let target = as_of + Duration::hours(hours);
        let mut values = BTreeMap::new();

        // Temporal indicators of the target hour.
        let weekday = target.weekday().num_days_from_monday();
        values.insert(HOUR_OF_DAY.to_string(), f64::from(target.hour()));
        values.insert(DAY_OF_WEEK.to_string(), f64::from(weekday));
        values.insert(IS_WEEKEND.to_string(), if weekday >= 5 { 1.0 } else { 0.0 });

        // Same-hour price lags.
        let price_series = key.product.price_series();
        let days_back = (hours + 23) / 24;
        let short_at = target - Duration::days(days_back);
        let medium_at = short_at - Duration::days(MEDIUM_LAG_DAYS);
        let long_at = short_at - Duration::days(LONG_LAG_DAYS);

        let first = dataset
            .first_timestamp(&price_series)
            .ok_or_else(|| missing(key, &price_series, short_at))?;
        if first > long_at {
            return Err(FeatureError::InsufficientHistory {
                key,
                required_from: long_at.to_rfc3339(),
                available_from: first.to_rfc3339(),
            });
        }

        for (name, at) in [
            (PRICE_LAG_SHORT, short_at),
            (PRICE_LAG_MEDIUM, medium_at),
            (PRICE_LAG_LONG, long_at),
        ] {
            let v = lookup(dataset, key, &price_series, at)?;
            values.insert(name.to_string(), v);
        }

        // Load and generation at the target hour.
        let load = lookup(dataset, key, LOAD_SERIES, target)?;
        values.insert(LOAD.to_string(), load);

        let mut gen_total = 0.0;
        for fuel in &self.fuels {
            let series = generation_series(fuel);
            let v = lookup(dataset, key, &series, target)?;
            gen_total += v;
            values.insert(series, v);
        }
        values.insert(GEN_TOTAL.to_string(), gen_total);

        // Derived ratios. A zero denominator yields a non-finite feature,
        // which the forecaster reports as a numerical error.
        values.insert(LOAD_TO_GENERATION.to_string(), load / gen_total);
        let renewables: f64 = ["wind", "solar"]
            .iter()
            .filter_map(|f| values.get(&generation_series(f)))
            .sum();
        values.insert(NET_LOAD.to_string(), load - renewables);

        Ok(FeatureVector::new(key, target, values))
    }
}

fn lookup(
    dataset: &InputDataset,
    key: ModelKey,
    series: &str,
    at: DateTime<Utc>,
) -> Result<f64, FeatureError> {
    dataset
        .value(series, at)
        .ok_or_else(|| missing(key, series, at))
}

fn missing(key: ModelKey, series: &str, at: DateTime<Utc>) -> FeatureError {
    FeatureError::MissingSeries {
        key,
        series: series.to_string(),
        at: at.to_rfc3339(),
    }
}

/// Rolling maximum absolute price over `window_hours` ending at `as_of`.
///
/// Used by the plausibility outlier guard; `None` when the window is empty.
pub fn historical_max(
    dataset: &InputDataset,
    product: Product,
    as_of: DateTime<Utc>,
    window_hours: u32,
) -> Option<f64> {
    let series = dataset.series(&product.price_series())?;
    let from = as_of - Duration::hours(i64::from(window_hours));
    series
        .range(from..=as_of)
        .map(|(_, v)| v.abs())
        .fold(None, |acc, v| Some(acc.map_or(v, |m: f64| m.max(v))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{HourEnding, horizon_start};
    use chrono::NaiveDate;

    fn fuels() -> Vec<String> {
        vec!["wind".to_string(), "solar".to_string(), "thermal".to_string()]
    }

    fn dataset(as_of: DateTime<Utc>, history_days: i64) -> InputDataset {
        let mut ds = InputDataset::new();
        let start = as_of - Duration::days(history_days);
        let end = as_of + Duration::hours(72);
        let mut at = start;
        while at <= end {
            let h = f64::from(at.hour());
            if at <= as_of {
                ds.insert("price_dalmp", at, 20.0 + h);
            }
            ds.insert(LOAD_SERIES, at, 40_000.0 + 100.0 * h);
            ds.insert("gen_wind", at, 10_000.0);
            ds.insert("gen_solar", at, 5_000.0);
            ds.insert("gen_thermal", at, 30_000.0);
            at += Duration::hours(1);
        }
        ds
    }

    fn key(h: u8) -> ModelKey {
        ModelKey::new(Product::Dalmp, HourEnding::new(h).unwrap())
    }

    #[test]
    fn builds_temporal_lag_and_ratio_features() {
        let as_of = horizon_start(NaiveDate::from_ymd_opt(2026, 3, 2).unwrap());
        let ds = dataset(as_of, 40);
        let fv = FeatureBuilder::new(&fuels()).build(&ds, key(30), as_of).unwrap();

        // h30 -> 2026-03-03 06:00, a Tuesday.
        assert_eq!(fv.get(HOUR_OF_DAY), Some(6.0));
        assert_eq!(fv.get(DAY_OF_WEEK), Some(1.0));
        assert_eq!(fv.get(IS_WEEKEND), Some(0.0));
        assert_eq!(fv.get(PRICE_LAG_SHORT), Some(26.0));
        assert_eq!(fv.get(LOAD), Some(40_600.0));
        assert_eq!(fv.get(GEN_TOTAL), Some(45_000.0));
        assert_eq!(fv.get(NET_LOAD), Some(40_600.0 - 15_000.0));
        let ratio = fv.get(LOAD_TO_GENERATION).unwrap();
        assert!((ratio - 40_600.0 / 45_000.0).abs() < 1e-12);
    }

    #[test]
    fn identical_inputs_give_identical_vectors() {
        let as_of = horizon_start(NaiveDate::from_ymd_opt(2026, 3, 2).unwrap());
        let ds = dataset(as_of, 40);
        let builder = FeatureBuilder::new(&fuels());
        assert_eq!(
            builder.build(&ds, key(5), as_of).unwrap(),
            builder.build(&ds, key(5), as_of).unwrap()
        );
    }

    #[test]
    fn short_history_is_reported() {
        let as_of = horizon_start(NaiveDate::from_ymd_opt(2026, 3, 2).unwrap());
        let ds = dataset(as_of, 10);
        let err = FeatureBuilder::new(&fuels()).build(&ds, key(1), as_of).unwrap_err();
        assert!(matches!(err, FeatureError::InsufficientHistory { .. }));
    }

    #[test]
    fn missing_load_series_is_reported() {
        let as_of = horizon_start(NaiveDate::from_ymd_opt(2026, 3, 2).unwrap());
        let mut ds = dataset(as_of, 40);
        ds.remove_series(LOAD_SERIES);
        let err = FeatureBuilder::new(&fuels()).build(&ds, key(1), as_of).unwrap_err();
        assert!(matches!(err, FeatureError::MissingSeries { ref series, .. } if series == LOAD_SERIES));
    }

    #[test]
    fn rolling_max_uses_window_only() {
        let as_of = horizon_start(NaiveDate::from_ymd_opt(2026, 3, 2).unwrap());
        let mut ds = dataset(as_of, 40);
        ds.insert("price_dalmp", as_of - Duration::days(35), -900.0);
        assert_eq!(historical_max(&ds, Product::Dalmp, as_of, 24 * 30), Some(43.0));
        assert_eq!(historical_max(&ds, Product::Dalmp, as_of, 24 * 36), Some(900.0));
        assert_eq!(historical_max(&ds, Product::Rtlmp, as_of, 24), None);
    }
}
