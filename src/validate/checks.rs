use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};

use crate::domain::{
    ConsistencyRule, ForecastBatch, ModelKey, PipelineConfig, Product, ProductSettings,
    ValidationResult, ValidationStage,
};
use crate::error::ValidationError;
use crate::io::ForecastSchema;

/// Everything the checks need besides the batch itself.
#[derive(Debug, Clone)]
pub struct ValidationContext {
    pub products: Vec<Product>,
    pub horizon: u8,
    pub schema: ForecastSchema,
    pub settings: BTreeMap<Product, ProductSettings>,
    pub rules: Vec<ConsistencyRule>,
    /// Rolling maximum absolute historical price per product.
    pub historical_max: BTreeMap<Product, f64>,
    pub outlier_multiple: f64,
}

impl ValidationContext {
    pub fn from_config(config: &PipelineConfig, historical_max: BTreeMap<Product, f64>) -> Self {
        Self {
            products: config.products.clone(),
            horizon: config.horizon_hours,
            schema: ForecastSchema::new(config.sample_count),
            settings: config
                .products
                .iter()
                .map(|&p| (p, config.settings(p)))
                .collect(),
            rules: config.consistency_rules.clone(),
            historical_max,
            outlier_multiple: config.outlier_multiple,
        }
    }

    fn settings(&self, product: Product) -> ProductSettings {
        self.settings
            .get(&product)
            .copied()
            .unwrap_or_else(|| ProductSettings::default_for(product))
    }

    /// Outlier ceiling for a product, if there is history to derive it from.
    fn outlier_limit(&self, product: Product) -> Option<f64> {
        self.historical_max
            .get(&product)
            .filter(|m| **m > 0.0)
            .map(|m| m * self.outlier_multiple)
    }
}

#[derive(Debug, Clone)]
pub struct ForecastValidator {
    ctx: ValidationContext,
}

impl ForecastValidator {
    pub fn new(ctx: ValidationContext) -> Self {
        Self { ctx }
    }

    /// Run all four checks in order.
    pub fn validate_all(&self, batch: &ForecastBatch) -> Vec<ValidationResult> {
        ValidationStage::ALL
            .into_iter()
            .map(|stage| self.validate(stage, batch))
            .collect()
    }

    pub fn validate(&self, stage: ValidationStage, batch: &ForecastBatch) -> ValidationResult {
        match stage {
            ValidationStage::Completeness => self.check_completeness(batch),
            ValidationStage::Plausibility => self.check_plausibility(batch),
            ValidationStage::Consistency => self.check_consistency(batch),
            ValidationStage::Schema => self.check_schema(batch),
        }
    }

    pub fn check_completeness(&self, batch: &ForecastBatch) -> ValidationResult {
        let expected: BTreeSet<ModelKey> =
            ModelKey::horizon(&self.ctx.products, self.ctx.horizon).into_iter().collect();

        let mut seen: BTreeMap<ModelKey, usize> = BTreeMap::new();
        let mut details = Vec::new();
        let mut keys = Vec::new();

        for record in &batch.records {
            match record.key(batch.target_date) {
                Some(key) if expected.contains(&key) => *seen.entry(key).or_default() += 1,
                Some(key) => {
                    details.push(format!("{key}: unexpected record"));
                    keys.push(key);
                }
                None => details.push(format!(
                    "{}: record at {} is outside the horizon",
                    record.product, record.timestamp
                )),
            }
        }

        for key in &expected {
            match seen.get(key).copied().unwrap_or(0) {
                0 => {
                    details.push(format!("{key}: missing"));
                    keys.push(*key);
                }
                1 => {}
                n => {
                    details.push(format!("{key}: {n} records"));
                    keys.push(*key);
                }
            }
        }

        ValidationResult::new(ValidationStage::Completeness, details, keys)
    }

    pub fn check_plausibility(&self, batch: &ForecastBatch) -> ValidationResult {
        let mut details = Vec::new();
        let mut keys = Vec::new();

        for record in &batch.records {
            let Some(key) = record.key(batch.target_date) else {
                continue;
            };
            let settings = self.ctx.settings(record.product);
            let limit = self.ctx.outlier_limit(record.product);

            let values = std::iter::once(("point", record.point_forecast))
                .chain(record.samples.iter().map(|&s| ("sample", s)));
            let mut offending = Vec::new();
            for (what, v) in values {
                if !v.is_finite() {
                    offending.push(format!("{what} {v} is not finite"));
                } else if v < settings.min || v > settings.max {
                    offending.push(format!(
                        "{what} {v} outside [{}, {}]",
                        settings.min, settings.max
                    ));
                } else if limit.is_some_and(|l| v.abs() > l) {
                    offending.push(format!(
                        "{what} {v} exceeds {}x historical max",
                        self.ctx.outlier_multiple
                    ));
                }
            }

            if !offending.is_empty() {
                let extra = offending.len().saturating_sub(3);
                offending.truncate(3);
                let mut detail = format!("{key}: {}", offending.join(", "));
                if extra > 0 {
                    detail.push_str(&format!(" (+{extra} more)"));
                }
                details.push(detail);
                keys.push(key);
            }
        }

        ValidationResult::new(ValidationStage::Plausibility, details, keys)
    }

    pub fn check_consistency(&self, batch: &ForecastBatch) -> ValidationResult {
        let points: BTreeMap<(Product, DateTime<Utc>), f64> = batch
            .records
            .iter()
            .map(|r| ((r.product, r.timestamp), r.point_forecast))
            .collect();

        let mut details = Vec::new();
        let mut keys = Vec::new();

        for rule in &self.ctx.rules {
            for record in batch.records.iter().filter(|r| r.product == rule.lower) {
                let Some(&upper) = points.get(&(rule.upper, record.timestamp)) else {
                    continue;
                };
                if record.point_forecast > upper {
                    let Some(key) = record.key(batch.target_date) else {
                        continue;
                    };
                    details.push(format!(
                        "{key}: {} {} exceeds {} {}",
                        rule.lower, record.point_forecast, rule.upper, upper
                    ));
                    keys.push(key);
                }
            }
        }

        ValidationResult::new(ValidationStage::Consistency, details, keys)
    }

    pub fn check_schema(&self, batch: &ForecastBatch) -> ValidationResult {
        let (details, keys) = self.ctx.schema.violations(batch, &self.ctx.products);
        ValidationResult::new(ValidationStage::Schema, details, keys)
    }
}

/// Typed error for a failed stage; `None` when it passed.
pub fn stage_error(result: &ValidationResult) -> Option<ValidationError> {
    (!result.passed).then(|| ValidationError {
        stage: result.stage,
        keys: result.keys.clone(),
        details: result.details.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ForecastRecord, HourEnding, horizon_start};
    use chrono::{Duration, NaiveDate};

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 8, 3).unwrap()
    }

    fn ctx() -> ValidationContext {
        let config = PipelineConfig {
            products: vec![Product::Dalmp, Product::RegUp],
            horizon_hours: 4,
            sample_count: 3,
            ..PipelineConfig::default()
        };
        ValidationContext::from_config(&config, BTreeMap::from([(Product::Dalmp, 100.0)]))
    }

    fn record(product: Product, h: i64, point: f64) -> ForecastRecord {
        ForecastRecord {
            timestamp: horizon_start(date()) + Duration::hours(h),
            product,
            point_forecast: point,
            samples: vec![point - 1.0, point, point + 1.0],
            generation_timestamp: horizon_start(date()),
            is_fallback: false,
            fallback_reason: None,
        }
    }

    fn full_batch() -> ForecastBatch {
        let mut records = Vec::new();
        for h in 1..=4 {
            records.push(record(Product::Dalmp, h, 40.0));
            records.push(record(Product::RegUp, h, 10.0));
        }
        ForecastBatch::new(date(), records)
    }

    fn key(product: Product, h: u8) -> ModelKey {
        ModelKey::new(product, HourEnding::new(h).unwrap())
    }

    #[test]
    fn clean_batch_passes_every_stage() {
        let v = ForecastValidator::new(ctx());
        let results = v.validate_all(&full_batch());
        assert_eq!(results.len(), 4);
        assert!(results.iter().all(|r| r.passed), "{results:?}");
        assert!(results.iter().all(|r| stage_error(r).is_none()));
    }

    #[test]
    fn completeness_reports_missing_and_duplicate_keys() {
        let mut batch = full_batch();
        let gone = key(Product::RegUp, 2);
        batch.records.retain(|r| r.key(date()) != Some(gone));
        batch.records.push(record(Product::Dalmp, 3, 41.0));

        let result = ForecastValidator::new(ctx()).check_completeness(&batch);
        assert!(!result.passed);
        assert_eq!(result.keys, vec![key(Product::Dalmp, 3), key(Product::RegUp, 2)]);
    }

    #[test]
    fn plausibility_flags_band_and_outlier_breaches() {
        let mut batch = full_batch();
        batch.records[0].point_forecast = 350.0; // DALMP h1: > 3x historical max
        batch.records[4].samples[0] = -5.0; // REGUP h1: below 0

        let result = ForecastValidator::new(ctx()).check_plausibility(&batch);
        assert_eq!(result.keys, vec![key(Product::Dalmp, 1), key(Product::RegUp, 1)]);
        assert_eq!(result.details.len(), 2);
    }

    #[test]
    fn consistency_reports_lower_product_key() {
        let mut batch = full_batch();
        let idx = batch
            .records
            .iter()
            .position(|r| r.product == Product::RegUp && r.key(date()) == Some(key(Product::RegUp, 4)))
            .unwrap();
        batch.records[idx].point_forecast = 55.0;

        let v = ForecastValidator::new(ctx());
        let result = v.check_consistency(&batch);
        assert_eq!(result.keys, vec![key(Product::RegUp, 4)]);
        // Never corrected.
        assert_eq!(batch.records[idx].point_forecast, 55.0);
    }

    #[test]
    fn schema_flags_wrong_sample_count() {
        let mut batch = full_batch();
        batch.records[2].samples.pop();
        let err = stage_error(&ForecastValidator::new(ctx()).check_schema(&batch)).unwrap();
        assert_eq!(err.stage, ValidationStage::Schema);
        assert_eq!(err.keys, vec![key(Product::Dalmp, 3)]);
    }

    #[test]
    fn validation_is_idempotent() {
        let mut batch = full_batch();
        batch.records[5].point_forecast = 9_999.0;
        let v = ForecastValidator::new(ctx());
        assert_eq!(v.validate_all(&batch), v.validate_all(&batch));
    }
}
