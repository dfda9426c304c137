//! Persisted forecast row schema.
//!
//! One CSV row per product per horizon hour:
//!
//! ```text
//! timestamp, product, point_forecast, sample_000 .. sample_{N-1},
//! generation_timestamp, is_fallback, fallback_reason
//! ```
//!
//! Floats are written with Rust's shortest round-trip formatting and
//! timestamps as RFC 3339 with full sub-second precision, so a stored batch
//! reads back bit-for-bit. The same flatten/parse pair backs both the
//! validator's schema stage and the store's pre-write guard.

use chrono::{DateTime, Duration, SecondsFormat, Utc};

use crate::domain::{ForecastBatch, ForecastRecord, ModelKey, Product};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForecastSchema {
    pub sample_count: usize,
}

impl ForecastSchema {
    pub fn new(sample_count: usize) -> Self {
        Self { sample_count }
    }

    pub fn columns(&self) -> Vec<String> {
        let mut cols = Vec::with_capacity(self.sample_count + 6);
        cols.push("timestamp".to_string());
        cols.push("product".to_string());
        cols.push("point_forecast".to_string());
        cols.extend((0..self.sample_count).map(sample_column));
        cols.push("generation_timestamp".to_string());
        cols.push("is_fallback".to_string());
        cols.push("fallback_reason".to_string());
        cols
    }

    /// Flatten a record to its persisted row.
    pub fn to_row(&self, record: &ForecastRecord) -> Vec<String> {
        let mut row = Vec::with_capacity(record.samples.len() + 6);
        row.push(format_timestamp(record.timestamp));
        row.push(record.product.code().to_string());
        row.push(record.point_forecast.to_string());
        row.extend(record.samples.iter().map(f64::to_string));
        row.push(format_timestamp(record.generation_timestamp));
        row.push(record.is_fallback.to_string());
        row.push(record.fallback_reason.clone().unwrap_or_default());
        row
    }

    /// Schema matching a persisted header, whatever sample count it was written with.
    pub fn from_header<'a>(header: impl IntoIterator<Item = &'a str>) -> Result<Self, String> {
        let columns: Vec<&str> = header.into_iter().collect();
        let samples = columns.iter().filter(|c| c.starts_with("sample_")).count();
        let schema = Self::new(samples);
        schema.check_header(columns)?;
        Ok(schema)
    }

    /// Check a header row against the fixed column set.
    pub fn check_header<'a>(&self, header: impl IntoIterator<Item = &'a str>) -> Result<(), String> {
        let expected = self.columns();
        let actual: Vec<&str> = header.into_iter().collect();
        if actual.len() != expected.len() {
            return Err(format!(
                "expected {} columns, found {}",
                expected.len(),
                actual.len()
            ));
        }
        for (idx, (a, e)) in actual.iter().zip(&expected).enumerate() {
            if a != e {
                return Err(format!("column {idx}: expected `{e}`, found `{a}`"));
            }
        }
        Ok(())
    }

    /// Parse a persisted row, collecting every field-level error.
    pub fn parse_row<'a>(&self, row: &[&'a str]) -> Result<ForecastRecord, Vec<String>> {
        let width = self.sample_count + 6;
        if row.len() != width {
            return Err(vec![format!("expected {width} fields, found {}", row.len())]);
        }

        let mut errors = Vec::new();
        let timestamp = parse_field(row[0], "timestamp", parse_timestamp, &mut errors);
        let product = parse_field(row[1], "product", |s| s.parse::<Product>(), &mut errors);
        let point = parse_field(row[2], "point_forecast", parse_finite, &mut errors);

        let mut samples = Vec::with_capacity(self.sample_count);
        for (i, raw) in row[3..3 + self.sample_count].iter().enumerate() {
            if let Some(v) = parse_field(raw, &sample_column(i), parse_finite, &mut errors) {
                samples.push(v);
            }
        }

        let base = 3 + self.sample_count;
        let generation = parse_field(row[base], "generation_timestamp", parse_timestamp, &mut errors);
        let is_fallback = parse_field(
            row[base + 1],
            "is_fallback",
            |s| s.parse::<bool>().map_err(|e| e.to_string()),
            &mut errors,
        );
        let reason = row[base + 2];

        match (timestamp, product, point, generation, is_fallback) {
            (Some(timestamp), Some(product), Some(point_forecast), Some(generation_timestamp), Some(is_fallback))
                if errors.is_empty() =>
            {
                Ok(ForecastRecord {
                    timestamp,
                    product,
                    point_forecast,
                    samples,
                    generation_timestamp,
                    is_fallback,
                    fallback_reason: (!reason.is_empty()).then(|| reason.to_string()),
                })
            }
            _ => Err(errors),
        }
    }

    /// Flatten every record and check it against the persisted shape.
    ///
    /// Returns violation details and the keys they concern. Checks:
    /// - every row parses back with the expected column count and types
    /// - every product is one of `allowed`
    /// - per product, timestamps step by exactly one hour with no gaps
    pub fn violations(&self, batch: &ForecastBatch, allowed: &[Product]) -> (Vec<String>, Vec<ModelKey>) {
        let mut details = Vec::new();
        let mut keys = Vec::new();

        for record in &batch.records {
            let label = record_label(record, batch);
            if record.samples.len() != self.sample_count {
                details.push(format!(
                    "{label}: {} samples, expected {}",
                    record.samples.len(),
                    self.sample_count
                ));
                keys.extend(record.key(batch.target_date));
                continue;
            }
            let row = self.to_row(record);
            let fields: Vec<&str> = row.iter().map(String::as_str).collect();
            if let Err(errors) = self.parse_row(&fields) {
                details.extend(errors.into_iter().map(|e| format!("{label}: {e}")));
                keys.extend(record.key(batch.target_date));
            }
            if !allowed.contains(&record.product) {
                details.push(format!("{label}: product not configured"));
            }
        }

        for product in batch.products() {
            let mut prev: Option<DateTime<Utc>> = None;
            for record in batch.records.iter().filter(|r| r.product == product) {
                if let Some(p) = prev {
                    if record.timestamp != p + Duration::hours(1) {
                        details.push(format!(
                            "{product}: timestamp {} does not follow {} by one hour",
                            format_timestamp(record.timestamp),
                            format_timestamp(p)
                        ));
                        keys.extend(record.key(batch.target_date));
                    }
                }
                prev = Some(record.timestamp);
            }
        }

        keys.sort();
        keys.dedup();
        (details, keys)
    }
}

fn record_label(record: &ForecastRecord, batch: &ForecastBatch) -> String {
    match record.key(batch.target_date) {
        Some(key) => key.to_string(),
        None => format!("{}@{}", record.product, format_timestamp(record.timestamp)),
    }
}

fn sample_column(i: usize) -> String {
    format!("sample_{i:03}")
}

pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| e.to_string())
}

fn parse_finite(s: &str) -> Result<f64, String> {
    let v = s.parse::<f64>().map_err(|e| e.to_string())?;
    if v.is_finite() { Ok(v) } else { Err("not finite".to_string()) }
}

fn parse_field<T>(
    raw: &str,
    name: &str,
    parse: impl Fn(&str) -> Result<T, String>,
    errors: &mut Vec<String>,
) -> Option<T> {
    if raw.is_empty() {
        errors.push(format!("`{name}` is null"));
        return None;
    }
    match parse(raw) {
        Ok(v) => Some(v),
        Err(e) => {
            errors.push(format!("`{name}` = '{raw}': {e}"));
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::horizon_start;
    use chrono::NaiveDate;

    fn record(h: i64, samples: Vec<f64>) -> ForecastRecord {
        let date = NaiveDate::from_ymd_opt(2026, 1, 10).unwrap();
        ForecastRecord {
            timestamp: horizon_start(date) + Duration::hours(h),
            product: Product::Rtlmp,
            point_forecast: -12.125,
            samples,
            generation_timestamp: DateTime::parse_from_rfc3339("2026-01-09T06:00:00.123456789Z")
                .unwrap()
                .with_timezone(&Utc),
            is_fallback: true,
            fallback_reason: Some("model execution: boom".to_string()),
        }
    }

    #[test]
    fn columns_follow_fixed_layout() {
        let cols = ForecastSchema::new(3).columns();
        assert_eq!(
            cols,
            vec![
                "timestamp", "product", "point_forecast", "sample_000", "sample_001", "sample_002",
                "generation_timestamp", "is_fallback", "fallback_reason"
            ]
        );
    }

    #[test]
    fn header_determines_sample_count() {
        let cols = ForecastSchema::new(4).columns();
        let schema = ForecastSchema::from_header(cols.iter().map(String::as_str)).unwrap();
        assert_eq!(schema.sample_count, 4);

        let mut shuffled = cols.clone();
        shuffled.swap(3, 4);
        assert!(ForecastSchema::from_header(shuffled.iter().map(String::as_str)).is_err());
    }

    #[test]
    fn row_parses_back_exactly() {
        let schema = ForecastSchema::new(2);
        let rec = record(1, vec![0.1 + 0.2, 1.0 / 3.0]);
        let row = schema.to_row(&rec);
        let fields: Vec<&str> = row.iter().map(String::as_str).collect();
        assert_eq!(schema.parse_row(&fields).unwrap(), rec);
    }

    #[test]
    fn field_errors_are_collected() {
        let schema = ForecastSchema::new(1);
        let errs = schema
            .parse_row(&["not-a-time", "DALMP", "NaN", "1.0", "", "maybe", ""])
            .unwrap_err();
        assert_eq!(errs.len(), 4);
        assert!(errs.iter().any(|e| e.contains("generation_timestamp")));
    }

    #[test]
    fn gaps_and_short_samples_are_violations() {
        let schema = ForecastSchema::new(2);
        let date = NaiveDate::from_ymd_opt(2026, 1, 10).unwrap();
        let batch = ForecastBatch::new(
            date,
            vec![record(1, vec![1.0, 2.0]), record(3, vec![1.0, 2.0]), record(4, vec![1.0])],
        );
        let (details, keys) = schema.violations(&batch, &[Product::Rtlmp]);
        assert_eq!(details.len(), 2);
        assert_eq!(keys.len(), 2);
    }
}
