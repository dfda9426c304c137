//! Shared domain types.
//!
//! These types are intentionally kept small and serializable so they can be:
//!
//! - passed between pipeline stages (and worker threads) by value
//! - written into run diagnostics as JSON
//! - reloaded from the forecast store bit-for-bit

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

/// Longest horizon any model can be registered for.
pub const MAX_HORIZON: u8 = 72;

/// Default number of probabilistic samples per record.
pub const DEFAULT_SAMPLE_COUNT: usize = 100;

/// Forecast target products.
///
/// `DALMP`/`RTLMP` are energy prices; the rest are ancillary service prices.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ValueEnum,
)]
pub enum Product {
    #[serde(rename = "DALMP")]
    #[value(name = "DALMP")]
    Dalmp,
    #[serde(rename = "RTLMP")]
    #[value(name = "RTLMP")]
    Rtlmp,
    #[serde(rename = "REGUP")]
    #[value(name = "REGUP")]
    RegUp,
    #[serde(rename = "REGDN")]
    #[value(name = "REGDN")]
    RegDown,
    #[serde(rename = "RRS")]
    #[value(name = "RRS")]
    Rrs,
    #[serde(rename = "NSPIN")]
    #[value(name = "NSPIN")]
    NonSpin,
}

impl Product {
    pub const ALL: [Product; 6] = [
        Product::Dalmp,
        Product::Rtlmp,
        Product::RegUp,
        Product::RegDown,
        Product::Rrs,
        Product::NonSpin,
    ];

    /// Code used in file names, CSV rows and the index.
    pub fn code(self) -> &'static str {
        match self {
            Product::Dalmp => "DALMP",
            Product::Rtlmp => "RTLMP",
            Product::RegUp => "REGUP",
            Product::RegDown => "REGDN",
            Product::Rrs => "RRS",
            Product::NonSpin => "NSPIN",
        }
    }

    /// Name of this product's historical price column in the input dataset.
    pub fn price_series(self) -> String {
        format!("price_{}", self.code().to_ascii_lowercase())
    }

    pub fn is_ancillary(self) -> bool {
        !matches!(self, Product::Dalmp | Product::Rtlmp)
    }
}

impl fmt::Display for Product {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for Product {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        Product::ALL
            .into_iter()
            .find(|p| p.code().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("Unknown product code '{s}'."))
    }
}

/// Hour ending within the forecast horizon (`1..=MAX_HORIZON`).
///
/// Hour ending `h` covers the hour that ends at `target_date 00:00Z + h hours`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct HourEnding(u8);

impl HourEnding {
    pub fn new(hour: u8) -> Option<Self> {
        (1..=MAX_HORIZON).contains(&hour).then_some(Self(hour))
    }

    pub fn get(self) -> u8 {
        self.0
    }

    /// All hours `1..=horizon` (clamped to the maximum horizon).
    pub fn range(horizon: u8) -> impl Iterator<Item = HourEnding> {
        (1..=horizon.min(MAX_HORIZON)).map(HourEnding)
    }
}

impl TryFrom<u8> for HourEnding {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        HourEnding::new(value)
            .ok_or_else(|| format!("hour_ending {value} outside 1..={MAX_HORIZON}"))
    }
}

impl From<HourEnding> for u8 {
    fn from(value: HourEnding) -> Self {
        value.0
    }
}

/// Lookup key into the model registry: one linear model per product and hour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ModelKey {
    pub product: Product,
    pub hour_ending: HourEnding,
}

impl ModelKey {
    pub fn new(product: Product, hour_ending: HourEnding) -> Self {
        Self {
            product,
            hour_ending,
        }
    }

    /// Every key of the horizon for the given products, ordered by (product, hour).
    pub fn horizon(products: &[Product], horizon: u8) -> Vec<ModelKey> {
        let mut products = products.to_vec();
        products.sort();
        products.dedup();
        products
            .into_iter()
            .flat_map(|p| HourEnding::range(horizon).map(move |h| ModelKey::new(p, h)))
            .collect()
    }

    /// UTC timestamp of this key's target hour for a run on `target_date`.
    pub fn target_timestamp(self, target_date: NaiveDate) -> DateTime<Utc> {
        horizon_start(target_date) + Duration::hours(i64::from(self.hour_ending.get()))
    }
}

impl fmt::Display for ModelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/h{}", self.product, self.hour_ending.get())
    }
}

/// `target_date 00:00Z`: the horizon's origin and the feature as-of time.
pub fn horizon_start(target_date: NaiveDate) -> DateTime<Utc> {
    target_date.and_time(NaiveTime::MIN).and_utc()
}

/// Linear model for one key. Coefficients are supplied, never learned here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSpec {
    pub product: Product,
    pub hour_ending: HourEnding,
    pub intercept: f64,
    pub coefficients: BTreeMap<String, f64>,
    /// Residual standard deviation from training; the sample spread.
    pub residual_std: f64,
}

impl ModelSpec {
    pub fn key(&self) -> ModelKey {
        ModelKey::new(self.product, self.hour_ending)
    }
}

/// Named feature values for one key and target hour.
///
/// Built once per run; fields are private so stages can only read it.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureVector {
    key: ModelKey,
    target_timestamp: DateTime<Utc>,
    values: BTreeMap<String, f64>,
}

impl FeatureVector {
    pub fn new(key: ModelKey, target_timestamp: DateTime<Utc>, values: BTreeMap<String, f64>) -> Self {
        Self {
            key,
            target_timestamp,
            values,
        }
    }

    pub fn key(&self) -> ModelKey {
        self.key
    }

    pub fn target_timestamp(&self) -> DateTime<Utc> {
        self.target_timestamp
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.values.get(name).copied()
    }

    pub fn values(&self) -> &BTreeMap<String, f64> {
        &self.values
    }
}

/// One forecast row: a product's point forecast and samples for one hour.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastRecord {
    pub timestamp: DateTime<Utc>,
    pub product: Product,
    pub point_forecast: f64,
    pub samples: Vec<f64>,
    pub generation_timestamp: DateTime<Utc>,
    pub is_fallback: bool,
    pub fallback_reason: Option<String>,
}

impl ForecastRecord {
    /// Hour ending of this record relative to `target_date`, if it is inside
    /// the horizon and on a whole hour.
    pub fn hour_ending(&self, target_date: NaiveDate) -> Option<HourEnding> {
        let offset = self.timestamp - horizon_start(target_date);
        if offset != Duration::hours(offset.num_hours()) {
            return None;
        }
        u8::try_from(offset.num_hours()).ok().and_then(HourEnding::new)
    }

    pub fn key(&self, target_date: NaiveDate) -> Option<ModelKey> {
        self.hour_ending(target_date)
            .map(|h| ModelKey::new(self.product, h))
    }
}

/// All records produced by one generation run (or loaded for one product).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastBatch {
    pub target_date: NaiveDate,
    pub records: Vec<ForecastRecord>,
    pub fallbacks: Vec<FallbackRecord>,
}

impl ForecastBatch {
    pub fn new(target_date: NaiveDate, mut records: Vec<ForecastRecord>) -> Self {
        sort_records(&mut records);
        Self {
            target_date,
            records,
            fallbacks: Vec::new(),
        }
    }

    /// Products present in the batch, sorted.
    pub fn products(&self) -> Vec<Product> {
        let mut out: Vec<Product> = self.records.iter().map(|r| r.product).collect();
        out.sort();
        out.dedup();
        out
    }

    /// The slice of this batch the store persists as one file.
    pub fn for_product(&self, product: Product) -> ForecastBatch {
        ForecastBatch {
            target_date: self.target_date,
            records: self
                .records
                .iter()
                .filter(|r| r.product == product)
                .cloned()
                .collect(),
            fallbacks: self
                .fallbacks
                .iter()
                .filter(|f| f.product == product)
                .cloned()
                .collect(),
        }
    }

    /// Replace (or insert) records by key and append fallback metadata.
    pub fn merge(&mut self, other: ForecastBatch) {
        let target_date = self.target_date;
        for incoming in other.records {
            let key = incoming.key(target_date);
            self.records
                .retain(|r| r.product != incoming.product || r.key(target_date) != key);
            self.records.push(incoming);
        }
        sort_records(&mut self.records);
        self.fallbacks.extend(other.fallbacks);
    }

    pub fn fallback_count(&self) -> usize {
        self.records.iter().filter(|r| r.is_fallback).count()
    }

    pub fn is_all_fallback(&self) -> bool {
        !self.records.is_empty() && self.records.iter().all(|r| r.is_fallback)
    }
}

fn sort_records(records: &mut [ForecastRecord]) {
    records.sort_by(|a, b| a.product.cmp(&b.product).then(a.timestamp.cmp(&b.timestamp)));
}

/// Validation stages, in the order they run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationStage {
    Completeness,
    Plausibility,
    Consistency,
    Schema,
}

impl ValidationStage {
    pub const ALL: [ValidationStage; 4] = [
        ValidationStage::Completeness,
        ValidationStage::Plausibility,
        ValidationStage::Consistency,
        ValidationStage::Schema,
    ];

    /// Whether a failure can be routed to fallback for the reported keys only.
    pub fn is_key_scoped(self) -> bool {
        matches!(self, ValidationStage::Plausibility | ValidationStage::Consistency)
    }
}

impl fmt::Display for ValidationStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValidationStage::Completeness => "completeness",
            ValidationStage::Plausibility => "plausibility",
            ValidationStage::Consistency => "consistency",
            ValidationStage::Schema => "schema",
        };
        f.write_str(name)
    }
}

/// Outcome of one validation stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub stage: ValidationStage,
    pub passed: bool,
    pub details: Vec<String>,
    /// Offending keys, sorted and de-duplicated.
    pub keys: Vec<ModelKey>,
}

impl ValidationResult {
    pub fn new(stage: ValidationStage, details: Vec<String>, mut keys: Vec<ModelKey>) -> Self {
        keys.sort();
        keys.dedup();
        Self {
            stage,
            passed: details.is_empty(),
            details,
            keys,
        }
    }
}

/// Failure classes that can trigger a fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    DataUnavailable,
    ModelExecution,
    Validation,
    Storage,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureKind::DataUnavailable => "data unavailable",
            FailureKind::ModelExecution => "model execution",
            FailureKind::Validation => "validation",
            FailureKind::Storage => "storage",
        };
        f.write_str(name)
    }
}

/// What went wrong, as handed to the fallback coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureDescription {
    pub kind: FailureKind,
    pub message: String,
}

impl FailureDescription {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Fallback state machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackState {
    Idle,
    FailureIdentified,
    SourceSelected,
    Retrieved,
    TimestampAdjusted,
    Marked,
    Done,
    Escalated,
}

impl FallbackState {
    /// Allowed transitions; `Escalated` is only reachable from `SourceSelected`.
    pub fn can_advance_to(self, next: FallbackState) -> bool {
        use FallbackState::*;
        matches!(
            (self, next),
            (Idle, FailureIdentified)
                | (FailureIdentified, SourceSelected)
                | (SourceSelected, Retrieved)
                | (SourceSelected, Escalated)
                | (Retrieved, TimestampAdjusted)
                | (TimestampAdjusted, Marked)
                | (Marked, Done)
        )
    }
}

/// Metadata describing one reuse of a prior batch for one product.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FallbackRecord {
    pub product: Product,
    /// Keys substituted by this activation.
    pub keys: Vec<ModelKey>,
    pub failure: FailureKind,
    pub reason: String,
    pub source_date: NaiveDate,
    pub source_was_fallback: bool,
    pub shift_days: i64,
    /// Hours filled by repeating another day's pattern from the source.
    pub extended_hours: Vec<u8>,
    pub states: Vec<FallbackState>,
}

/// Final status of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Generated,
    Fallback,
    Failed,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunStatus::Generated => "generated",
            RunStatus::Fallback => "fallback",
            RunStatus::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Per-product rules for plausibility checks and clipping.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProductSettings {
    /// When false, point forecasts and samples are clipped at zero.
    pub allow_negative: bool,
    pub min: f64,
    pub max: f64,
}

impl ProductSettings {
    pub fn default_for(product: Product) -> Self {
        if product.is_ancillary() {
            Self {
                allow_negative: false,
                min: 0.0,
                max: 5000.0,
            }
        } else {
            Self {
                allow_negative: true,
                min: -250.0,
                max: 5000.0,
            }
        }
    }
}

/// Cross-product ordering rule: `lower`'s point forecast must not exceed
/// `upper`'s for the same hour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsistencyRule {
    pub lower: Product,
    pub upper: Product,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hour_ending_bounds() {
        assert!(HourEnding::new(0).is_none());
        assert!(HourEnding::new(1).is_some());
        assert!(HourEnding::new(72).is_some());
        assert!(HourEnding::new(73).is_none());
        assert!(serde_json::from_str::<HourEnding>("73").is_err());
    }

    #[test]
    fn horizon_keys_are_ordered_and_deduplicated() {
        let keys = ModelKey::horizon(&[Product::Rtlmp, Product::Dalmp, Product::Rtlmp], 72);
        assert_eq!(keys.len(), 144);
        assert_eq!(keys[0].to_string(), "DALMP/h1");
        assert_eq!(keys[143].to_string(), "RTLMP/h72");
    }

    #[test]
    fn record_hour_ending_roundtrips_through_timestamp() {
        let date = NaiveDate::from_ymd_opt(2026, 3, 1).unwrap();
        let key = ModelKey::new(Product::Dalmp, HourEnding::new(30).unwrap());
        let record = ForecastRecord {
            timestamp: key.target_timestamp(date),
            product: Product::Dalmp,
            point_forecast: 1.0,
            samples: vec![],
            generation_timestamp: horizon_start(date),
            is_fallback: false,
            fallback_reason: None,
        };
        assert_eq!(record.key(date), Some(key));
        let next_day = date.succ_opt().unwrap();
        assert_eq!(record.hour_ending(next_day).map(HourEnding::get), Some(6));
    }

    #[test]
    fn product_codes_parse_case_insensitively() {
        assert_eq!("regdn".parse::<Product>().unwrap(), Product::RegDown);
        assert!("XYZ".parse::<Product>().is_err());
        assert_eq!(serde_json::to_string(&Product::NonSpin).unwrap(), "\"NSPIN\"");
    }

    #[test]
    fn escalation_only_from_source_selection() {
        assert!(FallbackState::SourceSelected.can_advance_to(FallbackState::Escalated));
        assert!(!FallbackState::Retrieved.can_advance_to(FallbackState::Escalated));
        assert!(!FallbackState::Idle.can_advance_to(FallbackState::Done));
    }
}
