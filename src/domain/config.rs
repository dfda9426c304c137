//! Pipeline configuration.
//!
//! Values come from (lowest to highest precedence):
//!
//! - built-in defaults (`PipelineConfig::default`)
//! - environment variables, optionally via a `.env` file (`from_env`)
//! - CLI flags (applied by `app::run`)
//!
//! Per-product bands and cross-product rules can be supplied as a JSON file
//! (`PRICECAST_PRODUCT_SETTINGS`) so they are not hard-coded.

use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::domain::{
    ConsistencyRule, DEFAULT_SAMPLE_COUNT, MAX_HORIZON, Product, ProductSettings,
};
use crate::error::AppError;

/// A full run's configuration as understood by the pipeline.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub store_dir: PathBuf,
    pub models_path: PathBuf,
    pub input_path: PathBuf,

    pub products: Vec<Product>,
    pub horizon_hours: u8,
    pub sample_count: usize,

    /// Worker threads for per-key execution (0 = rayon default).
    pub workers: usize,
    /// Wall-clock budget for a run, measured from its trigger.
    pub deadline: Duration,
    /// Base seed mixed into every per-key sample seed.
    pub seed: u64,

    /// Generation series used as features (`gen_<fuel>` columns).
    pub fuels: Vec<String>,

    /// Outlier guard: values beyond `outlier_multiple × rolling max` fail plausibility.
    pub outlier_multiple: f64,
    /// Window for the rolling historical maximum, in hours.
    pub history_window_hours: u32,

    pub product_settings: BTreeMap<Product, ProductSettings>,
    pub consistency_rules: Vec<ConsistencyRule>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            store_dir: PathBuf::from("forecast-store"),
            models_path: PathBuf::from("models.json"),
            input_path: PathBuf::from("input.csv"),
            products: vec![Product::Dalmp, Product::Rtlmp, Product::RegUp],
            horizon_hours: MAX_HORIZON,
            sample_count: DEFAULT_SAMPLE_COUNT,
            workers: 0,
            deadline: Duration::from_secs(30 * 60),
            seed: 42,
            fuels: vec!["wind".to_string(), "solar".to_string(), "thermal".to_string()],
            outlier_multiple: 3.0,
            history_window_hours: 30 * 24,
            product_settings: Product::ALL
                .into_iter()
                .map(|p| (p, ProductSettings::default_for(p)))
                .collect(),
            consistency_rules: vec![ConsistencyRule {
                lower: Product::RegUp,
                upper: Product::Dalmp,
            }],
        }
    }
}

/// On-disk shape of `PRICECAST_PRODUCT_SETTINGS`.
#[derive(Debug, Deserialize)]
struct ProductSettingsFile {
    #[serde(default)]
    products: BTreeMap<Product, ProductSettings>,
    #[serde(default)]
    consistency_rules: Option<Vec<ConsistencyRule>>,
}

impl PipelineConfig {
    /// Load configuration from the process environment (and `.env`, if present).
    pub fn from_env() -> Result<Self, AppError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build a config from an arbitrary variable lookup (used by tests).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, AppError> {
        let mut config = Self::default();

        if let Some(v) = lookup("PRICECAST_STORE_DIR") {
            config.store_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("PRICECAST_MODELS") {
            config.models_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("PRICECAST_INPUT") {
            config.input_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("PRICECAST_PRODUCTS") {
            config.products = parse_products(&v)?;
        }
        if let Some(v) = lookup("PRICECAST_HORIZON_HOURS") {
            config.horizon_hours = parse_var("PRICECAST_HORIZON_HOURS", &v)?;
        }
        if let Some(v) = lookup("PRICECAST_SAMPLES") {
            config.sample_count = parse_var("PRICECAST_SAMPLES", &v)?;
        }
        if let Some(v) = lookup("PRICECAST_WORKERS") {
            config.workers = parse_var("PRICECAST_WORKERS", &v)?;
        }
        if let Some(v) = lookup("PRICECAST_DEADLINE_SECS") {
            config.deadline = Duration::from_secs(parse_var("PRICECAST_DEADLINE_SECS", &v)?);
        }
        if let Some(v) = lookup("PRICECAST_SEED") {
            config.seed = parse_var("PRICECAST_SEED", &v)?;
        }
        if let Some(v) = lookup("PRICECAST_FUELS") {
            config.fuels = v
                .split(',')
                .map(|s| s.trim().to_ascii_lowercase())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Some(v) = lookup("PRICECAST_OUTLIER_MULTIPLE") {
            config.outlier_multiple = parse_var("PRICECAST_OUTLIER_MULTIPLE", &v)?;
        }
        if let Some(v) = lookup("PRICECAST_HISTORY_WINDOW_HOURS") {
            config.history_window_hours = parse_var("PRICECAST_HISTORY_WINDOW_HOURS", &v)?;
        }
        if let Some(v) = lookup("PRICECAST_PRODUCT_SETTINGS") {
            config.apply_settings_file(Path::new(&v))?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Merge a product settings JSON file over the current settings.
    pub fn apply_settings_file(&mut self, path: &Path) -> Result<(), AppError> {
        let file = File::open(path).map_err(|e| {
            AppError::new(2, format!("Failed to open product settings '{}': {e}", path.display()))
        })?;
        let parsed: ProductSettingsFile = serde_json::from_reader(file)
            .map_err(|e| AppError::new(2, format!("Invalid product settings JSON: {e}")))?;

        self.product_settings.extend(parsed.products);
        if let Some(rules) = parsed.consistency_rules {
            self.consistency_rules = rules;
        }
        Ok(())
    }

    pub fn settings(&self, product: Product) -> ProductSettings {
        self.product_settings
            .get(&product)
            .copied()
            .unwrap_or_else(|| ProductSettings::default_for(product))
    }

    /// Reject configurations that would make every run fail.
    pub fn validate(&self) -> Result<(), AppError> {
        if self.products.is_empty() {
            return Err(AppError::new(2, "At least one product must be configured."));
        }
        if self.horizon_hours == 0 || self.horizon_hours > MAX_HORIZON {
            return Err(AppError::new(
                2,
                format!("Horizon must be within 1..={MAX_HORIZON} hours."),
            ));
        }
        if self.sample_count == 0 {
            return Err(AppError::new(2, "Sample count must be > 0."));
        }
        if !(self.outlier_multiple.is_finite() && self.outlier_multiple > 0.0) {
            return Err(AppError::new(2, "Outlier multiple must be finite and > 0."));
        }
        for (product, s) in &self.product_settings {
            if !(s.min.is_finite() && s.max.is_finite() && s.min < s.max) {
                return Err(AppError::new(
                    2,
                    format!("Invalid plausibility band for {product}: [{}, {}].", s.min, s.max),
                ));
            }
        }
        Ok(())
    }
}

fn parse_products(value: &str) -> Result<Vec<Product>, AppError> {
    let mut products = value
        .split(',')
        .filter(|s| !s.trim().is_empty())
        .map(Product::from_str)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| AppError::new(2, format!("PRICECAST_PRODUCTS: {e}")))?;
    products.sort();
    products.dedup();
    Ok(products)
}

fn parse_var<T: FromStr>(name: &str, value: &str) -> Result<T, AppError>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse::<T>()
        .map_err(|e| AppError::new(2, format!("Invalid {name}='{value}': {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_values_override_defaults() {
        let config = PipelineConfig::from_lookup(|name| match name {
            "PRICECAST_PRODUCTS" => Some("rtlmp, DALMP,RTLMP".to_string()),
            "PRICECAST_SAMPLES" => Some("50".to_string()),
            "PRICECAST_DEADLINE_SECS" => Some("5".to_string()),
            _ => None,
        })
        .unwrap();

        assert_eq!(config.products, vec![Product::Dalmp, Product::Rtlmp]);
        assert_eq!(config.sample_count, 50);
        assert_eq!(config.deadline, Duration::from_secs(5));
        assert_eq!(config.horizon_hours, 72);
    }

    #[test]
    fn invalid_values_are_usage_errors() {
        let err = PipelineConfig::from_lookup(|name| {
            (name == "PRICECAST_HORIZON_HOURS").then(|| "96".to_string())
        })
        .unwrap_err();
        assert_eq!(err.exit_code(), 2);

        let err = PipelineConfig::from_lookup(|name| {
            (name == "PRICECAST_SAMPLES").then(|| "many".to_string())
        })
        .unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn ancillary_products_are_clipped_by_default() {
        let config = PipelineConfig::default();
        assert!(!config.settings(Product::RegUp).allow_negative);
        assert!(config.settings(Product::Rtlmp).allow_negative);
    }
}
