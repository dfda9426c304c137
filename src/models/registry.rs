//! Model registry: one linear model per (product, hour ending).
//!
//! The registry is built once per run from the model file and never mutated
//! afterwards, so workers share it through an `Arc` without locking. Bad
//! entries are rejected while loading rather than discovered during lookup:
//!
//! - unknown product codes and hours outside `1..=72` (typed deserialization)
//! - duplicate keys
//! - non-finite coefficients / intercept, negative or non-finite `residual_std`
//! - coefficient names the feature builder can never produce

use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use serde::Deserialize;

use crate::domain::{ModelKey, ModelSpec};
use crate::error::{NotFoundError, RegistryError};
use crate::features::is_known_feature;

/// On-disk shape of the model file.
#[derive(Debug, Deserialize)]
struct ModelFile {
    models: Vec<ModelSpec>,
}

#[derive(Debug, Clone, Default)]
pub struct ModelRegistry {
    models: BTreeMap<ModelKey, ModelSpec>,
}

impl ModelRegistry {
    /// Load a model file (`{"models": [...]}`).
    pub fn load(path: &Path) -> Result<Self, RegistryError> {
        let file = File::open(path).map_err(|e| RegistryError::Read {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        Self::from_reader(file)
    }

    pub fn from_reader(reader: impl Read) -> Result<Self, RegistryError> {
        let parsed: ModelFile = serde_json::from_reader(reader)
            .map_err(|e| RegistryError::Invalid(format!("invalid model JSON: {e}")))?;
        Self::from_specs(parsed.models)
    }

    pub fn from_specs(specs: impl IntoIterator<Item = ModelSpec>) -> Result<Self, RegistryError> {
        let mut models = BTreeMap::new();
        for spec in specs {
            check_spec(&spec)?;
            let key = spec.key();
            if models.insert(key, spec).is_some() {
                return Err(RegistryError::DuplicateKey(key));
            }
        }
        Ok(Self { models })
    }

    pub fn lookup(&self, key: ModelKey) -> Result<&ModelSpec, NotFoundError> {
        self.models.get(&key).ok_or(NotFoundError::Model(key))
    }

    /// Expected keys with no registered model.
    pub fn missing_keys(&self, expected: &[ModelKey]) -> Vec<ModelKey> {
        expected
            .iter()
            .filter(|k| !self.models.contains_key(k))
            .copied()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}

fn check_spec(spec: &ModelSpec) -> Result<(), RegistryError> {
    let key = spec.key();
    if !spec.intercept.is_finite() {
        return Err(RegistryError::InvalidSpec {
            key,
            message: "non-finite intercept".to_string(),
        });
    }
    if !(spec.residual_std.is_finite() && spec.residual_std >= 0.0) {
        return Err(RegistryError::InvalidSpec {
            key,
            message: format!("residual_std must be finite and >= 0, got {}", spec.residual_std),
        });
    }
    for (name, beta) in &spec.coefficients {
        if !is_known_feature(name) {
            return Err(RegistryError::InvalidSpec {
                key,
                message: format!("unknown feature `{name}`"),
            });
        }
        if !beta.is_finite() {
            return Err(RegistryError::InvalidSpec {
                key,
                message: format!("non-finite coefficient for `{name}`"),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{HourEnding, Product};

    const ONE_MODEL: &str = r#"{"models": [
        {"product": "DALMP", "hour_ending": 12, "intercept": 5.0,
         "coefficients": {"price_lag_short": 0.8, "load": 0.0001},
         "residual_std": 4.5}
    ]}"#;

    #[test]
    fn loads_and_looks_up_by_typed_key() {
        let registry = ModelRegistry::from_reader(ONE_MODEL.as_bytes()).unwrap();
        let key = ModelKey::new(Product::Dalmp, HourEnding::new(12).unwrap());
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.lookup(key).unwrap().residual_std, 4.5);

        let other = ModelKey::new(Product::Dalmp, HourEnding::new(13).unwrap());
        assert_eq!(registry.lookup(other), Err(NotFoundError::Model(other)));
        assert_eq!(registry.missing_keys(&[key, other]), vec![other]);
    }

    #[test]
    fn rejects_bad_keys_at_load_time() {
        let bad_hour = ONE_MODEL.replace("\"hour_ending\": 12", "\"hour_ending\": 73");
        assert!(ModelRegistry::from_reader(bad_hour.as_bytes()).is_err());

        let bad_product = ONE_MODEL.replace("DALMP", "HENRYHUB");
        assert!(ModelRegistry::from_reader(bad_product.as_bytes()).is_err());
    }

    #[test]
    fn rejects_duplicates_and_unknown_features() {
        let spec: ModelFile = serde_json::from_str(ONE_MODEL).unwrap();
        let twice = spec.models.iter().cloned().chain(spec.models.iter().cloned());
        assert!(matches!(
            ModelRegistry::from_specs(twice),
            Err(RegistryError::DuplicateKey(_))
        ));

        let mut odd = spec.models[0].clone();
        odd.coefficients.insert("moon_phase".to_string(), 1.0);
        assert!(matches!(
            ModelRegistry::from_specs([odd]),
            Err(RegistryError::InvalidSpec { .. })
        ));

        let mut negative = spec.models[0].clone();
        negative.residual_std = -1.0;
        assert!(ModelRegistry::from_specs([negative]).is_err());
    }
}
