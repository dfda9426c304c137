//! Pipeline orchestration for one target date.
//!
//! A run goes through these steps:
//!
//! 1. take the per-date run lock
//! 2. load the input dataset (failure -> whole-batch fallback)
//! 3. run one unit per (product, hour) on a worker pool: features, model
//!    lookup, forecast
//! 4. wait for units until the deadline; late or unstarted units fail
//! 5. plausibility and consistency on generated records; offending keys fail
//! 6. per-key fallback for failed keys (or whole-batch if every key failed)
//! 7. consistency again on the merged batch (reported only), then
//!    completeness and schema (failure -> whole-batch fallback)
//! 8. store (failure -> whole-batch fallback, stored once more)
//!
//! Escalation at any fallback step ends the run `Failed` with nothing stored.
//! A deadline too large to represent as an `Instant` means no cutoff.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, NaiveDate, Utc};

use crate::data::{CsvInputSource, InputDataset, InputSource};
use crate::domain::{
    FailureDescription, FailureKind, FallbackRecord, ForecastBatch, ForecastRecord, ModelKey,
    PipelineConfig, Product, RunStatus, ValidationResult, horizon_start,
};
use crate::error::{AppError, RunError, UnitError, ValidationError};
use crate::fallback::FallbackCoordinator;
use crate::features::{FeatureBuilder, historical_max};
use crate::io::{ForecastSchema, ForecastStore, StorageRef};
use crate::models::{ModelRegistry, ProbabilisticForecaster};
use crate::validate::{ForecastValidator, ValidationContext, stage_error};

/// One key that did not produce a usable generated record.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyFailure {
    pub key: ModelKey,
    pub error: UnitError,
}

impl KeyFailure {
    pub fn kind(&self) -> FailureKind {
        self.error.failure_kind()
    }
}

#[derive(Debug, Clone, Default)]
pub struct Diagnostics {
    pub keys_total: usize,
    pub failures: Vec<KeyFailure>,
    /// One result per stage, in stage order.
    pub validation: Vec<ValidationResult>,
    pub fallbacks: Vec<FallbackRecord>,
    /// Set when the batch as a whole was replaced by a prior forecast.
    pub batch_failure: Option<FailureDescription>,
    pub error: Option<RunError>,
    pub deadline_exceeded: bool,
    pub elapsed: Duration,
}

impl Diagnostics {
    /// Keys served from a prior forecast in the stored batch.
    pub fn fallback_keys(&self) -> Vec<ModelKey> {
        let mut keys: Vec<ModelKey> = self.fallbacks.iter().flat_map(|f| f.keys.iter().copied()).collect();
        keys.sort();
        keys
    }
}

/// What a caller gets back from `run`.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub target_date: NaiveDate,
    pub status: RunStatus,
    pub batch_ref: Option<StorageRef>,
    pub diagnostics: Diagnostics,
}

/// Read-only state shared by every unit of a run.
struct UnitContext {
    dataset: Arc<InputDataset>,
    registry: Arc<ModelRegistry>,
    features: FeatureBuilder,
    forecaster: ProbabilisticForecaster,
    as_of: DateTime<Utc>,
    deadline: Option<Instant>,
    cancel: Arc<AtomicBool>,
}

impl UnitContext {
    fn run(&self, key: ModelKey) -> Result<ForecastRecord, UnitError> {
        if self.cancel.load(Ordering::Relaxed) || self.deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(UnitError::DeadlineExceeded { key });
        }
        let features = self.features.build(&self.dataset, key, self.as_of)?;
        let spec = self.registry.lookup(key)?;
        Ok(self.forecaster.forecast(&features, spec)?)
    }
}

pub struct PipelineOrchestrator {
    config: PipelineConfig,
    registry: Arc<ModelRegistry>,
    input: Arc<dyn InputSource>,
    store: Arc<ForecastStore>,
}

impl PipelineOrchestrator {
    pub fn new(
        config: PipelineConfig,
        registry: ModelRegistry,
        input: Arc<dyn InputSource>,
        store: Arc<ForecastStore>,
    ) -> Self {
        Self {
            config,
            registry: Arc::new(registry),
            input,
            store,
        }
    }

    /// Wire the orchestrator from configured file locations.
    pub fn from_config(config: PipelineConfig) -> Result<Self, AppError> {
        let registry = ModelRegistry::load(&config.models_path)?;
        let input: Arc<dyn InputSource> = Arc::new(CsvInputSource::new(config.input_path.clone()));
        let store = open_store(&config.store_dir, config.sample_count)?;
        Ok(Self::new(config, registry, input, store))
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<ForecastStore> {
        &self.store
    }

    /// Run the pipeline for `target_date`, stamping records with the current time.
    pub fn run(&self, target_date: NaiveDate) -> RunOutcome {
        self.run_with_clock(target_date, Utc::now())
    }

    pub fn run_with_clock(&self, target_date: NaiveDate, generated_at: DateTime<Utc>) -> RunOutcome {
        let started = Instant::now();
        let deadline = started.checked_add(self.config.deadline);
        let mut diag = Diagnostics {
            keys_total: self.expected_keys().len(),
            ..Diagnostics::default()
        };

        tracing::info!(date = %target_date, keys = diag.keys_total, "pipeline run started");

        let _lock = match self.store.lock_run(target_date) {
            Ok(lock) => lock,
            Err(e) => {
                tracing::error!(date = %target_date, error = %e, "cannot take run lock");
                diag.error = Some(e.into());
                return self.finish(target_date, RunStatus::Failed, None, diag, started);
            }
        };

        let dataset = match self.input.load(target_date) {
            Ok(ds) => ds,
            Err(e) => {
                tracing::warn!(date = %target_date, error = %e, "input dataset unavailable");
                let failure = FailureDescription::new(FailureKind::DataUnavailable, e.to_string());
                return self.whole_batch_fallback(target_date, failure, diag, started);
            }
        };
        let dataset = Arc::new(dataset);

        let (generated, failures, deadline_exceeded) =
            self.execute_units(&dataset, target_date, generated_at, deadline);
        diag.failures = failures;
        diag.deadline_exceeded = deadline_exceeded;

        if generated.is_empty() {
            let failure = summarize_failures(&diag.failures);
            return self.whole_batch_fallback(target_date, failure, diag, started);
        }

        // Key-scoped checks on generated records only.
        let validator = self.validator(&dataset, target_date);
        let mut batch = ForecastBatch::new(target_date, generated);
        let plausibility = validator.check_plausibility(&batch);
        reject_keys(&mut batch, &plausibility, &mut diag.failures);
        let consistency = validator.check_consistency(&batch);
        reject_keys(&mut batch, &consistency, &mut diag.failures);

        if batch.records.is_empty() {
            diag.validation = vec![plausibility, consistency];
            let failure = summarize_failures(&diag.failures);
            return self.whole_batch_fallback(target_date, failure, diag, started);
        }

        // Per-key fallback, grouped by failure class.
        for (kind, keys, message) in group_failures(&diag.failures) {
            let failure = FailureDescription::new(kind, message);
            match self.coordinator().activate(&failure, &keys, target_date) {
                Ok(substitute) => {
                    diag.fallbacks.extend(substitute.fallbacks.iter().cloned());
                    batch.merge(substitute);
                }
                Err(e) => {
                    diag.validation = vec![plausibility, consistency];
                    diag.error = Some(e.into());
                    return self.finish(target_date, RunStatus::Failed, None, diag, started);
                }
            }
        }

        // Fallback records may now sit next to generated peers that break
        // the cross-product rule. Reported, never corrected.
        let merged = validator.check_consistency(&batch);
        let consistency = if merged.passed {
            consistency
        } else {
            tracing::warn!(
                date = %target_date,
                keys = merged.keys.len(),
                "merged batch violates consistency rules"
            );
            combine_results(consistency, merged)
        };

        // Batch-scoped checks on the merged batch.
        let completeness = validator.check_completeness(&batch);
        let schema = validator.check_schema(&batch);
        let batch_scoped_failure = [&completeness, &schema]
            .into_iter()
            .find_map(stage_error)
            .map(batch_failure_from);
        diag.validation = vec![completeness, plausibility, consistency, schema];

        if let Some(failure) = batch_scoped_failure {
            tracing::warn!(date = %target_date, message = %failure.message, "batch-scoped validation failed");
            diag.fallbacks.clear();
            return self.whole_batch_fallback(target_date, failure, diag, started);
        }

        match self.store.store(&batch) {
            Ok(stored) => {
                let status = if batch.is_all_fallback() {
                    RunStatus::Fallback
                } else {
                    RunStatus::Generated
                };
                self.finish(target_date, status, Some(stored), diag, started)
            }
            Err(e) => {
                tracing::warn!(date = %target_date, error = %e, "storing generated batch failed");
                let failure = FailureDescription::new(FailureKind::Storage, e.to_string());
                diag.fallbacks.clear();
                self.whole_batch_fallback(target_date, failure, diag, started)
            }
        }
    }

    fn expected_keys(&self) -> Vec<ModelKey> {
        ModelKey::horizon(&self.config.products, self.config.horizon_hours)
    }

    fn coordinator(&self) -> FallbackCoordinator {
        FallbackCoordinator::new(
            Arc::clone(&self.store),
            &self.config.products,
            self.config.horizon_hours,
            self.config.sample_count,
        )
    }

    fn validator(&self, dataset: &InputDataset, target_date: NaiveDate) -> ForecastValidator {
        let as_of = horizon_start(target_date);
        let maxima: BTreeMap<Product, f64> = self
            .config
            .products
            .iter()
            .filter_map(|&p| {
                historical_max(dataset, p, as_of, self.config.history_window_hours).map(|m| (p, m))
            })
            .collect();
        ForecastValidator::new(ValidationContext::from_config(&self.config, maxima))
    }

    /// Fan units out on the worker pool and collect results until the deadline.
    ///
    /// Returns generated records, failed keys, and whether the deadline hit.
    fn execute_units(
        &self,
        dataset: &Arc<InputDataset>,
        target_date: NaiveDate,
        generated_at: DateTime<Utc>,
        deadline: Option<Instant>,
    ) -> (Vec<ForecastRecord>, Vec<KeyFailure>, bool) {
        let keys = self.expected_keys();
        let missing_models = self.registry.missing_keys(&keys);
        if !missing_models.is_empty() {
            tracing::warn!(count = missing_models.len(), "keys without a registered model");
        }

        let cancel = Arc::new(AtomicBool::new(false));
        let ctx = Arc::new(UnitContext {
            dataset: Arc::clone(dataset),
            registry: Arc::clone(&self.registry),
            features: FeatureBuilder::new(&self.config.fuels),
            forecaster: ProbabilisticForecaster::new(
                target_date,
                self.config.seed,
                self.config.sample_count,
                generated_at,
            )
            .with_clipping(
                Product::ALL
                    .into_iter()
                    .map(|p| (p, !self.config.settings(p).allow_negative)),
            ),
            as_of: horizon_start(target_date),
            deadline,
            cancel: Arc::clone(&cancel),
        });

        let mut slots: Vec<Option<Result<ForecastRecord, UnitError>>> = keys.iter().map(|_| None).collect();
        let mut deadline_exceeded = false;

        match rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.workers)
            .build()
        {
            Ok(pool) => {
                let (tx, rx) = mpsc::channel();
                for (slot, &key) in keys.iter().enumerate() {
                    let tx = tx.clone();
                    let ctx = Arc::clone(&ctx);
                    pool.spawn(move || {
                        let result = ctx.run(key);
                        // The receiver is gone once the deadline passed.
                        let _ = tx.send((slot, result));
                    });
                }
                drop(tx);

                let mut received = 0;
                while received < keys.len() {
                    let next = match deadline {
                        Some(d) => rx.recv_timeout(d.saturating_duration_since(Instant::now())),
                        None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
                    };
                    match next {
                        Ok((slot, result)) => {
                            slots[slot] = Some(result);
                            received += 1;
                        }
                        Err(RecvTimeoutError::Timeout) => {
                            cancel.store(true, Ordering::Relaxed);
                            deadline_exceeded = true;
                            tracing::warn!(
                                finished = received,
                                total = keys.len(),
                                "run deadline reached, remaining units cut off"
                            );
                            break;
                        }
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "worker pool unavailable, running units inline");
                for (slot, &key) in keys.iter().enumerate() {
                    slots[slot] = Some(ctx.run(key));
                }
                deadline_exceeded = deadline.is_some_and(|d| Instant::now() >= d);
            }
        }

        let mut records = Vec::new();
        let mut failures = Vec::new();
        for (key, slot) in keys.into_iter().zip(slots) {
            match slot.unwrap_or(Err(UnitError::DeadlineExceeded { key })) {
                Ok(record) => records.push(record),
                Err(error) => {
                    tracing::warn!(%key, %error, "unit failed");
                    deadline_exceeded |= matches!(error, UnitError::DeadlineExceeded { .. });
                    failures.push(KeyFailure { key, error });
                }
            }
        }

        tracing::info!(
            generated = records.len(),
            failed = failures.len(),
            "units finished"
        );
        (records, failures, deadline_exceeded)
    }

    /// Replace the whole horizon with a prior forecast and store it.
    fn whole_batch_fallback(
        &self,
        target_date: NaiveDate,
        failure: FailureDescription,
        mut diag: Diagnostics,
        started: Instant,
    ) -> RunOutcome {
        diag.batch_failure = Some(failure.clone());

        let batch = match self.coordinator().activate(&failure, &[], target_date) {
            Ok(batch) => batch,
            Err(e) => {
                diag.error = Some(e.into());
                return self.finish(target_date, RunStatus::Failed, None, diag, started);
            }
        };
        diag.fallbacks = batch.fallbacks.clone();

        match self.store.store(&batch) {
            Ok(stored) => self.finish(target_date, RunStatus::Fallback, Some(stored), diag, started),
            Err(e) => {
                tracing::error!(date = %target_date, error = %e, "storing fallback batch failed");
                diag.error = Some(e.into());
                self.finish(target_date, RunStatus::Failed, None, diag, started)
            }
        }
    }

    fn finish(
        &self,
        target_date: NaiveDate,
        status: RunStatus,
        batch_ref: Option<StorageRef>,
        mut diagnostics: Diagnostics,
        started: Instant,
    ) -> RunOutcome {
        diagnostics.elapsed = started.elapsed();
        match status {
            RunStatus::Failed => tracing::error!(
                date = %target_date,
                error = %diagnostics.error.as_ref().map(ToString::to_string).unwrap_or_default(),
                "pipeline run failed"
            ),
            _ => tracing::info!(
                date = %target_date,
                %status,
                failed_keys = diagnostics.failures.len(),
                fallback_keys = diagnostics.fallback_keys().len(),
                elapsed_ms = diagnostics.elapsed.as_millis() as u64,
                "pipeline run finished"
            ),
        }
        RunOutcome {
            target_date,
            status,
            batch_ref,
            diagnostics,
        }
    }
}

pub fn open_store(root: &Path, sample_count: usize) -> Result<Arc<ForecastStore>, AppError> {
    Ok(Arc::new(ForecastStore::open(root, ForecastSchema::new(sample_count))?))
}

/// Drop records for a failed key-scoped check and record them as failures.
fn reject_keys(batch: &mut ForecastBatch, result: &ValidationResult, failures: &mut Vec<KeyFailure>) {
    if result.passed {
        return;
    }
    tracing::warn!(stage = %result.stage, keys = result.keys.len(), "records rejected by validation");
    let date = batch.target_date;
    batch
        .records
        .retain(|r| r.key(date).is_none_or(|k| !result.keys.contains(&k)));
    for &key in &result.keys {
        let label = key.to_string();
        let message = result
            .details
            .iter()
            .filter(|d| d.starts_with(&label) && d[label.len()..].starts_with(':'))
            .cloned()
            .collect::<Vec<_>>()
            .join("; ");
        failures.push(KeyFailure {
            key,
            error: UnitError::Rejected {
                key,
                stage: result.stage,
                message,
            },
        });
    }
}

/// Group failed keys by failure class, with a message naming the first error.
fn group_failures(failures: &[KeyFailure]) -> Vec<(FailureKind, Vec<ModelKey>, String)> {
    let order = [
        FailureKind::DataUnavailable,
        FailureKind::ModelExecution,
        FailureKind::Validation,
        FailureKind::Storage,
    ];
    order
        .into_iter()
        .filter_map(|kind| {
            let group: Vec<&KeyFailure> = failures.iter().filter(|f| f.kind() == kind).collect();
            let first = group.first()?;
            let message = if group.len() == 1 {
                first.error.to_string()
            } else {
                format!("{} keys failed, first: {}", group.len(), first.error)
            };
            Some((kind, group.iter().map(|f| f.key).collect(), message))
        })
        .collect()
}

/// Failure description when no key produced a usable record.
fn summarize_failures(failures: &[KeyFailure]) -> FailureDescription {
    let kind = match failures.first().map(KeyFailure::kind) {
        Some(first) if failures.iter().all(|f| f.kind() == first) => first,
        _ => FailureKind::ModelExecution,
    };
    let message = match failures.first() {
        Some(f) => format!("all {} keys failed, first: {}", failures.len(), f.error),
        None => "no keys configured".to_string(),
    };
    FailureDescription::new(kind, message)
}

fn batch_failure_from(error: ValidationError) -> FailureDescription {
    FailureDescription::new(FailureKind::Validation, error.to_string())
}

/// Fold a later run of the same stage into an earlier result.
fn combine_results(first: ValidationResult, later: ValidationResult) -> ValidationResult {
    let mut details = first.details;
    details.extend(later.details);
    let mut keys = first.keys;
    keys.extend(later.keys);
    ValidationResult::new(first.stage, details, keys)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{HourEnding, ValidationStage};
    use crate::error::{FeatureError, ModelExecutionError};

    fn key(h: u8) -> ModelKey {
        ModelKey::new(Product::Dalmp, HourEnding::new(h).unwrap())
    }

    fn numerical(h: u8) -> KeyFailure {
        KeyFailure {
            key: key(h),
            error: UnitError::Model(ModelExecutionError::NumericalError {
                key: key(h),
                detail: "NaN".to_string(),
            }),
        }
    }

    fn missing_load(h: u8) -> KeyFailure {
        KeyFailure {
            key: key(h),
            error: UnitError::Feature(FeatureError::MissingSeries {
                key: key(h),
                series: "load_forecast".to_string(),
                at: "t".to_string(),
            }),
        }
    }

    #[test]
    fn failures_group_by_kind() {
        let groups = group_failures(&[numerical(3), missing_load(1), numerical(7)]);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].0, FailureKind::DataUnavailable);
        assert_eq!(groups[1].0, FailureKind::ModelExecution);
        assert_eq!(groups[1].1, vec![key(3), key(7)]);
        assert!(groups[1].2.starts_with("2 keys failed"));
    }

    #[test]
    fn uniform_failures_keep_their_kind() {
        assert_eq!(
            summarize_failures(&[missing_load(1), missing_load(2)]).kind,
            FailureKind::DataUnavailable
        );
        assert_eq!(
            summarize_failures(&[missing_load(1), numerical(2)]).kind,
            FailureKind::ModelExecution
        );
    }

    #[test]
    fn rejected_keys_leave_the_batch() {
        let date = NaiveDate::from_ymd_opt(2026, 7, 1).unwrap();
        let records = (1..=3)
            .map(|h| ForecastRecord {
                timestamp: key(h).target_timestamp(date),
                product: Product::Dalmp,
                point_forecast: 1.0,
                samples: vec![1.0],
                generation_timestamp: horizon_start(date),
                is_fallback: false,
                fallback_reason: None,
            })
            .collect();
        let mut batch = ForecastBatch::new(date, records);
        let result = ValidationResult::new(
            ValidationStage::Plausibility,
            vec!["DALMP/h2: point 1 outside [5, 6]".to_string()],
            vec![key(2)],
        );
        let mut failures = Vec::new();
        reject_keys(&mut batch, &result, &mut failures);

        assert_eq!(batch.records.len(), 2);
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].kind(), FailureKind::Validation);
        assert!(failures[0].error.to_string().contains("outside [5, 6]"));
    }

    #[test]
    fn batch_failure_names_stage_and_keys() {
        let result = ValidationResult::new(
            ValidationStage::Completeness,
            vec!["DALMP/h5: missing".to_string()],
            vec![key(5)],
        );
        let failure = batch_failure_from(stage_error(&result).unwrap());
        assert_eq!(failure.kind, FailureKind::Validation);
        assert!(failure.message.contains("1 key(s)"));
        assert!(failure.message.contains("DALMP/h5: missing"));
    }

    #[test]
    fn combined_results_keep_both_runs() {
        let first = ValidationResult::new(ValidationStage::Consistency, vec![], vec![]);
        let later = ValidationResult::new(
            ValidationStage::Consistency,
            vec!["REGUP/h12: above DALMP".to_string()],
            vec![key(12)],
        );
        let merged = combine_results(first, later);
        assert!(!merged.passed);
        assert_eq!(merged.keys, vec![key(12)]);
    }
}
