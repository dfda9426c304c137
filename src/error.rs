//! Error types.
//!
//! Library code returns the typed errors below so the orchestrator can tell
//! per-key failures from batch-scoped ones. The binary maps everything onto
//! `AppError`, which carries the process exit code.

use std::path::PathBuf;

use chrono::NaiveDate;
use thiserror::Error;

use crate::domain::{FailureKind, FallbackState, ModelKey, Product, ValidationStage};

#[derive(Clone)]
pub struct AppError {
    exit_code: u8,
    message: String,
}

impl AppError {
    pub fn new(exit_code: u8, message: impl Into<String>) -> Self {
        Self {
            exit_code,
            message: message.into(),
        }
    }

    pub fn exit_code(&self) -> u8 {
        self.exit_code
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::fmt::Debug for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppError")
            .field("exit_code", &self.exit_code)
            .field("message", &self.message)
            .finish()
    }
}

impl std::error::Error for AppError {}

/// Feature assembly failures (scoped to one key).
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FeatureError {
    #[error("{key}: series `{series}` has no value at {at}")]
    MissingSeries {
        key: ModelKey,
        series: String,
        at: String,
    },
    #[error("{key}: history starts {available_from}, lags need data from {required_from}")]
    InsufficientHistory {
        key: ModelKey,
        required_from: String,
        available_from: String,
    },
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum NotFoundError {
    #[error("no model registered for {0}")]
    Model(ModelKey),
    #[error("no stored forecast for {product} on {date}")]
    Batch { date: NaiveDate, product: Product },
    #[error("no stored forecast for {0}")]
    Latest(Product),
}

/// Model file problems, reported when the registry is loaded.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RegistryError {
    #[error("failed to read model file '{}': {message}", path.display())]
    Read { path: PathBuf, message: String },
    #[error("{0}")]
    Invalid(String),
    #[error("duplicate model for {0}")]
    DuplicateKey(ModelKey),
    #[error("invalid model for {key}: {message}")]
    InvalidSpec { key: ModelKey, message: String },
}

/// Model execution failures (scoped to one key).
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ModelExecutionError {
    #[error("{key}: numerical error: {detail}")]
    NumericalError { key: ModelKey, detail: String },
    #[error("{key}: model references feature `{feature}` which was not built")]
    MissingFeature { key: ModelKey, feature: String },
}

#[derive(Debug, Clone, PartialEq, Error)]
#[error("{stage} check failed for {} key(s): {}", keys.len(), details.join("; "))]
pub struct ValidationError {
    pub stage: ValidationStage,
    pub keys: Vec<ModelKey>,
    pub details: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum StorageError {
    #[error("write failed for '{}': {message}", path.display())]
    WriteFailure { path: PathBuf, message: String },
    #[error("read failed for '{}': {message}", path.display())]
    ReadFailure { path: PathBuf, message: String },
    #[error("index '{}' is corrupt: {message}", path.display())]
    IndexCorruption { path: PathBuf, message: String },
    #[error("batch rejected by schema guard: {}", details.join("; "))]
    SchemaViolation { details: Vec<String> },
    #[error("another run holds the lock for {date}")]
    Locked { date: NaiveDate },
}

/// Errors from the store's read interface.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RetrieveError {
    #[error(transparent)]
    NotFound(#[from] NotFoundError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum FallbackError {
    /// No eligible prior batch exists; manual intervention required.
    #[error("fallback escalated ({failure}): {message}")]
    Escalated {
        failure: FailureKind,
        missing: Vec<ModelKey>,
        message: String,
    },
    #[error("fallback state machine cannot move from {from:?} to {to:?}")]
    InvalidTransition { from: FallbackState, to: FallbackState },
}

/// Failures from an input source (data acquisition is external).
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DataError {
    #[error("failed to read input '{}': {message}", path.display())]
    Read { path: PathBuf, message: String },
    #[error("line {line}: {message}")]
    Parse { line: usize, message: String },
    #[error("input dataset is empty")]
    Empty,
}

/// Outcome of a failed per-key unit, as aggregated by the orchestrator.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum UnitError {
    #[error(transparent)]
    Feature(#[from] FeatureError),
    #[error(transparent)]
    NotFound(#[from] NotFoundError),
    #[error(transparent)]
    Model(#[from] ModelExecutionError),
    #[error("{key}: not finished before the run deadline")]
    DeadlineExceeded { key: ModelKey },
    #[error("{key}: rejected by {stage} check: {message}")]
    Rejected {
        key: ModelKey,
        stage: ValidationStage,
        message: String,
    },
}

impl UnitError {
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            UnitError::Feature(_) => FailureKind::DataUnavailable,
            UnitError::NotFound(_) | UnitError::Model(_) | UnitError::DeadlineExceeded { .. } => {
                FailureKind::ModelExecution
            }
            UnitError::Rejected { .. } => FailureKind::Validation,
        }
    }
}

/// Why a run ended `Failed`.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RunError {
    #[error(transparent)]
    Fallback(#[from] FallbackError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl From<StorageError> for AppError {
    fn from(err: StorageError) -> Self {
        AppError::new(4, err.to_string())
    }
}

impl From<RetrieveError> for AppError {
    fn from(err: RetrieveError) -> Self {
        match err {
            RetrieveError::NotFound(e) => AppError::new(3, e.to_string()),
            RetrieveError::Storage(e) => e.into(),
        }
    }
}

impl From<RegistryError> for AppError {
    fn from(err: RegistryError) -> Self {
        AppError::new(2, err.to_string())
    }
}

impl From<DataError> for AppError {
    fn from(err: DataError) -> Self {
        AppError::new(3, err.to_string())
    }
}

impl From<FallbackError> for AppError {
    fn from(err: FallbackError) -> Self {
        AppError::new(5, err.to_string())
    }
}
