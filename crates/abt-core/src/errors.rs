//! Structured error types shared across abtest crates.

use std::collections::BTreeMap;
use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Structured payload attached to every [`AbtError`] variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Stable machine readable error code.
    pub code: String,
    /// Human readable diagnostic message.
    pub message: String,
    /// Contextual key value pairs (experiment ids, statuses, etc.).
    #[serde(default)]
    pub context: BTreeMap<String, String>,
    /// Optional hint that may help the caller resolve the issue.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

impl ErrorInfo {
    /// Creates a new error payload with the provided code and message.
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            context: BTreeMap::new(),
            hint: None,
        }
    }

    /// Adds a context entry to the payload.
    pub fn with_context(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.context.insert(key.into(), value.to_string());
        self
    }

    /// Sets a human readable hint for remediation.
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }
}

/// Canonical error type for the abtest engine.
///
/// Running out of data is never an error: statistics queries return `None`
/// or zero instead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[serde(tag = "family", content = "detail")]
pub enum AbtError {
    /// The requested lifecycle action is not legal from the current status.
    #[error("invalid transition: {0}")]
    InvalidTransition(ErrorInfo),
    /// Event ingestion attempted while the experiment is not running.
    #[error("experiment not active: {0}")]
    ExperimentNotActive(ErrorInfo),
    /// Another experiment is already active for the same page.
    #[error("duplicate active experiment: {0}")]
    DuplicateActiveExperiment(ErrorInfo),
    /// The referenced experiment does not exist.
    #[error("not found: {0}")]
    NotFound(ErrorInfo),
    /// Caller supplied data failed validation.
    #[error("validation error: {0}")]
    Validation(ErrorInfo),
    /// The storage backend failed.
    #[error("storage error: {0}")]
    Storage(ErrorInfo),
    /// Configuration could not be loaded or is inconsistent.
    #[error("config error: {0}")]
    Config(ErrorInfo),
}

impl Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (code: {})", self.message, self.code)?;
        if !self.context.is_empty() {
            write!(f, " | context: [")?;
            for (idx, (key, value)) in self.context.iter().enumerate() {
                if idx > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{key}={value}")?;
            }
            write!(f, "]")?;
        }
        if let Some(hint) = &self.hint {
            write!(f, " | hint: {hint}")?;
        }
        Ok(())
    }
}

impl AbtError {
    /// Returns a reference to the payload describing the error.
    pub fn info(&self) -> &ErrorInfo {
        match self {
            AbtError::InvalidTransition(info)
            | AbtError::ExperimentNotActive(info)
            | AbtError::DuplicateActiveExperiment(info)
            | AbtError::NotFound(info)
            | AbtError::Validation(info)
            | AbtError::Storage(info)
            | AbtError::Config(info) => info,
        }
    }

    /// Convenience constructor for a missing experiment.
    pub fn experiment_not_found(id: crate::ExperimentId) -> Self {
        AbtError::NotFound(
            ErrorInfo::new("experiment-not-found", "no experiment with this id")
                .with_context("experiment", id),
        )
    }

    /// Convenience constructor for ingestion against a non-running experiment.
    pub fn not_active(id: crate::ExperimentId, status: crate::Status) -> Self {
        AbtError::ExperimentNotActive(
            ErrorInfo::new(
                "experiment-not-active",
                "events are only accepted while the experiment is running",
            )
            .with_context("experiment", id)
            .with_context("status", status),
        )
    }

    /// Convenience constructor for a target that does not fit a signed 64-bit column.
    pub fn sample_size_too_large(sample_size: u64) -> Self {
        AbtError::Validation(
            ErrorInfo::new(
                "sample-size-too-large",
                "sample size exceeds the storable maximum",
            )
            .with_context("sample_size", sample_size)
            .with_context("max", i64::MAX),
        )
    }

    /// Convenience constructor for the one-active-experiment-per-page rule.
    pub fn duplicate_active(page: crate::PageId, existing: crate::ExperimentId) -> Self {
        AbtError::DuplicateActiveExperiment(
            ErrorInfo::new(
                "duplicate-active-experiment",
                "this page already has an active experiment",
            )
            .with_context("page", page)
            .with_context("existing", existing)
            .with_hint("finish or cancel the existing experiment first"),
        )
    }
}
