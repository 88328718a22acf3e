//! Structured error model for destination operations.
//!
//! [`DestinationError`] carries classification, retry metadata, and optional
//! diagnostic details (table, file, disposition). Construct via the
//! category-specific factory methods. Vendor errors never leave a connector
//! without first being translated into one of these categories.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Broad classification of a destination error.
///
/// Only [`ErrorCategory::TransientStore`] is retried by re-running the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[non_exhaustive]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Invalid configuration, unsupported disposition, missing merge key.
    Config,
    /// Store unreachable, table not yet created, or a conflicting commit (retryable).
    TransientStore,
    /// Batch content does not match the destination column types.
    Data,
    /// Ambiguous or otherwise irreconcilable schema.
    Schema,
    /// Lineage reference group is corrupt or incomplete.
    Lineage,
    /// Internal destination error.
    Internal,
}

impl ErrorCategory {
    /// Whether errors of this category should be retried by the orchestrator.
    #[must_use]
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::TransientStore)
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Config => "config",
            Self::TransientStore => "transient_store",
            Self::Data => "data",
            Self::Schema => "schema",
            Self::Lineage => "lineage",
            Self::Internal => "internal",
        };
        f.write_str(s)
    }
}

/// Structured error from a destination operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("[{category}] {code}: {message}")]
pub struct DestinationError {
    pub category: ErrorCategory,
    pub code: String,
    pub message: String,
    pub retryable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl DestinationError {
    fn new(category: ErrorCategory, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            category,
            code: code.into(),
            message: message.into(),
            retryable: category.is_retryable(),
            details: None,
        }
    }

    /// Configuration error (not retryable).
    #[must_use]
    pub fn config(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Config, code, message)
    }

    /// Transient store error (retryable).
    #[must_use]
    pub fn transient_store(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::TransientStore, code, message)
    }

    /// Data/type mismatch error (not retryable).
    #[must_use]
    pub fn data(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Data, code, message)
    }

    /// Schema error (not retryable).
    #[must_use]
    pub fn schema(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Schema, code, message)
    }

    /// Lineage corruption (not retryable).
    #[must_use]
    pub fn lineage(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Lineage, code, message)
    }

    /// Internal error (not retryable).
    #[must_use]
    pub fn internal(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Internal, code, message)
    }

    /// Whether the orchestrator may re-run the identical job.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.retryable
    }

    /// Attach structured diagnostic details, replacing any already present.
    #[must_use]
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Record the table the error relates to.
    #[must_use]
    pub fn with_table(self, table: &str) -> Self {
        self.with_detail("table", table)
    }

    /// Record the batch or reference file the error relates to.
    #[must_use]
    pub fn with_file(self, file: &str) -> Self {
        self.with_detail("file", file)
    }

    /// Record the write disposition in effect when the error occurred.
    #[must_use]
    pub fn with_disposition(self, disposition: &str) -> Self {
        self.with_detail("disposition", disposition)
    }

    fn with_detail(mut self, key: &str, value: &str) -> Self {
        let mut map = match self.details.take() {
            Some(serde_json::Value::Object(map)) => map,
            Some(other) => {
                let mut map = serde_json::Map::new();
                map.insert("context".to_string(), other);
                map
            }
            None => serde_json::Map::new(),
        };
        map.insert(key.to_string(), serde_json::Value::String(value.to_string()));
        self.details = Some(serde_json::Value::Object(map));
        self
    }

    /// Read back a string detail previously attached with one of the `with_*` builders.
    #[must_use]
    pub fn detail(&self, key: &str) -> Option<&str> {
        self.details.as_ref()?.get(key)?.as_str()
    }
}

/// Convenience alias used throughout the landfall crates.
pub type Result<T> = std::result::Result<T, DestinationError>;
