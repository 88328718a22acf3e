//! Bookkeeping record types.
//!
//! Rows of the version, loads and state tables. Every record is append-only;
//! the "current" record for a key is the most recently inserted one.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DestinationError, Result};
use crate::schema::LogicalSchema;

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

/// Load identifier. Ordered as a string; the framework issues them as
/// fixed-width timestamps so lexical order is chronological.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LoadId(String);

impl LoadId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for LoadId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl<S: Into<String>> From<S> for LoadId {
    fn from(value: S) -> Self {
        Self(value.into())
    }
}

/// Pipeline name keying state snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PipelineName(String);

impl PipelineName {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PipelineName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl<S: Into<String>> From<S> for PipelineName {
    fn from(value: S) -> Self {
        Self(value.into())
    }
}

// ---------------------------------------------------------------------------
// Load status
// ---------------------------------------------------------------------------

/// Status code stored in the loads table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoadStatus {
    Completed,
}

impl LoadStatus {
    #[must_use]
    pub fn code(self) -> i64 {
        match self {
            Self::Completed => 0,
        }
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Row of the schema version table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredSchemaRecord {
    pub version: i64,
    pub engine_version: i64,
    pub inserted_at: DateTime<Utc>,
    pub schema_name: String,
    pub version_hash: String,
    /// Serialized [`LogicalSchema`].
    pub schema: String,
}

impl StoredSchemaRecord {
    /// # Errors
    ///
    /// Returns an `internal` error if the schema cannot be serialized.
    pub fn from_schema(schema: &LogicalSchema, inserted_at: DateTime<Utc>) -> Result<Self> {
        let serialized = schema.to_json().map_err(|e| {
            DestinationError::internal(
                "SCHEMA_SERIALIZE_FAILED",
                format!("failed to serialize schema '{}': {e}", schema.name),
            )
        })?;
        Ok(Self {
            version: i64::try_from(schema.version).unwrap_or(i64::MAX),
            engine_version: i64::from(schema.engine_version),
            inserted_at,
            schema_name: schema.name.clone(),
            version_hash: schema.version_hash.clone(),
            schema: serialized,
        })
    }

    /// # Errors
    ///
    /// Returns a `schema` error when the stored definition does not parse.
    pub fn to_schema(&self) -> Result<LogicalSchema> {
        LogicalSchema::from_json(&self.schema).map_err(|e| {
            DestinationError::schema(
                "STORED_SCHEMA_CORRUPT",
                format!(
                    "stored schema '{}' ({}) does not parse: {e}",
                    self.schema_name, self.version_hash
                ),
            )
        })
    }
}

/// Row of the loads table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredLoadRecord {
    pub load_id: LoadId,
    #[serde(default)]
    pub schema_name: Option<String>,
    pub status: i64,
    pub inserted_at: DateTime<Utc>,
    #[serde(default)]
    pub schema_version_hash: Option<String>,
}

impl StoredLoadRecord {
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.status == LoadStatus::Completed.code()
    }
}

/// Row of the pipeline state table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredStateRecord {
    pub version: i64,
    pub engine_version: i64,
    pub pipeline_name: PipelineName,
    /// Serialized pipeline state blob.
    pub state: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub version_hash: Option<String>,
    #[serde(rename = "_dlt_load_id")]
    pub load_id: LoadId,
}
