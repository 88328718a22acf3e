//! Logical schema model.
//!
//! A [`LogicalSchema`] is the destination-agnostic description of every table
//! a pipeline loads, including the three bookkeeping tables that live next to
//! user data. Schemas are content-addressed by [`LogicalSchema::version_hash`];
//! a stored schema is never mutated, a changed schema is a new version.

use std::collections::HashSet;
use std::fmt;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Schema version history table.
pub const VERSION_TABLE: &str = "_dlt_version";
/// Load completion table.
pub const LOADS_TABLE: &str = "_dlt_loads";
/// Pipeline state snapshot table.
pub const STATE_TABLE: &str = "_dlt_pipeline_state";

/// Row identity column on every user table.
pub const DLT_ID_COLUMN: &str = "_dlt_id";
/// Link from a child row to its parent's [`DLT_ID_COLUMN`].
pub const DLT_PARENT_ID_COLUMN: &str = "_dlt_parent_id";
/// Load id column stamped on data and state rows.
pub const DLT_LOAD_ID_COLUMN: &str = "_dlt_load_id";

/// Engine version written with each stored schema.
pub const ENGINE_VERSION: u32 = 9;

/// Semantic column type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Text,
    Double,
    Bool,
    Timestamp,
    Bigint,
    Binary,
    #[serde(alias = "complex")]
    Json,
    Decimal,
    /// 256-bit integer, stored as a decimal with the capability-declared (precision, scale).
    Wei,
    Date,
    Time,
}

impl DataType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Double => "double",
            Self::Bool => "bool",
            Self::Timestamp => "timestamp",
            Self::Bigint => "bigint",
            Self::Binary => "binary",
            Self::Json => "json",
            Self::Decimal => "decimal",
            Self::Wei => "wei",
            Self::Date => "date",
            Self::Time => "time",
        }
    }

    /// Every logical type, in declaration order.
    pub const ALL: [DataType; 11] = [
        Self::Text,
        Self::Double,
        Self::Bool,
        Self::Timestamp,
        Self::Bigint,
        Self::Binary,
        Self::Json,
        Self::Decimal,
        Self::Wei,
        Self::Date,
        Self::Time,
    ];
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Type-only view of a column: what a type mapper produces and consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ColumnType {
    pub data_type: DataType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub precision: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale: Option<u32>,
}

impl ColumnType {
    #[must_use]
    pub fn new(data_type: DataType) -> Self {
        Self {
            data_type,
            precision: None,
            scale: None,
        }
    }

    #[must_use]
    pub fn with_precision(mut self, precision: u32) -> Self {
        self.precision = Some(precision);
        self
    }

    #[must_use]
    pub fn with_scale(mut self, scale: u32) -> Self {
        self.scale = Some(scale);
        self
    }
}

/// Destination-specific column hints.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ColumnHints {
    pub unique: bool,
    pub primary_key: bool,
    pub merge_key: bool,
    /// Column text feeds the table's embedding vector.
    pub vectorize: bool,
    /// Column holds geometries (WKB or WKT).
    pub geometry: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub srid: Option<u32>,
}

impl ColumnHints {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// A single column definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub data_type: DataType,
    #[serde(default = "default_nullable")]
    pub nullable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub precision: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale: Option<u32>,
    #[serde(default, skip_serializing_if = "ColumnHints::is_empty")]
    pub hints: ColumnHints,
}

fn default_nullable() -> bool {
    true
}

impl ColumnDef {
    #[must_use]
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
            nullable: true,
            precision: None,
            scale: None,
            hints: ColumnHints::default(),
        }
    }

    #[must_use]
    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    #[must_use]
    pub fn with_precision(mut self, precision: u32, scale: Option<u32>) -> Self {
        self.precision = Some(precision);
        self.scale = scale;
        self
    }

    #[must_use]
    pub fn with_hints(mut self, hints: ColumnHints) -> Self {
        self.hints = hints;
        self
    }

    #[must_use]
    pub fn primary_key(mut self) -> Self {
        self.hints.primary_key = true;
        self.nullable = false;
        self
    }

    #[must_use]
    pub fn unique(mut self) -> Self {
        self.hints.unique = true;
        self
    }

    #[must_use]
    pub fn merge_key(mut self) -> Self {
        self.hints.merge_key = true;
        self
    }

    #[must_use]
    pub fn vectorize(mut self) -> Self {
        self.hints.vectorize = true;
        self
    }

    #[must_use]
    pub fn column_type(&self) -> ColumnType {
        ColumnType {
            data_type: self.data_type,
            precision: self.precision,
            scale: self.scale,
        }
    }

    /// Build a column from a mapped type, e.g. after introspection.
    #[must_use]
    pub fn from_type(name: impl Into<String>, ty: ColumnType, nullable: bool) -> Self {
        Self {
            name: name.into(),
            data_type: ty.data_type,
            nullable,
            precision: ty.precision,
            scale: ty.scale,
            hints: ColumnHints::default(),
        }
    }
}

/// How a batch is reconciled with rows already stored in its table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum WriteDisposition {
    Skip,
    Append,
    Replace,
    Merge,
    /// A disposition no destination understands. Kept so it can be rejected at write time.
    Unsupported(String),
}

impl WriteDisposition {
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Skip => "skip",
            Self::Append => "append",
            Self::Replace => "replace",
            Self::Merge => "merge",
            Self::Unsupported(other) => other,
        }
    }
}

impl From<String> for WriteDisposition {
    fn from(value: String) -> Self {
        Self::from(value.as_str())
    }
}

impl From<&str> for WriteDisposition {
    fn from(value: &str) -> Self {
        match value {
            "skip" => Self::Skip,
            "append" => Self::Append,
            "replace" => Self::Replace,
            "merge" => Self::Merge,
            other => Self::Unsupported(other.to_string()),
        }
    }
}

impl From<WriteDisposition> for String {
    fn from(value: WriteDisposition) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for WriteDisposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A table definition within a [`LogicalSchema`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogicalTable {
    pub name: String,
    #[serde(default)]
    pub columns: IndexMap<String, ColumnDef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub write_disposition: Option<WriteDisposition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    /// Delete rows whose root key vanished from the latest merge. Defaults to on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remove_orphans: Option<bool>,
}

impl LogicalTable {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: IndexMap::new(),
            write_disposition: None,
            parent: None,
            remove_orphans: None,
        }
    }

    #[must_use]
    pub fn with_column(mut self, column: ColumnDef) -> Self {
        self.columns.insert(column.name.clone(), column);
        self
    }

    #[must_use]
    pub fn with_disposition(mut self, disposition: impl Into<WriteDisposition>) -> Self {
        self.write_disposition = Some(disposition.into());
        self
    }

    #[must_use]
    pub fn with_parent(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    #[must_use]
    pub fn with_remove_orphans(mut self, remove_orphans: bool) -> Self {
        self.remove_orphans = Some(remove_orphans);
        self
    }

    #[must_use]
    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    pub fn columns_with(&self, hint: impl Fn(&ColumnHints) -> bool) -> Vec<&str> {
        self.columns
            .values()
            .filter(|c| hint(&c.hints))
            .map(|c| c.name.as_str())
            .collect()
    }

    #[must_use]
    pub fn vectorize_columns(&self) -> Vec<&str> {
        self.columns_with(|h| h.vectorize)
    }

    /// Columns whose values identify a row for synthetic id generation.
    ///
    /// Primary key plus merge key (merge only), else unique columns, else
    /// `_dlt_id` when the table carries it.
    #[must_use]
    pub fn unique_identifiers(&self, disposition: &WriteDisposition) -> Vec<&str> {
        let mut keys = self.columns_with(|h| h.primary_key);
        if *disposition == WriteDisposition::Merge {
            for key in self.columns_with(|h| h.merge_key) {
                if !keys.contains(&key) {
                    keys.push(key);
                }
            }
        }
        if keys.is_empty() {
            keys = self.columns_with(|h| h.unique);
        }
        if keys.is_empty() && self.columns.contains_key(DLT_ID_COLUMN) {
            keys.push(DLT_ID_COLUMN);
        }
        keys
    }
}

/// Named, versioned collection of tables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogicalSchema {
    pub name: String,
    pub version: u64,
    pub version_hash: String,
    pub engine_version: u32,
    pub tables: IndexMap<String, LogicalTable>,
}

impl LogicalSchema {
    /// Empty schema carrying only the bookkeeping tables.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        let mut schema = Self {
            name: name.into(),
            version: 0,
            version_hash: String::new(),
            engine_version: ENGINE_VERSION,
            tables: IndexMap::new(),
        };
        for table in bookkeeping_tables() {
            schema.tables.insert(table.name.clone(), table);
        }
        schema.bump_version();
        schema
    }

    /// Add or replace a table and refresh the version.
    #[must_use]
    pub fn with_table(mut self, table: LogicalTable) -> Self {
        self.tables.insert(table.name.clone(), table);
        self.bump_version();
        self
    }

    #[must_use]
    pub fn get_table(&self, name: &str) -> Option<&LogicalTable> {
        self.tables.get(name)
    }

    /// Whether a table is framework bookkeeping rather than user data.
    #[must_use]
    pub fn is_internal(table_name: &str) -> bool {
        matches!(table_name, VERSION_TABLE | LOADS_TABLE | STATE_TABLE)
    }

    /// Names of user tables (bookkeeping excluded), in definition order.
    pub fn data_table_names(&self) -> impl Iterator<Item = &str> {
        self.tables
            .keys()
            .map(String::as_str)
            .filter(|name| !Self::is_internal(name))
    }

    /// Walk the `parent` chain to the root table.
    ///
    /// Returns `None` when a parent is missing or the chain loops.
    #[must_use]
    pub fn root_table(&self, table_name: &str) -> Option<&LogicalTable> {
        let mut seen = HashSet::new();
        let mut current = self.tables.get(table_name)?;
        while let Some(parent) = current.parent.as_deref() {
            if !seen.insert(current.name.as_str()) {
                return None;
            }
            current = self.tables.get(parent)?;
        }
        Some(current)
    }

    /// Root table followed by all descendants, breadth first in definition order.
    #[must_use]
    pub fn table_chain(&self, root_name: &str) -> Vec<&LogicalTable> {
        let Some(root) = self.tables.get(root_name) else {
            return Vec::new();
        };
        let mut chain = vec![root];
        let mut idx = 0;
        while idx < chain.len() {
            let parent = chain[idx].name.as_str();
            chain.extend(
                self.tables
                    .values()
                    .filter(|t| t.parent.as_deref() == Some(parent)),
            );
            idx += 1;
        }
        chain
    }

    /// Effective write disposition: child tables inherit their root's.
    #[must_use]
    pub fn write_disposition(&self, table_name: &str) -> WriteDisposition {
        self.root_table(table_name)
            .and_then(|root| root.write_disposition.clone())
            .or_else(|| {
                self.tables
                    .get(table_name)
                    .and_then(|t| t.write_disposition.clone())
            })
            .unwrap_or(WriteDisposition::Append)
    }

    /// Whether orphan removal applies to the chain rooted at `table_name`.
    #[must_use]
    pub fn removes_orphans(&self, table_name: &str) -> bool {
        self.root_table(table_name)
            .map_or(false, |root| root.remove_orphans.unwrap_or(true))
    }

    /// SHA-256 over the canonical JSON of name, engine version and tables.
    #[must_use]
    pub fn compute_hash(&self) -> String {
        let canonical = serde_json::json!({
            "name": self.name,
            "engine_version": self.engine_version,
            "tables": self.tables,
        });
        let mut hasher = Sha256::new();
        hasher.update(canonical.to_string().as_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// Refresh `version_hash`, incrementing `version` when the content changed.
    ///
    /// Returns `true` when the version moved.
    pub fn bump_version(&mut self) -> bool {
        let hash = self.compute_hash();
        if hash == self.version_hash {
            return false;
        }
        self.version += 1;
        self.version_hash = hash;
        true
    }

    /// Serialized definition as stored in the version table.
    ///
    /// # Errors
    ///
    /// Returns the serializer error if a table cannot be rendered as JSON.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// # Errors
    ///
    /// Returns the deserializer error for malformed schema JSON.
    pub fn from_json(raw: &str) -> serde_json::Result<Self> {
        serde_json::from_str(raw)
    }
}

/// Definition of one bookkeeping table, by name.
#[must_use]
pub fn bookkeeping_table(name: &str) -> Option<LogicalTable> {
    bookkeeping_tables().into_iter().find(|t| t.name == name)
}

fn bookkeeping_tables() -> Vec<LogicalTable> {
    use DataType::{Bigint, Text, Timestamp};
    vec![
        LogicalTable::new(VERSION_TABLE)
            .with_column(ColumnDef::new("version", Bigint).not_null())
            .with_column(ColumnDef::new("engine_version", Bigint).not_null())
            .with_column(ColumnDef::new("inserted_at", Timestamp).not_null())
            .with_column(ColumnDef::new("schema_name", Text).not_null())
            .with_column(ColumnDef::new("version_hash", Text).not_null())
            .with_column(ColumnDef::new("schema", Text).not_null())
            .with_disposition(WriteDisposition::Skip),
        LogicalTable::new(LOADS_TABLE)
            .with_column(ColumnDef::new("load_id", Text).not_null())
            .with_column(ColumnDef::new("schema_name", Text))
            .with_column(ColumnDef::new("status", Bigint).not_null())
            .with_column(ColumnDef::new("inserted_at", Timestamp).not_null())
            .with_column(ColumnDef::new("schema_version_hash", Text))
            .with_disposition(WriteDisposition::Skip),
        LogicalTable::new(STATE_TABLE)
            .with_column(ColumnDef::new("version", Bigint).not_null())
            .with_column(ColumnDef::new("engine_version", Bigint).not_null())
            .with_column(ColumnDef::new("pipeline_name", Text).not_null())
            .with_column(ColumnDef::new("state", Text).not_null())
            .with_column(ColumnDef::new("created_at", Timestamp).not_null())
            .with_column(ColumnDef::new("version_hash", Text))
            .with_column(ColumnDef::new(DLT_LOAD_ID_COLUMN, Text).not_null())
            .with_disposition(WriteDisposition::Append),
    ]
}
