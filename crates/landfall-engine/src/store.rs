//! Storage contract consumed by the engine.
//!
//! [`TableStore`] is the only seam between the engine and a vendor SDK. Each
//! connector implements it over its own client and reports failures as
//! [`StoreError`]; the engine translates those into the destination error
//! taxonomy before anything leaves the core.

use std::fmt;

use arrow::record_batch::RecordBatch;

/// A row returned by [`TableStore::select`], keyed by physical column name.
pub type Row = serde_json::Map<String, serde_json::Value>;

/// Errors produced by [`TableStore`] implementations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The store could not be reached or opened.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The table does not exist (yet).
    #[error("table '{0}' not found")]
    TableNotFound(String),

    /// A concurrent writer committed first.
    #[error("commit conflict on '{table}': {message}")]
    Conflict { table: String, message: String },

    /// Batch values cannot be stored in the destination column types.
    #[error("type mismatch on '{table}': {message}")]
    TypeMismatch { table: String, message: String },

    /// The batch names a column the table does not have.
    #[error("column '{column}' does not exist in '{table}'")]
    UnknownColumn { table: String, column: String },

    /// The request itself is malformed (bad key column, bad identifier).
    #[error("invalid request: {0}")]
    Invalid(String),

    /// File-system I/O failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Arrow encoding or decoding failure.
    #[error("arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    /// Internal mutex was poisoned by a panicked thread.
    #[error("store lock poisoned")]
    LockPoisoned,
}

impl StoreError {
    /// Whether re-running the identical operation may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Unavailable(_) | Self::TableNotFound(_) | Self::Conflict { .. } | Self::Io(_)
        )
    }
}

/// Convenience alias used by store implementations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// A physical column as the store knows it.
#[derive(Debug, Clone, PartialEq)]
pub struct NativeColumn<N> {
    pub name: String,
    pub native: N,
    pub nullable: bool,
    /// Backed by a uniqueness constraint where the store supports one.
    pub unique: bool,
}

impl<N> NativeColumn<N> {
    pub fn new(name: impl Into<String>, native: N) -> Self {
        Self {
            name: name.into(),
            native,
            nullable: true,
            unique: false,
        }
    }

    #[must_use]
    pub fn with_nullable(mut self, nullable: bool) -> Self {
        self.nullable = nullable;
        self
    }

    #[must_use]
    pub fn with_unique(mut self, unique: bool) -> Self {
        self.unique = unique;
        self
    }
}

/// What a keyed merge does with the incoming batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeMode {
    /// Update matched rows, insert unmatched ones.
    Upsert,
    /// Delete stored rows whose key is absent from the batch. Matched rows are
    /// left untouched and nothing is inserted.
    DeleteUnmatched,
}

impl fmt::Display for MergeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Upsert => f.write_str("upsert"),
            Self::DeleteUnmatched => f.write_str("delete_unmatched"),
        }
    }
}

/// How a store applies `replace` loads that span several batch files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReplaceMode {
    /// Every batch overwrites the table; the last file of a load wins.
    #[default]
    PerFile,
    /// The table is emptied once when the load is prepared; batches append.
    TruncateOnce,
    /// Batches append to a staging copy prepared per load, which replaces the
    /// table once the whole table chain has loaded.
    StagingSwap,
}

impl fmt::Display for ReplaceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PerFile => f.write_str("per_file"),
            Self::TruncateOnce => f.write_str("truncate_once"),
            Self::StagingSwap => f.write_str("staging_swap"),
        }
    }
}

/// Equality predicate for [`TableStore::select`].
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub column: String,
    pub value: serde_json::Value,
}

impl Filter {
    pub fn eq(column: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        Self {
            column: column.into(),
            value: value.into(),
        }
    }

    /// Whether a selected row satisfies this predicate.
    #[must_use]
    pub fn matches(&self, row: &Row) -> bool {
        match (row.get(&self.column), &self.value) {
            (Some(serde_json::Value::Number(a)), serde_json::Value::Number(b)) => {
                a.as_f64() == b.as_f64()
            }
            (Some(a), b) => a == b,
            (None, b) => b.is_null(),
        }
    }
}

/// Storage contract for destination tables.
///
/// Table names are physical (already qualified and normalized). A store
/// handle is used by one job at a time; concurrent jobs open their own.
#[allow(async_fn_in_trait)]
pub trait TableStore: Send + Sync {
    /// Native column type descriptor.
    type Native: Clone + fmt::Debug + PartialEq + Send + Sync;

    /// List every table in the store's namespace.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] when the store cannot be reached.
    async fn list_tables(&self) -> StoreResult<Vec<String>>;

    /// Introspect a table. `Ok(None)` means the table does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on storage failure.
    async fn describe_table(&self, table: &str)
        -> StoreResult<Option<Vec<NativeColumn<Self::Native>>>>;

    /// Create a table. Zero columns are allowed (sentinel marker).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on storage failure.
    async fn create_table(
        &self,
        table: &str,
        columns: &[NativeColumn<Self::Native>],
    ) -> StoreResult<()>;

    /// Add nullable columns without rewriting existing data.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::TableNotFound`] if the table is missing.
    async fn add_columns(
        &self,
        table: &str,
        columns: &[NativeColumn<Self::Native>],
    ) -> StoreResult<()>;

    /// Drop a table if it exists.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on storage failure.
    async fn drop_table(&self, table: &str) -> StoreResult<()>;

    /// Remove every row, keeping the physical schema.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::TableNotFound`] if the table is missing.
    async fn truncate_table(&self, table: &str) -> StoreResult<()>;

    /// Insert rows as-is. Returns rows written.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::TypeMismatch`] for values the columns cannot hold.
    async fn append(&self, table: &str, batch: &RecordBatch) -> StoreResult<u64>;

    /// Atomically replace the table's contents with `batch`.
    ///
    /// Readers observe either the old or the new contents, never a mix.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::TypeMismatch`] for values the columns cannot hold.
    async fn overwrite(&self, table: &str, batch: &RecordBatch) -> StoreResult<u64>;

    /// Keyed merge on `key`. Returns rows inserted, updated or deleted.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on storage failure or a type mismatch.
    async fn merge_insert(
        &self,
        table: &str,
        key: &str,
        batch: &RecordBatch,
        mode: MergeMode,
    ) -> StoreResult<u64>;

    /// Read rows matching every filter, in storage order.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::TableNotFound`] if the table is missing.
    async fn select(&self, table: &str, filters: &[Filter]) -> StoreResult<Vec<Row>>;

    /// How `replace` loads reach this store.
    fn replace_mode(&self) -> ReplaceMode {
        ReplaceMode::PerFile
    }

    /// (Re)create an empty staging copy of `table` for the coming load.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Invalid`] unless the store replaces through staging.
    async fn prepare_staging(&self, table: &str) -> StoreResult<()> {
        Err(no_staging(table))
    }

    /// Insert rows into the staging copy of `table`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Invalid`] when no staging copy was prepared.
    async fn append_staging(&self, table: &str, batch: &RecordBatch) -> StoreResult<u64> {
        let _ = batch;
        Err(no_staging(table))
    }

    /// Atomically replace `table` with its staging copy.
    ///
    /// Returns `false`, changing nothing, when `table` has no staging copy.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on storage failure.
    async fn swap_staging(&self, table: &str) -> StoreResult<bool> {
        Err(no_staging(table))
    }
}

fn no_staging(table: &str) -> StoreError {
    StoreError::Invalid(format!("store keeps no staging copy of '{table}'"))
}
