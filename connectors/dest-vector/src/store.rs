//! Versioned columnar tables on a local filesystem.
//!
//! Each table lives in `<root>/<table>/`:
//!
//! - `data/<uuid>.arrow` holds immutable Arrow IPC fragments.
//! - `_versions/<n>.arrow` is a manifest: an IPC file with no batches whose
//!   schema is the table schema and whose metadata lists the live fragments.
//! - `_latest` names the current version.
//!
//! A write produces new fragments and commits version `n + 1`. The manifest
//! is created exclusively, so of two writers racing from version `n` one gets
//! [`StoreError::Conflict`]. Readers resolve `_latest` once and only see
//! committed versions. Fragments written before a column was added are padded
//! with nulls on read, which keeps `add_columns` a metadata-only commit.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow::array::{new_null_array, ArrayRef, BooleanArray};
use arrow::compute::{concat_batches, filter_record_batch};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;

use landfall_engine::arrow_utils::{batch_to_rows, cast_strict, column_as_text};
use landfall_engine::store::{
    Filter, MergeMode, NativeColumn, Row, StoreError, StoreResult, TableStore,
};

use crate::fragment::{read_ipc_file, write_ipc_file};

const LATEST_FILE: &str = "_latest";
const VERSIONS_DIR: &str = "_versions";
const DATA_DIR: &str = "data";
const FRAGMENTS_KEY: &str = "landfall.fragments";
const UNIQUE_KEY: &str = "landfall.unique";

/// One committed table version.
#[derive(Debug, Clone)]
struct Version {
    number: u64,
    /// Table schema, without manifest metadata.
    schema: SchemaRef,
    fragments: Vec<String>,
}

/// [`TableStore`] over versioned Arrow IPC fragments under a root directory.
#[derive(Debug, Clone)]
pub struct LocalTableStore {
    root: PathBuf,
}

impl LocalTableStore {
    /// Open (creating if needed) the store rooted at `root`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] when the root cannot be created.
    pub fn open(root: impl Into<PathBuf>) -> StoreResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| {
            StoreError::Unavailable(format!("cannot open {}: {e}", root.display()))
        })?;
        Ok(Self { root })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Current version number of a table, `None` if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the version pointer is unreadable.
    pub async fn version(&self, table: &str) -> StoreResult<Option<u64>> {
        let dir = self.table_dir(table)?;
        blocking(move || Ok(read_latest(&dir)?.map(|v| v.number))).await
    }

    fn table_dir(&self, table: &str) -> StoreResult<PathBuf> {
        if table.is_empty()
            || table.starts_with('.')
            || table.contains(['/', '\\'])
            || table == LATEST_FILE
        {
            return Err(StoreError::Invalid(format!("invalid table name '{table}'")));
        }
        Ok(self.root.join(table))
    }

    async fn with_table<T, F>(&self, table: &str, f: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Path, &str) -> StoreResult<T> + Send + 'static,
    {
        let dir = self.table_dir(table)?;
        let table = table.to_string();
        blocking(move || f(&dir, &table)).await
    }
}

async fn blocking<T, F>(f: F) -> StoreResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> StoreResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StoreError::Io(std::io::Error::other(e)))?
}

fn read_latest(dir: &Path) -> StoreResult<Option<Version>> {
    let raw = match fs::read_to_string(dir.join(LATEST_FILE)) {
        Ok(raw) => raw,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let number: u64 = raw.trim().parse().map_err(|_| {
        StoreError::Invalid(format!("corrupt version pointer in {}", dir.display()))
    })?;
    let (manifest, _) = read_ipc_file(&manifest_path(dir, number))?;
    let fragments = match manifest.metadata().get(FRAGMENTS_KEY) {
        Some(list) => serde_json::from_str(list).map_err(|e| {
            StoreError::Invalid(format!("corrupt manifest {number} in {}: {e}", dir.display()))
        })?,
        None => Vec::new(),
    };
    let fields: Vec<Field> = manifest.fields().iter().map(|f| f.as_ref().clone()).collect();
    Ok(Some(Version {
        number,
        schema: Arc::new(Schema::new(fields)),
        fragments,
    }))
}

fn require_latest(dir: &Path, table: &str) -> StoreResult<Version> {
    read_latest(dir)?.ok_or_else(|| StoreError::TableNotFound(table.to_string()))
}

fn manifest_path(dir: &Path, number: u64) -> PathBuf {
    dir.join(VERSIONS_DIR).join(format!("{number:020}.arrow"))
}

/// Commit the version after `previous`. Loses to any writer that got there first.
fn commit(
    dir: &Path,
    table: &str,
    previous: Option<u64>,
    schema: &Schema,
    fragments: &[String],
) -> StoreResult<u64> {
    let number = previous.map_or(1, |n| n + 1);
    let list = serde_json::to_string(fragments)
        .map_err(|e| StoreError::Invalid(format!("cannot encode manifest: {e}")))?;
    let manifest = Schema::new_with_metadata(
        schema.fields().clone(),
        HashMap::from([(FRAGMENTS_KEY.to_string(), list)]),
    );
    write_ipc_file(&manifest_path(dir, number), &manifest, &[], table)?;

    let tmp = dir.join(format!("{LATEST_FILE}.{}.tmp", uuid::Uuid::new_v4()));
    fs::write(&tmp, number.to_string())?;
    fs::rename(&tmp, dir.join(LATEST_FILE))?;
    tracing::debug!(table, version = number, fragments = fragments.len(), "version committed");
    Ok(number)
}

fn write_fragment(dir: &Path, table: &str, batch: &RecordBatch) -> StoreResult<String> {
    let name = format!("{}.arrow", uuid::Uuid::new_v4());
    write_ipc_file(&dir.join(DATA_DIR).join(&name), &batch.schema(), &[batch.clone()], table)?;
    Ok(name)
}

/// Fragment list of a rewrite: one fragment for `batch`, none when it is empty.
fn rewrite_fragments(dir: &Path, table: &str, batch: &RecordBatch) -> StoreResult<Vec<String>> {
    if batch.num_rows() == 0 {
        return Ok(Vec::new());
    }
    Ok(vec![write_fragment(dir, table, batch)?])
}

/// Read every live row of `version`, padded to its schema.
fn scan(dir: &Path, version: &Version) -> StoreResult<RecordBatch> {
    let mut batches = Vec::new();
    for fragment in &version.fragments {
        let (_, stored) = read_ipc_file(&dir.join(DATA_DIR).join(fragment))?;
        for batch in stored {
            batches.push(align(&batch, &version.schema)?);
        }
    }
    Ok(concat_batches(&version.schema, &batches)?)
}

/// Project a stored fragment onto the current schema.
fn align(batch: &RecordBatch, schema: &SchemaRef) -> StoreResult<RecordBatch> {
    let columns: Vec<ArrayRef> = schema
        .fields()
        .iter()
        .map(|field| match batch.column_by_name(field.name()) {
            Some(column) => Arc::clone(column),
            None => new_null_array(field.data_type(), batch.num_rows()),
        })
        .collect();
    Ok(RecordBatch::try_new(Arc::clone(schema), columns)?)
}

/// Cast `batch` to the table schema. Unknown columns and values the column
/// types cannot hold are rejected; absent nullable columns become null.
fn conform(batch: &RecordBatch, schema: &SchemaRef, table: &str) -> StoreResult<RecordBatch> {
    let incoming = batch.schema();
    if let Some(unknown) = incoming
        .fields()
        .iter()
        .find(|f| schema.field_with_name(f.name()).is_err())
    {
        return Err(StoreError::UnknownColumn {
            table: table.to_string(),
            column: unknown.name().clone(),
        });
    }
    let mismatch = |message: String| StoreError::TypeMismatch {
        table: table.to_string(),
        message,
    };
    let mut columns: Vec<ArrayRef> = Vec::with_capacity(schema.fields().len());
    for field in schema.fields() {
        let column = match batch.column_by_name(field.name()) {
            Some(column) => cast_strict(column, field.data_type())
                .map_err(|e| mismatch(format!("column '{}': {e}", field.name())))?,
            None => new_null_array(field.data_type(), batch.num_rows()),
        };
        if !field.is_nullable() && column.null_count() > 0 {
            return Err(mismatch(format!(
                "column '{}' is not nullable but the batch has {} null values",
                field.name(),
                column.null_count()
            )));
        }
        columns.push(column);
    }
    Ok(RecordBatch::try_new(Arc::clone(schema), columns)?)
}

/// The key column of `batch` cast to the table's key type. Other payload
/// columns of a delete-unmatched merge are never stored.
fn key_only(
    batch: &RecordBatch,
    schema: &SchemaRef,
    key: &str,
    table: &str,
) -> StoreResult<RecordBatch> {
    let field = schema.field_with_name(key).map_err(|_| {
        StoreError::Invalid(format!("merge key '{key}' is not a column of '{table}'"))
    })?;
    let column = batch.column_by_name(key).ok_or_else(|| {
        StoreError::Invalid(format!("batch for '{table}' has no merge key '{key}'"))
    })?;
    let column = cast_strict(column, field.data_type()).map_err(|e| StoreError::TypeMismatch {
        table: table.to_string(),
        message: format!("merge key '{key}': {e}"),
    })?;
    let key_schema = Schema::new(vec![Field::new(key, field.data_type().clone(), true)]);
    Ok(RecordBatch::try_new(Arc::new(key_schema), vec![column])?)
}

fn key_values(batch: &RecordBatch, key: &str, table: &str) -> StoreResult<Vec<Option<String>>> {
    let column = batch.column_by_name(key).ok_or_else(|| {
        StoreError::Invalid(format!("merge key '{key}' is not a column of '{table}'"))
    })?;
    Ok(column_as_text(column)?)
}

/// Merge `incoming` into the table contents. Returns the rewritten table
/// and the number of rows inserted, updated or deleted.
fn merged(
    existing: &RecordBatch,
    incoming: &RecordBatch,
    key: &str,
    mode: MergeMode,
    table: &str,
) -> StoreResult<(RecordBatch, u64)> {
    let incoming_keys: HashSet<String> = key_values(incoming, key, table)?
        .into_iter()
        .flatten()
        .collect();
    let existing_keys = key_values(existing, key, table)?;
    match mode {
        MergeMode::Upsert => {
            let keep: BooleanArray = existing_keys
                .iter()
                .map(|k| Some(k.as_ref().map_or(true, |k| !incoming_keys.contains(k))))
                .collect();
            let kept = filter_record_batch(existing, &keep)?;
            let rewritten = concat_batches(&existing.schema(), [&kept, incoming])?;
            Ok((rewritten, count(incoming.num_rows())))
        }
        MergeMode::DeleteUnmatched => {
            let keep: BooleanArray = existing_keys
                .iter()
                .map(|k| Some(k.as_ref().is_some_and(|k| incoming_keys.contains(k))))
                .collect();
            let kept = filter_record_batch(existing, &keep)?;
            let deleted = existing.num_rows() - kept.num_rows();
            Ok((kept, count(deleted)))
        }
    }
}

fn count(n: usize) -> u64 {
    u64::try_from(n).unwrap_or(u64::MAX)
}

fn to_native(field: &Field) -> NativeColumn<DataType> {
    NativeColumn::new(field.name(), field.data_type().clone())
        .with_nullable(field.is_nullable())
        .with_unique(field.metadata().get(UNIQUE_KEY).is_some_and(|v| v == "true"))
}

fn to_field(column: &NativeColumn<DataType>) -> Field {
    let field = Field::new(&column.name, column.native.clone(), column.nullable);
    if column.unique {
        field.with_metadata(HashMap::from([(UNIQUE_KEY.to_string(), "true".to_string())]))
    } else {
        field
    }
}

impl TableStore for LocalTableStore {
    type Native = DataType;

    async fn list_tables(&self) -> StoreResult<Vec<String>> {
        let root = self.root.clone();
        blocking(move || {
            let entries = match fs::read_dir(&root) {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
                Err(e) => {
                    return Err(StoreError::Unavailable(format!(
                        "cannot list {}: {e}",
                        root.display()
                    )))
                }
            };
            let mut tables = Vec::new();
            for entry in entries {
                let entry = entry?;
                if entry.path().join(LATEST_FILE).is_file() {
                    if let Some(name) = entry.file_name().to_str() {
                        tables.push(name.to_string());
                    }
                }
            }
            tables.sort();
            Ok(tables)
        })
        .await
    }

    async fn describe_table(&self, table: &str) -> StoreResult<Option<Vec<NativeColumn<DataType>>>> {
        self.with_table(table, |dir, _| {
            Ok(read_latest(dir)?.map(|v| v.schema.fields().iter().map(|f| to_native(f)).collect()))
        })
        .await
    }

    async fn create_table(&self, table: &str, columns: &[NativeColumn<DataType>]) -> StoreResult<()> {
        let schema = Schema::new(columns.iter().map(to_field).collect::<Vec<_>>());
        self.with_table(table, move |dir, table| {
            if read_latest(dir)?.is_some() {
                return Err(StoreError::Conflict {
                    table: table.to_string(),
                    message: "table already exists".into(),
                });
            }
            fs::create_dir_all(dir.join(VERSIONS_DIR))?;
            fs::create_dir_all(dir.join(DATA_DIR))?;
            commit(dir, table, None, &schema, &[])?;
            Ok(())
        })
        .await
    }

    async fn add_columns(&self, table: &str, columns: &[NativeColumn<DataType>]) -> StoreResult<()> {
        let columns = columns.to_vec();
        self.with_table(table, move |dir, table| {
            let latest = require_latest(dir, table)?;
            let mut fields: Vec<Field> =
                latest.schema.fields().iter().map(|f| f.as_ref().clone()).collect();
            for column in &columns {
                if latest.schema.field_with_name(&column.name).is_err() {
                    fields.push(to_field(column).with_nullable(true));
                }
            }
            commit(dir, table, Some(latest.number), &Schema::new(fields), &latest.fragments)?;
            Ok(())
        })
        .await
    }

    async fn drop_table(&self, table: &str) -> StoreResult<()> {
        self.with_table(table, |dir, _| match fs::remove_dir_all(dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        })
        .await
    }

    async fn truncate_table(&self, table: &str) -> StoreResult<()> {
        self.with_table(table, |dir, table| {
            let latest = require_latest(dir, table)?;
            commit(dir, table, Some(latest.number), &latest.schema, &[])?;
            Ok(())
        })
        .await
    }

    async fn append(&self, table: &str, batch: &RecordBatch) -> StoreResult<u64> {
        let batch = batch.clone();
        self.with_table(table, move |dir, table| {
            let latest = require_latest(dir, table)?;
            let batch = conform(&batch, &latest.schema, table)?;
            if batch.num_rows() == 0 {
                return Ok(0);
            }
            let mut fragments = latest.fragments.clone();
            fragments.push(write_fragment(dir, table, &batch)?);
            commit(dir, table, Some(latest.number), &latest.schema, &fragments)?;
            Ok(count(batch.num_rows()))
        })
        .await
    }

    async fn overwrite(&self, table: &str, batch: &RecordBatch) -> StoreResult<u64> {
        let batch = batch.clone();
        self.with_table(table, move |dir, table| {
            let latest = require_latest(dir, table)?;
            let batch = conform(&batch, &latest.schema, table)?;
            let fragments = rewrite_fragments(dir, table, &batch)?;
            commit(dir, table, Some(latest.number), &latest.schema, &fragments)?;
            Ok(count(batch.num_rows()))
        })
        .await
    }

    async fn merge_insert(
        &self,
        table: &str,
        key: &str,
        batch: &RecordBatch,
        mode: MergeMode,
    ) -> StoreResult<u64> {
        let batch = batch.clone();
        let key = key.to_string();
        self.with_table(table, move |dir, table| {
            let latest = require_latest(dir, table)?;
            let incoming = match mode {
                MergeMode::Upsert => conform(&batch, &latest.schema, table)?,
                MergeMode::DeleteUnmatched => key_only(&batch, &latest.schema, &key, table)?,
            };
            let existing = scan(dir, &latest)?;
            let (rewritten, affected) = merged(&existing, &incoming, &key, mode, table)?;
            if affected == 0 {
                return Ok(0);
            }
            let fragments = rewrite_fragments(dir, table, &rewritten)?;
            commit(dir, table, Some(latest.number), &latest.schema, &fragments)?;
            Ok(affected)
        })
        .await
    }

    async fn select(&self, table: &str, filters: &[Filter]) -> StoreResult<Vec<Row>> {
        let filters = filters.to_vec();
        self.with_table(table, move |dir, table| {
            let latest = require_latest(dir, table)?;
            let rows = batch_to_rows(&scan(dir, &latest)?)
                .map_err(|e| StoreError::Invalid(format!("{e:#}")))?;
            Ok(rows
                .into_iter()
                .filter(|row| filters.iter().all(|f| f.matches(row)))
                .collect())
        })
        .await
    }
}
