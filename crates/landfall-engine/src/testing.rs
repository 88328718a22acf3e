//! In-memory [`TableStore`] and batch builders for unit tests.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use arrow::array::ArrayRef;
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use serde_json::Value;

use landfall_types::capabilities::DestinationCapabilities;
use landfall_types::error::{DestinationError, Result};
use landfall_types::schema::{ColumnDef, ColumnType, DataType as LogicalType};

use crate::arrow_utils::{arrow_type_for, batch_to_rows, cast_strict, rows_to_batch};
use crate::executor::vector_data_type;
use crate::store::{
    Filter, MergeMode, NativeColumn, ReplaceMode, Row, StoreError, StoreResult, TableStore,
};
use crate::type_mapper::TypeMapper;

/// Build a batch from `(column, json array)` pairs, inferring Arrow types.
pub(crate) fn batch(columns: &[(&str, Value)]) -> RecordBatch {
    let len = columns
        .first()
        .and_then(|(_, v)| v.as_array())
        .map_or(0, Vec::len);
    let fields: Vec<Field> = columns
        .iter()
        .map(|(name, values)| Field::new(*name, infer(values), true))
        .collect();
    let rows: Vec<Row> = (0..len)
        .map(|i| {
            columns
                .iter()
                .map(|(name, values)| ((*name).to_string(), values[i].clone()))
                .collect()
        })
        .collect();
    rows_to_batch(&rows, Arc::new(Schema::new(fields))).unwrap()
}

fn infer(values: &Value) -> DataType {
    let values = values.as_array().cloned().unwrap_or_default();
    if values.iter().any(Value::is_f64) {
        return DataType::Float64;
    }
    match values.iter().find(|v| !v.is_null()) {
        Some(Value::Number(_)) => DataType::Int64,
        Some(Value::Bool(_)) => DataType::Boolean,
        _ => DataType::Utf8,
    }
}

/// Maps logical columns to the Arrow types the engine uses for batches.
pub(crate) struct ArrowMapper {
    caps: DestinationCapabilities,
}

impl ArrowMapper {
    pub(crate) fn new(caps: DestinationCapabilities) -> Self {
        Self { caps }
    }
}

impl TypeMapper for ArrowMapper {
    type Native = DataType;

    fn capabilities(&self) -> &DestinationCapabilities {
        &self.caps
    }

    fn to_destination_type(&self, column: &ColumnDef) -> Result<DataType> {
        arrow_type_for(column, &self.caps)
            .map_err(|e| DestinationError::schema("UNSUPPORTED_TYPE", e.to_string()))
    }

    fn from_destination_type(&self, native: &DataType) -> Result<ColumnType> {
        let data_type = match native {
            DataType::Int64 => LogicalType::Bigint,
            DataType::Float64 => LogicalType::Double,
            DataType::Boolean => LogicalType::Bool,
            DataType::Timestamp(_, _) => LogicalType::Timestamp,
            DataType::Utf8 => LogicalType::Text,
            other => {
                return Err(DestinationError::schema(
                    "UNSUPPORTED_TYPE",
                    format!("no logical type for {other}"),
                ))
            }
        };
        Ok(ColumnType::new(data_type))
    }

    fn vector_type(&self, dimensions: usize) -> Option<DataType> {
        Some(vector_data_type(dimensions))
    }
}

struct MemTable {
    columns: Vec<NativeColumn<DataType>>,
    rows: Vec<Row>,
}

/// Row-oriented store that checks column names and types like a real one.
#[derive(Default)]
pub(crate) struct MemoryStore {
    tables: Mutex<BTreeMap<String, MemTable>>,
    staging: Mutex<BTreeMap<String, Vec<Row>>>,
    replace_mode: ReplaceMode,
    writes: AtomicUsize,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub(crate) fn with_table(name: &str, columns: &[(&str, DataType)]) -> Self {
        let store = Self::default();
        store.tables.lock().unwrap().insert(
            name.to_string(),
            MemTable {
                columns: columns
                    .iter()
                    .map(|(n, t)| NativeColumn::new(*n, t.clone()))
                    .collect(),
                rows: Vec::new(),
            },
        );
        store
    }

    pub(crate) fn with_replace_mode(mut self, mode: ReplaceMode) -> Self {
        self.replace_mode = mode;
        self
    }

    pub(crate) fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub(crate) fn rows(&self, table: &str) -> Vec<Row> {
        self.tables
            .lock()
            .unwrap()
            .get(table)
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }

    pub(crate) fn row_count(&self, table: &str) -> usize {
        self.rows(table).len()
    }

    pub(crate) fn write_calls(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> StoreResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store offline".into()));
        }
        Ok(())
    }

    /// Validate `batch` against the table and return it as rows.
    fn conform(&self, table: &str, batch: &RecordBatch) -> StoreResult<Vec<Row>> {
        self.check_available()?;
        let tables = self.tables.lock().map_err(|_| StoreError::LockPoisoned)?;
        let stored = tables
            .get(table)
            .ok_or_else(|| StoreError::TableNotFound(table.to_string()))?;
        let mut fields = Vec::new();
        let mut arrays: Vec<ArrayRef> = Vec::new();
        for (field, array) in batch.schema().fields().iter().zip(batch.columns()) {
            let column = stored
                .columns
                .iter()
                .find(|c| c.name == *field.name())
                .ok_or_else(|| StoreError::UnknownColumn {
                    table: table.to_string(),
                    column: field.name().clone(),
                })?;
            let cast = cast_strict(array, &column.native).map_err(|e| StoreError::TypeMismatch {
                table: table.to_string(),
                message: format!("column '{}': {e}", field.name()),
            })?;
            fields.push(Field::new(field.name(), column.native.clone(), true));
            arrays.push(cast);
        }
        let conformed = RecordBatch::try_new(Arc::new(Schema::new(fields)), arrays)?;
        batch_to_rows(&conformed).map_err(|e| StoreError::Invalid(e.to_string()))
    }

    fn with_rows<T>(&self, table: &str, f: impl FnOnce(&mut Vec<Row>) -> T) -> StoreResult<T> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        let mut tables = self.tables.lock().map_err(|_| StoreError::LockPoisoned)?;
        let stored = tables
            .get_mut(table)
            .ok_or_else(|| StoreError::TableNotFound(table.to_string()))?;
        Ok(f(&mut stored.rows))
    }
}

fn count(n: usize) -> u64 {
    u64::try_from(n).unwrap_or(u64::MAX)
}

impl TableStore for MemoryStore {
    type Native = DataType;

    async fn list_tables(&self) -> StoreResult<Vec<String>> {
        self.check_available()?;
        Ok(self.tables.lock().unwrap().keys().cloned().collect())
    }

    async fn describe_table(&self, table: &str) -> StoreResult<Option<Vec<NativeColumn<DataType>>>> {
        self.check_available()?;
        Ok(self
            .tables
            .lock()
            .unwrap()
            .get(table)
            .map(|t| t.columns.clone()))
    }

    async fn create_table(&self, table: &str, columns: &[NativeColumn<DataType>]) -> StoreResult<()> {
        self.check_available()?;
        let mut tables = self.tables.lock().unwrap();
        if tables.contains_key(table) {
            return Err(StoreError::Conflict {
                table: table.to_string(),
                message: "table already exists".into(),
            });
        }
        tables.insert(
            table.to_string(),
            MemTable {
                columns: columns.to_vec(),
                rows: Vec::new(),
            },
        );
        Ok(())
    }

    async fn add_columns(&self, table: &str, columns: &[NativeColumn<DataType>]) -> StoreResult<()> {
        self.check_available()?;
        let mut tables = self.tables.lock().unwrap();
        let stored = tables
            .get_mut(table)
            .ok_or_else(|| StoreError::TableNotFound(table.to_string()))?;
        for column in columns {
            if !stored.columns.iter().any(|c| c.name == column.name) {
                stored.columns.push(column.clone());
            }
        }
        Ok(())
    }

    async fn drop_table(&self, table: &str) -> StoreResult<()> {
        self.check_available()?;
        self.tables.lock().unwrap().remove(table);
        Ok(())
    }

    async fn truncate_table(&self, table: &str) -> StoreResult<()> {
        self.check_available()?;
        self.with_rows(table, Vec::clear)
    }

    async fn append(&self, table: &str, batch: &RecordBatch) -> StoreResult<u64> {
        let rows = self.conform(table, batch)?;
        self.with_rows(table, |stored| {
            let n = rows.len();
            stored.extend(rows);
            count(n)
        })
    }

    async fn overwrite(&self, table: &str, batch: &RecordBatch) -> StoreResult<u64> {
        let rows = self.conform(table, batch)?;
        self.with_rows(table, |stored| {
            let n = rows.len();
            *stored = rows;
            count(n)
        })
    }

    async fn merge_insert(
        &self,
        table: &str,
        key: &str,
        batch: &RecordBatch,
        mode: MergeMode,
    ) -> StoreResult<u64> {
        let rows = self.conform(table, batch)?;
        self.with_rows(table, |stored| match mode {
            MergeMode::Upsert => {
                for row in &rows {
                    let position = stored
                        .iter()
                        .position(|s| s.get(key).is_some() && s.get(key) == row.get(key));
                    match position {
                        Some(i) => stored[i].extend(row.clone()),
                        None => stored.push(row.clone()),
                    }
                }
                count(rows.len())
            }
            MergeMode::DeleteUnmatched => {
                let keep: Vec<&Value> = rows.iter().filter_map(|r| r.get(key)).collect();
                let before = stored.len();
                stored.retain(|s| s.get(key).is_some_and(|k| keep.contains(&k)));
                count(before - stored.len())
            }
        })
    }

    async fn select(&self, table: &str, filters: &[Filter]) -> StoreResult<Vec<Row>> {
        self.check_available()?;
        let tables = self.tables.lock().unwrap();
        let stored = tables
            .get(table)
            .ok_or_else(|| StoreError::TableNotFound(table.to_string()))?;
        Ok(stored
            .rows
            .iter()
            .filter(|row| filters.iter().all(|f| f.matches(row)))
            .cloned()
            .collect())
    }

    fn replace_mode(&self) -> ReplaceMode {
        self.replace_mode
    }

    async fn prepare_staging(&self, table: &str) -> StoreResult<()> {
        self.check_available()?;
        if !self.tables.lock().unwrap().contains_key(table) {
            return Err(StoreError::TableNotFound(table.to_string()));
        }
        self.staging.lock().unwrap().insert(table.to_string(), Vec::new());
        Ok(())
    }

    async fn append_staging(&self, table: &str, batch: &RecordBatch) -> StoreResult<u64> {
        let rows = self.conform(table, batch)?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        let mut staging = self.staging.lock().map_err(|_| StoreError::LockPoisoned)?;
        let staged = staging
            .get_mut(table)
            .ok_or_else(|| StoreError::Invalid(format!("no staging copy of '{table}'")))?;
        let n = rows.len();
        staged.extend(rows);
        Ok(count(n))
    }

    async fn swap_staging(&self, table: &str) -> StoreResult<bool> {
        self.check_available()?;
        let Some(staged) = self.staging.lock().unwrap().remove(table) else {
            return Ok(false);
        };
        self.with_rows(table, |stored| *stored = staged)?;
        Ok(true)
    }
}
