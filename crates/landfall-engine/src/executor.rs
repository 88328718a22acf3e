//! Physical writes per write disposition, plus the derived id and vector columns.

use std::sync::Arc;

use arrow::array::{ArrayRef, FixedSizeListArray, Float32Array, StringArray};
use arrow::datatypes::{DataType, Field};
use arrow::record_batch::RecordBatch;
use uuid::Uuid;

use landfall_types::error::{DestinationError, Result};
use landfall_types::schema::WriteDisposition;

use crate::arrow_utils::{column_as_text, with_column};
use crate::embedding::EmbeddingProvider;
use crate::error::StoreResultExt;
use crate::store::{MergeMode, ReplaceMode, TableStore};

/// Fail unless `disposition` is one the executor can perform.
///
/// # Errors
///
/// Returns a terminal `config` error for unsupported dispositions.
pub fn check_disposition(disposition: &WriteDisposition) -> Result<()> {
    match disposition {
        WriteDisposition::Unsupported(name) => Err(unsupported(name)),
        _ => Ok(()),
    }
}

fn unsupported(name: &str) -> DestinationError {
    DestinationError::config(
        "UNSUPPORTED_DISPOSITION",
        format!("write disposition '{name}' is not supported"),
    )
    .with_disposition(name)
}

/// Writes one batch into one physical table.
pub struct WriteDispositionExecutor<'a, S> {
    store: &'a S,
}

impl<'a, S: TableStore> WriteDispositionExecutor<'a, S> {
    pub fn new(store: &'a S) -> Self {
        Self { store }
    }

    /// Write `batch` into `table` and return the number of affected rows.
    ///
    /// - `skip` / `append`: plain insert.
    /// - `replace`: by the store's [`ReplaceMode`]. Per-file stores overwrite
    ///   the table; the others append to the table emptied, or the staging
    ///   copy created, when the load was prepared.
    /// - `merge`: upsert keyed on `id_field`; with `remove_orphans` only the
    ///   stored rows whose key is absent from `batch` are deleted.
    ///
    /// # Errors
    ///
    /// Terminal `config` errors for unsupported dispositions or a merge
    /// without `id_field`; `data` errors when the key column is missing or
    /// values do not fit the stored types; transient errors when the store
    /// is unreachable. Nothing is written when validation fails.
    pub async fn write(
        &self,
        table: &str,
        batch: &RecordBatch,
        disposition: &WriteDisposition,
        id_field: Option<&str>,
        remove_orphans: bool,
    ) -> Result<u64> {
        let context = |e: DestinationError| e.with_table(table).with_disposition(disposition.as_str());

        let written = match disposition {
            WriteDisposition::Skip | WriteDisposition::Append => self
                .store
                .append(table, batch)
                .await
                .for_table(table)
                .map_err(context)?,
            WriteDisposition::Replace => {
                let written = match self.store.replace_mode() {
                    ReplaceMode::PerFile => self.store.overwrite(table, batch).await,
                    ReplaceMode::TruncateOnce => self.store.append(table, batch).await,
                    ReplaceMode::StagingSwap => self.store.append_staging(table, batch).await,
                };
                written.for_table(table).map_err(context)?
            }
            WriteDisposition::Merge => {
                let key = id_field.ok_or_else(|| {
                    context(DestinationError::config(
                        "MISSING_MERGE_KEY",
                        "merge disposition requires an id field",
                    ))
                })?;
                if batch.schema().field_with_name(key).is_err() {
                    return Err(context(DestinationError::data(
                        "MISSING_KEY_COLUMN",
                        format!("batch has no '{key}' column to merge on"),
                    )));
                }
                let mode = if remove_orphans {
                    MergeMode::DeleteUnmatched
                } else {
                    MergeMode::Upsert
                };
                self.store
                    .merge_insert(table, key, batch, mode)
                    .await
                    .for_table(table)
                    .map_err(context)?
            }
            WriteDisposition::Unsupported(name) => return Err(unsupported(name).with_table(table)),
        };

        tracing::debug!(
            table,
            disposition = %disposition,
            rows = batch.num_rows(),
            affected = written,
            "batch written"
        );
        Ok(written)
    }
}

/// Add a text id column derived from the row's unique identifiers.
///
/// Ids are UUIDv5 (namespace OID) of the identifier values concatenated with
/// the qualified table name, so rewriting the same row yields the same id.
/// Without identifiers every row gets a random UUIDv4.
///
/// # Errors
///
/// Returns a `data` error when an identifier column is missing from the batch.
pub fn add_id_column(
    batch: &RecordBatch,
    identifiers: &[&str],
    qualified_table: &str,
    id_field: &str,
) -> Result<RecordBatch> {
    let rows = batch.num_rows();
    let ids: Vec<String> = if identifiers.is_empty() {
        (0..rows).map(|_| Uuid::new_v4().to_string()).collect()
    } else {
        let mut keys = vec![String::new(); rows];
        for name in identifiers {
            let column = batch.column_by_name(name).ok_or_else(|| {
                DestinationError::data(
                    "MISSING_KEY_COLUMN",
                    format!("batch has no identifier column '{name}'"),
                )
                .with_table(qualified_table)
            })?;
            let values = column_as_text(column).map_err(|e| {
                DestinationError::data("TYPE_MISMATCH", e.to_string()).with_table(qualified_table)
            })?;
            for (key, value) in keys.iter_mut().zip(values) {
                key.push_str(value.as_deref().unwrap_or_default());
            }
        }
        keys.into_iter()
            .map(|mut key| {
                key.push_str(qualified_table);
                Uuid::new_v5(&Uuid::NAMESPACE_OID, key.as_bytes()).to_string()
            })
            .collect()
    };

    let array: ArrayRef = Arc::new(StringArray::from(ids));
    with_column(batch, Field::new(id_field, DataType::Utf8, false), array).map_err(|e| {
        DestinationError::internal("ARROW_ERROR", e.to_string()).with_table(qualified_table)
    })
}

/// Arrow type of an embedding vector column.
#[must_use]
pub fn vector_data_type(dimensions: usize) -> DataType {
    DataType::FixedSizeList(vector_item_field(), vector_width(dimensions))
}

fn vector_item_field() -> Arc<Field> {
    Arc::new(Field::new("item", DataType::Float32, true))
}

fn vector_width(dimensions: usize) -> i32 {
    i32::try_from(dimensions).unwrap_or(i32::MAX)
}

/// Add an embedding column computed from the text of `columns`.
///
/// Column values are joined with newlines. Nulls contribute empty strings;
/// columns absent from the batch are skipped.
///
/// # Errors
///
/// Fails when the provider fails or returns vectors of the wrong width.
pub async fn add_vector_column(
    batch: &RecordBatch,
    columns: &[&str],
    provider: &dyn EmbeddingProvider,
    vector_field: &str,
) -> Result<RecordBatch> {
    let rows = batch.num_rows();
    let mut texts: Vec<Vec<String>> = vec![Vec::with_capacity(columns.len()); rows];
    for name in columns {
        let Some(column) = batch.column_by_name(name) else {
            continue;
        };
        let values = column_as_text(column)
            .map_err(|e| DestinationError::data("TYPE_MISMATCH", e.to_string()))?;
        for (parts, value) in texts.iter_mut().zip(values) {
            parts.push(value.unwrap_or_default());
        }
    }
    let texts: Vec<String> = texts.into_iter().map(|parts| parts.join("\n")).collect();

    let dimensions = provider.dimension();
    let vectors = provider.embed_batch(&texts).await?;
    let mut flat = Vec::with_capacity(rows * dimensions);
    for vector in vectors {
        if vector.len() != dimensions {
            return Err(DestinationError::internal(
                "EMBEDDING_WIDTH_MISMATCH",
                format!(
                    "provider '{}' returned {} values, expected {dimensions}",
                    provider.model_name(),
                    vector.len()
                ),
            ));
        }
        flat.extend(vector);
    }

    let array = FixedSizeListArray::try_new(
        vector_item_field(),
        vector_width(dimensions),
        Arc::new(Float32Array::from(flat)),
        None,
    )
        .map_err(|e| DestinationError::internal("ARROW_ERROR", e.to_string()))?;
    with_column(
        batch,
        Field::new(vector_field, vector_data_type(dimensions), true),
        Arc::new(array),
    )
    .map_err(|e| DestinationError::internal("ARROW_ERROR", e.to_string()))
}
