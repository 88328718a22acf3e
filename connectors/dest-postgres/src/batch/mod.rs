//! Arrow batch writes: conforming a batch to the table, then INSERT or COPY.

mod copy;
mod copy_format;
mod insert;
mod typed_col;

use std::collections::HashMap;

use arrow::array::Array;
use arrow::record_batch::RecordBatch;

use landfall_engine::arrow_utils::column_as_text;
use landfall_engine::{NativeColumn, StoreError};

use crate::type_map::PgType;

pub(crate) use self::copy::copy_batch;
pub(crate) use self::insert::insert_batch;

/// Maximum rows per multi-value INSERT statement.
pub(crate) const INSERT_CHUNK_SIZE: usize = 1000;

/// Bind parameters the wire protocol allows per statement.
pub(crate) const MAX_BIND_PARAMS: usize = 65_535;

/// Default COPY flush buffer size.
pub(crate) const DEFAULT_COPY_FLUSH_BYTES: usize = 4 * 1024 * 1024;

/// Column type of every batch column, in batch order.
///
/// # Errors
///
/// [`StoreError::UnknownColumn`] for a batch column the table lacks, and
/// [`StoreError::TypeMismatch`] for nulls bound for a `NOT NULL` column.
pub(crate) fn conform(
    table: &str,
    columns: &[NativeColumn<PgType>],
    batch: &RecordBatch,
) -> Result<Vec<PgType>, StoreError> {
    let by_name: HashMap<&str, &NativeColumn<PgType>> =
        columns.iter().map(|c| (c.name.as_str(), c)).collect();
    let schema = batch.schema();
    schema
        .fields()
        .iter()
        .zip(batch.columns())
        .map(|(field, array)| {
            let column = by_name.get(field.name().as_str()).ok_or_else(|| {
                StoreError::UnknownColumn {
                    table: table.to_string(),
                    column: field.name().clone(),
                }
            })?;
            if !column.nullable && array.null_count() > 0 {
                return Err(StoreError::TypeMismatch {
                    table: table.to_string(),
                    message: format!(
                        "{} null value(s) for NOT NULL column '{}'",
                        array.null_count(),
                        column.name
                    ),
                });
            }
            Ok(column.native.clone())
        })
        .collect()
}

/// Text of every non-null value in the `key` column.
pub(crate) fn key_values(table: &str, key: &str, batch: &RecordBatch) -> Result<Vec<String>, StoreError> {
    let array = batch.column_by_name(key).ok_or_else(|| {
        StoreError::Invalid(format!("merge key '{key}' is not a column of the batch for '{table}'"))
    })?;
    Ok(column_as_text(array)?.into_iter().flatten().collect())
}
