//! CSV `COPY ... FROM STDIN` write path.

use arrow::record_batch::RecordBatch;
use bytes::Bytes;
use futures_util::SinkExt;
use pg_escape::quote_identifier;
use tokio_postgres::Transaction;

use landfall_engine::{NativeColumn, StoreError};

use crate::batch::copy_format::format_csv_field;
use crate::batch::typed_col::downcast_columns;
use crate::error::store_error;
use crate::type_map::PgType;

/// Columns named in one COPY statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct CopyColumns {
    /// Batch columns, in batch order.
    pub(crate) columns: Vec<String>,
    /// Nullable columns among them; an empty quoted field loads as NULL.
    pub(crate) force_null: Vec<String>,
}

/// Match the batch header against the stored columns of `table`.
///
/// # Errors
///
/// [`StoreError::Invalid`] when the table has a geometry column, and
/// [`StoreError::UnknownColumn`] naming every batch column the table lacks.
pub(crate) fn copy_columns(
    table: &str,
    table_columns: &[NativeColumn<PgType>],
    batch: &RecordBatch,
) -> Result<CopyColumns, StoreError> {
    if let Some(geometry) = table_columns.iter().find(|c| c.native.is_geometry()) {
        return Err(StoreError::Invalid(format!(
            "CSV bulk load is not supported for tables with geometry columns \
             ('{table}' has geometry column '{}')",
            geometry.name
        )));
    }

    let schema = batch.schema();
    let mut columns = Vec::with_capacity(schema.fields().len());
    let mut force_null = Vec::new();
    let mut unknown = Vec::new();
    for field in schema.fields() {
        match table_columns.iter().find(|c| c.name == *field.name()) {
            Some(column) => {
                if column.nullable {
                    force_null.push(column.name.clone());
                }
                columns.push(column.name.clone());
            }
            None => unknown.push(field.name().as_str()),
        }
    }
    if !unknown.is_empty() {
        return Err(StoreError::UnknownColumn {
            table: table.to_string(),
            column: unknown.join(", "),
        });
    }
    Ok(CopyColumns { columns, force_null })
}

fn quoted_list(names: &[String]) -> String {
    names
        .iter()
        .map(|name| quote_identifier(name))
        .collect::<Vec<_>>()
        .join(", ")
}

/// `COPY <table> (<columns>) FROM STDIN` in CSV with empty-field nulls.
pub(crate) fn copy_statement(qualified_table: &str, plan: &CopyColumns) -> String {
    let force_null = if plan.force_null.is_empty() {
        String::new()
    } else {
        format!(", FORCE_NULL ({})", quoted_list(&plan.force_null))
    };
    format!(
        "COPY {qualified_table} ({}) FROM STDIN WITH (FORMAT csv, DELIMITER ',', NULL ''{force_null}, ENCODING 'UTF8')",
        quoted_list(&plan.columns)
    )
}

/// Stream `batch` into `qualified_table` and return rows written.
///
/// Buffered CSV is sent every `flush_bytes`; the COPY is part of `tx`.
pub(crate) async fn copy_batch(
    tx: &Transaction<'_>,
    table: &str,
    qualified_table: &str,
    batch: &RecordBatch,
    table_columns: &[NativeColumn<PgType>],
    flush_bytes: usize,
) -> Result<u64, StoreError> {
    let plan = copy_columns(table, table_columns, batch)?;
    if batch.num_rows() == 0 {
        return Ok(0);
    }
    if plan.columns.is_empty() {
        return Err(StoreError::Invalid(format!(
            "batch for '{table}' has {} rows but no columns",
            batch.num_rows()
        )));
    }

    let typed_cols = downcast_columns(batch.columns())?;
    let statement = copy_statement(qualified_table, &plan);
    let sink = tx
        .copy_in::<_, Bytes>(statement.as_str())
        .await
        .map_err(|e| store_error(table, &format!("COPY start failed for {table}"), &e))?;
    let mut sink = Box::pin(sink);

    let flush_bytes = flush_bytes.max(1);
    let mut buf = Vec::with_capacity(flush_bytes);
    for row_idx in 0..batch.num_rows() {
        for (pos, typed_col) in typed_cols.iter().enumerate() {
            if pos > 0 {
                buf.push(b',');
            }
            format_csv_field(&mut buf, typed_col, row_idx);
        }
        buf.push(b'\n');

        if buf.len() >= flush_bytes {
            sink.send(Bytes::from(std::mem::take(&mut buf)))
                .await
                .map_err(|e| store_error(table, &format!("COPY send failed for {table}"), &e))?;
            buf = Vec::with_capacity(flush_bytes);
        }
    }
    if !buf.is_empty() {
        sink.send(Bytes::from(buf))
            .await
            .map_err(|e| store_error(table, &format!("COPY send failed for {table}"), &e))?;
    }

    let written = sink
        .as_mut()
        .finish()
        .await
        .map_err(|e| store_error(table, &format!("COPY failed for {table}"), &e))?;
    tracing::debug!(table = %qualified_table, rows = written, "rows copied");
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use arrow::array::{ArrayRef, Int64Array, StringArray};
    use arrow::datatypes::{DataType, Field, Schema};

    fn orders() -> Vec<NativeColumn<PgType>> {
        vec![
            NativeColumn::new("id", PgType::Bigint).with_nullable(false),
            NativeColumn::new("note", PgType::Varchar(None)),
            NativeColumn::new("placed at", PgType::Timestamptz(6)),
        ]
    }

    fn batch(names: &[&str]) -> RecordBatch {
        let fields: Vec<Field> = names
            .iter()
            .map(|name| {
                if *name == "id" {
                    Field::new(*name, DataType::Int64, false)
                } else {
                    Field::new(*name, DataType::Utf8, true)
                }
            })
            .collect();
        let columns: Vec<ArrayRef> = names
            .iter()
            .map(|name| -> ArrayRef {
                if *name == "id" {
                    Arc::new(Int64Array::from(vec![1]))
                } else {
                    Arc::new(StringArray::from(vec![Some("x")]))
                }
            })
            .collect();
        RecordBatch::try_new(Arc::new(Schema::new(fields)), columns).unwrap()
    }

    #[test]
    fn header_follows_batch_and_nullable_columns_force_null() {
        let plan = copy_columns("orders", &orders(), &batch(&["note", "id"])).unwrap();
        assert_eq!(plan.columns, vec!["note".to_string(), "id".to_string()]);
        assert_eq!(plan.force_null, vec!["note".to_string()]);
        assert_eq!(
            copy_statement("shop.orders", &plan),
            "COPY shop.orders (note, id) FROM STDIN WITH \
             (FORMAT csv, DELIMITER ',', NULL '', FORCE_NULL (note), ENCODING 'UTF8')"
        );
    }

    #[test]
    fn statement_quotes_identifiers_and_skips_empty_force_null() {
        let plan = CopyColumns {
            columns: vec!["id".into(), "placed at".into()],
            force_null: Vec::new(),
        };
        assert_eq!(
            copy_statement("shop.orders", &plan),
            "COPY shop.orders (id, \"placed at\") FROM STDIN WITH \
             (FORMAT csv, DELIMITER ',', NULL '', ENCODING 'UTF8')"
        );
    }

    #[test]
    fn unmatched_headers_are_all_named() {
        let err = copy_columns("orders", &orders(), &batch(&["id", "color", "size"])).unwrap_err();
        assert!(
            matches!(err, StoreError::UnknownColumn { ref column, .. } if column == "color, size"),
            "{err}"
        );
    }

    #[test]
    fn geometry_tables_cannot_be_bulk_loaded() {
        let mut columns = orders();
        columns.push(NativeColumn::new("shape", PgType::Geometry { srid: 4326 }));
        let err = copy_columns("places", &columns, &batch(&["id"])).unwrap_err();
        assert!(matches!(err, StoreError::Invalid(ref m) if m.contains("geometry")), "{err}");
        assert!(!err.is_transient());
    }
}
