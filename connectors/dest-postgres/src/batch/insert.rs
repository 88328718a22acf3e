//! Multi-value INSERT write path.

use std::fmt::Write as _;

use arrow::record_batch::RecordBatch;
use pg_escape::quote_identifier;
use tokio_postgres::types::ToSql;
use tokio_postgres::GenericClient;

use landfall_engine::StoreError;

use crate::batch::typed_col::{downcast_columns, sql_param_value, SqlParamValue, TypedCol};
use crate::batch::{INSERT_CHUNK_SIZE, MAX_BIND_PARAMS};
use crate::error::store_error;
use crate::geometry;
use crate::type_map::PgType;

/// How one bound parameter becomes a value of its target column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ValueExpr {
    /// `CAST($n::<param type> AS <column type>)`
    Cast {
        param_type: &'static str,
        target: String,
    },
    /// PostGIS constructor for a geometry column.
    Geometry { binary: bool, srid: u32 },
}

impl ValueExpr {
    pub(crate) fn for_column(
        table: &str,
        name: &str,
        typed: &TypedCol<'_>,
        target: &PgType,
    ) -> Result<Self, StoreError> {
        match target {
            PgType::Geometry { srid } => {
                if typed.is_binary() || typed.is_text() {
                    Ok(Self::Geometry {
                        binary: typed.is_binary(),
                        srid: *srid,
                    })
                } else {
                    Err(StoreError::TypeMismatch {
                        table: table.to_string(),
                        message: format!(
                            "geometry column '{name}' needs WKB bytes, hex WKB or WKT, got {}",
                            typed.param_type()
                        ),
                    })
                }
            }
            other => Ok(Self::Cast {
                param_type: typed.param_type(),
                target: other.to_string(),
            }),
        }
    }

    pub(crate) fn render(&self, param: &str) -> String {
        match self {
            Self::Cast { param_type, target } => format!("CAST({param}::{param_type} AS {target})"),
            Self::Geometry { binary, srid } => {
                // Only binary and text parameters reach this variant.
                geometry::constructor(param, *binary, !*binary, *srid).unwrap_or_default()
            }
        }
    }
}

/// `INSERT INTO <table> (<columns>) VALUES (...), (...)` for `rows` rows.
pub(crate) fn build_insert_sql(
    qualified_table: &str,
    column_names: &[&str],
    exprs: &[ValueExpr],
    rows: usize,
) -> String {
    let col_list = column_names
        .iter()
        .map(|name| quote_identifier(name))
        .collect::<Vec<_>>()
        .join(", ");
    let header = format!("INSERT INTO {qualified_table} ({col_list}) VALUES ");
    let mut sql = String::with_capacity(header.len() + rows * exprs.len() * 24);
    sql.push_str(&header);

    let mut param = 0_usize;
    for row in 0..rows {
        if row > 0 {
            sql.push_str(", ");
        }
        sql.push('(');
        for (pos, expr) in exprs.iter().enumerate() {
            if pos > 0 {
                sql.push_str(", ");
            }
            param += 1;
            let _ = write!(sql, "{}", expr.render(&format!("${param}")));
        }
        sql.push(')');
    }
    sql
}

/// Write `batch` via multi-value INSERT and return rows written.
///
/// `targets` holds the column type of each batch column, in batch order.
pub(crate) async fn insert_batch<C: GenericClient>(
    client: &C,
    table: &str,
    qualified_table: &str,
    batch: &RecordBatch,
    targets: &[PgType],
) -> Result<u64, StoreError> {
    let num_rows = batch.num_rows();
    if num_rows == 0 {
        return Ok(0);
    }
    let schema = batch.schema();
    if schema.fields().is_empty() {
        return Err(StoreError::Invalid(format!(
            "batch for '{table}' has {num_rows} rows but no columns"
        )));
    }

    let typed_cols = downcast_columns(batch.columns())?;
    let column_names: Vec<&str> = schema.fields().iter().map(|f| f.name().as_str()).collect();
    let exprs = typed_cols
        .iter()
        .zip(targets)
        .zip(&column_names)
        .map(|((typed, target), name)| ValueExpr::for_column(table, name, typed, target))
        .collect::<Result<Vec<_>, _>>()?;

    let chunk_rows = (MAX_BIND_PARAMS / typed_cols.len()).clamp(1, INSERT_CHUNK_SIZE);
    let mut total_rows: u64 = 0;

    for chunk_start in (0..num_rows).step_by(chunk_rows) {
        let chunk_end = (chunk_start + chunk_rows).min(num_rows);
        let chunk_size = chunk_end - chunk_start;
        let sql = build_insert_sql(qualified_table, &column_names, &exprs, chunk_size);

        let mut params: Vec<SqlParamValue<'_>> =
            Vec::with_capacity(chunk_size.saturating_mul(typed_cols.len()));
        for row_idx in chunk_start..chunk_end {
            for typed_col in &typed_cols {
                params.push(sql_param_value(typed_col, row_idx));
            }
        }
        let param_refs: Vec<&(dyn ToSql + Sync)> =
            params.iter().map(SqlParamValue::as_tosql).collect();

        client.execute(sql.as_str(), &param_refs).await.map_err(|e| {
            store_error(
                table,
                &format!("Multi-value INSERT failed for {table}, rows {chunk_start}-{chunk_end}"),
                &e,
            )
        })?;

        total_rows += chunk_size as u64;
    }

    tracing::debug!(table = %qualified_table, rows = total_rows, "rows inserted");
    Ok(total_rows)
}
