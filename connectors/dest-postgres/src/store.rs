//! [`TableStore`] over one PostgreSQL connection.
//!
//! Every table lives in the dataset schema; physical names handed in by the
//! engine are bare table names and are qualified here. Writes run inside a
//! transaction so a failed batch leaves nothing behind. Staging copies for
//! `staging-optimized` replaces live in the staging schema under the same
//! table name.

use std::fmt::Write as _;

use arrow::record_batch::RecordBatch;
use pg_escape::quote_identifier;
use tokio::sync::Mutex;
use tokio_postgres::types::ToSql;
use tokio_postgres::{Client, Transaction};

use landfall_engine::store::{Filter, ReplaceMode, Row};
use landfall_engine::{MergeMode, NativeColumn, StoreError, StoreResult, TableStore};

use crate::batch::{conform, copy_batch, insert_batch, key_values, DEFAULT_COPY_FLUSH_BYTES};
use crate::config::{LoadMethod, PostgresConfig, ReplaceStrategy};
use crate::ddl::introspect::{get_existing_columns, list_tables};
use crate::ddl::{self, qualified_name};
use crate::error::store_error;
use crate::type_map::PgType;

pub struct PostgresTableStore {
    client: Mutex<Client>,
    schema: String,
    staging_schema: String,
    replace_strategy: ReplaceStrategy,
    load_method: LoadMethod,
    copy_flush_bytes: usize,
    create_indexes: bool,
}

impl PostgresTableStore {
    /// Connect with `config` and scope the store to its dataset schema.
    ///
    /// # Errors
    ///
    /// [`StoreError::Unavailable`] when the server cannot be reached within
    /// the connect timeout.
    pub async fn connect(config: &PostgresConfig) -> StoreResult<Self> {
        let client = crate::client::connect(config).await?;
        Ok(Self {
            client: Mutex::new(client),
            schema: config.dataset_name.clone(),
            staging_schema: config.staging_schema(),
            replace_strategy: config.replace_strategy,
            load_method: config.load_method,
            copy_flush_bytes: config.copy_flush_bytes.unwrap_or(DEFAULT_COPY_FLUSH_BYTES),
            create_indexes: config.create_indexes,
        })
    }

    /// Schema holding the dataset's tables.
    #[must_use]
    pub fn schema_name(&self) -> &str {
        &self.schema
    }

    #[must_use]
    pub fn replace_strategy(&self) -> ReplaceStrategy {
        self.replace_strategy
    }

    fn qualified(&self, table: &str) -> String {
        qualified_name(&self.schema, table)
    }

    async fn require_columns(
        &self,
        client: &Client,
        table: &str,
    ) -> StoreResult<Vec<NativeColumn<PgType>>> {
        get_existing_columns(client, &self.schema, table)
            .await?
            .ok_or_else(|| StoreError::TableNotFound(table.to_string()))
    }

    /// Write `batch` into `qualified_target` with the configured load method.
    async fn write_rows(
        &self,
        tx: &Transaction<'_>,
        table: &str,
        qualified_target: &str,
        batch: &RecordBatch,
        columns: &[NativeColumn<PgType>],
        targets: &[PgType],
    ) -> StoreResult<u64> {
        match self.load_method {
            LoadMethod::Insert => insert_batch(tx, table, qualified_target, batch, targets).await,
            LoadMethod::Copy => {
                copy_batch(tx, table, qualified_target, batch, columns, self.copy_flush_bytes).await
            }
        }
    }

    /// Write `batch` into `qualified_target` in a transaction of its own.
    async fn write_committed(
        &self,
        client: &mut Client,
        table: &str,
        qualified_target: &str,
        batch: &RecordBatch,
        columns: &[NativeColumn<PgType>],
    ) -> StoreResult<u64> {
        let targets = conform(table, columns, batch)?;
        let tx = client
            .transaction()
            .await
            .map_err(|e| store_error(table, "Failed to begin write transaction", &e))?;
        let written = self
            .write_rows(&tx, table, qualified_target, batch, columns, &targets)
            .await?;
        tx.commit()
            .await
            .map_err(|e| store_error(table, "Failed to commit write transaction", &e))?;
        Ok(written)
    }

    async fn truncate_and_insert(
        &self,
        client: &mut Client,
        table: &str,
        batch: &RecordBatch,
        columns: &[NativeColumn<PgType>],
    ) -> StoreResult<u64> {
        let targets = conform(table, columns, batch)?;
        let qualified_table = self.qualified(table);
        let tx = client
            .transaction()
            .await
            .map_err(|e| store_error(table, "Failed to begin replace transaction", &e))?;
        tx.batch_execute(&format!("TRUNCATE TABLE {qualified_table}"))
            .await
            .map_err(|e| store_error(table, &format!("TRUNCATE {qualified_table} failed"), &e))?;
        let written = self
            .write_rows(&tx, table, &qualified_table, batch, columns, &targets)
            .await?;
        tx.commit()
            .await
            .map_err(|e| store_error(table, "Failed to commit replace transaction", &e))?;
        Ok(written)
    }

    async fn replace_through_staging(
        &self,
        client: &mut Client,
        table: &str,
        batch: &RecordBatch,
        columns: &[NativeColumn<PgType>],
    ) -> StoreResult<u64> {
        let staging_table =
            ddl::prepare_staging(client, &self.schema, &self.staging_schema, table).await?;
        let written = match self.write_committed(client, table, &staging_table, batch, columns).await {
            Ok(written) => written,
            Err(err) => {
                if let Err(cleanup) = ddl::drop_staging_table(client, &self.staging_schema, table).await {
                    tracing::warn!(table = %table, error = %cleanup, "staging cleanup failed");
                }
                return Err(err);
            }
        };
        ddl::swap_staging_table(client, &self.schema, &self.staging_schema, table).await?;
        Ok(written)
    }
}

/// ` WHERE ...` for `filters` and its text parameters, in order.
///
/// Strings compare as text, numbers numerically, JSON values as `jsonb`;
/// a null filter matches SQL `NULL`.
fn where_clause(filters: &[Filter]) -> (String, Vec<String>) {
    let mut sql = String::new();
    let mut params = Vec::new();
    for filter in filters {
        sql.push_str(if sql.is_empty() { " WHERE " } else { " AND " });
        let column = quote_identifier(&filter.column);
        let param = params.len() + 1;
        match &filter.value {
            serde_json::Value::Null => {
                let _ = write!(sql, "{column} IS NULL");
            }
            serde_json::Value::String(value) => {
                let _ = write!(sql, "{column}::text = ${param}");
                params.push(value.clone());
            }
            serde_json::Value::Bool(value) => {
                let _ = write!(sql, "{column}::text = ${param}");
                params.push(value.to_string());
            }
            serde_json::Value::Number(value) => {
                let _ = write!(sql, "{column}::numeric = ${param}::text::numeric");
                params.push(value.to_string());
            }
            other => {
                let _ = write!(sql, "{column}::jsonb = ${param}::text::jsonb");
                params.push(other.to_string());
            }
        }
    }
    (sql, params)
}

impl TableStore for PostgresTableStore {
    type Native = PgType;

    async fn list_tables(&self) -> StoreResult<Vec<String>> {
        let client = self.client.lock().await;
        list_tables(&*client, &self.schema).await
    }

    async fn describe_table(&self, table: &str) -> StoreResult<Option<Vec<NativeColumn<PgType>>>> {
        let client = self.client.lock().await;
        get_existing_columns(&*client, &self.schema, table).await
    }

    async fn create_table(&self, table: &str, columns: &[NativeColumn<PgType>]) -> StoreResult<()> {
        let mut client = self.client.lock().await;
        ddl::ensure_table(&mut client, &self.schema, table, columns, self.create_indexes).await
    }

    async fn add_columns(&self, table: &str, columns: &[NativeColumn<PgType>]) -> StoreResult<()> {
        let mut client = self.client.lock().await;
        if get_existing_columns(&*client, &self.schema, table).await?.is_none() {
            return Err(StoreError::TableNotFound(table.to_string()));
        }
        ddl::add_columns(&mut client, &self.schema, table, columns).await
    }

    async fn drop_table(&self, table: &str) -> StoreResult<()> {
        let client = self.client.lock().await;
        let qualified_table = self.qualified(table);
        client
            .batch_execute(&format!("DROP TABLE IF EXISTS {qualified_table} CASCADE"))
            .await
            .map_err(|e| store_error(table, &format!("DROP {qualified_table} failed"), &e))?;
        tracing::debug!(table = %qualified_table, "table dropped");
        Ok(())
    }

    async fn truncate_table(&self, table: &str) -> StoreResult<()> {
        let client = self.client.lock().await;
        let qualified_table = self.qualified(table);
        client
            .batch_execute(&format!("TRUNCATE TABLE {qualified_table}"))
            .await
            .map_err(|e| store_error(table, &format!("TRUNCATE {qualified_table} failed"), &e))
    }

    async fn append(&self, table: &str, batch: &RecordBatch) -> StoreResult<u64> {
        let mut client = self.client.lock().await;
        let columns = self.require_columns(&client, table).await?;
        let qualified_table = self.qualified(table);
        self.write_committed(&mut client, table, &qualified_table, batch, &columns)
            .await
    }

    async fn overwrite(&self, table: &str, batch: &RecordBatch) -> StoreResult<u64> {
        let mut client = self.client.lock().await;
        let columns = self.require_columns(&client, table).await?;
        let written = match self.replace_strategy {
            ReplaceStrategy::TruncateAndInsert => {
                self.truncate_and_insert(&mut client, table, batch, &columns).await?
            }
            ReplaceStrategy::StagingOptimized => {
                self.replace_through_staging(&mut client, table, batch, &columns).await?
            }
        };
        tracing::debug!(
            table = %table,
            rows = written,
            strategy = %self.replace_strategy,
            "table replaced"
        );
        Ok(written)
    }

    async fn merge_insert(
        &self,
        table: &str,
        key: &str,
        batch: &RecordBatch,
        mode: MergeMode,
    ) -> StoreResult<u64> {
        let mut client = self.client.lock().await;
        let columns = self.require_columns(&client, table).await?;
        if !columns.iter().any(|c| c.name == key) {
            return Err(StoreError::Invalid(format!(
                "merge key '{key}' is not a column of '{table}'"
            )));
        }
        let keys = key_values(table, key, batch)?;
        let qualified_table = self.qualified(table);
        let key_column = quote_identifier(key);

        let tx = client
            .transaction()
            .await
            .map_err(|e| store_error(table, "Failed to begin merge transaction", &e))?;
        let affected = match mode {
            MergeMode::Upsert => {
                let targets = conform(table, &columns, batch)?;
                let sql = format!(
                    "DELETE FROM {qualified_table} WHERE {key_column}::text = ANY($1::text[])"
                );
                tx.execute(sql.as_str(), &[&keys])
                    .await
                    .map_err(|e| store_error(table, "Merge DELETE of matched rows failed", &e))?;
                self.write_rows(&tx, table, &qualified_table, batch, &columns, &targets)
                    .await?
            }
            MergeMode::DeleteUnmatched => {
                let sql = format!(
                    "DELETE FROM {qualified_table} \
                     WHERE {key_column} IS NULL OR NOT ({key_column}::text = ANY($1::text[]))"
                );
                tx.execute(sql.as_str(), &[&keys])
                    .await
                    .map_err(|e| store_error(table, "Merge DELETE of unmatched rows failed", &e))?
            }
        };
        tx.commit()
            .await
            .map_err(|e| store_error(table, "Failed to commit merge transaction", &e))?;
        tracing::debug!(table = %table, key = %key, mode = %mode, affected, "merge applied");
        Ok(affected)
    }

    async fn select(&self, table: &str, filters: &[Filter]) -> StoreResult<Vec<Row>> {
        let client = self.client.lock().await;
        let (predicate, params) = where_clause(filters);
        let sql = format!(
            "SELECT json_strip_nulls(row_to_json(t))::text FROM {} AS t{predicate}",
            self.qualified(table)
        );
        let param_refs: Vec<&(dyn ToSql + Sync)> =
            params.iter().map(|p| p as &(dyn ToSql + Sync)).collect();
        let rows = client
            .query(sql.as_str(), &param_refs)
            .await
            .map_err(|e| store_error(table, &format!("SELECT from {table} failed"), &e))?;
        rows.iter()
            .map(|row| {
                let raw: String = row.get(0);
                serde_json::from_str(&raw).map_err(|e| {
                    StoreError::Invalid(format!("row of '{table}' is not a JSON object: {e}"))
                })
            })
            .collect()
    }

    fn replace_mode(&self) -> ReplaceMode {
        match self.replace_strategy {
            ReplaceStrategy::TruncateAndInsert => ReplaceMode::TruncateOnce,
            ReplaceStrategy::StagingOptimized => ReplaceMode::StagingSwap,
        }
    }

    async fn prepare_staging(&self, table: &str) -> StoreResult<()> {
        let client = self.client.lock().await;
        self.require_columns(&client, table).await?;
        ddl::prepare_staging(&client, &self.schema, &self.staging_schema, table).await?;
        Ok(())
    }

    async fn append_staging(&self, table: &str, batch: &RecordBatch) -> StoreResult<u64> {
        let mut client = self.client.lock().await;
        let columns = get_existing_columns(&*client, &self.staging_schema, table)
            .await?
            .ok_or_else(|| {
                StoreError::Invalid(format!(
                    "no staging copy of '{table}' in '{}'; prepare the load first",
                    self.staging_schema
                ))
            })?;
        let staging_table = qualified_name(&self.staging_schema, table);
        let written = self
            .write_committed(&mut client, table, &staging_table, batch, &columns)
            .await?;
        tracing::debug!(table = %table, staging = %staging_table, rows = written, "staging rows written");
        Ok(written)
    }

    async fn swap_staging(&self, table: &str) -> StoreResult<bool> {
        let mut client = self.client.lock().await;
        if get_existing_columns(&*client, &self.staging_schema, table)
            .await?
            .is_none()
        {
            return Ok(false);
        }
        ddl::swap_staging_table(&mut client, &self.schema, &self.staging_schema, table).await?;
        Ok(true)
    }
}
