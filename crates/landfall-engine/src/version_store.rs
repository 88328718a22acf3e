//! Schema versions, completed loads and pipeline state kept as rows in the
//! destination's own bookkeeping tables.
//!
//! All three tables are append-only. When several rows match a lookup the most
//! recently inserted one wins; a missing table or row is "not found", never an
//! error.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use landfall_types::capabilities::DestinationCapabilities;
use landfall_types::error::{DestinationError, Result};
use landfall_types::naming::normalize_identifier;
use landfall_types::records::{
    LoadId, LoadStatus, PipelineName, StoredLoadRecord, StoredSchemaRecord, StoredStateRecord,
};
use landfall_types::schema::{
    bookkeeping_table, LogicalSchema, LogicalTable, WriteDisposition, LOADS_TABLE, STATE_TABLE,
    VERSION_TABLE,
};

use crate::arrow_utils::{rows_to_batch, table_arrow_schema};
use crate::executor::WriteDispositionExecutor;
use crate::settings::DestinationSettings;
use crate::store::{Filter, Row, StoreError, TableStore};

/// Reads and appends bookkeeping rows through one store.
pub struct SchemaVersionStore<'a, S> {
    store: &'a S,
    caps: &'a DestinationCapabilities,
    settings: &'a DestinationSettings,
}

impl<'a, S: TableStore> SchemaVersionStore<'a, S> {
    pub fn new(store: &'a S, caps: &'a DestinationCapabilities, settings: &'a DestinationSettings) -> Self {
        Self {
            store,
            caps,
            settings,
        }
    }

    /// Append a version row for `schema`, stamped now.
    ///
    /// # Errors
    ///
    /// Propagates store failures; the version table must already exist.
    pub async fn record_schema(&self, schema: &LogicalSchema) -> Result<StoredSchemaRecord> {
        self.record_schema_at(schema, Utc::now()).await
    }

    /// Append a version row for `schema` with an explicit insertion time.
    ///
    /// # Errors
    ///
    /// Propagates store failures; the version table must already exist.
    pub async fn record_schema_at(
        &self,
        schema: &LogicalSchema,
        inserted_at: DateTime<Utc>,
    ) -> Result<StoredSchemaRecord> {
        let record = StoredSchemaRecord::from_schema(schema, inserted_at)?;
        self.append(VERSION_TABLE, &record).await?;
        tracing::info!(
            schema = %record.schema_name,
            version = record.version,
            version_hash = %record.version_hash,
            "stored schema version"
        );
        Ok(record)
    }

    /// Most recently inserted version row, optionally restricted to one schema name.
    ///
    /// # Errors
    ///
    /// Transient on store failure; `internal` when a row does not decode.
    pub async fn get_latest(&self, schema_name: Option<&str>) -> Result<Option<StoredSchemaRecord>> {
        let filters: Vec<Filter> = schema_name
            .map(|name| vec![Filter::eq(self.column("schema_name"), name)])
            .unwrap_or_default();
        let rows: Vec<StoredSchemaRecord> = self.select(VERSION_TABLE, &filters).await?;
        Ok(latest(rows, |r| r.inserted_at))
    }

    /// Most recently inserted version row with `version_hash`.
    ///
    /// # Errors
    ///
    /// Transient on store failure; `internal` when a row does not decode.
    pub async fn get_by_hash(&self, version_hash: &str) -> Result<Option<StoredSchemaRecord>> {
        let filters = [Filter::eq(self.column("version_hash"), version_hash)];
        let rows: Vec<StoredSchemaRecord> = self.select(VERSION_TABLE, &filters).await?;
        Ok(latest(rows, |r| r.inserted_at))
    }

    /// Append a completed-load row.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn record_load_complete(
        &self,
        load_id: &LoadId,
        schema_name: &str,
        schema_version_hash: Option<&str>,
    ) -> Result<StoredLoadRecord> {
        let record = StoredLoadRecord {
            load_id: load_id.clone(),
            schema_name: Some(schema_name.to_string()),
            status: LoadStatus::Completed.code(),
            inserted_at: Utc::now(),
            schema_version_hash: schema_version_hash.map(str::to_string),
        };
        self.append(LOADS_TABLE, &record).await?;
        tracing::info!(load_id = %load_id, schema = schema_name, "load marked completed");
        Ok(record)
    }

    /// Append a pipeline state row.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn record_state(&self, record: &StoredStateRecord) -> Result<()> {
        self.append(STATE_TABLE, record).await?;
        tracing::debug!(
            pipeline = %record.pipeline_name,
            load_id = %record.load_id,
            "pipeline state stored"
        );
        Ok(())
    }

    /// Latest state of `pipeline` written by a completed load.
    ///
    /// State rows are joined with completed load rows on load id; the highest
    /// load id wins, then the latest `created_at`.
    ///
    /// # Errors
    ///
    /// Transient on store failure; `internal` when a row does not decode.
    pub async fn get_latest_state(&self, pipeline: &PipelineName) -> Result<Option<StoredStateRecord>> {
        let filters = [Filter::eq(self.column("pipeline_name"), pipeline.as_str())];
        let states: Vec<StoredStateRecord> = self.select(STATE_TABLE, &filters).await?;
        if states.is_empty() {
            return Ok(None);
        }
        let filters = [Filter::eq(self.column("status"), LoadStatus::Completed.code())];
        let loads: Vec<StoredLoadRecord> = self.select(LOADS_TABLE, &filters).await?;
        Ok(states
            .into_iter()
            .filter(|state| loads.iter().any(|l| l.load_id == state.load_id && l.is_completed()))
            .max_by(|a, b| {
                a.load_id
                    .cmp(&b.load_id)
                    .then_with(|| a.created_at.cmp(&b.created_at))
            }))
    }

    fn column(&self, name: &str) -> String {
        normalize_identifier(name, self.caps)
    }

    fn definition(table: &str) -> Result<LogicalTable> {
        bookkeeping_table(table).ok_or_else(|| {
            DestinationError::internal("UNKNOWN_BOOKKEEPING_TABLE", format!("'{table}' is not a bookkeeping table"))
        })
    }

    async fn append<T: Serialize>(&self, table: &str, record: &T) -> Result<()> {
        let definition = Self::definition(table)?;
        let physical = self.settings.qualified_table_name(self.caps, table);
        let Value::Object(fields) = serde_json::to_value(record).map_err(|e| {
            DestinationError::internal("BOOKKEEPING_ENCODE_FAILED", e.to_string()).with_table(table)
        })?
        else {
            return Err(DestinationError::internal(
                "BOOKKEEPING_ENCODE_FAILED",
                "record did not serialize to an object",
            )
            .with_table(table));
        };
        let row: Row = fields
            .into_iter()
            .map(|(name, value)| (self.column(&name), value))
            .collect();

        let batch = table_arrow_schema(&definition, self.caps)
            .and_then(|schema| rows_to_batch(&[row], schema))
            .map_err(|e| {
                DestinationError::internal("BOOKKEEPING_ENCODE_FAILED", format!("{e:#}")).with_table(table)
            })?;
        WriteDispositionExecutor::new(self.store)
            .write(&physical, &batch, &WriteDisposition::Append, None, false)
            .await?;
        Ok(())
    }

    async fn select<T: DeserializeOwned>(&self, table: &str, filters: &[Filter]) -> Result<Vec<T>> {
        let definition = Self::definition(table)?;
        let physical = self.settings.qualified_table_name(self.caps, table);
        let rows = match self.store.select(&physical, filters).await {
            Ok(rows) => rows,
            Err(StoreError::TableNotFound(_)) => return Ok(Vec::new()),
            Err(e) => return Err(DestinationError::from(e).with_table(table)),
        };
        rows.into_iter()
            .map(|row| {
                let logical: serde_json::Map<String, Value> = definition
                    .columns
                    .keys()
                    .filter_map(|name| {
                        row.get(&self.column(name))
                            .filter(|v| !v.is_null())
                            .map(|v| (name.clone(), v.clone()))
                    })
                    .collect();
                serde_json::from_value(Value::Object(logical)).map_err(|e| {
                    DestinationError::internal("BOOKKEEPING_ROW_CORRUPT", e.to_string()).with_table(table)
                })
            })
            .collect()
    }
}

/// Last of the maximal elements by `key`: later rows win ties.
fn latest<T, K: Ord>(rows: Vec<T>, key: impl Fn(&T) -> K) -> Option<T> {
    rows.into_iter().max_by_key(|r| key(r))
}
