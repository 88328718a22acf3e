//! Per-destination facade over the engine components.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use landfall_types::capabilities::{Capability, DestinationCapabilities};
use landfall_types::error::{DestinationError, Result};
use landfall_types::load::{
    LineageReference, ParsedLoadJobFileName, REFERENCE_EXTENSION, STAGING_SWAP_EXTENSION,
};
use landfall_types::records::{LoadId, PipelineName, StoredSchemaRecord, StoredStateRecord};
use landfall_types::schema::{ColumnDef, LogicalSchema, WriteDisposition};

use crate::diff::{SchemaDelta, SchemaDiffEngine};
use crate::embedding::EmbeddingProvider;
use crate::error::StoreResultExt;
use crate::jobs::{JobContext, JobKind, JobState, LoadJob};
use crate::settings::DestinationSettings;
use crate::store::{ReplaceMode, TableStore};
use crate::type_mapper::TypeMapper;
use crate::version_store::SchemaVersionStore;

/// Lifecycle contract of one destination for one schema.
///
/// Capabilities are checked once, at construction. Methods take `&self`; a
/// client wraps one store handle and is used by one job at a time.
pub struct DestinationClient<S, M> {
    store: S,
    mapper: M,
    settings: DestinationSettings,
    schema: LogicalSchema,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
}

impl<S, M> DestinationClient<S, M>
where
    S: TableStore,
    M: TypeMapper<Native = S::Native>,
{
    /// # Errors
    ///
    /// Returns a `config` error when the mapper's capabilities are invalid or
    /// lack one of `required`.
    pub fn new(
        store: S,
        mapper: M,
        settings: DestinationSettings,
        schema: LogicalSchema,
        required: &[Capability],
    ) -> Result<Self> {
        let caps = mapper.capabilities();
        caps.validate()?;
        for capability in required {
            caps.require(*capability)?;
        }
        Ok(Self {
            store,
            mapper,
            settings,
            schema,
            embedder: None,
        })
    }

    /// Attach the embedding strategy used for `vectorize` columns.
    ///
    /// # Errors
    ///
    /// Returns a `config` error when the destination has no embeddings capability.
    pub fn with_embedder(mut self, embedder: Arc<dyn EmbeddingProvider>) -> Result<Self> {
        self.mapper.capabilities().require(Capability::Embeddings)?;
        self.embedder = Some(embedder);
        Ok(self)
    }

    #[must_use]
    pub fn capabilities(&self) -> &DestinationCapabilities {
        self.mapper.capabilities()
    }

    #[must_use]
    pub fn schema(&self) -> &LogicalSchema {
        &self.schema
    }

    #[must_use]
    pub fn settings(&self) -> &DestinationSettings {
        &self.settings
    }

    #[must_use]
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Physical name of a logical table.
    #[must_use]
    pub fn make_qualified_table_name(&self, table: &str) -> String {
        self.settings.qualified_table_name(self.capabilities(), table)
    }

    fn diff_engine(&self) -> SchemaDiffEngine<'_, S, M> {
        SchemaDiffEngine::new(
            &self.store,
            &self.mapper,
            &self.settings,
            self.embedder.as_ref().map(|e| e.dimension()),
        )
    }

    fn versions(&self) -> SchemaVersionStore<'_, S> {
        SchemaVersionStore::new(&self.store, self.capabilities(), &self.settings)
    }

    /// Create the sentinel marker, or empty `truncate_tables` when storage exists.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn initialize_storage(&self, truncate_tables: Option<&[String]>) -> Result<()> {
        let sentinel = self.settings.sentinel_table();
        if !self.is_storage_initialized().await? {
            self.store.create_table(&sentinel, &[]).await.for_table(&sentinel)?;
            tracing::info!(sentinel = %sentinel, "storage initialized");
            return Ok(());
        }
        for table in truncate_tables.unwrap_or_default() {
            let physical = self.make_qualified_table_name(table);
            if self.store.describe_table(&physical).await.for_table(table)?.is_some() {
                self.store.truncate_table(&physical).await.for_table(table)?;
                tracing::info!(table = %physical, "table truncated");
            }
        }
        Ok(())
    }

    /// Get the `replace` tables among `tables` ready for a new load.
    ///
    /// Run once per load, before its jobs. Stores that replace per file need
    /// nothing; the others empty each existing table, or create its empty
    /// staging copy. Tables with another disposition are left alone.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn prepare_replace_tables(&self, tables: &[&str]) -> Result<()> {
        let mode = self.store.replace_mode();
        if mode == ReplaceMode::PerFile {
            return Ok(());
        }
        for table in tables {
            if self.schema.write_disposition(table) != WriteDisposition::Replace {
                continue;
            }
            let physical = self.make_qualified_table_name(table);
            if self.store.describe_table(&physical).await.for_table(table)?.is_none() {
                tracing::debug!(table = %physical, "replace table not created yet, nothing to prepare");
                continue;
            }
            let prepared = match mode {
                ReplaceMode::TruncateOnce => self.store.truncate_table(&physical).await,
                _ => self.store.prepare_staging(&physical).await,
            };
            prepared.for_table(table)?;
            tracing::info!(table = %physical, mode = %mode, "replace table prepared");
        }
        Ok(())
    }

    /// Whether the sentinel marker exists.
    ///
    /// # Errors
    ///
    /// Transient when the store cannot be reached.
    pub async fn is_storage_initialized(&self) -> Result<bool> {
        let sentinel = self.settings.sentinel_table();
        Ok(self
            .store
            .describe_table(&sentinel)
            .await
            .for_table(&sentinel)?
            .is_some())
    }

    /// Drop every table of the dataset, then the sentinel.
    ///
    /// Without a dataset name every table in the store namespace is dropped.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn drop_storage(&self) -> Result<()> {
        let sentinel = self.settings.sentinel_table();
        let prefix = self.settings.dataset_prefix();
        let tables = self.store.list_tables().await.map_err(DestinationError::from)?;
        for table in tables {
            if table == sentinel {
                continue;
            }
            if prefix.as_deref().map_or(true, |p| table.starts_with(p)) {
                self.store.drop_table(&table).await.for_table(&table)?;
                tracing::info!(table = %table, "table dropped");
            }
        }
        self.store.drop_table(&sentinel).await.for_table(&sentinel)?;
        tracing::info!(sentinel = %sentinel, "storage dropped");
        Ok(())
    }

    /// Align physical storage with the schema and record its version.
    ///
    /// Does nothing when the schema's `version_hash` is already stored.
    /// Returns the applied delta otherwise.
    ///
    /// # Errors
    ///
    /// Transient when the store cannot be reached; `schema` on ambiguous
    /// column names; `config` for unknown tables in `only_tables`.
    pub async fn update_stored_schema(&self, only_tables: Option<&[String]>) -> Result<Option<SchemaDelta>> {
        let versions = self.versions();
        if let Some(stored) = versions.get_by_hash(&self.schema.version_hash).await? {
            tracing::info!(
                schema = %self.schema.name,
                version_hash = %stored.version_hash,
                inserted_at = %stored.inserted_at,
                "schema hash found in storage, no upgrade required"
            );
            return Ok(None);
        }
        tracing::info!(
            schema = %self.schema.name,
            version = self.schema.version,
            version_hash = %self.schema.version_hash,
            "schema hash not found in storage, upgrading"
        );
        let engine = self.diff_engine();
        let delta = engine.reconcile(&self.schema, only_tables).await?;
        engine.apply(&delta).await?;
        for table in &delta.tables {
            tracing::info!(
                table = %table.table,
                new_columns = table.new_columns.len(),
                "found new columns"
            );
        }
        versions.record_schema(&self.schema).await?;
        Ok(Some(delta))
    }

    /// Stored columns of a logical table, or `None` when it does not exist.
    ///
    /// # Errors
    ///
    /// Transient on store failure.
    pub async fn get_storage_table(&self, table: &str) -> Result<Option<Vec<ColumnDef>>> {
        self.diff_engine().storage_table(table).await
    }

    /// Latest stored schema version, by default of this client's schema name.
    ///
    /// # Errors
    ///
    /// Transient on store failure.
    pub async fn get_stored_schema(&self, schema_name: Option<&str>) -> Result<Option<StoredSchemaRecord>> {
        self.versions()
            .get_latest(Some(schema_name.unwrap_or(&self.schema.name)))
            .await
    }

    /// # Errors
    ///
    /// Transient on store failure.
    pub async fn get_stored_schema_by_hash(&self, version_hash: &str) -> Result<Option<StoredSchemaRecord>> {
        self.versions().get_by_hash(version_hash).await
    }

    /// Latest state of `pipeline` written by a completed load.
    ///
    /// # Errors
    ///
    /// Transient on store failure.
    pub async fn get_stored_state(&self, pipeline: &PipelineName) -> Result<Option<StoredStateRecord>> {
        self.versions().get_latest_state(pipeline).await
    }

    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn record_state(&self, record: &StoredStateRecord) -> Result<()> {
        self.versions().record_state(record).await
    }

    /// Mark `load_id` completed.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn complete_load(&self, load_id: &LoadId) -> Result<()> {
        self.versions()
            .record_load_complete(load_id, &self.schema.name, Some(&self.schema.version_hash))
            .await?;
        Ok(())
    }

    /// Job for one file: orphan removal for `.reference` files, a staging
    /// swap for `.swap` files, a load otherwise.
    ///
    /// # Errors
    ///
    /// Returns a `config` error for malformed file names or unknown tables.
    pub fn create_load_job(&self, table: &str, file_path: impl Into<PathBuf>, load_id: LoadId) -> Result<LoadJob> {
        let file_path = file_path.into();
        if self.schema.get_table(table).is_none() {
            return Err(DestinationError::config(
                "UNKNOWN_TABLE",
                format!("table '{table}' is not in schema '{}'", self.schema.name),
            )
            .with_table(table)
            .with_file(&file_path.display().to_string()));
        }
        let parsed = ParsedLoadJobFileName::parse(&file_path)?;
        let kind = if parsed.is_reference() {
            JobKind::RemoveOrphans
        } else if parsed.is_staging_swap() {
            JobKind::SwapStaging
        } else {
            JobKind::Load
        };
        LoadJob::new(kind, table, file_path, load_id)
    }

    /// Run a job against this destination.
    pub async fn run_job<'j>(&self, job: &'j mut LoadJob) -> &'j JobState {
        let ctx = JobContext {
            store: &self.store,
            caps: self.capabilities(),
            settings: &self.settings,
            schema: &self.schema,
            embedder: self.embedder.as_deref(),
        };
        job.run(&ctx).await
    }

    /// Follow-up jobs once every job of a table chain has completed.
    ///
    /// When the chain's root merges with orphan removal, a lineage reference
    /// listing the completed batch files in chain order is written next to
    /// the root batch file and returned as an orphan-removal job. When the
    /// root replaces through staging, a swap list naming every chain table is
    /// written instead and returned as a staging-swap job.
    ///
    /// # Errors
    ///
    /// Fails when the reference or swap file cannot be written.
    pub async fn create_table_chain_completed_followup_jobs(
        &self,
        table_chain: &[&str],
        completed_jobs: &[LoadJob],
    ) -> Result<Vec<LoadJob>> {
        let Some(root) = table_chain.first() else {
            return Ok(Vec::new());
        };
        match self.schema.write_disposition(root) {
            WriteDisposition::Merge if self.schema.removes_orphans(root) => {
                self.orphan_removal_job(table_chain, completed_jobs).await
            }
            WriteDisposition::Replace if self.store.replace_mode() == ReplaceMode::StagingSwap => {
                self.staging_swap_job(table_chain, completed_jobs).await
            }
            _ => Ok(Vec::new()),
        }
    }

    async fn orphan_removal_job(&self, table_chain: &[&str], completed_jobs: &[LoadJob]) -> Result<Vec<LoadJob>> {
        let root = table_chain[0];
        let mut paths = Vec::new();
        for table in table_chain {
            paths.extend(
                completed_loads(completed_jobs)
                    .filter(|job| job.table() == *table)
                    .map(|job| job.file_path().to_path_buf()),
            );
        }
        let Some(root_job) = completed_loads(completed_jobs).find(|job| job.table() == root) else {
            tracing::debug!(table = %root, "no root job in chain, skipping orphan removal");
            return Ok(Vec::new());
        };

        let reference = followup_path(root, root_job.file_path(), REFERENCE_EXTENSION)?;
        write_followup(&reference, root, LineageReference::new(paths).render()).await?;
        tracing::debug!(table = %root, reference = %reference.display(), "orphan removal job planned");
        Ok(vec![LoadJob::new(
            JobKind::RemoveOrphans,
            root,
            reference,
            root_job.load_id().clone(),
        )?])
    }

    async fn staging_swap_job(&self, table_chain: &[&str], completed_jobs: &[LoadJob]) -> Result<Vec<LoadJob>> {
        let root = table_chain[0];
        let Some(first) = completed_loads(completed_jobs)
            .find(|job| job.table() == root)
            .or_else(|| completed_loads(completed_jobs).find(|job| table_chain.contains(&job.table())))
        else {
            tracing::debug!(table = %root, "no completed job in chain, skipping staging swap");
            return Ok(Vec::new());
        };

        let swap = followup_path(root, first.file_path(), STAGING_SWAP_EXTENSION)?;
        let mut listing = table_chain.join("\n");
        listing.push('\n');
        write_followup(&swap, root, listing).await?;
        tracing::debug!(table = %root, swap = %swap.display(), "staging swap job planned");
        Ok(vec![LoadJob::new(
            JobKind::SwapStaging,
            root,
            swap,
            first.load_id().clone(),
        )?])
    }
}

fn completed_loads(jobs: &[LoadJob]) -> impl Iterator<Item = &LoadJob> {
    jobs.iter()
        .filter(|job| job.kind() == JobKind::Load && *job.state() == JobState::Completed)
}

async fn write_followup(path: &Path, table: &str, contents: String) -> Result<()> {
    tokio::fs::write(path, contents).await.map_err(|e| {
        DestinationError::internal("FOLLOWUP_WRITE_FAILED", e.to_string())
            .with_file(&path.display().to_string())
            .with_table(table)
    })
}

/// `<root>.<file_id>.<retry_count>.<format>` next to a batch file of the chain.
fn followup_path(root: &str, batch_file: &Path, format: &str) -> Result<PathBuf> {
    let mut parsed = ParsedLoadJobFileName::parse(batch_file)?.with_format(format);
    parsed.table_name = root.to_string();
    let name = parsed.to_string();
    Ok(batch_file
        .parent()
        .map_or_else(|| PathBuf::from(&name), |dir| dir.join(&name)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arrow_utils::write_batch_file;
    use crate::embedding::HashingEmbedder;
    use crate::testing::{batch, ArrowMapper, MemoryStore};
    use landfall_types::error::ErrorCategory;
    use landfall_types::schema::{
        DataType as LogicalType, LogicalTable, DLT_ID_COLUMN, DLT_PARENT_ID_COLUMN, VERSION_TABLE,
    };
    use serde_json::json;

    fn schema() -> LogicalSchema {
        LogicalSchema::new("shop")
            .with_table(
                LogicalTable::new("orders")
                    .with_disposition("merge")
                    .with_column(ColumnDef::new("order_id", LogicalType::Bigint).primary_key())
                    .with_column(ColumnDef::new("note", LogicalType::Text).vectorize())
                    .with_column(ColumnDef::new(DLT_ID_COLUMN, LogicalType::Text)),
            )
            .with_table(
                LogicalTable::new("orders__items")
                    .with_parent("orders")
                    .with_column(ColumnDef::new("sku", LogicalType::Text))
                    .with_column(ColumnDef::new(DLT_ID_COLUMN, LogicalType::Text))
                    .with_column(ColumnDef::new(DLT_PARENT_ID_COLUMN, LogicalType::Text)),
            )
    }

    fn client(schema: LogicalSchema) -> DestinationClient<MemoryStore, ArrowMapper> {
        client_on(MemoryStore::default(), schema)
    }

    fn client_on(store: MemoryStore, schema: LogicalSchema) -> DestinationClient<MemoryStore, ArrowMapper> {
        let settings = DestinationSettings {
            dataset_name: Some("ds".into()),
            ..DestinationSettings::default()
        };
        let caps = DestinationCapabilities::default().with_feature(Capability::Embeddings);
        DestinationClient::new(store, ArrowMapper::new(caps), settings, schema, &[]).unwrap()
    }

    #[test]
    fn missing_capability_fails_at_construction() {
        let caps = DestinationCapabilities::default().without_feature(Capability::StateSync);
        let result = DestinationClient::new(
            MemoryStore::default(),
            ArrowMapper::new(caps),
            DestinationSettings::default(),
            schema(),
            &[Capability::StateSync],
        );
        let err = result.err().unwrap();
        assert_eq!(err.category, ErrorCategory::Config);
        assert_eq!(err.code, "MISSING_CAPABILITY");
    }

    #[tokio::test]
    async fn storage_lifecycle() {
        let client = client(schema());
        assert!(!client.is_storage_initialized().await.unwrap());
        client.initialize_storage(None).await.unwrap();
        assert!(client.is_storage_initialized().await.unwrap());
        client.update_stored_schema(None).await.unwrap();
        assert!(client.store().describe_table("ds___orders").await.unwrap().is_some());

        client.drop_storage().await.unwrap();
        assert!(!client.is_storage_initialized().await.unwrap());
        assert!(client.store().list_tables().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn schema_upgrade_is_idempotent() {
        let client = client(schema());
        let delta = client.update_stored_schema(None).await.unwrap().unwrap();
        assert!(delta.new_tables().any(|t| t == "orders"));
        assert!(client.update_stored_schema(None).await.unwrap().is_none());
        assert_eq!(client.store().row_count("ds____dlt_version"), 1);
        let stored = client.get_stored_schema(None).await.unwrap().unwrap();
        assert_eq!(stored.version_hash, client.schema().version_hash);
    }

    #[tokio::test]
    async fn partial_upgrade_creates_bookkeeping_tables() {
        let client = client(schema());
        let only = vec!["orders".to_string()];
        let delta = client.update_stored_schema(Some(only.as_slice())).await.unwrap().unwrap();
        let created: Vec<&str> = delta.new_tables().collect();
        assert!(created.contains(&"orders"));
        assert!(created.contains(&VERSION_TABLE));
        assert!(!created.contains(&"orders__items"));
        assert_eq!(client.store().row_count("ds____dlt_version"), 1);
        assert!(client.store().describe_table("ds____dlt_loads").await.unwrap().is_some());
        assert!(client.update_stored_schema(Some(only.as_slice())).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn vector_column_only_with_embedder() {
        let client = client(schema())
            .with_embedder(Arc::new(HashingEmbedder::new("m", 4)))
            .unwrap();
        client.update_stored_schema(None).await.unwrap();
        let columns = client.store().describe_table("ds___orders").await.unwrap().unwrap();
        assert!(columns.iter().any(|c| c.name == "vector"));
        let items = client.store().describe_table("ds___orders__items").await.unwrap().unwrap();
        assert!(!items.iter().any(|c| c.name == "vector"));
        assert!(items.iter().any(|c| c.name == "id__"));

        // Engine-managed columns are hidden from the storage view.
        let view = client.get_storage_table("orders").await.unwrap().unwrap();
        assert!(view.iter().all(|c| c.name != "vector" && c.name != "id__"));
    }

    #[tokio::test]
    async fn merge_chain_plans_orphan_removal() {
        let dir = tempfile::tempdir().unwrap();
        let client = client(schema());
        client.update_stored_schema(None).await.unwrap();

        let root = dir.path().join("orders.f1.0.parquet");
        let child = dir.path().join("orders__items.f2.0.parquet");
        write_batch_file(
            &root,
            &batch(&[("order_id", json!([1])), ("note", json!(["n"])), (DLT_ID_COLUMN, json!(["r1"]))]),
        )
        .unwrap();
        write_batch_file(
            &child,
            &batch(&[("sku", json!(["s"])), (DLT_ID_COLUMN, json!(["c1"])), (DLT_PARENT_ID_COLUMN, json!(["r1"]))]),
        )
        .unwrap();

        let load_id = LoadId::new("1");
        let mut jobs = vec![
            client.create_load_job("orders", &root, load_id.clone()).unwrap(),
            client.create_load_job("orders__items", &child, load_id.clone()).unwrap(),
        ];
        for job in &mut jobs {
            assert_eq!(client.run_job(job).await, &JobState::Completed);
        }
        // A parent from an earlier load, with one child, is no longer in the batch.
        let store = client.store();
        store
            .append("ds___orders", &batch(&[("order_id", json!([9])), (DLT_ID_COLUMN, json!(["r9"]))]))
            .await
            .unwrap();
        store
            .append("ds___orders__items", &batch(&[(DLT_PARENT_ID_COLUMN, json!(["r9"]))]))
            .await
            .unwrap();
        assert_eq!(store.row_count("ds___orders"), 2);

        let followups = client
            .create_table_chain_completed_followup_jobs(&["orders", "orders__items"], &jobs)
            .await
            .unwrap();
        assert_eq!(followups.len(), 1);
        let mut followup = followups.into_iter().next().unwrap();
        assert_eq!(followup.kind(), JobKind::RemoveOrphans);
        assert_eq!(followup.job_id(), "orders.f1.0.reference");
        let reference = std::fs::read_to_string(followup.file_path()).unwrap();
        assert_eq!(LineageReference::parse(&reference).paths, vec![root.clone(), child.clone()]);

        assert_eq!(client.run_job(&mut followup).await, &JobState::Completed);
        assert_eq!(client.store().row_count("ds___orders"), 1);
        assert_eq!(client.store().row_count("ds___orders__items"), 1);

        let reloaded = client
            .create_load_job("orders", followup.file_path(), load_id)
            .unwrap();
        assert_eq!(reloaded.kind(), JobKind::RemoveOrphans);
    }

    #[rstest::rstest]
    #[case::truncate_once(ReplaceMode::TruncateOnce)]
    #[case::staging_swap(ReplaceMode::StagingSwap)]
    #[tokio::test]
    async fn replace_load_keeps_every_file_of_the_load(#[case] mode: ReplaceMode) {
        let dir = tempfile::tempdir().unwrap();
        let mut schema = schema();
        schema.tables.get_mut("orders").unwrap().write_disposition = Some(WriteDisposition::Replace);
        let client = client_on(MemoryStore::default().with_replace_mode(mode), schema);
        client.update_stored_schema(None).await.unwrap();
        let store = client.store();
        store
            .append("ds___orders", &batch(&[("order_id", json!([9])), (DLT_ID_COLUMN, json!(["r9"]))]))
            .await
            .unwrap();
        store
            .append("ds___orders__items", &batch(&[(DLT_PARENT_ID_COLUMN, json!(["r9"]))]))
            .await
            .unwrap();

        client.prepare_replace_tables(&["orders", "orders__items"]).await.unwrap();
        let load_id = LoadId::new("2");
        let mut jobs = Vec::new();
        for (name, order_id, dlt_id) in [("orders.f1.0.parquet", 1, "r1"), ("orders.f2.0.parquet", 2, "r2")] {
            let path = dir.path().join(name);
            write_batch_file(
                &path,
                &batch(&[("order_id", json!([order_id])), ("note", json!(["n"])), (DLT_ID_COLUMN, json!([dlt_id]))]),
            )
            .unwrap();
            let mut job = client.create_load_job("orders", &path, load_id.clone()).unwrap();
            assert_eq!(client.run_job(&mut job).await, &JobState::Completed);
            jobs.push(job);
        }

        let followups = client
            .create_table_chain_completed_followup_jobs(&["orders", "orders__items"], &jobs)
            .await
            .unwrap();
        if mode == ReplaceMode::StagingSwap {
            // Readers keep the previous load until the chain swaps in.
            assert_eq!(store.row_count("ds___orders"), 1);
            assert_eq!(followups.len(), 1);
            let mut swap = followups.into_iter().next().unwrap();
            assert_eq!(swap.kind(), JobKind::SwapStaging);
            assert_eq!(swap.job_id(), "orders.f1.0.swap");
            let reloaded = client.create_load_job("orders", swap.file_path(), load_id).unwrap();
            assert_eq!(reloaded.kind(), JobKind::SwapStaging);
            assert_eq!(client.run_job(&mut swap).await, &JobState::Completed);
        } else {
            assert!(followups.is_empty());
        }

        let order_ids: Vec<i64> = store
            .rows("ds___orders")
            .iter()
            .filter_map(|row| row["order_id"].as_i64())
            .collect();
        assert_eq!(order_ids, vec![1, 2]);
        assert_eq!(store.row_count("ds___orders__items"), 0);
    }

    #[tokio::test]
    async fn per_file_replace_needs_no_preparation() {
        let mut schema = schema();
        schema.tables.get_mut("orders").unwrap().write_disposition = Some(WriteDisposition::Replace);
        let client = client(schema);
        client.update_stored_schema(None).await.unwrap();
        let writes = client.store().write_calls();
        client.prepare_replace_tables(&["orders"]).await.unwrap();
        assert_eq!(client.store().write_calls(), writes);
        let followups = client
            .create_table_chain_completed_followup_jobs(&["orders"], &[])
            .await
            .unwrap();
        assert!(followups.is_empty());
    }

    #[tokio::test]
    async fn append_chains_get_no_followups() {
        let mut schema = schema();
        schema.tables.get_mut("orders").unwrap().write_disposition = Some(WriteDisposition::Append);
        let client = client(schema);
        let followups = client
            .create_table_chain_completed_followup_jobs(&["orders"], &[])
            .await
            .unwrap();
        assert!(followups.is_empty());
    }

    #[tokio::test]
    async fn completed_load_exposes_state() {
        let client = client(schema());
        client.update_stored_schema(None).await.unwrap();
        let record = StoredStateRecord {
            version: 1,
            engine_version: 9,
            pipeline_name: PipelineName::new("p"),
            state: "{}".into(),
            created_at: chrono::Utc::now(),
            version_hash: None,
            load_id: LoadId::new("7"),
        };
        client.record_state(&record).await.unwrap();
        assert!(client.get_stored_state(&PipelineName::new("p")).await.unwrap().is_none());
        client.complete_load(&LoadId::new("7")).await.unwrap();
        assert_eq!(
            client.get_stored_state(&PipelineName::new("p")).await.unwrap().unwrap().state,
            "{}"
        );
    }
}
