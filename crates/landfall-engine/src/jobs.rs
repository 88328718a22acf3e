//! Load jobs: one batch file (or one lineage reference) per job.
//!
//! A job moves `pending -> running -> completed | retryable_failed |
//! terminal_failed` and performs exactly one write per run. Retryable jobs
//! may be reset to `pending` and re-run unchanged.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;

use landfall_types::capabilities::DestinationCapabilities;
use landfall_types::error::{DestinationError, Result};
use landfall_types::load::{LineageReference, ParsedLoadJobFileName};
use landfall_types::naming::normalize_identifier;
use landfall_types::records::LoadId;
use landfall_types::schema::{LogicalSchema, LogicalTable, WriteDisposition};

use crate::arrow_utils::{normalize_columns, read_batch_file, table_arrow_schema};
use crate::embedding::EmbeddingProvider;
use crate::error::{file_error, StoreResultExt};
use crate::executor::{add_id_column, add_vector_column, check_disposition, WriteDispositionExecutor};
use crate::orphans::{self, OrphanTarget};
use crate::settings::DestinationSettings;
use crate::store::TableStore;

/// Lifecycle state of a load job.
#[derive(Debug, Clone, PartialEq)]
pub enum JobState {
    Pending,
    Running,
    Completed,
    RetryableFailed(DestinationError),
    TerminalFailed(DestinationError),
}

impl JobState {
    /// Whether the job will not run again without intervention.
    #[must_use]
    pub fn is_final(&self) -> bool {
        matches!(self, Self::Completed | Self::TerminalFailed(_))
    }

    #[must_use]
    pub fn error(&self) -> Option<&DestinationError> {
        match self {
            Self::RetryableFailed(e) | Self::TerminalFailed(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::RetryableFailed(_) => "retryable_failed",
            Self::TerminalFailed(_) => "terminal_failed",
        };
        f.write_str(s)
    }
}

/// What a job does with its file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    /// Write one batch file with the table's disposition.
    Load,
    /// Delete orphans of a merged table chain from a lineage reference.
    RemoveOrphans,
    /// Replace each table of a chain with the staging copy its load filled.
    SwapStaging,
}

/// Everything a job needs from its destination client.
pub struct JobContext<'a, S> {
    pub store: &'a S,
    pub caps: &'a DestinationCapabilities,
    pub settings: &'a DestinationSettings,
    pub schema: &'a LogicalSchema,
    pub embedder: Option<&'a dyn EmbeddingProvider>,
}

/// A unit of work bound to one file.
#[derive(Debug)]
pub struct LoadJob {
    kind: JobKind,
    file_path: PathBuf,
    file_name: ParsedLoadJobFileName,
    table: String,
    load_id: LoadId,
    state: JobState,
}

impl LoadJob {
    /// # Errors
    ///
    /// Returns a `config` error when the file name is not a job file name.
    pub fn new(kind: JobKind, table: impl Into<String>, file_path: impl Into<PathBuf>, load_id: LoadId) -> Result<Self> {
        let file_path = file_path.into();
        let file_name = ParsedLoadJobFileName::parse(&file_path)?;
        Ok(Self {
            kind,
            file_path,
            file_name,
            table: table.into(),
            load_id,
            state: JobState::Pending,
        })
    }

    #[must_use]
    pub fn kind(&self) -> JobKind {
        self.kind
    }

    /// Job id: the file name.
    #[must_use]
    pub fn job_id(&self) -> String {
        self.file_name.to_string()
    }

    #[must_use]
    pub fn file_path(&self) -> &Path {
        &self.file_path
    }

    #[must_use]
    pub fn table(&self) -> &str {
        &self.table
    }

    #[must_use]
    pub fn load_id(&self) -> &LoadId {
        &self.load_id
    }

    #[must_use]
    pub fn state(&self) -> &JobState {
        &self.state
    }

    /// Move a retryable failure back to `pending`. Returns whether it moved.
    pub fn reset_for_retry(&mut self) -> bool {
        if matches!(self.state, JobState::RetryableFailed(_)) {
            self.transition(JobState::Pending);
            true
        } else {
            false
        }
    }

    /// Run a pending job once and return its final state for this run.
    ///
    /// A job that is not `pending` is left untouched.
    pub async fn run<S: TableStore>(&mut self, ctx: &JobContext<'_, S>) -> &JobState {
        if self.state != JobState::Pending {
            tracing::warn!(job = %self.job_id(), state = %self.state, "job is not pending, not running");
            return &self.state;
        }
        self.transition(JobState::Running);
        let outcome = match self.kind {
            JobKind::Load => self.load(ctx).await,
            JobKind::RemoveOrphans => self.remove_orphans(ctx).await,
            JobKind::SwapStaging => self.swap_staging(ctx).await,
        };
        let next = match outcome {
            Ok(rows) => {
                tracing::info!(job = %self.job_id(), table = %self.table, rows, "job completed");
                JobState::Completed
            }
            Err(err) if err.is_retryable() => {
                tracing::warn!(job = %self.job_id(), table = %self.table, error = %err, "job failed, retryable");
                JobState::RetryableFailed(err)
            }
            Err(err) => {
                tracing::error!(job = %self.job_id(), table = %self.table, error = %err, "job failed");
                JobState::TerminalFailed(err)
            }
        };
        self.transition(next);
        &self.state
    }

    fn transition(&mut self, next: JobState) {
        tracing::debug!(job = %self.job_id(), from = %self.state, to = %next, "job state change");
        self.state = next;
    }

    fn logical_table<'s>(&self, schema: &'s LogicalSchema) -> Result<&'s LogicalTable> {
        schema.get_table(&self.table).ok_or_else(|| {
            DestinationError::config(
                "UNKNOWN_TABLE",
                format!("table '{}' is not in schema '{}'", self.table, schema.name),
            )
            .with_table(&self.table)
            .with_file(&self.file_path.display().to_string())
        })
    }

    async fn load<S: TableStore>(&self, ctx: &JobContext<'_, S>) -> Result<u64> {
        let table = self.logical_table(ctx.schema)?;
        let disposition = ctx.schema.write_disposition(&self.table);
        check_disposition(&disposition).map_err(|e| self.context(e))?;

        let batch = read_file(self.file_path.clone(), ctx.caps.clone())
            .await
            .map_err(|e| e.with_table(&self.table))?;
        let physical = ctx.settings.qualified_table_name(ctx.caps, &self.table);
        let batch = self.derive_columns(ctx, table, &disposition, &physical, batch).await?;
        let id_field = (!LogicalSchema::is_internal(&self.table)).then_some(ctx.settings.id_field_name.as_str());

        WriteDispositionExecutor::new(ctx.store)
            .write(&physical, &batch, &disposition, id_field, false)
            .await
            .map_err(|e| self.context(e))
    }

    async fn derive_columns<S: TableStore>(
        &self,
        ctx: &JobContext<'_, S>,
        table: &LogicalTable,
        disposition: &WriteDisposition,
        physical: &str,
        batch: RecordBatch,
    ) -> Result<RecordBatch> {
        if LogicalSchema::is_internal(&self.table) {
            return Ok(batch);
        }
        let identifiers: Vec<String> = table
            .unique_identifiers(disposition)
            .into_iter()
            .map(|c| normalize_identifier(c, ctx.caps))
            .collect();
        let identifiers: Vec<&str> = identifiers.iter().map(String::as_str).collect();
        let mut batch = add_id_column(&batch, &identifiers, physical, &ctx.settings.id_field_name)
            .map_err(|e| self.context(e))?;

        if let Some(embedder) = ctx.embedder {
            let columns: Vec<String> = table
                .vectorize_columns()
                .into_iter()
                .map(|c| normalize_identifier(c, ctx.caps))
                .collect();
            if !columns.is_empty() {
                let columns: Vec<&str> = columns.iter().map(String::as_str).collect();
                batch = add_vector_column(&batch, &columns, embedder, &ctx.settings.vector_field_name)
                    .await
                    .map_err(|e| self.context(e))?;
            }
        }
        Ok(batch)
    }

    async fn remove_orphans<S: TableStore>(&self, ctx: &JobContext<'_, S>) -> Result<u64> {
        let raw = tokio::fs::read_to_string(&self.file_path).await.map_err(|e| {
            DestinationError::lineage("REFERENCE_READ_FAILED", e.to_string())
                .with_file(&self.file_path.display().to_string())
                .with_table(&self.table)
        })?;
        let lineage = LineageReference::parse(&raw);
        let targets = orphans::plan(ctx.schema, &lineage).map_err(|e| self.context(e))?;

        // Build every payload before the first delete.
        let mut payloads = Vec::with_capacity(targets.len());
        for target in targets {
            let table = self.lookup(ctx.schema, &target.table)?;
            let target_schema = target_schema(table, ctx)?;
            let payload = build_payload(target.clone(), target_schema, ctx.caps.clone()).await?;
            payloads.push((target, payload));
        }

        let executor = WriteDispositionExecutor::new(ctx.store);
        let mut removed = 0;
        for (target, payload) in payloads {
            let physical = ctx.settings.qualified_table_name(ctx.caps, &target.table);
            let key = normalize_identifier(&target.key, ctx.caps);
            let deleted = executor
                .write(&physical, &payload, &WriteDisposition::Merge, Some(&key), true)
                .await
                .map_err(|e| e.with_file(&self.file_path.display().to_string()))?;
            tracing::info!(table = %target.table, key = %key, deleted, "orphans removed");
            removed += deleted;
        }
        Ok(removed)
    }

    async fn swap_staging<S: TableStore>(&self, ctx: &JobContext<'_, S>) -> Result<u64> {
        let raw = tokio::fs::read_to_string(&self.file_path).await.map_err(|e| {
            DestinationError::internal("SWAP_LIST_READ_FAILED", e.to_string())
                .with_file(&self.file_path.display().to_string())
                .with_table(&self.table)
        })?;
        let tables: Vec<&str> = raw.lines().map(str::trim).filter(|l| !l.is_empty()).collect();
        for table in &tables {
            if ctx.schema.get_table(table).is_none() {
                return Err(self.context(DestinationError::config(
                    "UNKNOWN_TABLE",
                    format!("table '{table}' is not in schema '{}'", ctx.schema.name),
                )
                .with_table(table)));
            }
        }

        let mut swapped = 0;
        for table in tables {
            let physical = ctx.settings.qualified_table_name(ctx.caps, table);
            let replaced = ctx
                .store
                .swap_staging(&physical)
                .await
                .for_table(table)
                .map_err(|e| self.context(e))?;
            if replaced {
                tracing::info!(table = %physical, "staging copy swapped in");
                swapped += 1;
            } else {
                tracing::debug!(table = %physical, "no staging copy, table left as is");
            }
        }
        Ok(swapped)
    }

    fn lookup<'s>(&self, schema: &'s LogicalSchema, table: &str) -> Result<&'s LogicalTable> {
        schema.get_table(table).ok_or_else(|| {
            DestinationError::lineage("UNKNOWN_LINEAGE_TABLE", format!("table '{table}' is not in schema"))
                .with_table(table)
        })
    }

    fn context(&self, err: DestinationError) -> DestinationError {
        let err = if err.detail("file").is_none() {
            err.with_file(&self.file_path.display().to_string())
        } else {
            err
        };
        if err.detail("table").is_none() {
            err.with_table(&self.table)
        } else {
            err
        }
    }
}

/// Arrow shape of a stored table as the engine created it.
fn target_schema<S>(table: &LogicalTable, ctx: &JobContext<'_, S>) -> Result<SchemaRef> {
    let logical = table_arrow_schema(table, ctx.caps).map_err(|e| {
        DestinationError::schema("UNSUPPORTED_TYPE", format!("{e:#}")).with_table(&table.name)
    })?;
    if LogicalSchema::is_internal(&table.name) {
        return Ok(logical);
    }
    let mut fields: Vec<Field> = logical.fields().iter().map(|f| f.as_ref().clone()).collect();
    fields.push(Field::new(ctx.settings.id_field_name.clone(), DataType::Utf8, true));
    Ok(Arc::new(Schema::new(fields)))
}

async fn read_file(path: PathBuf, caps: DestinationCapabilities) -> Result<RecordBatch> {
    let display = path.clone();
    tokio::task::spawn_blocking(move || {
        let batch = read_batch_file(&path).map_err(|e| file_error("BATCH_READ_FAILED", &path, &e))?;
        normalize_columns(&batch, &caps).map_err(|e| {
            DestinationError::internal("ARROW_ERROR", e.to_string()).with_file(&path.display().to_string())
        })
    })
    .await
    .map_err(|e| {
        DestinationError::internal("JOB_PANICKED", e.to_string()).with_file(&display.display().to_string())
    })?
}

async fn build_payload(
    target: OrphanTarget,
    schema: SchemaRef,
    caps: DestinationCapabilities,
) -> Result<RecordBatch> {
    let table = target.table.clone();
    tokio::task::spawn_blocking(move || orphans::build_payload(&target, &schema, &caps))
        .await
        .map_err(|e| DestinationError::internal("JOB_PANICKED", e.to_string()).with_table(&table))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arrow_utils::write_batch_file;
    use crate::testing::{batch, MemoryStore};
    use landfall_types::error::ErrorCategory;
    use landfall_types::schema::{ColumnDef, DataType as LogicalType, DLT_ID_COLUMN, DLT_PARENT_ID_COLUMN};
    use serde_json::json;

    fn schema(disposition: &str) -> LogicalSchema {
        LogicalSchema::new("shop")
            .with_table(
                LogicalTable::new("orders")
                    .with_disposition(disposition)
                    .with_column(ColumnDef::new("order_id", LogicalType::Bigint).primary_key())
                    .with_column(ColumnDef::new(DLT_ID_COLUMN, LogicalType::Text)),
            )
            .with_table(
                LogicalTable::new("orders__items")
                    .with_parent("orders")
                    .with_column(ColumnDef::new(DLT_ID_COLUMN, LogicalType::Text))
                    .with_column(ColumnDef::new(DLT_PARENT_ID_COLUMN, LogicalType::Text)),
            )
    }

    fn store() -> MemoryStore {
        MemoryStore::with_table(
            "orders",
            &[("order_id", DataType::Int64), (DLT_ID_COLUMN, DataType::Utf8), ("id__", DataType::Utf8)],
        )
    }

    fn ctx<'a>(
        store: &'a MemoryStore,
        schema: &'a LogicalSchema,
        caps: &'a DestinationCapabilities,
        settings: &'a DestinationSettings,
    ) -> JobContext<'a, MemoryStore> {
        JobContext {
            store,
            caps,
            settings,
            schema,
            embedder: None,
        }
    }

    #[tokio::test]
    async fn load_job_completes_and_adds_ids() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("orders.f1.0.parquet");
        write_batch_file(&path, &batch(&[("order_id", json!([1, 2])), (DLT_ID_COLUMN, json!(["a", "b"]))])).unwrap();

        let (store, schema) = (store(), schema("merge"));
        let (caps, settings) = (DestinationCapabilities::default(), DestinationSettings::default());
        let mut job = LoadJob::new(JobKind::Load, "orders", &path, LoadId::new("1")).unwrap();
        assert_eq!(job.job_id(), "orders.f1.0.parquet");
        assert_eq!(job.run(&ctx(&store, &schema, &caps, &settings)).await, &JobState::Completed);
        assert_eq!(store.row_count("orders"), 2);
        assert!(store.rows("orders")[0]["id__"].is_string());

        // A completed job does not run again.
        assert_eq!(job.run(&ctx(&store, &schema, &caps, &settings)).await, &JobState::Completed);
        assert_eq!(store.row_count("orders"), 2);
    }

    #[tokio::test]
    async fn unreachable_store_is_retryable_and_rerunnable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("orders.f1.0.parquet");
        write_batch_file(&path, &batch(&[("order_id", json!([1])), (DLT_ID_COLUMN, json!(["a"]))])).unwrap();

        let (store, schema) = (store(), schema("merge"));
        let (caps, settings) = (DestinationCapabilities::default(), DestinationSettings::default());
        store.set_unavailable(true);
        let mut job = LoadJob::new(JobKind::Load, "orders", &path, LoadId::new("1")).unwrap();
        let state = job.run(&ctx(&store, &schema, &caps, &settings)).await.clone();
        assert!(matches!(state, JobState::RetryableFailed(_)));
        assert!(!state.is_final());
        assert_eq!(state.error().unwrap().detail("table"), Some("orders"));

        store.set_unavailable(false);
        assert!(job.reset_for_retry());
        job.run(&ctx(&store, &schema, &caps, &settings)).await;
        job.reset_for_retry();
        assert_eq!(job.state(), &JobState::Completed);
        assert_eq!(store.row_count("orders"), 1);
    }

    #[tokio::test]
    async fn unsupported_disposition_is_terminal_without_reading() {
        let (store, schema) = (store(), schema("foo"));
        let (caps, settings) = (DestinationCapabilities::default(), DestinationSettings::default());
        let mut job = LoadJob::new(JobKind::Load, "orders", "/missing/orders.f1.0.parquet", LoadId::new("1")).unwrap();
        let state = job.run(&ctx(&store, &schema, &caps, &settings)).await;
        let JobState::TerminalFailed(err) = state else {
            panic!("expected terminal failure, got {state}");
        };
        assert_eq!(err.code, "UNSUPPORTED_DISPOSITION");
        assert_eq!(err.detail("file"), Some("/missing/orders.f1.0.parquet"));
        assert!(!job.reset_for_retry());
        assert_eq!(store.write_calls(), 0);
    }

    #[tokio::test]
    async fn type_mismatch_is_terminal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("orders.f1.0.parquet");
        write_batch_file(&path, &batch(&[("order_id", json!(["one"])), (DLT_ID_COLUMN, json!(["a"]))])).unwrap();
        let (store, schema) = (store(), schema("append"));
        let (caps, settings) = (DestinationCapabilities::default(), DestinationSettings::default());
        let mut job = LoadJob::new(JobKind::Load, "orders", &path, LoadId::new("1")).unwrap();
        let state = job.run(&ctx(&store, &schema, &caps, &settings)).await;
        assert_eq!(state.error().unwrap().category, ErrorCategory::Data);
        assert!(state.is_final());
    }

    #[tokio::test]
    async fn missing_reference_root_deletes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let reference = dir.path().join("orders.f1.0.reference");
        std::fs::write(&reference, "/loads/orders__items.f2.0.parquet\n").unwrap();
        let (store, schema) = (store(), schema("merge"));
        let (caps, settings) = (DestinationCapabilities::default(), DestinationSettings::default());
        let mut job = LoadJob::new(JobKind::RemoveOrphans, "orders", &reference, LoadId::new("1")).unwrap();
        let state = job.run(&ctx(&store, &schema, &caps, &settings)).await;
        assert_eq!(state.error().unwrap().category, ErrorCategory::Lineage);
        assert!(state.is_final());
        assert_eq!(store.write_calls(), 0);
    }

    #[tokio::test]
    async fn swap_list_with_unknown_table_swaps_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let swap = dir.path().join("orders.f1.0.swap");
        std::fs::write(&swap, "orders\ninvoices\n").unwrap();
        let store = store().with_replace_mode(crate::store::ReplaceMode::StagingSwap);
        store.prepare_staging("orders").await.unwrap();
        let schema = schema("replace");
        let (caps, settings) = (DestinationCapabilities::default(), DestinationSettings::default());

        let mut job = LoadJob::new(JobKind::SwapStaging, "orders", &swap, LoadId::new("1")).unwrap();
        let state = job.run(&ctx(&store, &schema, &caps, &settings)).await;
        let err = state.error().unwrap();
        assert_eq!(err.code, "UNKNOWN_TABLE");
        assert_eq!(err.detail("table"), Some("invoices"));
        assert!(state.is_final());
        // The prepared copy is still waiting.
        assert!(store.swap_staging("orders").await.unwrap());
    }
}
