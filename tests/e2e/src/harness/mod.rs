mod container;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use arrow::record_batch::RecordBatch;
use tokio_postgres::NoTls;

use dest_postgres::{PostgresClient, PostgresConfig, ReplaceStrategy};
use landfall_engine::arrow_utils::write_batch_file;
use landfall_engine::{JobState, LoadJob};
use landfall_types::records::LoadId;
use landfall_types::schema::LogicalSchema;

static NEXT_DATASET_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone)]
pub struct HarnessContext {
    pub postgres_host: String,
    pub postgres_port: u16,
    pub postgres_db: String,
    pub postgres_user: String,
    pub postgres_pass: String,
}

pub async fn bootstrap() -> Result<HarnessContext> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    let postgres_port = container::shared_postgres_port()?;
    let context = HarnessContext {
        postgres_host: "127.0.0.1".to_string(),
        postgres_port,
        postgres_db: "postgres".to_string(),
        postgres_user: "postgres".to_string(),
        postgres_pass: "postgres".to_string(),
    };
    context
        .wait_until_ready()
        .await
        .context("postgres container never accepted connections")?;
    Ok(context)
}

impl HarnessContext {
    /// A dataset (schema) name no other test uses.
    pub fn allocate_dataset(&self, test_name: &str) -> String {
        let id = NEXT_DATASET_ID.fetch_add(1, Ordering::Relaxed);
        format!("ds_{}_{}", sanitize_identifier(test_name), id)
    }

    pub fn config(&self, dataset: &str, replace_strategy: ReplaceStrategy) -> PostgresConfig {
        let mut config = PostgresConfig::new(&self.postgres_host, &self.postgres_user, &self.postgres_db);
        config.port = self.postgres_port;
        config.password = self.postgres_pass.clone();
        config.dataset_name = dataset.to_string();
        config.replace_strategy = replace_strategy;
        config
    }

    pub async fn connect(&self, dataset: &str, strategy: ReplaceStrategy, schema: LogicalSchema) -> Result<PostgresClient> {
        dest_postgres::connect(&self.config(dataset, strategy), schema)
            .await
            .with_context(|| format!("connecting to dataset {dataset}"))
    }

    pub async fn admin(&self) -> Result<tokio_postgres::Client> {
        let conn = format!(
            "host={} port={} user={} password={} dbname={}",
            self.postgres_host,
            self.postgres_port,
            self.postgres_user,
            self.postgres_pass,
            self.postgres_db
        );
        let (client, connection) = tokio_postgres::connect(&conn, NoTls)
            .await
            .context("admin connection failed")?;
        tokio::spawn(async move {
            let _ = connection.await;
        });
        Ok(client)
    }

    async fn wait_until_ready(&self) -> Result<()> {
        let mut last_error = None;
        for _ in 0..30 {
            match self.admin().await {
                Ok(client) => {
                    client
                        .batch_execute("CREATE EXTENSION IF NOT EXISTS postgis")
                        .await
                        .context("postgis extension must be available")?;
                    return Ok(());
                }
                Err(err) => last_error = Some(err),
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        Err(last_error.unwrap_or_else(|| anyhow::anyhow!("no connection attempt made")))
    }

    pub async fn table_row_count(&self, dataset: &str, table: &str) -> Result<i64> {
        let client = self.admin().await?;
        let sql = format!("SELECT COUNT(*) FROM \"{dataset}\".\"{table}\"");
        let row = client.query_one(&sql, &[]).await?;
        Ok(row.get(0))
    }

    pub async fn query_strings(&self, sql: &str) -> Result<Vec<String>> {
        let client = self.admin().await?;
        let rows = client.query(sql, &[]).await?;
        Ok(rows.iter().map(|r| r.get(0)).collect())
    }

    pub async fn drop_dataset(&self, dataset: &str) -> Result<()> {
        let client = self.admin().await?;
        client
            .batch_execute(&format!(
                "DROP SCHEMA IF EXISTS \"{dataset}\" CASCADE; \
                 DROP SCHEMA IF EXISTS \"{dataset}_staging\" CASCADE"
            ))
            .await?;
        Ok(())
    }
}

/// Write `batch` as a parquet load file named `<table>.<file_id>.0.parquet`.
pub fn batch_file(dir: &Path, table: &str, file_id: &str, batch: &RecordBatch) -> Result<PathBuf> {
    let path = dir.join(format!("{table}.{file_id}.0.parquet"));
    write_batch_file(&path, batch)?;
    Ok(path)
}

/// Run one load job to a final state.
pub async fn run_load(client: &PostgresClient, table: &str, path: &Path, load_id: &str) -> Result<(LoadJob, JobState)> {
    let mut job = client.create_load_job(table, path, LoadId::new(load_id))?;
    let state = client.run_job(&mut job).await.clone();
    Ok((job, state))
}

pub fn sanitize_identifier(input: &str) -> String {
    input
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .collect()
}
