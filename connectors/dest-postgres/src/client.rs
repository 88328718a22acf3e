//! PostgreSQL client connection for dest-postgres.

use tokio_postgres::{Client, Config as PgConfig, NoTls};

use landfall_engine::StoreError;

use crate::config::PostgresConfig;
use crate::error::format_pg_error;

/// Connect to PostgreSQL using the provided config.
///
/// The session time zone is pinned to UTC so timestamps render the same way
/// on every connection.
pub(crate) async fn connect(config: &PostgresConfig) -> Result<Client, StoreError> {
    let mut pg = PgConfig::new();
    pg.host(&config.host);
    pg.port(config.port);
    pg.user(&config.user);
    if !config.password.is_empty() {
        pg.password(&config.password);
    }
    pg.dbname(&config.database);
    pg.connect_timeout(config.connect_timeout());
    pg.application_name("landfall");

    let (client, connection) = pg.connect(NoTls).await.map_err(|e| {
        StoreError::Unavailable(format_pg_error(
            &format!("Connection to {}:{} failed", config.host, config.port),
            &e,
        ))
    })?;

    tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::error!(error = %e, "PostgreSQL connection error");
        }
    });

    client
        .batch_execute("SET TIME ZONE 'UTC'")
        .await
        .map_err(|e| StoreError::Unavailable(format_pg_error("Session setup failed", &e)))?;

    tracing::debug!(
        host = %config.host,
        port = config.port,
        database = %config.database,
        "connected to PostgreSQL"
    );
    Ok(client)
}
