//! Staging copies for `staging-optimized` replaces.
//!
//! The new contents are loaded into `<staging schema>.<table>`, a structural
//! copy of the target. The swap drops the target and moves the copy into the
//! target schema inside one transaction.

use pg_escape::quote_identifier;
use tokio_postgres::Client;

use landfall_engine::StoreError;

use super::qualified_name;
use crate::error::store_error;

/// Create an empty structural copy of the target in the staging schema.
///
/// Any staging table left over from an earlier failed load is dropped first.
pub(crate) async fn prepare_staging(
    client: &Client,
    target_schema: &str,
    staging_schema: &str,
    table_name: &str,
) -> Result<String, StoreError> {
    let target_table = qualified_name(target_schema, table_name);
    let staging_table = qualified_name(staging_schema, table_name);
    let sql = format!(
        "CREATE SCHEMA IF NOT EXISTS {schema}; \
         DROP TABLE IF EXISTS {staging} CASCADE; \
         CREATE TABLE {staging} (LIKE {target} INCLUDING ALL)",
        schema = quote_identifier(staging_schema),
        staging = staging_table,
        target = target_table,
    );
    client
        .batch_execute(&sql)
        .await
        .map_err(|e| store_error(table_name, &format!("Preparing {staging_table} failed"), &e))?;
    tracing::debug!(staging = %staging_table, target = %target_table, "staging table prepared");
    Ok(staging_table)
}

/// Drop a staging table if it exists.
pub(crate) async fn drop_staging_table(
    client: &Client,
    staging_schema: &str,
    table_name: &str,
) -> Result<(), StoreError> {
    let staging_table = qualified_name(staging_schema, table_name);
    let sql = format!("DROP TABLE IF EXISTS {staging_table} CASCADE");
    client
        .batch_execute(&sql)
        .await
        .map_err(|e| store_error(table_name, &format!("DROP staging table failed for {staging_table}"), &e))?;
    tracing::debug!(staging = %staging_table, "dropped staging table");
    Ok(())
}

/// Atomically swap the staging table into the target position.
pub(crate) async fn swap_staging_table(
    client: &mut Client,
    target_schema: &str,
    staging_schema: &str,
    table_name: &str,
) -> Result<(), StoreError> {
    let target_table = qualified_name(target_schema, table_name);
    let staging_table = qualified_name(staging_schema, table_name);

    let tx = client
        .transaction()
        .await
        .map_err(|e| store_error(table_name, "Swap BEGIN failed", &e))?;

    let drop_sql = format!("DROP TABLE IF EXISTS {target_table} CASCADE");
    tx.batch_execute(&drop_sql)
        .await
        .map_err(|e| store_error(table_name, &format!("Swap DROP failed for {target_table}"), &e))?;

    let move_sql = format!(
        "ALTER TABLE {} SET SCHEMA {}",
        staging_table,
        quote_identifier(target_schema)
    );
    tx.batch_execute(&move_sql)
        .await
        .map_err(|e| store_error(table_name, "Swap SET SCHEMA failed", &e))?;

    tx.commit()
        .await
        .map_err(|e| store_error(table_name, "Swap COMMIT failed", &e))?;

    tracing::info!(staging = %staging_table, target = %target_table, "atomic swap");
    Ok(())
}
