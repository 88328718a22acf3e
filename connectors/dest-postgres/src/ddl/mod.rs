//! DDL orchestration: schema and table creation, column extension, staging swaps.

pub(crate) mod introspect;
mod staging;

use pg_escape::quote_identifier;
use tokio_postgres::{Client, GenericClient};

use landfall_engine::{NativeColumn, StoreError};

use crate::error::store_error;
use crate::type_map::PgType;

pub(crate) use self::staging::{drop_staging_table, prepare_staging, swap_staging_table};

/// `"schema"."table"`
pub(crate) fn qualified_name(schema_name: &str, table_name: &str) -> String {
    format!(
        "{}.{}",
        quote_identifier(schema_name),
        quote_identifier(table_name)
    )
}

fn is_pg_type_typname_race(code: &str, message: &str, detail: &str) -> bool {
    code == "23505"
        && (message.contains("pg_type_typname_nsp_index")
            || detail.contains("pg_type_typname_nsp_index"))
}

fn is_concurrent_create_table_race(error: &tokio_postgres::Error) -> bool {
    let Some(db_error) = error.as_db_error() else {
        return false;
    };

    is_pg_type_typname_race(
        db_error.code().code(),
        db_error.message(),
        db_error.detail().unwrap_or_default(),
    )
}

async fn acquire_ddl_lock(client: &Client, lock_name: &str) -> Result<(), StoreError> {
    client
        .query_one(
            "SELECT pg_advisory_lock(hashtext($1)::bigint)",
            &[&lock_name],
        )
        .await
        .map_err(|e| {
            store_error(
                lock_name,
                &format!("Failed to acquire DDL advisory lock '{lock_name}'"),
                &e,
            )
        })?;
    Ok(())
}

async fn release_ddl_lock(client: &Client, lock_name: &str) -> Result<(), StoreError> {
    client
        .query_one(
            "SELECT pg_advisory_unlock(hashtext($1)::bigint)",
            &[&lock_name],
        )
        .await
        .map_err(|e| {
            store_error(
                lock_name,
                &format!("Failed to release DDL advisory lock '{lock_name}'"),
                &e,
            )
        })?;
    Ok(())
}

/// Column list entry for `CREATE TABLE`.
pub(crate) fn column_ddl(column: &NativeColumn<PgType>, create_indexes: bool) -> String {
    let mut ddl = format!("{} {}", quote_identifier(&column.name), column.native);
    if !column.nullable {
        ddl.push_str(" NOT NULL");
    }
    if column.unique && create_indexes {
        ddl.push_str(" UNIQUE");
    }
    ddl
}

pub(crate) fn create_table_sql(
    qualified_table: &str,
    columns: &[NativeColumn<PgType>],
    create_indexes: bool,
) -> String {
    let columns_ddl: Vec<String> = columns
        .iter()
        .map(|c| column_ddl(c, create_indexes))
        .collect();
    format!(
        "CREATE TABLE IF NOT EXISTS {} ({})",
        qualified_table,
        columns_ddl.join(", ")
    )
}

/// Run `CREATE TABLE` inside a savepoint so the concurrent `pg_type` race
/// leaves the surrounding transaction usable.
async fn create_table<C: GenericClient>(
    client: &C,
    qualified_table: &str,
    ddl: &str,
) -> Result<(), StoreError> {
    tracing::debug!(table = %qualified_table, ddl = %ddl, "ensuring table");

    client
        .batch_execute("SAVEPOINT landfall_create_table")
        .await
        .map_err(|e| store_error(qualified_table, "Failed to create DDL savepoint", &e))?;

    match client.batch_execute(ddl).await {
        Ok(()) => {
            client
                .batch_execute("RELEASE SAVEPOINT landfall_create_table")
                .await
                .map_err(|e| store_error(qualified_table, "Failed to release DDL savepoint", &e))?;
        }
        Err(error) if is_concurrent_create_table_race(&error) => {
            client
                .batch_execute("ROLLBACK TO SAVEPOINT landfall_create_table")
                .await
                .map_err(|e| store_error(qualified_table, "Failed to rollback DDL savepoint", &e))?;
            client
                .batch_execute("RELEASE SAVEPOINT landfall_create_table")
                .await
                .map_err(|e| store_error(qualified_table, "Failed to release DDL savepoint", &e))?;
            tracing::warn!(
                table = %qualified_table,
                "concurrent CREATE TABLE race detected (pg_type_typname_nsp_index); continuing"
            );
        }
        Err(error) => {
            return Err(store_error(
                qualified_table,
                &format!("Failed to create table {qualified_table}"),
                &error,
            ));
        }
    }
    Ok(())
}

/// Create `schema_name` and the table in one transaction under the DDL lock.
pub(crate) async fn ensure_table(
    client: &mut Client,
    schema_name: &str,
    table_name: &str,
    columns: &[NativeColumn<PgType>],
    create_indexes: bool,
) -> Result<(), StoreError> {
    let qualified_table = qualified_name(schema_name, table_name);
    let ddl = create_table_sql(&qualified_table, columns, create_indexes);

    let lock_name = format!("landfall:ddl:schema:{schema_name}");
    acquire_ddl_lock(client, &lock_name).await?;

    let result = async {
        let tx = client
            .transaction()
            .await
            .map_err(|e| store_error(table_name, "Failed to begin DDL transaction", &e))?;
        let create_schema = format!("CREATE SCHEMA IF NOT EXISTS {}", quote_identifier(schema_name));
        tx.batch_execute(&create_schema).await.map_err(|e| {
            store_error(
                table_name,
                &format!("Failed to create schema '{schema_name}'"),
                &e,
            )
        })?;
        create_table(&tx, &qualified_table, &ddl).await?;
        tx.commit()
            .await
            .map_err(|e| store_error(table_name, "Failed to commit DDL transaction", &e))
    }
    .await;

    let unlock_result = release_ddl_lock(client, &lock_name).await;
    match (result, unlock_result) {
        (Ok(()), Ok(())) => {
            tracing::info!(table = %qualified_table, columns = columns.len(), "table created");
            Ok(())
        }
        (Err(err), _) | (Ok(()), Err(err)) => Err(err),
    }
}

/// Add nullable columns; existing rows read them as NULL.
pub(crate) async fn add_columns(
    client: &mut Client,
    schema_name: &str,
    table_name: &str,
    columns: &[NativeColumn<PgType>],
) -> Result<(), StoreError> {
    let qualified_table = qualified_name(schema_name, table_name);

    let lock_name = format!("landfall:ddl:schema:{schema_name}");
    acquire_ddl_lock(client, &lock_name).await?;

    let result = async {
        let tx = client
            .transaction()
            .await
            .map_err(|e| store_error(table_name, "Failed to begin DDL transaction", &e))?;
        for column in columns {
            let sql = format!(
                "ALTER TABLE {} ADD COLUMN IF NOT EXISTS {} {}",
                qualified_table,
                quote_identifier(&column.name),
                column.native
            );
            tx.batch_execute(&sql).await.map_err(|e| {
                store_error(
                    table_name,
                    &format!("Failed to add column '{}'", column.name),
                    &e,
                )
            })?;
        }
        tx.commit()
            .await
            .map_err(|e| store_error(table_name, "Failed to commit DDL transaction", &e))
    }
    .await;

    let unlock_result = release_ddl_lock(client, &lock_name).await;
    match (result, unlock_result) {
        (Ok(()), Ok(())) => {
            tracing::info!(table = %qualified_table, added = columns.len(), "table extended");
            Ok(())
        }
        (Err(err), _) | (Ok(()), Err(err)) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_pg_type_typname_unique_violation_race() {
        assert!(is_pg_type_typname_race(
            "23505",
            "duplicate key value violates unique constraint \"pg_type_typname_nsp_index\"",
            "Key (typname, typnamespace)=(orders, 16425) already exists."
        ));
    }

    #[test]
    fn ignores_other_unique_violations() {
        assert!(!is_pg_type_typname_race(
            "23505",
            "duplicate key value violates unique constraint \"orders_pkey\"",
            "Key (id)=(42) already exists."
        ));
    }

    #[test]
    fn ignores_non_unique_violation_codes() {
        assert!(!is_pg_type_typname_race(
            "42P01",
            "relation \"shop.orders\" does not exist",
            ""
        ));
    }

    #[test]
    fn create_table_sql_renders_constraints() {
        let columns = vec![
            NativeColumn::new("id__", PgType::Varchar(None))
                .with_nullable(false)
                .with_unique(true),
            NativeColumn::new("amount", PgType::Numeric(Some((38, 9)))),
            NativeColumn::new("shape", PgType::Geometry { srid: 4326 }),
        ];
        let sql = create_table_sql(&qualified_name("shop", "orders"), &columns, true);
        assert_eq!(
            sql,
            "CREATE TABLE IF NOT EXISTS shop.orders (id__ varchar NOT NULL UNIQUE, \
             amount numeric(38,9), shape geometry(Geometry, 4326))"
        );
        let sql = create_table_sql(&qualified_name("shop", "orders"), &columns, false);
        assert!(!sql.contains("UNIQUE"));
    }

    #[test]
    fn sentinel_table_has_no_columns() {
        let sql = create_table_sql(&qualified_name("shop", "dlt_sentinel_table"), &[], true);
        assert_eq!(sql, "CREATE TABLE IF NOT EXISTS shop.dlt_sentinel_table ()");
    }

    #[test]
    fn identifiers_are_quoted_when_needed() {
        assert_eq!(qualified_name("Shop", "order items"), "\"Shop\".\"order items\"");
    }
}
