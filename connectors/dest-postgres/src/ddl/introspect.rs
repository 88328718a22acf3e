//! Table and column introspection through `information_schema`.

use std::collections::{HashMap, HashSet};

use tokio_postgres::GenericClient;

use landfall_engine::{NativeColumn, StoreError};

use crate::error::store_error;
use crate::type_map::PgType;

pub(crate) async fn list_tables<C: GenericClient>(
    client: &C,
    schema_name: &str,
) -> Result<Vec<String>, StoreError> {
    let rows = client
        .query(
            "SELECT table_name::text FROM information_schema.tables \
             WHERE table_schema = $1 AND table_type = 'BASE TABLE' \
             ORDER BY table_name",
            &[&schema_name],
        )
        .await
        .map_err(|e| store_error(schema_name, "Failed to list tables", &e))?;
    Ok(rows.iter().map(|r| r.get(0)).collect())
}

pub(crate) async fn table_exists<C: GenericClient>(
    client: &C,
    schema_name: &str,
    table_name: &str,
) -> Result<bool, StoreError> {
    let row = client
        .query_one(
            "SELECT EXISTS (SELECT 1 FROM information_schema.tables \
             WHERE table_schema = $1 AND table_name = $2)",
            &[&schema_name, &table_name],
        )
        .await
        .map_err(|e| store_error(table_name, "Failed to check table existence", &e))?;
    Ok(row.get(0))
}

/// Columns backed by a single-column UNIQUE or PRIMARY KEY constraint.
async fn unique_columns<C: GenericClient>(
    client: &C,
    schema_name: &str,
    table_name: &str,
) -> Result<HashSet<String>, StoreError> {
    let rows = client
        .query(
            "SELECT max(k.column_name::text) \
             FROM information_schema.table_constraints c \
             JOIN information_schema.key_column_usage k \
               ON k.constraint_schema = c.constraint_schema \
              AND k.constraint_name = c.constraint_name \
             WHERE c.table_schema = $1 AND c.table_name = $2 \
               AND c.constraint_type IN ('UNIQUE', 'PRIMARY KEY') \
             GROUP BY c.constraint_name \
             HAVING count(*) = 1",
            &[&schema_name, &table_name],
        )
        .await
        .map_err(|e| store_error(table_name, "Failed to query unique constraints", &e))?;
    Ok(rows.iter().map(|r| r.get(0)).collect())
}

/// SRID per geometry column; only queried when the table has one.
async fn geometry_srids<C: GenericClient>(
    client: &C,
    schema_name: &str,
    table_name: &str,
) -> Result<HashMap<String, u32>, StoreError> {
    let rows = client
        .query(
            "SELECT f_geometry_column::text, srid FROM geometry_columns \
             WHERE f_table_schema = $1 AND f_table_name = $2",
            &[&schema_name, &table_name],
        )
        .await
        .map_err(|e| store_error(table_name, "Failed to query geometry columns", &e))?;
    Ok(rows
        .iter()
        .filter_map(|r| {
            let srid: i32 = r.get(1);
            Some((r.get(0), u32::try_from(srid).ok()?))
        })
        .collect())
}

/// Fetch existing columns in ordinal order; `None` when the table is absent.
pub(crate) async fn get_existing_columns<C: GenericClient>(
    client: &C,
    schema_name: &str,
    table_name: &str,
) -> Result<Option<Vec<NativeColumn<PgType>>>, StoreError> {
    if !table_exists(client, schema_name, table_name).await? {
        return Ok(None);
    }
    let rows = client
        .query(
            "SELECT column_name::text, data_type::text, udt_name::text, is_nullable::text, \
                    character_maximum_length::int4, numeric_precision::int4, \
                    numeric_scale::int4, datetime_precision::int4 \
             FROM information_schema.columns \
             WHERE table_schema = $1 AND table_name = $2 \
             ORDER BY ordinal_position",
            &[&schema_name, &table_name],
        )
        .await
        .map_err(|e| store_error(table_name, "Failed to query existing columns", &e))?;

    let unique = unique_columns(client, schema_name, table_name).await?;
    let mut columns: Vec<NativeColumn<PgType>> = rows
        .iter()
        .map(|r| {
            let name: String = r.get(0);
            let data_type: String = r.get(1);
            let udt_name: String = r.get(2);
            let nullable: String = r.get(3);
            let precision: Option<i32> = r.get(5);
            let scale: Option<i32> = r.get(6);
            let native = PgType::from_information_schema(
                &data_type,
                &udt_name,
                r.get(4),
                precision.zip(scale),
                r.get(7),
            );
            let is_unique = unique.contains(&name);
            NativeColumn::new(name, native)
                .with_nullable(nullable == "YES")
                .with_unique(is_unique)
        })
        .collect();

    if columns.iter().any(|c| c.native.is_geometry()) {
        let srids = geometry_srids(client, schema_name, table_name).await?;
        for column in &mut columns {
            if let (PgType::Geometry { srid }, Some(found)) = (&mut column.native, srids.get(&column.name)) {
                *srid = *found;
            }
        }
    }
    Ok(Some(columns))
}
