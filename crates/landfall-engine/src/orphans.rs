//! Orphan removal across a root-plus-children write group.
//!
//! After a `merge` of a root table with orphan removal on, rows of the root
//! whose `_dlt_id` is absent from the new root batch are deleted, and rows of
//! every child whose `_dlt_parent_id` is absent from the new batch of its
//! parent table are deleted with them. The batch paths of the group come from
//! a [`LineageReference`]; the whole group is validated and every payload is
//! built before the first delete is issued.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow::array::{new_null_array, ArrayRef};
use arrow::compute::concat_batches;
use arrow::datatypes::{Field, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;
use indexmap::IndexMap;

use landfall_types::capabilities::DestinationCapabilities;
use landfall_types::error::{DestinationError, Result};
use landfall_types::load::LineageReference;
use landfall_types::naming::normalize_identifier;
use landfall_types::schema::{LogicalSchema, DLT_ID_COLUMN, DLT_PARENT_ID_COLUMN};

use crate::arrow_utils::{cast_strict, default_array, normalize_columns, read_batch_file};
use crate::error::file_error;

/// One table of the group and the files whose keys survive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrphanTarget {
    /// Logical table to delete from.
    pub table: String,
    /// Key column of `table` compared against the payload.
    pub key: String,
    /// Column of the payload files holding the surviving keys.
    pub source_key: String,
    /// Batch files of the table itself (root) or of its parent (child).
    pub payload_files: Vec<PathBuf>,
}

impl OrphanTarget {
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.key == self.source_key
    }
}

/// Resolve every table of a lineage group to the files that decide its orphans.
///
/// Paths are grouped by table, in first-seen order; a table with several
/// files uses all of them.
///
/// # Errors
///
/// Returns a terminal `lineage` error when a path names a table unknown to
/// `schema`, a child's parent or root has no file in the group, or a table
/// lacks its key column.
pub fn plan(schema: &LogicalSchema, lineage: &LineageReference) -> Result<Vec<OrphanTarget>> {
    let mut groups: IndexMap<String, Vec<PathBuf>> = IndexMap::new();
    for (table, path) in lineage.entries()? {
        groups.entry(table).or_default().push(path);
    }

    let mut targets = Vec::with_capacity(groups.len());
    for (name, files) in &groups {
        let table = schema.get_table(name).ok_or_else(|| {
            DestinationError::lineage(
                "UNKNOWN_LINEAGE_TABLE",
                format!("lineage names table '{name}' which is not in schema '{}'", schema.name),
            )
            .with_table(name)
        })?;

        let target = match &table.parent {
            None => OrphanTarget {
                table: name.clone(),
                key: DLT_ID_COLUMN.to_string(),
                source_key: DLT_ID_COLUMN.to_string(),
                payload_files: files.clone(),
            },
            Some(parent) => {
                let root = schema.root_table(name).ok_or_else(|| {
                    DestinationError::lineage(
                        "BROKEN_TABLE_CHAIN",
                        format!("table '{name}' does not resolve to a root table"),
                    )
                    .with_table(name)
                })?;
                for required in [parent.as_str(), root.name.as_str()] {
                    if !groups.contains_key(required) {
                        return Err(DestinationError::lineage(
                            "MISSING_PARENT_FILE",
                            format!(
                                "child table '{name}' has no batch file for '{required}' in its lineage group"
                            ),
                        )
                        .with_table(name));
                    }
                }
                OrphanTarget {
                    table: name.clone(),
                    key: DLT_PARENT_ID_COLUMN.to_string(),
                    source_key: DLT_ID_COLUMN.to_string(),
                    payload_files: groups[parent.as_str()].clone(),
                }
            }
        };

        if !table.columns.contains_key(&target.key) {
            return Err(DestinationError::lineage(
                "MISSING_KEY_COLUMN",
                format!("table '{name}' has no '{}' column", target.key),
            )
            .with_table(name));
        }
        targets.push(target);
    }
    Ok(targets)
}

/// Build the payload for `target`, shaped like the stored table.
///
/// The surviving keys come from the payload files. Every other column of
/// `target_schema` is taken from the files when present and padded with a
/// type-specific placeholder otherwise. Values that cannot be cast, and
/// types without a placeholder, become nulls with a warning.
///
/// # Errors
///
/// Fails when a payload file cannot be read or lacks the key column.
pub fn build_payload(
    target: &OrphanTarget,
    target_schema: &SchemaRef,
    caps: &DestinationCapabilities,
) -> Result<RecordBatch> {
    let key = normalize_identifier(&target.key, caps);
    let source_key = normalize_identifier(&target.source_key, caps);
    if target_schema.field_with_name(&key).is_err() {
        return Err(DestinationError::lineage(
            "MISSING_KEY_COLUMN",
            format!("stored table has no '{key}' column"),
        )
        .with_table(&target.table));
    }
    let output = Arc::new(Schema::new(
        target_schema
            .fields()
            .iter()
            .map(|f| f.as_ref().clone().with_nullable(true))
            .collect::<Vec<Field>>(),
    ));

    let mut parts = Vec::with_capacity(target.payload_files.len());
    for path in &target.payload_files {
        let batch = read_batch_file(path)
            .map_err(|e| file_error("PAYLOAD_READ_FAILED", path, &e))
            .and_then(|b| {
                normalize_columns(&b, caps)
                    .map_err(|e| DestinationError::internal("ARROW_ERROR", e.to_string()))
            })
            .map_err(|e| e.with_table(&target.table))?;
        let keys = batch.column_by_name(&source_key).cloned().ok_or_else(|| {
            DestinationError::lineage(
                "MISSING_KEY_COLUMN",
                format!("payload file has no '{source_key}' column"),
            )
            .with_table(&target.table)
            .with_file(&path.display().to_string())
        })?;
        parts.push(pad(target, &batch, &keys, &key, &output, path)?);
    }

    concat_batches(&output, &parts)
        .map_err(|e| DestinationError::internal("ARROW_ERROR", e.to_string()).with_table(&target.table))
}

fn pad(
    target: &OrphanTarget,
    batch: &RecordBatch,
    keys: &ArrayRef,
    key: &str,
    output: &SchemaRef,
    path: &Path,
) -> Result<RecordBatch> {
    let rows = batch.num_rows();
    let columns = output
        .fields()
        .iter()
        .map(|field| {
            let source = if field.name() == key {
                Some(keys)
            } else if target.is_root() {
                batch.column_by_name(field.name())
            } else {
                None
            };
            let array = match source {
                Some(array) => cast_strict(array, field.data_type()).ok(),
                None => default_array(field.data_type(), rows),
            };
            array.unwrap_or_else(|| {
                tracing::warn!(
                    table = %target.table,
                    column = %field.name(),
                    file = %path.display(),
                    data_type = %field.data_type(),
                    "orphan removal payload column has no usable value, using null"
                );
                new_null_array(field.data_type(), rows)
            })
        })
        .collect::<Vec<ArrayRef>>();
    RecordBatch::try_new(Arc::clone(output), columns)
        .map_err(|e| DestinationError::internal("ARROW_ERROR", e.to_string()).with_table(&target.table))
}
