//! Arrow IPC files backing table data fragments and version manifests.

use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::path::Path;

use arrow::datatypes::{Schema, SchemaRef};
use arrow::ipc::reader::FileReader;
use arrow::ipc::writer::FileWriter;
use arrow::record_batch::RecordBatch;

use landfall_engine::store::{StoreError, StoreResult};

/// Write `batches` as a new IPC file. Fails with [`StoreError::Conflict`] if
/// `path` already exists, so two writers never share a file.
pub(crate) fn write_ipc_file(
    path: &Path,
    schema: &Schema,
    batches: &[RecordBatch],
    table: &str,
) -> StoreResult<()> {
    let file = match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::AlreadyExists => {
            return Err(StoreError::Conflict {
                table: table.to_string(),
                message: format!("{} was written concurrently", path.display()),
            })
        }
        Err(e) => return Err(e.into()),
    };
    let mut writer = FileWriter::try_new(file, schema)?;
    for batch in batches {
        writer.write(batch)?;
    }
    writer.finish()?;
    Ok(())
}

/// Read an IPC file: its schema (with metadata) and every batch.
pub(crate) fn read_ipc_file(path: &Path) -> StoreResult<(SchemaRef, Vec<RecordBatch>)> {
    let file = File::open(path)?;
    let reader = FileReader::try_new(file, None)?;
    let schema = reader.schema();
    let batches = reader.collect::<Result<Vec<_>, _>>()?;
    Ok((schema, batches))
}
