//! Translation of store failures into the destination error taxonomy.

use landfall_types::error::DestinationError;

use crate::store::StoreError;

pub use landfall_types::error::Result;

impl From<StoreError> for DestinationError {
    fn from(err: StoreError) -> Self {
        let message = err.to_string();
        match err {
            StoreError::Unavailable(_) => {
                DestinationError::transient_store("STORE_UNAVAILABLE", message)
            }
            StoreError::TableNotFound(table) => {
                DestinationError::transient_store("TABLE_NOT_FOUND", message).with_table(&table)
            }
            StoreError::Conflict { table, .. } => {
                DestinationError::transient_store("COMMIT_CONFLICT", message).with_table(&table)
            }
            StoreError::Io(_) => DestinationError::transient_store("STORE_IO", message),
            StoreError::TypeMismatch { table, .. } => {
                DestinationError::data("TYPE_MISMATCH", message).with_table(&table)
            }
            StoreError::UnknownColumn { table, .. } => {
                DestinationError::schema("UNKNOWN_COLUMN", message).with_table(&table)
            }
            StoreError::Invalid(_) => DestinationError::config("INVALID_REQUEST", message),
            StoreError::Arrow(_) => DestinationError::internal("ARROW_ERROR", message),
            StoreError::LockPoisoned => DestinationError::internal("LOCK_POISONED", message),
        }
    }
}

/// Attach table context while converting a store result.
pub(crate) trait StoreResultExt<T> {
    fn for_table(self, table: &str) -> Result<T>;
}

impl<T> StoreResultExt<T> for std::result::Result<T, StoreError> {
    fn for_table(self, table: &str) -> Result<T> {
        self.map_err(|e| DestinationError::from(e).with_table(table))
    }
}

/// Wrap an `anyhow` failure from batch-file handling.
pub(crate) fn file_error(code: &str, path: &std::path::Path, err: &anyhow::Error) -> DestinationError {
    DestinationError::internal(code, format!("{err:#}")).with_file(&path.display().to_string())
}
