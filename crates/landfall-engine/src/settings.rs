//! Resolved per-destination naming settings shared by the engine components.

use landfall_types::capabilities::DestinationCapabilities;
use landfall_types::naming::normalize_identifier;

/// Physical naming of tables and engine-managed columns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestinationSettings {
    /// Prefix applied to every physical table name, if any.
    pub dataset_name: Option<String>,
    pub dataset_separator: String,
    pub sentinel_table_name: String,
    /// Synthetic row id column added to user tables.
    pub id_field_name: String,
    /// Embedding vector column added to tables with `vectorize` columns.
    pub vector_field_name: String,
}

impl DestinationSettings {
    /// Physical name for a logical table: normalized, then dataset-prefixed.
    #[must_use]
    pub fn qualified_table_name(&self, caps: &DestinationCapabilities, table: &str) -> String {
        let name = normalize_identifier(table, caps);
        self.with_dataset_prefix(&name)
    }

    /// Physical name of the sentinel marker table.
    #[must_use]
    pub fn sentinel_table(&self) -> String {
        self.with_dataset_prefix(&self.sentinel_table_name)
    }

    /// Prefix shared by every table of this dataset; `None` without a dataset.
    #[must_use]
    pub fn dataset_prefix(&self) -> Option<String> {
        self.dataset_name
            .as_ref()
            .map(|ds| format!("{ds}{}", self.dataset_separator))
    }

    fn with_dataset_prefix(&self, name: &str) -> String {
        match self.dataset_prefix() {
            Some(prefix) => format!("{prefix}{name}"),
            None => name.to_string(),
        }
    }

    /// Whether `physical` is an engine-derived column name.
    #[must_use]
    pub fn is_derived_column(&self, physical: &str) -> bool {
        physical == self.id_field_name || physical == self.vector_field_name
    }
}

impl Default for DestinationSettings {
    fn default() -> Self {
        Self {
            dataset_name: None,
            dataset_separator: "___".to_string(),
            sentinel_table_name: "dltSentinelTable".to_string(),
            id_field_name: "id__".to_string(),
            vector_field_name: "vector".to_string(),
        }
    }
}
