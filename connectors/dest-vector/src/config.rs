use std::path::PathBuf;

use serde::Deserialize;

use landfall_engine::{DestinationSettings, EmbeddingConfig};
use landfall_types::error::DestinationError;

/// Vector store destination config from pipeline YAML.
#[derive(Debug, Clone, Deserialize)]
pub struct VectorConfig {
    /// Root directory holding one sub-directory per table.
    pub uri: PathBuf,
    #[serde(default)]
    pub dataset_name: Option<String>,
    #[serde(default = "default_dataset_separator")]
    pub dataset_separator: String,
    #[serde(default = "default_sentinel_table_name")]
    pub sentinel_table_name: String,
    #[serde(default = "default_vector_field_name")]
    pub vector_field_name: String,
    #[serde(default = "default_id_field_name")]
    pub id_field_name: String,
    #[serde(default = "default_embedding_model_provider")]
    pub embedding_model_provider: String,
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,
    #[serde(default = "default_embedding_model_dimensions")]
    pub embedding_model_dimensions: usize,
    #[serde(default)]
    pub embedding_model_provider_api_key: Option<String>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_dataset_separator() -> String {
    "___".to_string()
}

fn default_sentinel_table_name() -> String {
    "dltSentinelTable".to_string()
}

fn default_vector_field_name() -> String {
    "vector".to_string()
}

fn default_id_field_name() -> String {
    "id__".to_string()
}

fn default_embedding_model_provider() -> String {
    landfall_engine::embedding::HASHING_PROVIDER.to_string()
}

fn default_embedding_model() -> String {
    "feature-hash-v1".to_string()
}

fn default_embedding_model_dimensions() -> usize {
    384
}

fn default_max_retries() -> u32 {
    3
}

impl VectorConfig {
    /// Config rooted at `uri` with every other field defaulted.
    pub fn new(uri: impl Into<PathBuf>) -> Self {
        Self {
            uri: uri.into(),
            dataset_name: None,
            dataset_separator: default_dataset_separator(),
            sentinel_table_name: default_sentinel_table_name(),
            vector_field_name: default_vector_field_name(),
            id_field_name: default_id_field_name(),
            embedding_model_provider: default_embedding_model_provider(),
            embedding_model: default_embedding_model(),
            embedding_model_dimensions: default_embedding_model_dimensions(),
            embedding_model_provider_api_key: None,
            max_retries: default_max_retries(),
        }
    }

    pub fn validate(&self) -> Result<(), DestinationError> {
        if self.uri.as_os_str().is_empty() {
            return Err(DestinationError::config("INVALID_CONFIG", "uri must not be empty"));
        }
        if self.dataset_name.as_deref() == Some("") {
            return Err(DestinationError::config(
                "INVALID_CONFIG",
                "dataset_name must not be empty when set",
            ));
        }
        for (label, value) in [
            ("sentinel_table_name", &self.sentinel_table_name),
            ("vector_field_name", &self.vector_field_name),
            ("id_field_name", &self.id_field_name),
        ] {
            if value.is_empty() {
                return Err(DestinationError::config(
                    "INVALID_CONFIG",
                    format!("{label} must not be empty"),
                ));
            }
        }
        if self.vector_field_name == self.id_field_name {
            return Err(DestinationError::config(
                "INVALID_CONFIG",
                format!(
                    "vector_field_name and id_field_name are both '{}'",
                    self.id_field_name
                ),
            ));
        }
        if self.embedding_model_dimensions == 0 {
            return Err(DestinationError::config(
                "INVALID_CONFIG",
                "embedding_model_dimensions must be positive",
            ));
        }
        Ok(())
    }

    pub fn settings(&self) -> DestinationSettings {
        DestinationSettings {
            dataset_name: self.dataset_name.clone(),
            dataset_separator: self.dataset_separator.clone(),
            sentinel_table_name: self.sentinel_table_name.clone(),
            id_field_name: self.id_field_name.clone(),
            vector_field_name: self.vector_field_name.clone(),
        }
    }

    pub fn embedding(&self) -> EmbeddingConfig {
        EmbeddingConfig {
            provider: self.embedding_model_provider.clone(),
            model: self.embedding_model.clone(),
            dimensions: self.embedding_model_dimensions,
            api_key: self.embedding_model_provider_api_key.clone(),
            max_retries: self.max_retries,
        }
    }
}
