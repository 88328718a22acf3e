use std::fmt;
use std::time::Duration;

use serde::Deserialize;

use landfall_engine::DestinationSettings;
use landfall_types::error::DestinationError;

/// How `replace` loads swap in the new table contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReplaceStrategy {
    /// `TRUNCATE` once when the load is prepared, then insert every file.
    #[default]
    TruncateAndInsert,
    /// Insert every file into a staging copy, then drop each table of the
    /// chain and move its copy in.
    StagingOptimized,
}

impl fmt::Display for ReplaceStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TruncateAndInsert => f.write_str("truncate-and-insert"),
            Self::StagingOptimized => f.write_str("staging-optimized"),
        }
    }
}

/// How batches reach their table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadMethod {
    /// Multi-value `INSERT` statements with bound parameters.
    #[default]
    Insert,
    /// CSV `COPY ... FROM STDIN`. Tables with geometry columns cannot be bulk loaded.
    Copy,
}

impl fmt::Display for LoadMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Insert => f.write_str("insert"),
            Self::Copy => f.write_str("copy"),
        }
    }
}

/// PostgreSQL destination config from pipeline YAML.
#[derive(Debug, Clone, Deserialize)]
pub struct PostgresConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub user: String,
    #[serde(default)]
    pub password: String,
    pub database: String,
    /// Target schema holding every table of the dataset.
    #[serde(default = "default_dataset_name")]
    pub dataset_name: String,
    #[serde(default = "default_staging_dataset_suffix")]
    pub staging_dataset_suffix: String,
    #[serde(default)]
    pub replace_strategy: ReplaceStrategy,
    #[serde(default)]
    pub load_method: LoadMethod,
    /// Bytes buffered before each COPY send.
    #[serde(default)]
    pub copy_flush_bytes: Option<usize>,
    #[serde(default = "default_create_indexes")]
    pub create_indexes: bool,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_id_field_name")]
    pub id_field_name: String,
    #[serde(default = "default_sentinel_table_name")]
    pub sentinel_table_name: String,
}

fn default_port() -> u16 {
    5432
}

fn default_dataset_name() -> String {
    "public".to_string()
}

fn default_staging_dataset_suffix() -> String {
    "_staging".to_string()
}

fn default_create_indexes() -> bool {
    true
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_id_field_name() -> String {
    "id__".to_string()
}

fn default_sentinel_table_name() -> String {
    "dlt_sentinel_table".to_string()
}

impl PostgresConfig {
    /// Config for `user@host/database` with every other field defaulted.
    pub fn new(host: impl Into<String>, user: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: default_port(),
            user: user.into(),
            password: String::new(),
            database: database.into(),
            dataset_name: default_dataset_name(),
            staging_dataset_suffix: default_staging_dataset_suffix(),
            replace_strategy: ReplaceStrategy::default(),
            load_method: LoadMethod::default(),
            copy_flush_bytes: None,
            create_indexes: default_create_indexes(),
            connect_timeout_secs: default_connect_timeout_secs(),
            id_field_name: default_id_field_name(),
            sentinel_table_name: default_sentinel_table_name(),
        }
    }

    pub fn validate(&self) -> Result<(), DestinationError> {
        for (label, value) in [
            ("host", &self.host),
            ("user", &self.user),
            ("database", &self.database),
            ("dataset_name", &self.dataset_name),
            ("staging_dataset_suffix", &self.staging_dataset_suffix),
            ("id_field_name", &self.id_field_name),
            ("sentinel_table_name", &self.sentinel_table_name),
        ] {
            if value.is_empty() {
                return Err(DestinationError::config(
                    "INVALID_CONFIG",
                    format!("{label} must not be empty"),
                ));
            }
        }
        if self.connect_timeout_secs == 0 {
            return Err(DestinationError::config(
                "INVALID_CONFIG",
                "connect_timeout_secs must be positive",
            ));
        }
        if self.copy_flush_bytes == Some(0) {
            return Err(DestinationError::config(
                "INVALID_CONFIG",
                "copy_flush_bytes must be positive",
            ));
        }
        Ok(())
    }

    /// Schema that holds staging copies during `staging-optimized` replaces.
    #[must_use]
    pub fn staging_schema(&self) -> String {
        format!("{}{}", self.dataset_name, self.staging_dataset_suffix)
    }

    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Engine naming settings. Tables are qualified by schema inside the
    /// store, so physical names carry no dataset prefix.
    #[must_use]
    pub fn settings(&self) -> DestinationSettings {
        DestinationSettings {
            dataset_name: None,
            sentinel_table_name: self.sentinel_table_name.clone(),
            id_field_name: self.id_field_name.clone(),
            ..DestinationSettings::default()
        }
    }
}
