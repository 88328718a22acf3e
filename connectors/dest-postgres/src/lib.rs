//! PostgreSQL destination for landfall.
//!
//! Tables live in the schema named by `dataset_name`. Batches are written
//! inside a transaction, with multi-value `INSERT`s or CSV `COPY` (see
//! [`LoadMethod`]). A `replace` load either truncates its tables once and
//! appends every file, or fills staging copies that replace the table chain
//! once it has loaded (see [`ReplaceStrategy`]).

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

mod batch;
mod client;
pub mod config;
mod ddl;
mod error;
mod geometry;
pub mod store;
pub mod type_map;

use landfall_engine::DestinationClient;
use landfall_types::capabilities::Capability;
use landfall_types::error::{DestinationError, Result};
use landfall_types::schema::LogicalSchema;

pub use config::{LoadMethod, PostgresConfig, ReplaceStrategy};
pub use store::PostgresTableStore;
pub use type_map::{capabilities, PgType, PostgresTypeMapper};

/// Client over a PostgreSQL dataset schema.
pub type PostgresClient = DestinationClient<PostgresTableStore, PostgresTypeMapper>;

/// Capabilities for a configured destination.
///
/// `staging-optimized` replaces add [`Capability::StagingReplace`].
#[must_use]
pub fn capabilities_for(config: &PostgresConfig) -> landfall_types::capabilities::DestinationCapabilities {
    let caps = capabilities();
    match config.replace_strategy {
        ReplaceStrategy::StagingOptimized => caps.with_feature(Capability::StagingReplace),
        ReplaceStrategy::TruncateAndInsert => caps,
    }
}

/// Connect to the server in `config` and build a client for `schema`.
///
/// # Errors
///
/// Returns a `config` error for invalid configuration and a transient error
/// when the server cannot be reached.
pub async fn connect(config: &PostgresConfig, schema: LogicalSchema) -> Result<PostgresClient> {
    config.validate()?;
    let store = PostgresTableStore::connect(config)
        .await
        .map_err(DestinationError::from)?;
    tracing::info!(
        host = %config.host,
        database = %config.database,
        dataset = %config.dataset_name,
        replace_strategy = %config.replace_strategy,
        load_method = %config.load_method,
        schema = %schema.name,
        "postgres destination connected"
    );
    let mut required = vec![Capability::StateSync];
    if config.replace_strategy == ReplaceStrategy::StagingOptimized {
        required.push(Capability::StagingReplace);
    }
    DestinationClient::new(
        store,
        PostgresTypeMapper::new(capabilities_for(config)),
        config.settings(),
        schema,
        &required,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use landfall_types::error::ErrorCategory;

    #[test]
    fn staging_strategy_adds_capability() {
        let mut config = PostgresConfig::new("localhost", "loader", "warehouse");
        assert!(!capabilities_for(&config).has(Capability::StagingReplace));
        config.replace_strategy = ReplaceStrategy::StagingOptimized;
        assert!(capabilities_for(&config).has(Capability::StagingReplace));
    }

    #[tokio::test]
    async fn connect_rejects_invalid_config_before_dialing() {
        let mut config = PostgresConfig::new("localhost", "loader", "warehouse");
        config.dataset_name.clear();
        let err = connect(&config, LogicalSchema::new("s")).await.err().unwrap();
        assert_eq!(err.category, ErrorCategory::Config);
    }

    #[tokio::test]
    async fn unreachable_server_is_transient() {
        let mut config = PostgresConfig::new("127.0.0.1", "loader", "warehouse");
        // Nothing listens on port 1.
        config.port = 1;
        config.connect_timeout_secs = 2;
        let err = connect(&config, LogicalSchema::new("s")).await.err().unwrap();
        assert_eq!(err.category, ErrorCategory::TransientStore);
        assert!(err.retryable);
    }
}
