//! Embedded columnar vector store destination.
//!
//! Tables are versioned Arrow IPC fragments under a local root directory
//! (see [`store`]). Columns flagged `vectorize` feed an embedding vector
//! computed by the configured provider.

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
mod fragment;
pub mod store;
pub mod type_map;

use landfall_engine::{DestinationClient, EmbeddingRegistry};
use landfall_types::capabilities::Capability;
use landfall_types::error::{DestinationError, Result};
use landfall_types::schema::LogicalSchema;

pub use config::VectorConfig;
pub use store::LocalTableStore;
pub use type_map::{capabilities, ArrowTypeMapper};

/// Client over the vector store.
pub type VectorClient = DestinationClient<LocalTableStore, ArrowTypeMapper>;

/// Open the store at `config.uri` and build a client for `schema`.
///
/// The embedding provider named in the config is resolved from `registry`.
///
/// # Errors
///
/// Returns a `config` error for invalid configuration or an unknown
/// embedding provider, and a transient error when the root directory cannot
/// be opened.
pub fn connect(
    config: &VectorConfig,
    schema: LogicalSchema,
    registry: &EmbeddingRegistry,
) -> Result<VectorClient> {
    config.validate()?;
    let store = LocalTableStore::open(&config.uri).map_err(DestinationError::from)?;
    let embedder = registry.create(&config.embedding())?;
    tracing::info!(
        uri = %config.uri.display(),
        dataset = config.dataset_name.as_deref().unwrap_or(""),
        schema = %schema.name,
        "vector store opened"
    );
    DestinationClient::new(
        store,
        ArrowTypeMapper::default(),
        config.settings(),
        schema,
        &[Capability::StateSync, Capability::Embeddings],
    )?
    .with_embedder(embedder)
}
