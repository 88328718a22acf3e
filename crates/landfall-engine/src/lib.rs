//! Schema-evolution and write-disposition engine for landfall destinations.
//!
//! A destination connector supplies a [`TableStore`] over its vendor client
//! and a [`TypeMapper`] for its native types; [`DestinationClient`] ties them
//! to the diff engine, the disposition executor, the bookkeeping tables and
//! the load jobs.

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod arrow_utils;
pub mod client;
pub mod diff;
pub mod embedding;
pub mod error;
pub mod executor;
pub mod jobs;
pub mod orphans;
pub mod settings;
pub mod store;
pub mod type_mapper;
pub mod version_store;

#[cfg(test)]
pub(crate) mod testing;

pub use client::DestinationClient;
pub use diff::{SchemaDelta, SchemaDiffEngine, TableDelta};
pub use embedding::{EmbeddingConfig, EmbeddingProvider, EmbeddingRegistry};
pub use executor::WriteDispositionExecutor;
pub use jobs::{JobKind, JobState, LoadJob};
pub use settings::DestinationSettings;
pub use store::{MergeMode, NativeColumn, ReplaceMode, StoreError, StoreResult, TableStore};
pub use type_mapper::TypeMapper;
pub use version_store::SchemaVersionStore;
