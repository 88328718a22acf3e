//! Shared types for landfall destinations.
//!
//! Pure data: the logical schema model, destination capabilities, identifier
//! naming, load-file naming, bookkeeping records and the structured
//! [`DestinationError`](error::DestinationError). Nothing here performs I/O.

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod capabilities;
pub mod error;
pub mod load;
pub mod naming;
pub mod records;
pub mod schema;

pub use capabilities::{Capability, DestinationCapabilities, TimestampUnit};
pub use error::{DestinationError, ErrorCategory};
pub use schema::{ColumnDef, ColumnType, DataType, LogicalSchema, LogicalTable, WriteDisposition};
