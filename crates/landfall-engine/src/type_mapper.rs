//! Logical <-> native type mapping contract.

use landfall_types::capabilities::{DestinationCapabilities, TimestampUnit};
use landfall_types::error::{DestinationError, Result};
use landfall_types::schema::{ColumnDef, ColumnType, DataType};

/// Bidirectional mapping between logical column types and a destination's
/// native types.
///
/// For every type a mapper supports,
/// `from_destination_type(to_destination_type(c))` reproduces the logical
/// type, precision and scale of `c`.
pub trait TypeMapper: Send + Sync {
    type Native: Clone + std::fmt::Debug + PartialEq + Send + Sync;

    fn capabilities(&self) -> &DestinationCapabilities;

    /// Native type for a logical column, honoring its hints.
    ///
    /// # Errors
    ///
    /// Returns a `schema` error for precisions the destination cannot hold.
    fn to_destination_type(&self, column: &ColumnDef) -> Result<Self::Native>;

    /// Logical type for an introspected native type.
    ///
    /// # Errors
    ///
    /// Returns a `schema` error for native types with no logical counterpart.
    fn from_destination_type(&self, native: &Self::Native) -> Result<ColumnType>;

    /// Native type of a fixed-width embedding vector, if the destination stores one.
    fn vector_type(&self, _dimensions: usize) -> Option<Self::Native> {
        None
    }

    /// Whether `column` round-trips through this mapper exactly.
    fn supports_round_trip(&self, column: &ColumnType) -> bool {
        let _ = column;
        true
    }
}

/// Timestamp/time unit for a column: its own precision, else the destination default.
///
/// # Errors
///
/// Returns a `schema` error when the column precision is not 0, 3, 6 or 9.
pub fn timestamp_unit(caps: &DestinationCapabilities, precision: Option<u32>) -> Result<TimestampUnit> {
    match precision {
        None => Ok(caps.timestamp_unit()),
        Some(p) => TimestampUnit::from_precision(p).ok_or_else(|| {
            DestinationError::schema(
                "UNSUPPORTED_TIMESTAMP_PRECISION",
                format!("timestamp precision {p} is not one of 0, 3, 6, 9"),
            )
        }),
    }
}

/// Precision to record for an introspected timestamp unit.
///
/// The destination default maps back to "unspecified" so default columns round-trip.
#[must_use]
pub fn precision_for_unit(caps: &DestinationCapabilities, unit: TimestampUnit) -> Option<u32> {
    if unit == caps.timestamp_unit() {
        None
    } else {
        Some(unit.precision())
    }
}

/// (precision, scale) of a decimal or wei column after capability defaults.
#[must_use]
pub fn decimal_precision(caps: &DestinationCapabilities, column: &ColumnDef) -> (u32, u32) {
    let (default_p, default_s) = match column.data_type {
        DataType::Wei => caps.wei_precision,
        _ => caps.decimal_precision,
    };
    match (column.precision, column.scale) {
        (Some(p), Some(s)) => (p, s),
        (Some(p), None) => (p, 0),
        (None, _) => (default_p, default_s),
    }
}

/// Logical type for an introspected (precision, scale) decimal.
///
/// The capability wei pair maps to wei; the capability decimal default maps to
/// an unparameterised decimal; anything else keeps its explicit precision.
#[must_use]
pub fn decimal_from_native(caps: &DestinationCapabilities, precision: u32, scale: u32) -> ColumnType {
    if (precision, scale) == caps.wei_precision {
        ColumnType::new(DataType::Wei)
    } else if (precision, scale) == caps.decimal_precision {
        ColumnType::new(DataType::Decimal)
    } else {
        ColumnType::new(DataType::Decimal)
            .with_precision(precision)
            .with_scale(scale)
    }
}
