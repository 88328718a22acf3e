//! Logical column types <-> Arrow storage types.

use std::collections::BTreeSet;

use arrow::datatypes::DataType;

use landfall_engine::arrow_utils::{arrow_type_for, timestamp_unit_of};
use landfall_engine::executor::vector_data_type;
use landfall_engine::type_mapper::{decimal_from_native, precision_for_unit};
use landfall_engine::TypeMapper;
use landfall_types::capabilities::{Capability, DestinationCapabilities};
use landfall_types::error::{DestinationError, Result};
use landfall_types::schema::{ColumnDef, ColumnType, DataType as LogicalType};

/// Largest decimal precision an Arrow column can hold.
const MAX_DECIMAL_PRECISION: u32 = 76;

/// Capabilities of the vector store.
#[must_use]
pub fn capabilities() -> DestinationCapabilities {
    DestinationCapabilities {
        decimal_precision: (38, 18),
        wei_precision: (MAX_DECIMAL_PRECISION, 0),
        timestamp_precision: 6,
        case_sensitive_identifiers: false,
        max_identifier_length: 200,
        features: BTreeSet::from([Capability::StateSync, Capability::Embeddings]),
    }
}

/// Arrow type mapping for [`crate::LocalTableStore`] tables.
#[derive(Debug, Clone)]
pub struct ArrowTypeMapper {
    caps: DestinationCapabilities,
}

impl ArrowTypeMapper {
    #[must_use]
    pub fn new(caps: DestinationCapabilities) -> Self {
        Self { caps }
    }
}

impl Default for ArrowTypeMapper {
    fn default() -> Self {
        Self::new(capabilities())
    }
}

fn unsupported(column: &ColumnDef, reason: impl std::fmt::Display) -> DestinationError {
    DestinationError::schema(
        "UNSUPPORTED_TYPE",
        format!("column '{}' ({}): {reason}", column.name, column.data_type),
    )
}

/// Signed integer width for a bigint precision in bits.
fn integer_type(bits: u32) -> DataType {
    match bits {
        0..=8 => DataType::Int8,
        9..=16 => DataType::Int16,
        17..=32 => DataType::Int32,
        _ => DataType::Int64,
    }
}

impl TypeMapper for ArrowTypeMapper {
    type Native = DataType;

    fn capabilities(&self) -> &DestinationCapabilities {
        &self.caps
    }

    fn to_destination_type(&self, column: &ColumnDef) -> Result<DataType> {
        match column.data_type {
            LogicalType::Bigint => Ok(column.precision.map_or(DataType::Int64, integer_type)),
            LogicalType::Decimal | LogicalType::Wei => {
                if let Some(p) = column.precision {
                    if !(1..=MAX_DECIMAL_PRECISION).contains(&p) {
                        return Err(unsupported(column, format!("precision {p} outside 1..=76")));
                    }
                    if column.scale.is_some_and(|s| s > p) {
                        return Err(unsupported(column, "scale exceeds precision"));
                    }
                }
                arrow_type_for(column, &self.caps).map_err(|e| unsupported(column, format!("{e:#}")))
            }
            _ => arrow_type_for(column, &self.caps).map_err(|e| unsupported(column, format!("{e:#}"))),
        }
    }

    fn from_destination_type(&self, native: &DataType) -> Result<ColumnType> {
        let ty = match native {
            DataType::Utf8 | DataType::LargeUtf8 => ColumnType::new(LogicalType::Text),
            DataType::Float32 | DataType::Float64 => ColumnType::new(LogicalType::Double),
            DataType::Boolean => ColumnType::new(LogicalType::Bool),
            DataType::Int8 => ColumnType::new(LogicalType::Bigint).with_precision(8),
            DataType::Int16 => ColumnType::new(LogicalType::Bigint).with_precision(16),
            DataType::Int32 => ColumnType::new(LogicalType::Bigint).with_precision(32),
            DataType::Int64 => ColumnType::new(LogicalType::Bigint),
            DataType::Binary | DataType::LargeBinary => ColumnType::new(LogicalType::Binary),
            DataType::Date32 => ColumnType::new(LogicalType::Date),
            DataType::Timestamp(unit, _) => {
                let precision = precision_for_unit(&self.caps, timestamp_unit_of(unit));
                let ty = ColumnType::new(LogicalType::Timestamp);
                precision.map_or(ty, |p| ty.with_precision(p))
            }
            DataType::Time32(unit) | DataType::Time64(unit) => {
                let precision = precision_for_unit(&self.caps, timestamp_unit_of(unit));
                let ty = ColumnType::new(LogicalType::Time);
                precision.map_or(ty, |p| ty.with_precision(p))
            }
            DataType::Decimal128(p, s) | DataType::Decimal256(p, s) => {
                let scale = u32::try_from(*s).map_err(|_| {
                    DestinationError::schema(
                        "UNSUPPORTED_TYPE",
                        format!("negative decimal scale in {native}"),
                    )
                })?;
                decimal_from_native(&self.caps, u32::from(*p), scale)
            }
            other => {
                return Err(DestinationError::schema(
                    "UNSUPPORTED_TYPE",
                    format!("no logical type for arrow type {other}"),
                ))
            }
        };
        Ok(ty)
    }

    fn vector_type(&self, dimensions: usize) -> Option<DataType> {
        Some(vector_data_type(dimensions))
    }

    fn supports_round_trip(&self, column: &ColumnType) -> bool {
        let default_precision = Some(self.caps.timestamp_precision);
        match column.data_type {
            // Stored as text.
            LogicalType::Json => false,
            LogicalType::Text | LogicalType::Double | LogicalType::Bool | LogicalType::Date
            | LogicalType::Binary => column.precision.is_none() && column.scale.is_none(),
            LogicalType::Bigint => {
                column.scale.is_none() && matches!(column.precision, None | Some(8 | 16 | 32))
            }
            LogicalType::Timestamp | LogicalType::Time => {
                column.scale.is_none()
                    && matches!(column.precision, None | Some(0 | 3 | 6 | 9))
                    && column.precision != default_precision
            }
            LogicalType::Decimal => match (column.precision, column.scale) {
                (None, None) => true,
                (Some(p), Some(s)) => {
                    (1..=MAX_DECIMAL_PRECISION).contains(&p)
                        && s <= p
                        && (p, s) != self.caps.decimal_precision
                        && (p, s) != self.caps.wei_precision
                }
                _ => false,
            },
            LogicalType::Wei => column.precision.is_none() && column.scale.is_none(),
        }
    }
}
