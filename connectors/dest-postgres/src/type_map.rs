//! Logical column types <-> PostgreSQL column types.

use std::collections::BTreeSet;
use std::fmt;

use landfall_engine::type_mapper::{decimal_from_native, decimal_precision, timestamp_unit};
use landfall_engine::TypeMapper;
use landfall_types::capabilities::{Capability, DestinationCapabilities};
use landfall_types::error::{DestinationError, Result};
use landfall_types::schema::{ColumnDef, ColumnType, DataType};

/// Upper bound PostgreSQL accepts for `numeric(p, s)`.
const MAX_NUMERIC_PRECISION: u32 = 1000;

/// Finest fractional-second precision of `timestamp`/`time`.
const MAX_TIME_PRECISION: u32 = 6;

/// SRID used for geometry columns without one.
pub const DEFAULT_SRID: u32 = 4326;

/// Capabilities of the PostgreSQL destination.
#[must_use]
pub fn capabilities() -> DestinationCapabilities {
    DestinationCapabilities {
        decimal_precision: (38, 9),
        wei_precision: (78, 18),
        timestamp_precision: 6,
        case_sensitive_identifiers: false,
        max_identifier_length: 63,
        features: BTreeSet::from([Capability::StateSync]),
    }
}

/// A PostgreSQL column type as rendered in DDL and read back from
/// `information_schema`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PgType {
    Varchar(Option<u32>),
    Text,
    Jsonb,
    DoublePrecision,
    Boolean,
    /// `timestamp (p) with time zone`
    Timestamptz(u32),
    /// `time (p) without time zone`
    Time(u32),
    Date,
    Smallint,
    Integer,
    Bigint,
    Bytea,
    /// `numeric(p, s)`; `None` when unconstrained.
    Numeric(Option<(u32, u32)>),
    Geometry { srid: u32 },
    /// Anything else found on an existing table.
    Other(String),
}

impl PgType {
    #[must_use]
    pub fn is_geometry(&self) -> bool {
        matches!(self, Self::Geometry { .. })
    }

    /// Parse the `information_schema.columns` description of a column.
    ///
    /// `udt_name` disambiguates user-defined types such as PostGIS `geometry`.
    #[must_use]
    pub fn from_information_schema(
        data_type: &str,
        udt_name: &str,
        char_length: Option<i32>,
        numeric: Option<(i32, i32)>,
        datetime_precision: Option<i32>,
    ) -> Self {
        let unsigned = |v: i32| u32::try_from(v).ok();
        let fractional = datetime_precision
            .and_then(unsigned)
            .unwrap_or(MAX_TIME_PRECISION);
        match data_type {
            "character varying" => Self::Varchar(char_length.and_then(unsigned)),
            "text" => Self::Text,
            "jsonb" => Self::Jsonb,
            "double precision" => Self::DoublePrecision,
            "boolean" => Self::Boolean,
            "timestamp with time zone" => Self::Timestamptz(fractional),
            "time without time zone" => Self::Time(fractional),
            "date" => Self::Date,
            "smallint" => Self::Smallint,
            "integer" => Self::Integer,
            "bigint" => Self::Bigint,
            "bytea" => Self::Bytea,
            "numeric" => Self::Numeric(
                numeric.and_then(|(p, s)| Some((unsigned(p)?, unsigned(s)?))),
            ),
            "USER-DEFINED" if udt_name == "geometry" => Self::Geometry { srid: DEFAULT_SRID },
            other => Self::Other(other.to_string()),
        }
    }
}

impl fmt::Display for PgType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Varchar(Some(n)) => write!(f, "varchar({n})"),
            Self::Varchar(None) => f.write_str("varchar"),
            Self::Text => f.write_str("text"),
            Self::Jsonb => f.write_str("jsonb"),
            Self::DoublePrecision => f.write_str("double precision"),
            Self::Boolean => f.write_str("boolean"),
            Self::Timestamptz(p) => write!(f, "timestamp ({p}) with time zone"),
            Self::Time(p) => write!(f, "time ({p}) without time zone"),
            Self::Date => f.write_str("date"),
            Self::Smallint => f.write_str("smallint"),
            Self::Integer => f.write_str("integer"),
            Self::Bigint => f.write_str("bigint"),
            Self::Bytea => f.write_str("bytea"),
            Self::Numeric(Some((p, s))) => write!(f, "numeric({p},{s})"),
            Self::Numeric(None) => f.write_str("numeric"),
            Self::Geometry { srid } => write!(f, "geometry(Geometry, {srid})"),
            Self::Other(name) => f.write_str(name),
        }
    }
}

/// PostgreSQL type mapping for [`crate::PostgresTableStore`] tables.
#[derive(Debug, Clone)]
pub struct PostgresTypeMapper {
    caps: DestinationCapabilities,
}

impl PostgresTypeMapper {
    #[must_use]
    pub fn new(caps: DestinationCapabilities) -> Self {
        Self { caps }
    }
}

impl Default for PostgresTypeMapper {
    fn default() -> Self {
        Self::new(capabilities())
    }
}

fn unsupported(column: &ColumnDef, reason: impl fmt::Display) -> DestinationError {
    DestinationError::schema(
        "UNSUPPORTED_TYPE",
        format!("column '{}' ({}): {reason}", column.name, column.data_type),
    )
}

impl PostgresTypeMapper {
    fn fractional_precision(&self, column: &ColumnDef) -> Result<u32> {
        let unit = timestamp_unit(&self.caps, column.precision)?;
        let precision = unit.precision();
        if precision > MAX_TIME_PRECISION {
            return Err(unsupported(
                column,
                format!("precision {precision} exceeds {MAX_TIME_PRECISION}"),
            ));
        }
        Ok(precision)
    }

    fn introspected_precision(&self, precision: u32) -> Option<u32> {
        (precision != self.caps.timestamp_precision).then_some(precision)
    }
}

impl TypeMapper for PostgresTypeMapper {
    type Native = PgType;

    fn capabilities(&self) -> &DestinationCapabilities {
        &self.caps
    }

    fn to_destination_type(&self, column: &ColumnDef) -> Result<PgType> {
        if column.hints.geometry {
            return Ok(PgType::Geometry {
                srid: column.hints.srid.unwrap_or(DEFAULT_SRID),
            });
        }
        let ty = match column.data_type {
            DataType::Text => match column.precision {
                Some(0) => return Err(unsupported(column, "varchar length must be positive")),
                length => PgType::Varchar(length),
            },
            DataType::Json => PgType::Jsonb,
            DataType::Double => PgType::DoublePrecision,
            DataType::Bool => PgType::Boolean,
            DataType::Timestamp => PgType::Timestamptz(self.fractional_precision(column)?),
            DataType::Time => PgType::Time(self.fractional_precision(column)?),
            DataType::Date => PgType::Date,
            DataType::Binary => PgType::Bytea,
            DataType::Bigint => match column.precision {
                Some(0..=16) => PgType::Smallint,
                Some(17..=32) => PgType::Integer,
                _ => PgType::Bigint,
            },
            DataType::Decimal | DataType::Wei => {
                let (p, s) = decimal_precision(&self.caps, column);
                if !(1..=MAX_NUMERIC_PRECISION).contains(&p) {
                    return Err(unsupported(
                        column,
                        format!("precision {p} outside 1..={MAX_NUMERIC_PRECISION}"),
                    ));
                }
                if s > p {
                    return Err(unsupported(column, "scale exceeds precision"));
                }
                PgType::Numeric(Some((p, s)))
            }
        };
        Ok(ty)
    }

    fn from_destination_type(&self, native: &PgType) -> Result<ColumnType> {
        let ty = match native {
            PgType::Varchar(Some(n)) => ColumnType::new(DataType::Text).with_precision(*n),
            PgType::Varchar(None) | PgType::Text => ColumnType::new(DataType::Text),
            PgType::Jsonb => ColumnType::new(DataType::Json),
            PgType::DoublePrecision => ColumnType::new(DataType::Double),
            PgType::Boolean => ColumnType::new(DataType::Bool),
            PgType::Timestamptz(p) => {
                let ty = ColumnType::new(DataType::Timestamp);
                self.introspected_precision(*p).map_or(ty, |p| ty.with_precision(p))
            }
            PgType::Time(p) => {
                let ty = ColumnType::new(DataType::Time);
                self.introspected_precision(*p).map_or(ty, |p| ty.with_precision(p))
            }
            PgType::Date => ColumnType::new(DataType::Date),
            PgType::Smallint => ColumnType::new(DataType::Bigint).with_precision(16),
            PgType::Integer => ColumnType::new(DataType::Bigint).with_precision(32),
            PgType::Bigint => ColumnType::new(DataType::Bigint),
            PgType::Bytea => ColumnType::new(DataType::Binary),
            PgType::Numeric(Some((p, s))) => decimal_from_native(&self.caps, *p, *s),
            PgType::Numeric(None) => ColumnType::new(DataType::Decimal),
            // Geometry values travel as WKB/WKT text.
            PgType::Geometry { .. } => ColumnType::new(DataType::Text),
            PgType::Other(name) => {
                return Err(DestinationError::schema(
                    "UNSUPPORTED_TYPE",
                    format!("no logical type for postgres type {name}"),
                ))
            }
        };
        Ok(ty)
    }

    fn supports_round_trip(&self, column: &ColumnType) -> bool {
        match column.data_type {
            DataType::Text => column.scale.is_none() && column.precision != Some(0),
            DataType::Json | DataType::Double | DataType::Bool | DataType::Date
            | DataType::Binary => column.precision.is_none() && column.scale.is_none(),
            DataType::Bigint => {
                column.scale.is_none() && matches!(column.precision, None | Some(16 | 32))
            }
            DataType::Timestamp | DataType::Time => {
                column.scale.is_none()
                    && matches!(column.precision, None | Some(0 | 3))
            }
            DataType::Decimal => match (column.precision, column.scale) {
                (None, None) => true,
                (Some(p), Some(s)) => {
                    (1..=MAX_NUMERIC_PRECISION).contains(&p)
                        && s <= p
                        && (p, s) != self.caps.decimal_precision
                        && (p, s) != self.caps.wei_precision
                }
                _ => false,
            },
            DataType::Wei => column.precision.is_none() && column.scale.is_none(),
        }
    }
}
