//! Arrow batch helpers: batch files, JSON rows, casts and placeholder values.

use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow::array::{
    make_array, new_null_array, Array, ArrayRef, BinaryArray, BooleanArray, Date32Array, Date64Array,
    Decimal128Array, Decimal256Array, Float32Array, Float64Array, Int16Array,
    Int32Array, Int64Array, Int8Array, LargeBinaryArray, LargeStringArray, StringArray,
    Time32MillisecondArray, Time32SecondArray, Time64MicrosecondArray, Time64NanosecondArray,
    TimestampMicrosecondArray, TimestampMillisecondArray, TimestampNanosecondArray,
    TimestampSecondArray, UInt16Array, UInt32Array, UInt64Array, UInt8Array,
};
use arrow::compute::{cast_with_options, concat_batches, CastOptions};
use arrow::datatypes::{i256, DataType, Field, Schema, SchemaRef, TimeUnit};
use arrow::error::ArrowError;
use arrow::record_batch::RecordBatch;
use arrow::util::display::{ArrayFormatter, FormatOptions};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;

use landfall_types::capabilities::{DestinationCapabilities, TimestampUnit};
use landfall_types::naming::normalize_identifier;
use landfall_types::schema::{ColumnDef, DataType as LogicalType, LogicalTable};

use crate::store::Row;
use crate::type_mapper::{decimal_precision, timestamp_unit};

/// Zone of every timestamp type the engine builds.
///
/// arrow resolves named zones only with `chrono-tz`; a fixed offset always parses.
pub const UTC_OFFSET: &str = "+00:00";

/// Read a batch file fully into one `RecordBatch`.
pub fn read_batch_file(path: &Path) -> Result<RecordBatch> {
    let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let builder = ParquetRecordBatchReaderBuilder::try_new(file)
        .with_context(|| format!("failed to read parquet metadata of {}", path.display()))?;
    let schema = Arc::clone(builder.schema());
    let reader = builder
        .build()
        .with_context(|| format!("failed to open parquet reader for {}", path.display()))?;
    let batches = reader
        .collect::<std::result::Result<Vec<_>, ArrowError>>()
        .with_context(|| format!("failed to decode row groups of {}", path.display()))?;
    concat_batches(&schema, &batches)
        .with_context(|| format!("failed to concatenate row groups of {}", path.display()))
}

/// Read only the Arrow schema of a batch file.
pub fn read_batch_file_schema(path: &Path) -> Result<SchemaRef> {
    let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let builder = ParquetRecordBatchReaderBuilder::try_new(file)
        .with_context(|| format!("failed to read parquet metadata of {}", path.display()))?;
    Ok(Arc::clone(builder.schema()))
}

/// Write a batch file as produced by the normalize stage.
pub fn write_batch_file(path: &Path, batch: &RecordBatch) -> Result<()> {
    let file =
        File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .context("failed to create parquet writer")?;
    writer.write(batch).context("failed to write parquet row group")?;
    writer.close().context("failed to finish parquet file")?;
    Ok(())
}

/// Arrow type used to carry a logical column in batches the engine builds itself.
pub fn arrow_type_for(column: &ColumnDef, caps: &DestinationCapabilities) -> Result<DataType> {
    let dt = match column.data_type {
        LogicalType::Text | LogicalType::Json => DataType::Utf8,
        LogicalType::Double => DataType::Float64,
        LogicalType::Bool => DataType::Boolean,
        LogicalType::Bigint => DataType::Int64,
        LogicalType::Binary => DataType::Binary,
        LogicalType::Date => DataType::Date32,
        LogicalType::Decimal | LogicalType::Wei => {
            let (p, s) = decimal_precision(caps, column);
            let scale = i8::try_from(s).context("decimal scale out of range")?;
            if p <= 38 {
                DataType::Decimal128(u8::try_from(p)?, scale)
            } else {
                DataType::Decimal256(u8::try_from(p).context("decimal precision out of range")?, scale)
            }
        }
        LogicalType::Timestamp => {
            let unit = timestamp_unit(caps, column.precision).map_err(anyhow::Error::new)?;
            DataType::Timestamp(time_unit(unit), Some(UTC_OFFSET.into()))
        }
        LogicalType::Time => match timestamp_unit(caps, column.precision).map_err(anyhow::Error::new)? {
            TimestampUnit::Second => DataType::Time32(TimeUnit::Second),
            TimestampUnit::Millisecond => DataType::Time32(TimeUnit::Millisecond),
            TimestampUnit::Microsecond => DataType::Time64(TimeUnit::Microsecond),
            TimestampUnit::Nanosecond => DataType::Time64(TimeUnit::Nanosecond),
        },
    };
    Ok(dt)
}

/// Arrow schema of a logical table, keyed by physical column names.
pub fn table_arrow_schema(table: &LogicalTable, caps: &DestinationCapabilities) -> Result<SchemaRef> {
    let fields = table
        .columns
        .values()
        .map(|column| {
            let dt = arrow_type_for(column, caps)
                .with_context(|| format!("column '{}.{}'", table.name, column.name))?;
            Ok(Field::new(normalize_identifier(&column.name, caps), dt, column.nullable))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(Arc::new(Schema::new(fields)))
}

/// Rename every column of `batch` to its physical name.
///
/// Timestamps tagged with a named UTC zone are retagged with [`UTC_OFFSET`];
/// the stored instants do not change.
pub fn normalize_columns(
    batch: &RecordBatch,
    caps: &DestinationCapabilities,
) -> std::result::Result<RecordBatch, ArrowError> {
    let schema = batch.schema();
    let mut fields = Vec::with_capacity(schema.fields().len());
    let mut columns = Vec::with_capacity(batch.num_columns());
    for (field, column) in schema.fields().iter().zip(batch.columns()) {
        let field = field.as_ref().clone().with_name(normalize_identifier(field.name(), caps));
        match field.data_type() {
            DataType::Timestamp(unit, Some(tz)) if is_named_utc(tz) => {
                let retagged = DataType::Timestamp(*unit, Some(UTC_OFFSET.into()));
                let data = column.to_data().into_builder().data_type(retagged.clone()).build()?;
                fields.push(field.with_data_type(retagged));
                columns.push(make_array(data));
            }
            _ => {
                fields.push(field);
                columns.push(Arc::clone(column));
            }
        }
    }
    RecordBatch::try_new(
        Arc::new(Schema::new_with_metadata(fields, schema.metadata().clone())),
        columns,
    )
}

fn is_named_utc(tz: &str) -> bool {
    matches!(tz, "UTC" | "utc" | "Etc/UTC" | "Z" | "GMT" | "Etc/GMT")
}

#[must_use]
pub fn time_unit(unit: TimestampUnit) -> TimeUnit {
    match unit {
        TimestampUnit::Second => TimeUnit::Second,
        TimestampUnit::Millisecond => TimeUnit::Millisecond,
        TimestampUnit::Microsecond => TimeUnit::Microsecond,
        TimestampUnit::Nanosecond => TimeUnit::Nanosecond,
    }
}

#[must_use]
pub fn timestamp_unit_of(unit: &TimeUnit) -> TimestampUnit {
    match unit {
        TimeUnit::Second => TimestampUnit::Second,
        TimeUnit::Millisecond => TimestampUnit::Millisecond,
        TimeUnit::Microsecond => TimestampUnit::Microsecond,
        TimeUnit::Nanosecond => TimestampUnit::Nanosecond,
    }
}

/// Decode JSON rows into a batch with the given schema.
pub fn rows_to_batch(rows: &[Row], schema: SchemaRef) -> Result<RecordBatch> {
    let mut decoder = arrow::json::ReaderBuilder::new(Arc::clone(&schema))
        .build_decoder()
        .context("failed to build JSON decoder")?;
    decoder
        .serialize(rows)
        .context("failed to decode JSON rows")?;
    let batch = decoder.flush().context("failed to flush JSON decoder")?;
    Ok(batch.unwrap_or_else(|| RecordBatch::new_empty(schema)))
}

/// Encode a batch as JSON rows. Null values are omitted from each row.
pub fn batch_to_rows(batch: &RecordBatch) -> Result<Vec<Row>> {
    if batch.num_rows() == 0 {
        return Ok(Vec::new());
    }
    let mut writer = arrow::json::ArrayWriter::new(Vec::new());
    writer
        .write_batches(&[batch])
        .context("failed to encode rows as JSON")?;
    writer.finish().context("failed to finish JSON array")?;
    let buf = writer.into_inner();
    if buf.is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_slice(&buf).context("JSON writer produced invalid output")
}

/// Cast a column, failing on values that do not fit instead of nulling them.
pub fn cast_strict(array: &ArrayRef, to: &DataType) -> std::result::Result<ArrayRef, ArrowError> {
    if array.data_type() == to {
        return Ok(Arc::clone(array));
    }
    let options = CastOptions {
        safe: false,
        ..CastOptions::default()
    };
    cast_with_options(array, to, &options)
}

/// Render every value of a column as text; nulls become `None`.
pub fn column_as_text(array: &ArrayRef) -> std::result::Result<Vec<Option<String>>, ArrowError> {
    let formatter = ArrayFormatter::try_new(array.as_ref(), &FormatOptions::default())?;
    Ok((0..array.len())
        .map(|i| {
            if array.is_null(i) {
                None
            } else {
                Some(formatter.value(i).to_string())
            }
        })
        .collect())
}

/// Append `field`/`array` to `batch`, replacing a column of the same name.
pub fn with_column(
    batch: &RecordBatch,
    field: Field,
    array: ArrayRef,
) -> std::result::Result<RecordBatch, ArrowError> {
    let schema = batch.schema();
    let mut fields: Vec<Field> = Vec::with_capacity(schema.fields().len() + 1);
    let mut columns: Vec<ArrayRef> = Vec::with_capacity(schema.fields().len() + 1);
    for (existing, column) in schema.fields().iter().zip(batch.columns()) {
        if existing.name() != field.name() {
            fields.push(existing.as_ref().clone());
            columns.push(Arc::clone(column));
        }
    }
    fields.push(field);
    columns.push(array);
    RecordBatch::try_new(
        Arc::new(Schema::new_with_metadata(fields, schema.metadata().clone())),
        columns,
    )
}

/// Placeholder column of `len` type-specific defaults: zero, empty string,
/// `false`, the epoch date or time. `None` for types without a placeholder.
#[must_use]
pub fn default_array(data_type: &DataType, len: usize) -> Option<ArrayRef> {
    let array: ArrayRef = match data_type {
        DataType::Null => new_null_array(data_type, len),
        DataType::Boolean => Arc::new(BooleanArray::from(vec![false; len])),
        DataType::Int8 => Arc::new(Int8Array::from(vec![0; len])),
        DataType::Int16 => Arc::new(Int16Array::from(vec![0; len])),
        DataType::Int32 => Arc::new(Int32Array::from(vec![0; len])),
        DataType::Int64 => Arc::new(Int64Array::from(vec![0; len])),
        DataType::UInt8 => Arc::new(UInt8Array::from(vec![0; len])),
        DataType::UInt16 => Arc::new(UInt16Array::from(vec![0; len])),
        DataType::UInt32 => Arc::new(UInt32Array::from(vec![0; len])),
        DataType::UInt64 => Arc::new(UInt64Array::from(vec![0; len])),
        DataType::Float32 => Arc::new(Float32Array::from(vec![0.0; len])),
        DataType::Float64 => Arc::new(Float64Array::from(vec![0.0; len])),
        DataType::Utf8 => Arc::new(StringArray::from(vec![""; len])),
        DataType::LargeUtf8 => Arc::new(LargeStringArray::from(vec![""; len])),
        DataType::Binary => Arc::new(BinaryArray::from_vec(vec![b"".as_slice(); len])),
        DataType::LargeBinary => Arc::new(LargeBinaryArray::from_vec(vec![b"".as_slice(); len])),
        DataType::Date32 => Arc::new(Date32Array::from(vec![0; len])),
        DataType::Date64 => Arc::new(Date64Array::from(vec![0; len])),
        DataType::Time32(TimeUnit::Second) => Arc::new(Time32SecondArray::from(vec![0; len])),
        DataType::Time32(TimeUnit::Millisecond) => {
            Arc::new(Time32MillisecondArray::from(vec![0; len]))
        }
        DataType::Time64(TimeUnit::Microsecond) => {
            Arc::new(Time64MicrosecondArray::from(vec![0; len]))
        }
        DataType::Time64(TimeUnit::Nanosecond) => {
            Arc::new(Time64NanosecondArray::from(vec![0; len]))
        }
        DataType::Timestamp(unit, tz) => match unit {
            TimeUnit::Second => {
                Arc::new(TimestampSecondArray::from(vec![0; len]).with_timezone_opt(tz.clone()))
            }
            TimeUnit::Millisecond => Arc::new(
                TimestampMillisecondArray::from(vec![0; len]).with_timezone_opt(tz.clone()),
            ),
            TimeUnit::Microsecond => Arc::new(
                TimestampMicrosecondArray::from(vec![0; len]).with_timezone_opt(tz.clone()),
            ),
            TimeUnit::Nanosecond => Arc::new(
                TimestampNanosecondArray::from(vec![0; len]).with_timezone_opt(tz.clone()),
            ),
        },
        DataType::Decimal128(p, s) => Arc::new(
            Decimal128Array::from(vec![0_i128; len])
                .with_precision_and_scale(*p, *s)
                .ok()?,
        ),
        DataType::Decimal256(p, s) => Arc::new(
            Decimal256Array::from(vec![i256::ZERO; len])
                .with_precision_and_scale(*p, *s)
                .ok()?,
        ),
        _ => return None,
    };
    Some(array)
}
