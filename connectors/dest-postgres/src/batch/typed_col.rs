//! Typed Arrow column helpers used by the INSERT write path.
//!
//! Integer, float, boolean, string and binary columns bind natively. Every
//! other Arrow type (timestamps, times, dates, decimals) is rendered to text
//! once per batch and cast to the column type by the server.

use arrow::array::{Array, ArrayRef, AsArray, BinaryArray, BooleanArray, LargeBinaryArray};
use arrow::array::{Float32Array, Float64Array, Int16Array, Int32Array, Int64Array};
use arrow::array::{LargeStringArray, StringArray};
use arrow::datatypes::{DataType, Float32Type, Float64Type, Int16Type, Int32Type, Int64Type};
use arrow::error::ArrowError;
use tokio_postgres::types::ToSql;

use landfall_engine::arrow_utils::column_as_text;

/// Pre-downcast Arrow column reference. Resolves the concrete array type once
/// per column per batch instead of once per cell.
pub(crate) enum TypedCol<'a> {
    Int16(&'a Int16Array),
    Int32(&'a Int32Array),
    Int64(&'a Int64Array),
    Float32(&'a Float32Array),
    Float64(&'a Float64Array),
    Boolean(&'a BooleanArray),
    Utf8(&'a StringArray),
    LargeUtf8(&'a LargeStringArray),
    Binary(&'a BinaryArray),
    LargeBinary(&'a LargeBinaryArray),
    /// Server-cast text rendering of any other type.
    Rendered(Vec<Option<String>>),
    Null,
}

impl TypedCol<'_> {
    /// SQL type the bound parameter is declared as.
    pub(crate) fn param_type(&self) -> &'static str {
        match self {
            Self::Int16(_) => "int2",
            Self::Int32(_) => "int4",
            Self::Int64(_) => "int8",
            Self::Float32(_) => "float4",
            Self::Float64(_) => "float8",
            Self::Boolean(_) => "bool",
            Self::Binary(_) | Self::LargeBinary(_) => "bytea",
            Self::Utf8(_) | Self::LargeUtf8(_) | Self::Rendered(_) | Self::Null => "text",
        }
    }

    pub(crate) fn is_binary(&self) -> bool {
        matches!(self, Self::Binary(_) | Self::LargeBinary(_))
    }

    pub(crate) fn is_text(&self) -> bool {
        matches!(self, Self::Utf8(_) | Self::LargeUtf8(_) | Self::Rendered(_) | Self::Null)
    }
}

/// Pre-downcast every column of a batch into [`TypedCol`] references.
pub(crate) fn downcast_columns(columns: &[ArrayRef]) -> Result<Vec<TypedCol<'_>>, ArrowError> {
    columns
        .iter()
        .map(|col| {
            let typed = match col.data_type() {
                DataType::Int16 => TypedCol::Int16(col.as_primitive::<Int16Type>()),
                DataType::Int32 => TypedCol::Int32(col.as_primitive::<Int32Type>()),
                DataType::Int64 => TypedCol::Int64(col.as_primitive::<Int64Type>()),
                DataType::Float32 => TypedCol::Float32(col.as_primitive::<Float32Type>()),
                DataType::Float64 => TypedCol::Float64(col.as_primitive::<Float64Type>()),
                DataType::Boolean => TypedCol::Boolean(col.as_boolean()),
                DataType::Utf8 => TypedCol::Utf8(col.as_string::<i32>()),
                DataType::LargeUtf8 => TypedCol::LargeUtf8(col.as_string::<i64>()),
                DataType::Binary => TypedCol::Binary(col.as_binary::<i32>()),
                DataType::LargeBinary => TypedCol::LargeBinary(col.as_binary::<i64>()),
                DataType::Null => TypedCol::Null,
                _ => TypedCol::Rendered(column_as_text(col)?),
            };
            Ok(typed)
        })
        .collect()
}

pub(crate) enum SqlParamValue<'a> {
    Int16(Option<i16>),
    Int32(Option<i32>),
    Int64(Option<i64>),
    Float32(Option<f32>),
    Float64(Option<f64>),
    Boolean(Option<bool>),
    Text(Option<&'a str>),
    Bytes(Option<&'a [u8]>),
}

impl SqlParamValue<'_> {
    pub(crate) fn as_tosql(&self) -> &(dyn ToSql + Sync) {
        match self {
            Self::Int16(v) => v,
            Self::Int32(v) => v,
            Self::Int64(v) => v,
            Self::Float32(v) => v,
            Self::Float64(v) => v,
            Self::Boolean(v) => v,
            Self::Text(v) => v,
            Self::Bytes(v) => v,
        }
    }
}

pub(crate) fn sql_param_value<'a>(col: &'a TypedCol<'a>, row_idx: usize) -> SqlParamValue<'a> {
    match col {
        TypedCol::Null => SqlParamValue::Text(None),
        TypedCol::Int16(arr) => {
            SqlParamValue::Int16((!arr.is_null(row_idx)).then(|| arr.value(row_idx)))
        }
        TypedCol::Int32(arr) => {
            SqlParamValue::Int32((!arr.is_null(row_idx)).then(|| arr.value(row_idx)))
        }
        TypedCol::Int64(arr) => {
            SqlParamValue::Int64((!arr.is_null(row_idx)).then(|| arr.value(row_idx)))
        }
        TypedCol::Float32(arr) => {
            SqlParamValue::Float32((!arr.is_null(row_idx)).then(|| arr.value(row_idx)))
        }
        TypedCol::Float64(arr) => {
            SqlParamValue::Float64((!arr.is_null(row_idx)).then(|| arr.value(row_idx)))
        }
        TypedCol::Boolean(arr) => {
            SqlParamValue::Boolean((!arr.is_null(row_idx)).then(|| arr.value(row_idx)))
        }
        TypedCol::Utf8(arr) => {
            if arr.is_null(row_idx) {
                SqlParamValue::Text(None)
            } else {
                SqlParamValue::Text(Some(arr.value(row_idx)))
            }
        }
        TypedCol::LargeUtf8(arr) => {
            if arr.is_null(row_idx) {
                SqlParamValue::Text(None)
            } else {
                SqlParamValue::Text(Some(arr.value(row_idx)))
            }
        }
        TypedCol::Binary(arr) => {
            if arr.is_null(row_idx) {
                SqlParamValue::Bytes(None)
            } else {
                SqlParamValue::Bytes(Some(arr.value(row_idx)))
            }
        }
        TypedCol::LargeBinary(arr) => {
            if arr.is_null(row_idx) {
                SqlParamValue::Bytes(None)
            } else {
                SqlParamValue::Bytes(Some(arr.value(row_idx)))
            }
        }
        TypedCol::Rendered(values) => {
            SqlParamValue::Text(values.get(row_idx).and_then(Option::as_deref))
        }
    }
}
