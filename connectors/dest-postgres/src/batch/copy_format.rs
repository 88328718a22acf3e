//! CSV field encoding for the COPY write path.
//!
//! The statement declares `NULL ''`, so a null is an empty unquoted field.
//! Text is always quoted, which keeps an empty string distinct from null
//! unless the column is listed in `FORCE_NULL`.

use std::io::Write;

use arrow::array::Array;

use crate::batch::typed_col::TypedCol;

/// Append the CSV field for `row_idx` of `col` to `buf`.
///
/// - null: nothing
/// - text: `"`-quoted, inner quotes doubled, NUL bytes dropped
/// - booleans: `t` / `f`
/// - floats: decimal, with `NaN`, `Infinity` and `-Infinity` literals
/// - binary: `\x` followed by lowercase hex, the `bytea` hex input form
pub(crate) fn format_csv_field(buf: &mut Vec<u8>, col: &TypedCol<'_>, row_idx: usize) {
    match col {
        TypedCol::Null => {}
        TypedCol::Int16(arr) => {
            if !arr.is_null(row_idx) {
                let _ = write!(buf, "{}", arr.value(row_idx));
            }
        }
        TypedCol::Int32(arr) => {
            if !arr.is_null(row_idx) {
                let _ = write!(buf, "{}", arr.value(row_idx));
            }
        }
        TypedCol::Int64(arr) => {
            if !arr.is_null(row_idx) {
                let _ = write!(buf, "{}", arr.value(row_idx));
            }
        }
        TypedCol::Float32(arr) => {
            if !arr.is_null(row_idx) {
                let v = arr.value(row_idx);
                if v.is_finite() {
                    let _ = write!(buf, "{v}");
                } else {
                    write_float(buf, f64::from(v));
                }
            }
        }
        TypedCol::Float64(arr) => {
            if !arr.is_null(row_idx) {
                write_float(buf, arr.value(row_idx));
            }
        }
        TypedCol::Boolean(arr) => {
            if !arr.is_null(row_idx) {
                buf.push(if arr.value(row_idx) { b't' } else { b'f' });
            }
        }
        TypedCol::Utf8(arr) => {
            if !arr.is_null(row_idx) {
                write_quoted(buf, arr.value(row_idx));
            }
        }
        TypedCol::LargeUtf8(arr) => {
            if !arr.is_null(row_idx) {
                write_quoted(buf, arr.value(row_idx));
            }
        }
        TypedCol::Rendered(values) => {
            if let Some(Some(value)) = values.get(row_idx) {
                write_quoted(buf, value);
            }
        }
        TypedCol::Binary(arr) => {
            if !arr.is_null(row_idx) {
                write_hex(buf, arr.value(row_idx));
            }
        }
        TypedCol::LargeBinary(arr) => {
            if !arr.is_null(row_idx) {
                write_hex(buf, arr.value(row_idx));
            }
        }
    }
}

fn write_float(buf: &mut Vec<u8>, v: f64) {
    if v.is_nan() {
        buf.extend_from_slice(b"NaN");
    } else if v.is_infinite() {
        let literal: &[u8] = if v > 0.0 { b"Infinity" } else { b"-Infinity" };
        buf.extend_from_slice(literal);
    } else {
        let _ = write!(buf, "{v}");
    }
}

fn write_quoted(buf: &mut Vec<u8>, value: &str) {
    buf.push(b'"');
    for byte in value.bytes() {
        match byte {
            b'"' => buf.extend_from_slice(b"\"\""),
            // The server rejects NUL in text values.
            0 => {}
            _ => buf.push(byte),
        }
    }
    buf.push(b'"');
}

fn write_hex(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.extend_from_slice(b"\\x");
    for byte in bytes {
        let _ = write!(buf, "{byte:02x}");
    }
}
