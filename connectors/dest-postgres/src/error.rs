//! `tokio_postgres::Error` -> [`StoreError`] classification.

use landfall_engine::StoreError;

pub(crate) fn format_pg_error(prefix: &str, error: &tokio_postgres::Error) -> String {
    if let Some(db_error) = error.as_db_error() {
        let detail = db_error.detail().unwrap_or("n/a");
        let hint = db_error.hint().unwrap_or("n/a");
        format!(
            "{prefix}: {} (sqlstate={} severity={} detail={} hint={})",
            db_error.message(),
            db_error.code().code(),
            db_error.severity(),
            detail,
            hint
        )
    } else {
        format!("{prefix}: {error}")
    }
}

/// What a SQLSTATE means for the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Class {
    Unavailable,
    TableNotFound,
    Conflict,
    TypeMismatch,
    Invalid,
}

fn classify_sqlstate(code: &str) -> Class {
    match code {
        "42P01" | "3F000" => Class::TableNotFound,
        "40001" | "40P01" | "55P03" => Class::Conflict,
        // not_null_violation, unique_violation, check_violation
        "23502" | "23505" | "23514" => Class::TypeMismatch,
        "57P01" | "57P02" | "57P03" | "53300" => Class::Unavailable,
        _ if code.starts_with("22") => Class::TypeMismatch,
        _ if code.starts_with("08") => Class::Unavailable,
        _ => Class::Invalid,
    }
}

/// Convert a driver error raised while working on `table`.
pub(crate) fn store_error(table: &str, prefix: &str, error: &tokio_postgres::Error) -> StoreError {
    let message = format_pg_error(prefix, error);
    let class = match error.as_db_error() {
        Some(db_error) => classify_sqlstate(db_error.code().code()),
        // No server response: the socket is gone or never came up.
        None => Class::Unavailable,
    };
    match class {
        Class::Unavailable => StoreError::Unavailable(message),
        Class::TableNotFound => StoreError::TableNotFound(table.to_string()),
        Class::Conflict => StoreError::Conflict {
            table: table.to_string(),
            message,
        },
        Class::TypeMismatch => StoreError::TypeMismatch {
            table: table.to_string(),
            message,
        },
        Class::Invalid => StoreError::Invalid(message),
    }
}
