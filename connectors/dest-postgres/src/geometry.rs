//! PostGIS constructors for geometry columns.
//!
//! Geometry values arrive as WKB bytes, hex-encoded WKB strings or WKT
//! strings. The constructor is chosen from the Arrow type of the incoming
//! column; text values are told apart on the server so one statement
//! handles a column that mixes hex WKB and WKT.

/// SQL expression building a geometry from the bound parameter `param`.
///
/// Returns `None` when values of the bound type cannot be geometries.
pub(crate) fn constructor(param: &str, binary: bool, text: bool, srid: u32) -> Option<String> {
    if binary {
        return Some(format!("ST_GeomFromWKB({param}::bytea, {srid})"));
    }
    if text {
        return Some(format!(
            "CASE WHEN {param}::text ~ '^[0-9A-Fa-f]+$' \
             THEN ST_GeomFromWKB(decode({param}::text, 'hex'), {srid}) \
             ELSE ST_GeomFromText({param}::text, {srid}) END"
        ));
    }
    None
}
