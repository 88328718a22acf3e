//! Identifier normalization.
//!
//! Logical names are mapped to physical identifiers with a snake_case
//! convention. Case-sensitive destinations keep the original casing; names
//! longer than the destination limit are shortened with a stable hash tail.

use sha2::{Digest, Sha256};

use crate::capabilities::DestinationCapabilities;

const HASH_TAIL_LEN: usize = 8;

/// Normalize a table or column name for the given destination.
#[must_use]
pub fn normalize_identifier(name: &str, caps: &DestinationCapabilities) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    let mut prev: Option<char> = None;
    for ch in name.trim().chars() {
        let mapped = if ch.is_ascii_alphanumeric() { ch } else { '_' };
        if !caps.case_sensitive_identifiers
            && mapped.is_ascii_uppercase()
            && prev.is_some_and(|p| p.is_ascii_lowercase() || p.is_ascii_digit())
        {
            out.push('_');
        }
        out.push(mapped);
        prev = Some(mapped);
    }
    if !caps.case_sensitive_identifiers {
        out = out.to_ascii_lowercase();
    }
    if out.is_empty() {
        out.push('_');
    }
    if out.starts_with(|c: char| c.is_ascii_digit()) {
        out.insert(0, '_');
    }
    shorten_identifier(out, caps.max_identifier_length)
}

fn shorten_identifier(name: String, max_len: usize) -> String {
    if name.len() <= max_len || max_len <= HASH_TAIL_LEN + 1 {
        return name;
    }
    let mut hasher = Sha256::new();
    hasher.update(name.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    let keep = max_len - HASH_TAIL_LEN - 1;
    format!("{}_{}", &name[..keep], &digest[..HASH_TAIL_LEN])
}
