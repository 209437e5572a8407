// Object key generation and input sanitization shared by all backends

use crate::{StorageError, StorageResult};
use rand::Rng;
use std::collections::HashMap;

/// Characters replaced with `_` in file names
const FORBIDDEN_CHARS: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

/// Longest metadata value sent to a backend
pub const MAX_METADATA_LEN: usize = 100;

/// Replacement for values that cannot travel as ASCII headers
pub const NON_ASCII_PLACEHOLDER: &str = "[non-ascii]";

/// Fallback when nothing else is known about the payload
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Replace path separators and reserved characters with `_`
pub fn sanitize_filename(name: &str) -> String {
    name.chars()
        .map(|c| {
            if FORBIDDEN_CHARS.contains(&c) || c.is_control() {
                '_'
            } else {
                c
            }
        })
        .collect()
}

/// Split `report.final.pdf` into (`report.final`, `.pdf`)
fn split_extension(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(0) | None => (name, ""),
        Some(idx) => name.split_at(idx),
    }
}

/// Build a collision-resistant key: `{prefix}/{base}_{unixMillis}_{8 hex}{ext}`
pub fn generate_key(prefix: &str, filename: &str) -> String {
    let sanitized = sanitize_filename(filename.trim());
    let (base, ext) = split_extension(&sanitized);
    let base = if base.is_empty() { "file" } else { base };
    let millis = chrono::Utc::now().timestamp_millis();
    let random: u32 = rand::thread_rng().gen();

    let prefix = prefix.trim_matches('/');
    if prefix.is_empty() {
        format!("{}_{}_{:08x}{}", base, millis, random, ext.to_lowercase())
    } else {
        format!(
            "{}/{}_{}_{:08x}{}",
            prefix,
            base,
            millis,
            random,
            ext.to_lowercase()
        )
    }
}

/// Guess a MIME type from the file extension
pub fn detect_content_type(filename: &str) -> String {
    mime_guess::from_path(filename)
        .first_raw()
        .unwrap_or(DEFAULT_CONTENT_TYPE)
        .to_string()
}

/// Make a metadata value safe for HTTP headers
///
/// Control characters are dropped, values containing non-ASCII text become
/// a placeholder and everything is capped at `MAX_METADATA_LEN` characters.
pub fn sanitize_metadata_value(value: &str) -> String {
    let stripped: String = value.chars().filter(|c| !c.is_control()).collect();
    if !stripped.is_ascii() {
        return NON_ASCII_PLACEHOLDER.to_string();
    }
    stripped.chars().take(MAX_METADATA_LEN).collect()
}

pub fn sanitize_metadata(metadata: &HashMap<String, String>) -> HashMap<String, String> {
    metadata
        .iter()
        .filter_map(|(key, value)| {
            let key: String = key
                .chars()
                .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
                .collect();
            if key.is_empty() {
                None
            } else {
                Some((key.to_lowercase(), sanitize_metadata_value(value)))
            }
        })
        .collect()
}

/// Reject keys that could escape a base directory or address nothing
pub fn validate_key(key: &str) -> StorageResult<()> {
    if key.is_empty() {
        return Err(StorageError::Validation("object key is empty".to_string()));
    }
    if key.starts_with('/') || key.starts_with('\\') {
        return Err(StorageError::Validation(format!(
            "object key must be relative: {}",
            key
        )));
    }
    if key.split(['/', '\\']).any(|segment| segment == "..") {
        return Err(StorageError::Validation(format!(
            "object key must not contain '..': {}",
            key
        )));
    }
    if key.contains('\0') {
        return Err(StorageError::Validation(
            "object key contains a NUL byte".to_string(),
        ));
    }
    Ok(())
}
