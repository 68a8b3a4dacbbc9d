//! Storage key generation
//!
//! A key is `{uuid}-{name}` where `uuid` is a random v4 UUID in simple (32 hex
//! chars) form and `name` is the caller's original filename reduced to a single
//! safe path component. Keys never contain separators or `..`.

use uuid::Uuid;

/// Longest sanitized filename kept in a key
pub const MAX_NAME_LEN: usize = 100;

/// Name used when nothing usable survives sanitizing
const FALLBACK_NAME: &str = "blob";

/// Generate a fresh storage key for an upload
pub fn generate(original_name: Option<&str>) -> String {
    let name = sanitize_filename(original_name.unwrap_or(""));
    format!("{}-{}", Uuid::new_v4().simple(), name)
}

/// Reduce a caller-supplied filename to a safe single path component
pub fn sanitize_filename(name: &str) -> String {
    // Only the last component; anything before a separator is caller path
    let base = name.rsplit(['/', '\\']).next().unwrap_or("");

    let mut cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();

    while cleaned.contains("..") {
        cleaned = cleaned.replace("..", ".");
    }

    let cleaned = cleaned.trim_start_matches('.');
    let truncated: String = cleaned.chars().take(MAX_NAME_LEN).collect();

    if truncated.is_empty() {
        FALLBACK_NAME.to_string()
    } else {
        truncated
    }
}

/// Whether a key is safe to turn into a path
pub fn is_valid(key: &str) -> bool {
    !key.is_empty()
        && !key.contains(['/', '\\'])
        && !key.contains("..")
        && !key.starts_with('.')
}
