use std::hash::{Hash, Hasher};
use std::path::Path;

/// Strong ETag for a file: stable hash of path, size, and modification time
/// rendered as lowercase hex. Metadata-only, so huge files cost nothing.
pub fn file_etag(path: &Path, len: u64, modified_unix_nanos: u128) -> String {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    path.hash(&mut hasher);
    len.hash(&mut hasher);
    modified_unix_nanos.hash(&mut hasher);
    format!("{:x}", hasher.finish())
}

/// `If-None-Match` comparison. `*` matches anything; otherwise candidates
/// are split on ',', trimmed, stripped of a `W/` prefix on both sides, and
/// compared after quote normalization.
pub fn etag_matches(etag: &str, if_none_match: &str) -> bool {
    if if_none_match.trim() == "*" {
        return true;
    }
    let normalized = normalize_etag(etag);
    if_none_match
        .split(',')
        .any(|candidate| normalize_etag(candidate) == normalized)
}

fn normalize_etag(raw: &str) -> &str {
    let trimmed = raw.trim();
    let strong = trimmed.strip_prefix("W/").unwrap_or(trimmed);
    strong.trim_matches('"')
}
