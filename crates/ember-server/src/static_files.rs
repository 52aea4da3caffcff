use std::path::{Component, Path, PathBuf};
use std::time::UNIX_EPOCH;

use chrono::{DateTime, Utc};
use ember_http::{etag_matches, file_etag, HttpRequest, HttpResponse, HttpStatus};

use crate::config::ServerConfig;
use crate::router::error_response;

pub(crate) async fn serve(request: &HttpRequest, config: &ServerConfig) -> HttpResponse {
    let document_root = Path::new(&config.document_root);
    let canonical_root = match tokio::fs::canonicalize(document_root).await {
        Ok(root) => root,
        Err(_) => return error_response(HttpStatus::NotFound, "File not found"),
    };

    let relative = request.path.trim_start_matches('/');
    let requested = document_root.join(relative);

    // Containment check: the weakly-canonical target must stay under the
    // canonical document root. Defends against dot-dot traversal and
    // symlink escapes.
    let resolved = match weakly_canonicalize(&requested).await {
        Ok(resolved) => resolved,
        Err(_) => return error_response(HttpStatus::Forbidden, "Access denied"),
    };
    if !resolved.starts_with(&canonical_root) {
        return error_response(HttpStatus::Forbidden, "Access denied");
    }

    let metadata = match tokio::fs::metadata(&resolved).await {
        Ok(metadata) => metadata,
        Err(_) => return error_response(HttpStatus::NotFound, "File not found"),
    };

    if metadata.is_dir() {
        for index_file in &config.index_files {
            let index_path = resolved.join(index_file);
            if let Ok(index_metadata) = tokio::fs::metadata(&index_path).await {
                if index_metadata.is_file() {
                    return conditional_file_response(&index_path, &index_metadata, request, config)
                        .await;
                }
            }
        }
        return error_response(HttpStatus::Forbidden, "Directory listing disabled");
    }

    if !metadata.is_file() {
        return error_response(HttpStatus::NotFound, "File not found");
    }

    conditional_file_response(&resolved, &metadata, request, config).await
}

/// ETag-based conditional response: 304 on an `If-None-Match` hit, otherwise
/// a streaming 200 with cache validators. `If-Modified-Since` is parsed and
/// available to handlers but never produces a 304 on its own.
async fn conditional_file_response(
    path: &Path,
    metadata: &std::fs::Metadata,
    request: &HttpRequest,
    config: &ServerConfig,
) -> HttpResponse {
    let len = metadata.len();
    let modified_nanos = metadata
        .modified()
        .ok()
        .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
        .map(|duration| duration.as_nanos())
        .unwrap_or(0);
    let etag = file_etag(path, len, modified_nanos);
    let last_modified: DateTime<Utc> = metadata
        .modified()
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| Utc::now());

    if let Some(if_none_match) = request.if_none_match() {
        if etag_matches(&format!("\"{etag}\""), if_none_match) {
            let mut response = HttpResponse::new(HttpStatus::NotModified);
            response.set_etag(&etag, false);
            response.set_last_modified(last_modified);
            response.set_body(Vec::new());
            return response;
        }
    }

    let mut response = HttpResponse::new(HttpStatus::Ok);
    response.set_file_body(path.to_path_buf(), len);
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or("");
    response.set_content_type(&config.mime_type_for(extension));
    response.set_etag(&etag, false);
    response.set_last_modified(last_modified);
    response.set_cache_control("public, max-age=3600");
    response
}

/// Canonicalizes the deepest existing ancestor of `path`, then re-applies
/// the remaining components lexically (`.` skipped, `..` pops). The result
/// is comparable against a canonical root even when the target does not
/// exist yet.
async fn weakly_canonicalize(path: &Path) -> std::io::Result<PathBuf> {
    let mut existing = path.to_path_buf();
    let mut tail: Vec<std::ffi::OsString> = Vec::new();

    let canonical_base = loop {
        match tokio::fs::canonicalize(&existing).await {
            Ok(canonical) => break canonical,
            Err(error) => {
                let Some(name) = existing.file_name().map(ToOwned::to_owned) else {
                    return Err(error);
                };
                tail.push(name);
                if !existing.pop() {
                    return Err(error);
                }
            }
        }
    };

    let mut resolved = canonical_base;
    for component in tail.iter().rev() {
        match Path::new(component).components().next() {
            Some(Component::ParentDir) => {
                resolved.pop();
            }
            Some(Component::CurDir) | None => {}
            _ => resolved.push(component),
        }
    }
    Ok(resolved)
}
