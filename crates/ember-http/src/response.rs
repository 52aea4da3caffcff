use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};

use crate::compress::{gzip_compress, supports_gzip};

const SERVER_SIGNATURE: &str = "ember-http-server/1.0";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpStatus {
    SwitchingProtocols,
    Ok,
    Created,
    Accepted,
    NoContent,
    MovedPermanently,
    Found,
    NotModified,
    BadRequest,
    Unauthorized,
    Forbidden,
    NotFound,
    MethodNotAllowed,
    Conflict,
    LengthRequired,
    PayloadTooLarge,
    TooManyRequests,
    InternalServerError,
    NotImplemented,
    BadGateway,
    ServiceUnavailable,
}

impl HttpStatus {
    pub fn code(self) -> u16 {
        match self {
            Self::SwitchingProtocols => 101,
            Self::Ok => 200,
            Self::Created => 201,
            Self::Accepted => 202,
            Self::NoContent => 204,
            Self::MovedPermanently => 301,
            Self::Found => 302,
            Self::NotModified => 304,
            Self::BadRequest => 400,
            Self::Unauthorized => 401,
            Self::Forbidden => 403,
            Self::NotFound => 404,
            Self::MethodNotAllowed => 405,
            Self::Conflict => 409,
            Self::LengthRequired => 411,
            Self::PayloadTooLarge => 413,
            Self::TooManyRequests => 429,
            Self::InternalServerError => 500,
            Self::NotImplemented => 501,
            Self::BadGateway => 502,
            Self::ServiceUnavailable => 503,
        }
    }

    pub fn reason(self) -> &'static str {
        match self {
            Self::SwitchingProtocols => "Switching Protocols",
            Self::Ok => "OK",
            Self::Created => "Created",
            Self::Accepted => "Accepted",
            Self::NoContent => "No Content",
            Self::MovedPermanently => "Moved Permanently",
            Self::Found => "Found",
            Self::NotModified => "Not Modified",
            Self::BadRequest => "Bad Request",
            Self::Unauthorized => "Unauthorized",
            Self::Forbidden => "Forbidden",
            Self::NotFound => "Not Found",
            Self::MethodNotAllowed => "Method Not Allowed",
            Self::Conflict => "Conflict",
            Self::LengthRequired => "Length Required",
            Self::PayloadTooLarge => "Payload Too Large",
            Self::TooManyRequests => "Too Many Requests",
            Self::InternalServerError => "Internal Server Error",
            Self::NotImplemented => "Not Implemented",
            Self::BadGateway => "Bad Gateway",
            Self::ServiceUnavailable => "Service Unavailable",
        }
    }
}

/// Restartable file-backed body. Static file responses carry the path and
/// length instead of the loaded bytes; the connection streams the file in
/// fixed-size chunks at write time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileBody {
    pub path: PathBuf,
    pub len: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    status: HttpStatus,
    headers: BTreeMap<String, String>,
    body: Vec<u8>,
    file_body: Option<FileBody>,
}

impl Default for HttpResponse {
    fn default() -> Self {
        Self::new(HttpStatus::Ok)
    }
}

impl HttpResponse {
    pub fn new(status: HttpStatus) -> Self {
        let mut response = Self {
            status,
            headers: BTreeMap::new(),
            body: Vec::new(),
            file_body: None,
        };
        response.set_header("Server", SERVER_SIGNATURE);
        response.set_header("Date", http_date_now());
        response.set_header("Content-Length", "0");
        response
    }

    pub fn ok(body: &str) -> Self {
        let mut response = Self::new(HttpStatus::Ok);
        if !body.is_empty() {
            response.set_text(body);
        }
        response
    }

    pub fn not_found(message: &str) -> Self {
        let mut response = Self::new(HttpStatus::NotFound);
        response.set_text(message);
        response
    }

    pub fn bad_request(message: &str) -> Self {
        let mut response = Self::new(HttpStatus::BadRequest);
        response.set_text(message);
        response
    }

    pub fn internal_error(message: &str) -> Self {
        let mut response = Self::new(HttpStatus::InternalServerError);
        response.set_text(message);
        response
    }

    pub fn json_response(json: &str, status: HttpStatus) -> Self {
        let mut response = Self::new(status);
        response.set_json(json);
        response
    }

    pub fn status(&self) -> HttpStatus {
        self.status
    }

    pub fn set_status(&mut self, status: HttpStatus) -> &mut Self {
        self.status = status;
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&canonical_header_name(name)).map(String::as_str)
    }

    pub fn has_header(&self, name: &str) -> bool {
        self.headers.contains_key(&canonical_header_name(name))
    }

    pub fn set_header(&mut self, name: &str, value: impl Into<String>) -> &mut Self {
        self.headers.insert(canonical_header_name(name), value.into());
        self
    }

    pub fn add_header(&mut self, name: &str, value: &str) -> &mut Self {
        let key = canonical_header_name(name);
        match self.headers.get_mut(&key) {
            Some(existing) => {
                existing.push_str(", ");
                existing.push_str(value);
            }
            None => {
                self.headers.insert(key, value.to_string());
            }
        }
        self
    }

    pub fn remove_header(&mut self, name: &str) -> &mut Self {
        self.headers.remove(&canonical_header_name(name));
        self
    }

    pub fn headers(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_str()))
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn file_body(&self) -> Option<&FileBody> {
        self.file_body.as_ref()
    }

    pub fn set_body(&mut self, body: impl Into<Vec<u8>>) -> &mut Self {
        self.body = body.into();
        self.file_body = None;
        self.set_header("Content-Length", self.body.len().to_string());
        self
    }

    pub fn set_file_body(&mut self, path: PathBuf, len: u64) -> &mut Self {
        self.body.clear();
        self.set_header("Content-Length", len.to_string());
        self.file_body = Some(FileBody { path, len });
        self
    }

    pub fn set_content_type(&mut self, content_type: &str) -> &mut Self {
        self.set_header("Content-Type", content_type)
    }

    pub fn set_json(&mut self, json: &str) -> &mut Self {
        self.set_content_type("application/json; charset=utf-8");
        self.set_body(json.as_bytes().to_vec())
    }

    pub fn set_html(&mut self, html: &str) -> &mut Self {
        self.set_content_type("text/html; charset=utf-8");
        self.set_body(html.as_bytes().to_vec())
    }

    pub fn set_text(&mut self, text: &str) -> &mut Self {
        self.set_content_type("text/plain; charset=utf-8");
        self.set_body(text.as_bytes().to_vec())
    }

    pub fn set_keep_alive(&mut self, keep_alive: bool) -> &mut Self {
        self.set_header("Connection", if keep_alive { "keep-alive" } else { "close" })
    }

    pub fn set_cache_control(&mut self, value: &str) -> &mut Self {
        self.set_header("Cache-Control", value)
    }

    pub fn set_cors_headers(&mut self, origin: &str) -> &mut Self {
        self.set_header("Access-Control-Allow-Origin", origin);
        self.set_header("Access-Control-Allow-Methods", "GET, POST, PUT, DELETE, OPTIONS");
        self.set_header("Access-Control-Allow-Headers", "Content-Type, Authorization")
    }

    pub fn set_etag(&mut self, etag: &str, weak: bool) -> &mut Self {
        let formatted = if weak {
            format!("W/\"{etag}\"")
        } else {
            format!("\"{etag}\"")
        };
        self.set_header("ETag", formatted)
    }

    pub fn set_last_modified(&mut self, time: DateTime<Utc>) -> &mut Self {
        self.set_header("Last-Modified", format_http_date(time))
    }

    pub fn is_compressed(&self) -> bool {
        self.has_header("Content-Encoding")
    }

    /// Gzip the inline body when the client accepts it, the content type is
    /// compressible, the body reaches the minimum size, and compression
    /// actually shrinks it. File-backed and already-encoded bodies are left
    /// alone.
    pub fn compress_if_supported(
        &mut self,
        accept_encoding: &str,
        min_size: usize,
        level: u32,
        compressible_types: &[String],
    ) -> &mut Self {
        if !supports_gzip(accept_encoding)
            || self.body.is_empty()
            || self.body.len() < min_size
            || self.is_compressed()
            || self.file_body.is_some()
        {
            return self;
        }
        let content_type = self.header("Content-Type").unwrap_or("");
        if !compressible_types
            .iter()
            .any(|prefix| content_type.starts_with(prefix.as_str()))
        {
            return self;
        }

        let compressed = gzip_compress(&self.body, level);
        if !compressed.is_empty() && compressed.len() < self.body.len() {
            self.set_body(compressed);
            self.set_header("Content-Encoding", "gzip");
        }
        self
    }

    /// Status line, canonically cased headers, blank line, inline body.
    /// File-backed bodies are not included; the connection streams them
    /// after the head.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(128 + self.body.len());
        out.extend_from_slice(
            format!(
                "HTTP/1.1 {} {}\r\n",
                self.status.code(),
                self.status.reason()
            )
            .as_bytes(),
        );
        for (name, value) in &self.headers {
            out.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
        }
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&self.body);
        out
    }
}

// "content-type" -> "Content-Type".
fn canonical_header_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut uppercase_next = true;
    for ch in name.chars() {
        if ch == '-' {
            uppercase_next = true;
            out.push(ch);
        } else if uppercase_next {
            out.push(ch.to_ascii_uppercase());
            uppercase_next = false;
        } else {
            out.push(ch.to_ascii_lowercase());
        }
    }
    out
}

pub fn format_http_date(time: DateTime<Utc>) -> String {
    time.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

fn http_date_now() -> String {
    format_http_date(Utc::now())
}

pub fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(value)
        .ok()
        .map(|parsed| parsed.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::{canonical_header_name, format_http_date, parse_http_date, HttpResponse, HttpStatus};
    use chrono::{TimeZone, Utc};

    #[test]
    fn canonical_casing_uppercases_after_dash() {
        assert_eq!(canonical_header_name("content-type"), "Content-Type");
        assert_eq!(canonical_header_name("X-RATELIMIT-LIMIT"), "X-Ratelimit-Limit");
        assert_eq!(canonical_header_name("etag"), "Etag");
    }

    #[test]
    fn default_headers_are_set_on_construction() {
        let response = HttpResponse::new(HttpStatus::Ok);
        assert_eq!(response.header("Server"), Some("ember-http-server/1.0"));
        assert_eq!(response.header("Content-Length"), Some("0"));
        assert!(response.header("Date").expect("date set").ends_with("GMT"));
    }

    #[test]
    fn set_body_updates_content_length() {
        let mut response = HttpResponse::new(HttpStatus::Ok);
        response.set_text("Hello");
        assert_eq!(response.header("Content-Length"), Some("5"));
        assert_eq!(response.body(), b"Hello");
    }

    #[test]
    fn serializes_status_line_and_headers() {
        let mut response = HttpResponse::new(HttpStatus::NotFound);
        response.set_text("missing");
        let wire = String::from_utf8(response.to_bytes()).expect("utf8");
        assert!(wire.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(wire.contains("Content-Type: text/plain; charset=utf-8\r\n"));
        assert!(wire.ends_with("\r\n\r\nmissing"));
    }

    #[test]
    fn add_header_joins_with_comma() {
        let mut response = HttpResponse::new(HttpStatus::Ok);
        response.add_header("Vary", "Accept");
        response.add_header("Vary", "Accept-Encoding");
        assert_eq!(response.header("Vary"), Some("Accept, Accept-Encoding"));
    }

    #[test]
    fn compression_requires_min_size_and_type() {
        let types = vec!["text/".to_string(), "application/json".to_string()];
        let mut small = HttpResponse::new(HttpStatus::Ok);
        small.set_text("tiny");
        small.compress_if_supported("gzip", 1024, 6, &types);
        assert!(!small.is_compressed());

        let mut large = HttpResponse::new(HttpStatus::Ok);
        large.set_text(&"a".repeat(4096));
        large.compress_if_supported("gzip, deflate", 1024, 6, &types);
        assert!(large.is_compressed());
        assert_eq!(large.header("Content-Encoding"), Some("gzip"));
        assert!(large.body().len() < 4096);

        let mut binary = HttpResponse::new(HttpStatus::Ok);
        binary.set_content_type("image/png");
        binary.set_body(vec![0u8; 4096]);
        binary.compress_if_supported("gzip", 1024, 6, &types);
        assert!(!binary.is_compressed());
    }

    #[test]
    fn http_dates_round_trip_through_rfc1123() {
        let moment = Utc.with_ymd_and_hms(2025, 3, 9, 17, 5, 31).single().expect("valid");
        let formatted = format_http_date(moment);
        assert_eq!(formatted, "Sun, 09 Mar 2025 17:05:31 GMT");
        assert_eq!(parse_http_date(&formatted), Some(moment));
    }
}
