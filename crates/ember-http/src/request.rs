use std::collections::BTreeMap;

use bytes::Bytes;

use crate::{HttpMethod, HttpVersion, MAX_BODY_BYTES};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpParseError {
    NeedMore,
    Malformed,
    TooLarge,
    InvalidVersion,
}

impl HttpParseError {
    pub fn code(self) -> &'static str {
        match self {
            Self::NeedMore => "need_more",
            Self::Malformed => "malformed",
            Self::TooLarge => "too_large",
            Self::InvalidVersion => "invalid_version",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub path: String,
    pub version: HttpVersion,
    pub headers: BTreeMap<String, String>,
    pub query_params: BTreeMap<String, String>,
    pub body: Bytes,
    pub valid: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedRequest {
    pub request: HttpRequest,
    pub consumed: usize,
}

impl HttpRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn has_header(&self, name: &str) -> bool {
        self.headers.contains_key(&name.to_ascii_lowercase())
    }

    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query_params.get(name).map(String::as_str)
    }

    pub fn content_length(&self) -> usize {
        self.header("content-length")
            .and_then(|value| value.trim().parse::<usize>().ok())
            .unwrap_or(0)
    }

    pub fn content_type(&self) -> &str {
        self.header("content-type").unwrap_or("")
    }

    pub fn is_keep_alive(&self) -> bool {
        match self.header("connection") {
            Some(value) => value.eq_ignore_ascii_case("keep-alive"),
            None => self.version == HttpVersion::Http11,
        }
    }

    pub fn if_none_match(&self) -> Option<&str> {
        self.header("if-none-match")
    }

    pub fn if_match(&self) -> Option<&str> {
        self.header("if-match")
    }

    pub fn if_modified_since(&self) -> Option<&str> {
        self.header("if-modified-since")
    }

    pub fn if_unmodified_since(&self) -> Option<&str> {
        self.header("if-unmodified-since")
    }

    /// Serializes back to wire form. Query parameters are re-joined from the
    /// parsed map and a Content-Length header is emitted for non-empty
    /// bodies, so `parse_request` on the output yields a structurally
    /// equivalent request.
    pub fn to_wire_bytes(&self) -> Vec<u8> {
        let mut target = self.path.clone();
        if !self.query_params.is_empty() {
            let joined = self
                .query_params
                .iter()
                .map(|(key, value)| format!("{key}={value}"))
                .collect::<Vec<_>>()
                .join("&");
            target.push('?');
            target.push_str(&joined);
        }

        let mut out = Vec::with_capacity(128 + self.body.len());
        out.extend_from_slice(
            format!(
                "{} {} {}\r\n",
                self.method.as_str(),
                target,
                self.version.as_str()
            )
            .as_bytes(),
        );
        for (name, value) in &self.headers {
            if name == "content-length" {
                continue;
            }
            out.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
        }
        if !self.body.is_empty() {
            out.extend_from_slice(format!("content-length: {}\r\n", self.body.len()).as_bytes());
        }
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&self.body);
        out
    }
}

pub fn parse_request(input: &[u8]) -> Result<ParsedRequest, HttpParseError> {
    let (header_end, terminator_len) =
        find_header_terminator(input).ok_or(HttpParseError::NeedMore)?;
    let head = std::str::from_utf8(&input[..header_end]).map_err(|_| HttpParseError::Malformed)?;

    let mut lines = head.split('\n').map(|line| line.strip_suffix('\r').unwrap_or(line));
    let request_line = lines.next().ok_or(HttpParseError::Malformed)?;
    let (method, path, query_params, version) = parse_request_line(request_line)?;

    let mut headers = BTreeMap::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        parse_header_line(line, &mut headers);
    }

    let body_start = header_end + terminator_len;
    let (body, consumed) = parse_body(&input[body_start..], &headers)?;

    let valid = method != HttpMethod::Unknown && !path.is_empty();
    Ok(ParsedRequest {
        request: HttpRequest {
            method,
            path,
            version,
            headers,
            query_params,
            body,
            valid,
        },
        consumed: body_start + consumed,
    })
}

/// Completeness check used by the connection to decide when to stop reading.
/// Cheap header scan only; the full parse runs once this returns true.
pub fn request_is_complete(input: &[u8]) -> bool {
    let Some((header_end, terminator_len)) = find_header_terminator(input) else {
        return false;
    };
    let Ok(head) = std::str::from_utf8(&input[..header_end]) else {
        // An undecodable head will never complete; let the parse reject it.
        return true;
    };

    if scan_header_token(head, "transfer-encoding", "chunked") {
        return find_subsequence(input, b"\r\n0\r\n\r\n").is_some()
            || find_subsequence(input, b"\n0\r\n\r\n").is_some();
    }

    let content_length = scan_header_value(head, "content-length")
        .and_then(|value| value.trim().parse::<usize>().ok())
        .unwrap_or(0);
    input.len() - (header_end + terminator_len) >= content_length
}

fn parse_request_line(
    line: &str,
) -> Result<(HttpMethod, String, BTreeMap<String, String>, HttpVersion), HttpParseError> {
    let mut parts = line.split_whitespace();
    let method_token = parts.next().ok_or(HttpParseError::Malformed)?;
    let target = parts.next().ok_or(HttpParseError::Malformed)?;
    let version_token = parts.next().ok_or(HttpParseError::Malformed)?;
    if parts.next().is_some() {
        return Err(HttpParseError::Malformed);
    }

    let version =
        HttpVersion::from_token(version_token).ok_or(HttpParseError::InvalidVersion)?;
    let method = HttpMethod::from_token(method_token);

    let (path, query_params) = match target.split_once('?') {
        Some((path, query)) => (path.to_string(), parse_query_string(query)),
        None => (target.to_string(), BTreeMap::new()),
    };

    Ok((method, path, query_params, version))
}

// Percent-encodings are preserved as-is; decoding is the handler's concern.
fn parse_query_string(query: &str) -> BTreeMap<String, String> {
    let mut params = BTreeMap::new();
    for pair in query.split('&') {
        if pair.is_empty() {
            continue;
        }
        match pair.split_once('=') {
            Some((key, value)) => params.insert(key.to_string(), value.to_string()),
            None => params.insert(pair.to_string(), String::new()),
        };
    }
    params
}

// An invalid name or value drops the header; parsing continues.
fn parse_header_line(line: &str, headers: &mut BTreeMap<String, String>) {
    let Some((name, value)) = line.split_once(':') else {
        return;
    };
    let name = name.trim_matches([' ', '\t']);
    let value = value.trim_matches([' ', '\t']);
    if !is_valid_header_name(name) || !is_valid_header_value(value) {
        return;
    }

    let key = name.to_ascii_lowercase();
    match headers.get_mut(&key) {
        Some(existing) => {
            existing.push_str(", ");
            existing.push_str(value);
        }
        None => {
            headers.insert(key, value.to_string());
        }
    }
}

// RFC 7230 token grammar.
fn is_valid_header_name(name: &str) -> bool {
    !name.is_empty()
        && name.bytes().all(|byte| {
            byte.is_ascii_alphanumeric()
                || matches!(
                    byte,
                    b'!' | b'#'
                        | b'$'
                        | b'%'
                        | b'&'
                        | b'\''
                        | b'*'
                        | b'+'
                        | b'-'
                        | b'.'
                        | b'^'
                        | b'_'
                        | b'`'
                        | b'|'
                        | b'~'
                )
        })
}

// Visible ASCII, SP, HTAB, and obs-text; CR, LF, NUL and other C0 controls
// are rejected.
fn is_valid_header_value(value: &str) -> bool {
    value
        .bytes()
        .all(|byte| (0x21..=0x7E).contains(&byte) || byte == 0x20 || byte == 0x09 || byte >= 0x80)
}

fn parse_body(
    input: &[u8],
    headers: &BTreeMap<String, String>,
) -> Result<(Bytes, usize), HttpParseError> {
    // Transfer-Encoding takes precedence over Content-Length when both are
    // present.
    if header_has_token(headers, "transfer-encoding", "chunked") {
        return parse_chunked_body(input);
    }

    let content_length = headers
        .get("content-length")
        .and_then(|value| value.trim().parse::<usize>().ok())
        .unwrap_or(0);
    if content_length > MAX_BODY_BYTES {
        return Err(HttpParseError::TooLarge);
    }
    if content_length == 0 {
        return Ok((Bytes::new(), 0));
    }
    if input.len() < content_length {
        return Err(HttpParseError::NeedMore);
    }
    Ok((
        Bytes::copy_from_slice(&input[..content_length]),
        content_length,
    ))
}

fn parse_chunked_body(input: &[u8]) -> Result<(Bytes, usize), HttpParseError> {
    let mut body = Vec::new();
    let mut pos = 0usize;

    loop {
        let line_end = find_subsequence(&input[pos..], b"\r\n").ok_or(HttpParseError::NeedMore)?;
        let size_line =
            std::str::from_utf8(&input[pos..pos + line_end]).map_err(|_| HttpParseError::Malformed)?;
        // Chunk extensions after ';' are ignored.
        let size_hex = size_line.split(';').next().unwrap_or("").trim();
        let chunk_size =
            usize::from_str_radix(size_hex, 16).map_err(|_| HttpParseError::Malformed)?;
        pos += line_end + 2;

        if chunk_size == 0 {
            // First zero-size chunk terminates the body. Trailer lines are
            // consumed up to the blank line but never exposed.
            loop {
                let trailer_end =
                    find_subsequence(&input[pos..], b"\r\n").ok_or(HttpParseError::NeedMore)?;
                pos += trailer_end + 2;
                if trailer_end == 0 {
                    return Ok((Bytes::from(body), pos));
                }
            }
        }

        if body.len() + chunk_size > MAX_BODY_BYTES {
            return Err(HttpParseError::TooLarge);
        }
        if input.len() < pos + chunk_size + 2 {
            return Err(HttpParseError::NeedMore);
        }
        body.extend_from_slice(&input[pos..pos + chunk_size]);
        pos += chunk_size;
        if &input[pos..pos + 2] != b"\r\n" {
            return Err(HttpParseError::Malformed);
        }
        pos += 2;
    }
}

// Earliest of CRLFCRLF (preferred) or bare LFLF (tolerated). Returns the
// offset where the head ends and the terminator length.
fn find_header_terminator(input: &[u8]) -> Option<(usize, usize)> {
    let crlf = find_subsequence(input, b"\r\n\r\n");
    let lflf = find_subsequence(input, b"\n\n");
    match (crlf, lflf) {
        (Some(a), Some(b)) if b < a => Some((b, 2)),
        (Some(a), _) => Some((a, 4)),
        (None, Some(b)) => Some((b, 2)),
        (None, None) => None,
    }
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn header_has_token(headers: &BTreeMap<String, String>, name: &str, token: &str) -> bool {
    headers
        .get(name)
        .map(|value| {
            value
                .split(',')
                .any(|part| part.trim().eq_ignore_ascii_case(token))
        })
        .unwrap_or(false)
}

// Loose header scans for the completeness check, run before full parsing.
fn scan_header_value<'a>(head: &'a str, name: &str) -> Option<&'a str> {
    for line in head.split('\n').skip(1) {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if let Some((candidate, value)) = line.split_once(':') {
            if candidate.trim().eq_ignore_ascii_case(name) {
                return Some(value.trim());
            }
        }
    }
    None
}

fn scan_header_token(head: &str, name: &str, token: &str) -> bool {
    scan_header_value(head, name)
        .map(|value| {
            value
                .split(',')
                .any(|part| part.trim().eq_ignore_ascii_case(token))
        })
        .unwrap_or(false)
}
