use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use sha1::{Digest, Sha1};

use crate::{HttpRequest, HttpResponse, HttpStatus};

pub const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WsHandshakeError {
    MissingUpgradeHeader,
    MissingConnectionUpgrade,
    UnsupportedVersion,
    MissingKey,
    InvalidKey,
}

impl WsHandshakeError {
    pub fn code(self) -> &'static str {
        match self {
            Self::MissingUpgradeHeader => "missing_upgrade_header",
            Self::MissingConnectionUpgrade => "missing_connection_upgrade",
            Self::UnsupportedVersion => "unsupported_version",
            Self::MissingKey => "missing_key",
            Self::InvalidKey => "invalid_key",
        }
    }

    pub fn reason(self) -> &'static str {
        match self {
            Self::MissingUpgradeHeader => "Upgrade header must be websocket",
            Self::MissingConnectionUpgrade => "Connection header must contain Upgrade",
            Self::UnsupportedVersion => "Sec-WebSocket-Version must be 13",
            Self::MissingKey => "Missing Sec-WebSocket-Key",
            Self::InvalidKey => "Sec-WebSocket-Key must decode to 16 bytes",
        }
    }
}

pub fn is_upgrade_request(request: &HttpRequest) -> bool {
    let upgrade = request
        .header("upgrade")
        .map(|value| value.trim().eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);
    let connection = request
        .header("connection")
        .map(|value| {
            value
                .split(',')
                .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
        })
        .unwrap_or(false);
    upgrade && connection
}

/// Full RFC 6455 section 4.2.1 validation; returns the client key on
/// success.
pub fn validate_upgrade(request: &HttpRequest) -> Result<&str, WsHandshakeError> {
    if !request
        .header("upgrade")
        .map(|value| value.trim().eq_ignore_ascii_case("websocket"))
        .unwrap_or(false)
    {
        return Err(WsHandshakeError::MissingUpgradeHeader);
    }
    if !request
        .header("connection")
        .map(|value| {
            value
                .split(',')
                .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
        })
        .unwrap_or(false)
    {
        return Err(WsHandshakeError::MissingConnectionUpgrade);
    }
    if request
        .header("sec-websocket-version")
        .map(|value| value.trim() != "13")
        .unwrap_or(true)
    {
        return Err(WsHandshakeError::UnsupportedVersion);
    }

    let key = request
        .header("sec-websocket-key")
        .map(str::trim)
        .filter(|key| !key.is_empty())
        .ok_or(WsHandshakeError::MissingKey)?;
    match BASE64.decode(key) {
        Ok(decoded) if decoded.len() == 16 => Ok(key),
        _ => Err(WsHandshakeError::InvalidKey),
    }
}

/// `Sec-WebSocket-Accept` = base64(SHA1(key || GUID)).
pub fn accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WEBSOCKET_GUID.as_bytes());
    BASE64.encode(hasher.finalize())
}

pub fn handshake_response(key: &str) -> HttpResponse {
    let mut response = HttpResponse::new(HttpStatus::SwitchingProtocols);
    response.set_header("Upgrade", "websocket");
    response.set_header("Connection", "Upgrade");
    response.set_header("Sec-Websocket-Accept", accept_key(key));
    response.remove_header("Content-Length");
    response
}

pub fn handshake_rejection(reason: &str) -> HttpResponse {
    let mut response = HttpResponse::new(HttpStatus::BadRequest);
    response.set_text("WebSocket handshake failed");
    if !reason.is_empty() {
        response.set_header("X-Websocket-Reject-Reason", reason);
    }
    response
}
