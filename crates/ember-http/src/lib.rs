//! Wire-level protocol codecs for the ember server: the HTTP/1.1 message
//! codec (request parsing, response serialization, chunked transfer) and the
//! RFC 6455 WebSocket frame codec with the upgrade handshake.

mod compress;
mod etag;
mod mime;
mod request;
mod response;
mod ws_frame;
mod ws_handshake;

pub use compress::{gzip_compress, gzip_decompress, parse_accept_encoding, supports_gzip};
pub use etag::{etag_matches, file_etag};
pub use mime::mime_type_for_extension;
pub use request::{
    parse_request, request_is_complete, HttpParseError, HttpRequest, ParsedRequest,
};
pub use response::{format_http_date, parse_http_date, FileBody, HttpResponse, HttpStatus};
pub use ws_frame::{apply_mask, WsFrame, WsFrameError, WsOpcode, WS_CONTROL_MAX_PAYLOAD};
pub use ws_handshake::{
    accept_key, handshake_rejection, handshake_response, is_upgrade_request, validate_upgrade,
    WsHandshakeError, WEBSOCKET_GUID,
};

pub const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
    Head,
    Options,
    Patch,
    Unknown,
}

impl HttpMethod {
    pub fn from_token(token: &str) -> Self {
        match token {
            "GET" => Self::Get,
            "POST" => Self::Post,
            "PUT" => Self::Put,
            "DELETE" => Self::Delete,
            "HEAD" => Self::Head,
            "OPTIONS" => Self::Options,
            "PATCH" => Self::Patch,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
            Self::Head => "HEAD",
            Self::Options => "OPTIONS",
            Self::Patch => "PATCH",
            Self::Unknown => "UNKNOWN",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpVersion {
    Http10,
    Http11,
}

impl HttpVersion {
    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "HTTP/1.0" => Some(Self::Http10),
            "HTTP/1.1" => Some(Self::Http11),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Http10 => "HTTP/1.0",
            Self::Http11 => "HTTP/1.1",
        }
    }
}
