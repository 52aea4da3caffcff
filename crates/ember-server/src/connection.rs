use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use ember_http::{
    parse_request, request_is_complete, HttpParseError, HttpResponse, HttpStatus, ParsedRequest,
};
use ember_observe::{Event, EventType};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::router::{error_response, Dispatch};
use crate::websocket;
use crate::ServerShared;

const READ_CHUNK_SIZE: usize = 8 * 1024;
const FILE_STREAM_CHUNK_SIZE: usize = 8 * 1024;

/// Errors that end a connection without a log line: the peer simply went
/// away, or our own inactivity timer fired.
fn is_silent_error(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
    )
}

enum Assembled {
    Request(ParsedRequest),
    Rejected(HttpResponse),
    PeerGone,
}

/// One accepted socket, plain or TLS: reads requests, dispatches them, and
/// streams responses back until keep-alive ends or the peer disappears.
pub(crate) async fn serve_connection<S>(
    mut stream: S,
    peer: SocketAddr,
    shared: Arc<ServerShared>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let peer_ip = peer.ip().to_string();
    let mut buffer: Vec<u8> = Vec::with_capacity(READ_CHUNK_SIZE);

    loop {
        let parsed = match assemble_request(&mut stream, &mut buffer, &shared).await {
            Ok(Assembled::Request(parsed)) => parsed,
            Ok(Assembled::Rejected(mut response)) => {
                response.set_keep_alive(false);
                let _ = write_response(&mut stream, &response, &shared).await;
                shared.sink.emit(
                    Event::new(EventType::RequestRejected, peer_ip.clone())
                        .with_attribute("status", response.status().code().to_string()),
                );
                let _ = stream.shutdown().await;
                return;
            }
            Ok(Assembled::PeerGone) => return,
            Err(error) => {
                if !is_silent_error(&error) {
                    tracing::warn!(peer = %peer, detail = %error, "connection read failed");
                }
                return;
            }
        };

        eprintln!("DEBUG before drain: buffer.len()={} consumed={}", buffer.len(), parsed.consumed);
        buffer.drain(..parsed.consumed.min(buffer.len()));
        eprintln!("DEBUG after drain: buffer.len()={} buffer={:?}", buffer.len(), String::from_utf8_lossy(&buffer));
        let request = parsed.request;

        if !request.valid {
            let mut response = error_response(HttpStatus::BadRequest, "Invalid HTTP request");
            response.set_keep_alive(false);
            let _ = write_response(&mut stream, &response, &shared).await;
            shared.sink.emit(
                Event::new(EventType::RequestRejected, peer_ip.clone())
                    .with_attribute("status", "400"),
            );
            let _ = stream.shutdown().await;
            return;
        }

        shared.stats.record_request();
        let router = shared.router();
        match router.dispatch(&request, &peer_ip, &shared.config).await {
            Dispatch::Response(mut response) => {
                if shared.config.enable_compression {
                    if let Some(accept_encoding) = request.header("accept-encoding") {
                        response.compress_if_supported(
                            accept_encoding,
                            shared.config.compression_min_size,
                            shared.config.compression_level,
                            &shared.config.compressible_types,
                        );
                    }
                }

                let keep_alive = request.is_keep_alive()
                    && response
                        .header("Connection")
                        .map(|value| !value.eq_ignore_ascii_case("close"))
                        .unwrap_or(true);
                if !response.has_header("Connection") {
                    response.set_keep_alive(keep_alive);
                }

                if let Err(error) = write_response(&mut stream, &response, &shared).await {
                    if !is_silent_error(&error) {
                        tracing::warn!(peer = %peer, detail = %error, "response write failed");
                    }
                    return;
                }
                emit_request_event(&shared, &peer_ip, &request, &response);

                if !keep_alive {
                    let _ = stream.shutdown().await;
                    return;
                }
                // Keep-alive: the buffer already holds any pipelined bytes.
            }
            Dispatch::WebSocketUpgrade { response, handlers } => {
                if let Err(error) = write_response(&mut stream, &response, &shared).await {
                    if !is_silent_error(&error) {
                        tracing::warn!(peer = %peer, detail = %error, "upgrade write failed");
                    }
                    return;
                }
                emit_request_event(&shared, &peer_ip, &request, &response);

                // Ownership of the socket transfers to the WebSocket loop,
                // along with any bytes the client sent after the upgrade.
                let residual = std::mem::take(&mut buffer);
                websocket::run_connection(stream, residual, handlers, shared, peer_ip).await;
                return;
            }
        }
    }
}

/// Reads until the completeness predicate holds, enforcing the inactivity
/// timeout and the pre-parse buffer cap, then parses. A parse that still
/// reports `NeedMore` (a false-positive completeness hit inside chunked
/// data) resumes reading.
async fn assemble_request<S>(
    stream: &mut S,
    buffer: &mut Vec<u8>,
    shared: &ServerShared,
) -> io::Result<Assembled>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let timeout = shared.config.keep_alive_timeout_duration();
    let mut chunk = [0u8; READ_CHUNK_SIZE];

    loop {
        if buffer.len() > shared.config.max_request_size {
            return Ok(Assembled::Rejected(error_response(
                HttpStatus::PayloadTooLarge,
                "Request entity too large",
            )));
        }

        if request_is_complete(buffer) {
            match parse_request(buffer) {
                Ok(parsed) => return Ok(Assembled::Request(parsed)),
                Err(HttpParseError::NeedMore) => {}
                Err(HttpParseError::TooLarge) => {
                    return Ok(Assembled::Rejected(error_response(
                        HttpStatus::PayloadTooLarge,
                        "Request entity too large",
                    )));
                }
                Err(_) => {
                    return Ok(Assembled::Rejected(error_response(
                        HttpStatus::BadRequest,
                        "Invalid HTTP request",
                    )));
                }
            }
        }

        let read = match tokio::time::timeout(timeout, stream.read(&mut chunk)).await {
            Ok(result) => result?,
            // Inactivity timeout: silent close.
            Err(_) => return Ok(Assembled::PeerGone),
        };
        if read == 0 {
            return Ok(Assembled::PeerGone);
        }
        shared.stats.record_bytes_received(read as u64);
        buffer.extend_from_slice(&chunk[..read]);
    }
}

/// Head plus inline body in one write; file-backed bodies are streamed after
/// the head in fixed-size chunks so large files never load whole.
async fn write_response<S>(
    stream: &mut S,
    response: &HttpResponse,
    shared: &ServerShared,
) -> io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let timeout = shared.config.keep_alive_timeout_duration();
    let head = response.to_bytes();
    tokio::time::timeout(timeout, stream.write_all(&head))
        .await
        .map_err(write_timeout_error)??;
    shared.stats.record_bytes_sent(head.len() as u64);

    if let Some(file_body) = response.file_body() {
        let mut file = tokio::fs::File::open(&file_body.path).await?;
        let mut chunk = [0u8; FILE_STREAM_CHUNK_SIZE];
        loop {
            let read = file.read(&mut chunk).await?;
            if read == 0 {
                break;
            }
            tokio::time::timeout(timeout, stream.write_all(&chunk[..read]))
                .await
                .map_err(write_timeout_error)??;
            shared.stats.record_bytes_sent(read as u64);
        }
    }

    tokio::time::timeout(timeout, stream.flush())
        .await
        .map_err(write_timeout_error)?
}

fn write_timeout_error(_: tokio::time::error::Elapsed) -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, "response write timed out")
}

fn emit_request_event(
    shared: &ServerShared,
    peer_ip: &str,
    request: &ember_http::HttpRequest,
    response: &HttpResponse,
) {
    shared.sink.emit(
        Event::new(EventType::RequestHandled, peer_ip)
            .with_attribute("method", request.method.as_str())
            .with_attribute("path", request.path.clone())
            .with_attribute("status", response.status().code().to_string())
            .with_attribute("bytes", response.body().len().to_string()),
    );
}
