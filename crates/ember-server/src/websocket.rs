use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use ember_http::{WsFrame, WsFrameError, WsOpcode, WS_CONTROL_MAX_PAYLOAD};
use ember_observe::{Event, EventType};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::ServerShared;

const WS_READ_CHUNK_SIZE: usize = 8 * 1024;
const WS_PING_INTERVAL: Duration = Duration::from_secs(30);
const WS_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
const WS_CLOSE_LINGER: Duration = Duration::from_millis(100);

const CLOSE_NORMAL: u16 = 1000;
const CLOSE_PROTOCOL_ERROR: u16 = 1002;
const CLOSE_INVALID_PAYLOAD: u16 = 1007;
const CLOSE_MESSAGE_TOO_BIG: u16 = 1009;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WsState {
    Connecting,
    Open,
    Closing,
    Closed,
}

#[derive(Debug, Default)]
pub struct WsStats {
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
}

impl WsStats {
    pub fn messages_sent(&self) -> u64 {
        self.messages_sent.load(Ordering::Relaxed)
    }

    pub fn messages_received(&self) -> u64 {
        self.messages_received.load(Ordering::Relaxed)
    }
}

enum WsCommand {
    Frame(WsFrame),
    Close { code: u16, reason: String },
}

/// Handle given to message handlers for replying. Frames are queued to the
/// connection task, which serializes all writes on the socket.
#[derive(Clone)]
pub struct WsSender {
    commands: mpsc::UnboundedSender<WsCommand>,
    stats: Arc<WsStats>,
}

impl WsSender {
    pub fn send_text(&self, text: &str) {
        let frame = WsFrame::server(WsOpcode::Text, Bytes::copy_from_slice(text.as_bytes()));
        if self.commands.send(WsCommand::Frame(frame)).is_ok() {
            self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn send_binary(&self, data: &[u8]) {
        let frame = WsFrame::server(WsOpcode::Binary, Bytes::copy_from_slice(data));
        if self.commands.send(WsCommand::Frame(frame)).is_ok() {
            self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        }
    }

    // Outgoing control payloads are clamped to the 125-byte protocol limit.
    pub fn send_ping(&self, payload: &[u8]) {
        let clamped = &payload[..payload.len().min(WS_CONTROL_MAX_PAYLOAD)];
        let frame = WsFrame::server(WsOpcode::Ping, Bytes::copy_from_slice(clamped));
        let _ = self.commands.send(WsCommand::Frame(frame));
    }

    pub fn send_pong(&self, payload: &[u8]) {
        let clamped = &payload[..payload.len().min(WS_CONTROL_MAX_PAYLOAD)];
        let frame = WsFrame::server(WsOpcode::Pong, Bytes::copy_from_slice(clamped));
        let _ = self.commands.send(WsCommand::Frame(frame));
    }

    pub fn close(&self, code: u16, reason: &str) {
        let _ = self.commands.send(WsCommand::Close {
            code,
            reason: reason.to_string(),
        });
    }

    pub fn stats(&self) -> Arc<WsStats> {
        Arc::clone(&self.stats)
    }
}

type TextHandler = dyn Fn(&WsSender, &str) + Send + Sync;
type BinaryHandler = dyn Fn(&WsSender, &[u8]) + Send + Sync;
type CloseHandler = dyn Fn(u16, &str) + Send + Sync;
type ErrorHandler = dyn Fn(&str) + Send + Sync;

/// Per-route event handlers, held as plain function values on the
/// connection.
#[derive(Default, Clone)]
pub struct WsHandlers {
    on_text: Option<Arc<TextHandler>>,
    on_binary: Option<Arc<BinaryHandler>>,
    on_close: Option<Arc<CloseHandler>>,
    on_error: Option<Arc<ErrorHandler>>,
}

impl WsHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_text(mut self, handler: impl Fn(&WsSender, &str) + Send + Sync + 'static) -> Self {
        self.on_text = Some(Arc::new(handler));
        self
    }

    pub fn on_binary(mut self, handler: impl Fn(&WsSender, &[u8]) + Send + Sync + 'static) -> Self {
        self.on_binary = Some(Arc::new(handler));
        self
    }

    pub fn on_close(mut self, handler: impl Fn(u16, &str) + Send + Sync + 'static) -> Self {
        self.on_close = Some(Arc::new(handler));
        self
    }

    pub fn on_error(mut self, handler: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(handler));
        self
    }
}

struct WebSocketGuard {
    shared: Arc<ServerShared>,
    peer_ip: String,
}

impl WebSocketGuard {
    fn new(shared: Arc<ServerShared>, peer_ip: String) -> Self {
        shared.stats.record_websocket_open();
        shared
            .sink
            .emit(Event::new(EventType::WebSocketOpened, peer_ip.clone()));
        Self { shared, peer_ip }
    }
}

impl Drop for WebSocketGuard {
    fn drop(&mut self) {
        self.shared.stats.record_websocket_close();
        self.shared
            .sink
            .emit(Event::new(EventType::WebSocketClosed, self.peer_ip.clone()));
    }
}

enum Disposition {
    Continue,
    CloseQuietly,
    SendCloseAndStop(u16, String),
}

/// Runs the framed message loop after a successful upgrade. The 101 response
/// has already been written; `residual` holds any bytes the client sent
/// behind it.
pub(crate) async fn run_connection<S>(
    stream: S,
    residual: Vec<u8>,
    handlers: Arc<WsHandlers>,
    shared: Arc<ServerShared>,
    peer_ip: String,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let _guard = WebSocketGuard::new(Arc::clone(&shared), peer_ip.clone());
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let stats = Arc::new(WsStats::default());
    let sender = WsSender {
        commands: commands_tx,
        stats: Arc::clone(&stats),
    };

    let connection = WsConnection {
        stream,
        buffer: residual,
        state: WsState::Open,
        reassembly: None,
        handlers,
        sender,
        commands: commands_rx,
        stats,
        max_frame_size: shared.config.websocket_max_frame_size,
    };
    if let Err(error) = connection.run().await {
        tracing::debug!(peer = %peer_ip, detail = %error, "websocket connection ended with error");
    }
}

struct WsConnection<S> {
    stream: S,
    buffer: Vec<u8>,
    state: WsState,
    reassembly: Option<(WsOpcode, Vec<u8>)>,
    handlers: Arc<WsHandlers>,
    sender: WsSender,
    commands: mpsc::UnboundedReceiver<WsCommand>,
    stats: Arc<WsStats>,
    max_frame_size: usize,
}

impl<S> WsConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    async fn run(mut self) -> std::io::Result<()> {
        let mut chunk = [0u8; WS_READ_CHUNK_SIZE];
        let mut ping_timer = tokio::time::interval_at(
            Instant::now() + WS_PING_INTERVAL,
            WS_PING_INTERVAL,
        );
        let mut idle_deadline = Instant::now() + WS_IDLE_TIMEOUT;

        // The client may have sent frames back-to-back with the handshake.
        match self.drain_buffered_frames() {
            Disposition::Continue => {}
            disposition => return self.finish(disposition).await,
        }

        loop {
            tokio::select! {
                read = self.stream.read(&mut chunk) => {
                    let read = match read {
                        Ok(0) => return self.finish(Disposition::CloseQuietly).await,
                        Ok(read) => read,
                        Err(error) => {
                            self.emit_error(&format!("Read error: {error}"));
                            return self.finish(Disposition::CloseQuietly).await;
                        }
                    };
                    idle_deadline = Instant::now() + WS_IDLE_TIMEOUT;
                    self.buffer.extend_from_slice(&chunk[..read]);
                    match self.drain_buffered_frames() {
                        Disposition::Continue => {}
                        disposition => return self.finish(disposition).await,
                    }
                }
                command = self.commands.recv() => {
                    match command {
                        Some(WsCommand::Frame(frame)) => {
                            self.write_frame(&frame).await?;
                        }
                        Some(WsCommand::Close { code, reason }) => {
                            return self
                                .finish(Disposition::SendCloseAndStop(code, reason))
                                .await;
                        }
                        None => return self.finish(Disposition::CloseQuietly).await,
                    }
                }
                _ = ping_timer.tick() => {
                    let ping = WsFrame::server(WsOpcode::Ping, Bytes::new());
                    self.write_frame(&ping).await?;
                }
                _ = tokio::time::sleep_until(idle_deadline) => {
                    self.emit_error("Connection timeout");
                    return self.finish(Disposition::CloseQuietly).await;
                }
            }
        }
    }

    async fn finish(mut self, disposition: Disposition) -> std::io::Result<()> {
        match disposition {
            Disposition::Continue | Disposition::CloseQuietly => {}
            Disposition::SendCloseAndStop(code, reason) => {
                let frame = WsFrame::server(
                    WsOpcode::Close,
                    clamp_control_payload(WsFrame::close_payload(code, &reason)),
                );
                let _ = self.write_frame(&frame).await;
                self.state = WsState::Closing;
                // Let the peer's final ACK land before tearing the socket
                // down.
                tokio::time::sleep(WS_CLOSE_LINGER).await;
            }
        }
        let _ = self.stream.shutdown().await;
        self.state = WsState::Closed;
        Ok(())
    }

    async fn write_frame(&mut self, frame: &WsFrame) -> std::io::Result<()> {
        let wire = frame.encode();
        self.stream.write_all(&wire).await?;
        self.stream.flush().await
    }

    /// Parses as many complete frames as the buffer holds; stops on
    /// `NeedMore`. Returns how the loop should proceed.
    fn drain_buffered_frames(&mut self) -> Disposition {
        loop {
            if self.buffer.is_empty() {
                return Disposition::Continue;
            }
            let (frame, consumed) = match WsFrame::decode(&self.buffer, self.max_frame_size) {
                Ok(decoded) => decoded,
                Err(WsFrameError::NeedMore) => return Disposition::Continue,
                Err(WsFrameError::PayloadTooLarge) => {
                    self.emit_error("Frame exceeds maximum size");
                    return Disposition::SendCloseAndStop(
                        CLOSE_MESSAGE_TOO_BIG,
                        "frame too large".to_string(),
                    );
                }
                Err(error) => {
                    self.emit_error(&format!("Frame parse error: {}", error.code()));
                    return Disposition::SendCloseAndStop(
                        CLOSE_PROTOCOL_ERROR,
                        "protocol error".to_string(),
                    );
                }
            };
            self.buffer.drain(..consumed);

            match self.handle_frame(frame) {
                Disposition::Continue => {}
                disposition => return disposition,
            }
        }
    }

    fn handle_frame(&mut self, frame: WsFrame) -> Disposition {
        // Client frames must be masked on the wire, and no extension is
        // negotiated that would give the reserved bits meaning.
        if !frame.masked {
            self.emit_error("Unmasked frame from client");
            return Disposition::SendCloseAndStop(
                CLOSE_PROTOCOL_ERROR,
                "unmasked frame".to_string(),
            );
        }
        if frame.rsv1 || frame.rsv2 || frame.rsv3 {
            self.emit_error("Reserved bits set without a negotiated extension");
            return Disposition::SendCloseAndStop(
                CLOSE_PROTOCOL_ERROR,
                "reserved bits set".to_string(),
            );
        }
        if frame.opcode.is_control() && !frame.fin {
            self.emit_error("Fragmented control frame");
            return Disposition::SendCloseAndStop(
                CLOSE_PROTOCOL_ERROR,
                "fragmented control frame".to_string(),
            );
        }

        match frame.opcode {
            WsOpcode::Text | WsOpcode::Binary => self.handle_data_frame(frame),
            WsOpcode::Continuation => self.handle_continuation(frame),
            WsOpcode::Ping => {
                self.sender.send_pong(&frame.payload);
                Disposition::Continue
            }
            WsOpcode::Pong => {
                // Any received frame already reset the inactivity deadline.
                Disposition::Continue
            }
            WsOpcode::Close => {
                let (code, reason) = parse_close_payload(&frame.payload);
                if let Some(on_close) = &self.handlers.on_close {
                    on_close(code, &reason);
                }
                Disposition::SendCloseAndStop(code, String::new())
            }
        }
    }

    fn handle_data_frame(&mut self, frame: WsFrame) -> Disposition {
        if self.reassembly.is_some() {
            self.emit_error("New data message while reassembly in progress");
            return Disposition::SendCloseAndStop(
                CLOSE_PROTOCOL_ERROR,
                "interleaved message".to_string(),
            );
        }
        if frame.fin {
            return self.deliver_message(frame.opcode, &frame.payload);
        }
        self.reassembly = Some((frame.opcode, frame.payload.to_vec()));
        Disposition::Continue
    }

    fn handle_continuation(&mut self, frame: WsFrame) -> Disposition {
        let Some((opcode, mut assembled)) = self.reassembly.take() else {
            self.emit_error("Continuation frame without a message in progress");
            return Disposition::SendCloseAndStop(
                CLOSE_PROTOCOL_ERROR,
                "unexpected continuation".to_string(),
            );
        };
        if assembled.len() + frame.payload.len() > self.max_frame_size {
            self.emit_error("Reassembled message exceeds maximum size");
            return Disposition::SendCloseAndStop(
                CLOSE_MESSAGE_TOO_BIG,
                "message too large".to_string(),
            );
        }
        assembled.extend_from_slice(&frame.payload);
        if frame.fin {
            let payload = Bytes::from(assembled);
            return self.deliver_message(opcode, &payload);
        }
        self.reassembly = Some((opcode, assembled));
        Disposition::Continue
    }

    fn deliver_message(&mut self, opcode: WsOpcode, payload: &[u8]) -> Disposition {
        if self.state != WsState::Open {
            return Disposition::Continue;
        }
        match opcode {
            WsOpcode::Text => match std::str::from_utf8(payload) {
                Ok(text) => {
                    self.stats.messages_received.fetch_add(1, Ordering::Relaxed);
                    if let Some(on_text) = &self.handlers.on_text {
                        on_text(&self.sender, text);
                    }
                    Disposition::Continue
                }
                Err(_) => {
                    self.emit_error("Text message is not valid UTF-8");
                    Disposition::SendCloseAndStop(
                        CLOSE_INVALID_PAYLOAD,
                        "invalid utf-8".to_string(),
                    )
                }
            },
            WsOpcode::Binary => {
                self.stats.messages_received.fetch_add(1, Ordering::Relaxed);
                if let Some(on_binary) = &self.handlers.on_binary {
                    on_binary(&self.sender, payload);
                }
                Disposition::Continue
            }
            _ => Disposition::Continue,
        }
    }

    fn emit_error(&self, detail: &str) {
        if let Some(on_error) = &self.handlers.on_error {
            on_error(detail);
        }
    }
}

fn parse_close_payload(payload: &[u8]) -> (u16, String) {
    if payload.len() >= 2 {
        let code = u16::from_be_bytes([payload[0], payload[1]]);
        let reason = String::from_utf8_lossy(&payload[2..]).into_owned();
        (code, reason)
    } else {
        (CLOSE_NORMAL, String::new())
    }
}

fn clamp_control_payload(payload: Bytes) -> Bytes {
    if payload.len() > WS_CONTROL_MAX_PAYLOAD {
        payload.slice(..WS_CONTROL_MAX_PAYLOAD)
    } else {
        payload
    }
}
