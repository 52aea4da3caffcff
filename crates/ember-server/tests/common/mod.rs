#![allow(dead_code)]

use std::net::SocketAddr;

use ember_server::{HttpServer, ServerConfig, ServerError};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;

pub struct TestServer {
    pub addr: SocketAddr,
    pub tls_addr: Option<SocketAddr>,
    pub shutdown: watch::Sender<bool>,
    pub handle: tokio::task::JoinHandle<Result<(), ServerError>>,
}

impl TestServer {
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.handle.await;
    }
}

pub fn test_config() -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        serve_static_files: false,
        ..ServerConfig::default()
    }
}

pub async fn start_server(
    config: ServerConfig,
    register: impl FnOnce(&mut HttpServer),
) -> TestServer {
    let mut server = HttpServer::new(config).expect("build server");
    register(&mut server);

    let listener = server.bind_listener().await.expect("bind listener");
    let addr = listener.local_addr().expect("listener local addr");

    let tls_listener = if server.config().enable_https {
        Some(server.bind_tls_listener().await.expect("bind tls listener"))
    } else {
        None
    };
    let tls_addr = tls_listener
        .as_ref()
        .map(|listener| listener.local_addr().expect("tls listener local addr"));

    let (shutdown, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(server.run_with_listeners(listener, tls_listener, shutdown_rx));
    TestServer {
        addr,
        tls_addr,
        shutdown,
        handle,
    }
}

pub async fn connect(addr: SocketAddr) -> TcpStream {
    TcpStream::connect(addr).await.expect("connect to server")
}

pub async fn read_response_head<S: AsyncRead + Unpin>(stream: &mut S) -> String {
    let mut data = Vec::new();
    let mut buffer = [0_u8; 1024];
    while !data.windows(4).any(|window| window == b"\r\n\r\n") {
        let read = stream.read(&mut buffer).await.expect("read response head");
        if read == 0 {
            break;
        }
        data.extend_from_slice(&buffer[..read]);
    }
    String::from_utf8_lossy(&data).to_string()
}

/// Reads one full response: the head, then exactly Content-Length body
/// bytes. Works on keep-alive connections because it never over-reads.
pub async fn read_response<S: AsyncRead + Unpin>(stream: &mut S) -> (String, Vec<u8>) {
    let mut data = Vec::new();
    let mut buffer = [0_u8; 1024];
    let head_end = loop {
        if let Some(position) = data.windows(4).position(|window| window == b"\r\n\r\n") {
            break position + 4;
        }
        let read = stream.read(&mut buffer).await.expect("read response head");
        assert!(read > 0, "connection closed before response head completed");
        data.extend_from_slice(&buffer[..read]);
    };

    let head = String::from_utf8_lossy(&data[..head_end]).to_string();
    let content_length = header_value(&head, "content-length")
        .and_then(|value| value.parse::<usize>().ok())
        .unwrap_or(0);

    let mut body = data[head_end..].to_vec();
    while body.len() < content_length {
        let read = stream.read(&mut buffer).await.expect("read response body");
        assert!(read > 0, "connection closed before response body completed");
        body.extend_from_slice(&buffer[..read]);
    }
    body.truncate(content_length);
    (head, body)
}

pub fn status_code(head: &str) -> u16 {
    head.split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .expect("status code in response head")
}

pub fn header_value(head: &str, name: &str) -> Option<String> {
    for line in head.lines().skip(1) {
        if let Some((candidate, value)) = line.split_once(':') {
            if candidate.trim().eq_ignore_ascii_case(name) {
                return Some(value.trim().to_string());
            }
        }
    }
    None
}

pub async fn write_ws_frame<S: AsyncWrite + Unpin>(
    stream: &mut S,
    opcode: u8,
    payload: &[u8],
    mask: Option<[u8; 4]>,
) {
    let mut frame = Vec::with_capacity(14 + payload.len());
    frame.push(0b1000_0000 | (opcode & 0b0000_1111));

    let mask_bit = if mask.is_some() { 0b1000_0000 } else { 0 };
    if payload.len() <= 125 {
        frame.push(mask_bit | payload.len() as u8);
    } else if payload.len() <= u16::MAX as usize {
        frame.push(mask_bit | 126);
        frame.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    } else {
        frame.push(mask_bit | 127);
        frame.extend_from_slice(&(payload.len() as u64).to_be_bytes());
    }

    match mask {
        Some(key) => {
            frame.extend_from_slice(&key);
            frame.extend(
                payload
                    .iter()
                    .enumerate()
                    .map(|(index, byte)| byte ^ key[index % 4]),
            );
        }
        None => frame.extend_from_slice(payload),
    }

    stream.write_all(&frame).await.expect("write websocket frame");
}

pub struct TestWsFrame {
    pub fin: bool,
    pub opcode: u8,
    pub masked: bool,
    pub payload: Vec<u8>,
}

pub async fn read_ws_frame<S: AsyncRead + Unpin>(stream: &mut S) -> TestWsFrame {
    let mut header = [0_u8; 2];
    stream
        .read_exact(&mut header)
        .await
        .expect("read frame header");
    let fin = header[0] & 0b1000_0000 != 0;
    let opcode = header[0] & 0b0000_1111;
    let masked = header[1] & 0b1000_0000 != 0;
    let mut payload_len = (header[1] & 0b0111_1111) as u64;

    if payload_len == 126 {
        let mut extended = [0_u8; 2];
        stream
            .read_exact(&mut extended)
            .await
            .expect("read extended length");
        payload_len = u16::from_be_bytes(extended) as u64;
    } else if payload_len == 127 {
        let mut extended = [0_u8; 8];
        stream
            .read_exact(&mut extended)
            .await
            .expect("read extended length");
        payload_len = u64::from_be_bytes(extended);
    }

    let key = if masked {
        let mut key = [0_u8; 4];
        stream.read_exact(&mut key).await.expect("read masking key");
        Some(key)
    } else {
        None
    };

    let mut payload = vec![0_u8; payload_len as usize];
    stream
        .read_exact(&mut payload)
        .await
        .expect("read frame payload");
    if let Some(key) = key {
        for (index, byte) in payload.iter_mut().enumerate() {
            *byte ^= key[index % 4];
        }
    }

    TestWsFrame {
        fin,
        opcode,
        masked,
        payload,
    }
}
