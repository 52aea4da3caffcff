//! Observability for the ember server: a small event model with pluggable
//! sinks, and the process-wide statistics counters.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    ConnectionOpened,
    ConnectionClosed,
    ConnectionRefused,
    TlsHandshakeFailed,
    RequestHandled,
    RequestRejected,
    WebSocketOpened,
    WebSocketClosed,
}

impl EventType {
    pub fn code(self) -> &'static str {
        match self {
            Self::ConnectionOpened => "connection_opened",
            Self::ConnectionClosed => "connection_closed",
            Self::ConnectionRefused => "connection_refused",
            Self::TlsHandshakeFailed => "tls_handshake_failed",
            Self::RequestHandled => "request_handled",
            Self::RequestRejected => "request_rejected",
            Self::WebSocketOpened => "websocket_opened",
            Self::WebSocketClosed => "websocket_closed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub kind: EventType,
    pub client_addr: String,
    pub occurred_at_unix_ms: u128,
    pub attributes: BTreeMap<String, String>,
}

impl Event {
    pub fn new(kind: EventType, client_addr: impl Into<String>) -> Self {
        Self {
            kind,
            client_addr: client_addr.into(),
            occurred_at_unix_ms: now_unix_ms(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_attribute(mut self, key: &str, value: impl Into<String>) -> Self {
        self.attributes.insert(key.to_string(), value.into());
        self
    }
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: Event);
}

#[derive(Debug, Default)]
pub struct NoopEventSink;

impl EventSink for NoopEventSink {
    fn emit(&self, _event: Event) {}
}

/// Captures events for test assertions.
#[derive(Debug, Default, Clone)]
pub struct VecEventSink {
    events: Arc<Mutex<Vec<Event>>>,
}

impl VecEventSink {
    pub fn snapshot(&self) -> Vec<Event> {
        self.events.lock().expect("event sink lock poisoned").clone()
    }
}

impl EventSink for VecEventSink {
    fn emit(&self, event: Event) {
        self.events
            .lock()
            .expect("event sink lock poisoned")
            .push(event);
    }
}

/// Default sink: structured access log lines through `tracing`.
#[derive(Debug, Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, event: Event) {
        match event.kind {
            EventType::RequestHandled => tracing::info!(
                client = %event.client_addr,
                method = event.attributes.get("method").map(String::as_str).unwrap_or("-"),
                path = event.attributes.get("path").map(String::as_str).unwrap_or("-"),
                status = event.attributes.get("status").map(String::as_str).unwrap_or("-"),
                bytes = event.attributes.get("bytes").map(String::as_str).unwrap_or("0"),
                "request"
            ),
            EventType::TlsHandshakeFailed | EventType::RequestRejected => tracing::warn!(
                client = %event.client_addr,
                kind = event.kind.code(),
                detail = event.attributes.get("detail").map(String::as_str).unwrap_or(""),
                "connection failure"
            ),
            _ => tracing::debug!(
                client = %event.client_addr,
                kind = event.kind.code(),
                "event"
            ),
        }
    }
}

#[derive(Debug)]
pub struct ServerStats {
    total_requests: AtomicU64,
    active_connections: AtomicU64,
    total_connections: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    active_websockets: AtomicU64,
    total_websockets: AtomicU64,
    start_time: Instant,
}

impl Default for ServerStats {
    fn default() -> Self {
        Self {
            total_requests: AtomicU64::new(0),
            active_connections: AtomicU64::new(0),
            total_connections: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            active_websockets: AtomicU64::new(0),
            total_websockets: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub total_requests: u64,
    pub active_connections: u64,
    pub total_connections: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub active_websockets: u64,
    pub total_websockets: u64,
    pub uptime_seconds: u64,
}

impl ServerStats {
    pub fn record_connection_open(&self) {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_close(&self) {
        let _ = self
            .active_connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                Some(current.saturating_sub(1))
            });
    }

    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_bytes_sent(&self, count: u64) {
        self.bytes_sent.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_bytes_received(&self, count: u64) {
        self.bytes_received.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_websocket_open(&self) {
        self.total_websockets.fetch_add(1, Ordering::Relaxed);
        self.active_websockets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_websocket_close(&self) {
        let _ = self
            .active_websockets
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                Some(current.saturating_sub(1))
            });
    }

    pub fn active_connections(&self) -> u64 {
        self.active_connections.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            total_connections: self.total_connections.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            active_websockets: self.active_websockets.load(Ordering::Relaxed),
            total_websockets: self.total_websockets.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }

    pub fn stats_json(&self) -> String {
        serde_json::to_string_pretty(&self.snapshot())
            .unwrap_or_else(|_| "{}".to_string())
    }
}

fn now_unix_ms() -> u128 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(duration) => duration.as_millis(),
        Err(_) => 0,
    }
}
