//! Transport event-stream contracts.
//!
//! The adapters speak three typed event vocabularies with the server —
//! HTTP request/response, websocket bidirectional, and lifespan
//! startup/shutdown. Inbound events arrive on an `mpsc` receiver; the
//! outbound direction is a type-erased async send callable, so any
//! event-stream server can drive the adapters.

use std::collections::HashSet;
use std::sync::Arc;

use bytes::Bytes;
use squall_http::{BoxFuture, WsMessage};
use thiserror::Error;

/// Failure to hand an event to the transport.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,
}

/// The outbound half of a connection: an async callable accepting one
/// event at a time.
pub type SendFn<E> = Arc<dyn Fn(E) -> BoxFuture<Result<(), TransportError>> + Send + Sync>;

/// Connection metadata for one HTTP request.
#[derive(Debug, Clone, Default)]
pub struct HttpScope {
    pub method: String,
    pub scheme: String,
    pub path: String,
    pub query_string: Bytes,
    /// Raw header byte pairs as received from the wire.
    pub headers: Vec<(Vec<u8>, Vec<u8>)>,
    pub root_path: String,
    pub http_version: String,
    /// Client address, when the transport knows it.
    pub client: Option<String>,
    /// Optional protocol extensions advertised by the server
    /// (e.g. `"http.response.push"`).
    pub extensions: HashSet<String>,
}

/// Connection metadata for one websocket.
#[derive(Debug, Clone, Default)]
pub struct WebsocketScope {
    pub scheme: String,
    pub path: String,
    pub query_string: Bytes,
    pub headers: Vec<(Vec<u8>, Vec<u8>)>,
    pub root_path: String,
    pub http_version: String,
    pub client: Option<String>,
    pub subprotocols: Vec<String>,
    /// Negotiated event-protocol version, e.g. `"2.3"`. Gates accept
    /// headers (> 2.0) and close reasons (>= 2.3).
    pub spec_version: String,
    pub extensions: HashSet<String>,
}

/// Inbound HTTP events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HttpRecvEvent {
    /// A request body chunk; `more` is false on the final chunk.
    Body { data: Bytes, more: bool },
    /// The client went away.
    Disconnect,
}

/// Outbound HTTP events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HttpSendEvent {
    ResponseStart {
        status: u16,
        headers: Vec<(Vec<u8>, Vec<u8>)>,
    },
    ResponseBody {
        data: Bytes,
        more: bool,
    },
    PushPromise {
        path: String,
        headers: Vec<(Vec<u8>, Vec<u8>)>,
    },
}

/// Inbound websocket events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WsRecvEvent {
    /// Handshake opened; informational.
    Connect,
    Receive(WsMessage),
    Disconnect { code: u16 },
}

/// Outbound websocket events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WsSendEvent {
    Accept {
        subprotocol: Option<String>,
        headers: Vec<(Vec<u8>, Vec<u8>)>,
    },
    Message(WsMessage),
    Close {
        code: u16,
        reason: Option<String>,
    },
    /// HTTP-style rejection start, via the `websocket.http.response`
    /// extension.
    ResponseStart {
        status: u16,
        headers: Vec<(Vec<u8>, Vec<u8>)>,
    },
    ResponseBody {
        data: Bytes,
        more: bool,
    },
}

/// Inbound lifespan events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifespanRecvEvent {
    Startup,
    Shutdown,
}

/// Outbound lifespan events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifespanSendEvent {
    StartupComplete,
    StartupFailed { message: String },
    ShutdownComplete,
    ShutdownFailed { message: String },
}

/// Parse a dotted protocol version into comparable components:
/// `"2.3"` → `[2, 3]`. Unparseable components become 0.
pub fn parse_spec_version(raw: &str) -> Vec<u32> {
    raw.split('.')
        .map(|part| part.parse().unwrap_or(0))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_versions_compare_lexicographically() {
        assert!(parse_spec_version("2.3") >= parse_spec_version("2.3"));
        assert!(parse_spec_version("2.10") > parse_spec_version("2.3"));
        assert!(parse_spec_version("2.0") < parse_spec_version("2.1"));
        assert!(parse_spec_version("3.0") > parse_spec_version("2.9"));
    }

    #[test]
    fn malformed_versions_degrade_to_zero() {
        assert_eq!(parse_spec_version("2.x"), vec![2, 0]);
        assert_eq!(parse_spec_version(""), vec![0]);
    }
}
