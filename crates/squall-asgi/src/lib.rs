//! Squall protocol adapters.
//!
//! Bridges between a bidirectional event-stream transport and the
//! framework's single-shot request/response and full-duplex websocket
//! models. Each connection gets one adapter:
//!
//! - [`AsgiHttpConnection`] — one request in, one response out, with the
//!   receiver-loop/handler-task race and response-send timeout.
//! - [`AsgiWebsocketConnection`] — a queue-backed duplex socket with a
//!   lazy, idempotent accept handshake.
//! - [`AsgiLifespan`] — startup/shutdown hooks driven by server
//!   lifecycle events.
//!
//! The event vocabularies in [`events`] are the transport contract; any
//! server that can speak them can host the core.

pub mod events;
mod http;
mod lifespan;
mod websocket;

pub use events::{
    HttpRecvEvent, HttpScope, HttpSendEvent, LifespanRecvEvent, LifespanSendEvent, SendFn,
    TransportError, WebsocketScope, WsRecvEvent, WsSendEvent, parse_spec_version,
};
pub use http::AsgiHttpConnection;
pub use lifespan::AsgiLifespan;
pub use websocket::AsgiWebsocketConnection;
