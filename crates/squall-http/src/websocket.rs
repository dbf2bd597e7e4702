//! The full-duplex websocket object.
//!
//! A [`Websocket`] receives from a queue fed by the adapter's receiver
//! loop and sends through transport callables. The accept handshake is
//! lazy: the first send or receive triggers it, and an explicit
//! [`accept`](Websocket::accept) may fire it eagerly (idempotent). Closing
//! twice is a programming error and fails loudly.

use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::{Mutex, mpsc};

use crate::error::HttpError;
use crate::head::RequestHead;
use crate::header::HeaderMap;
use crate::request::BoxFuture;

/// A message travelling over a websocket, in either direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WsMessage {
    Text(String),
    Binary(Bytes),
}

/// Errors raised by websocket operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WebsocketError {
    /// The peer disconnected; no further messages will arrive.
    #[error("websocket disconnected")]
    Disconnected,

    /// `close` was called on an already-closed socket.
    #[error("cannot close websocket multiple times")]
    AlreadyClosed,

    /// The transport rejected a send.
    #[error("websocket transport failure: {0}")]
    Transport(String),
}

/// Sends one data message over the transport.
pub type WsSendFn = Arc<dyn Fn(WsMessage) -> BoxFuture<Result<(), WebsocketError>> + Send + Sync>;
/// Performs the accept handshake; must be idempotent.
pub type WsAcceptFn =
    Arc<dyn Fn(HeaderMap, Option<String>) -> BoxFuture<Result<(), WebsocketError>> + Send + Sync>;
/// Closes the socket with a code and reason.
pub type WsCloseFn =
    Arc<dyn Fn(u16, String) -> BoxFuture<Result<(), WebsocketError>> + Send + Sync>;

/// A websocket connection handed to view handlers.
#[derive(Clone)]
pub struct Websocket {
    head: RequestHead,
    subprotocols: Vec<String>,
    receiver: Arc<Mutex<mpsc::Receiver<WsMessage>>>,
    send_fn: WsSendFn,
    accept_fn: WsAcceptFn,
    close_fn: WsCloseFn,
}

impl Websocket {
    pub fn new(
        head: RequestHead,
        subprotocols: Vec<String>,
        receiver: mpsc::Receiver<WsMessage>,
        send_fn: WsSendFn,
        accept_fn: WsAcceptFn,
        close_fn: WsCloseFn,
    ) -> Self {
        Self {
            head,
            subprotocols,
            receiver: Arc::new(Mutex::new(receiver)),
            send_fn,
            accept_fn,
            close_fn,
        }
    }

    pub fn head(&self) -> &RequestHead {
        &self.head
    }

    pub fn head_mut(&mut self) -> &mut RequestHead {
        &mut self.head
    }

    pub fn path(&self) -> &str {
        &self.head.path
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.head.headers
    }

    /// Subprotocols offered by the client.
    pub fn requested_subprotocols(&self) -> &[String] {
        &self.subprotocols
    }

    /// Accept the connection eagerly, optionally with response headers and
    /// a chosen subprotocol. Idempotent: only the first call (or first
    /// send/receive) emits the transport accept event.
    pub async fn accept(
        &self,
        headers: HeaderMap,
        subprotocol: Option<String>,
    ) -> Result<(), WebsocketError> {
        (self.accept_fn)(headers, subprotocol).await
    }

    /// Receive the next message, accepting the connection first if the
    /// handshake has not happened yet.
    ///
    /// Returns [`WebsocketError::Disconnected`] once the peer is gone and
    /// the queue has drained.
    pub async fn receive(&self) -> Result<WsMessage, WebsocketError> {
        (self.accept_fn)(HeaderMap::new(), None).await?;
        self.receiver
            .lock()
            .await
            .recv()
            .await
            .ok_or(WebsocketError::Disconnected)
    }

    /// Send a message, accepting the connection first if needed.
    ///
    /// Yields to the scheduler before each send so a tight send loop
    /// cannot starve sibling tasks.
    pub async fn send(&self, message: WsMessage) -> Result<(), WebsocketError> {
        tokio::task::yield_now().await;
        (self.accept_fn)(HeaderMap::new(), None).await?;
        (self.send_fn)(message).await
    }

    pub async fn send_text(&self, text: impl Into<String>) -> Result<(), WebsocketError> {
        self.send(WsMessage::Text(text.into())).await
    }

    pub async fn send_bytes(&self, data: impl Into<Bytes>) -> Result<(), WebsocketError> {
        self.send(WsMessage::Binary(data.into())).await
    }

    /// Serialize `value` as JSON and send it as a text message.
    pub async fn send_json(&self, value: &serde_json::Value) -> Result<(), WebsocketError> {
        self.send(WsMessage::Text(value.to_string())).await
    }

    /// Receive a message and parse it as JSON.
    pub async fn receive_json(&self) -> Result<serde_json::Value, HttpError> {
        let message = self
            .receive()
            .await
            .map_err(|_| HttpError::BadRequest)?;
        let parsed = match message {
            WsMessage::Text(text) => serde_json::from_str(&text),
            WsMessage::Binary(data) => serde_json::from_slice(&data),
        };
        parsed.map_err(|_| HttpError::BadRequest)
    }

    /// Close the connection. Closing twice fails with
    /// [`WebsocketError::AlreadyClosed`].
    pub async fn close(&self, code: u16, reason: impl Into<String>) -> Result<(), WebsocketError> {
        (self.close_fn)(code, reason.into()).await
    }
}

impl std::fmt::Debug for Websocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Websocket")
            .field("path", &self.head.path)
            .finish_non_exhaustive()
    }
}
