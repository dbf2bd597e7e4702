//! Squall request/response primitives.
//!
//! Wire-level types shared by the framework core and the protocol
//! adapters: the streamed request [`BodyBuffer`], ordered case-insensitive
//! [`HeaderMap`] storage, the [`Request`] and [`Websocket`] objects built
//! around a common [`RequestHead`], the [`Response`] with its four body
//! variants, and the status-coded [`HttpError`].
//!
//! # Body model
//!
//! Request bodies stream in from the transport and accumulate in a
//! [`BodyBuffer`], consumed either chunk-by-chunk or in bulk (never both).
//! Response bodies go the other way: memory, stream, file, or reader
//! variants all drain through one chunk protocol, and
//! [`Response::into_sequence`] materializes any of them into the
//! memory-backed form when the full payload is needed at once.

mod body;
mod error;
mod head;
mod header;
mod request;
mod response;
mod websocket;

pub use body::{BodyBuffer, BodyChunks, BodyError, ConsumeMode};
pub use error::HttpError;
pub use head::{RequestHead, RouteTarget};
pub use header::{Header, HeaderMap};
pub use request::{BoxFuture, PushPromiseFn, Request};
pub use response::{
    BodyReader, ByteStream, DEFAULT_CHUNK_SIZE, Response, ResponseBody, TimeoutOverride,
};
pub use websocket::{WebsocketError, Websocket, WsAcceptFn, WsCloseFn, WsMessage, WsSendFn};
