//! Squall application core.
//!
//! The framework's lifecycle engine: task-local execution contexts
//! ([`ctx`]), the application object and its dispatch pipeline ([`App`]),
//! blueprints, the error handler registry, response coercion, and the
//! collaborator interfaces for routing and sessions.
//!
//! # Dispatch model
//!
//! The protocol adapters construct a [`squall_http::Request`] or
//! [`squall_http::Websocket`] and call [`App::handle_request`] /
//! [`App::handle_websocket`]. The pipeline pushes a context onto the
//! calling task's stacks, runs preprocessing, routes to a view handler,
//! recovers registered errors, finalizes the response, and tears the
//! context down — in that order, every time, including on failure.

mod app;
mod blueprint;
mod config;
pub mod ctx;
mod error;
mod error_handlers;
mod handler;
mod routing;
mod session;
mod view;

pub use app::App;
pub use blueprint::Blueprint;
pub use config::{AppConfig, ConfigError, DEFAULT_MAX_CONTENT_LENGTH};
pub use ctx::{AppContext, RequestContext, WebsocketContext};
pub use error::{ContextError, DispatchError};
pub use error_handlers::{ErrorHandlerRegistry, ErrorTag};
pub use handler::{
    AfterHook, BeforeHook, ErrorHandler, ServingHook, TeardownHook, UrlValuePreprocessor,
    ViewArgs, ViewHandler, WsViewHandler, error_handler, serving_hook,
};
pub use routing::{MapRouter, RouteRule, Router};
pub use session::{CookieSessionStub, Session, SessionInterface};
pub use view::{ViewResult, make_response};
