//! Fields shared by requests and websockets.
//!
//! Both objects carry the same handshake data (method, scheme, path,
//! query, headers, root path, protocol version) and the same deferred
//! routing outcome, so they share a [`RequestHead`].

use std::collections::BTreeMap;

use bytes::Bytes;

use crate::error::HttpError;
use crate::header::HeaderMap;

/// The routing destination recorded on a matched request or websocket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteTarget {
    /// Endpoint name, `"blueprint.view"` when blueprint-scoped.
    pub endpoint: String,
    /// View arguments extracted from the path.
    pub view_args: BTreeMap<String, String>,
    /// Whether the matched rule opted into automatic OPTIONS handling.
    pub provide_automatic_options: bool,
}

/// Handshake data common to [`Request`](crate::Request) and
/// [`Websocket`](crate::Websocket).
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: String,
    pub scheme: String,
    pub path: String,
    pub query_string: Bytes,
    pub headers: HeaderMap,
    pub root_path: String,
    pub http_version: String,
    /// Routing outcome, recorded at context push and consulted during
    /// dispatch. `None` until routing runs; a stored error is deferred
    /// and raised by the dispatch pipeline, not at match time.
    pub routing: Option<Result<RouteTarget, HttpError>>,
}

impl RequestHead {
    pub fn new(
        method: impl Into<String>,
        scheme: impl Into<String>,
        path: impl Into<String>,
        query_string: impl Into<Bytes>,
        headers: HeaderMap,
    ) -> Self {
        Self {
            method: method.into(),
            scheme: scheme.into(),
            path: path.into(),
            query_string: query_string.into(),
            headers,
            root_path: String::new(),
            http_version: "1.1".to_string(),
            routing: None,
        }
    }

    /// The matched rule, if routing succeeded.
    pub fn route(&self) -> Option<&RouteTarget> {
        match &self.routing {
            Some(Ok(target)) => Some(target),
            _ => None,
        }
    }

    /// The endpoint name of the matched rule.
    pub fn endpoint(&self) -> Option<&str> {
        self.route().map(|t| t.endpoint.as_str())
    }

    /// The blueprint owning the matched endpoint: the portion before the
    /// last `.`, or `None` for an unscoped endpoint.
    pub fn blueprint(&self) -> Option<&str> {
        self.endpoint()?.rsplit_once('.').map(|(scope, _)| scope)
    }

    /// Blueprint chain for the matched endpoint, most specific first:
    /// `"a.b.view"` yields `["a.b", "a"]`.
    pub fn blueprints(&self) -> Vec<&str> {
        let mut names = Vec::new();
        let mut scope = self.blueprint();
        while let Some(name) = scope {
            names.push(name);
            scope = name.rsplit_once('.').map(|(outer, _)| outer);
        }
        names
    }
}
