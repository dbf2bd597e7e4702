//! View return values and response coercion.
//!
//! Handlers return a [`ViewResult`]; [`make_response`] turns any of its
//! forms into a canonical [`Response`]. The tuple forms of looser
//! frameworks (body+status, body+headers, body+status+headers) are typed
//! variants here, so the status/headers positions cannot be confused and
//! an absent response is simply not constructible for HTTP views.

use bytes::Bytes;
use squall_http::{HttpError, Response};

/// What a view handler may produce.
pub enum ViewResult {
    /// A finished response, passed through untouched.
    Response(Response),
    /// Plain text, wrapped with the default mimetype.
    Text(String),
    /// Raw bytes, wrapped with the default mimetype.
    Bytes(Bytes),
    /// A mapping, auto-serialized into a JSON response.
    Json(serde_json::Value),
    /// An HTTP error, rendered via its default response.
    Error(HttpError),
    /// Any of the above with a replacement status code.
    WithStatus(Box<ViewResult>, u16),
    /// Any of the above with extra headers.
    WithHeaders(Box<ViewResult>, Vec<(String, String)>),
    /// Body, status, and headers at once.
    WithStatusHeaders(Box<ViewResult>, u16, Vec<(String, String)>),
}

impl ViewResult {
    /// Sugar for the `(body, status)` form.
    pub fn with_status(self, status: u16) -> Self {
        ViewResult::WithStatus(Box::new(self), status)
    }

    /// Sugar for the `(body, headers)` form.
    pub fn with_headers(self, headers: Vec<(String, String)>) -> Self {
        ViewResult::WithHeaders(Box::new(self), headers)
    }
}

impl From<Response> for ViewResult {
    fn from(response: Response) -> Self {
        ViewResult::Response(response)
    }
}

impl From<&str> for ViewResult {
    fn from(text: &str) -> Self {
        ViewResult::Text(text.to_string())
    }
}

impl From<String> for ViewResult {
    fn from(text: String) -> Self {
        ViewResult::Text(text)
    }
}

impl From<serde_json::Value> for ViewResult {
    fn from(value: serde_json::Value) -> Self {
        ViewResult::Json(value)
    }
}

impl From<HttpError> for ViewResult {
    fn from(error: HttpError) -> Self {
        ViewResult::Error(error)
    }
}

/// Coerce a view's return value into a canonical response.
pub fn make_response(result: ViewResult) -> Response {
    match result {
        ViewResult::Response(response) => response,
        ViewResult::Text(text) => Response::new(text),
        ViewResult::Bytes(bytes) => Response::new(bytes),
        ViewResult::Json(value) => Response::json(&value),
        ViewResult::Error(error) => error.default_response(),
        ViewResult::WithStatus(inner, status) => {
            let mut response = make_response(*inner);
            response.set_status(status);
            response
        }
        ViewResult::WithHeaders(inner, headers) => {
            let mut response = make_response(*inner);
            for (name, value) in headers {
                response.headers_mut().insert(name, value);
            }
            response
        }
        ViewResult::WithStatusHeaders(inner, status, headers) => {
            let mut response = make_response(*inner);
            response.set_status(status);
            for (name, value) in headers {
                response.headers_mut().insert(name, value);
            }
            response
        }
    }
}

impl std::fmt::Debug for ViewResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViewResult::Response(r) => f.debug_tuple("Response").field(&r.status()).finish(),
            ViewResult::Text(t) => f.debug_tuple("Text").field(t).finish(),
            ViewResult::Bytes(b) => f.debug_tuple("Bytes").field(&b.len()).finish(),
            ViewResult::Json(v) => f.debug_tuple("Json").field(v).finish(),
            ViewResult::Error(e) => f.debug_tuple("Error").field(e).finish(),
            ViewResult::WithStatus(inner, status) => {
                f.debug_tuple("WithStatus").field(inner).field(status).finish()
            }
            ViewResult::WithHeaders(inner, headers) => {
                f.debug_tuple("WithHeaders").field(inner).field(headers).finish()
            }
            ViewResult::WithStatusHeaders(inner, status, headers) => f
                .debug_tuple("WithStatusHeaders")
                .field(inner)
                .field(status)
                .field(headers)
                .finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn text_gets_default_mimetype() {
        let mut response = make_response("hello".into());
        assert_eq!(response.status(), 200);
        assert_eq!(
            response.headers().get("content-type"),
            Some("text/html; charset=utf-8")
        );
        assert_eq!(response.into_sequence().await.unwrap().as_ref(), b"hello");
    }

    #[tokio::test]
    async fn json_value_serializes() {
        let mut response = make_response(serde_json::json!({"a": 1}).into());
        assert_eq!(
            response.headers().get("content-type"),
            Some("application/json")
        );
        let body = response.into_sequence().await.unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed, serde_json::json!({"a": 1}));
    }

    #[test]
    fn status_tuple_form() {
        let response = make_response(ViewResult::from("missing").with_status(404));
        assert_eq!(response.status(), 404);
    }

    #[test]
    fn headers_tuple_form_keeps_default_status() {
        let response = make_response(
            ViewResult::from("ok").with_headers(vec![("X-Custom".into(), "1".into())]),
        );
        assert_eq!(response.status(), 200);
        assert_eq!(response.headers().get("x-custom"), Some("1"));
    }

    #[test]
    fn three_tuple_form() {
        let response = make_response(ViewResult::WithStatusHeaders(
            Box::new("created".into()),
            201,
            vec![("Location".into(), "/things/1".into())],
        ));
        assert_eq!(response.status(), 201);
        assert_eq!(response.headers().get("location"), Some("/things/1"));
    }

    #[test]
    fn error_renders_default_response() {
        let response = make_response(HttpError::NotFound.into());
        assert_eq!(response.status(), 404);
    }

    #[test]
    fn response_passes_through() {
        let mut original = Response::with_status("teapot", 418);
        original.headers_mut().insert("X-Kept", "yes");
        let response = make_response(original.into());
        assert_eq!(response.status(), 418);
        assert_eq!(response.headers().get("x-kept"), Some("yes"));
    }
}
