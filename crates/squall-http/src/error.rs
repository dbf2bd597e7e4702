//! Status-coded HTTP errors.
//!
//! [`HttpError`] is the framework's HTTP-domain error: every variant maps
//! to a response status code and can render itself as a default response.
//! Routing failures, body limits, and handler-raised conditions all travel
//! through this type.

use thiserror::Error;

/// An HTTP-domain error with a definite status code.
///
/// Cloneable so a single instance can be stored (e.g. as a body buffer's
/// terminal error or a deferred routing failure) and surfaced on every
/// subsequent read.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HttpError {
    #[error("bad request")]
    BadRequest,

    #[error("unauthorized")]
    Unauthorized,

    #[error("forbidden")]
    Forbidden,

    #[error("not found")]
    NotFound,

    #[error("method not allowed")]
    MethodNotAllowed {
        /// Methods the matched rule does accept.
        allowed: Vec<String>,
    },

    #[error("request timeout")]
    RequestTimeout,

    #[error("payload too large")]
    PayloadTooLarge,

    /// The router requires a redirect (e.g. trailing-slash canonicalization).
    #[error("redirect required to {location}")]
    RedirectRequired { location: String },

    #[error("internal server error")]
    InternalServerError,

    /// Any other status, for handlers that abort with an explicit code.
    #[error("http error {status}: {message}")]
    Status { status: u16, message: String },
}

impl HttpError {
    /// Construct from a bare status code.
    pub fn from_status(status: u16) -> Self {
        match status {
            400 => HttpError::BadRequest,
            401 => HttpError::Unauthorized,
            403 => HttpError::Forbidden,
            404 => HttpError::NotFound,
            408 => HttpError::RequestTimeout,
            413 => HttpError::PayloadTooLarge,
            500 => HttpError::InternalServerError,
            status => HttpError::Status {
                status,
                message: String::new(),
            },
        }
    }

    /// The response status code for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            HttpError::BadRequest => 400,
            HttpError::Unauthorized => 401,
            HttpError::Forbidden => 403,
            HttpError::NotFound => 404,
            HttpError::MethodNotAllowed { .. } => 405,
            HttpError::RequestTimeout => 408,
            HttpError::PayloadTooLarge => 413,
            HttpError::RedirectRequired { .. } => 308,
            HttpError::InternalServerError => 500,
            HttpError::Status { status, .. } => *status,
        }
    }

    /// The reason phrase used in the default response body.
    pub fn reason(&self) -> &str {
        match self {
            HttpError::BadRequest => "Bad Request",
            HttpError::Unauthorized => "Unauthorized",
            HttpError::Forbidden => "Forbidden",
            HttpError::NotFound => "Not Found",
            HttpError::MethodNotAllowed { .. } => "Method Not Allowed",
            HttpError::RequestTimeout => "Request Timeout",
            HttpError::PayloadTooLarge => "Payload Too Large",
            HttpError::RedirectRequired { .. } => "Permanent Redirect",
            HttpError::InternalServerError => "Internal Server Error",
            HttpError::Status { message, .. } => {
                if message.is_empty() {
                    "Error"
                } else {
                    message
                }
            }
        }
    }

    /// Routing outcomes are deferred at match time and raised during
    /// dispatch; only these variants can be produced by a router.
    pub fn is_routing(&self) -> bool {
        matches!(
            self,
            HttpError::NotFound
                | HttpError::BadRequest
                | HttpError::MethodNotAllowed { .. }
                | HttpError::RedirectRequired { .. }
        )
    }

    /// Render the default response for this error: plain-text reason with
    /// the matching status, plus `Allow`/`Location` headers where the
    /// variant calls for them.
    pub fn default_response(&self) -> crate::Response {
        let mut response = crate::Response::with_status(self.reason().to_string(), self.status_code());
        match self {
            HttpError::MethodNotAllowed { allowed } => {
                response.headers_mut().set("Allow", allowed.join(", "));
            }
            HttpError::RedirectRequired { location } => {
                response.headers_mut().set("Location", location.clone());
            }
            _ => {}
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_match_variants() {
        assert_eq!(HttpError::NotFound.status_code(), 404);
        assert_eq!(HttpError::PayloadTooLarge.status_code(), 413);
        assert_eq!(
            HttpError::MethodNotAllowed { allowed: vec![] }.status_code(),
            405
        );
        assert_eq!(
            HttpError::Status {
                status: 418,
                message: "teapot".into()
            }
            .status_code(),
            418
        );
    }

    #[test]
    fn from_status_roundtrip() {
        assert_eq!(HttpError::from_status(404), HttpError::NotFound);
        assert_eq!(HttpError::from_status(400), HttpError::BadRequest);
        assert_eq!(HttpError::from_status(418).status_code(), 418);
    }

    #[test]
    fn routing_classification() {
        assert!(HttpError::NotFound.is_routing());
        assert!(
            HttpError::RedirectRequired {
                location: "/x/".into()
            }
            .is_routing()
        );
        assert!(!HttpError::PayloadTooLarge.is_routing());
        assert!(!HttpError::InternalServerError.is_routing());
    }

    #[test]
    fn method_not_allowed_sets_allow_header() {
        let err = HttpError::MethodNotAllowed {
            allowed: vec!["GET".into(), "HEAD".into()],
        };
        let response = err.default_response();
        assert_eq!(response.status(), 405);
        assert_eq!(response.headers().get("allow"), Some("GET, HEAD"));
    }

    #[test]
    fn redirect_sets_location_header() {
        let err = HttpError::RedirectRequired {
            location: "/canonical/".into(),
        };
        let response = err.default_response();
        assert_eq!(response.status(), 308);
        assert_eq!(response.headers().get("location"), Some("/canonical/"));
    }
}
