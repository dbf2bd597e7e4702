//! The error handler registry.
//!
//! Handlers are registered per scope (a blueprint name, or the app-global
//! scope) as an ordered list of `(tag, handler)` pairs. Lookup walks the
//! request's blueprint scopes most-specific-first, then the app scope,
//! taking the first tag that matches in registration order — so a more
//! specific handler registered earlier beats a broader one registered
//! later, within the same scope.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::DispatchError;
use crate::handler::ErrorHandler;

type MatchFn = Arc<dyn Fn(&DispatchError) -> bool + Send + Sync>;

/// What a registered handler claims to handle.
#[derive(Clone)]
pub enum ErrorTag {
    /// HTTP-domain errors with this status code.
    Status(u16),
    /// Errors satisfying an arbitrary predicate. This is the "is-a" form:
    /// a predicate may accept a whole family of error types.
    Matches(MatchFn),
}

impl ErrorTag {
    /// Tag matching exactly the concrete user error type `E`.
    pub fn of<E>() -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        ErrorTag::Matches(Arc::new(|error| error.downcast_ref::<E>().is_some()))
    }

    /// Tag matching errors accepted by `predicate`.
    pub fn matching<F>(predicate: F) -> Self
    where
        F: Fn(&DispatchError) -> bool + Send + Sync + 'static,
    {
        ErrorTag::Matches(Arc::new(predicate))
    }

    pub fn matches(&self, error: &DispatchError) -> bool {
        match self {
            ErrorTag::Status(status) => error
                .as_http()
                .is_some_and(|http| http.status_code() == *status),
            ErrorTag::Matches(predicate) => predicate(error),
        }
    }
}

impl std::fmt::Debug for ErrorTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorTag::Status(status) => f.debug_tuple("Status").field(status).finish(),
            ErrorTag::Matches(_) => f.write_str("Matches(..)"),
        }
    }
}

/// Scoped, ordered error handler storage.
#[derive(Default)]
pub struct ErrorHandlerRegistry {
    scoped: HashMap<Option<String>, Vec<(ErrorTag, ErrorHandler)>>,
}

impl ErrorHandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler. `scope` is a blueprint name, or `None` for the
    /// app-global scope.
    pub fn register(&mut self, scope: Option<String>, tag: ErrorTag, handler: ErrorHandler) {
        self.scoped.entry(scope).or_default().push((tag, handler));
    }

    /// Find the handler for `error`, consulting `scopes` in order.
    ///
    /// Callers pass the blueprint chain most-specific-first followed by
    /// `None`; within a scope, the first registered matching tag wins.
    pub fn find(&self, scopes: &[Option<String>], error: &DispatchError) -> Option<ErrorHandler> {
        for scope in scopes {
            let Some(entries) = self.scoped.get(scope) else {
                continue;
            };
            for (tag, handler) in entries {
                if tag.matches(error) {
                    return Some(handler.clone());
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::error_handler;
    use crate::view::ViewResult;
    use squall_http::HttpError;
    use thiserror::Error;

    #[derive(Debug, Error)]
    #[error("validation failed")]
    struct ValidationError;

    #[derive(Debug, Error)]
    #[error("missing field {0}")]
    struct MissingField(&'static str);

    fn tagged(name: &'static str) -> ErrorHandler {
        error_handler(move |_| async move { Ok(ViewResult::Text(name.to_string())) })
    }

    async fn run(handler: ErrorHandler) -> String {
        match handler(DispatchError::Http(HttpError::NotFound)).await.unwrap() {
            ViewResult::Text(text) => text,
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn status_tag_matches_http_errors() {
        let mut registry = ErrorHandlerRegistry::new();
        registry.register(None, ErrorTag::Status(404), tagged("missing"));

        let found = registry
            .find(&[None], &DispatchError::Http(HttpError::NotFound))
            .expect("handler registered for 404");
        assert_eq!(run(found).await, "missing");

        assert!(
            registry
                .find(&[None], &DispatchError::Http(HttpError::BadRequest))
                .is_none()
        );
    }

    #[tokio::test]
    async fn type_tag_matches_concrete_user_error() {
        let mut registry = ErrorHandlerRegistry::new();
        registry.register(None, ErrorTag::of::<ValidationError>(), tagged("validation"));

        assert!(
            registry
                .find(&[None], &DispatchError::other(ValidationError))
                .is_some()
        );
        assert!(
            registry
                .find(&[None], &DispatchError::other(MissingField("name")))
                .is_none()
        );
    }

    #[tokio::test]
    async fn predicate_tag_matches_error_family() {
        // An "is-a" predicate covering both error types.
        let family = ErrorTag::matching(|error| {
            error.downcast_ref::<ValidationError>().is_some()
                || error.downcast_ref::<MissingField>().is_some()
        });
        let mut registry = ErrorHandlerRegistry::new();
        registry.register(None, family, tagged("family"));

        assert!(
            registry
                .find(&[None], &DispatchError::other(MissingField("age")))
                .is_some()
        );
    }

    #[tokio::test]
    async fn registration_order_breaks_ties() {
        // Specific handler registered first wins over the broad one.
        let mut registry = ErrorHandlerRegistry::new();
        registry.register(None, ErrorTag::of::<MissingField>(), tagged("specific"));
        registry.register(
            None,
            ErrorTag::matching(|e| e.downcast_ref::<MissingField>().is_some()),
            tagged("broad"),
        );

        let found = registry
            .find(&[None], &DispatchError::other(MissingField("x")))
            .unwrap();
        assert_eq!(run(found).await, "specific");
    }

    #[tokio::test]
    async fn blueprint_scope_beats_app_scope() {
        let mut registry = ErrorHandlerRegistry::new();
        registry.register(None, ErrorTag::Status(404), tagged("app"));
        registry.register(
            Some("admin".to_string()),
            ErrorTag::Status(404),
            tagged("blueprint"),
        );

        let scopes = vec![Some("admin".to_string()), None];
        let found = registry
            .find(&scopes, &DispatchError::Http(HttpError::NotFound))
            .unwrap();
        assert_eq!(run(found).await, "blueprint");
    }
}
