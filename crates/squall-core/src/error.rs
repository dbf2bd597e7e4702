//! Framework-level error carriers.

use std::sync::Arc;

use squall_http::HttpError;
use thiserror::Error;

/// An error travelling through the dispatch pipeline.
///
/// HTTP-domain conditions keep their status; anything else rides as a
/// boxed user error so the handler registry can match on its concrete
/// type. Cloneable (the user error is shared) so teardown hooks can
/// observe the error that ended the request while the pipeline still owns
/// it.
#[derive(Debug, Clone, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Http(#[from] HttpError),

    #[error("{0}")]
    Other(Arc<dyn std::error::Error + Send + Sync + 'static>),
}

impl DispatchError {
    /// Wrap a user error.
    pub fn other<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        DispatchError::Other(Arc::new(error))
    }

    /// The wrapped user error as its concrete type, if it is one.
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: std::error::Error + 'static,
    {
        match self {
            DispatchError::Other(inner) => inner.as_ref().downcast_ref::<E>(),
            DispatchError::Http(_) => None,
        }
    }

    pub fn as_http(&self) -> Option<&HttpError> {
        match self {
            DispatchError::Http(http) => Some(http),
            DispatchError::Other(_) => None,
        }
    }
}

/// Context-stack failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ContextError {
    /// An ambient accessor ran with no matching context on the stack.
    #[error("not within a {0} context")]
    NoContext(&'static str),

    /// A pop without a matching push, or of the wrong context. Signals a
    /// push/pop pairing bug, never a recoverable condition.
    #[error("context stack mismatch: {0}")]
    StackMismatch(&'static str),
}
