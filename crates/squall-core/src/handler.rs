//! Handler and hook callables with an explicit blocking/non-blocking split.
//!
//! Every user-supplied callable is classified at registration: `Async`
//! variants run inline on the event loop; `Blocking` variants are
//! dispatched to the runtime's worker-thread pool and awaited, so they
//! can never stall sibling tasks. The classification is part of the
//! registration API — there is no implicit detection.
//!
//! Blocking callables run outside the task that owns the context stacks,
//! so they receive their inputs explicitly and cannot use the ambient
//! accessors in [`crate::ctx`].

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use squall_http::{BoxFuture, HttpError, Response};

use crate::error::DispatchError;
use crate::view::ViewResult;

/// View arguments captured from the matched path.
pub type ViewArgs = BTreeMap<String, String>;

fn pool_failure() -> DispatchError {
    // A panicked blocking callable surfaces as a plain 500.
    DispatchError::Http(HttpError::InternalServerError)
}

// ── View handlers ───────────────────────────────────────────────────

type AsyncViewFn =
    Arc<dyn Fn(ViewArgs) -> BoxFuture<Result<ViewResult, DispatchError>> + Send + Sync>;
type BlockingViewFn = Arc<dyn Fn(ViewArgs) -> Result<ViewResult, DispatchError> + Send + Sync>;

/// An HTTP view handler. Must produce a response value; "no response" is
/// not representable.
#[derive(Clone)]
pub enum ViewHandler {
    Async(AsyncViewFn),
    Blocking(BlockingViewFn),
}

impl ViewHandler {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(ViewArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ViewResult, DispatchError>> + Send + 'static,
    {
        ViewHandler::Async(Arc::new(move |args| Box::pin(f(args))))
    }

    pub fn blocking<F>(f: F) -> Self
    where
        F: Fn(ViewArgs) -> Result<ViewResult, DispatchError> + Send + Sync + 'static,
    {
        ViewHandler::Blocking(Arc::new(f))
    }

    pub async fn invoke(&self, args: ViewArgs) -> Result<ViewResult, DispatchError> {
        match self {
            ViewHandler::Async(f) => f(args).await,
            ViewHandler::Blocking(f) => {
                let f = f.clone();
                tokio::task::spawn_blocking(move || f(args))
                    .await
                    .map_err(|_| pool_failure())?
            }
        }
    }
}

type AsyncWsFn =
    Arc<dyn Fn(ViewArgs) -> BoxFuture<Result<Option<ViewResult>, DispatchError>> + Send + Sync>;
type BlockingWsFn =
    Arc<dyn Fn(ViewArgs) -> Result<Option<ViewResult>, DispatchError> + Send + Sync>;

/// A websocket view handler. `None` means the socket was served and
/// closed; `Some` is an HTTP-style rejection response.
#[derive(Clone)]
pub enum WsViewHandler {
    Async(AsyncWsFn),
    Blocking(BlockingWsFn),
}

impl WsViewHandler {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(ViewArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<ViewResult>, DispatchError>> + Send + 'static,
    {
        WsViewHandler::Async(Arc::new(move |args| Box::pin(f(args))))
    }

    pub fn blocking<F>(f: F) -> Self
    where
        F: Fn(ViewArgs) -> Result<Option<ViewResult>, DispatchError> + Send + Sync + 'static,
    {
        WsViewHandler::Blocking(Arc::new(f))
    }

    pub async fn invoke(&self, args: ViewArgs) -> Result<Option<ViewResult>, DispatchError> {
        match self {
            WsViewHandler::Async(f) => f(args).await,
            WsViewHandler::Blocking(f) => {
                let f = f.clone();
                tokio::task::spawn_blocking(move || f(args))
                    .await
                    .map_err(|_| pool_failure())?
            }
        }
    }
}

// ── Hooks ───────────────────────────────────────────────────────────

type AsyncBeforeFn =
    Arc<dyn Fn() -> BoxFuture<Result<Option<ViewResult>, DispatchError>> + Send + Sync>;
type BlockingBeforeFn = Arc<dyn Fn() -> Result<Option<ViewResult>, DispatchError> + Send + Sync>;

/// A before-request/websocket hook. Returning `Some` short-circuits the
/// remaining hooks and the view; the value becomes the response.
#[derive(Clone)]
pub enum BeforeHook {
    Async(AsyncBeforeFn),
    Blocking(BlockingBeforeFn),
}

impl BeforeHook {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<ViewResult>, DispatchError>> + Send + 'static,
    {
        BeforeHook::Async(Arc::new(move || Box::pin(f())))
    }

    pub fn blocking<F>(f: F) -> Self
    where
        F: Fn() -> Result<Option<ViewResult>, DispatchError> + Send + Sync + 'static,
    {
        BeforeHook::Blocking(Arc::new(f))
    }

    pub async fn invoke(&self) -> Result<Option<ViewResult>, DispatchError> {
        match self {
            BeforeHook::Async(f) => f().await,
            BeforeHook::Blocking(f) => {
                let f = f.clone();
                tokio::task::spawn_blocking(move || f())
                    .await
                    .map_err(|_| pool_failure())?
            }
        }
    }
}

type AsyncAfterFn =
    Arc<dyn Fn(Response) -> BoxFuture<Result<Response, DispatchError>> + Send + Sync>;
type BlockingAfterFn = Arc<dyn Fn(Response) -> Result<Response, DispatchError> + Send + Sync>;

/// An after-request/websocket hook: receives the response, returns the
/// (possibly replaced) response.
#[derive(Clone)]
pub enum AfterHook {
    Async(AsyncAfterFn),
    Blocking(BlockingAfterFn),
}

impl AfterHook {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(Response) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Response, DispatchError>> + Send + 'static,
    {
        AfterHook::Async(Arc::new(move |response| Box::pin(f(response))))
    }

    pub fn blocking<F>(f: F) -> Self
    where
        F: Fn(Response) -> Result<Response, DispatchError> + Send + Sync + 'static,
    {
        AfterHook::Blocking(Arc::new(f))
    }

    pub async fn invoke(&self, response: Response) -> Result<Response, DispatchError> {
        match self {
            AfterHook::Async(f) => f(response).await,
            AfterHook::Blocking(f) => {
                let f = f.clone();
                tokio::task::spawn_blocking(move || f(response))
                    .await
                    .map_err(|_| pool_failure())?
            }
        }
    }
}

type AsyncTeardownFn = Arc<dyn Fn(Option<DispatchError>) -> BoxFuture<()> + Send + Sync>;
type BlockingTeardownFn = Arc<dyn Fn(Option<DispatchError>) + Send + Sync>;

/// A teardown hook, guaranteed to run when its context exits. Receives
/// the error that ended the request, if any. Runs in reverse registration
/// order.
#[derive(Clone)]
pub enum TeardownHook {
    Async(AsyncTeardownFn),
    Blocking(BlockingTeardownFn),
}

impl TeardownHook {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(Option<DispatchError>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        TeardownHook::Async(Arc::new(move |exc| Box::pin(f(exc))))
    }

    pub fn blocking<F>(f: F) -> Self
    where
        F: Fn(Option<DispatchError>) + Send + Sync + 'static,
    {
        TeardownHook::Blocking(Arc::new(f))
    }

    pub async fn invoke(&self, exc: Option<DispatchError>) {
        match self {
            TeardownHook::Async(f) => f(exc).await,
            TeardownHook::Blocking(f) => {
                let f = f.clone();
                if tokio::task::spawn_blocking(move || f(exc)).await.is_err() {
                    tracing::error!("teardown hook panicked");
                }
            }
        }
    }
}

/// A serving-lifecycle hook (before-serving, before-first-request,
/// after-serving). Async-only: these run once, off the request path.
pub type ServingHook = Arc<dyn Fn() -> BoxFuture<Result<(), DispatchError>> + Send + Sync>;

/// Build a [`ServingHook`] from an async closure.
pub fn serving_hook<F, Fut>(f: F) -> ServingHook
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), DispatchError>> + Send + 'static,
{
    Arc::new(move || Box::pin(f()))
}

/// A URL-value preprocessor: may rewrite view args in place before the
/// before-request hooks run. Synchronous by design — it is a pure
/// argument rewrite.
pub type UrlValuePreprocessor = Arc<dyn Fn(Option<&str>, &mut ViewArgs) + Send + Sync>;

/// An error handler: converts a dispatch error into a response value, or
/// fails itself (falling through to the generic 500 path).
pub type ErrorHandler =
    Arc<dyn Fn(DispatchError) -> BoxFuture<Result<ViewResult, DispatchError>> + Send + Sync>;

/// Build an [`ErrorHandler`] from an async closure.
pub fn error_handler<F, Fut>(f: F) -> ErrorHandler
where
    F: Fn(DispatchError) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<ViewResult, DispatchError>> + Send + 'static,
{
    Arc::new(move |error| Box::pin(f(error)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn async_view_runs_inline() {
        let handler = ViewHandler::new(|args: ViewArgs| async move {
            Ok(ViewResult::Text(format!("id={}", args["id"])))
        });
        let mut args = ViewArgs::new();
        args.insert("id".into(), "7".into());
        match handler.invoke(args).await.unwrap() {
            ViewResult::Text(text) => assert_eq!(text, "id=7"),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn blocking_view_runs_on_pool() {
        let handler = ViewHandler::blocking(|_args| {
            // Would block the event loop if run inline.
            std::thread::sleep(std::time::Duration::from_millis(5));
            Ok(ViewResult::Text("done".into()))
        });
        assert!(matches!(
            handler.invoke(ViewArgs::new()).await.unwrap(),
            ViewResult::Text(_)
        ));
    }

    #[tokio::test]
    async fn blocking_view_panic_is_internal_error() {
        let handler = ViewHandler::blocking(|_args| panic!("handler bug"));
        let error = handler.invoke(ViewArgs::new()).await.unwrap_err();
        assert_eq!(error.as_http(), Some(&HttpError::InternalServerError));
    }

    #[tokio::test]
    async fn after_hook_threads_response_through() {
        let hook = AfterHook::new(|mut response: Response| async move {
            response.headers_mut().insert("X-Seen", "1");
            Ok(response)
        });
        let response = hook.invoke(Response::new("body")).await.unwrap();
        assert_eq!(response.headers().get("x-seen"), Some("1"));
    }

    #[tokio::test]
    async fn teardown_receives_the_error() {
        let saw = Arc::new(std::sync::Mutex::new(None));
        let record = saw.clone();
        let hook = TeardownHook::new(move |exc| {
            let record = record.clone();
            async move {
                *record.lock().unwrap() = exc.map(|e| e.to_string());
            }
        });
        hook.invoke(Some(DispatchError::Http(HttpError::NotFound)))
            .await;
        assert_eq!(saw.lock().unwrap().as_deref(), Some("not found"));
    }
}
