//! Execution contexts and their task-local stacks.
//!
//! Three context kinds (app, request, websocket) live on stacks scoped to
//! the current logical task via `tokio::task_local!`. Each connection is
//! wrapped in a [`scope`] that installs fresh, empty stacks, so
//! concurrently scheduled requests never observe each other's contexts.
//! The ambient accessors ([`current_app`], [`request_ctx`],
//! [`with_session`], ...) resolve against whichever stack currently has a
//! top entry and fail with [`ContextError::NoContext`] outside any scope.
//!
//! Pushing a request or websocket context implicitly pushes an app
//! context when the task has none; app contexts are reference-counted so
//! re-entrant pushes of the same context add no second stack entry.
//! Request and websocket contexts are not reference-counted — nesting
//! them is legal only through explicit copies (see
//! [`RequestContext::copy`]).

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use squall_http::{Request, Websocket};

use crate::app::App;
use crate::error::{ContextError, DispatchError};
use crate::handler::{AfterHook, ViewArgs};
use crate::session::Session;

#[derive(Default)]
struct Stacks {
    app: RefCell<Vec<Arc<AppContext>>>,
    request: RefCell<Vec<Arc<RequestContext>>>,
    websocket: RefCell<Vec<Arc<WebsocketContext>>>,
}

tokio::task_local! {
    static STACKS: Stacks;
}

/// Run `fut` with fresh, empty context stacks.
///
/// The adapter (or `App::handle_request`) wraps each logical connection
/// in one scope; everything inside observes only its own stacks.
pub async fn scope<F: Future>(fut: F) -> F::Output {
    STACKS.scope(Stacks::default(), fut).await
}

fn with_stacks<R>(f: impl FnOnce(&Stacks) -> Result<R, ContextError>) -> Result<R, ContextError> {
    STACKS
        .try_with(f)
        .unwrap_or_else(|_| Err(ContextError::NoContext("task")))
}

// ── App context ─────────────────────────────────────────────────────

/// The context binding an application to the current task.
///
/// Owns the per-context globals `g`. Reference-counted: nested pushes of
/// the same context increment the count instead of stacking a second
/// entry, and only the final pop runs app teardown.
pub struct AppContext {
    app: Arc<App>,
    g: Mutex<BTreeMap<String, serde_json::Value>>,
    refcount: AtomicUsize,
}

impl AppContext {
    pub fn new(app: Arc<App>) -> Arc<Self> {
        Arc::new(Self {
            app,
            g: Mutex::new(BTreeMap::new()),
            refcount: AtomicUsize::new(0),
        })
    }

    pub fn app(&self) -> &Arc<App> {
        &self.app
    }

    pub fn g_get(&self, key: &str) -> Option<serde_json::Value> {
        self.g.lock().expect("g lock").get(key).cloned()
    }

    pub fn g_set(&self, key: impl Into<String>, value: serde_json::Value) {
        self.g.lock().expect("g lock").insert(key.into(), value);
    }

    pub fn g_remove(&self, key: &str) -> Option<serde_json::Value> {
        self.g.lock().expect("g lock").remove(key)
    }

    /// Push onto the calling task's app stack. Re-entrant for the same
    /// context instance.
    pub fn push(self: &Arc<Self>) -> Result<(), ContextError> {
        with_stacks(|stacks| {
            let mut stack = stacks.app.borrow_mut();
            if let Some(top) = stack.last()
                && Arc::ptr_eq(top, self)
            {
                self.refcount.fetch_add(1, Ordering::AcqRel);
                return Ok(());
            }
            self.refcount.fetch_add(1, Ordering::AcqRel);
            stack.push(self.clone());
            Ok(())
        })
    }

    /// Pop from the calling task's app stack; the outermost pop runs the
    /// app teardown hooks.
    pub async fn pop(self: &Arc<Self>, exc: Option<DispatchError>) -> Result<(), ContextError> {
        if self.refcount.load(Ordering::Acquire) == 0 {
            return Err(ContextError::StackMismatch("app context was not pushed"));
        }
        if self.refcount.fetch_sub(1, Ordering::AcqRel) > 1 {
            return Ok(());
        }
        self.app.do_teardown_app_context(exc).await;
        with_stacks(|stacks| {
            let mut stack = stacks.app.borrow_mut();
            match stack.last() {
                Some(top) if Arc::ptr_eq(top, self) => {
                    stack.pop();
                    Ok(())
                }
                Some(_) => Err(ContextError::StackMismatch("popped wrong app context")),
                None => Err(ContextError::StackMismatch("app stack is empty")),
            }
        })
    }
}

/// Push an implicit app context when the task's app stack is empty or
/// topped by a different application. Returns the pushed context (to be
/// popped later) or `None` when the existing top sufficed.
fn ensure_app_context(app: &Arc<App>) -> Result<Option<Arc<AppContext>>, ContextError> {
    let top = with_stacks(|stacks| Ok(stacks.app.borrow().last().cloned()))?;
    if let Some(existing) = top
        && Arc::ptr_eq(existing.app(), app)
    {
        return Ok(None);
    }
    let app_ctx = AppContext::new(app.clone());
    app_ctx.push()?;
    Ok(Some(app_ctx))
}

// ── Request context ─────────────────────────────────────────────────

/// The context owning one request for its lifetime.
pub struct RequestContext {
    app: Arc<App>,
    request: Request,
    view_args: Mutex<ViewArgs>,
    session: Arc<Mutex<Option<Session>>>,
    after_request: Mutex<Vec<AfterHook>>,
    implicit_app: Mutex<Option<Arc<AppContext>>>,
}

impl std::fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestContext").finish_non_exhaustive()
    }
}

impl RequestContext {
    /// Build a context around a request whose routing outcome has already
    /// been recorded on its head.
    pub fn new(app: Arc<App>, request: Request) -> Arc<Self> {
        let view_args = request
            .head()
            .route()
            .map(|t| t.view_args.clone())
            .unwrap_or_default();
        Arc::new(Self {
            app,
            request,
            view_args: Mutex::new(view_args),
            session: Arc::new(Mutex::new(None)),
            after_request: Mutex::new(Vec::new()),
            implicit_app: Mutex::new(None),
        })
    }

    /// A copy sharing the request and session, for re-pushing in another
    /// task. The copy starts with no after-request callables of its own.
    pub fn copy(self: &Arc<Self>) -> Arc<Self> {
        Arc::new(Self {
            app: self.app.clone(),
            request: self.request.clone(),
            view_args: Mutex::new(self.view_args.lock().expect("view args lock").clone()),
            session: self.session.clone(),
            after_request: Mutex::new(Vec::new()),
            implicit_app: Mutex::new(None),
        })
    }

    pub fn app(&self) -> &Arc<App> {
        &self.app
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn view_args(&self) -> ViewArgs {
        self.view_args.lock().expect("view args lock").clone()
    }

    /// Mutate the view args in place (URL value preprocessors).
    pub fn with_view_args<R>(&self, f: impl FnOnce(&mut ViewArgs) -> R) -> R {
        f(&mut self.view_args.lock().expect("view args lock"))
    }

    /// Access the session. Panics if called before the context was pushed
    /// (the session opens at push).
    pub fn with_session<R>(&self, f: impl FnOnce(&mut Session) -> R) -> R {
        let mut slot = self.session.lock().expect("session lock");
        f(slot.as_mut().expect("session opened at context push"))
    }

    pub fn session_snapshot(&self) -> Option<Session> {
        self.session.lock().expect("session lock").clone()
    }

    /// Register a callable to run against the response of this request
    /// only.
    pub fn after_this_request(&self, hook: AfterHook) {
        self.after_request.lock().expect("after hooks lock").push(hook);
    }

    pub(crate) fn take_after_request_hooks(&self) -> Vec<AfterHook> {
        std::mem::take(&mut self.after_request.lock().expect("after hooks lock"))
    }

    /// Push: ensure an app context, install this context on the request
    /// stack, then open the session unless the copy already carries one.
    pub async fn push(self: &Arc<Self>) -> Result<(), ContextError> {
        let implicit = ensure_app_context(&self.app)?;
        *self.implicit_app.lock().expect("implicit app lock") = implicit;
        with_stacks(|stacks| {
            stacks.request.borrow_mut().push(self.clone());
            Ok(())
        })?;

        let needs_session = self.session.lock().expect("session lock").is_none();
        if needs_session {
            let opened = self
                .app
                .session_interface()
                .open_session(self.request.head())
                .await
                .unwrap_or_else(Session::null);
            *self.session.lock().expect("session lock") = Some(opened);
        }
        Ok(())
    }

    /// Pop: run request teardown hooks, remove this context from the
    /// stack (consistency-checked), then pop the implicit app context.
    pub async fn pop(self: &Arc<Self>, exc: Option<DispatchError>) -> Result<(), ContextError> {
        self.app.do_teardown_request(exc.clone(), self).await;
        with_stacks(|stacks| {
            let mut stack = stacks.request.borrow_mut();
            match stack.last() {
                Some(top) if Arc::ptr_eq(top, self) => {
                    stack.pop();
                    Ok(())
                }
                Some(_) => Err(ContextError::StackMismatch("popped wrong request context")),
                None => Err(ContextError::StackMismatch("request stack is empty")),
            }
        })?;
        let implicit = self.implicit_app.lock().expect("implicit app lock").take();
        if let Some(app_ctx) = implicit {
            app_ctx.pop(exc).await?;
        }
        Ok(())
    }
}

// ── Websocket context ───────────────────────────────────────────────

/// The context owning one websocket for its lifetime.
pub struct WebsocketContext {
    app: Arc<App>,
    websocket: Websocket,
    view_args: Mutex<ViewArgs>,
    session: Arc<Mutex<Option<Session>>>,
    after_websocket: Mutex<Vec<AfterHook>>,
    implicit_app: Mutex<Option<Arc<AppContext>>>,
}

impl WebsocketContext {
    pub fn new(app: Arc<App>, websocket: Websocket) -> Arc<Self> {
        let view_args = websocket
            .head()
            .route()
            .map(|t| t.view_args.clone())
            .unwrap_or_default();
        Arc::new(Self {
            app,
            websocket,
            view_args: Mutex::new(view_args),
            session: Arc::new(Mutex::new(None)),
            after_websocket: Mutex::new(Vec::new()),
            implicit_app: Mutex::new(None),
        })
    }

    pub fn copy(self: &Arc<Self>) -> Arc<Self> {
        Arc::new(Self {
            app: self.app.clone(),
            websocket: self.websocket.clone(),
            view_args: Mutex::new(self.view_args.lock().expect("view args lock").clone()),
            session: self.session.clone(),
            after_websocket: Mutex::new(Vec::new()),
            implicit_app: Mutex::new(None),
        })
    }

    pub fn app(&self) -> &Arc<App> {
        &self.app
    }

    pub fn websocket(&self) -> &Websocket {
        &self.websocket
    }

    pub fn view_args(&self) -> ViewArgs {
        self.view_args.lock().expect("view args lock").clone()
    }

    pub fn with_view_args<R>(&self, f: impl FnOnce(&mut ViewArgs) -> R) -> R {
        f(&mut self.view_args.lock().expect("view args lock"))
    }

    pub fn with_session<R>(&self, f: impl FnOnce(&mut Session) -> R) -> R {
        let mut slot = self.session.lock().expect("session lock");
        f(slot.as_mut().expect("session opened at context push"))
    }

    pub fn session_snapshot(&self) -> Option<Session> {
        self.session.lock().expect("session lock").clone()
    }

    pub fn after_this_websocket(&self, hook: AfterHook) {
        self.after_websocket
            .lock()
            .expect("after hooks lock")
            .push(hook);
    }

    pub(crate) fn take_after_websocket_hooks(&self) -> Vec<AfterHook> {
        std::mem::take(&mut self.after_websocket.lock().expect("after hooks lock"))
    }

    pub async fn push(self: &Arc<Self>) -> Result<(), ContextError> {
        let implicit = ensure_app_context(&self.app)?;
        *self.implicit_app.lock().expect("implicit app lock") = implicit;
        with_stacks(|stacks| {
            stacks.websocket.borrow_mut().push(self.clone());
            Ok(())
        })?;

        let needs_session = self.session.lock().expect("session lock").is_none();
        if needs_session {
            let opened = self
                .app
                .session_interface()
                .open_session(self.websocket.head())
                .await
                .unwrap_or_else(Session::null);
            *self.session.lock().expect("session lock") = Some(opened);
        }
        Ok(())
    }

    pub async fn pop(self: &Arc<Self>, exc: Option<DispatchError>) -> Result<(), ContextError> {
        self.app.do_teardown_websocket(exc.clone(), self).await;
        with_stacks(|stacks| {
            let mut stack = stacks.websocket.borrow_mut();
            match stack.last() {
                Some(top) if Arc::ptr_eq(top, self) => {
                    stack.pop();
                    Ok(())
                }
                Some(_) => Err(ContextError::StackMismatch(
                    "popped wrong websocket context",
                )),
                None => Err(ContextError::StackMismatch("websocket stack is empty")),
            }
        })?;
        let implicit = self.implicit_app.lock().expect("implicit app lock").take();
        if let Some(app_ctx) = implicit {
            app_ctx.pop(exc).await?;
        }
        Ok(())
    }
}

// ── Ambient accessors ───────────────────────────────────────────────

/// The current task's app context.
pub fn app_ctx() -> Result<Arc<AppContext>, ContextError> {
    with_stacks(|stacks| {
        stacks
            .app
            .borrow()
            .last()
            .cloned()
            .ok_or(ContextError::NoContext("app"))
    })
}

/// The application bound to the current task.
pub fn current_app() -> Result<Arc<App>, ContextError> {
    Ok(app_ctx()?.app().clone())
}

/// The current task's request context.
pub fn request_ctx() -> Result<Arc<RequestContext>, ContextError> {
    with_stacks(|stacks| {
        stacks
            .request
            .borrow()
            .last()
            .cloned()
            .ok_or(ContextError::NoContext("request"))
    })
}

/// The current task's websocket context.
pub fn websocket_ctx() -> Result<Arc<WebsocketContext>, ContextError> {
    with_stacks(|stacks| {
        stacks
            .websocket
            .borrow()
            .last()
            .cloned()
            .ok_or(ContextError::NoContext("websocket"))
    })
}

pub fn has_app_context() -> bool {
    app_ctx().is_ok()
}

pub fn has_request_context() -> bool {
    request_ctx().is_ok()
}

pub fn has_websocket_context() -> bool {
    websocket_ctx().is_ok()
}

/// Access the ambient session: the request stack is consulted first,
/// then the websocket stack.
pub fn with_session<R>(f: impl FnOnce(&mut Session) -> R) -> Result<R, ContextError> {
    if let Ok(ctx) = request_ctx() {
        return Ok(ctx.with_session(f));
    }
    if let Ok(ctx) = websocket_ctx() {
        return Ok(ctx.with_session(f));
    }
    Err(ContextError::NoContext("request or websocket"))
}

/// Read a per-context global.
pub fn g_get(key: &str) -> Result<Option<serde_json::Value>, ContextError> {
    Ok(app_ctx()?.g_get(key))
}

/// Write a per-context global.
pub fn g_set(key: impl Into<String>, value: serde_json::Value) -> Result<(), ContextError> {
    app_ctx()?.g_set(key, value);
    Ok(())
}

/// Register a callable against the current request's response.
pub fn after_this_request(hook: AfterHook) -> Result<(), ContextError> {
    request_ctx()?.after_this_request(hook);
    Ok(())
}

/// Register a callable against the current websocket's finalization.
pub fn after_this_websocket(hook: AfterHook) -> Result<(), ContextError> {
    websocket_ctx()?.after_this_websocket(hook);
    Ok(())
}
