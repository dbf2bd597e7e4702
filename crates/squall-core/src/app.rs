//! The application object and its dispatch pipeline.
//!
//! [`App`] owns the view registries, the hook tables, the error handler
//! registry, and the collaborators (router, session interface). The
//! dispatch pipeline sequences one request as:
//!
//! ```text
//! context push → first-request check → preprocess → route dispatch
//!   → (error → user exception handling) → finalize → context pop
//! ```
//!
//! Hook ordering within a request is strict: URL value preprocessors,
//! before hooks (app scope then blueprint scopes), the view, after hooks
//! (context-local, then blueprint scopes, then app scope), session save,
//! and finally teardown hooks in reverse registration order. The
//! websocket pipeline mirrors this with one difference: a handler may
//! legitimately produce no response.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex as StdMutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use squall_http::{HttpError, Request, RequestHead, Response, Websocket};
use tokio::sync::Mutex as AsyncMutex;

use crate::config::AppConfig;
use crate::ctx::{self, AppContext, RequestContext, WebsocketContext};
use crate::error::DispatchError;
use crate::error_handlers::{ErrorHandlerRegistry, ErrorTag};
use crate::handler::{
    AfterHook, BeforeHook, ErrorHandler, ServingHook, TeardownHook, UrlValuePreprocessor,
    ViewHandler, WsViewHandler,
};
use crate::routing::{MapRouter, RouteRule, Router};
use crate::session::{CookieSessionStub, SessionInterface};
use crate::view::{ViewResult, make_response};

type Scope = Option<String>;

/// An asynchronous web application.
///
/// Registration happens on a mutable `App`; dispatch happens through an
/// `Arc<App>` shared by every connection.
pub struct App {
    name: String,
    config: AppConfig,
    router: Box<dyn Router>,
    session_interface: Box<dyn SessionInterface>,

    view_functions: HashMap<String, ViewHandler>,
    websocket_functions: HashMap<String, WsViewHandler>,

    url_value_preprocessors: HashMap<Scope, Vec<UrlValuePreprocessor>>,
    before_request_hooks: HashMap<Scope, Vec<BeforeHook>>,
    after_request_hooks: HashMap<Scope, Vec<AfterHook>>,
    before_websocket_hooks: HashMap<Scope, Vec<BeforeHook>>,
    after_websocket_hooks: HashMap<Scope, Vec<AfterHook>>,

    // Teardown tables sit behind a lock: they are reversed once, lazily,
    // inside the guarded first-request section, so teardown runs LIFO
    // relative to registration.
    teardown_request_hooks: StdMutex<HashMap<Scope, Vec<TeardownHook>>>,
    teardown_websocket_hooks: StdMutex<HashMap<Scope, Vec<TeardownHook>>>,
    teardown_app_hooks: StdMutex<Vec<TeardownHook>>,

    before_serving_hooks: Vec<ServingHook>,
    after_serving_hooks: Vec<ServingHook>,
    before_first_request_hooks: Vec<ServingHook>,

    error_handlers: ErrorHandlerRegistry,

    got_first_request: AtomicBool,
    first_request_lock: AsyncMutex<()>,
}

impl App {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            config: AppConfig::default(),
            router: Box::new(MapRouter::new()),
            session_interface: Box::new(CookieSessionStub),
            view_functions: HashMap::new(),
            websocket_functions: HashMap::new(),
            url_value_preprocessors: HashMap::new(),
            before_request_hooks: HashMap::new(),
            after_request_hooks: HashMap::new(),
            before_websocket_hooks: HashMap::new(),
            after_websocket_hooks: HashMap::new(),
            teardown_request_hooks: StdMutex::new(HashMap::new()),
            teardown_websocket_hooks: StdMutex::new(HashMap::new()),
            teardown_app_hooks: StdMutex::new(Vec::new()),
            before_serving_hooks: Vec::new(),
            after_serving_hooks: Vec::new(),
            before_first_request_hooks: Vec::new(),
            error_handlers: ErrorHandlerRegistry::new(),
            got_first_request: AtomicBool::new(false),
            first_request_lock: AsyncMutex::new(()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn set_config(&mut self, config: AppConfig) {
        self.config = config;
    }

    pub fn set_router(&mut self, router: Box<dyn Router>) {
        self.router = router;
    }

    pub fn set_session_interface(&mut self, interface: Box<dyn SessionInterface>) {
        self.session_interface = interface;
    }

    pub fn session_interface(&self) -> &dyn SessionInterface {
        self.session_interface.as_ref()
    }

    pub fn got_first_request(&self) -> bool {
        self.got_first_request.load(Ordering::Acquire)
    }

    // ── Registration ────────────────────────────────────────────────

    /// Register an HTTP route.
    pub fn route(
        &mut self,
        rule: impl Into<String>,
        methods: &[&str],
        endpoint: impl Into<String>,
        handler: ViewHandler,
    ) {
        let endpoint = endpoint.into();
        self.router
            .add_rule(RouteRule::http(rule, endpoint.clone(), methods));
        self.view_functions.insert(endpoint, handler);
    }

    /// Register a websocket route.
    pub fn websocket(
        &mut self,
        rule: impl Into<String>,
        endpoint: impl Into<String>,
        handler: WsViewHandler,
    ) {
        let endpoint = endpoint.into();
        self.router
            .add_rule(RouteRule::websocket(rule, endpoint.clone()));
        self.websocket_functions.insert(endpoint, handler);
    }

    pub fn url_value_preprocessor(&mut self, preprocessor: UrlValuePreprocessor) {
        self.url_value_preprocessor_scoped(None, preprocessor);
    }

    pub(crate) fn url_value_preprocessor_scoped(
        &mut self,
        scope: Scope,
        preprocessor: UrlValuePreprocessor,
    ) {
        self.url_value_preprocessors
            .entry(scope)
            .or_default()
            .push(preprocessor);
    }

    pub fn before_request(&mut self, hook: BeforeHook) {
        self.before_request_scoped(None, hook);
    }

    pub(crate) fn before_request_scoped(&mut self, scope: Scope, hook: BeforeHook) {
        self.before_request_hooks.entry(scope).or_default().push(hook);
    }

    pub fn after_request(&mut self, hook: AfterHook) {
        self.after_request_scoped(None, hook);
    }

    pub(crate) fn after_request_scoped(&mut self, scope: Scope, hook: AfterHook) {
        self.after_request_hooks.entry(scope).or_default().push(hook);
    }

    pub fn before_websocket(&mut self, hook: BeforeHook) {
        self.before_websocket_scoped(None, hook);
    }

    pub(crate) fn before_websocket_scoped(&mut self, scope: Scope, hook: BeforeHook) {
        self.before_websocket_hooks.entry(scope).or_default().push(hook);
    }

    pub fn after_websocket(&mut self, hook: AfterHook) {
        self.after_websocket_scoped(None, hook);
    }

    pub(crate) fn after_websocket_scoped(&mut self, scope: Scope, hook: AfterHook) {
        self.after_websocket_hooks.entry(scope).or_default().push(hook);
    }

    pub fn teardown_request(&mut self, hook: TeardownHook) {
        self.teardown_request_scoped(None, hook);
    }

    pub(crate) fn teardown_request_scoped(&mut self, scope: Scope, hook: TeardownHook) {
        self.teardown_request_hooks
            .lock()
            .expect("teardown lock")
            .entry(scope)
            .or_default()
            .push(hook);
    }

    pub fn teardown_websocket(&mut self, hook: TeardownHook) {
        self.teardown_websocket_scoped(None, hook);
    }

    pub(crate) fn teardown_websocket_scoped(&mut self, scope: Scope, hook: TeardownHook) {
        self.teardown_websocket_hooks
            .lock()
            .expect("teardown lock")
            .entry(scope)
            .or_default()
            .push(hook);
    }

    pub fn teardown_app_context(&mut self, hook: TeardownHook) {
        self.teardown_app_hooks
            .lock()
            .expect("teardown lock")
            .push(hook);
    }

    pub fn errorhandler(&mut self, tag: ErrorTag, handler: ErrorHandler) {
        self.errorhandler_scoped(None, tag, handler);
    }

    pub(crate) fn errorhandler_scoped(&mut self, scope: Scope, tag: ErrorTag, handler: ErrorHandler) {
        self.error_handlers.register(scope, tag, handler);
    }

    pub fn before_serving(&mut self, hook: ServingHook) {
        self.before_serving_hooks.push(hook);
    }

    pub fn after_serving(&mut self, hook: ServingHook) {
        self.after_serving_hooks.push(hook);
    }

    pub fn before_first_request(&mut self, hook: ServingHook) {
        self.before_first_request_hooks.push(hook);
    }

    // ── Serving lifecycle ───────────────────────────────────────────

    /// Run the before-serving hooks. Driven by the lifespan adapter.
    pub async fn startup(&self) -> Result<(), DispatchError> {
        for hook in &self.before_serving_hooks {
            hook().await?;
        }
        Ok(())
    }

    /// Run the after-serving hooks. Driven by the lifespan adapter.
    pub async fn shutdown(&self) -> Result<(), DispatchError> {
        for hook in &self.after_serving_hooks {
            hook().await?;
        }
        Ok(())
    }

    /// Spawn a task carrying its own app context. Errors are logged, not
    /// propagated — a background failure must not poison any request.
    pub fn add_background_task<F>(self: &Arc<Self>, fut: F) -> tokio::task::JoinHandle<()>
    where
        F: Future<Output = Result<(), DispatchError>> + Send + 'static,
    {
        let app = self.clone();
        tokio::spawn(ctx::scope(async move {
            let app_ctx = AppContext::new(app.clone());
            if let Err(error) = app_ctx.push() {
                tracing::error!(error = %error, "background task context push failed");
                return;
            }
            let result = fut.await;
            if let Err(error) = app_ctx.pop(result.as_ref().err().cloned()).await {
                tracing::error!(error = %error, "background task context pop failed");
            }
            if let Err(error) = result {
                app.handle_background_exception(error);
            }
        }))
    }

    fn handle_background_exception(&self, error: DispatchError) {
        tracing::error!(app = %self.name, error = %error, "background task errored");
    }

    // ── Request pipeline ────────────────────────────────────────────

    /// Handle one request end to end: route, push a context, dispatch,
    /// and tear down. The entry point called by the HTTP adapter.
    pub async fn handle_request(
        self: &Arc<Self>,
        mut request: Request,
    ) -> Result<Response, DispatchError> {
        let outcome =
            self.router
                .match_route(&request.head().method, &request.head().path, false);
        request.head_mut().routing = Some(outcome);

        let app = self.clone();
        ctx::scope(async move {
            let request_ctx = RequestContext::new(app.clone(), request);
            request_ctx.push().await.map_err(DispatchError::other)?;

            let result = match app.full_dispatch_request(&request_ctx).await {
                Err(error) => app.handle_exception(error, &request_ctx).await,
                ok => ok,
            };

            let exc = result.as_ref().err().cloned();
            if let Err(pop_error) = request_ctx.pop(exc).await {
                tracing::error!(error = %pop_error, "request context pop failed");
            }
            result
        })
        .await
    }

    /// Pre- and post-processing around request dispatch.
    pub async fn full_dispatch_request(
        self: &Arc<Self>,
        request_ctx: &Arc<RequestContext>,
    ) -> Result<Response, DispatchError> {
        self.try_trigger_before_first_request().await?;
        {
            let head = request_ctx.request().head();
            tracing::debug!(method = %head.method, path = %head.path, "request started");
        }

        let result = match self.preprocess_request(request_ctx).await {
            Ok(Some(early)) => Ok(early),
            Ok(None) => self.dispatch_request(request_ctx).await,
            Err(error) => Err(error),
        };
        let value = match result {
            Ok(value) => value,
            Err(error) => {
                self.handle_user_exception(error, request_ctx.request().head())
                    .await?
            }
        };
        self.finalize_request(value, request_ctx, false).await
    }

    /// URL value preprocessors, then before-request hooks. The first hook
    /// returning a value short-circuits everything after it.
    pub async fn preprocess_request(
        &self,
        request_ctx: &Arc<RequestContext>,
    ) -> Result<Option<ViewResult>, DispatchError> {
        let (endpoint, scopes) = {
            let head = request_ctx.request().head();
            (
                head.endpoint().map(str::to_string),
                Self::preprocess_scopes(head),
            )
        };

        for scope in &scopes {
            if let Some(preprocessors) = self.url_value_preprocessors.get(scope) {
                for preprocessor in preprocessors {
                    request_ctx.with_view_args(|args| preprocessor(endpoint.as_deref(), args));
                }
            }
        }

        for scope in &scopes {
            if let Some(hooks) = self.before_request_hooks.get(scope) {
                for hook in hooks {
                    if let Some(result) = hook.invoke().await? {
                        return Ok(Some(result));
                    }
                }
            }
        }
        Ok(None)
    }

    /// Raise any deferred routing error, synthesize automatic OPTIONS, or
    /// invoke the view.
    pub async fn dispatch_request(
        &self,
        request_ctx: &Arc<RequestContext>,
    ) -> Result<ViewResult, DispatchError> {
        let target = {
            let head = request_ctx.request().head();
            match &head.routing {
                Some(Err(error)) => return Err(error.clone().into()),
                Some(Ok(target)) => target.clone(),
                None => {
                    tracing::error!("request reached dispatch without a routing outcome");
                    return Err(HttpError::InternalServerError.into());
                }
            }
        };

        let head = request_ctx.request().head();
        if head.method == "OPTIONS" && target.provide_automatic_options {
            let allow = self.router.allowed_methods(&head.path).join(", ");
            let mut response = Response::new("");
            response.headers_mut().set("Allow", allow);
            return Ok(ViewResult::Response(response));
        }

        let handler = self
            .view_functions
            .get(&target.endpoint)
            .cloned()
            .ok_or_else(|| {
                tracing::error!(endpoint = %target.endpoint, "no view registered for endpoint");
                DispatchError::from(HttpError::InternalServerError)
            })?;
        handler.invoke(request_ctx.view_args()).await
    }

    /// Coerce the view result, run the after-request chain, save the
    /// session. With `from_error_handler` set, a failure here is logged
    /// and swallowed — never recursed.
    pub async fn finalize_request(
        &self,
        result: ViewResult,
        request_ctx: &Arc<RequestContext>,
        from_error_handler: bool,
    ) -> Result<Response, DispatchError> {
        let response = make_response(result);
        match self.process_response(response, request_ctx).await {
            Ok(response) => {
                tracing::debug!(status = response.status(), "request finished");
                Ok(response)
            }
            Err(error) if from_error_handler => {
                tracing::error!(error = %error, "request finalization errored");
                Ok(HttpError::InternalServerError.default_response())
            }
            Err(error) => Err(error),
        }
    }

    /// The after-request chain: context-local callables first, then
    /// blueprint scopes, then the app scope — each scope's list in
    /// reverse registration order — then the session save.
    pub async fn process_response(
        &self,
        mut response: Response,
        request_ctx: &Arc<RequestContext>,
    ) -> Result<Response, DispatchError> {
        for hook in request_ctx.take_after_request_hooks() {
            response = hook.invoke(response).await?;
        }

        let scopes = Self::postprocess_scopes(request_ctx.request().head());
        for scope in &scopes {
            if let Some(hooks) = self.after_request_hooks.get(scope) {
                for hook in hooks.iter().rev() {
                    response = hook.invoke(response).await?;
                }
            }
        }

        if let Some(session) = request_ctx.session_snapshot()
            && !self.session_interface.is_null_session(&session)
        {
            self.session_interface
                .save_session(&session, Some(&mut response))
                .await;
        }
        Ok(response)
    }

    // ── Websocket pipeline ──────────────────────────────────────────

    /// Handle one websocket end to end. `Ok(None)` means the socket was
    /// served; `Ok(Some(response))` is an HTTP-style rejection for the
    /// adapter to deliver.
    pub async fn handle_websocket(
        self: &Arc<Self>,
        mut websocket: Websocket,
    ) -> Result<Option<Response>, DispatchError> {
        let outcome =
            self.router
                .match_route(&websocket.head().method, &websocket.head().path, true);
        websocket.head_mut().routing = Some(outcome);

        let app = self.clone();
        ctx::scope(async move {
            let websocket_ctx = WebsocketContext::new(app.clone(), websocket);
            websocket_ctx.push().await.map_err(DispatchError::other)?;

            let result = match app.full_dispatch_websocket(&websocket_ctx).await {
                Err(error) => app.handle_websocket_exception(error, &websocket_ctx).await,
                ok => ok,
            };

            let exc = result.as_ref().err().cloned();
            if let Err(pop_error) = websocket_ctx.pop(exc).await {
                tracing::error!(error = %pop_error, "websocket context pop failed");
            }
            result
        })
        .await
    }

    pub async fn full_dispatch_websocket(
        self: &Arc<Self>,
        websocket_ctx: &Arc<WebsocketContext>,
    ) -> Result<Option<Response>, DispatchError> {
        self.try_trigger_before_first_request().await?;
        tracing::debug!(path = %websocket_ctx.websocket().head().path, "websocket started");

        let result = match self.preprocess_websocket(websocket_ctx).await {
            Ok(Some(early)) => Ok(Some(early)),
            Ok(None) => self.dispatch_websocket(websocket_ctx).await,
            Err(error) => Err(error),
        };
        let value = match result {
            Ok(value) => value,
            Err(error) => Some(
                self.handle_user_exception(error, websocket_ctx.websocket().head())
                    .await?,
            ),
        };
        self.finalize_websocket(value, websocket_ctx, false).await
    }

    pub async fn preprocess_websocket(
        &self,
        websocket_ctx: &Arc<WebsocketContext>,
    ) -> Result<Option<ViewResult>, DispatchError> {
        let (endpoint, scopes) = {
            let head = websocket_ctx.websocket().head();
            (
                head.endpoint().map(str::to_string),
                Self::preprocess_scopes(head),
            )
        };

        for scope in &scopes {
            if let Some(preprocessors) = self.url_value_preprocessors.get(scope) {
                for preprocessor in preprocessors {
                    websocket_ctx.with_view_args(|args| preprocessor(endpoint.as_deref(), args));
                }
            }
        }

        for scope in &scopes {
            if let Some(hooks) = self.before_websocket_hooks.get(scope) {
                for hook in hooks {
                    if let Some(result) = hook.invoke().await? {
                        return Ok(Some(result));
                    }
                }
            }
        }
        Ok(None)
    }

    pub async fn dispatch_websocket(
        &self,
        websocket_ctx: &Arc<WebsocketContext>,
    ) -> Result<Option<ViewResult>, DispatchError> {
        let target = {
            let head = websocket_ctx.websocket().head();
            match &head.routing {
                Some(Err(error)) => return Err(error.clone().into()),
                Some(Ok(target)) => target.clone(),
                None => {
                    tracing::error!("websocket reached dispatch without a routing outcome");
                    return Err(HttpError::InternalServerError.into());
                }
            }
        };

        let handler = self
            .websocket_functions
            .get(&target.endpoint)
            .cloned()
            .ok_or_else(|| {
                tracing::error!(endpoint = %target.endpoint, "no websocket view registered");
                DispatchError::from(HttpError::InternalServerError)
            })?;
        handler.invoke(websocket_ctx.view_args()).await
    }

    pub async fn finalize_websocket(
        &self,
        result: Option<ViewResult>,
        websocket_ctx: &Arc<WebsocketContext>,
        from_error_handler: bool,
    ) -> Result<Option<Response>, DispatchError> {
        let response = result.map(make_response);
        match self.postprocess_websocket(response, websocket_ctx).await {
            Ok(response) => {
                tracing::debug!("websocket finished");
                Ok(response)
            }
            Err(error) if from_error_handler => {
                tracing::error!(error = %error, "websocket finalization errored");
                Ok(Some(HttpError::InternalServerError.default_response()))
            }
            Err(error) => Err(error),
        }
    }

    /// Websocket variant of the after chain. A `None` response skips the
    /// hooks; a modified session with no response to carry it is dropped
    /// with a warning (cookies cannot be retrofitted onto a closed
    /// socket).
    pub async fn postprocess_websocket(
        &self,
        mut response: Option<Response>,
        websocket_ctx: &Arc<WebsocketContext>,
    ) -> Result<Option<Response>, DispatchError> {
        if response.is_some() {
            for hook in websocket_ctx.take_after_websocket_hooks() {
                if let Some(current) = response.take() {
                    response = Some(hook.invoke(current).await?);
                }
            }
            let scopes = Self::postprocess_scopes(websocket_ctx.websocket().head());
            for scope in &scopes {
                if let Some(hooks) = self.after_websocket_hooks.get(scope) {
                    for hook in hooks.iter().rev() {
                        if let Some(current) = response.take() {
                            response = Some(hook.invoke(current).await?);
                        }
                    }
                }
            }
        }

        if let Some(session) = websocket_ctx.session_snapshot()
            && !self.session_interface.is_null_session(&session)
        {
            match response.as_mut() {
                Some(current) => {
                    self.session_interface
                        .save_session(&session, Some(current))
                        .await;
                }
                None if self.session_interface.needs_response_to_save() => {
                    if session.is_modified() {
                        tracing::warn!(
                            "websocket session was modified but there is no response to \
                             persist it to; changes dropped"
                        );
                    }
                }
                None => {
                    self.session_interface.save_session(&session, None).await;
                }
            }
        }
        Ok(response)
    }

    // ── Exception handling ──────────────────────────────────────────

    /// First-tier recovery: HTTP-domain errors go through the status
    /// handler lookup (unless trapped); other errors through the type
    /// lookup, or re-raise unchanged for [`handle_exception`].
    pub async fn handle_user_exception(
        &self,
        error: DispatchError,
        head: &RequestHead,
    ) -> Result<ViewResult, DispatchError> {
        if let DispatchError::Http(http) = &error
            && !self.config.trap_http_errors
        {
            return self.handle_http_exception(http.clone(), head).await;
        }

        let scopes = Self::postprocess_scopes(head);
        match self.error_handlers.find(&scopes, &error) {
            Some(handler) => handler(error).await,
            None => Err(error),
        }
    }

    /// Status-handler lookup with fallback to the default rendering.
    /// Routing redirects skip the lookup: they are canonicalization, not
    /// failures worth customizing.
    async fn handle_http_exception(
        &self,
        error: HttpError,
        head: &RequestHead,
    ) -> Result<ViewResult, DispatchError> {
        if matches!(error, HttpError::RedirectRequired { .. }) {
            return Ok(ViewResult::Error(error));
        }
        let scopes = Self::postprocess_scopes(head);
        let wrapped = DispatchError::Http(error.clone());
        match self.error_handlers.find(&scopes, &wrapped) {
            Some(handler) => handler(wrapped).await,
            None => Ok(ViewResult::Error(error)),
        }
    }

    /// Last-tier recovery: log, then either propagate (when configured
    /// to) or synthesize a 500 through a registered 500 handler.
    pub async fn handle_exception(
        &self,
        error: DispatchError,
        request_ctx: &Arc<RequestContext>,
    ) -> Result<Response, DispatchError> {
        let head = request_ctx.request().head();
        tracing::error!(
            method = %head.method,
            path = %head.path,
            error = %error,
            "exception on request"
        );

        if self.config.propagate_exceptions {
            return Err(error);
        }

        let result = self.internal_error_result(head).await;
        self.finalize_request(result, request_ctx, true).await
    }

    pub async fn handle_websocket_exception(
        &self,
        error: DispatchError,
        websocket_ctx: &Arc<WebsocketContext>,
    ) -> Result<Option<Response>, DispatchError> {
        let head = websocket_ctx.websocket().head();
        tracing::error!(path = %head.path, error = %error, "exception on websocket");

        if self.config.propagate_exceptions {
            return Err(error);
        }

        let result = self.internal_error_result(head).await;
        self.finalize_websocket(Some(result), websocket_ctx, true)
            .await
    }

    async fn internal_error_result(&self, head: &RequestHead) -> ViewResult {
        let scopes = Self::postprocess_scopes(head);
        let internal = DispatchError::Http(HttpError::InternalServerError);
        match self.error_handlers.find(&scopes, &internal) {
            Some(handler) => match handler(internal).await {
                Ok(result) => result,
                Err(handler_error) => {
                    tracing::error!(error = %handler_error, "500 handler itself errored");
                    ViewResult::Error(HttpError::InternalServerError)
                }
            },
            None => ViewResult::Error(HttpError::InternalServerError),
        }
    }

    // ── Shared plumbing ─────────────────────────────────────────────

    /// Fire the before-first-request hooks exactly once, and reverse the
    /// teardown tables so they run LIFO. Double-checked around the lock
    /// so concurrent first requests trigger a single run.
    async fn try_trigger_before_first_request(&self) -> Result<(), DispatchError> {
        if self.got_first_request.load(Ordering::Acquire) {
            return Ok(());
        }
        let _guard = self.first_request_lock.lock().await;
        if self.got_first_request.load(Ordering::Acquire) {
            return Ok(());
        }

        {
            let mut requests = self.teardown_request_hooks.lock().expect("teardown lock");
            for hooks in requests.values_mut() {
                hooks.reverse();
            }
            let mut websockets = self.teardown_websocket_hooks.lock().expect("teardown lock");
            for hooks in websockets.values_mut() {
                hooks.reverse();
            }
            self.teardown_app_hooks
                .lock()
                .expect("teardown lock")
                .reverse();
        }

        for hook in &self.before_first_request_hooks {
            hook().await?;
        }
        self.got_first_request.store(true, Ordering::Release);
        Ok(())
    }

    pub(crate) async fn do_teardown_request(
        &self,
        exc: Option<DispatchError>,
        request_ctx: &RequestContext,
    ) {
        let scopes = Self::postprocess_scopes(request_ctx.request().head());
        let hooks: Vec<TeardownHook> = {
            let map = self.teardown_request_hooks.lock().expect("teardown lock");
            scopes
                .iter()
                .flat_map(|scope| map.get(scope).cloned().unwrap_or_default())
                .collect()
        };
        for hook in hooks {
            hook.invoke(exc.clone()).await;
        }
    }

    pub(crate) async fn do_teardown_websocket(
        &self,
        exc: Option<DispatchError>,
        websocket_ctx: &WebsocketContext,
    ) {
        let scopes = Self::postprocess_scopes(websocket_ctx.websocket().head());
        let hooks: Vec<TeardownHook> = {
            let map = self.teardown_websocket_hooks.lock().expect("teardown lock");
            scopes
                .iter()
                .flat_map(|scope| map.get(scope).cloned().unwrap_or_default())
                .collect()
        };
        for hook in hooks {
            hook.invoke(exc.clone()).await;
        }
    }

    pub(crate) async fn do_teardown_app_context(&self, exc: Option<DispatchError>) {
        let hooks: Vec<TeardownHook> = self
            .teardown_app_hooks
            .lock()
            .expect("teardown lock")
            .clone();
        for hook in hooks {
            hook.invoke(exc.clone()).await;
        }
    }

    /// Scope order for preprocessing: app scope first, then blueprint
    /// scopes outermost-first.
    fn preprocess_scopes(head: &RequestHead) -> Vec<Scope> {
        let mut scopes: Vec<Scope> = vec![None];
        scopes.extend(
            head.blueprints()
                .iter()
                .rev()
                .map(|name| Some(name.to_string())),
        );
        scopes
    }

    /// Scope order for postprocessing, teardown, and error lookup:
    /// blueprint scopes most-specific-first, then the app scope.
    fn postprocess_scopes(head: &RequestHead) -> Vec<Scope> {
        let mut scopes: Vec<Scope> = head
            .blueprints()
            .iter()
            .map(|name| Some(name.to_string()))
            .collect();
        scopes.push(None);
        scopes
    }
}

impl std::fmt::Debug for App {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("App")
            .field("name", &self.name)
            .field("views", &self.view_functions.len())
            .field("websocket_views", &self.websocket_functions.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blueprint::Blueprint;
    use crate::handler::error_handler;
    use bytes::Bytes;
    use squall_http::{BodyBuffer, HeaderMap};
    use std::sync::Mutex;
    use thiserror::Error;

    fn request(method: &str, path: &str) -> Request {
        Request::new(
            RequestHead::new(method, "http", path, Bytes::new(), HeaderMap::new()),
            BodyBuffer::unlimited(),
        )
    }

    fn request_with_body(method: &str, path: &str, body: &[u8]) -> Request {
        let buffer = BodyBuffer::unlimited();
        buffer.set_result(body);
        Request::new(
            RequestHead::new(method, "http", path, Bytes::new(), HeaderMap::new()),
            buffer,
        )
    }

    fn text_view(text: &'static str) -> ViewHandler {
        ViewHandler::new(move |_args| async move { Ok(ViewResult::Text(text.to_string())) })
    }

    type Log = Arc<Mutex<Vec<&'static str>>>;

    #[tokio::test]
    async fn dispatches_to_the_matched_view() {
        let mut app = App::new("test");
        app.route("/hello", &["GET"], "hello", text_view("hi"));
        let app = Arc::new(app);

        let mut response = app.handle_request(request("GET", "/hello")).await.unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(response.into_sequence().await.unwrap().as_ref(), b"hi");
    }

    #[tokio::test]
    async fn view_args_reach_the_handler() {
        let mut app = App::new("test");
        app.route(
            "/users/<id>",
            &["GET"],
            "user",
            ViewHandler::new(|args: crate::handler::ViewArgs| async move {
                Ok(ViewResult::Text(format!("user {}", args["id"])))
            }),
        );
        let app = Arc::new(app);

        let mut response = app.handle_request(request("GET", "/users/9")).await.unwrap();
        assert_eq!(response.into_sequence().await.unwrap().as_ref(), b"user 9");
    }

    #[tokio::test]
    async fn unrouted_request_renders_404() {
        let mut app = App::new("test");
        app.route("/", &["GET"], "index", text_view("home"));
        let app = Arc::new(app);

        let response = app.handle_request(request("GET", "/absent")).await.unwrap();
        assert_eq!(response.status(), 404);
    }

    #[tokio::test]
    async fn before_hooks_run_even_for_unroutable_requests() {
        // The routing error is deferred until dispatch, so global
        // preprocessing always executes.
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let mut app = App::new("test");
        let record = log.clone();
        app.before_request(BeforeHook::new(move || {
            let record = record.clone();
            async move {
                record.lock().unwrap().push("before");
                Ok(None)
            }
        }));
        let app = Arc::new(app);

        let response = app.handle_request(request("GET", "/nowhere")).await.unwrap();
        assert_eq!(response.status(), 404);
        assert_eq!(*log.lock().unwrap(), vec!["before"]);
    }

    #[tokio::test]
    async fn before_hook_short_circuits_later_hooks_and_view() {
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let mut app = App::new("test");

        let record = log.clone();
        app.before_request(BeforeHook::new(move || {
            let record = record.clone();
            async move {
                record.lock().unwrap().push("h1");
                Ok(None)
            }
        }));
        let record = log.clone();
        app.before_request(BeforeHook::new(move || {
            let record = record.clone();
            async move {
                record.lock().unwrap().push("h2");
                Ok(Some(ViewResult::Text("early".to_string())))
            }
        }));
        let record = log.clone();
        app.before_request(BeforeHook::new(move || {
            let record = record.clone();
            async move {
                record.lock().unwrap().push("h3");
                Ok(None)
            }
        }));

        let record = log.clone();
        app.route(
            "/",
            &["GET"],
            "index",
            ViewHandler::new(move |_args| {
                let record = record.clone();
                async move {
                    record.lock().unwrap().push("view");
                    Ok(ViewResult::Text("never".to_string()))
                }
            }),
        );
        let app = Arc::new(app);

        let mut response = app.handle_request(request("GET", "/")).await.unwrap();
        assert_eq!(response.into_sequence().await.unwrap().as_ref(), b"early");
        assert_eq!(*log.lock().unwrap(), vec!["h1", "h2"]);
    }

    #[tokio::test]
    async fn custom_404_handler_replaces_default() {
        let mut app = App::new("test");
        app.errorhandler(
            ErrorTag::Status(404),
            error_handler(|_error| async move {
                Ok(ViewResult::Text("missing".to_string()).with_status(404))
            }),
        );
        let app = Arc::new(app);

        let mut response = app.handle_request(request("GET", "/ghost")).await.unwrap();
        assert_eq!(response.status(), 404);
        assert_eq!(response.into_sequence().await.unwrap().as_ref(), b"missing");
    }

    #[derive(Debug, Error)]
    #[error("downstream unavailable")]
    struct DownstreamError;

    #[tokio::test]
    async fn user_error_routes_through_type_handler() {
        let mut app = App::new("test");
        app.route(
            "/flaky",
            &["GET"],
            "flaky",
            ViewHandler::new(|_args| async move {
                Err::<ViewResult, _>(DispatchError::other(DownstreamError))
            }),
        );
        app.errorhandler(
            ErrorTag::of::<DownstreamError>(),
            error_handler(|_error| async move {
                Ok(ViewResult::Text("fallback".to_string()).with_status(503))
            }),
        );
        let app = Arc::new(app);

        let mut response = app.handle_request(request("GET", "/flaky")).await.unwrap();
        assert_eq!(response.status(), 503);
        assert_eq!(response.into_sequence().await.unwrap().as_ref(), b"fallback");
    }

    #[tokio::test]
    async fn unhandled_user_error_becomes_500() {
        let mut app = App::new("test");
        app.route(
            "/boom",
            &["GET"],
            "boom",
            ViewHandler::new(|_args| async move {
                Err::<ViewResult, _>(DispatchError::other(DownstreamError))
            }),
        );
        let app = Arc::new(app);

        let response = app.handle_request(request("GET", "/boom")).await.unwrap();
        assert_eq!(response.status(), 500);
    }

    #[tokio::test]
    async fn propagate_exceptions_reraises_instead_of_500() {
        let mut app = App::new("test");
        let mut config = AppConfig::default();
        config.propagate_exceptions = true;
        app.set_config(config);
        app.route(
            "/boom",
            &["GET"],
            "boom",
            ViewHandler::new(|_args| async move {
                Err::<ViewResult, _>(DispatchError::other(DownstreamError))
            }),
        );
        let app = Arc::new(app);

        let error = app.handle_request(request("GET", "/boom")).await.unwrap_err();
        assert!(error.downcast_ref::<DownstreamError>().is_some());
    }

    #[tokio::test]
    async fn after_request_hooks_from_app_and_blueprint_both_apply() {
        let mut app = App::new("test");
        app.after_request(AfterHook::new(|mut response: Response| async move {
            response.headers_mut().insert("X-A", "1");
            Ok(response)
        }));

        let mut blueprint = Blueprint::new("bp");
        blueprint.route("/page", &["GET"], "page", text_view("page"));
        blueprint.after_request(AfterHook::new(|mut response: Response| async move {
            response.headers_mut().insert("X-B", "1");
            Ok(response)
        }));
        app.register_blueprint(blueprint);
        let app = Arc::new(app);

        let response = app.handle_request(request("GET", "/page")).await.unwrap();
        assert_eq!(response.headers().get("x-a"), Some("1"));
        assert_eq!(response.headers().get("x-b"), Some("1"));
    }

    #[tokio::test]
    async fn blueprint_error_handler_beats_app_handler() {
        let mut app = App::new("test");
        app.errorhandler(
            ErrorTag::Status(404),
            error_handler(|_| async move {
                Ok(ViewResult::Text("app".to_string()).with_status(404))
            }),
        );

        let mut blueprint = Blueprint::new("bp");
        blueprint.route(
            "/missing",
            &["GET"],
            "missing",
            ViewHandler::new(|_args| async move {
                Err::<ViewResult, _>(HttpError::NotFound.into())
            }),
        );
        blueprint.errorhandler(
            ErrorTag::Status(404),
            error_handler(|_| async move {
                Ok(ViewResult::Text("blueprint".to_string()).with_status(404))
            }),
        );
        app.register_blueprint(blueprint);
        let app = Arc::new(app);

        let mut response = app.handle_request(request("GET", "/missing")).await.unwrap();
        assert_eq!(
            response.into_sequence().await.unwrap().as_ref(),
            b"blueprint"
        );
    }

    #[tokio::test]
    async fn automatic_options_lists_allowed_methods() {
        let mut app = App::new("test");
        app.route("/thing", &["GET", "POST"], "thing", text_view("x"));
        let app = Arc::new(app);

        let response = app
            .handle_request(request("OPTIONS", "/thing"))
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(
            response.headers().get("allow"),
            Some("GET, OPTIONS, POST")
        );
    }

    #[tokio::test]
    async fn json_echo_roundtrip() {
        let mut app = App::new("test");
        app.route(
            "/echo",
            &["POST"],
            "echo",
            ViewHandler::new(|_args| async move {
                let value = ctx::request_ctx()
                    .map_err(DispatchError::other)?
                    .request()
                    .get_json(false)
                    .await?;
                Ok(ViewResult::Json(value))
            }),
        );
        let app = Arc::new(app);

        let mut response = app
            .handle_request(request_with_body("POST", "/echo", br#"{"a":1}"#))
            .await
            .unwrap();
        assert_eq!(
            response.headers().get("content-type"),
            Some("application/json")
        );
        let body = response.into_sequence().await.unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed, serde_json::json!({"a": 1}));
    }

    #[tokio::test]
    async fn teardown_hooks_run_in_reverse_registration_order() {
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let mut app = App::new("test");
        app.route("/", &["GET"], "index", text_view("ok"));

        let record = log.clone();
        app.teardown_request(TeardownHook::new(move |_exc| {
            let record = record.clone();
            async move {
                record.lock().unwrap().push("first");
            }
        }));
        let record = log.clone();
        app.teardown_request(TeardownHook::new(move |_exc| {
            let record = record.clone();
            async move {
                record.lock().unwrap().push("second");
            }
        }));
        let app = Arc::new(app);

        app.handle_request(request("GET", "/")).await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["second", "first"]);
    }

    #[tokio::test]
    async fn teardown_sees_the_request_error() {
        let saw: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
        let mut app = App::new("test");
        let mut config = AppConfig::default();
        config.propagate_exceptions = true;
        app.set_config(config);
        app.route(
            "/fail",
            &["GET"],
            "fail",
            ViewHandler::new(|_args| async move {
                Err::<ViewResult, _>(DispatchError::other(DownstreamError))
            }),
        );
        let record = saw.clone();
        app.teardown_request(TeardownHook::new(move |exc| {
            let record = record.clone();
            async move {
                *record.lock().unwrap() = exc.map(|e| e.to_string());
            }
        }));
        let app = Arc::new(app);

        let _ = app.handle_request(request("GET", "/fail")).await;
        assert_eq!(
            saw.lock().unwrap().as_deref(),
            Some("downstream unavailable")
        );
    }

    #[tokio::test]
    async fn first_request_hooks_fire_exactly_once() {
        let count = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let mut app = App::new("test");
        app.route("/", &["GET"], "index", text_view("ok"));
        let counter = count.clone();
        app.before_first_request(crate::handler::serving_hook(move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }));
        let app = Arc::new(app);

        let mut handles = Vec::new();
        for _ in 0..16 {
            let app = app.clone();
            handles.push(tokio::spawn(async move {
                app.handle_request(request("GET", "/")).await.unwrap()
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(app.got_first_request());
    }

    #[tokio::test]
    async fn modified_session_persists_into_the_response() {
        let mut app = App::new("test");
        app.route(
            "/login",
            &["GET"],
            "login",
            ViewHandler::new(|_args| async move {
                ctx::with_session(|session| {
                    session.insert("user", serde_json::json!("ana"));
                })
                .map_err(DispatchError::other)?;
                Ok(ViewResult::Text("ok".to_string()))
            }),
        );
        let app = Arc::new(app);

        let response = app.handle_request(request("GET", "/login")).await.unwrap();
        assert_eq!(
            response.headers().get("set-cookie"),
            Some("session-entries=1")
        );
    }

    #[tokio::test]
    async fn after_this_request_applies_to_one_request_only() {
        let mut app = App::new("test");
        app.route(
            "/once",
            &["GET"],
            "once",
            ViewHandler::new(|_args| async move {
                ctx::after_this_request(AfterHook::new(|mut response: Response| async move {
                    response.headers_mut().insert("X-Once", "1");
                    Ok(response)
                }))
                .map_err(DispatchError::other)?;
                Ok(ViewResult::Text("ok".to_string()))
            }),
        );
        app.route("/plain", &["GET"], "plain", text_view("ok"));
        let app = Arc::new(app);

        let response = app.handle_request(request("GET", "/once")).await.unwrap();
        assert_eq!(response.headers().get("x-once"), Some("1"));

        let response = app.handle_request(request("GET", "/plain")).await.unwrap();
        assert_eq!(response.headers().get("x-once"), None);
    }

    #[tokio::test]
    async fn url_value_preprocessor_rewrites_view_args() {
        let mut app = App::new("test");
        app.url_value_preprocessor(Arc::new(|_endpoint, args| {
            if let Some(lang) = args.remove("lang") {
                args.insert("resolved_lang".to_string(), lang);
            }
        }));
        app.route(
            "/<lang>/about",
            &["GET"],
            "about",
            ViewHandler::new(|args: crate::handler::ViewArgs| async move {
                Ok(ViewResult::Text(format!(
                    "lang={}",
                    args.get("resolved_lang").cloned().unwrap_or_default()
                )))
            }),
        );
        let app = Arc::new(app);

        let mut response = app.handle_request(request("GET", "/fr/about")).await.unwrap();
        assert_eq!(response.into_sequence().await.unwrap().as_ref(), b"lang=fr");
    }

    #[tokio::test]
    async fn trailing_slash_mismatch_redirects() {
        let mut app = App::new("test");
        app.route("/docs/", &["GET"], "docs", text_view("docs"));
        let app = Arc::new(app);

        let response = app.handle_request(request("GET", "/docs")).await.unwrap();
        assert_eq!(response.status(), 308);
        assert_eq!(response.headers().get("location"), Some("/docs/"));
    }

    #[tokio::test]
    async fn trapped_http_errors_skip_status_rendering() {
        // With trapping on and no registered handler, an HTTP-domain
        // error falls through to the generic 500 path instead of its
        // status-specific default.
        let mut app = App::new("test");
        let mut config = AppConfig::default();
        config.trap_http_errors = true;
        app.set_config(config);
        app.route(
            "/gone",
            &["GET"],
            "gone",
            ViewHandler::new(|_args| async move {
                Err::<ViewResult, _>(HttpError::NotFound.into())
            }),
        );
        let app = Arc::new(app);

        let response = app.handle_request(request("GET", "/gone")).await.unwrap();
        assert_eq!(response.status(), 500);
    }

    #[tokio::test]
    async fn background_task_errors_are_contained() {
        let app = Arc::new(App::new("test"));
        let handle = app.add_background_task(async move {
            Err(DispatchError::other(DownstreamError))
        });
        // The task must complete without panicking the runtime.
        handle.await.unwrap();
    }
}
