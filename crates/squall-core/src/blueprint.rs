//! Blueprints: named groups of routes and hooks.
//!
//! A blueprint collects routes, hooks, and error handlers under a name;
//! registering it onto an [`App`] prefixes its endpoints with
//! `"<name>."`, mounts its rules under the optional URL prefix, and files
//! its hooks under the blueprint scope so the dispatch pipeline can order
//! app- and blueprint-level hooks per phase.

use crate::app::App;
use crate::error_handlers::ErrorTag;
use crate::handler::{
    AfterHook, BeforeHook, ErrorHandler, TeardownHook, UrlValuePreprocessor, ViewHandler,
    WsViewHandler,
};

/// A deferred route registration.
struct BlueprintRoute {
    rule: String,
    methods: Vec<String>,
    endpoint: String,
    handler: ViewHandler,
}

struct BlueprintWsRoute {
    rule: String,
    endpoint: String,
    handler: WsViewHandler,
}

/// A named collection of routes and hooks, applied to an [`App`] at
/// registration time.
pub struct Blueprint {
    name: String,
    url_prefix: Option<String>,
    routes: Vec<BlueprintRoute>,
    ws_routes: Vec<BlueprintWsRoute>,
    url_value_preprocessors: Vec<UrlValuePreprocessor>,
    before_request: Vec<BeforeHook>,
    after_request: Vec<AfterHook>,
    teardown_request: Vec<TeardownHook>,
    before_websocket: Vec<BeforeHook>,
    after_websocket: Vec<AfterHook>,
    teardown_websocket: Vec<TeardownHook>,
    error_handlers: Vec<(ErrorTag, ErrorHandler)>,
}

impl Blueprint {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url_prefix: None,
            routes: Vec::new(),
            ws_routes: Vec::new(),
            url_value_preprocessors: Vec::new(),
            before_request: Vec::new(),
            after_request: Vec::new(),
            teardown_request: Vec::new(),
            before_websocket: Vec::new(),
            after_websocket: Vec::new(),
            teardown_websocket: Vec::new(),
            error_handlers: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Mount every route of this blueprint under `prefix`.
    pub fn with_url_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.url_prefix = Some(prefix.into());
        self
    }

    pub fn route(
        &mut self,
        rule: impl Into<String>,
        methods: &[&str],
        endpoint: impl Into<String>,
        handler: ViewHandler,
    ) {
        self.routes.push(BlueprintRoute {
            rule: rule.into(),
            methods: methods.iter().map(|m| m.to_string()).collect(),
            endpoint: endpoint.into(),
            handler,
        });
    }

    pub fn websocket(
        &mut self,
        rule: impl Into<String>,
        endpoint: impl Into<String>,
        handler: WsViewHandler,
    ) {
        self.ws_routes.push(BlueprintWsRoute {
            rule: rule.into(),
            endpoint: endpoint.into(),
            handler,
        });
    }

    pub fn url_value_preprocessor(&mut self, preprocessor: UrlValuePreprocessor) {
        self.url_value_preprocessors.push(preprocessor);
    }

    pub fn before_request(&mut self, hook: BeforeHook) {
        self.before_request.push(hook);
    }

    pub fn after_request(&mut self, hook: AfterHook) {
        self.after_request.push(hook);
    }

    pub fn teardown_request(&mut self, hook: TeardownHook) {
        self.teardown_request.push(hook);
    }

    pub fn before_websocket(&mut self, hook: BeforeHook) {
        self.before_websocket.push(hook);
    }

    pub fn after_websocket(&mut self, hook: AfterHook) {
        self.after_websocket.push(hook);
    }

    pub fn teardown_websocket(&mut self, hook: TeardownHook) {
        self.teardown_websocket.push(hook);
    }

    pub fn errorhandler(&mut self, tag: ErrorTag, handler: ErrorHandler) {
        self.error_handlers.push((tag, handler));
    }

    fn full_rule(&self, rule: &str) -> String {
        match &self.url_prefix {
            Some(prefix) => format!("{}{}", prefix.trim_end_matches('/'), rule),
            None => rule.to_string(),
        }
    }
}

impl App {
    /// Merge a blueprint's routes, hooks, and error handlers into this
    /// application under the blueprint's scope.
    pub fn register_blueprint(&mut self, blueprint: Blueprint) {
        let scope = Some(blueprint.name.clone());

        for route in &blueprint.routes {
            let endpoint = format!("{}.{}", blueprint.name, route.endpoint);
            let methods: Vec<&str> = route.methods.iter().map(String::as_str).collect();
            self.route(
                blueprint.full_rule(&route.rule),
                &methods,
                endpoint,
                route.handler.clone(),
            );
        }
        for route in &blueprint.ws_routes {
            let endpoint = format!("{}.{}", blueprint.name, route.endpoint);
            self.websocket(
                blueprint.full_rule(&route.rule),
                endpoint,
                route.handler.clone(),
            );
        }

        for preprocessor in blueprint.url_value_preprocessors {
            self.url_value_preprocessor_scoped(scope.clone(), preprocessor);
        }
        for hook in blueprint.before_request {
            self.before_request_scoped(scope.clone(), hook);
        }
        for hook in blueprint.after_request {
            self.after_request_scoped(scope.clone(), hook);
        }
        for hook in blueprint.teardown_request {
            self.teardown_request_scoped(scope.clone(), hook);
        }
        for hook in blueprint.before_websocket {
            self.before_websocket_scoped(scope.clone(), hook);
        }
        for hook in blueprint.after_websocket {
            self.after_websocket_scoped(scope.clone(), hook);
        }
        for hook in blueprint.teardown_websocket {
            self.teardown_websocket_scoped(scope.clone(), hook);
        }
        for (tag, handler) in blueprint.error_handlers {
            self.errorhandler_scoped(scope.clone(), tag, handler);
        }
    }
}
