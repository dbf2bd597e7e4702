//! The router collaborator interface and a map-backed implementation.
//!
//! The dispatch pipeline only depends on the [`Router`] trait: match a
//! method and path to a [`RouteTarget`] or fail with one of the four
//! routing conditions, and report the allowed-methods set for automatic
//! OPTIONS responses. [`MapRouter`] is the bundled implementation — plain
//! segment comparison with `<param>` captures, no pattern compilation.

use std::collections::BTreeMap;

use squall_http::{HttpError, RouteTarget};

/// A registered URL rule.
#[derive(Debug, Clone)]
pub struct RouteRule {
    /// The path pattern, e.g. `/users/<id>`.
    pub rule: String,
    /// Endpoint name; blueprint routes arrive prefixed (`"bp.view"`).
    pub endpoint: String,
    /// Methods this rule accepts.
    pub methods: Vec<String>,
    /// Synthesize an `Allow` response for OPTIONS instead of invoking the
    /// view.
    pub provide_automatic_options: bool,
    /// Websocket rules only match websocket dispatch, and vice versa.
    pub is_websocket: bool,
}

impl RouteRule {
    pub fn http(rule: impl Into<String>, endpoint: impl Into<String>, methods: &[&str]) -> Self {
        Self {
            rule: rule.into(),
            endpoint: endpoint.into(),
            methods: methods.iter().map(|m| m.to_uppercase()).collect(),
            provide_automatic_options: true,
            is_websocket: false,
        }
    }

    pub fn websocket(rule: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            rule: rule.into(),
            endpoint: endpoint.into(),
            methods: vec!["GET".to_string()],
            provide_automatic_options: false,
            is_websocket: true,
        }
    }
}

/// Routing collaborator consumed by the dispatch pipeline.
pub trait Router: Send + Sync {
    /// Register a rule. Called during application setup only.
    fn add_rule(&mut self, rule: RouteRule);

    /// Match a request or websocket against the rules.
    ///
    /// Only the four routing conditions may be returned as errors:
    /// `NotFound`, `MethodNotAllowed`, `BadRequest`, `RedirectRequired`.
    fn match_route(&self, method: &str, path: &str, websocket: bool)
    -> Result<RouteTarget, HttpError>;

    /// Methods accepted for `path`, for the automatic OPTIONS response.
    fn allowed_methods(&self, path: &str) -> Vec<String>;
}

/// Segment-matching router.
///
/// Rules match path-segment-wise; a `<name>` segment captures the request
/// segment as a view argument. A path missing only its trailing slash
/// (where the rule has one) produces the redirect-required condition.
#[derive(Default)]
pub struct MapRouter {
    rules: Vec<RouteRule>,
}

impl MapRouter {
    pub fn new() -> Self {
        Self::default()
    }

    fn capture(rule: &str, path: &str) -> Option<BTreeMap<String, String>> {
        let rule_segments: Vec<&str> = rule.split('/').collect();
        let path_segments: Vec<&str> = path.split('/').collect();
        if rule_segments.len() != path_segments.len() {
            return None;
        }
        let mut args = BTreeMap::new();
        for (rule_seg, path_seg) in rule_segments.iter().zip(&path_segments) {
            if let Some(name) = rule_seg.strip_prefix('<').and_then(|s| s.strip_suffix('>')) {
                if path_seg.is_empty() {
                    return None;
                }
                args.insert(name.to_string(), (*path_seg).to_string());
            } else if rule_seg != path_seg {
                return None;
            }
        }
        Some(args)
    }
}

impl Router for MapRouter {
    fn add_rule(&mut self, rule: RouteRule) {
        self.rules.push(rule);
    }

    fn match_route(
        &self,
        method: &str,
        path: &str,
        websocket: bool,
    ) -> Result<RouteTarget, HttpError> {
        // A path containing whitespace can never be routed; it is the
        // adapter's poisoned-path sentinel.
        if path.contains(' ') {
            return Err(HttpError::NotFound);
        }

        let mut path_matched = false;
        let mut allowed: Vec<String> = Vec::new();
        for rule in self.rules.iter().filter(|r| r.is_websocket == websocket) {
            let Some(view_args) = Self::capture(&rule.rule, path) else {
                continue;
            };
            path_matched = true;
            if rule.methods.iter().any(|m| m == method)
                || (method == "OPTIONS" && rule.provide_automatic_options)
            {
                return Ok(RouteTarget {
                    endpoint: rule.endpoint.clone(),
                    view_args,
                    provide_automatic_options: rule.provide_automatic_options,
                });
            }
            allowed.extend(rule.methods.iter().cloned());
        }

        if path_matched {
            allowed.sort();
            allowed.dedup();
            return Err(HttpError::MethodNotAllowed { allowed });
        }

        // Trailing-slash canonicalization.
        if !path.ends_with('/') {
            let slashed = format!("{path}/");
            if self
                .rules
                .iter()
                .filter(|r| r.is_websocket == websocket)
                .any(|r| Self::capture(&r.rule, &slashed).is_some())
            {
                return Err(HttpError::RedirectRequired { location: slashed });
            }
        }

        Err(HttpError::NotFound)
    }

    fn allowed_methods(&self, path: &str) -> Vec<String> {
        let mut methods: Vec<String> = self
            .rules
            .iter()
            .filter(|r| !r.is_websocket && Self::capture(&r.rule, path).is_some())
            .flat_map(|r| r.methods.iter().cloned())
            .collect();
        if !methods.is_empty() {
            methods.push("OPTIONS".to_string());
        }
        methods.sort();
        methods.dedup();
        methods
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn router() -> MapRouter {
        let mut router = MapRouter::new();
        router.add_rule(RouteRule::http("/", "index", &["GET"]));
        router.add_rule(RouteRule::http("/users/<id>", "users.show", &["GET"]));
        router.add_rule(RouteRule::http("/users/<id>", "users.update", &["POST", "PUT"]));
        router.add_rule(RouteRule::http("/docs/", "docs", &["GET"]));
        router.add_rule(RouteRule::websocket("/live", "live"));
        router
    }

    #[test]
    fn exact_match() {
        let target = router().match_route("GET", "/", false).unwrap();
        assert_eq!(target.endpoint, "index");
        assert!(target.view_args.is_empty());
    }

    #[test]
    fn param_capture() {
        let target = router().match_route("GET", "/users/42", false).unwrap();
        assert_eq!(target.endpoint, "users.show");
        assert_eq!(target.view_args.get("id").map(String::as_str), Some("42"));
    }

    #[test]
    fn method_routing_picks_matching_rule() {
        let target = router().match_route("PUT", "/users/7", false).unwrap();
        assert_eq!(target.endpoint, "users.update");
    }

    #[test]
    fn wrong_method_reports_allowed_set() {
        let err = router().match_route("DELETE", "/users/7", false).unwrap_err();
        match err {
            HttpError::MethodNotAllowed { allowed } => {
                assert_eq!(allowed, vec!["GET", "POST", "PUT"]);
            }
            other => panic!("expected MethodNotAllowed, got {other:?}"),
        }
    }

    #[test]
    fn missing_path_is_not_found() {
        assert_eq!(
            router().match_route("GET", "/nope", false),
            Err(HttpError::NotFound)
        );
    }

    #[test]
    fn poisoned_path_is_not_found() {
        assert_eq!(
            router().match_route("GET", " ", false),
            Err(HttpError::NotFound)
        );
    }

    #[test]
    fn trailing_slash_redirect() {
        assert_eq!(
            router().match_route("GET", "/docs", false),
            Err(HttpError::RedirectRequired {
                location: "/docs/".to_string()
            })
        );
    }

    #[test]
    fn websocket_rules_do_not_match_http() {
        assert_eq!(
            router().match_route("GET", "/live", false),
            Err(HttpError::NotFound)
        );
        assert_eq!(
            router().match_route("GET", "/live", true).unwrap().endpoint,
            "live"
        );
    }

    #[test]
    fn automatic_options_matches_any_rule() {
        let target = router().match_route("OPTIONS", "/users/3", false).unwrap();
        assert!(target.provide_automatic_options);
    }

    #[test]
    fn allowed_methods_unions_rules() {
        assert_eq!(
            router().allowed_methods("/users/9"),
            vec!["GET", "OPTIONS", "POST", "PUT"]
        );
        assert!(router().allowed_methods("/absent").is_empty());
    }
}
