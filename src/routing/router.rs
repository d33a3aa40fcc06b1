//! # Router Module
//!
//! Maps an inbound request to the single best-matching location.
//!
//! The router is built once from the validated location set and is read-only afterwards,
//! so any number of request tasks can match concurrently without locking.
//!
//! ## Matching Rules
//!
//! - Entries are sorted by descending `priority`. Within one priority, `exact` locations
//!   come first; otherwise the sort is stable and document order is kept.
//! - A host constraint, when present, must match the request host. Otherwise the entry
//!   is skipped.
//! - The path matcher is `exact` (equality), `prefix` (string prefix) or `regex`.
//! - When the path matches but the method is not in the location's allow-list, matching
//!   continues with the next entry instead of failing.
//! - The first entry passing every active check wins.

use http::request::Parts;
use http::Method;
use regex::Regex;
use std::sync::Arc;

use crate::core::config::{LocationConfig, PathType};
use crate::core::types::request_host;

#[derive(Debug, Clone)]
pub enum PathMatcher {
    Exact(String),
    Prefix(String),
    Regex(Regex),
}

impl PathMatcher {
    pub fn for_location(location: &LocationConfig) -> Self {
        match (location.path_type, &location.pattern) {
            (PathType::Exact, _) => Self::Exact(location.path.clone()),
            (PathType::Regex, Some(pattern)) => Self::Regex(pattern.0.clone()),
            // Resolution always compiles regex locations; treat a stray one literally
            (PathType::Regex, None) | (PathType::Prefix, _) => Self::Prefix(location.path.clone()),
        }
    }

    pub fn matches(&self, path: &str) -> bool {
        match self {
            Self::Exact(expected) => path == expected,
            Self::Prefix(prefix) => path.starts_with(prefix.as_str()),
            Self::Regex(pattern) => pattern.is_match(path),
        }
    }
}

/// Literal host comparison, case-insensitive.
///
/// A configured host without a port matches the request host with its port stripped.
#[derive(Debug, Clone)]
pub struct HostMatcher {
    host: String,
    has_port: bool,
}

impl HostMatcher {
    pub fn new(host: &str) -> Self {
        let host = host.trim().to_ascii_lowercase();
        let has_port = split_port(&host).1.is_some();
        Self { host, has_port }
    }

    pub fn matches(&self, request_host: &str) -> bool {
        let request_host = request_host.trim().to_ascii_lowercase();
        if self.has_port {
            request_host == self.host
        } else {
            split_port(&request_host).0 == self.host
        }
    }
}

/// Split `host[:port]`, keeping bracketed IPv6 literals intact
fn split_port(host: &str) -> (&str, Option<&str>) {
    if host.starts_with('[') {
        return match host.find("]:") {
            Some(end) => (&host[..=end], Some(&host[end + 2..])),
            None => (host, None),
        };
    }
    match host.rsplit_once(':') {
        Some((name, port)) if !name.contains(':') => (name, Some(port)),
        _ => (host, None),
    }
}

#[derive(Debug, Clone)]
pub struct RouteEntry {
    pub location: Arc<LocationConfig>,
    path: PathMatcher,
    host: Option<HostMatcher>,
}

impl RouteEntry {
    pub fn new(location: LocationConfig) -> Self {
        Self {
            path: PathMatcher::for_location(&location),
            host: location.host.as_deref().map(HostMatcher::new),
            location: Arc::new(location),
        }
    }

    fn is_exact(&self) -> bool {
        matches!(self.path, PathMatcher::Exact(_))
    }

    fn allows(&self, method: &Method) -> bool {
        self.location.methods.is_empty() || self.location.methods.contains(method)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Router {
    entries: Vec<RouteEntry>,
}

impl Router {
    pub fn new<I: IntoIterator<Item = LocationConfig>>(locations: I) -> Self {
        let mut entries: Vec<RouteEntry> = locations.into_iter().map(RouteEntry::new).collect();
        // Stable: equal keys keep document order
        entries.sort_by(|a, b| {
            b.location
                .priority
                .cmp(&a.location.priority)
                .then_with(|| b.is_exact().cmp(&a.is_exact()))
        });
        Self { entries }
    }

    /// Best-matching location for the request, if any
    pub fn match_request(&self, method: &Method, host: Option<&str>, path: &str) -> Option<Arc<LocationConfig>> {
        self.entries
            .iter()
            .filter(|entry| match (&entry.host, host) {
                (None, _) => true,
                (Some(matcher), Some(host)) => matcher.matches(host),
                (Some(_), None) => false,
            })
            .filter(|entry| entry.path.matches(path))
            .find(|entry| entry.allows(method))
            .map(|entry| Arc::clone(&entry.location))
    }

    pub fn match_parts(&self, parts: &Parts) -> Option<Arc<LocationConfig>> {
        let host = request_host(parts);
        self.match_request(&parts.method, host.as_deref(), parts.uri.path())
    }

    /// Location names in match order
    pub fn locations(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|entry| entry.location.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::Config;
    use http::Request;

    fn router(locations_toml: &str) -> Router {
        let text = format!(
            "[upstreams.api]\naddrs = [\"10.0.0.1:80\"]\n[upstreams.static]\naddrs = [\"10.0.0.2:80\"]\n{}",
            locations_toml
        );
        let config = Config::from_bytes(text.as_bytes()).unwrap();
        Router::new(config.locations)
    }

    fn create_test_request(method: Method, uri: &str, host: Option<&str>) -> Parts {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(host) = host {
            builder = builder.header("host", host);
        }
        builder.body(()).unwrap().into_parts().0
    }

    fn matched(router: &Router, method: Method, uri: &str, host: Option<&str>) -> Option<String> {
        router
            .match_parts(&create_test_request(method, uri, host))
            .map(|l| l.name.clone())
    }

    #[test]
    fn test_prefix_scenario() {
        let router = router("[locations.v1]\nupstream = \"api\"\npath = \"/v1\"\n");

        assert_eq!(matched(&router, Method::GET, "/v1/users", None).as_deref(), Some("v1"));
        assert_eq!(matched(&router, Method::GET, "/v2/x", None), None);
    }

    #[test]
    fn test_exact_beats_overlapping_prefix_with_higher_priority() {
        let router = router(
            r#"
[locations.all]
upstream = "api"
path = "/"

[locations.loginish]
upstream = "static"
path = "/log"

[locations.login]
upstream = "api"
path = "/login"
path_type = "exact"
priority = 10
"#,
        );
        assert_eq!(matched(&router, Method::GET, "/login", None).as_deref(), Some("login"));
        assert_eq!(matched(&router, Method::GET, "/login/x", None).as_deref(), Some("all"));
    }

    #[test]
    fn test_exact_wins_at_equal_priority() {
        let router = router(
            r#"
[locations.all]
upstream = "api"
path = "/"

[locations.login]
upstream = "api"
path = "/login"
path_type = "exact"
"#,
        );
        assert_eq!(matched(&router, Method::GET, "/login", None).as_deref(), Some("login"));
        assert_eq!(matched(&router, Method::GET, "/logout", None).as_deref(), Some("all"));
    }

    #[test]
    fn test_equal_priority_keeps_document_order() {
        let router = router(
            r#"
[locations.first]
upstream = "api"
path = "/shop"

[locations.second]
upstream = "static"
path = "/shop/cart"
"#,
        );
        assert_eq!(router.locations().collect::<Vec<_>>(), vec!["first", "second"]);
        assert_eq!(matched(&router, Method::GET, "/shop/cart", None).as_deref(), Some("first"));
    }

    #[test]
    fn test_exact_with_equal_priority_listed_first_wins() {
        let router = router(
            r#"
[locations.login]
upstream = "api"
path = "/login"
path_type = "exact"

[locations.all]
upstream = "api"
path = "/"
"#,
        );
        assert_eq!(matched(&router, Method::POST, "/login", None).as_deref(), Some("login"));
        assert_eq!(matched(&router, Method::POST, "/login2", None).as_deref(), Some("all"));
    }

    #[test]
    fn test_priority_orders_entries() {
        let router = router(
            r#"
[locations.low]
upstream = "api"
path = "/api"
priority = 1

[locations.high]
upstream = "static"
path = "/api/assets"
priority = 5
"#,
        );
        assert_eq!(router.locations().collect::<Vec<_>>(), vec!["high", "low"]);
        assert_eq!(matched(&router, Method::GET, "/api/assets/a.css", None).as_deref(), Some("high"));
        assert_eq!(matched(&router, Method::GET, "/api/users", None).as_deref(), Some("low"));
    }

    #[test]
    fn test_regex_location() {
        let router = router(
            "[locations.versioned]\nupstream = \"api\"\npath = \"^/v[0-9]+/users$\"\npath_type = \"regex\"\n",
        );
        assert_eq!(matched(&router, Method::GET, "/v12/users", None).as_deref(), Some("versioned"));
        assert_eq!(matched(&router, Method::GET, "/vx/users", None), None);
    }

    #[test]
    fn test_host_constraint() {
        let router = router(
            r#"
[locations.tenant]
upstream = "api"
path = "/"
host = "tenant.example.com"
priority = 10

[locations.fallback]
upstream = "static"
path = "/"
"#,
        );
        assert_eq!(
            matched(&router, Method::GET, "/", Some("tenant.example.com:8080")).as_deref(),
            Some("tenant")
        );
        assert_eq!(
            matched(&router, Method::GET, "/", Some("TENANT.example.com")).as_deref(),
            Some("tenant")
        );
        assert_eq!(
            matched(&router, Method::GET, "/", Some("other.example.com")).as_deref(),
            Some("fallback")
        );
        assert_eq!(matched(&router, Method::GET, "/", None).as_deref(), Some("fallback"));
    }

    #[test]
    fn test_method_mismatch_falls_through() {
        let router = router(
            r#"
[locations.writes]
upstream = "api"
path = "/items"
methods = ["POST", "PUT"]
priority = 10

[locations.reads]
upstream = "static"
path = "/items"
"#,
        );
        assert_eq!(matched(&router, Method::POST, "/items", None).as_deref(), Some("writes"));
        assert_eq!(matched(&router, Method::GET, "/items", None).as_deref(), Some("reads"));
    }

    #[test]
    fn test_method_mismatch_without_alternative_is_miss() {
        let router = router("[locations.writes]\nupstream = \"api\"\npath = \"/items\"\nmethods = [\"POST\"]\n");
        assert_eq!(matched(&router, Method::DELETE, "/items", None), None);
    }

    #[test]
    fn test_split_port() {
        assert_eq!(split_port("example.com:80"), ("example.com", Some("80")));
        assert_eq!(split_port("example.com"), ("example.com", None));
        assert_eq!(split_port("[::1]:8080"), ("[::1]", Some("8080")));
        assert_eq!(split_port("[::1]"), ("[::1]", None));
    }
}
