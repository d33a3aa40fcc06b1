//! # Core Types
//!
//! Per-request state shared between the dispatcher and the plugin chain.
//!
//! A [`RequestContext`] is created fresh for every inbound request, threaded by `&mut`
//! through the request phase, the forwarding step and the response phase, and dropped
//! once the response has been handed back to the server. It is never shared between
//! requests, so it needs no synchronization.

use axum::body::Body;
use axum::response::Response;
use chrono::{DateTime, Utc};
use http::request::Parts;
use http::{HeaderMap, StatusCode};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::core::error::GatewayError;

pub const X_FORWARDED_FOR: &str = "x-forwarded-for";
pub const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Scheme the client used to reach the proxy. Inserted into request extensions by the
/// listener so that forwarding can set `X-Forwarded-Proto`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InboundScheme {
    #[default]
    Http,
    Https,
}

impl InboundScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
        }
    }
}

/// Client key for IP-hash affinity.
///
/// The first entry of `X-Forwarded-For` wins over the connection's peer address. The
/// header is client-controlled, so access decisions must not rely on this.
pub fn client_ip(headers: &HeaderMap, remote: Option<SocketAddr>) -> Option<String> {
    let forwarded = headers
        .get(X_FORWARDED_FOR)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty());

    match forwarded {
        Some(ip) => Some(ip.to_string()),
        None => remote.map(|addr| addr.ip().to_string()),
    }
}

/// Host the request was addressed to: the `Host` header, or the URI authority for HTTP/2
pub fn request_host(parts: &Parts) -> Option<String> {
    parts
        .headers
        .get(http::header::HOST)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .or_else(|| parts.uri.authority().map(|a| a.as_str().to_string()))
}

/// Per-request state visible to every plugin hook
#[derive(Debug)]
pub struct RequestContext {
    /// Inbound request head; plugins may edit headers before forwarding
    pub request: Parts,

    /// Peer address of the client connection, when known
    pub remote_addr: Option<SocketAddr>,

    /// Scheme of the inbound connection
    pub scheme: InboundScheme,

    /// Name of the matched location
    pub location: String,

    /// Name of the upstream pool serving this request
    pub upstream: String,

    /// Address of the selected backend, once selection has happened
    pub backend: Option<String>,

    /// Wall-clock time the request was received
    pub received_at: DateTime<Utc>,

    pub started: Instant,
    pub finished: Option<Instant>,

    /// String-keyed bag for inter-plugin communication
    pub variables: HashMap<String, serde_json::Value>,

    /// Failure recorded during handling, if any
    pub error: Option<GatewayError>,

    /// Stop running the remaining hooks of the current phase
    pub skip: bool,

    /// A plugin produced the response; the dispatcher must not forward
    pub response_written: bool,

    /// Response that will be returned to the client
    pub response: Option<Response<Body>>,
}

impl RequestContext {
    pub fn new(request: Parts, remote_addr: Option<SocketAddr>, scheme: InboundScheme) -> Self {
        Self {
            request,
            remote_addr,
            scheme,
            location: String::new(),
            upstream: String::new(),
            backend: None,
            received_at: Utc::now(),
            started: Instant::now(),
            finished: None,
            variables: HashMap::new(),
            error: None,
            skip: false,
            response_written: false,
            response: None,
        }
    }

    /// Answer the request from a plugin and stop the chain
    pub fn respond(&mut self, status: StatusCode, body: impl Into<Body>) {
        let mut response = Response::new(body.into());
        *response.status_mut() = status;
        self.response = Some(response);
        self.response_written = true;
        self.skip = true;
    }

    pub fn set_var<K: Into<String>>(&mut self, key: K, value: serde_json::Value) {
        self.variables.insert(key.into(), value);
    }

    pub fn var(&self, key: &str) -> Option<&serde_json::Value> {
        self.variables.get(key)
    }

    /// Time from arrival until `finished`, or until now if still in flight
    pub fn elapsed(&self) -> Duration {
        self.finished
            .unwrap_or_else(Instant::now)
            .saturating_duration_since(self.started)
    }

    /// Status of the response decided so far
    pub fn status(&self) -> Option<StatusCode> {
        self.response.as_ref().map(|r| r.status())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Request;

    fn parts(builder: http::request::Builder) -> Parts {
        builder.body(()).unwrap().into_parts().0
    }

    #[test]
    fn test_client_ip_prefers_forwarded_for() {
        let mut headers = HeaderMap::new();
        headers.insert(X_FORWARDED_FOR, "203.0.113.7, 10.0.0.1".parse().unwrap());
        let remote: SocketAddr = "192.168.1.5:5000".parse().unwrap();

        assert_eq!(client_ip(&headers, Some(remote)).as_deref(), Some("203.0.113.7"));
        assert_eq!(
            client_ip(&HeaderMap::new(), Some(remote)).as_deref(),
            Some("192.168.1.5")
        );
        assert_eq!(client_ip(&HeaderMap::new(), None), None);
    }

    #[test]
    fn test_request_host() {
        let with_header = parts(Request::get("/x").header("host", "api.example.com"));
        assert_eq!(request_host(&with_header).as_deref(), Some("api.example.com"));

        let with_authority = parts(Request::get("http://h2.example.com:8443/x"));
        assert_eq!(
            request_host(&with_authority).as_deref(),
            Some("h2.example.com:8443")
        );
    }

    #[test]
    fn test_respond_sets_both_flags() {
        let mut ctx = RequestContext::new(parts(Request::get("/")), None, InboundScheme::Http);
        ctx.respond(StatusCode::FORBIDDEN, "denied");

        assert!(ctx.skip);
        assert!(ctx.response_written);
        assert_eq!(ctx.status(), Some(StatusCode::FORBIDDEN));
    }
}
