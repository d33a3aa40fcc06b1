//! # Forwarding
//!
//! Turns a matched inbound request into the outbound request for one backend, and sends
//! it through the pool's connection-pooled client.
//!
//! Outbound rewriting, in order:
//! 1. hop-by-hop headers are dropped
//! 2. the location's `rewrite` replaces the first occurrence of its `path` (regex
//!    locations substitute through the pattern, so `$1` style captures work)
//! 3. `Host` becomes the backend address
//! 4. `X-Forwarded-For` gets the client IP appended, `X-Forwarded-Proto` is set
//! 5. the location's request header rules run (remove, set, add)
//!
//! The [`UpstreamTransport`] trait is the seam between dispatching and the network, so
//! the dispatcher can be driven without real backends.

use async_trait::async_trait;
use axum::body::Body;
use axum::response::Response;
use bytes::Bytes;
use http::header::{self, HeaderName, HeaderValue};
use http::{HeaderMap, Request, Uri};
use std::fmt;

use crate::core::config::{LocationConfig, PathType};
use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::{RequestContext, X_FORWARDED_FOR, X_FORWARDED_PROTO};
use crate::upstream::Pool;

/// Connection-scoped headers that never cross the proxy
const HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// Sends one prepared request to the backend named in its URI
#[async_trait]
pub trait UpstreamTransport: Send + Sync + fmt::Debug {
    async fn send(&self, pool: &Pool, request: Request<Bytes>) -> GatewayResult<Response<Body>>;
}

/// Transport backed by the pool's `reqwest` client
#[derive(Debug, Default, Clone, Copy)]
pub struct HttpTransport;

#[async_trait]
impl UpstreamTransport for HttpTransport {
    async fn send(&self, pool: &Pool, request: Request<Bytes>) -> GatewayResult<Response<Body>> {
        let deadline = pool.config().write_timeout;
        let request = reqwest::Request::try_from(request)
            .map_err(|e| GatewayError::bad_gateway(pool.name(), e.to_string()))?;

        let upstream_response = tokio::time::timeout(deadline, pool.client().execute(request))
            .await
            .map_err(|_| {
                GatewayError::bad_gateway(
                    pool.name(),
                    format!("no response within {}", humantime::format_duration(deadline)),
                )
            })?
            .map_err(|e| GatewayError::bad_gateway(pool.name(), e.to_string()))?;

        let status = upstream_response.status();
        let headers = upstream_response.headers().clone();

        let mut response = Response::new(Body::from_stream(upstream_response.bytes_stream()));
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        Ok(response)
    }
}

/// Drop hop-by-hop headers, including any the `Connection` header names
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in named.iter().chain(HOP_BY_HOP.iter()) {
        headers.remove(name);
    }
}

/// Path sent to the backend after the location's rewrite
pub fn rewrite_path(path: &str, location: &LocationConfig) -> String {
    let Some(rewrite) = location.rewrite.as_deref() else {
        return path.to_string();
    };

    let rewritten = match (location.path_type, &location.pattern) {
        (PathType::Regex, Some(pattern)) => pattern.0.replace(path, rewrite).into_owned(),
        _ => path.replacen(location.path.as_str(), rewrite, 1),
    };

    if rewritten.starts_with('/') {
        rewritten
    } else {
        format!("/{}", rewritten)
    }
}

/// Build the request for `backend` from the inbound request held in `ctx`
pub fn build_outbound_request(
    ctx: &RequestContext,
    location: &LocationConfig,
    backend: &str,
    scheme: &str,
    body: Bytes,
) -> GatewayResult<Request<Bytes>> {
    let inbound = &ctx.request;

    let mut path_and_query = rewrite_path(inbound.uri.path(), location);
    if let Some(query) = inbound.uri.query() {
        path_and_query.push('?');
        path_and_query.push_str(query);
    }

    let uri: Uri = format!("{}://{}{}", scheme, backend, path_and_query)
        .parse()
        .map_err(|e| GatewayError::bad_gateway(&location.upstream, format!("invalid backend uri: {}", e)))?;

    let mut headers = inbound.headers.clone();
    strip_hop_by_hop(&mut headers);

    let host = HeaderValue::from_str(backend)
        .map_err(|e| GatewayError::bad_gateway(&location.upstream, format!("invalid backend host: {}", e)))?;
    headers.insert(header::HOST, host);

    if let Some(ip) = ctx.remote_addr.map(|addr| addr.ip().to_string()) {
        let chain = forwarded_chain(&headers, &ip);
        if let Ok(value) = HeaderValue::from_str(&chain) {
            headers.insert(X_FORWARDED_FOR, value);
        }
    }
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static(ctx.scheme.as_str()));

    location.request_headers.apply(&mut headers);

    let mut request = Request::builder()
        .method(inbound.method.clone())
        .uri(uri)
        .body(body)
        .map_err(|e| GatewayError::internal(format!("failed to build outbound request: {}", e)))?;
    *request.headers_mut() = headers;
    Ok(request)
}

/// Existing `X-Forwarded-For` entries followed by `ip`
fn forwarded_chain(headers: &HeaderMap, ip: &str) -> String {
    let mut entries: Vec<&str> = headers
        .get_all(X_FORWARDED_FOR)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .collect();
    entries.push(ip);
    entries.join(", ")
}

/// Backend response headers as the client sees them
pub fn apply_response_rules(location: &LocationConfig, mut response: Response<Body>) -> Response<Body> {
    strip_hop_by_hop(response.headers_mut());
    location.response_headers.apply(response.headers_mut());
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::Config;
    use crate::core::types::InboundScheme;
    use std::net::SocketAddr;

    fn location(extra: &str) -> LocationConfig {
        let text = format!(
            "[upstreams.api]\naddrs = [\"10.0.0.1:80\"]\n[locations.api]\nupstream = \"api\"\n{}",
            extra
        );
        Config::from_bytes(text.as_bytes())
            .unwrap()
            .locations
            .remove(0)
    }

    fn context(request: Request<()>, remote: Option<&str>, scheme: InboundScheme) -> RequestContext {
        let (parts, _) = request.into_parts();
        RequestContext::new(parts, remote.map(|r| r.parse::<SocketAddr>().unwrap()), scheme)
    }

    #[test]
    fn test_rewrite_replaces_first_occurrence() {
        let loc = location("path = \"/api\"\nrewrite = \"/v2\"\n");
        assert_eq!(rewrite_path("/api/users/api", &loc), "/v2/users/api");
        assert_eq!(rewrite_path("/other", &loc), "/other");
    }

    #[test]
    fn test_rewrite_result_gains_leading_slash() {
        let loc = location("path = \"/api\"\nrewrite = \"v1\"\n");
        assert_eq!(rewrite_path("/api/users", &loc), "/v1/users");
    }

    #[test]
    fn test_regex_rewrite_uses_captures() {
        let loc = location("path = \"^/v([0-9]+)/(.*)$\"\npath_type = \"regex\"\nrewrite = \"/$2/v$1\"\n");
        assert_eq!(rewrite_path("/v3/items", &loc), "/items/v3");
    }

    #[test]
    fn test_no_rewrite_passes_path_through() {
        let loc = location("path = \"/api\"\n");
        assert_eq!(rewrite_path("/api/x", &loc), "/api/x");
    }

    #[test]
    fn test_strip_hop_by_hop_honours_connection_tokens() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive, x-session"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert("x-session", HeaderValue::from_static("abc"));
        headers.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        headers.insert("x-kept", HeaderValue::from_static("1"));

        strip_hop_by_hop(&mut headers);

        assert_eq!(headers.len(), 1);
        assert!(headers.contains_key("x-kept"));
    }

    #[test]
    fn test_outbound_request_rewrites_target_and_headers() {
        let loc = location(
            r#"path = "/api"
rewrite = "/internal"
proxy_remove_headers = ["cookie"]
proxy_add_headers = ["X-Tenant: blue"]

[locations.api.proxy_set_headers]
"X-Gateway" = "gatehouse"
"#,
        );
        let request = Request::post("http://proxy.local/api/orders?limit=5")
            .header("host", "proxy.local")
            .header("cookie", "session=1")
            .header("connection", "close")
            .header(X_FORWARDED_FOR, "203.0.113.9")
            .body(())
            .unwrap();
        let ctx = context(request, Some("198.51.100.7:5000"), InboundScheme::Https);

        let outbound =
            build_outbound_request(&ctx, &loc, "10.0.0.1:80", "http", Bytes::from_static(b"{}")).unwrap();

        assert_eq!(outbound.method(), http::Method::POST);
        assert_eq!(outbound.uri(), "http://10.0.0.1:80/internal/orders?limit=5");
        let headers = outbound.headers();
        assert_eq!(headers[header::HOST], "10.0.0.1:80");
        assert_eq!(headers[X_FORWARDED_FOR], "203.0.113.9, 198.51.100.7");
        assert_eq!(headers[X_FORWARDED_PROTO], "https");
        assert_eq!(headers["x-gateway"], "gatehouse");
        assert_eq!(headers["x-tenant"], "blue");
        assert!(!headers.contains_key("cookie"));
        assert!(!headers.contains_key(header::CONNECTION));
        assert_eq!(outbound.body().as_ref(), b"{}");
    }

    #[test]
    fn test_outbound_without_peer_address_keeps_forwarded_chain() {
        let loc = location("path = \"/\"\n");
        let request = Request::get("/").header(X_FORWARDED_FOR, "203.0.113.9").body(()).unwrap();
        let ctx = context(request, None, InboundScheme::Http);

        let outbound = build_outbound_request(&ctx, &loc, "10.0.0.1:80", "http", Bytes::new()).unwrap();
        assert_eq!(outbound.headers()[X_FORWARDED_FOR], "203.0.113.9");
        assert_eq!(outbound.headers()[X_FORWARDED_PROTO], "http");
    }

    #[test]
    fn test_response_rules_run_remove_then_set_then_add() {
        let loc = location(
            r#"path = "/"
headers_remove = ["server"]
headers_add = ["Via: gatehouse"]

[locations.api.headers_set]
"Cache-Control" = "no-store"
"#,
        );
        let response = http::Response::builder()
            .header("server", "nginx")
            .header("cache-control", "max-age=60")
            .header("via", "1.1 backend")
            .header(header::TRANSFER_ENCODING, "chunked")
            .body(Body::empty())
            .unwrap();

        let response = apply_response_rules(&loc, response);
        let headers = response.headers();

        assert!(!headers.contains_key("server"));
        assert!(!headers.contains_key(header::TRANSFER_ENCODING));
        assert_eq!(headers["cache-control"], "no-store");
        let via: Vec<_> = headers.get_all("via").iter().collect();
        assert_eq!(via, vec!["1.1 backend", "gatehouse"]);
    }
}
