//! # Built-in Plugins
//!
//! Plugins shipped with the proxy. Each is created by the [`PluginFactory`] from a
//! `[plugins.<name>]` declaration; the declaration's `config` table is deserialized into
//! the plugin's config struct, with missing keys taking their defaults.
//!
//! | type               | request phase                      | response phase                  |
//! |--------------------|------------------------------------|---------------------------------|
//! | `request_id`       | ensure the id header on the request | echo it on the response        |
//! | `request_logging`  | -                                  | log method, path, status, timing |
//! | `security_headers` | -                                  | add security headers            |
//! | `ip_restriction`   | answer 403 for blocked clients     | -                               |
//!
//! [`PluginFactory`]: crate::middleware::factory::PluginFactory

use async_trait::async_trait;
use http::header::{HeaderName, HeaderValue};
use crate::core::types::X_FORWARDED_FOR;
use http::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::net::IpAddr;
use tracing::{info, warn};
use uuid::Uuid;

use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::RequestContext;
use crate::middleware::pipeline::Plugin;

pub const REQUEST_ID_VAR: &str = "request_id";

fn header_name(plugin: &str, raw: &str) -> GatewayResult<HeaderName> {
    HeaderName::from_bytes(raw.as_bytes())
        .map_err(|_| GatewayError::config(format!("plugin '{}': invalid header name '{}'", plugin, raw)))
}

fn header_value(plugin: &str, raw: &str) -> GatewayResult<HeaderValue> {
    HeaderValue::from_str(raw)
        .map_err(|_| GatewayError::config(format!("plugin '{}': invalid header value '{}'", plugin, raw)))
}

// ---------------------------------------------------------------------------
// request_id
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestIdConfig {
    /// Header carrying the id
    pub header: String,
}

impl Default for RequestIdConfig {
    fn default() -> Self {
        Self {
            header: "x-request-id".to_string(),
        }
    }
}

/// Ensures every request carries an id, generating a UUID v4 when the client sent none
#[derive(Debug)]
pub struct RequestIdPlugin {
    name: String,
    priority: i32,
    header: HeaderName,
}

impl RequestIdPlugin {
    pub fn new(name: &str, priority: i32, config: RequestIdConfig) -> GatewayResult<Self> {
        Ok(Self {
            name: name.to_string(),
            priority,
            header: header_name(name, &config.header)?,
        })
    }
}

#[async_trait]
impl Plugin for RequestIdPlugin {
    fn name(&self) -> &str {
        &self.name
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    async fn on_request(&self, ctx: &mut RequestContext) -> GatewayResult<()> {
        let id = match ctx
            .request
            .headers
            .get(&self.header)
            .and_then(|v| v.to_str().ok())
        {
            Some(existing) => existing.to_string(),
            None => {
                let generated = Uuid::new_v4().to_string();
                let value = header_value(&self.name, &generated)?;
                ctx.request.headers.insert(self.header.clone(), value);
                generated
            }
        };
        ctx.set_var(REQUEST_ID_VAR, json!(id));
        Ok(())
    }

    async fn on_response(&self, ctx: &mut RequestContext) -> GatewayResult<()> {
        let Some(id) = ctx.var(REQUEST_ID_VAR).and_then(|v| v.as_str()).map(str::to_string) else {
            return Ok(());
        };
        let value = header_value(&self.name, &id)?;
        if let Some(response) = ctx.response.as_mut() {
            response.headers_mut().insert(self.header.clone(), value);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// request_logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestLoggingConfig {
    /// Also log request headers
    pub log_headers: bool,
}

/// Access log line per request, emitted in the response phase. Latency is measured from
/// [`RequestContext::started`], stamped when the context is built, so there is no
/// request hook.
#[derive(Debug)]
pub struct RequestLoggingPlugin {
    name: String,
    priority: i32,
    config: RequestLoggingConfig,
}

impl RequestLoggingPlugin {
    pub fn new(name: &str, priority: i32, config: RequestLoggingConfig) -> Self {
        Self {
            name: name.to_string(),
            priority,
            config,
        }
    }
}

#[async_trait]
impl Plugin for RequestLoggingPlugin {
    fn name(&self) -> &str {
        &self.name
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    async fn on_response(&self, ctx: &mut RequestContext) -> GatewayResult<()> {
        let status = ctx.status().map(|s| s.as_u16()).unwrap_or(0);
        let request_id = ctx
            .var(REQUEST_ID_VAR)
            .and_then(|v| v.as_str())
            .unwrap_or("-");

        if self.config.log_headers {
            info!(
                method = %ctx.request.method,
                path = %ctx.request.uri.path(),
                status,
                upstream = %ctx.upstream,
                backend = ctx.backend.as_deref().unwrap_or("-"),
                request_id,
                duration_ms = ctx.elapsed().as_millis() as u64,
                headers = ?ctx.request.headers,
                "Request completed"
            );
        } else {
            info!(
                method = %ctx.request.method,
                path = %ctx.request.uri.path(),
                status,
                upstream = %ctx.upstream,
                backend = ctx.backend.as_deref().unwrap_or("-"),
                request_id,
                duration_ms = ctx.elapsed().as_millis() as u64,
                "Request completed"
            );
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// security_headers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityHeadersConfig {
    pub x_frame_options: Option<String>,
    pub x_content_type_options: bool,
    pub strict_transport_security: Option<String>,
    pub content_security_policy: Option<String>,
    pub referrer_policy: Option<String>,
    pub custom_headers: BTreeMap<String, String>,
}

impl Default for SecurityHeadersConfig {
    fn default() -> Self {
        Self {
            x_frame_options: Some("DENY".to_string()),
            x_content_type_options: true,
            strict_transport_security: None,
            content_security_policy: None,
            referrer_policy: Some("strict-origin-when-cross-origin".to_string()),
            custom_headers: BTreeMap::new(),
        }
    }
}

#[derive(Debug)]
pub struct SecurityHeadersPlugin {
    name: String,
    priority: i32,
    headers: Vec<(HeaderName, HeaderValue)>,
}

impl SecurityHeadersPlugin {
    pub fn new(name: &str, priority: i32, config: SecurityHeadersConfig) -> GatewayResult<Self> {
        let mut raw: Vec<(&str, &str)> = Vec::new();
        if let Some(value) = &config.x_frame_options {
            raw.push(("x-frame-options", value.as_str()));
        }
        if config.x_content_type_options {
            raw.push(("x-content-type-options", "nosniff"));
        }
        if let Some(value) = &config.strict_transport_security {
            raw.push(("strict-transport-security", value.as_str()));
        }
        if let Some(value) = &config.content_security_policy {
            raw.push(("content-security-policy", value.as_str()));
        }
        if let Some(value) = &config.referrer_policy {
            raw.push(("referrer-policy", value.as_str()));
        }
        for (key, value) in &config.custom_headers {
            raw.push((key.as_str(), value.as_str()));
        }

        let headers = raw
            .into_iter()
            .map(|(key, value)| Ok((header_name(name, key)?, header_value(name, value)?)))
            .collect::<GatewayResult<Vec<_>>>()?;

        Ok(Self {
            name: name.to_string(),
            priority,
            headers,
        })
    }
}

#[async_trait]
impl Plugin for SecurityHeadersPlugin {
    fn name(&self) -> &str {
        &self.name
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    async fn on_response(&self, ctx: &mut RequestContext) -> GatewayResult<()> {
        if let Some(response) = ctx.response.as_mut() {
            for (name, value) in &self.headers {
                response.headers_mut().insert(name.clone(), value.clone());
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// ip_restriction
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IpRestrictionConfig {
    /// When non-empty, only these clients are let through
    pub allow: Vec<String>,
    pub deny: Vec<String>,
    /// Peers whose `X-Forwarded-For` is believed; everyone else is judged by the socket address
    pub trusted_proxies: Vec<String>,
    pub message: String,
}

impl Default for IpRestrictionConfig {
    fn default() -> Self {
        Self {
            allow: Vec::new(),
            deny: Vec::new(),
            trusted_proxies: Vec::new(),
            message: "Forbidden".to_string(),
        }
    }
}

#[derive(Debug)]
pub struct IpRestrictionPlugin {
    name: String,
    priority: i32,
    allow: Vec<IpAddr>,
    deny: Vec<IpAddr>,
    trusted_proxies: Vec<IpAddr>,
    message: String,
}

impl IpRestrictionPlugin {
    pub fn new(name: &str, priority: i32, config: IpRestrictionConfig) -> GatewayResult<Self> {
        let parse = |list: &[String]| -> GatewayResult<Vec<IpAddr>> {
            list.iter()
                .map(|ip| {
                    ip.trim().parse::<IpAddr>().map_err(|_| {
                        GatewayError::config(format!("plugin '{}': invalid IP address '{}'", name, ip))
                    })
                })
                .collect()
        };

        Ok(Self {
            name: name.to_string(),
            priority,
            allow: parse(&config.allow)?,
            deny: parse(&config.deny)?,
            trusted_proxies: parse(&config.trusted_proxies)?,
            message: config.message,
        })
    }

    /// The address access is decided on. Forwarded hops are walked right to left only
    /// while they come from trusted proxies; the first untrusted hop is the client.
    fn client_address(&self, ctx: &RequestContext) -> Option<IpAddr> {
        let peer = ctx.remote_addr.map(|addr| addr.ip())?;
        if !self.trusted_proxies.contains(&peer) {
            return Some(peer);
        }

        let hops = ctx
            .request
            .headers
            .get_all(X_FORWARDED_FOR)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(|value| value.split(','))
            .map(str::trim)
            .filter(|hop| !hop.is_empty())
            .collect::<Vec<_>>();

        for hop in hops.iter().rev() {
            match hop.parse::<IpAddr>() {
                Ok(ip) if self.trusted_proxies.contains(&ip) => continue,
                Ok(ip) => return Some(ip),
                Err(_) => return None,
            }
        }
        Some(peer)
    }

    fn is_blocked(&self, client: Option<IpAddr>) -> bool {
        match client {
            Some(ip) if self.deny.contains(&ip) => true,
            Some(ip) => !self.allow.is_empty() && !self.allow.contains(&ip),
            None => !self.allow.is_empty(),
        }
    }
}

#[async_trait]
impl Plugin for IpRestrictionPlugin {
    fn name(&self) -> &str {
        &self.name
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    async fn on_request(&self, ctx: &mut RequestContext) -> GatewayResult<()> {
        let client = self.client_address(ctx);
        if self.is_blocked(client) {
            warn!(
                plugin = %self.name,
                client = ?client,
                path = %ctx.request.uri.path(),
                "Blocked client"
            );
            let body = json!({
                "error": {
                    "code": StatusCode::FORBIDDEN.as_u16(),
                    "message": self.message,
                    "type": "forbidden",
                }
            });
            ctx.respond(StatusCode::FORBIDDEN, body.to_string());
            if let Some(response) = ctx.response.as_mut() {
                response.headers_mut().insert(
                    http::header::CONTENT_TYPE,
                    HeaderValue::from_static("application/json"),
                );
            }
        }
        Ok(())
    }
}
