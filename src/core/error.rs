//! # Error Handling Module
//!
//! This module defines every error the proxy can produce, using the `thiserror` crate.
//! Each variant maps to exactly one HTTP status code so that request-handling code can
//! turn any failure into a client response without a second lookup table.
//!
//! ## Error Taxonomy
//!
//! - **Configuration**: malformed document or failed validation. Fatal at load time.
//! - **RouteNotFound**: no location matched the request (404).
//! - **UpstreamNotFound**: a location points at a pool the manager does not own (503).
//! - **NoBackends**: backend selection was attempted on an empty pool (503).
//! - **Middleware**: a plugin hook failed during the request phase (500).
//! - **BadGateway**: the outbound call to a backend failed at the transport level (502).
//! - **PayloadTooLarge**: the request body is over the server's limit (413).
//!
//! ## The `?` Operator
//!
//! Functions in this crate return `GatewayResult<T>` and propagate failures with `?`:
//! ```rust,ignore
//! fn load(path: &Path) -> GatewayResult<Config> {
//!     let bytes = std::fs::read(path)?;   // io::Error -> GatewayError::Io
//!     Config::from_bytes(&bytes)          // already a GatewayResult
//! }
//! ```

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use std::convert::Infallible;
use thiserror::Error;

/// Main result type used throughout the proxy
pub type GatewayResult<T> = Result<T, GatewayError>;

/// All error conditions surfaced by the proxy
#[derive(Debug, Error, Clone)]
pub enum GatewayError {
    /// Configuration-related errors (unreadable file, parse failure, failed validation)
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// No location matched the inbound request
    #[error("No route matched {method} {path}")]
    RouteNotFound { method: String, path: String },

    /// A location referenced an upstream pool that is not registered
    #[error("Upstream not found: {upstream}")]
    UpstreamNotFound { upstream: String },

    /// Backend selection was attempted on a pool without backends
    #[error("No backends available in upstream: {upstream}")]
    NoBackends { upstream: String },

    /// Plugin hook failures, wrapped with the name of the offending plugin
    #[error("Middleware error ({middleware}): {message}")]
    Middleware { middleware: String, message: String },

    /// Request body larger than the server accepts
    #[error("Request body exceeds {limit} bytes")]
    PayloadTooLarge { limit: usize },

    /// Transport failure while forwarding to a backend
    #[error("Bad gateway ({upstream}): {message}")]
    BadGateway { upstream: String, message: String },

    /// Certificate or key material could not be loaded
    #[error("TLS error: {message}")]
    Tls { message: String },

    /// Internal server errors for unexpected failures
    #[error("Internal server error: {message}")]
    Internal { message: String },

    /// I/O errors (file operations, listener binding, etc.)
    #[error("I/O error: {message}")]
    Io { message: String },
}

impl GatewayError {
    /// Create a configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a plugin error tagged with the plugin's name
    pub fn middleware<N: Into<String>, S: Into<String>>(middleware: N, message: S) -> Self {
        Self::Middleware {
            middleware: middleware.into(),
            message: message.into(),
        }
    }

    /// Create a bad-gateway error for the given upstream
    pub fn bad_gateway<N: Into<String>, S: Into<String>>(upstream: N, message: S) -> Self {
        Self::BadGateway {
            upstream: upstream.into(),
            message: message.into(),
        }
    }

    /// Create a TLS error
    pub fn tls<S: Into<String>>(message: S) -> Self {
        Self::Tls {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Map the error to the status code returned to clients
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::RouteNotFound { .. } => StatusCode::NOT_FOUND,
            Self::UpstreamNotFound { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::NoBackends { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::BadGateway { .. } => StatusCode::BAD_GATEWAY,
            Self::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Middleware { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Configuration { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Tls { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Io { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get a string representation of the error type for API responses
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::Configuration { .. } => "configuration_error",
            Self::RouteNotFound { .. } => "route_not_found",
            Self::UpstreamNotFound { .. } => "upstream_not_found",
            Self::NoBackends { .. } => "no_backends",
            Self::Middleware { .. } => "middleware_error",
            Self::BadGateway { .. } => "bad_gateway",
            Self::PayloadTooLarge { .. } => "payload_too_large",
            Self::Tls { .. } => "tls_error",
            Self::Internal { .. } => "internal_error",
            Self::Io { .. } => "io_error",
        }
    }
}

impl From<Infallible> for GatewayError {
    fn from(infallible: Infallible) -> Self {
        match infallible {}
    }
}

impl From<std::io::Error> for GatewayError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            message: err.to_string(),
        }
    }
}

impl From<toml::de::Error> for GatewayError {
    fn from(err: toml::de::Error) -> Self {
        Self::config(format!("invalid TOML document: {}", err))
    }
}

impl From<serde_yaml::Error> for GatewayError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::config(format!("invalid YAML document: {}", err))
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        Self::config(format!("invalid JSON document: {}", err))
    }
}

/// Render errors as structured JSON responses
impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        let error_response = json!({
            "error": {
                "code": status.as_u16(),
                "message": self.to_string(),
                "type": self.error_type(),
            }
        });

        (status, Json(error_response)).into_response()
    }
}
