//! # Gatehouse - Core Library Crate
//!
//! A configuration-driven HTTP reverse proxy. A configuration document declares upstream
//! pools, locations that route requests to them, server blocks that listen for traffic,
//! and in-process plugins that run around forwarding.
//!
//! ## Module Map
//!
//! - `core`: configuration loading and validation, the error type, per-request context
//! - `routing`: location matching by priority, host, path and method
//! - `load_balancing`: backends and the four selection strategies
//! - `upstream`: named backend pools with their HTTP clients and health checkers
//! - `middleware`: the plugin trait, the ordered chain and the built-in plugins
//! - `observability`: health probing, log subscriber setup, metrics
//! - `gateway`: the request dispatcher, forwarding, listeners and TLS
//!
//! ## Request Lifecycle
//!
//! ```text
//! listener ─▶ Dispatcher ─▶ Router::match_parts ─▶ UpstreamManager::get
//!                 │
//!                 ├─▶ PluginChain::execute_request
//!                 ├─▶ Pool::next ─▶ UpstreamTransport::send
//!                 └─▶ PluginChain::execute_response ─▶ client
//! ```

pub mod core;

pub mod gateway;

pub mod load_balancing;

pub mod middleware;

pub mod observability;

pub mod routing;

pub mod upstream;

// Re-export commonly used types for convenience
pub use crate::core::config::Config;
pub use crate::core::error::{GatewayError, GatewayResult};
pub use crate::core::types::RequestContext;
pub use crate::gateway::{Dispatcher, GatewayServer};
pub use crate::middleware::{Plugin, PluginChain, PluginFactory};
pub use crate::routing::Router;
pub use crate::upstream::UpstreamManager;
