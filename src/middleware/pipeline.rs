//! # Plugin Chain
//!
//! An ordered list of in-process plugins run around the forwarding step.
//!
//! ## Execution Model
//! - Plugins are kept sorted ascending by `priority()` (lower runs earlier). Registration
//!   is stable, so plugins with equal priority run in the order they were added.
//! - `execute_request` runs every `on_request` hook in priority order.
//! - `execute_response` runs every `on_response` hook in reverse order.
//! - Both phases stop as soon as the context's `skip` flag is set or a hook fails. A
//!   failure is returned wrapped with the plugin's name.
//!
//! A plugin answers a request itself with [`RequestContext::respond`], which sets both
//! `response_written` and `skip`. The dispatcher checks `response_written` before it
//! forwards.
//!
//! ## Rust Concepts Used
//! - `async_trait` for async trait methods
//! - `Arc<dyn Plugin>` so per-location chains share plugin instances with the global chain

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::core::config::DEFAULT_PLUGIN_PRIORITY;
use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::RequestContext;

/// A hook pair run around forwarding
#[async_trait]
pub trait Plugin: Send + Sync + fmt::Debug {
    /// Name used in logs and error messages
    fn name(&self) -> &str;

    /// Lower numbers execute first in the request phase
    fn priority(&self) -> i32 {
        DEFAULT_PLUGIN_PRIORITY
    }

    /// Runs before the request is forwarded
    async fn on_request(&self, _ctx: &mut RequestContext) -> GatewayResult<()> {
        Ok(())
    }

    /// Runs after the response has been decided, whatever the outcome
    async fn on_response(&self, _ctx: &mut RequestContext) -> GatewayResult<()> {
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct PluginChain {
    plugins: Vec<Arc<dyn Plugin>>,
}

impl fmt::Debug for PluginChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

impl PluginChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert after every plugin whose priority is lower or equal
    pub fn add(&mut self, plugin: Arc<dyn Plugin>) {
        let position = self
            .plugins
            .partition_point(|existing| existing.priority() <= plugin.priority());
        self.plugins.insert(position, plugin);
    }

    pub fn from_plugins<I: IntoIterator<Item = Arc<dyn Plugin>>>(plugins: I) -> Self {
        let mut chain = Self::new();
        for plugin in plugins {
            chain.add(plugin);
        }
        chain
    }

    /// A chain holding only the named plugins, still in priority order
    pub fn subset(&self, names: &[String]) -> Self {
        Self {
            plugins: self
                .plugins
                .iter()
                .filter(|plugin| names.iter().any(|name| name == plugin.name()))
                .cloned()
                .collect(),
        }
    }

    pub fn names(&self) -> Vec<&str> {
        self.plugins.iter().map(|plugin| plugin.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// Request phase, in priority order
    pub async fn execute_request(&self, ctx: &mut RequestContext) -> GatewayResult<()> {
        for plugin in &self.plugins {
            if ctx.skip {
                debug!(plugin = plugin.name(), "Skipping remaining request hooks");
                break;
            }
            plugin
                .on_request(ctx)
                .await
                .map_err(|e| wrap_error(plugin.name(), e))?;
        }
        Ok(())
    }

    /// Response phase, in reverse priority order
    pub async fn execute_response(&self, ctx: &mut RequestContext) -> GatewayResult<()> {
        for plugin in self.plugins.iter().rev() {
            if ctx.skip {
                debug!(plugin = plugin.name(), "Skipping remaining response hooks");
                break;
            }
            if let Err(e) = plugin.on_response(ctx).await {
                let err = wrap_error(plugin.name(), e);
                warn!(plugin = plugin.name(), error = %err, "Response hook failed");
                return Err(err);
            }
        }
        Ok(())
    }
}

fn wrap_error(plugin: &str, err: GatewayError) -> GatewayError {
    match err {
        GatewayError::Middleware { .. } => err,
        other => GatewayError::middleware(plugin, other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Request;

    #[derive(Debug)]
    struct Named(&'static str, i32);

    #[async_trait]
    impl Plugin for Named {
        fn name(&self) -> &str {
            self.0
        }

        fn priority(&self) -> i32 {
            self.1
        }
    }

    #[test]
    fn test_add_keeps_priority_order_stable() {
        let chain = PluginChain::from_plugins([
            Arc::new(Named("late", 200)) as Arc<dyn Plugin>,
            Arc::new(Named("first-100", 100)),
            Arc::new(Named("early", 10)),
            Arc::new(Named("second-100", 100)),
        ]);
        assert_eq!(chain.names(), vec!["early", "first-100", "second-100", "late"]);
    }

    #[test]
    fn test_subset_preserves_order() {
        let chain = PluginChain::from_plugins([
            Arc::new(Named("a", 3)) as Arc<dyn Plugin>,
            Arc::new(Named("b", 1)),
            Arc::new(Named("c", 2)),
        ]);
        let subset = chain.subset(&["a".to_string(), "b".to_string()]);
        assert_eq!(subset.names(), vec!["b", "a"]);
    }

    #[tokio::test]
    async fn test_empty_chain_is_noop() {
        let (parts, _) = Request::get("/").body(()).unwrap().into_parts();
        let mut ctx = RequestContext::new(parts, None, Default::default());
        let chain = PluginChain::new();

        tokio_test::assert_ok!(chain.execute_request(&mut ctx).await);
        tokio_test::assert_ok!(chain.execute_response(&mut ctx).await);
        assert!(!ctx.skip);
    }
}
