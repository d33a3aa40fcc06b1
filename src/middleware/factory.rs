//! # Plugin Factory
//!
//! Creates plugin instances from `[plugins.<name>]` declarations. Each plugin `type` maps
//! to a registered [`PluginConstructor`]; the built-in types are registered by
//! [`PluginFactory::with_builtins`].

use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use crate::core::config::PluginConfig;
use crate::core::error::{GatewayError, GatewayResult};
use crate::middleware::builtin::{
    IpRestrictionConfig, IpRestrictionPlugin, RequestIdConfig, RequestIdPlugin,
    RequestLoggingConfig, RequestLoggingPlugin, SecurityHeadersConfig, SecurityHeadersPlugin,
};
use crate::middleware::pipeline::{Plugin, PluginChain};

/// Builds one plugin type from its declaration
pub trait PluginConstructor: Send + Sync + fmt::Debug {
    fn create(&self, declaration: &PluginConfig) -> GatewayResult<Arc<dyn Plugin>>;
}

#[derive(Debug, Default)]
pub struct PluginFactory {
    constructors: HashMap<String, Box<dyn PluginConstructor>>,
}

impl PluginFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Factory with every built-in plugin type registered
    pub fn with_builtins() -> Self {
        let mut factory = Self::new();
        factory.register("request_id", Box::new(RequestIdConstructor));
        factory.register("request_logging", Box::new(RequestLoggingConstructor));
        factory.register("security_headers", Box::new(SecurityHeadersConstructor));
        factory.register("ip_restriction", Box::new(IpRestrictionConstructor));
        factory
    }

    pub fn register<S: Into<String>>(&mut self, plugin_type: S, constructor: Box<dyn PluginConstructor>) {
        self.constructors.insert(plugin_type.into(), constructor);
    }

    pub fn create(&self, declaration: &PluginConfig) -> GatewayResult<Arc<dyn Plugin>> {
        let constructor = self
            .constructors
            .get(&declaration.plugin_type)
            .ok_or_else(|| {
                GatewayError::config(format!(
                    "plugin '{}': unknown type '{}'",
                    declaration.name, declaration.plugin_type
                ))
            })?;

        let plugin = constructor.create(declaration)?;
        debug!(
            plugin = %declaration.name,
            plugin_type = %declaration.plugin_type,
            priority = declaration.priority,
            "Created plugin"
        );
        Ok(plugin)
    }

    /// Chain of every enabled declaration
    pub fn build_chain(&self, declarations: &[PluginConfig]) -> GatewayResult<PluginChain> {
        let plugins = declarations
            .iter()
            .filter(|declaration| declaration.enabled)
            .map(|declaration| self.create(declaration))
            .collect::<GatewayResult<Vec<_>>>()?;
        Ok(PluginChain::from_plugins(plugins))
    }
}

/// Deserialize the opaque `config` table; absent means defaults
fn plugin_config<T: DeserializeOwned + Default>(declaration: &PluginConfig) -> GatewayResult<T> {
    match &declaration.config {
        Value::Null => Ok(T::default()),
        value => serde_json::from_value(value.clone()).map_err(|e| {
            GatewayError::config(format!(
                "plugin '{}': invalid config: {}",
                declaration.name, e
            ))
        }),
    }
}

#[derive(Debug)]
struct RequestIdConstructor;

impl PluginConstructor for RequestIdConstructor {
    fn create(&self, declaration: &PluginConfig) -> GatewayResult<Arc<dyn Plugin>> {
        let config: RequestIdConfig = plugin_config(declaration)?;
        Ok(Arc::new(RequestIdPlugin::new(&declaration.name, declaration.priority, config)?))
    }
}

#[derive(Debug)]
struct RequestLoggingConstructor;

impl PluginConstructor for RequestLoggingConstructor {
    fn create(&self, declaration: &PluginConfig) -> GatewayResult<Arc<dyn Plugin>> {
        let config: RequestLoggingConfig = plugin_config(declaration)?;
        Ok(Arc::new(RequestLoggingPlugin::new(&declaration.name, declaration.priority, config)))
    }
}

#[derive(Debug)]
struct SecurityHeadersConstructor;

impl PluginConstructor for SecurityHeadersConstructor {
    fn create(&self, declaration: &PluginConfig) -> GatewayResult<Arc<dyn Plugin>> {
        let config: SecurityHeadersConfig = plugin_config(declaration)?;
        Ok(Arc::new(SecurityHeadersPlugin::new(&declaration.name, declaration.priority, config)?))
    }
}

#[derive(Debug)]
struct IpRestrictionConstructor;

impl PluginConstructor for IpRestrictionConstructor {
    fn create(&self, declaration: &PluginConfig) -> GatewayResult<Arc<dyn Plugin>> {
        let config: IpRestrictionConfig = plugin_config(declaration)?;
        Ok(Arc::new(IpRestrictionPlugin::new(&declaration.name, declaration.priority, config)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::Config;

    fn declarations(text: &str) -> Vec<PluginConfig> {
        Config::from_bytes(text.as_bytes()).unwrap().plugins
    }

    #[test]
    fn test_builds_enabled_plugins_in_priority_order() {
        let plugins = declarations(
            r#"
[plugins.logging]
type = "request_logging"
priority = 50

[plugins.ids]
type = "request_id"
priority = 5

[plugins.headers]
type = "security_headers"
enabled = false
"#,
        );
        let chain = PluginFactory::with_builtins().build_chain(&plugins).unwrap();
        assert_eq!(chain.names(), vec!["ids", "logging"]);
    }

    #[test]
    fn test_plugin_config_table_is_applied() {
        let plugins = declarations(
            r#"
[plugins.blocker]
type = "ip_restriction"

[plugins.blocker.config]
deny = ["not-an-ip"]
"#,
        );
        let err = PluginFactory::with_builtins()
            .build_chain(&plugins)
            .unwrap_err()
            .to_string();
        assert!(err.contains("plugin 'blocker'"), "{}", err);
    }

    #[test]
    fn test_unknown_type_rejected() {
        let plugins = declarations("[plugins.x]\ntype = \"wasm\"\n");
        let err = PluginFactory::with_builtins()
            .build_chain(&plugins)
            .unwrap_err()
            .to_string();
        assert!(err.contains("unknown type 'wasm'"), "{}", err);
    }

    #[test]
    fn test_invalid_config_shape_rejected() {
        let plugins = declarations("[plugins.ids]\ntype = \"request_id\"\nconfig = { header = 42 }\n");
        assert!(PluginFactory::with_builtins().build_chain(&plugins).is_err());
    }
}
