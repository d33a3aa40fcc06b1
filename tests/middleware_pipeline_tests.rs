//! # Plugin Chain Integration Tests
//!
//! Ordering, short-circuiting and error handling of the plugin chain, driven through the
//! public API the way the dispatcher drives it.

use async_trait::async_trait;
use axum::http::{Request, StatusCode};
use serde_json::{json, Value};
use std::sync::Arc;

use gatehouse::core::error::{GatewayError, GatewayResult};
use gatehouse::core::types::RequestContext;
use gatehouse::middleware::{Plugin, PluginChain, PluginFactory};
use gatehouse::Config;

/// Helper function to create a test context
fn create_test_context(path: &str) -> RequestContext {
    let (parts, _) = Request::get(path).body(()).unwrap().into_parts();
    RequestContext::new(parts, Some("127.0.0.1:40000".parse().unwrap()), Default::default())
}

/// Test plugin that appends `<phase>:<name>` to the `trace` variable
#[derive(Debug)]
struct TestPlugin {
    name: String,
    priority: i32,
    fail_request: bool,
    fail_response: bool,
    respond_with: Option<StatusCode>,
    skip_response: bool,
}

impl TestPlugin {
    fn new(name: &str, priority: i32) -> Self {
        Self {
            name: name.to_string(),
            priority,
            fail_request: false,
            fail_response: false,
            respond_with: None,
            skip_response: false,
        }
    }

    fn failing_request(mut self) -> Self {
        self.fail_request = true;
        self
    }

    fn failing_response(mut self) -> Self {
        self.fail_response = true;
        self
    }

    fn responding(mut self, status: StatusCode) -> Self {
        self.respond_with = Some(status);
        self
    }

    fn skipping_response(mut self) -> Self {
        self.skip_response = true;
        self
    }

    fn arc(self) -> Arc<dyn Plugin> {
        Arc::new(self)
    }
}

fn push_trace(ctx: &mut RequestContext, entry: String) {
    let mut trace = ctx.var("trace").cloned().unwrap_or_else(|| json!([]));
    if let Value::Array(entries) = &mut trace {
        entries.push(Value::String(entry));
    }
    ctx.set_var("trace", trace);
}

fn trace(ctx: &RequestContext) -> Vec<String> {
    ctx.var("trace")
        .and_then(Value::as_array)
        .map(|entries| {
            entries
                .iter()
                .filter_map(|e| e.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

#[async_trait]
impl Plugin for TestPlugin {
    fn name(&self) -> &str {
        &self.name
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    async fn on_request(&self, ctx: &mut RequestContext) -> GatewayResult<()> {
        push_trace(ctx, format!("req:{}", self.name));
        if self.fail_request {
            return Err(GatewayError::internal("request hook failed"));
        }
        if let Some(status) = self.respond_with {
            ctx.respond(status, "handled by plugin");
        }
        Ok(())
    }

    async fn on_response(&self, ctx: &mut RequestContext) -> GatewayResult<()> {
        push_trace(ctx, format!("resp:{}", self.name));
        if self.fail_response {
            return Err(GatewayError::internal("response hook failed"));
        }
        if self.skip_response {
            ctx.skip = true;
        }
        Ok(())
    }
}

#[tokio::test]
async fn test_request_phase_runs_in_priority_order() {
    let chain = PluginChain::from_plugins([
        TestPlugin::new("c", 30).arc(),
        TestPlugin::new("a", 10).arc(),
        TestPlugin::new("b", 20).arc(),
    ]);
    let mut ctx = create_test_context("/");

    chain.execute_request(&mut ctx).await.unwrap();
    assert_eq!(trace(&ctx), vec!["req:a", "req:b", "req:c"]);
}

#[tokio::test]
async fn test_response_phase_runs_in_reverse_order() {
    let chain = PluginChain::from_plugins([
        TestPlugin::new("a", 10).arc(),
        TestPlugin::new("b", 20).arc(),
        TestPlugin::new("c", 30).arc(),
    ]);
    let mut ctx = create_test_context("/");

    chain.execute_request(&mut ctx).await.unwrap();
    chain.execute_response(&mut ctx).await.unwrap();
    assert_eq!(
        trace(&ctx),
        vec!["req:a", "req:b", "req:c", "resp:c", "resp:b", "resp:a"]
    );
}

#[tokio::test]
async fn test_equal_priorities_keep_registration_order() {
    let mut chain = PluginChain::new();
    chain.add(TestPlugin::new("first", 100).arc());
    chain.add(TestPlugin::new("second", 100).arc());
    chain.add(TestPlugin::new("early", 1).arc());

    assert_eq!(chain.names(), vec!["early", "first", "second"]);
}

#[tokio::test]
async fn test_responding_plugin_stops_request_phase() {
    let chain = PluginChain::from_plugins([
        TestPlugin::new("auth", 1).responding(StatusCode::UNAUTHORIZED).arc(),
        TestPlugin::new("later", 2).arc(),
    ]);
    let mut ctx = create_test_context("/");

    chain.execute_request(&mut ctx).await.unwrap();

    assert_eq!(trace(&ctx), vec!["req:auth"]);
    assert!(ctx.skip);
    assert!(ctx.response_written);
    assert_eq!(ctx.status(), Some(StatusCode::UNAUTHORIZED));
}

#[tokio::test]
async fn test_request_error_is_wrapped_and_stops_chain() {
    let chain = PluginChain::from_plugins([
        TestPlugin::new("ok", 1).arc(),
        TestPlugin::new("broken", 2).failing_request().arc(),
        TestPlugin::new("never", 3).arc(),
    ]);
    let mut ctx = create_test_context("/");

    let err = chain.execute_request(&mut ctx).await.unwrap_err();

    assert!(matches!(err, GatewayError::Middleware { ref middleware, .. } if middleware == "broken"));
    assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(trace(&ctx), vec!["req:ok", "req:broken"]);
}

#[tokio::test]
async fn test_response_error_stops_remaining_hooks() {
    let chain = PluginChain::from_plugins([
        TestPlugin::new("outer", 1).arc(),
        TestPlugin::new("inner", 2).failing_response().arc(),
    ]);
    let mut ctx = create_test_context("/");

    let err = chain.execute_response(&mut ctx).await.unwrap_err();
    assert!(err.to_string().contains("inner"));
    assert_eq!(trace(&ctx), vec!["resp:inner"]);
}

#[tokio::test]
async fn test_skip_during_response_phase_stops_remaining_hooks() {
    let chain = PluginChain::from_plugins([
        TestPlugin::new("outer", 1).arc(),
        TestPlugin::new("inner", 2).skipping_response().arc(),
    ]);
    let mut ctx = create_test_context("/");

    chain.execute_response(&mut ctx).await.unwrap();
    assert_eq!(trace(&ctx), vec!["resp:inner"]);
}

#[tokio::test]
async fn test_built_in_chain_from_configuration() {
    let config = Config::from_bytes(
        br#"
[plugins.ids]
type = "request_id"
priority = 1

[plugins.headers]
type = "security_headers"
priority = 50

[plugins.headers.config]
x_frame_options = "SAMEORIGIN"
"#,
    )
    .unwrap();

    let chain = PluginFactory::with_builtins().build_chain(&config.plugins).unwrap();
    assert_eq!(chain.names(), vec!["ids", "headers"]);

    let mut ctx = create_test_context("/");
    chain.execute_request(&mut ctx).await.unwrap();
    assert!(ctx.var("request_id").is_some());

    ctx.response = Some(axum::response::Response::new(axum::body::Body::empty()));
    chain.execute_response(&mut ctx).await.unwrap();

    let response = ctx.response.take().unwrap();
    assert_eq!(response.headers()["x-frame-options"], "SAMEORIGIN");
    assert!(response.headers().contains_key("x-request-id"));
}
