//! # Request Dispatcher
//!
//! Drives one inbound request through route matching, the plugin chain and forwarding.
//!
//! ## Request Flow
//!
//! 1. Match a location. No match answers 404.
//! 2. Look up the location's upstream pool. A missing pool answers 503.
//! 3. Build the [`RequestContext`].
//! 4. Run the request phase. A hook error answers 500; a plugin that wrote the response
//!    stops the request from being forwarded.
//! 5. Select a backend. An empty pool answers 503.
//! 6. Forward. A transport failure answers 502; otherwise the backend's response is
//!    streamed back after the location's response header rules.
//! 7. Run the response phase, whatever happened in steps 4 to 6.
//!
//! ## Rust Concepts Used
//!
//! - `Arc<dyn UpstreamTransport>` so tests can swap the network out
//! - `#[instrument]` to open one span per request
//! - RAII: the least-connections lease rides inside the response body stream

use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::response::{IntoResponse, Response};
use futures::StreamExt;
use http_body_util::{BodyExt, LengthLimitError, Limited};
use metrics::{counter, histogram};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tower_http::trace::TraceLayer;
use tracing::{debug, instrument, warn};

use crate::core::config::{Config, LocationConfig, ServerConfig, DEFAULT_MAX_BODY_BYTES};
use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::{InboundScheme, RequestContext};
use crate::gateway::forward::{apply_response_rules, build_outbound_request, HttpTransport, UpstreamTransport};
use crate::load_balancing::ConnectionLease;
use crate::middleware::{PluginChain, PluginFactory};
use crate::observability::metrics::{REQUESTS_TOTAL, REQUEST_DURATION_SECONDS};
use crate::routing::Router;
use crate::upstream::{Pool, UpstreamManager};

#[derive(Debug)]
pub struct Dispatcher {
    router: Router,
    upstreams: Arc<UpstreamManager>,
    chain: PluginChain,
    location_chains: HashMap<String, PluginChain>,
    transport: Arc<dyn UpstreamTransport>,
    max_body_bytes: usize,
}

impl Dispatcher {
    /// Dispatcher over `locations`, every location running `chain`
    pub fn new(locations: Vec<LocationConfig>, upstreams: Arc<UpstreamManager>, chain: PluginChain) -> Self {
        Self {
            router: Router::new(locations),
            upstreams,
            chain,
            location_chains: HashMap::new(),
            transport: Arc::new(HttpTransport),
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }

    /// Dispatcher for one server block: only the locations it lists, with per-location
    /// plugin chains where a location names its plugins
    pub fn for_server(
        config: &Config,
        server: &ServerConfig,
        upstreams: Arc<UpstreamManager>,
        factory: &PluginFactory,
    ) -> GatewayResult<Self> {
        let chain = factory.build_chain(&config.plugins)?;
        let locations = config.locations_for(server);

        let location_chains = locations
            .iter()
            .filter(|location| !location.plugins.is_empty())
            .map(|location| (location.name.clone(), chain.subset(&location.plugins)))
            .collect();

        debug!(
            server = %server.name,
            locations = locations.len(),
            plugins = ?chain,
            "Built dispatcher"
        );

        Ok(Self {
            location_chains,
            max_body_bytes: server.max_body_bytes,
            ..Self::new(locations, upstreams, chain)
        })
    }

    pub fn with_max_body_bytes(mut self, limit: usize) -> Self {
        self.max_body_bytes = limit;
        self
    }

    pub fn with_transport(mut self, transport: Arc<dyn UpstreamTransport>) -> Self {
        self.transport = transport;
        self
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    /// Axum router sending every request through [`Dispatcher::dispatch`]
    pub fn into_router(self: Arc<Self>) -> axum::Router {
        axum::Router::new()
            .fallback(proxy_handler)
            .with_state(self)
            .layer(TraceLayer::new_for_http())
    }

    fn chain_for(&self, location: &LocationConfig) -> &PluginChain {
        self.location_chains.get(&location.name).unwrap_or(&self.chain)
    }

    #[instrument(skip_all, fields(method = %request.method(), path = %request.uri().path()))]
    pub async fn dispatch(&self, request: Request) -> Response {
        let started = Instant::now();
        let remote = request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|info| info.0);
        let scheme = request
            .extensions()
            .get::<InboundScheme>()
            .copied()
            .unwrap_or_default();
        let (parts, body) = request.into_parts();

        let Some(location) = self.router.match_parts(&parts) else {
            let err = GatewayError::RouteNotFound {
                method: parts.method.to_string(),
                path: parts.uri.path().to_string(),
            };
            debug!(error = %err, "No location matched");
            return record(err.into_response(), "", started);
        };

        let pool = match self.upstreams.get(&location.upstream) {
            Ok(pool) => pool,
            Err(err) => {
                warn!(location = %location.name, error = %err, "Location points at a missing upstream");
                return record(err.into_response(), &location.upstream, started);
            }
        };

        let mut ctx = RequestContext::new(parts, remote, scheme);
        ctx.location = location.name.clone();
        ctx.upstream = location.upstream.clone();

        let chain = self.chain_for(&location);
        match chain.execute_request(&mut ctx).await {
            Err(err) => {
                warn!(location = %location.name, error = %err, "Request phase failed");
                fail(&mut ctx, err);
            }
            Ok(()) if ctx.response_written => {
                debug!(location = %location.name, "Plugin answered the request");
            }
            Ok(()) => self.forward(&mut ctx, &location, &pool, body).await,
        }

        ctx.skip = false;
        ctx.finished = Some(Instant::now());
        if let Err(err) = chain.execute_response(&mut ctx).await {
            warn!(location = %location.name, error = %err, "Response phase failed; response unchanged");
        }

        let response = match ctx.response.take() {
            Some(response) => response,
            None => GatewayError::internal("request finished without a response").into_response(),
        };
        record(response, &ctx.upstream, started)
    }

    async fn forward(&self, ctx: &mut RequestContext, location: &LocationConfig, pool: &Pool, body: Body) {
        let selection = match pool.next(&ctx.request.headers, ctx.remote_addr) {
            Ok(selection) => selection,
            Err(err) => {
                warn!(upstream = %pool.name(), error = %err, "Backend selection failed");
                return fail(ctx, err);
            }
        };
        ctx.backend = Some(selection.addr().to_string());

        let body = match Limited::new(body, self.max_body_bytes).collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(err) if err.downcast_ref::<LengthLimitError>().is_some() => {
                warn!(limit = self.max_body_bytes, "Request body over the limit");
                return fail(ctx, GatewayError::PayloadTooLarge {
                    limit: self.max_body_bytes,
                });
            }
            Err(err) => {
                return fail(ctx, GatewayError::Io {
                    message: format!("failed to read request body: {}", err),
                })
            }
        };

        let outbound = match build_outbound_request(ctx, location, selection.addr(), backend_scheme(pool), body) {
            Ok(outbound) => outbound,
            Err(err) => return fail(ctx, err),
        };

        match self.transport.send(pool, outbound).await {
            Ok(response) => {
                debug!(
                    upstream = %pool.name(),
                    backend = %selection.addr(),
                    status = response.status().as_u16(),
                    "Backend responded"
                );
                let response = apply_response_rules(location, response);
                ctx.response = Some(hold_lease(response, selection.lease));
            }
            Err(err) => {
                warn!(upstream = %pool.name(), backend = %selection.addr(), error = %err, "Forwarding failed");
                fail(ctx, err);
            }
        }
    }
}

async fn proxy_handler(State(dispatcher): State<Arc<Dispatcher>>, request: Request) -> Response {
    dispatcher.dispatch(request).await
}

fn fail(ctx: &mut RequestContext, err: GatewayError) {
    ctx.response = Some(err.clone().into_response());
    ctx.error = Some(err);
}

/// Upstreams presenting a client certificate are reached over TLS
fn backend_scheme(pool: &Pool) -> &'static str {
    if pool.config().tls_cert.is_some() {
        "https"
    } else {
        "http"
    }
}

/// Keep the backend's in-flight count until the body has been streamed out
fn hold_lease(response: Response, lease: Option<ConnectionLease>) -> Response {
    let Some(lease) = lease else {
        return response;
    };
    let (parts, body) = response.into_parts();
    let stream = body.into_data_stream().map(move |chunk| {
        let _held = &lease;
        chunk
    });
    Response::from_parts(parts, Body::from_stream(stream))
}

fn record(response: Response, upstream: &str, started: Instant) -> Response {
    let status = response.status().as_u16().to_string();
    counter!(REQUESTS_TOTAL, "status" => status, "upstream" => upstream.to_string()).increment(1);
    histogram!(REQUEST_DURATION_SECONDS, "upstream" => upstream.to_string())
        .record(started.elapsed().as_secs_f64());
    response
}
