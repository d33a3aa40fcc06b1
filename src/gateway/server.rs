//! # HTTP Server Module
//!
//! One listener per `[servers.<name>]` block. Each listener owns a dispatcher built from
//! the locations its block lists, optionally terminates TLS, and serves HTTP/1.1 (plus
//! HTTP/2 when enabled) through hyper's auto-detecting connection builder.
//!
//! ## Shutdown
//!
//! Cancelling the server's `CancellationToken` stops every accept loop and asks every
//! open connection to finish its in-flight request and close. [`GatewayServer::run`]
//! then waits for connections to drain, bounded by `basic.grace_period`.
//!
//! ## Rust Concepts Used
//!
//! - `tokio::select!` to race accepts and connections against cancellation
//! - `TaskTracker` to wait for every spawned connection task
//! - Generic `serve_io` over any `AsyncRead + AsyncWrite` stream, plain or TLS

use axum::extract::ConnectInfo;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tower::ServiceExt;
use tracing::{debug, info, instrument, warn};

use crate::core::config::{Config, ServerConfig};
use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::InboundScheme;
use crate::gateway::dispatcher::Dispatcher;
use crate::gateway::tls::build_acceptor;
use crate::middleware::PluginFactory;
use crate::upstream::UpstreamManager;

/// Smallest HTTP/1 read buffer hyper accepts
const MIN_HEADER_BUFFER: usize = 8192;

/// Per-connection protocol settings taken from a server block
#[derive(Debug, Clone, Copy)]
struct ConnectionSettings {
    http2: bool,
    header_read_timeout: Duration,
    max_buf_size: Option<usize>,
}

impl ConnectionSettings {
    fn from_server(server: &ServerConfig) -> Self {
        Self {
            http2: server.enable_http2,
            header_read_timeout: server.read_timeout,
            max_buf_size: (server.max_header_bytes > 0)
                .then(|| server.max_header_bytes.max(MIN_HEADER_BUFFER)),
        }
    }

    fn builder(&self) -> auto::Builder<TokioExecutor> {
        let mut builder = auto::Builder::new(TokioExecutor::new());
        builder
            .http1()
            .timer(TokioTimer::new())
            .header_read_timeout(self.header_read_timeout)
            .keep_alive(true);
        if let Some(size) = self.max_buf_size {
            builder.http1().max_buf_size(size);
        }
        builder.http2().timer(TokioTimer::new());

        if self.http2 {
            builder
        } else {
            builder.http1_only()
        }
    }
}

/// What every connection accepted by one listener shares
#[derive(Clone)]
struct ConnectionContext {
    router: axum::Router,
    tls: Option<TlsAcceptor>,
    settings: ConnectionSettings,
}

struct Listener {
    name: String,
    tcp: TcpListener,
    local_addr: SocketAddr,
    context: ConnectionContext,
}

impl Listener {
    async fn bind(
        config: &Config,
        server: &ServerConfig,
        upstreams: &Arc<UpstreamManager>,
        factory: &PluginFactory,
    ) -> GatewayResult<Self> {
        let dispatcher = Dispatcher::for_server(config, server, Arc::clone(upstreams), factory)?;

        let tls = match server.tls_files() {
            Some((cert, key)) => Some(build_acceptor(cert, key, server.enable_http2)?),
            None => None,
        };

        let tcp = TcpListener::bind(server.addr).await.map_err(|e| GatewayError::Io {
            message: format!("server '{}': failed to bind {}: {}", server.name, server.addr, e),
        })?;
        let local_addr = tcp.local_addr()?;

        info!(
            server = %server.name,
            addr = %local_addr,
            tls = tls.is_some(),
            http2 = server.enable_http2,
            "🌐 Listening"
        );

        Ok(Self {
            name: server.name.clone(),
            tcp,
            local_addr,
            context: ConnectionContext {
                router: Arc::new(dispatcher).into_router(),
                tls,
                settings: ConnectionSettings::from_server(server),
            },
        })
    }

    #[instrument(skip_all, fields(server = %self.name, addr = %self.local_addr))]
    async fn serve(self, cancel: CancellationToken, tracker: TaskTracker) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = self.tcp.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(%peer, "Accepted connection");
                        tracker.spawn(handle_connection(stream, peer, self.context.clone(), cancel.clone()));
                    }
                    Err(e) => warn!(error = %e, "Failed to accept connection"),
                },
            }
        }
        info!("Listener stopped");
    }
}

async fn handle_connection(stream: TcpStream, peer: SocketAddr, context: ConnectionContext, cancel: CancellationToken) {
    let Some(acceptor) = context.tls.clone() else {
        return serve_io(TokioIo::new(stream), peer, InboundScheme::Http, context, cancel).await;
    };

    match tokio::time::timeout(context.settings.header_read_timeout, acceptor.accept(stream)).await {
        Ok(Ok(tls_stream)) => serve_io(TokioIo::new(tls_stream), peer, InboundScheme::Https, context, cancel).await,
        Ok(Err(e)) => debug!(%peer, error = %e, "TLS handshake failed"),
        Err(_) => debug!(%peer, "TLS handshake timed out"),
    }
}

async fn serve_io<I>(
    io: TokioIo<I>,
    peer: SocketAddr,
    scheme: InboundScheme,
    context: ConnectionContext,
    cancel: CancellationToken,
) where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let router = context.router;
    let service = service_fn(move |mut request: Request<Incoming>| {
        request.extensions_mut().insert(ConnectInfo(peer));
        request.extensions_mut().insert(scheme);
        router.clone().oneshot(request)
    });

    let builder = context.settings.builder();
    let connection = builder.serve_connection(io, service);
    tokio::pin!(connection);

    let result = tokio::select! {
        result = connection.as_mut() => result,
        _ = cancel.cancelled() => {
            connection.as_mut().graceful_shutdown();
            connection.await
        }
    };

    if let Err(e) = result {
        debug!(%peer, error = %e, "Connection closed with error");
    }
}

/// Every listener of one configuration, bound and ready to serve
pub struct GatewayServer {
    listeners: Vec<Listener>,
    upstreams: Arc<UpstreamManager>,
    cancel: CancellationToken,
    grace_period: Duration,
}

impl GatewayServer {
    /// Build the upstream pools, then bind one listener per server block
    pub async fn bind(config: &Config, factory: &PluginFactory) -> GatewayResult<Self> {
        let upstreams = Arc::new(UpstreamManager::from_config(config)?);

        let mut listeners = Vec::with_capacity(config.servers.len());
        for server in &config.servers {
            listeners.push(Listener::bind(config, server, &upstreams, factory).await?);
        }

        Ok(Self {
            listeners,
            upstreams,
            cancel: CancellationToken::new(),
            grace_period: config.basic.grace_period,
        })
    }

    /// Bound addresses, by server name
    pub fn local_addrs(&self) -> Vec<(String, SocketAddr)> {
        self.listeners
            .iter()
            .map(|listener| (listener.name.clone(), listener.local_addr))
            .collect()
    }

    pub fn upstreams(&self) -> &Arc<UpstreamManager> {
        &self.upstreams
    }

    /// Cancelling this token starts graceful shutdown
    pub fn shutdown_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Serve until the shutdown token is cancelled, then drain
    pub async fn run(self) -> GatewayResult<()> {
        let tracker = TaskTracker::new();
        for listener in self.listeners {
            tracker.spawn(listener.serve(self.cancel.clone(), tracker.clone()));
        }
        tracker.close();

        self.cancel.cancelled().await;
        info!("🛑 Shutting down; draining connections");
        self.upstreams.shutdown();

        match tokio::time::timeout(self.grace_period, tracker.wait()).await {
            Ok(()) => info!("✅ All connections drained"),
            Err(_) => warn!(
                grace_period = %humantime::format_duration(self.grace_period),
                remaining = tracker.len(),
                "Grace period elapsed with connections still open"
            ),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server(extra: &str) -> ServerConfig {
        let text = format!(
            "[upstreams.api]\naddrs = [\"10.0.0.1:80\"]\n[locations.api]\nupstream = \"api\"\n[servers.main]\naddr = \"127.0.0.1:0\"\nlocations = [\"api\"]\n{}",
            extra
        );
        Config::from_bytes(text.as_bytes()).unwrap().servers.remove(0)
    }

    #[test]
    fn test_header_buffer_has_floor() {
        let settings = ConnectionSettings::from_server(&server("max_header_bytes = 1024\n"));
        assert_eq!(settings.max_buf_size, Some(MIN_HEADER_BUFFER));

        let settings = ConnectionSettings::from_server(&server("max_header_bytes = 65536\n"));
        assert_eq!(settings.max_buf_size, Some(65536));

        let settings = ConnectionSettings::from_server(&server(""));
        assert_eq!(settings.max_buf_size, None);
    }

    #[test]
    fn test_read_timeout_bounds_header_read() {
        let settings = ConnectionSettings::from_server(&server("read_timeout = \"5s\"\n"));
        assert_eq!(settings.header_read_timeout, Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_bind_and_shutdown() {
        let text = r#"
[basic]
grace_period = "1s"

[upstreams.api]
addrs = ["127.0.0.1:9"]

[locations.api]
upstream = "api"

[servers.main]
addr = "127.0.0.1:0"
locations = ["api"]
"#;
        let config = Config::from_bytes(text.as_bytes()).unwrap();
        let server = GatewayServer::bind(&config, &PluginFactory::with_builtins())
            .await
            .unwrap();

        let addrs = server.local_addrs();
        assert_eq!(addrs.len(), 1);
        assert_ne!(addrs[0].1.port(), 0);

        let cancel = server.shutdown_token();
        let handle = tokio::spawn(server.run());
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
