// Per-request flow: match, plugins, forward
pub mod dispatcher;

// Outbound request construction and the upstream transport
pub mod forward;

// Listeners and connection handling
pub mod server;

// TLS termination
pub mod tls;

pub use dispatcher::Dispatcher;
pub use forward::{HttpTransport, UpstreamTransport};
pub use server::GatewayServer;
