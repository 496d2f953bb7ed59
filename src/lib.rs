//! # pmcp-gateway
//!
//! A multi-transport MCP client layer and an OAuth-protected gateway that
//! forwards the caller's identity to backend servers (single sign-on).
//!
//! ## Client layer
//!
//! Every backend connection implements [`McpClient`], whichever transport
//! carries it:
//!
//! - [`StdioClient`] spawns a local process and speaks newline-delimited
//!   JSON-RPC over its standard streams
//! - [`SseClient`] uses a long-lived event stream plus a POST endpoint
//! - [`StreamableHttpClient`] POSTs to a single endpoint and asks a
//!   [`TokenProvider`] for a fresh bearer on every request
//!
//! ```rust,no_run
//! use pmcp_gateway::{McpClient, RequestContext, StdioClient};
//! use std::collections::HashMap;
//!
//! # async fn example() -> pmcp_gateway::Result<()> {
//! let client = StdioClient::new("my-mcp-server", vec!["--stdio".to_string()], HashMap::new());
//! let ctx = RequestContext::background();
//! client.initialize(&ctx).await?;
//! for tool in client.list_tools(&ctx).await? {
//!     println!("{}", tool.name);
//! }
//! client.close().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Gateway
//!
//! [`server::OAuthGateway`] validates inbound bearer tokens, resolves the
//! caller's upstream token, and triggers SSO propagation once per session
//! and token.

pub mod client;
pub mod error;
pub mod server;
pub mod shared;
pub mod types;

pub use client::{
    BackendClient, ConnectionState, McpClient, McpClientConfig, ServerType, SseClient, StderrSource,
    StdioClient, StreamableHttpClient, Token, TokenProvider, TokenStore,
};
pub use error::{Error, Result, TransportError};
pub use shared::RequestContext;

use std::time::Duration;

/// Protocol version sent in the handshake.
pub const DEFAULT_PROTOCOL_VERSION: &str = "2024-11-05";

/// Client name reported in the handshake.
pub const CLIENT_NAME: &str = "pmcp-gateway";

/// Client version reported in the handshake.
pub const CLIENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Deadline applied to a handshake when the caller's context has none.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Install a `tracing` formatter honouring `RUST_LOG` (default `info`).
///
/// Does nothing if a global subscriber is already installed.
#[cfg(feature = "logging")]
pub fn init_logging() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
