//! Backend client layer.
//!
//! [`McpClient`] is the one contract every backend connection satisfies,
//! whatever transport carries it. The gateway and the SSO connector only
//! ever see this trait (or the [`BackendClient`] enum that wraps the three
//! concrete clients).

use crate::error::Result;
use crate::shared::context::RequestContext;
use crate::types::{
    CallToolResult, GetPromptResult, InitializeResult, PromptInfo, ReadResourceResult,
    ResourceInfo, ToolInfo,
};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use tokio::process::ChildStderr;

pub mod auth_challenge;
pub mod backend;
pub mod config;
pub mod connectors;
pub mod core;
pub mod factory;
pub mod token_provider;
pub mod token_store;

pub use auth_challenge::{check_for_auth_required, parse_www_authenticate, AuthChallenge, AuthRequiredError};
pub use backend::BackendClient;
pub use config::{DefinitionStore, ServerDefinition, ServerDefinitions, TransportDefinition};
pub use connectors::{
    HttpConnector, ProcessConnector, SseClient, SseConnector, StdioClient, StreamableHttpClient,
};
pub use self::core::{Client, Connector};
pub use factory::{new_client_from_definition, new_client_from_type, McpClientConfig, ServerType};
pub use token_provider::{FnTokenProvider, NoopTokenProvider, StaticTokenProvider, Token, TokenProvider};
pub use token_store::{FullToken, OAuthHandler, SessionTokenStore, TokenStore, TokenStoreError};

/// Lifecycle state of one backend connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No transport; data operations fail with `NotConnected`.
    #[default]
    Disconnected,
    /// A handshake is in progress.
    Connecting,
    /// Handshake complete; data operations are allowed.
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        };
        f.write_str(name)
    }
}

/// Access to a backend subprocess's diagnostic stream.
pub trait StderrSource: Send + Sync {
    /// Take the stderr stream. `None` when not connected or already taken.
    fn take_stderr(&self) -> Option<ChildStderr>;
}

/// Protocol client contract shared by all transports.
///
/// Data operations may run concurrently with each other. `initialize` and
/// `close` are exclusive with everything else on the same client.
#[async_trait]
pub trait McpClient: Send + Sync + fmt::Debug {
    /// Perform the protocol handshake. A no-op while already connected.
    ///
    /// A 10 second deadline is applied when `ctx` carries none.
    async fn initialize(&self, ctx: &RequestContext) -> Result<()>;

    /// Release the transport. A no-op while disconnected.
    async fn close(&self) -> Result<()>;

    /// List every tool, following pagination cursors.
    async fn list_tools(&self, ctx: &RequestContext) -> Result<Vec<ToolInfo>>;

    /// Invoke a tool.
    async fn call_tool(
        &self,
        ctx: &RequestContext,
        name: &str,
        arguments: Value,
    ) -> Result<CallToolResult>;

    /// List every resource, following pagination cursors.
    async fn list_resources(&self, ctx: &RequestContext) -> Result<Vec<ResourceInfo>>;

    /// Read one resource.
    async fn read_resource(&self, ctx: &RequestContext, uri: &str) -> Result<ReadResourceResult>;

    /// List every prompt, following pagination cursors.
    async fn list_prompts(&self, ctx: &RequestContext) -> Result<Vec<PromptInfo>>;

    /// Render a prompt. Non-string argument values are sent in their JSON
    /// text form.
    async fn get_prompt(
        &self,
        ctx: &RequestContext,
        name: &str,
        arguments: HashMap<String, Value>,
    ) -> Result<GetPromptResult>;

    /// Liveness check.
    async fn ping(&self, ctx: &RequestContext) -> Result<()>;

    /// Current lifecycle state.
    fn state(&self) -> ConnectionState;

    /// What the server reported during the handshake, while connected.
    fn server_info(&self) -> Option<InitializeResult>;

    /// Stderr access; only local-process clients provide it.
    fn as_stderr_source(&self) -> Option<&dyn StderrSource> {
        None
    }
}
