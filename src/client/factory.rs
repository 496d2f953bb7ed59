//! Builds the right client for a declarative connection configuration.

use super::backend::BackendClient;
use super::config::{ServerDefinition, TransportDefinition};
use super::connectors::{SseClient, StdioClient, StreamableHttpClient};
use crate::client::token_provider::{NoopTokenProvider, TokenProvider};
use crate::client::token_store::TokenStore;
use crate::error::{Error, Result};
use crate::shared::streamable_http::StreamableHttpConfig;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use url::Url;

/// Transport kinds the factory can build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerType {
    /// Local subprocess
    Stdio,
    /// Streamable HTTP
    StreamableHttp,
    /// Event stream
    Sse,
}

impl FromStr for ServerType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "stdio" => Ok(ServerType::Stdio),
            "streamable-http" => Ok(ServerType::StreamableHttp),
            "sse" => Ok(ServerType::Sse),
            other => Err(Error::TransportCreation(format!(
                "unsupported server type: {}",
                other
            ))),
        }
    }
}

impl fmt::Display for ServerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ServerType::Stdio => "stdio",
            ServerType::StreamableHttp => "streamable-http",
            ServerType::Sse => "sse",
        })
    }
}

/// Everything needed to build any kind of client. Fields irrelevant to the
/// chosen transport are ignored.
#[derive(Clone, Default)]
pub struct McpClientConfig {
    /// Executable for local-process backends
    pub command: Option<String>,
    /// Arguments for local-process backends
    pub args: Vec<String>,
    /// Extra environment for local-process backends
    pub env: HashMap<String, String>,
    /// Endpoint for remote backends
    pub url: Option<String>,
    /// Static headers for remote backends
    pub headers: HashMap<String, String>,
    /// Per-request token provider (streamable HTTP only)
    pub token_provider: Option<Arc<dyn TokenProvider>>,
    /// Token store (streamable HTTP only)
    pub token_store: Option<Arc<dyn TokenStore>>,
    /// Custom HTTP client (streamable HTTP only)
    pub http_client: Option<reqwest::Client>,
}

impl fmt::Debug for McpClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("McpClientConfig")
            .field("command", &self.command)
            .field("args", &self.args)
            .field("env", &self.env.keys().collect::<Vec<_>>())
            .field("url", &self.url)
            .field("headers", &self.headers.keys().collect::<Vec<_>>())
            .field("token_provider", &self.token_provider.is_some())
            .field("token_store", &self.token_store.is_some())
            .field("http_client", &self.http_client.is_some())
            .finish()
    }
}

impl McpClientConfig {
    /// Configuration for a local-process backend.
    pub fn stdio(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: Some(command.into()),
            args,
            ..Default::default()
        }
    }

    /// Configuration for a remote backend.
    pub fn remote(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Default::default()
        }
    }

    /// Add an environment variable.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Add a static header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Set the per-request token provider.
    pub fn with_token_provider(mut self, provider: Arc<dyn TokenProvider>) -> Self {
        self.token_provider = Some(provider);
        self
    }

    /// Set the token store.
    pub fn with_token_store(mut self, store: Arc<dyn TokenStore>) -> Self {
        self.token_store = Some(store);
        self
    }

    /// Use a caller-supplied HTTP client.
    pub fn with_http_client(mut self, client: reqwest::Client) -> Self {
        self.http_client = Some(client);
        self
    }

    fn parsed_url(&self, server_type: ServerType) -> Result<Url> {
        let url = self
            .url
            .as_deref()
            .filter(|u| !u.is_empty())
            .ok_or_else(|| {
                Error::TransportCreation(format!("URL is required for {} servers", server_type))
            })?;
        Url::parse(url)
            .map_err(|e| Error::TransportCreation(format!("invalid URL {}: {}", url, e)))
    }
}

/// Build an unconnected client for `server_type`.
///
/// Configuration problems are reported as [`Error::TransportCreation`]
/// before any process is spawned or socket opened.
pub fn new_client_from_type(server_type: &str, config: McpClientConfig) -> Result<BackendClient> {
    let server_type: ServerType = server_type.parse()?;
    match server_type {
        ServerType::Stdio => {
            let command = config
                .command
                .filter(|c| !c.is_empty())
                .ok_or_else(|| {
                    Error::TransportCreation("command is required for stdio servers".into())
                })?;
            Ok(StdioClient::new(command, config.args, config.env).into())
        },
        ServerType::Sse => {
            let url = config.parsed_url(server_type)?;
            if config.http_client.is_some() {
                tracing::warn!(url = %url, "custom HTTP client is not supported for sse servers; ignoring");
            }
            Ok(SseClient::new(url, config.headers).into())
        },
        ServerType::StreamableHttp => {
            let url = config.parsed_url(server_type)?;
            let mut http = StreamableHttpConfig::new(url)
                .with_headers(config.headers)
                .with_token_provider(
                    config
                        .token_provider
                        .unwrap_or_else(|| Arc::new(NoopTokenProvider)),
                );
            if let Some(store) = config.token_store {
                http = http.with_token_store(store);
            }
            if let Some(client) = config.http_client {
                http = http.with_http_client(client);
            }
            Ok(StreamableHttpClient::with_config(http).into())
        },
    }
}

/// Build an unconnected client from a stored definition.
pub fn new_client_from_definition(
    definition: &ServerDefinition,
    token_provider: Option<Arc<dyn TokenProvider>>,
) -> Result<BackendClient> {
    let (server_type, mut config) = match &definition.transport {
        TransportDefinition::Stdio { command, args, env } => {
            let mut config = McpClientConfig::stdio(command.clone(), args.clone());
            config.env = env.clone();
            (ServerType::Stdio, config)
        },
        TransportDefinition::StreamableHttp { url, headers } => {
            let mut config = McpClientConfig::remote(url.clone());
            config.headers = headers.clone();
            (ServerType::StreamableHttp, config)
        },
        TransportDefinition::Sse { url, headers } => {
            let mut config = McpClientConfig::remote(url.clone());
            config.headers = headers.clone();
            (ServerType::Sse, config)
        },
    };
    config.token_provider = token_provider;
    tracing::debug!(server = %definition.name, %server_type, "building backend client");
    new_client_from_type(&server_type.to_string(), config)
}
