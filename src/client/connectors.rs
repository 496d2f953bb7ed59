//! The three concrete connectors and their client aliases.

use super::core::{Client, Connector};
use crate::client::token_provider::{NoopTokenProvider, TokenProvider};
use crate::client::token_store::TokenStore;
use crate::error::Result;
use crate::shared::context::RequestContext;
use crate::shared::sse::SseTransport;
use crate::shared::stdio::ProcessTransport;
use crate::shared::streamable_http::{StreamableHttpConfig, StreamableHttpTransport};
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::process::ChildStderr;
use url::Url;

/// Client for a backend spawned as a local subprocess.
pub type StdioClient = Client<ProcessConnector>;
/// Client for a backend reached over an event stream.
pub type SseClient = Client<SseConnector>;
/// Client for a backend reached over streamable HTTP.
pub type StreamableHttpClient = Client<HttpConnector>;

/// Spawns the backend command on every connection attempt.
#[derive(Debug, Clone)]
pub struct ProcessConnector {
    command: String,
    args: Vec<String>,
    env: HashMap<String, String>,
    last_pid: Arc<parking_lot::Mutex<Option<u32>>>,
}

#[async_trait]
impl Connector for ProcessConnector {
    type Transport = ProcessTransport;
    const CAPTURES_STDERR: bool = true;

    fn target(&self) -> String {
        self.command.clone()
    }

    fn remote_url(&self) -> Option<&str> {
        None
    }

    async fn open(&self, _ctx: &RequestContext) -> Result<ProcessTransport> {
        let transport = ProcessTransport::spawn(&self.command, &self.args, &self.env)?;
        *self.last_pid.lock() = transport.pid();
        Ok(transport)
    }

    fn take_stderr(transport: &ProcessTransport) -> Option<ChildStderr> {
        transport.take_stderr()
    }
}

impl StdioClient {
    /// Client that runs `command` with `args`; `env` entries override the
    /// inherited environment.
    pub fn new(
        command: impl Into<String>,
        args: Vec<String>,
        env: HashMap<String, String>,
    ) -> Self {
        Client::with_connector(ProcessConnector {
            command: command.into(),
            args,
            env,
            last_pid: Arc::new(parking_lot::Mutex::new(None)),
        })
    }

    /// Process id of the most recently spawned backend, if any.
    pub fn last_pid(&self) -> Option<u32> {
        *self.connector().last_pid.lock()
    }
}

/// Opens an event stream to a remote backend.
#[derive(Debug, Clone)]
pub struct SseConnector {
    url: Url,
    headers: HashMap<String, String>,
}

#[async_trait]
impl Connector for SseConnector {
    type Transport = SseTransport;

    fn target(&self) -> String {
        self.url.to_string()
    }

    fn remote_url(&self) -> Option<&str> {
        Some(self.url.as_str())
    }

    async fn open(&self, ctx: &RequestContext) -> Result<SseTransport> {
        SseTransport::connect(self.url.clone(), &self.headers, ctx).await
    }
}

impl SseClient {
    /// Client for the event stream at `url`.
    pub fn new(url: Url, headers: HashMap<String, String>) -> Self {
        Client::with_connector(SseConnector { url, headers })
    }
}

/// Connects to a streamable HTTP backend.
#[derive(Clone)]
pub struct HttpConnector {
    config: StreamableHttpConfig,
}

impl fmt::Debug for HttpConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpConnector")
            .field("config", &self.config)
            .finish()
    }
}

#[async_trait]
impl Connector for HttpConnector {
    type Transport = StreamableHttpTransport;

    fn target(&self) -> String {
        self.config.url.to_string()
    }

    fn remote_url(&self) -> Option<&str> {
        Some(self.config.url.as_str())
    }

    async fn open(&self, _ctx: &RequestContext) -> Result<StreamableHttpTransport> {
        StreamableHttpTransport::new(self.config.clone())
    }
}

impl StreamableHttpClient {
    /// Client for `url` with static headers only.
    pub fn new(url: Url, headers: HashMap<String, String>) -> Self {
        Self::with_config(StreamableHttpConfig::new(url).with_headers(headers))
    }

    /// Client whose Authorization header is recomputed from `provider` on
    /// every request.
    pub fn with_token_provider(
        url: Url,
        headers: HashMap<String, String>,
        provider: Arc<dyn TokenProvider>,
    ) -> Self {
        Self::with_config(
            StreamableHttpConfig::new(url)
                .with_headers(headers)
                .with_token_provider(provider),
        )
    }

    /// Client backed by a token store, e.g. a session-scoped OAuth adapter.
    pub fn with_token_store(
        url: Url,
        headers: HashMap<String, String>,
        store: Arc<dyn TokenStore>,
    ) -> Self {
        Self::with_config(
            StreamableHttpConfig::new(url)
                .with_headers(headers)
                .with_token_provider(Arc::new(NoopTokenProvider))
                .with_token_store(store),
        )
    }

    /// Client from a full transport configuration.
    pub fn with_config(config: StreamableHttpConfig) -> Self {
        Client::with_connector(HttpConnector { config })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::McpClient;
    use crate::error::Error;

    #[tokio::test]
    async fn http_client_is_lazy() {
        let client = StreamableHttpClient::new(
            Url::parse("http://example.com/mcp").unwrap(),
            HashMap::new(),
        );
        let err = client
            .list_tools(&RequestContext::background())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotConnected));
        assert!(client.as_stderr_source().is_none());
    }

    #[tokio::test]
    async fn missing_command_is_a_handshake_failure() {
        let client = StdioClient::new(
            "/nonexistent/definitely-not-a-backend",
            Vec::new(),
            HashMap::new(),
        );
        let err = client
            .initialize(&RequestContext::background())
            .await
            .unwrap_err();
        assert!(err.is_handshake_failed());
        assert_eq!(client.last_pid(), None);
    }

    #[tokio::test]
    async fn stdio_client_offers_stderr_only_while_connected() {
        let client = StdioClient::new("true", Vec::new(), HashMap::new());
        let source = client.as_stderr_source().expect("stdio exposes stderr");
        assert!(source.take_stderr().is_none());
    }
}
