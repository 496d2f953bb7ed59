//! Closed set of backend clients.

use super::connectors::{SseClient, StdioClient, StreamableHttpClient};
use super::{ConnectionState, McpClient, StderrSource};
use crate::error::Result;
use crate::shared::context::RequestContext;
use crate::types::{
    CallToolResult, GetPromptResult, InitializeResult, PromptInfo, ReadResourceResult,
    ResourceInfo, ToolInfo,
};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;

/// One backend connection over any of the supported transports.
#[derive(Debug)]
pub enum BackendClient {
    /// Local subprocess over stdin/stdout
    LocalProcess(StdioClient),
    /// Remote server over an event stream
    EventStream(SseClient),
    /// Remote server over streamable HTTP
    StreamingHttp(StreamableHttpClient),
}

macro_rules! delegate {
    ($self:ident, $client:ident => $body:expr) => {
        match $self {
            BackendClient::LocalProcess($client) => $body,
            BackendClient::EventStream($client) => $body,
            BackendClient::StreamingHttp($client) => $body,
        }
    };
}

impl BackendClient {
    /// Short transport name.
    pub fn transport_type(&self) -> &'static str {
        match self {
            BackendClient::LocalProcess(_) => "stdio",
            BackendClient::EventStream(_) => "sse",
            BackendClient::StreamingHttp(_) => "streamable-http",
        }
    }
}

impl From<StdioClient> for BackendClient {
    fn from(client: StdioClient) -> Self {
        BackendClient::LocalProcess(client)
    }
}

impl From<SseClient> for BackendClient {
    fn from(client: SseClient) -> Self {
        BackendClient::EventStream(client)
    }
}

impl From<StreamableHttpClient> for BackendClient {
    fn from(client: StreamableHttpClient) -> Self {
        BackendClient::StreamingHttp(client)
    }
}

#[async_trait]
impl McpClient for BackendClient {
    async fn initialize(&self, ctx: &RequestContext) -> Result<()> {
        delegate!(self, c => c.initialize(ctx).await)
    }

    async fn close(&self) -> Result<()> {
        delegate!(self, c => c.close().await)
    }

    async fn list_tools(&self, ctx: &RequestContext) -> Result<Vec<ToolInfo>> {
        delegate!(self, c => c.list_tools(ctx).await)
    }

    async fn call_tool(
        &self,
        ctx: &RequestContext,
        name: &str,
        arguments: Value,
    ) -> Result<CallToolResult> {
        delegate!(self, c => c.call_tool(ctx, name, arguments).await)
    }

    async fn list_resources(&self, ctx: &RequestContext) -> Result<Vec<ResourceInfo>> {
        delegate!(self, c => c.list_resources(ctx).await)
    }

    async fn read_resource(&self, ctx: &RequestContext, uri: &str) -> Result<ReadResourceResult> {
        delegate!(self, c => c.read_resource(ctx, uri).await)
    }

    async fn list_prompts(&self, ctx: &RequestContext) -> Result<Vec<PromptInfo>> {
        delegate!(self, c => c.list_prompts(ctx).await)
    }

    async fn get_prompt(
        &self,
        ctx: &RequestContext,
        name: &str,
        arguments: HashMap<String, Value>,
    ) -> Result<GetPromptResult> {
        delegate!(self, c => c.get_prompt(ctx, name, arguments).await)
    }

    async fn ping(&self, ctx: &RequestContext) -> Result<()> {
        delegate!(self, c => c.ping(ctx).await)
    }

    fn state(&self) -> ConnectionState {
        delegate!(self, c => c.state())
    }

    fn server_info(&self) -> Option<InitializeResult> {
        delegate!(self, c => c.server_info())
    }

    fn as_stderr_source(&self) -> Option<&dyn StderrSource> {
        delegate!(self, c => c.as_stderr_source())
    }
}
