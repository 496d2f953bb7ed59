//! Connection core shared by every transport-specific client.
//!
//! A [`Client`] owns a [`Connector`] that knows how to open one kind of
//! transport, and implements the full [`McpClient`] contract on top of it:
//! state machine, handshake, request ids, pagination and error
//! classification.

use super::auth_challenge::check_for_auth_required;
use super::{ConnectionState, McpClient, StderrSource};
use crate::error::{Error, Result};
use crate::shared::context::RequestContext;
use crate::shared::transport::Transport;
use crate::types::{
    CallToolRequest, CallToolResult, GetPromptRequest, GetPromptResult, Implementation,
    InitializeRequest, InitializeResult, JSONRPCNotification, JSONRPCRequest, ListPromptsResult,
    ListResourcesResult, ListToolsResult, PaginatedRequest, PromptInfo, ReadResourceRequest,
    ReadResourceResult, ResourceInfo, ToolInfo,
};
use crate::DEFAULT_HANDSHAKE_TIMEOUT;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::process::ChildStderr;
use tokio::sync::RwLock;

/// Opens one kind of transport.
#[async_trait]
pub trait Connector: Send + Sync + fmt::Debug + 'static {
    /// Transport produced by [`Connector::open`].
    type Transport: Transport + 'static;

    /// Whether the transport exposes a subprocess stderr stream.
    const CAPTURES_STDERR: bool = false;

    /// Command or URL, used in error messages and logs.
    fn target(&self) -> String;

    /// URL for remote transports; enables 401 detection.
    fn remote_url(&self) -> Option<&str>;

    /// Create the transport. Called once per `initialize` attempt.
    async fn open(&self, ctx: &RequestContext) -> Result<Self::Transport>;

    /// Take the stderr stream from an open transport.
    fn take_stderr(_transport: &Self::Transport) -> Option<ChildStderr> {
        None
    }
}

/// A protocol client over the transport opened by `C`.
pub struct Client<C: Connector> {
    connector: C,
    transport: RwLock<Option<Arc<C::Transport>>>,
    state: parking_lot::RwLock<ConnectionState>,
    server: parking_lot::RwLock<Option<InitializeResult>>,
    next_id: AtomicI64,
    client_info: Implementation,
}

impl<C: Connector> fmt::Debug for Client<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("connector", &self.connector)
            .field("state", &*self.state.read())
            .finish()
    }
}

impl<C: Connector> Client<C> {
    /// Wrap a connector. Nothing is opened until `initialize`.
    pub fn with_connector(connector: C) -> Self {
        Self {
            connector,
            transport: RwLock::new(None),
            state: parking_lot::RwLock::new(ConnectionState::Disconnected),
            server: parking_lot::RwLock::new(None),
            next_id: AtomicI64::new(1),
            client_info: Implementation::default(),
        }
    }

    /// Override the identity sent during the handshake.
    pub fn with_client_info(mut self, client_info: Implementation) -> Self {
        self.client_info = client_info;
        self
    }

    /// The connector.
    pub fn connector(&self) -> &C {
        &self.connector
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.write() = state;
    }

    async fn send(
        &self,
        transport: &C::Transport,
        method: &str,
        params: Option<Value>,
        ctx: &RequestContext,
    ) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = JSONRPCRequest::new(id, method, params);
        tracing::trace!(backend = %self.connector.target(), id, method, "sending request");
        transport.request(request, ctx).await?.into_result()
    }

    async fn send_typed<R: DeserializeOwned>(
        &self,
        transport: &C::Transport,
        method: &str,
        params: Option<Value>,
        ctx: &RequestContext,
    ) -> Result<R> {
        let value = self.send(transport, method, params, ctx).await?;
        Ok(serde_json::from_value(value)?)
    }

    async fn handshake(
        &self,
        transport: &C::Transport,
        ctx: &RequestContext,
    ) -> Result<InitializeResult> {
        let request = InitializeRequest::new(self.client_info.clone());
        let result: InitializeResult = self
            .send_typed(
                transport,
                "initialize",
                Some(serde_json::to_value(&request)?),
                ctx,
            )
            .await?;

        transport.set_protocol_version(&result.protocol_version);
        transport
            .notify(
                JSONRPCNotification::new("notifications/initialized", None),
                ctx,
            )
            .await?;
        Ok(result)
    }

    fn auth_checked(&self, err: Error) -> Error {
        match self.connector.remote_url() {
            Some(url) => check_for_auth_required(err, url),
            None => err,
        }
    }

    fn handshake_error(&self, err: Error) -> Error {
        match self.auth_checked(err) {
            err @ (Error::AuthRequired(_) | Error::Cancelled | Error::TransportCreation(_)) => err,
            other => Error::HandshakeFailed {
                target: self.connector.target(),
                source: Box::new(other),
            },
        }
    }

    fn operation_error(&self, operation: &'static str, err: Error) -> Error {
        match self.auth_checked(err) {
            err @ (Error::AuthRequired(_) | Error::Cancelled | Error::NotConnected) => err,
            other => Error::Operation {
                operation,
                source: Box::new(other),
            },
        }
    }

    async fn call<R: DeserializeOwned>(
        &self,
        operation: &'static str,
        method: &str,
        params: Option<Value>,
        ctx: &RequestContext,
    ) -> Result<R> {
        let guard = self.transport.read().await;
        let transport = guard.as_deref().ok_or(Error::NotConnected)?;
        self.send_typed(transport, method, params, ctx)
            .await
            .map_err(|e| self.operation_error(operation, e))
    }

    async fn list_all<R, I>(
        &self,
        operation: &'static str,
        method: &str,
        ctx: &RequestContext,
        split: fn(R) -> (Vec<I>, Option<String>),
    ) -> Result<Vec<I>>
    where
        R: DeserializeOwned,
    {
        let guard = self.transport.read().await;
        let transport = guard.as_deref().ok_or(Error::NotConnected)?;

        let mut items = Vec::new();
        let mut cursor: Option<String> = None;
        let mut seen = HashSet::new();
        loop {
            let params = serde_json::to_value(PaginatedRequest {
                cursor: cursor.take(),
            })?;
            let page: R = self
                .send_typed(transport, method, Some(params), ctx)
                .await
                .map_err(|e| self.operation_error(operation, e))?;

            let (mut page_items, next) = split(page);
            items.append(&mut page_items);

            match next.filter(|c| !c.is_empty()) {
                Some(next) if seen.insert(next.clone()) => cursor = Some(next),
                Some(next) => {
                    tracing::warn!(
                        backend = %self.connector.target(),
                        method,
                        cursor = %next,
                        "server repeated a pagination cursor; stopping"
                    );
                    break;
                },
                None => break,
            }
        }
        Ok(items)
    }
}

/// Stringify prompt arguments: strings pass through, anything else is sent
/// as its JSON text.
fn prompt_arguments(arguments: HashMap<String, Value>) -> HashMap<String, String> {
    arguments
        .into_iter()
        .map(|(key, value)| {
            let value = match value {
                Value::String(s) => s,
                other => other.to_string(),
            };
            (key, value)
        })
        .collect()
}

impl<C: Connector> StderrSource for Client<C> {
    fn take_stderr(&self) -> Option<ChildStderr> {
        // a pending initialize or close holds the write lock
        let guard = self.transport.try_read().ok()?;
        guard.as_deref().and_then(C::take_stderr)
    }
}

#[async_trait]
impl<C: Connector> McpClient for Client<C> {
    async fn initialize(&self, ctx: &RequestContext) -> Result<()> {
        let mut slot = self.transport.write().await;
        if slot.is_some() {
            tracing::debug!(backend = %self.connector.target(), "already initialized");
            return Ok(());
        }

        self.set_state(ConnectionState::Connecting);
        let ctx = ctx.child().with_default_deadline(DEFAULT_HANDSHAKE_TIMEOUT);

        let transport = match ctx.run(self.connector.open(&ctx)).await {
            Ok(transport) => transport,
            Err(e) => {
                self.set_state(ConnectionState::Disconnected);
                return Err(self.handshake_error(e));
            },
        };

        match self.handshake(&transport, &ctx).await {
            Ok(result) => {
                tracing::info!(
                    backend = %self.connector.target(),
                    transport = transport.transport_type(),
                    server = %result.server_info.name,
                    protocol_version = %result.protocol_version,
                    "connected to backend"
                );
                *self.server.write() = Some(result);
                *slot = Some(Arc::new(transport));
                self.set_state(ConnectionState::Connected);
                Ok(())
            },
            Err(e) => {
                if let Err(close_err) = transport.close().await {
                    tracing::warn!(
                        backend = %self.connector.target(),
                        error = %close_err,
                        "failed to release transport after handshake failure"
                    );
                }
                self.set_state(ConnectionState::Disconnected);
                Err(self.handshake_error(e))
            },
        }
    }

    async fn close(&self) -> Result<()> {
        let mut slot = self.transport.write().await;
        let transport = slot.take();
        *self.server.write() = None;
        self.set_state(ConnectionState::Disconnected);

        match transport {
            Some(transport) => {
                tracing::debug!(backend = %self.connector.target(), "closing backend connection");
                transport.close().await
            },
            None => Ok(()),
        }
    }

    async fn list_tools(&self, ctx: &RequestContext) -> Result<Vec<ToolInfo>> {
        self.list_all("list_tools", "tools/list", ctx, |page: ListToolsResult| {
            (page.tools, page.next_cursor)
        })
        .await
    }

    async fn call_tool(
        &self,
        ctx: &RequestContext,
        name: &str,
        arguments: Value,
    ) -> Result<CallToolResult> {
        let params = serde_json::to_value(CallToolRequest {
            name: name.to_string(),
            arguments,
        })?;
        self.call("call_tool", "tools/call", Some(params), ctx).await
    }

    async fn list_resources(&self, ctx: &RequestContext) -> Result<Vec<ResourceInfo>> {
        self.list_all(
            "list_resources",
            "resources/list",
            ctx,
            |page: ListResourcesResult| (page.resources, page.next_cursor),
        )
        .await
    }

    async fn read_resource(&self, ctx: &RequestContext, uri: &str) -> Result<ReadResourceResult> {
        let params = serde_json::to_value(ReadResourceRequest {
            uri: uri.to_string(),
        })?;
        self.call("read_resource", "resources/read", Some(params), ctx)
            .await
    }

    async fn list_prompts(&self, ctx: &RequestContext) -> Result<Vec<PromptInfo>> {
        self.list_all("list_prompts", "prompts/list", ctx, |page: ListPromptsResult| {
            (page.prompts, page.next_cursor)
        })
        .await
    }

    async fn get_prompt(
        &self,
        ctx: &RequestContext,
        name: &str,
        arguments: HashMap<String, Value>,
    ) -> Result<GetPromptResult> {
        let params = serde_json::to_value(GetPromptRequest {
            name: name.to_string(),
            arguments: prompt_arguments(arguments),
        })?;
        self.call("get_prompt", "prompts/get", Some(params), ctx)
            .await
    }

    async fn ping(&self, ctx: &RequestContext) -> Result<()> {
        let _: Value = self.call("ping", "ping", None, ctx).await?;
        Ok(())
    }

    fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    fn server_info(&self) -> Option<InitializeResult> {
        self.server.read().clone()
    }

    fn as_stderr_source(&self) -> Option<&dyn StderrSource> {
        if C::CAPTURES_STDERR {
            Some(self)
        } else {
            None
        }
    }
}
