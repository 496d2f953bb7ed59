//! Streamable HTTP transport.
//!
//! Every message is POSTed to a single endpoint. The server answers with a
//! JSON body (single message or batch) or an SSE stream carrying the
//! response. Headers are assembled per request: static headers first, then
//! the dynamic bearer token, then the session id and negotiated protocol
//! version.

use crate::client::token_provider::{authorization_header, NoopTokenProvider, TokenProvider};
use crate::client::token_store::{TokenStore, TokenStoreError};
use crate::error::{Error, Result, TransportError};
use crate::shared::context::RequestContext;
use crate::shared::http_constants::{
    ACCEPT_STREAMABLE, APPLICATION_JSON, MCP_PROTOCOL_VERSION, MCP_SESSION_ID, TEXT_EVENT_STREAM,
};
use crate::shared::http_utils::{header_map, redact_authorization};
use crate::shared::sse_parser::SseParser;
use crate::shared::transport::Transport;
use crate::types::{
    IncomingMessage, JSONRPCNotification, JSONRPCRequest, JSONRPCResponse, RequestId,
};
use async_trait::async_trait;
use futures::StreamExt;
use http::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE, WWW_AUTHENTICATE};
use http::StatusCode;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

/// How long the session-terminating DELETE may take on close.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Configuration for [`StreamableHttpTransport`].
#[derive(Clone)]
pub struct StreamableHttpConfig {
    /// The HTTP endpoint URL
    pub url: Url,
    /// Static headers sent with every request
    pub headers: HashMap<String, String>,
    /// Queried for a bearer token on every request
    pub token_provider: Arc<dyn TokenProvider>,
    /// Optional token store consulted after the provider
    pub token_store: Option<Arc<dyn TokenStore>>,
    /// Caller-supplied client, e.g. with custom TLS roots
    pub http_client: Option<reqwest::Client>,
}

impl StreamableHttpConfig {
    /// Configuration with no headers and no token.
    pub fn new(url: Url) -> Self {
        Self {
            url,
            headers: HashMap::new(),
            token_provider: Arc::new(NoopTokenProvider),
            token_store: None,
            http_client: None,
        }
    }

    /// Add a static header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Replace the static header set.
    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    /// Set the dynamic token provider.
    pub fn with_token_provider(mut self, provider: Arc<dyn TokenProvider>) -> Self {
        self.token_provider = provider;
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
}

impl fmt::Debug for StreamableHttpConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamableHttpConfig")
            .field("url", &self.url.as_str())
            .field("headers", &self.headers.keys().collect::<Vec<_>>())
            .field("token_store", &self.token_store.is_some())
            .field("http_client", &self.http_client.is_some())
            .finish()
    }
}

/// A streamable HTTP transport.
pub struct StreamableHttpTransport {
    url: Url,
    static_headers: HeaderMap,
    token_provider: Arc<dyn TokenProvider>,
    token_store: Option<Arc<dyn TokenStore>>,
    client: reqwest::Client,
    session_id: RwLock<Option<String>>,
    protocol_version: RwLock<Option<String>>,
}

impl fmt::Debug for StreamableHttpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamableHttpTransport")
            .field("url", &self.url.as_str())
            .field("session_id", &self.session_id.read().is_some())
            .field("protocol_version", &*self.protocol_version.read())
            .finish()
    }
}

impl StreamableHttpTransport {
    /// Create a transport. No request is sent until the first message.
    pub fn new(config: StreamableHttpConfig) -> Result<Self> {
        let static_headers = header_map(&config.headers)?;
        Ok(Self {
            url: config.url,
            static_headers,
            token_provider: config.token_provider,
            token_store: config.token_store,
            client: config.http_client.unwrap_or_default(),
            session_id: RwLock::new(None),
            protocol_version: RwLock::new(None),
        })
    }

    /// Endpoint URL.
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Session id assigned by the server, if any.
    pub fn session_id(&self) -> Option<String> {
        self.session_id.read().clone()
    }

    /// Headers for the next request. The token provider is called every time.
    pub async fn request_headers(&self, ctx: &RequestContext) -> Result<HeaderMap> {
        let mut headers = self.static_headers.clone();

        if let Some(value) = authorization_header(self.token_provider.as_ref(), ctx).await {
            headers.insert(AUTHORIZATION, auth_header_value(&value)?);
        }

        if let Some(store) = &self.token_store {
            match store.get_token(ctx).await {
                Ok(token) => {
                    headers.insert(AUTHORIZATION, auth_header_value(&token.to_header_value())?);
                },
                Err(TokenStoreError::NoToken) => {
                    return Err(TransportError::NoToken.into());
                },
                Err(TokenStoreError::Other(message)) => {
                    return Err(Error::Authentication(message));
                },
            }
        }

        if let Some(session_id) = self.session_id.read().as_deref() {
            if let Ok(value) = HeaderValue::from_str(session_id) {
                headers.insert(MCP_SESSION_ID, value);
            }
        }
        if let Some(version) = self.protocol_version.read().as_deref() {
            if let Ok(value) = HeaderValue::from_str(version) {
                headers.insert(MCP_PROTOCOL_VERSION, value);
            }
        }

        Ok(headers)
    }

    async fn post(&self, body: Vec<u8>, ctx: &RequestContext) -> Result<reqwest::Response> {
        let headers = self.request_headers(ctx).await?;
        if let Some(auth) = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok()) {
            tracing::trace!(url = %self.url, authorization = %redact_authorization(auth), "POST");
        }

        let response = self
            .client
            .post(self.url.clone())
            .headers(headers)
            .header(CONTENT_TYPE, APPLICATION_JSON)
            .header(ACCEPT, ACCEPT_STREAMABLE)
            .body(body)
            .send()
            .await
            .map_err(TransportError::from)?;

        self.capture_session(&response);
        check_status(response).await
    }

    fn capture_session(&self, response: &reqwest::Response) {
        if let Some(session_id) = response
            .headers()
            .get(MCP_SESSION_ID)
            .and_then(|v| v.to_str().ok())
        {
            *self.session_id.write() = Some(session_id.to_string());
        }
    }

    async fn read_response(
        &self,
        response: reqwest::Response,
        id: &RequestId,
    ) -> Result<JSONRPCResponse> {
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_ascii_lowercase();

        if content_type.starts_with(TEXT_EVENT_STREAM) {
            return read_sse_response(response, id).await;
        }

        let body = response.bytes().await.map_err(TransportError::from)?;
        if body.is_empty() {
            return Err(TransportError::InvalidMessage("empty response body".into()).into());
        }
        IncomingMessage::parse_batch(&body)?
            .into_iter()
            .find_map(|message| message.into_response_for(id))
            .ok_or_else(|| {
                TransportError::InvalidMessage(format!("no response for request {}", id)).into()
            })
    }

    async fn terminate_session(&self, session_id: &str) -> Result<()> {
        let ctx = RequestContext::background().with_timeout(CLOSE_TIMEOUT);
        let mut headers = self.request_headers(&ctx).await?;
        headers.insert(
            MCP_SESSION_ID,
            HeaderValue::from_str(session_id)
                .map_err(|e| TransportError::InvalidMessage(e.to_string()))?,
        );

        let response = self
            .client
            .delete(self.url.clone())
            .headers(headers)
            .timeout(CLOSE_TIMEOUT)
            .send()
            .await
            .map_err(TransportError::from)?;

        let status = response.status();
        if !status.is_success() && status != StatusCode::METHOD_NOT_ALLOWED {
            tracing::warn!(url = %self.url, %status, "failed to terminate session");
        }
        Ok(())
    }
}

fn auth_header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value).map_err(|_| {
        Error::Authentication("token contains characters not allowed in a header".into())
    })
}

/// Turn a non-success status into [`TransportError::HttpStatus`].
pub(crate) async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let www_authenticate = response
        .headers()
        .get(WWW_AUTHENTICATE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let body = response.text().await.unwrap_or_default();
    Err(TransportError::HttpStatus {
        status: status.as_u16(),
        www_authenticate,
        body,
    }
    .into())
}

async fn read_sse_response(response: reqwest::Response, id: &RequestId) -> Result<JSONRPCResponse> {
    let mut parser = SseParser::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(TransportError::from)?;
        for event in parser.feed(&chunk) {
            if let Some(response) = response_from_event(&event.data, event.is_message(), id) {
                return Ok(response);
            }
        }
    }
    if let Some(event) = parser.finish() {
        if let Some(response) = response_from_event(&event.data, event.is_message(), id) {
            return Ok(response);
        }
    }
    Err(TransportError::InvalidMessage(format!("stream ended before response to {}", id)).into())
}

fn response_from_event(data: &str, is_message: bool, id: &RequestId) -> Option<JSONRPCResponse> {
    if !is_message {
        return None;
    }
    match IncomingMessage::parse(data.as_bytes()) {
        Ok(message) => message.into_response_for(id),
        Err(e) => {
            tracing::debug!(error = %e, "skipping undecodable SSE event");
            None
        },
    }
}

#[async_trait]
impl Transport for StreamableHttpTransport {
    async fn request(
        &self,
        request: JSONRPCRequest,
        ctx: &RequestContext,
    ) -> Result<JSONRPCResponse> {
        let id = request.id.clone();
        let body = serde_json::to_vec(&request)?;
        ctx.run(async {
            let response = self.post(body, ctx).await?;
            self.read_response(response, &id).await
        })
        .await
    }

    async fn notify(
        &self,
        notification: JSONRPCNotification,
        ctx: &RequestContext,
    ) -> Result<()> {
        let body = serde_json::to_vec(&notification)?;
        ctx.run(async {
            self.post(body, ctx).await?;
            Ok(())
        })
        .await
    }

    async fn close(&self) -> Result<()> {
        let session_id = self.session_id.write().take();
        if let Some(session_id) = session_id {
            if let Err(e) = self.terminate_session(&session_id).await {
                tracing::debug!(url = %self.url, error = %e, "session termination failed");
            }
        }
        Ok(())
    }

    fn set_protocol_version(&self, version: &str) {
        *self.protocol_version.write() = Some(version.to_string());
    }

    fn transport_type(&self) -> &'static str {
        "streamable-http"
    }
}
