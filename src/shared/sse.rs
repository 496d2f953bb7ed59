//! Event-stream (SSE) transport.
//!
//! The client opens a long-lived GET stream. The server's first `endpoint`
//! event names the URL that requests are POSTed to; responses come back as
//! `message` events on the stream and are matched to callers by id.

use crate::error::{Result, TransportError};
use crate::shared::context::RequestContext;
use crate::shared::http_constants::{APPLICATION_JSON, TEXT_EVENT_STREAM};
use crate::shared::http_utils::header_map;
use crate::shared::pending::PendingRequests;
use crate::shared::sse_parser::{SseEvent, SseParser};
use crate::shared::streamable_http::check_status;
use crate::shared::transport::Transport;
use crate::types::{IncomingMessage, JSONRPCNotification, JSONRPCRequest, JSONRPCResponse};
use async_trait::async_trait;
use futures::StreamExt;
use http::header::{HeaderMap, ACCEPT, CONTENT_TYPE};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use url::Url;

/// Transport over a server-sent event stream plus POSTed requests.
pub struct SseTransport {
    url: Url,
    endpoint: Url,
    headers: HeaderMap,
    client: reqwest::Client,
    pending: Arc<PendingRequests>,
    reader: parking_lot::Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl fmt::Debug for SseTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SseTransport")
            .field("url", &self.url.as_str())
            .field("endpoint", &self.endpoint.as_str())
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl SseTransport {
    /// Open the event stream and wait for the server to announce its
    /// message endpoint.
    pub async fn connect(
        url: Url,
        headers: &HashMap<String, String>,
        ctx: &RequestContext,
    ) -> Result<Self> {
        let headers = header_map(headers)?;
        let client = reqwest::Client::new();

        let response = ctx
            .run(async {
                let response = client
                    .get(url.clone())
                    .headers(headers.clone())
                    .header(ACCEPT, TEXT_EVENT_STREAM)
                    .send()
                    .await
                    .map_err(TransportError::from)?;
                check_status(response).await
            })
            .await?;

        let pending = Arc::new(PendingRequests::new());
        let (endpoint_tx, endpoint_rx) = oneshot::channel();
        let reader = tokio::spawn(read_stream(
            url.clone(),
            response,
            pending.clone(),
            endpoint_tx,
        ));

        let endpoint = ctx
            .run(async {
                endpoint_rx.await.map_err(|_| {
                    TransportError::InvalidMessage(
                        "event stream ended before endpoint event".into(),
                    )
                    .into()
                })
            })
            .await;

        let endpoint = match endpoint {
            Ok(endpoint) => endpoint,
            Err(e) => {
                reader.abort();
                return Err(e);
            },
        };

        tracing::debug!(url = %url, endpoint = %endpoint, "event stream connected");

        Ok(Self {
            url,
            endpoint,
            headers,
            client,
            pending,
            reader: parking_lot::Mutex::new(Some(reader)),
            closed: AtomicBool::new(false),
        })
    }

    /// URL requests are POSTed to.
    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    async fn post(&self, body: Vec<u8>) -> Result<()> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .headers(self.headers.clone())
            .header(CONTENT_TYPE, APPLICATION_JSON)
            .body(body)
            .send()
            .await
            .map_err(TransportError::from)?;
        check_status(response).await?;
        Ok(())
    }
}

async fn read_stream(
    url: Url,
    response: reqwest::Response,
    pending: Arc<PendingRequests>,
    endpoint_tx: oneshot::Sender<Url>,
) {
    let mut endpoint_tx = Some(endpoint_tx);
    let mut parser = SseParser::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                tracing::warn!(url = %url, error = %e, "event stream failed");
                break;
            },
        };
        for event in parser.feed(&chunk) {
            dispatch(&url, event, &pending, &mut endpoint_tx);
        }
    }
    if let Some(event) = parser.finish() {
        dispatch(&url, event, &pending, &mut endpoint_tx);
    }

    tracing::debug!(url = %url, "event stream closed");
    pending.fail_all();
}

fn dispatch(
    url: &Url,
    event: SseEvent,
    pending: &PendingRequests,
    endpoint_tx: &mut Option<oneshot::Sender<Url>>,
) {
    if event.event.as_deref() == Some("endpoint") {
        let Some(tx) = endpoint_tx.take() else {
            return;
        };
        match url.join(event.data.trim()) {
            Ok(endpoint) => {
                let _ = tx.send(endpoint);
            },
            Err(e) => {
                tracing::warn!(url = %url, error = %e, "invalid endpoint event");
            },
        }
        return;
    }
    if !event.is_message() {
        return;
    }
    match IncomingMessage::parse(event.data.as_bytes()) {
        Ok(IncomingMessage::Response(response)) => {
            pending.complete(response);
        },
        Ok(IncomingMessage::Request(request)) => {
            tracing::debug!(url = %url, method = %request.method, "ignoring server request");
        },
        Ok(IncomingMessage::Notification(notification)) => {
            tracing::trace!(url = %url, method = %notification.method, "server notification");
        },
        Err(e) => {
            tracing::debug!(url = %url, error = %e, "skipping undecodable event");
        },
    }
}

#[async_trait]
impl Transport for SseTransport {
    async fn request(
        &self,
        request: JSONRPCRequest,
        ctx: &RequestContext,
    ) -> Result<JSONRPCResponse> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::ConnectionClosed.into());
        }
        let id = request.id.clone();
        let body = serde_json::to_vec(&request)?;
        let rx = self.pending.register(id.clone())?;

        if let Err(e) = ctx.run(self.post(body)).await {
            self.pending.cancel(&id);
            return Err(e);
        }
        self.pending.wait(&id, rx, ctx).await
    }

    async fn notify(
        &self,
        notification: JSONRPCNotification,
        ctx: &RequestContext,
    ) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::ConnectionClosed.into());
        }
        let body = serde_json::to_vec(&notification)?;
        ctx.run(self.post(body)).await
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
        self.pending.fail_all();
        Ok(())
    }

    fn transport_type(&self) -> &'static str {
        "sse"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::time::Duration;

    #[tokio::test]
    async fn stream_without_endpoint_event_fails_to_connect() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/sse")
            .with_status(200)
            .with_header("content-type", "text/event-stream")
            .with_body(": keep-alive\n\n")
            .create_async()
            .await;

        let url = Url::parse(&format!("{}/sse", server.url())).unwrap();
        let err = SseTransport::connect(
            url,
            &HashMap::new(),
            &RequestContext::background().with_timeout(Duration::from_secs(5)),
        )
        .await
        .unwrap_err();
        assert!(matches!(
            err,
            Error::Transport(TransportError::InvalidMessage(_))
        ));
    }

    #[tokio::test]
    async fn resolves_relative_endpoint() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/sse")
            .with_status(200)
            .with_header("content-type", "text/event-stream")
            .with_body("event: endpoint\ndata: /message?sessionId=abc\n\n")
            .create_async()
            .await;

        let url = Url::parse(&format!("{}/sse", server.url())).unwrap();
        let transport = SseTransport::connect(
            url,
            &HashMap::new(),
            &RequestContext::background().with_timeout(Duration::from_secs(5)),
        )
        .await
        .unwrap();

        assert_eq!(transport.endpoint().path(), "/message");
        assert_eq!(transport.endpoint().query(), Some("sessionId=abc"));
        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn unauthorized_stream_reports_status() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/sse")
            .with_status(401)
            .with_header("www-authenticate", "Bearer realm=\"mcp\"")
            .create_async()
            .await;

        let url = Url::parse(&format!("{}/sse", server.url())).unwrap();
        let err = SseTransport::connect(url, &HashMap::new(), &RequestContext::background())
            .await
            .unwrap_err();
        assert_eq!(err.http_status(), Some((401, Some("Bearer realm=\"mcp\""))));
    }
}
