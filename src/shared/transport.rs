//! Transport abstraction shared by the three backend transports.

use crate::error::Result;
use crate::shared::context::RequestContext;
use crate::types::{JSONRPCNotification, JSONRPCRequest, JSONRPCResponse};
use async_trait::async_trait;
use std::fmt::Debug;

/// A request/response channel to one backend server.
///
/// Implementations match responses to requests by id and must be safe to
/// drive from several concurrent callers.
#[async_trait]
pub trait Transport: Send + Sync + Debug {
    /// Send a request and wait for the matching response.
    async fn request(
        &self,
        request: JSONRPCRequest,
        ctx: &RequestContext,
    ) -> Result<JSONRPCResponse>;

    /// Send a notification. No response is expected.
    async fn notify(&self, notification: JSONRPCNotification, ctx: &RequestContext)
        -> Result<()>;

    /// Release the underlying process or connection. Idempotent.
    async fn close(&self) -> Result<()>;

    /// Record the protocol version negotiated during the handshake.
    fn set_protocol_version(&self, _version: &str) {}

    /// Short name for logging.
    fn transport_type(&self) -> &'static str;
}
