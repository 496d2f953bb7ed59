//! Dynamic bearer-token injection.
//!
//! A [`TokenProvider`] is queried on every outbound request, never cached by
//! the transport, so a refresh performed elsewhere applies to the next call
//! without reconnecting.

use crate::shared::context::RequestContext;
use async_trait::async_trait;
use std::fmt;

/// An access token with its type tag.
#[derive(Clone, PartialEq, Eq)]
pub struct Token {
    /// The access token
    pub access_token: String,
    /// Token type (usually "Bearer")
    pub token_type: String,
}

impl Token {
    /// Create a bearer token.
    pub fn bearer(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            token_type: "Bearer".to_string(),
        }
    }

    /// Get the authorization header value
    pub fn to_header_value(&self) -> String {
        format!("{} {}", self.token_type, self.access_token)
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Token")
            .field("access_token", &"[REDACTED]")
            .field("token_type", &self.token_type)
            .finish()
    }
}

/// Supplies the current bearer token for each outbound request.
///
/// An empty string means "no token"; the transport then sends no
/// `Authorization` header.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Returns the current access token, or an empty string.
    async fn get_access_token(&self, ctx: &RequestContext) -> String;
}

/// Provider that never has a token. The default when none is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTokenProvider;

#[async_trait]
impl TokenProvider for NoopTokenProvider {
    async fn get_access_token(&self, _ctx: &RequestContext) -> String {
        String::new()
    }
}

/// Provider that always returns the same token.
#[derive(Clone)]
pub struct StaticTokenProvider {
    token: String,
}

impl StaticTokenProvider {
    /// Wrap a fixed token.
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl fmt::Debug for StaticTokenProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticTokenProvider")
            .field("has_token", &!self.token.is_empty())
            .finish()
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn get_access_token(&self, _ctx: &RequestContext) -> String {
        self.token.clone()
    }
}

/// Provider backed by a synchronous closure.
///
/// ```rust
/// use pmcp_gateway::client::token_provider::FnTokenProvider;
///
/// let provider = FnTokenProvider::new(|_ctx| std::env::var("BACKEND_TOKEN").unwrap_or_default());
/// ```
pub struct FnTokenProvider<F> {
    f: F,
}

impl<F> FnTokenProvider<F>
where
    F: Fn(&RequestContext) -> String + Send + Sync,
{
    /// Wrap a closure.
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F> fmt::Debug for FnTokenProvider<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FnTokenProvider")
    }
}

#[async_trait]
impl<F> TokenProvider for FnTokenProvider<F>
where
    F: Fn(&RequestContext) -> String + Send + Sync,
{
    async fn get_access_token(&self, ctx: &RequestContext) -> String {
        (self.f)(ctx)
    }
}

/// Compute the `Authorization` header value for one request.
pub async fn authorization_header(
    provider: &dyn TokenProvider,
    ctx: &RequestContext,
) -> Option<String> {
    let token = provider.get_access_token(ctx).await;
    if token.is_empty() {
        None
    } else {
        Some(Token::bearer(token).to_header_value())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn empty_token_yields_no_header() {
        let ctx = RequestContext::background();
        assert_eq!(authorization_header(&NoopTokenProvider, &ctx).await, None);
    }

    #[tokio::test]
    async fn header_is_recomputed_on_every_call() {
        let calls = AtomicUsize::new(0);
        let provider = FnTokenProvider::new(move |_| {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            format!("token-{}", n)
        });
        let ctx = RequestContext::background();

        let first = authorization_header(&provider, &ctx).await;
        let second = authorization_header(&provider, &ctx).await;
        assert_eq!(first.as_deref(), Some("Bearer token-1"));
        assert_eq!(second.as_deref(), Some("Bearer token-2"));
    }

    #[test]
    fn debug_output_hides_token() {
        let token = Token::bearer("super-secret");
        assert!(!format!("{:?}", token).contains("super-secret"));
        assert_eq!(token.to_header_value(), "Bearer super-secret");
    }
}
