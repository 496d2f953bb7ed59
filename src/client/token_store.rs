//! Bridge from a session-and-issuer-scoped OAuth manager to the transport
//! token contract.
//!
//! The OAuth manager owns the token lifecycle. [`SessionTokenStore`] only
//! asks it for a fresh token on each request and remembers the most recent
//! identity token so the SSO forwarding path can reuse it.

use crate::client::token_provider::{Token, TokenProvider};
use crate::shared::context::RequestContext;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;
use thiserror::Error;

/// Failure modes of a [`TokenStore`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TokenStoreError {
    /// No usable token. The caller should start an authorization flow
    /// instead of retrying.
    #[error("no token available")]
    NoToken,

    /// The store itself failed.
    #[error("token store error: {0}")]
    Other(String),
}

/// Transport-level token store contract.
#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Fetch the token to use for the next request.
    async fn get_token(&self, ctx: &RequestContext) -> Result<Token, TokenStoreError>;

    /// Persist a token obtained by the transport.
    async fn save_token(&self, ctx: &RequestContext, token: Token) -> Result<(), TokenStoreError>;
}

/// Full token set held by the OAuth manager.
#[derive(Clone, Default)]
pub struct FullToken {
    /// Access token
    pub access_token: String,
    /// OIDC identity token, empty when the provider issued none
    pub id_token: String,
    /// Refresh token, if any
    pub refresh_token: Option<String>,
    /// Expiry of the access token
    pub expires_at: Option<SystemTime>,
}

impl fmt::Debug for FullToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FullToken")
            .field("has_access_token", &!self.access_token.is_empty())
            .field("has_id_token", &!self.id_token.is_empty())
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// External OAuth manager scoped by session and issuer.
#[async_trait]
pub trait OAuthHandler: Send + Sync {
    /// Whether OAuth is configured at all.
    fn is_enabled(&self) -> bool;

    /// Return a valid access token for (session, issuer), refreshing it first
    /// if it is close to expiry. Empty when none is available.
    async fn refresh_token_if_needed(
        &self,
        ctx: &RequestContext,
        session_id: &str,
        issuer: &str,
    ) -> String;

    /// The complete token set for (session, issuer), if stored.
    fn full_token_by_issuer(&self, session_id: &str, issuer: &str) -> Option<FullToken>;
}

/// [`TokenStore`] for one (session, issuer) pair.
pub struct SessionTokenStore {
    session_id: String,
    issuer: String,
    handler: Option<Arc<dyn OAuthHandler>>,
    id_token: RwLock<String>,
}

impl SessionTokenStore {
    /// Create an adapter. `handler` may be absent, in which case every
    /// lookup reports [`TokenStoreError::NoToken`].
    pub fn new(
        session_id: impl Into<String>,
        issuer: impl Into<String>,
        handler: Option<Arc<dyn OAuthHandler>>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            issuer: issuer.into(),
            handler,
            id_token: RwLock::new(String::new()),
        }
    }

    /// The identity token cached by the last successful lookup, possibly empty.
    pub fn id_token(&self) -> String {
        self.id_token.read().clone()
    }

    /// Session this adapter serves.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Issuer this adapter serves.
    pub fn issuer(&self) -> &str {
        &self.issuer
    }
}

impl fmt::Debug for SessionTokenStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionTokenStore")
            .field("session_id", &crate::shared::http_utils::truncate_session_id(&self.session_id))
            .field("issuer", &self.issuer)
            .field("has_handler", &self.handler.is_some())
            .finish()
    }
}

#[async_trait]
impl TokenStore for SessionTokenStore {
    async fn get_token(&self, ctx: &RequestContext) -> Result<Token, TokenStoreError> {
        let Some(handler) = self.handler.as_ref().filter(|h| h.is_enabled()) else {
            return Err(TokenStoreError::NoToken);
        };
        if ctx.is_done() {
            return Err(TokenStoreError::NoToken);
        }

        let access_token = handler
            .refresh_token_if_needed(ctx, &self.session_id, &self.issuer)
            .await;
        if access_token.is_empty() {
            tracing::debug!(issuer = %self.issuer, "no access token for session");
            return Err(TokenStoreError::NoToken);
        }

        if let Some(full) = handler.full_token_by_issuer(&self.session_id, &self.issuer) {
            if !full.id_token.is_empty() {
                *self.id_token.write() = full.id_token;
            }
        }

        Ok(Token::bearer(access_token))
    }

    async fn save_token(&self, _ctx: &RequestContext, _token: Token) -> Result<(), TokenStoreError> {
        Ok(())
    }
}

#[async_trait]
impl TokenProvider for SessionTokenStore {
    async fn get_access_token(&self, ctx: &RequestContext) -> String {
        match self.get_token(ctx).await {
            Ok(token) => token.access_token,
            Err(_) => String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeHandler {
        enabled: bool,
        access_token: String,
        id_token: String,
        refreshes: AtomicUsize,
    }

    impl FakeHandler {
        fn new(access_token: &str, id_token: &str) -> Self {
            Self {
                enabled: true,
                access_token: access_token.to_string(),
                id_token: id_token.to_string(),
                refreshes: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl OAuthHandler for FakeHandler {
        fn is_enabled(&self) -> bool {
            self.enabled
        }

        async fn refresh_token_if_needed(
            &self,
            _ctx: &RequestContext,
            session_id: &str,
            issuer: &str,
        ) -> String {
            assert_eq!(session_id, "session-1");
            assert_eq!(issuer, "https://idp.example.com");
            self.refreshes.fetch_add(1, Ordering::SeqCst);
            self.access_token.clone()
        }

        fn full_token_by_issuer(&self, _session_id: &str, _issuer: &str) -> Option<FullToken> {
            Some(FullToken {
                access_token: self.access_token.clone(),
                id_token: self.id_token.clone(),
                ..Default::default()
            })
        }
    }

    fn store(handler: Option<Arc<dyn OAuthHandler>>) -> SessionTokenStore {
        SessionTokenStore::new("session-1", "https://idp.example.com", handler)
    }

    #[tokio::test]
    async fn missing_handler_reports_no_token() {
        let err = store(None)
            .get_token(&RequestContext::background())
            .await
            .unwrap_err();
        assert_eq!(err, TokenStoreError::NoToken);
    }

    #[tokio::test]
    async fn disabled_handler_reports_no_token() {
        let mut handler = FakeHandler::new("access", "id");
        handler.enabled = false;
        let err = store(Some(Arc::new(handler)))
            .get_token(&RequestContext::background())
            .await
            .unwrap_err();
        assert_eq!(err, TokenStoreError::NoToken);
    }

    #[tokio::test]
    async fn cancelled_context_reports_no_token_without_refreshing() {
        let handler = Arc::new(FakeHandler::new("access", "id"));
        let store = store(Some(handler.clone()));
        let ctx = RequestContext::background();
        ctx.cancel();

        assert_eq!(store.get_token(&ctx).await.unwrap_err(), TokenStoreError::NoToken);
        assert_eq!(handler.refreshes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn elapsed_deadline_reports_no_token_without_refreshing() {
        let handler = Arc::new(FakeHandler::new("access", "id"));
        let store = store(Some(handler.clone()));
        let ctx = RequestContext::background().with_deadline(std::time::Instant::now());

        assert_eq!(store.get_token(&ctx).await.unwrap_err(), TokenStoreError::NoToken);
        assert_eq!(handler.refreshes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn empty_refresh_result_reports_no_token() {
        let store = store(Some(Arc::new(FakeHandler::new("", "id"))));
        let err = store
            .get_token(&RequestContext::background())
            .await
            .unwrap_err();
        assert_eq!(err, TokenStoreError::NoToken);
        assert_eq!(store.id_token(), "");
    }

    #[tokio::test]
    async fn returns_bearer_token_and_caches_id_token() {
        let store = store(Some(Arc::new(FakeHandler::new("access-1", "id-1"))));
        let token = store
            .get_token(&RequestContext::background())
            .await
            .unwrap();
        assert_eq!(token, Token::bearer("access-1"));
        assert_eq!(store.id_token(), "id-1");
    }

    #[tokio::test]
    async fn save_token_is_a_no_op() {
        let store = store(None);
        store
            .save_token(&RequestContext::background(), Token::bearer("ignored"))
            .await
            .unwrap();
        assert_eq!(store.id_token(), "");
    }
}
