//! Upstream tokens the gateway holds on behalf of its users.

use async_trait::async_trait;
use dashmap::DashMap;
use std::fmt;
use std::time::SystemTime;

/// Token obtained from the upstream identity provider for one user.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct UpstreamToken {
    /// Upstream access token
    pub access_token: String,
    /// OIDC identity token; empty when none was issued
    pub id_token: String,
    /// Refresh token
    pub refresh_token: Option<String>,
    /// Access-token expiry
    pub expires_at: Option<SystemTime>,
}

impl UpstreamToken {
    /// Token with an access token and identity token.
    pub fn new(access_token: impl Into<String>, id_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            id_token: id_token.into(),
            ..Default::default()
        }
    }
}

impl fmt::Debug for UpstreamToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpstreamToken")
            .field("has_access_token", &!self.access_token.is_empty())
            .field("has_id_token", &!self.id_token.is_empty())
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Persistent upstream-token storage keyed by user identity (email).
#[async_trait]
pub trait UpstreamTokenStore: Send + Sync {
    /// Token for `email`, if one is stored.
    async fn get_token(&self, email: &str) -> Option<UpstreamToken>;
}

/// In-process [`UpstreamTokenStore`].
#[derive(Debug, Default)]
pub struct InMemoryTokenStore {
    tokens: DashMap<String, UpstreamToken>,
}

impl InMemoryTokenStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store or replace the token for `email`.
    pub fn insert(&self, email: impl Into<String>, token: UpstreamToken) {
        self.tokens.insert(email.into(), token);
    }

    /// Remove the token for `email`.
    pub fn remove(&self, email: &str) -> Option<UpstreamToken> {
        self.tokens.remove(email).map(|(_, token)| token)
    }
}

#[async_trait]
impl UpstreamTokenStore for InMemoryTokenStore {
    async fn get_token(&self, email: &str) -> Option<UpstreamToken> {
        self.tokens.get(email).map(|entry| entry.value().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stores_by_email() {
        let store = InMemoryTokenStore::new();
        assert!(store.get_token("a@example.com").await.is_none());

        store.insert("a@example.com", UpstreamToken::new("at-1", "id-1"));
        store.insert("a@example.com", UpstreamToken::new("at-2", "id-1"));
        assert_eq!(
            store.get_token("a@example.com").await.unwrap().access_token,
            "at-2"
        );

        assert!(store.remove("a@example.com").is_some());
        assert!(store.get_token("a@example.com").await.is_none());
    }

    #[test]
    fn debug_hides_secrets() {
        let rendered = format!("{:?}", UpstreamToken::new("secret-access", "secret-id"));
        assert!(!rendered.contains("secret"));
    }
}
