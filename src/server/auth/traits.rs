//! Inbound authentication seam.
//!
//! The gateway never interprets inbound tokens itself. It hands the bearer
//! credential to a [`TokenValidator`] and only ever sees the resulting
//! [`AuthContext`].

use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

/// Validated identity of an inbound caller.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthContext {
    /// Subject identifier (`sub` claim).
    pub subject: String,

    /// Granted scopes.
    pub scopes: Vec<String>,

    /// Additional claims from the token.
    pub claims: HashMap<String, serde_json::Value>,

    /// The validated inbound token.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    /// Client that obtained the token.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,

    /// Expiry, Unix epoch seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<u64>,

    /// Whether this context represents an authenticated caller.
    #[serde(default)]
    pub authenticated: bool,
}

impl AuthContext {
    /// Create an authenticated context.
    pub fn new(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            authenticated: true,
            ..Default::default()
        }
    }

    /// Add a claim.
    pub fn with_claim(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.claims.insert(key.into(), value.into());
        self
    }

    /// The subject.
    #[inline]
    pub fn user_id(&self) -> &str {
        &self.subject
    }

    /// Typed claim lookup.
    pub fn claim<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.claims
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Email address, checking the claim names common identity providers use:
    /// `email`, then `preferred_username`, then `upn`.
    pub fn email(&self) -> Option<&str> {
        self.claims
            .get("email")
            .or_else(|| self.claims.get("preferred_username"))
            .or_else(|| self.claims.get("upn"))
            .and_then(|v| v.as_str())
            .filter(|email| !email.is_empty())
    }

    /// Whether a scope was granted.
    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.iter().any(|s| s == scope)
    }

    /// Whether every listed scope was granted.
    pub fn has_all_scopes(&self, scopes: &[&str]) -> bool {
        scopes.iter().all(|scope| self.has_scope(scope))
    }

    /// Whether the token has expired. Contexts without expiry never do.
    pub fn is_expired(&self) -> bool {
        let Some(expires_at) = self.expires_at else {
            return false;
        };
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|now| now.as_secs() >= expires_at)
            .unwrap_or(false)
    }
}

/// Validates inbound bearer tokens.
#[async_trait]
pub trait TokenValidator: Send + Sync {
    /// Validate a token and return the caller's identity.
    async fn validate(&self, token: &str) -> Result<AuthContext>;

    /// Validate and additionally require scopes.
    async fn validate_with_context(
        &self,
        token: &str,
        required_scopes: Option<&[&str]>,
    ) -> Result<AuthContext> {
        let auth_context = self.validate(token).await?;

        if let Some(scopes) = required_scopes {
            if !auth_context.has_all_scopes(scopes) {
                return Err(Error::Authentication("insufficient scopes".to_string()));
            }
        }

        Ok(auth_context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn email_falls_back_through_provider_claims() {
        let entra = AuthContext::new("u1").with_claim("preferred_username", "alice@example.com");
        assert_eq!(entra.email(), Some("alice@example.com"));

        let upn = AuthContext::new("u2").with_claim("upn", "bob@example.com");
        assert_eq!(upn.email(), Some("bob@example.com"));

        let empty = AuthContext::new("u3").with_claim("email", "");
        assert_eq!(empty.email(), None);
    }

    #[test]
    fn typed_claims_and_scopes() {
        let mut auth = AuthContext::new("u1").with_claim("groups", json!(["ops", "dev"]));
        auth.scopes = vec!["mcp:read".to_string(), "mcp:write".to_string()];

        let groups: Option<Vec<String>> = auth.claim("groups");
        assert_eq!(groups, Some(vec!["ops".to_string(), "dev".to_string()]));
        assert!(auth.has_all_scopes(&["mcp:read", "mcp:write"]));
        assert!(!auth.has_scope("admin"));
    }

    #[test]
    fn expiry() {
        let mut auth = AuthContext::new("u1");
        assert!(!auth.is_expired());
        auth.expires_at = Some(1);
        assert!(auth.is_expired());
    }
}
