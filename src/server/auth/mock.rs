//! Mock token validator for development and testing.
//!
//! ```rust
//! use pmcp_gateway::server::auth::{MockValidator, TokenValidator};
//!
//! # async fn example() -> pmcp_gateway::Result<()> {
//! let validator = MockValidator::new("dev-user")
//!     .with_email("dev@example.com")
//!     .accept_only(["gateway-token"]);
//!
//! let auth = validator.validate("gateway-token").await?;
//! assert_eq!(auth.email(), Some("dev@example.com"));
//! assert!(validator.validate("other").await.is_err());
//! # Ok(())
//! # }
//! ```

use super::traits::{AuthContext, TokenValidator};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::time::{SystemTime, UNIX_EPOCH};

/// Validator that accepts configured tokens without any cryptography.
///
/// Never use it in production.
#[derive(Debug, Clone)]
pub struct MockValidator {
    user_id: String,
    scopes: Vec<String>,
    claims: HashMap<String, serde_json::Value>,
    accepted: Option<HashSet<String>>,
}

impl MockValidator {
    /// Accept any non-empty token as `user_id`.
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            scopes: vec!["read".to_string(), "write".to_string()],
            claims: HashMap::new(),
            accepted: None,
        }
    }

    /// Set the email claim.
    pub fn with_email(self, email: impl Into<String>) -> Self {
        self.with_claim("email", email.into())
    }

    /// Add a claim.
    pub fn with_claim(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.claims.insert(key.into(), value.into());
        self
    }

    /// Set the granted scopes.
    pub fn with_scopes<I, S>(mut self, scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.scopes = scopes.into_iter().map(Into::into).collect();
        self
    }

    /// Accept only the listed tokens.
    pub fn accept_only<I, S>(mut self, tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.accepted = Some(tokens.into_iter().map(Into::into).collect());
        self
    }

    fn build_context(&self, token: &str) -> AuthContext {
        let expires_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|now| now.as_secs() + 3600)
            .ok();

        AuthContext {
            subject: self.user_id.clone(),
            scopes: self.scopes.clone(),
            claims: self.claims.clone(),
            token: Some(token.to_string()),
            client_id: Some("mock-client".to_string()),
            expires_at,
            authenticated: true,
        }
    }
}

#[async_trait]
impl TokenValidator for MockValidator {
    async fn validate(&self, token: &str) -> Result<AuthContext> {
        if token.is_empty() {
            return Err(Error::Authentication("missing token".to_string()));
        }
        if let Some(accepted) = &self.accepted {
            if !accepted.contains(token) {
                return Err(Error::Authentication("invalid token".to_string()));
            }
        }
        Ok(self.build_context(token))
    }
}
