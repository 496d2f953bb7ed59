//! Client-facing side: the OAuth gateway and the SSO machinery behind it.

pub mod auth;
pub mod config;
pub mod gateway;
pub mod session_tracker;
pub mod sso;
pub mod token_store;

pub use config::GatewayConfig;
pub use gateway::{ForwardedIdentity, OAuthGateway, OAuthGatewayBuilder};
pub use session_tracker::{hash_token, SessionObservation, SessionTracker};
pub use sso::{is_id_token_expired, should_forward_token, SessionConnector, SessionInit, SessionInitCallback};
pub use token_store::{InMemoryTokenStore, UpstreamToken, UpstreamTokenStore};
