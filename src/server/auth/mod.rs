//! Inbound authentication for the gateway.
//!
//! Gateway code never knows which identity provider issued a token; it only
//! sees [`AuthContext`].

pub mod mock;
pub mod traits;

pub use mock::MockValidator;
pub use traits::{AuthContext, TokenValidator};
