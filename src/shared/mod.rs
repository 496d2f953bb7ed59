//! Transports and the plumbing they share.

pub mod context;
pub mod http_constants;
pub mod http_utils;
pub(crate) mod pending;
pub mod sse;
pub mod sse_parser;
pub mod stdio;
pub mod streamable_http;
pub mod transport;

pub use context::RequestContext;
pub use sse::SseTransport;
pub use sse_parser::{SseEvent, SseParser};
pub use stdio::ProcessTransport;
pub use streamable_http::{StreamableHttpConfig, StreamableHttpTransport};
pub use transport::Transport;
