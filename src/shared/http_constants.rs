//! Header names and media types used by the HTTP transports.

/// Session id header for the streamable HTTP transport.
pub const MCP_SESSION_ID: &str = "mcp-session-id";
/// Negotiated protocol version header.
pub const MCP_PROTOCOL_VERSION: &str = "mcp-protocol-version";

/// JSON media type.
pub const APPLICATION_JSON: &str = "application/json";
/// SSE media type.
pub const TEXT_EVENT_STREAM: &str = "text/event-stream";
/// Accept header for streamable HTTP POSTs.
pub const ACCEPT_STREAMABLE: &str = "application/json, text/event-stream";
