//! Wire types: JSON-RPC framing and the MCP request/result shapes.

pub mod jsonrpc;
pub mod protocol;

pub use jsonrpc::{
    IncomingMessage, JSONRPCError, JSONRPCNotification, JSONRPCRequest, JSONRPCResponse,
    RequestId, JSONRPC_VERSION,
};
pub use protocol::{
    CallToolRequest, CallToolResult, ClientCapabilities, Content, GetPromptRequest,
    GetPromptResult, Implementation, InitializeRequest, InitializeResult, ListPromptsResult,
    ListResourcesResult, ListToolsResult, PaginatedRequest, PromptArgument, PromptInfo,
    PromptMessage, ReadResourceRequest, ReadResourceResult, ResourceContents, ResourceInfo, Role,
    ServerCapabilities, ToolInfo,
};
