//! Connection lifecycle across the three transports.

use pmcp_gateway::client::{new_client_from_type, McpClientConfig};
use pmcp_gateway::{
    ConnectionState, Error, McpClient, RequestContext, StdioClient, StreamableHttpClient,
};
use std::collections::HashMap;
use std::time::Duration;
use url::Url;

/// A shell one-liner that answers `initialize` and one `tools/list`, then
/// blocks on stdin until the client closes it.
#[cfg(unix)]
const SCRIPTED_SERVER: &str = r#"
echo booting >&2
read -r _
printf '%s\n' '{"jsonrpc":"2.0","id":1,"result":{"protocolVersion":"2024-11-05","capabilities":{},"serverInfo":{"name":"scripted","version":"0.1"}}}'
read -r _
read -r _
echo 'not json'
printf '%s\n' '{"jsonrpc":"2.0","id":2,"result":{"tools":[{"name":"echo","inputSchema":{"type":"object"}}]}}'
read -r _
"#;

#[cfg(unix)]
#[tokio::test]
async fn stdio_client_full_lifecycle() {
    let client = StdioClient::new(
        "sh",
        vec!["-c".to_string(), SCRIPTED_SERVER.to_string()],
        HashMap::new(),
    );
    let ctx = RequestContext::background().with_timeout(Duration::from_secs(10));

    client.initialize(&ctx).await.unwrap();
    assert_eq!(client.state(), ConnectionState::Connected);
    assert_eq!(client.server_info().unwrap().server_info.name, "scripted");

    let stderr = client.as_stderr_source().expect("process clients expose stderr");
    assert!(stderr.take_stderr().is_some());
    assert!(stderr.take_stderr().is_none());

    let tools = client.list_tools(&ctx).await.unwrap();
    assert_eq!(tools.len(), 1);
    assert_eq!(tools[0].name, "echo");

    client.close().await.unwrap();
    assert_eq!(client.state(), ConnectionState::Disconnected);
    client.close().await.unwrap();

    let err = client.list_tools(&ctx).await.unwrap_err();
    assert!(err.is_not_connected());
}

#[cfg(unix)]
#[tokio::test]
async fn non_mcp_process_fails_handshake_and_is_reaped() {
    let client = StdioClient::new("echo", vec!["hello".to_string()], HashMap::new());

    let err = client
        .initialize(&RequestContext::background())
        .await
        .unwrap_err();
    assert!(err.is_handshake_failed(), "unexpected error: {err}");
    assert_eq!(client.state(), ConnectionState::Disconnected);

    let stderr = client.as_stderr_source().unwrap();
    assert!(stderr.take_stderr().is_none());

    #[cfg(target_os = "linux")]
    if let Some(pid) = client.last_pid() {
        assert!(!std::path::Path::new(&format!("/proc/{pid}")).exists());
    }
}

#[tokio::test]
async fn missing_executable_is_a_handshake_failure() {
    let client = StdioClient::new("/nonexistent/mcp-server", Vec::new(), HashMap::new());
    let err = client
        .initialize(&RequestContext::background())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::HandshakeFailed { .. }));
}

#[tokio::test]
async fn data_operations_require_initialize() {
    let client = StreamableHttpClient::new(
        Url::parse("http://example.com/mcp").unwrap(),
        HashMap::new(),
    );
    let ctx = RequestContext::background();

    assert!(client.list_tools(&ctx).await.unwrap_err().is_not_connected());
    assert!(client.list_resources(&ctx).await.unwrap_err().is_not_connected());
    assert!(client.list_prompts(&ctx).await.unwrap_err().is_not_connected());
    assert!(client.ping(&ctx).await.unwrap_err().is_not_connected());
    assert!(client
        .call_tool(&ctx, "echo", serde_json::json!({}))
        .await
        .unwrap_err()
        .is_not_connected());
    assert!(client
        .read_resource(&ctx, "file:///x")
        .await
        .unwrap_err()
        .is_not_connected());
    assert!(client
        .get_prompt(&ctx, "p", HashMap::new())
        .await
        .unwrap_err()
        .is_not_connected());

    client.close().await.unwrap();
    client.close().await.unwrap();
    assert_eq!(client.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn cancelled_context_aborts_handshake() {
    let client = StdioClient::new("sh", vec!["-c".to_string(), "sleep 30".to_string()], HashMap::new());
    let ctx = RequestContext::background();
    ctx.cancel();

    let err = client.initialize(&ctx).await.unwrap_err();
    assert!(err.is_cancelled(), "unexpected error: {err}");
    assert_eq!(client.state(), ConnectionState::Disconnected);
}

#[test]
fn factory_rejects_unknown_transport() {
    let err = new_client_from_type("websocket", McpClientConfig::remote("ws://example.com"))
        .unwrap_err();
    assert!(matches!(err, Error::TransportCreation(_)));
}
