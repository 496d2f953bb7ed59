//! Proactive SSO propagation.
//!
//! When the gateway sees a new session, or a session whose upstream token
//! changed, it invokes a [`SessionInitCallback`] on a detached task. The
//! stock callback, [`SessionConnector`], connects to every backend that is
//! configured to receive the user's forwarded identity token.

use crate::client::config::{DefinitionStore, ServerDefinition, TransportDefinition};
use crate::client::factory::new_client_from_definition;
use crate::client::{BackendClient, McpClient};
use crate::error::{Error, Result};
use crate::shared::context::RequestContext;
use crate::shared::http_utils::{truncate_email, truncate_session_id};
use async_trait::async_trait;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine as _;
use dashmap::DashMap;
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Identity tokens expiring within this margin are treated as expired.
const ID_TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(30);

/// Default idle time after which a session's backend connections are closed.
pub const DEFAULT_CONNECTION_IDLE_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

/// Data handed to a [`SessionInitCallback`].
#[derive(Clone)]
pub struct SessionInit {
    /// Client session id
    pub session_id: String,
    /// Authenticated user's email
    pub email: String,
    /// Identity token to forward
    pub id_token: String,
}

impl fmt::Debug for SessionInit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionInit")
            .field("session_id", &truncate_session_id(&self.session_id))
            .field("email", &truncate_email(&self.email))
            .field("has_id_token", &!self.id_token.is_empty())
            .finish()
    }
}

/// Invoked when a session needs (re)propagation.
///
/// `ctx` is independent of the HTTP request that triggered it, so the work
/// continues after the response has been sent. Failures are the callback's
/// to log.
#[async_trait]
pub trait SessionInitCallback: Send + Sync {
    /// Establish or refresh backend connections for the session.
    async fn on_session_init(&self, ctx: &RequestContext, init: &SessionInit);
}

/// Whether an identity token is malformed, lacks `exp`, or expires within
/// 30 seconds. The signature is not checked.
pub fn is_id_token_expired(id_token: &str) -> bool {
    #[derive(Deserialize)]
    struct Claims {
        #[serde(default)]
        exp: i64,
    }

    let Some(payload) = id_token.split('.').nth(1) else {
        return true;
    };
    let decoded = match URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')) {
        Ok(decoded) => decoded,
        Err(_) => match STANDARD.decode(payload) {
            Ok(decoded) => decoded,
            Err(e) => {
                tracing::debug!(error = %e, "failed to decode identity token payload");
                return true;
            },
        },
    };
    let claims: Claims = match serde_json::from_slice(&decoded) {
        Ok(claims) => claims,
        Err(e) => {
            tracing::debug!(error = %e, "failed to parse identity token claims");
            return true;
        },
    };
    if claims.exp <= 0 {
        return true;
    }

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(i64::MAX);
    expires_within_margin(claims.exp, now)
}

fn expires_within_margin(exp: i64, now: i64) -> bool {
    now.saturating_add(ID_TOKEN_EXPIRY_MARGIN.as_secs() as i64) > exp
}

/// Whether a definition should receive the forwarded identity token.
pub fn should_forward_token(definition: &ServerDefinition) -> bool {
    definition.enabled && definition.forward_token && definition.transport.is_remote()
}

struct SessionConnections {
    clients: HashMap<String, Arc<BackendClient>>,
    last_active: Instant,
}

impl SessionConnections {
    fn new(now: Instant) -> Self {
        Self {
            clients: HashMap::new(),
            last_active: now,
        }
    }
}

/// Connects forwarding-enabled backends on behalf of a session.
///
/// Connections of a session that sees no activity for the idle timeout are
/// closed by [`cleanup_idle`](Self::cleanup_idle), which
/// [`spawn_cleanup`](Self::spawn_cleanup) runs periodically.
pub struct SessionConnector {
    definitions: Arc<dyn DefinitionStore>,
    connections: DashMap<String, SessionConnections>,
    idle_timeout: Duration,
}

impl fmt::Debug for SessionConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionConnector")
            .field("sessions", &self.connections.len())
            .field("idle_timeout", &self.idle_timeout)
            .finish()
    }
}

impl SessionConnector {
    /// Connector over the given definitions.
    pub fn new(definitions: Arc<dyn DefinitionStore>) -> Self {
        Self {
            definitions,
            connections: DashMap::new(),
            idle_timeout: DEFAULT_CONNECTION_IDLE_TIMEOUT,
        }
    }

    /// Idle time after which a session's connections are closed.
    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Number of sessions holding connections.
    pub fn session_count(&self) -> usize {
        self.connections.len()
    }

    /// Names of the backends connected for a session, sorted.
    pub fn connections(&self, session_id: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .connections
            .get(session_id)
            .map(|session| session.clients.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    /// The client connected to `server` for a session. Counts as activity.
    pub fn client(&self, session_id: &str, server: &str) -> Option<Arc<BackendClient>> {
        let mut session = self.connections.get_mut(session_id)?;
        let client = session.clients.get(server).cloned()?;
        session.last_active = Instant::now();
        Some(client)
    }

    /// Close and forget every connection of a session.
    pub async fn disconnect_session(&self, session_id: &str) {
        if let Some((_, session)) = self.connections.remove(session_id) {
            close_clients(session_id, session.clients).await;
        }
    }

    /// Close and forget every connection of every session.
    pub async fn disconnect_all(&self) {
        let sessions: Vec<String> = self.connections.iter().map(|e| e.key().clone()).collect();
        for session_id in sessions {
            self.disconnect_session(&session_id).await;
        }
    }

    /// Close the connections of sessions idle longer than the idle timeout.
    /// Returns the number of sessions removed.
    pub async fn cleanup_idle(&self) -> usize {
        self.cleanup_idle_at(Instant::now()).await
    }

    /// [`cleanup_idle`](Self::cleanup_idle) with an explicit clock.
    pub async fn cleanup_idle_at(&self, now: Instant) -> usize {
        let is_idle = |session: &SessionConnections| {
            now.saturating_duration_since(session.last_active) > self.idle_timeout
        };
        let idle: Vec<String> = self
            .connections
            .iter()
            .filter(|entry| is_idle(entry.value()))
            .map(|entry| entry.key().clone())
            .collect();

        let mut removed = 0;
        for session_id in idle {
            // re-checked under the shard lock; the session may have been used since
            let Some((_, session)) = self
                .connections
                .remove_if(&session_id, |_, session| is_idle(session))
            else {
                continue;
            };
            removed += 1;
            tracing::debug!(session = %truncate_session_id(&session_id), "closing idle session connections");
            close_clients(&session_id, session.clients).await;
        }
        removed
    }

    /// Sweep idle sessions on every `interval` until `shutdown` is
    /// cancelled, then close every remaining connection.
    pub fn spawn_cleanup(
        self: Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // the first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        self.disconnect_all().await;
                        tracing::debug!("backend connection cleanup stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        let removed = self.cleanup_idle().await;
                        if removed > 0 {
                            tracing::info!(removed, remaining = self.session_count(), "closed idle session connections");
                        }
                    }
                }
            }
        })
    }

    fn touch(&self, session_id: &str) {
        if let Some(mut session) = self.connections.get_mut(session_id) {
            session.last_active = Instant::now();
        }
    }

    async fn connect(
        &self,
        ctx: &RequestContext,
        definition: &ServerDefinition,
        id_token: &str,
    ) -> Result<BackendClient> {
        let definition = with_bearer(definition, id_token);
        let client = new_client_from_definition(&definition, None)?;

        if let Err(e) = client.initialize(ctx).await {
            close_quietly(&definition.name, &client).await;
            return Err(e);
        }
        match client.list_tools(ctx).await {
            Ok(tools) => {
                tracing::debug!(server = %definition.name, tools = tools.len(), "backend tools listed");
                Ok(client)
            },
            Err(e) => {
                close_quietly(&definition.name, &client).await;
                Err(e)
            },
        }
    }

    async fn store(&self, session_id: &str, server: String, client: BackendClient) {
        let now = Instant::now();
        let previous = {
            let mut session = self
                .connections
                .entry(session_id.to_string())
                .or_insert_with(|| SessionConnections::new(now));
            session.last_active = now;
            session.clients.insert(server.clone(), Arc::new(client))
        };
        if let Some(previous) = previous {
            if let Err(e) = previous.close().await {
                tracing::debug!(server = %server, error = %e, "failed to close replaced connection");
            }
        }
    }
}

async fn close_quietly(server: &str, client: &BackendClient) {
    if let Err(e) = client.close().await {
        tracing::debug!(server = %server, error = %e, "failed to close backend client");
    }
}

async fn close_clients(session_id: &str, clients: HashMap<String, Arc<BackendClient>>) {
    for (name, client) in clients {
        if let Err(e) = client.close().await {
            tracing::warn!(
                session = %truncate_session_id(session_id),
                server = %name,
                error = %e,
                "failed to close backend connection"
            );
        }
    }
}

/// Copy of `definition` that sends `Authorization: Bearer <id_token>`.
fn with_bearer(definition: &ServerDefinition, id_token: &str) -> ServerDefinition {
    let mut definition = definition.clone();
    let bearer = format!("Bearer {}", id_token);
    match &mut definition.transport {
        TransportDefinition::StreamableHttp { headers, .. } | TransportDefinition::Sse { headers, .. } => {
            headers.insert("Authorization".to_string(), bearer);
        },
        TransportDefinition::Stdio { .. } => {},
    }
    definition
}

#[async_trait]
impl SessionInitCallback for SessionConnector {
    async fn on_session_init(&self, ctx: &RequestContext, init: &SessionInit) {
        let session = truncate_session_id(&init.session_id);
        let user = truncate_email(&init.email);

        if is_id_token_expired(&init.id_token) {
            tracing::warn!(session = %session, user = %user, "identity token expired; skipping SSO");
            return;
        }
        self.touch(&init.session_id);

        let targets: Vec<ServerDefinition> = self
            .definitions
            .list()
            .into_iter()
            .filter(should_forward_token)
            .collect();
        if targets.is_empty() {
            tracing::debug!(session = %session, "no backends configured for token forwarding");
            return;
        }

        let attempts = targets.iter().map(|definition| async move {
            let result = self.connect(ctx, definition, &init.id_token).await;
            (definition.name.clone(), result)
        });
        let results = futures::future::join_all(attempts).await;

        let mut connected = 0usize;
        for (name, result) in results {
            match result {
                Ok(client) => {
                    connected += 1;
                    self.store(&init.session_id, name, client).await;
                },
                Err(Error::AuthRequired(e)) => {
                    tracing::warn!(
                        session = %session,
                        server = %name,
                        issuer = ?e.challenge.issuer,
                        "backend rejected forwarded identity token"
                    );
                },
                Err(e) => {
                    tracing::warn!(session = %session, server = %name, error = %e, "SSO connection failed");
                },
            }
        }

        tracing::info!(
            session = %session,
            user = %user,
            connected,
            attempted = targets.len(),
            "SSO propagation finished"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::config::ServerDefinitions;
    use crate::client::StreamableHttpClient;
    use mockito::Matcher;
    use serde_json::json;
    use url::Url;

    fn jwt_with_exp(exp: i64) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none"}"#);
        let payload = URL_SAFE_NO_PAD.encode(json!({"sub": "u1", "exp": exp}).to_string());
        format!("{}.{}.sig", header, payload)
    }

    fn now() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs() as i64
    }

    #[test]
    fn expiry_check() {
        assert!(!is_id_token_expired(&jwt_with_exp(now() + 3600)));
        assert!(is_id_token_expired(&jwt_with_exp(now() + 10)));
        assert!(is_id_token_expired(&jwt_with_exp(now() - 10)));
        assert!(is_id_token_expired(""));
        assert!(is_id_token_expired("not-a-jwt"));
        assert!(is_id_token_expired("a.!!!.c"));

        let no_exp = format!("h.{}.s", URL_SAFE_NO_PAD.encode(br#"{"sub":"u1"}"#));
        assert!(is_id_token_expired(&no_exp));
    }

    #[test]
    fn far_future_expiry_does_not_overflow() {
        assert!(!is_id_token_expired(&jwt_with_exp(i64::MAX)));
        assert!(!expires_within_margin(i64::MAX, now()));
        assert!(expires_within_margin(i64::MAX - 1, i64::MAX));
    }

    fn unconnected_backend() -> BackendClient {
        BackendClient::from(StreamableHttpClient::new(
            Url::parse("http://127.0.0.1:1/mcp").unwrap(),
            HashMap::new(),
        ))
    }

    async fn connected_backend(server: &mut mockito::ServerGuard) -> BackendClient {
        server
            .mock("POST", "/mcp")
            .match_body(Matcher::PartialJson(json!({"method": "initialize"})))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                json!({
                    "jsonrpc": "2.0",
                    "id": 1,
                    "result": {
                        "protocolVersion": "2024-11-05",
                        "capabilities": {},
                        "serverInfo": {"name": "backend", "version": "1"}
                    }
                })
                .to_string(),
            )
            .create_async()
            .await;
        server
            .mock("POST", "/mcp")
            .match_body(Matcher::PartialJson(json!({"method": "notifications/initialized"})))
            .with_status(202)
            .create_async()
            .await;

        let client = StreamableHttpClient::new(
            Url::parse(&format!("{}/mcp", server.url())).unwrap(),
            HashMap::new(),
        );
        client.initialize(&RequestContext::background()).await.unwrap();
        BackendClient::from(client)
    }

    #[tokio::test]
    async fn idle_session_connections_are_closed() {
        let mut server = mockito::Server::new_async().await;
        let connector = SessionConnector::new(Arc::new(ServerDefinitions::new()))
            .with_idle_timeout(Duration::from_secs(60));
        let start = Instant::now();

        connector
            .store("idle", "github".into(), connected_backend(&mut server).await)
            .await;
        connector.store("fresh", "github".into(), unconnected_backend()).await;
        connector.connections.get_mut("idle").unwrap().last_active = start;
        connector.connections.get_mut("fresh").unwrap().last_active = start + Duration::from_secs(60);
        let idle_client = connector.connections.get("idle").unwrap().clients["github"].clone();

        assert_eq!(connector.cleanup_idle_at(start + Duration::from_secs(90)).await, 1);
        assert!(connector.connections("idle").is_empty());
        assert_eq!(connector.connections("fresh"), vec!["github"]);
        assert!(matches!(
            idle_client.ping(&RequestContext::background()).await,
            Err(Error::NotConnected)
        ));
    }

    #[tokio::test]
    async fn lookup_keeps_session_alive() {
        let connector = SessionConnector::new(Arc::new(ServerDefinitions::new()))
            .with_idle_timeout(Duration::from_secs(60));
        let start = Instant::now();
        connector.store("s", "github".into(), unconnected_backend()).await;
        connector.connections.get_mut("s").unwrap().last_active = start;
        tokio::time::sleep(Duration::from_millis(5)).await;

        assert!(connector.client("s", "github").is_some());
        let sweep_at = start + Duration::from_secs(60) + Duration::from_millis(4);
        assert_eq!(connector.cleanup_idle_at(sweep_at).await, 0);
        assert_eq!(connector.session_count(), 1);
    }

    #[tokio::test]
    async fn background_sweep_closes_everything_on_shutdown() {
        let connector = Arc::new(
            SessionConnector::new(Arc::new(ServerDefinitions::new()))
                .with_idle_timeout(Duration::from_millis(10)),
        );
        connector.store("s1", "a".into(), unconnected_backend()).await;

        let shutdown = CancellationToken::new();
        let handle = connector
            .clone()
            .spawn_cleanup(Duration::from_millis(20), shutdown.clone());
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(connector.session_count(), 0);

        connector.store("s2", "a".into(), unconnected_backend()).await;
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("sweep stops on shutdown")
            .unwrap();
        assert_eq!(connector.session_count(), 0);
    }

    #[test]
    fn forwarding_requires_flag_remote_and_enabled() {
        let remote = ServerDefinition::new(
            "r",
            TransportDefinition::StreamableHttp {
                url: "https://r.example.com/mcp".into(),
                headers: HashMap::new(),
            },
        );
        assert!(!should_forward_token(&remote));
        assert!(should_forward_token(&remote.clone().with_forward_token(true)));

        let mut disabled = remote.with_forward_token(true);
        disabled.enabled = false;
        assert!(!should_forward_token(&disabled));

        let local = ServerDefinition::new(
            "l",
            TransportDefinition::Stdio {
                command: "x".into(),
                args: Vec::new(),
                env: HashMap::new(),
            },
        )
        .with_forward_token(true);
        assert!(!should_forward_token(&local));
    }

    #[tokio::test]
    async fn connects_forwarding_backends_with_identity_token() {
        let id_token = jwt_with_exp(now() + 3600);
        let bearer = format!("Bearer {}", id_token);

        let mut server = mockito::Server::new_async().await;
        let init = server
            .mock("POST", "/mcp")
            .match_header("authorization", bearer.as_str())
            .match_body(Matcher::PartialJson(json!({"method": "initialize"})))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                json!({
                    "jsonrpc": "2.0",
                    "id": 1,
                    "result": {
                        "protocolVersion": "2024-11-05",
                        "capabilities": {},
                        "serverInfo": {"name": "backend", "version": "1"}
                    }
                })
                .to_string(),
            )
            .create_async()
            .await;
        server
            .mock("POST", "/mcp")
            .match_body(Matcher::PartialJson(json!({"method": "notifications/initialized"})))
            .with_status(202)
            .create_async()
            .await;
        server
            .mock("POST", "/mcp")
            .match_body(Matcher::PartialJson(json!({"method": "tools/list"})))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(json!({"jsonrpc": "2.0", "id": 2, "result": {"tools": []}}).to_string())
            .create_async()
            .await;

        let mut definitions = ServerDefinitions::new();
        definitions.insert(
            ServerDefinition::new(
                "forwarded",
                TransportDefinition::StreamableHttp {
                    url: format!("{}/mcp", server.url()),
                    headers: HashMap::new(),
                },
            )
            .with_forward_token(true),
        );
        definitions.insert(ServerDefinition::new(
            "not-forwarded",
            TransportDefinition::StreamableHttp {
                url: "http://127.0.0.1:1/mcp".into(),
                headers: HashMap::new(),
            },
        ));

        let connector = SessionConnector::new(Arc::new(definitions));
        let init_data = SessionInit {
            session_id: "session-1".into(),
            email: "alice@example.com".into(),
            id_token,
        };
        connector
            .on_session_init(
                &RequestContext::background().with_timeout(Duration::from_secs(10)),
                &init_data,
            )
            .await;

        init.assert_async().await;
        assert_eq!(connector.connections("session-1"), vec!["forwarded"]);
        assert!(connector.client("session-1", "forwarded").is_some());

        connector.disconnect_session("session-1").await;
        assert!(connector.connections("session-1").is_empty());
    }

    #[tokio::test]
    async fn expired_token_skips_all_backends() {
        let mut definitions = ServerDefinitions::new();
        definitions.insert(
            ServerDefinition::new(
                "forwarded",
                TransportDefinition::StreamableHttp {
                    url: "http://127.0.0.1:1/mcp".into(),
                    headers: HashMap::new(),
                },
            )
            .with_forward_token(true),
        );
        let connector = SessionConnector::new(Arc::new(definitions));
        connector
            .on_session_init(
                &RequestContext::background(),
                &SessionInit {
                    session_id: "s".into(),
                    email: "e@example.com".into(),
                    id_token: jwt_with_exp(now() - 60),
                },
            )
            .await;
        assert!(connector.connections("s").is_empty());
    }

    #[tokio::test]
    async fn failed_backend_is_not_recorded() {
        let mut definitions = ServerDefinitions::new();
        definitions.insert(
            ServerDefinition::new(
                "down",
                TransportDefinition::StreamableHttp {
                    url: "http://127.0.0.1:1/mcp".into(),
                    headers: HashMap::new(),
                },
            )
            .with_forward_token(true),
        );
        let connector = SessionConnector::new(Arc::new(definitions));
        connector
            .on_session_init(
                &RequestContext::background().with_timeout(Duration::from_secs(5)),
                &SessionInit {
                    session_id: "s".into(),
                    email: "e@example.com".into(),
                    id_token: jwt_with_exp(now() + 3600),
                },
            )
            .await;
        assert!(connector.connections("s").is_empty());
    }
}
