//! OAuth-protected gateway front door.
//!
//! Every route of the protected router passes two stages before it reaches
//! the downstream dispatcher:
//!
//! 1. bearer validation, which rejects the request with a 401 challenge or
//!    stores the caller's [`AuthContext`] in the request extensions;
//! 2. upstream-token injection, which resolves the caller's stored upstream
//!    token, exposes it as a [`ForwardedIdentity`] extension and, when the
//!    request carries a session header, lets the [`SessionTracker`] decide
//!    whether SSO propagation has to run for that session.
//!
//! The OAuth 2.1 endpoints themselves are supplied by the caller as an
//! [`axum::Router`] and merged in unchanged.
//!
//! # Examples
//!
//! ```rust,no_run
//! use pmcp_gateway::server::auth::MockValidator;
//! use pmcp_gateway::server::config::GatewayConfig;
//! use pmcp_gateway::server::gateway::OAuthGatewayBuilder;
//! use std::sync::Arc;
//!
//! # async fn run() -> pmcp_gateway::Result<()> {
//! let gateway = OAuthGatewayBuilder::new(GatewayConfig::new("http://localhost:8080"))
//!     .validator(Arc::new(MockValidator::new("dev").with_email("dev@example.com")))
//!     .build()?;
//!
//! let listener = tokio::net::TcpListener::bind("127.0.0.1:8080").await?;
//! gateway.serve(listener).await?;
//! # Ok(())
//! # }
//! ```

use crate::error::{Error, Result};
use crate::server::auth::{AuthContext, TokenValidator};
use crate::server::config::GatewayConfig;
use crate::server::session_tracker::{hash_token, SessionObservation, SessionTracker};
use crate::server::sso::{SessionInit, SessionInitCallback};
use crate::server::token_store::{InMemoryTokenStore, UpstreamToken, UpstreamTokenStore};
use crate::shared::context::RequestContext;
use crate::shared::http_utils::{truncate_email, truncate_session_id};
use crate::types::jsonrpc::JSONRPCResponse;
use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::{Json, Router};
use parking_lot::{Mutex, RwLock};
use serde_json::json;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// JSON-RPC code for a rejected bearer token.
const UNAUTHORIZED_CODE: i32 = -32001;

/// JSON-RPC internal error.
const INTERNAL_ERROR_CODE: i32 = -32603;

/// Upstream credentials of the authenticated caller, placed in the request
/// extensions for the downstream dispatcher.
#[derive(Clone, PartialEq, Eq)]
pub struct ForwardedIdentity {
    /// Caller's email
    pub email: String,
    /// Upstream identity token
    pub id_token: String,
    /// Upstream access token; may be empty
    pub access_token: String,
}

impl ForwardedIdentity {
    fn from_upstream(email: String, token: &UpstreamToken) -> Self {
        Self {
            email,
            id_token: token.id_token.clone(),
            access_token: token.access_token.clone(),
        }
    }

    /// Fingerprint used for session tracking: the access token, or the
    /// identity token when no distinct access token exists.
    pub fn fingerprint(&self) -> String {
        if self.access_token.is_empty() {
            hash_token(&self.id_token)
        } else {
            hash_token(&self.access_token)
        }
    }
}

impl fmt::Debug for ForwardedIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForwardedIdentity")
            .field("email", &truncate_email(&self.email))
            .field("has_id_token", &!self.id_token.is_empty())
            .field("has_access_token", &!self.access_token.is_empty())
            .finish()
    }
}

type CallbackSlot = Arc<RwLock<Option<Arc<dyn SessionInitCallback>>>>;

#[derive(Clone)]
struct GatewayState {
    config: Arc<GatewayConfig>,
    validator: Arc<dyn TokenValidator>,
    tokens: Arc<dyn UpstreamTokenStore>,
    tracker: Arc<SessionTracker>,
    callback: CallbackSlot,
    tasks: TaskTracker,
}

impl GatewayState {
    fn session_id(&self, headers: &HeaderMap) -> Option<String> {
        headers
            .get(self.config.session_header.as_str())
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    }

    fn trigger_sso(&self, session_id: String, identity: &ForwardedIdentity, reason: SessionObservation) {
        let session = truncate_session_id(&session_id);
        let Some(callback) = self.callback.read().clone() else {
            tracing::info!(session = %session, "no session init callback registered; skipping SSO");
            return;
        };

        tracing::info!(
            session = %session,
            user = %truncate_email(&identity.email),
            reason = ?reason,
            "triggering SSO propagation"
        );

        let init = SessionInit {
            session_id,
            email: identity.email.clone(),
            id_token: identity.id_token.clone(),
        };
        let timeout = self.config.sso_timeout();
        // Detached from the inbound request: the response may be sent first.
        self.tasks.spawn(async move {
            let ctx = RequestContext::background().with_timeout(timeout);
            callback.on_session_init(&ctx, &init).await;
            tracing::debug!(session = %truncate_session_id(&init.session_id), "SSO propagation finished");
        });
    }
}

/// Builder for [`OAuthGateway`].
pub struct OAuthGatewayBuilder {
    config: GatewayConfig,
    validator: Option<Arc<dyn TokenValidator>>,
    tokens: Option<Arc<dyn UpstreamTokenStore>>,
    oauth_routes: Option<Router>,
    protected_routes: Option<Router>,
    callback: Option<Arc<dyn SessionInitCallback>>,
}

impl fmt::Debug for OAuthGatewayBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OAuthGatewayBuilder")
            .field("config", &self.config)
            .field("has_validator", &self.validator.is_some())
            .field("has_token_store", &self.tokens.is_some())
            .field("has_oauth_routes", &self.oauth_routes.is_some())
            .field("has_protected_routes", &self.protected_routes.is_some())
            .field("has_callback", &self.callback.is_some())
            .finish()
    }
}

impl OAuthGatewayBuilder {
    /// Start from a configuration.
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            config,
            validator: None,
            tokens: None,
            oauth_routes: None,
            protected_routes: None,
            callback: None,
        }
    }

    /// Inbound bearer-token validator. Required.
    pub fn validator(mut self, validator: Arc<dyn TokenValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    /// Upstream token store. Defaults to an empty [`InMemoryTokenStore`].
    pub fn token_store(mut self, tokens: Arc<dyn UpstreamTokenStore>) -> Self {
        self.tokens = Some(tokens);
        self
    }

    /// OAuth 2.1 endpoints (metadata, registration, authorize, token, ...),
    /// served without authentication.
    pub fn oauth_routes(mut self, routes: Router) -> Self {
        self.oauth_routes = Some(routes);
        self
    }

    /// Downstream dispatcher mounted behind the protection stages. Every
    /// route it serves requires a valid bearer token, whatever its path.
    /// Without it, `protected_paths` are mounted with a placeholder that
    /// answers 503.
    pub fn protected_routes(mut self, routes: Router) -> Self {
        self.protected_routes = Some(routes);
        self
    }

    /// Callback invoked when a session needs SSO propagation.
    pub fn session_init_callback(mut self, callback: Arc<dyn SessionInitCallback>) -> Self {
        self.callback = Some(callback);
        self
    }

    /// Validate the configuration and assemble the gateway.
    pub fn build(self) -> Result<OAuthGateway> {
        self.config.validate()?;
        let validator = self
            .validator
            .ok_or_else(|| Error::Configuration("gateway requires a token validator".into()))?;

        let config = Arc::new(self.config);
        let state = GatewayState {
            tracker: Arc::new(SessionTracker::new(config.session_ttl())),
            tokens: self
                .tokens
                .unwrap_or_else(|| Arc::new(InMemoryTokenStore::new())),
            callback: Arc::new(RwLock::new(self.callback)),
            tasks: TaskTracker::new(),
            validator,
            config,
        };

        let protected = self
            .protected_routes
            .unwrap_or_else(|| unconfigured_dispatch(&state.config.protected_paths));
        // Layers run outermost-last: bearer validation precedes injection.
        let protected = protected
            .layer(middleware::from_fn_with_state(state.clone(), inject_upstream_token))
            .layer(middleware::from_fn_with_state(state.clone(), require_bearer));

        let mut router = Router::new().route("/health", get(health));
        if let Some(oauth) = self.oauth_routes {
            router = router.merge(oauth);
        }
        let router = router.merge(protected);

        tracing::debug!(
            base_url = %state.config.base_url,
            protected = ?state.config.protected_paths,
            "gateway assembled"
        );

        Ok(OAuthGateway {
            router,
            state,
            shutdown: CancellationToken::new(),
            cleanup: Mutex::new(None),
        })
    }
}

/// The assembled gateway: a router plus the background work it owns.
pub struct OAuthGateway {
    router: Router,
    state: GatewayState,
    shutdown: CancellationToken,
    cleanup: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for OAuthGateway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OAuthGateway")
            .field("base_url", &self.state.config.base_url)
            .field("sessions", &self.state.tracker.len())
            .field("shutdown", &self.shutdown.is_cancelled())
            .finish()
    }
}

impl OAuthGateway {
    /// Router serving health, OAuth, and protected routes.
    pub fn router(&self) -> Router {
        self.router.clone()
    }

    /// Gateway configuration.
    pub fn config(&self) -> &GatewayConfig {
        &self.state.config
    }

    /// The session tracker.
    pub fn session_tracker(&self) -> Arc<SessionTracker> {
        Arc::clone(&self.state.tracker)
    }

    /// Register or replace the session-init callback. Takes effect for the
    /// next triggered session.
    pub fn set_session_init_callback(&self, callback: Arc<dyn SessionInitCallback>) {
        *self.state.callback.write() = Some(callback);
    }

    /// Start the periodic session sweep. Calling it again is a no-op.
    pub fn start_cleanup(&self) {
        let mut cleanup = self.cleanup.lock();
        if cleanup.is_some() || self.shutdown.is_cancelled() {
            return;
        }
        let interval = self.state.config.cleanup_interval();
        tracing::info!(
            interval_secs = interval.as_secs(),
            ttl_secs = self.state.config.session_ttl().as_secs(),
            "starting session cleanup"
        );
        *cleanup = Some(
            Arc::clone(&self.state.tracker).spawn_cleanup(interval, self.shutdown.child_token()),
        );
    }

    /// Serve on `listener` until [`shutdown`](Self::shutdown) is called, then
    /// finish teardown.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        self.start_cleanup();
        if let Ok(addr) = listener.local_addr() {
            tracing::info!(%addr, "gateway listening");
        }

        axum::serve(listener, self.router())
            .with_graceful_shutdown(self.shutdown.clone().cancelled_owned())
            .await?;

        self.shutdown().await;
        Ok(())
    }

    /// Stop the sweep and wait for in-flight SSO propagation.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();

        let handle = self.cleanup.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "session cleanup task failed");
            }
        }

        self.state.tasks.close();
        self.state.tasks.wait().await;
        tracing::info!("gateway stopped");
    }

    /// Wait until every SSO propagation spawned so far has finished.
    pub async fn wait_for_sso(&self) {
        self.state.tasks.close();
        self.state.tasks.wait().await;
        if !self.shutdown.is_cancelled() {
            self.state.tasks.reopen();
        }
    }
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

fn unconfigured_dispatch(paths: &[String]) -> Router {
    let unique: BTreeSet<&str> = paths.iter().map(String::as_str).collect();
    unique.into_iter().fold(Router::new(), |router, path| {
        router.route(path, any(no_dispatcher))
    })
}

async fn no_dispatcher() -> Response {
    let body = JSONRPCResponse::error(None, INTERNAL_ERROR_CODE, "no backend dispatcher configured");
    (StatusCode::SERVICE_UNAVAILABLE, Json(body)).into_response()
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then_some(token)
}

fn unauthorized(config: &GatewayConfig, invalid: Option<&str>) -> Response {
    let mut challenge = format!(
        "Bearer resource_metadata=\"{}\"",
        config.resource_metadata_url()
    );
    let message = match invalid {
        Some(description) => {
            let description = description.replace('"', "'");
            challenge.push_str(&format!(
                ", error=\"invalid_token\", error_description=\"{}\"",
                description
            ));
            format!("invalid token: {}", description)
        },
        None => "missing bearer token".to_string(),
    };

    let body = JSONRPCResponse::error(None, UNAUTHORIZED_CODE, message);
    (
        StatusCode::UNAUTHORIZED,
        [(header::WWW_AUTHENTICATE, challenge)],
        Json(body),
    )
        .into_response()
}

async fn require_bearer(State(state): State<GatewayState>, mut request: Request, next: Next) -> Response {
    let Some(token) = bearer_token(request.headers()).map(str::to_string) else {
        tracing::debug!(path = %request.uri().path(), "rejecting request without bearer token");
        return unauthorized(&state.config, None);
    };

    let auth = match state.validator.validate(&token).await {
        Ok(auth) if auth.is_expired() => {
            return unauthorized(&state.config, Some("token expired"));
        },
        Ok(auth) => auth,
        Err(e) => {
            tracing::debug!(error = %e, "bearer token rejected");
            return unauthorized(&state.config, Some(&e.to_string()));
        },
    };

    request.extensions_mut().insert(auth);
    next.run(request).await
}

async fn inject_upstream_token(
    State(state): State<GatewayState>,
    mut request: Request,
    next: Next,
) -> Response {
    let Some(email) = request
        .extensions()
        .get::<AuthContext>()
        .and_then(AuthContext::email)
        .map(str::to_string)
    else {
        tracing::debug!("authenticated caller has no email; continuing without token injection");
        return next.run(request).await;
    };

    let upstream = match state.tokens.get_token(&email).await {
        Some(token) if !token.id_token.is_empty() => token,
        Some(_) => {
            tracing::debug!(user = %truncate_email(&email), "upstream token has no identity token");
            return next.run(request).await;
        },
        None => {
            tracing::debug!(user = %truncate_email(&email), "no upstream token stored");
            return next.run(request).await;
        },
    };

    let identity = ForwardedIdentity::from_upstream(email, &upstream);
    if let Some(session_id) = state.session_id(request.headers()) {
        let observation = state.tracker.observe(&session_id, &identity.fingerprint());
        if observation.should_trigger() {
            state.trigger_sso(session_id, &identity, observation);
        } else {
            tracing::trace!(session = %truncate_session_id(&session_id), "session already initialized");
        }
    }

    request.extensions_mut().insert(identity);
    next.run(request).await
}
