//! Detection of "authentication required" failures.
//!
//! Remote transports run every handshake and request failure through
//! [`check_for_auth_required`]. A 401-class failure is re-classified into
//! [`Error::AuthRequired`] carrying whatever could be parsed from the
//! `WWW-Authenticate` challenge, so callers can start an OAuth flow instead
//! of treating the backend as broken.

use crate::error::{Error, TransportError};
use regex::Regex;
use std::sync::LazyLock;
use url::Url;

static CHALLENGE_PARAM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(\w+)="([^"]*)""#).expect("challenge regex is valid"));

static UNAUTHORIZED_TEXT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b401\b|\bunauthorized\b").expect("status regex is valid"));

/// Structured challenge metadata. Any field may be missing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthChallenge {
    /// Auth scheme, e.g. `Bearer`
    pub scheme: Option<String>,
    /// Raw realm parameter
    pub realm: Option<String>,
    /// Issuer URL, taken from the realm when it is an http(s) URL
    pub issuer: Option<String>,
    /// Required scope
    pub scope: Option<String>,
    /// RFC 9728 protected-resource metadata location
    pub resource_metadata_url: Option<String>,
    /// RFC 6750 error code
    pub error: Option<String>,
    /// Human-readable error description
    pub error_description: Option<String>,
}

impl AuthChallenge {
    /// Whether nothing could be parsed.
    pub fn is_empty(&self) -> bool {
        self == &AuthChallenge::default()
    }
}

/// Best-effort parse of a `WWW-Authenticate` value.
pub fn parse_www_authenticate(header: &str) -> AuthChallenge {
    let header = header.trim();
    let mut challenge = AuthChallenge::default();

    if let Some(first) = header.split_whitespace().next() {
        if !first.contains('=') {
            challenge.scheme = Some(first.trim_end_matches(',').to_string());
        }
    }

    for caps in CHALLENGE_PARAM.captures_iter(header) {
        let value = caps[2].to_string();
        match caps[1].to_ascii_lowercase().as_str() {
            "realm" => challenge.realm = Some(value),
            "scope" => challenge.scope = Some(value),
            "resource_metadata" => challenge.resource_metadata_url = Some(value),
            "error" => challenge.error = Some(value),
            "error_description" => challenge.error_description = Some(value),
            _ => {},
        }
    }

    challenge.issuer = challenge
        .realm
        .as_deref()
        .and_then(|realm| Url::parse(realm).ok())
        .filter(|url| matches!(url.scheme(), "http" | "https"))
        .map(|url| url.to_string().trim_end_matches('/').to_string());

    challenge
}

/// A 401-class failure with its parsed challenge.
#[derive(Debug, thiserror::Error)]
#[error("authentication required for {url}")]
pub struct AuthRequiredError {
    /// URL that produced the failure
    pub url: String,
    /// Parsed challenge, possibly incomplete
    pub challenge: AuthChallenge,
    /// Original failure
    #[source]
    pub source: Error,
}

/// Whether `err` carries 401 evidence.
///
/// Status codes carried in the error win. Message text is only consulted
/// for HTTP client failures that carry no status; JSON-RPC errors and
/// framing errors are never treated as authentication failures.
pub fn is_unauthorized(err: &Error) -> bool {
    if err.auth_required().is_some() {
        return true;
    }
    if let Some((status, _)) = err.http_status() {
        return status == 401;
    }
    match err.root() {
        Error::Transport(TransportError::NoToken) => true,
        Error::Transport(TransportError::Request(message)) => UNAUTHORIZED_TEXT.is_match(message),
        _ => false,
    }
}

/// Re-classify a 401-class failure as [`Error::AuthRequired`]; any other
/// error is returned unchanged.
pub fn check_for_auth_required(err: Error, url: &str) -> Error {
    if err.auth_required().is_some() || !is_unauthorized(&err) {
        return err;
    }

    let challenge = match err.http_status() {
        Some((_, Some(header))) => parse_www_authenticate(header),
        _ => challenge_from_message(&err.to_string()),
    };

    tracing::info!(
        url,
        issuer = ?challenge.issuer,
        resource_metadata = ?challenge.resource_metadata_url,
        "backend requires authentication"
    );

    Error::AuthRequired(Box::new(AuthRequiredError {
        url: url.to_string(),
        challenge,
        source: err,
    }))
}

fn challenge_from_message(message: &str) -> AuthChallenge {
    match message.find("Bearer ") {
        Some(start) => parse_www_authenticate(&message[start..]),
        None => AuthChallenge::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    fn http_error(status: u16, header: Option<&str>) -> Error {
        Error::Transport(TransportError::HttpStatus {
            status,
            www_authenticate: header.map(str::to_string),
            body: String::new(),
        })
    }

    #[test]
    fn parses_full_bearer_challenge() {
        let challenge = parse_www_authenticate(
            r#"Bearer realm="https://auth.example.com/", scope="mcp:read mcp:write", resource_metadata="https://api.example.com/.well-known/oauth-protected-resource", error="invalid_token", error_description="expired""#,
        );
        assert_eq!(
            challenge,
            AuthChallenge {
                scheme: Some("Bearer".to_string()),
                realm: Some("https://auth.example.com/".to_string()),
                issuer: Some("https://auth.example.com".to_string()),
                scope: Some("mcp:read mcp:write".to_string()),
                resource_metadata_url: Some(
                    "https://api.example.com/.well-known/oauth-protected-resource".to_string()
                ),
                error: Some("invalid_token".to_string()),
                error_description: Some("expired".to_string()),
            }
        );
    }

    #[test]
    fn non_url_realm_is_not_an_issuer() {
        let challenge = parse_www_authenticate(r#"Bearer realm="mcp""#);
        assert_eq!(challenge.realm.as_deref(), Some("mcp"));
        assert_eq!(challenge.issuer, None);
    }

    #[test]
    fn malformed_header_yields_partial_challenge() {
        let challenge = parse_www_authenticate(r#"Bearer scope="read", realm=unquoted, error="#);
        assert_eq!(challenge.scope.as_deref(), Some("read"));
        assert_eq!(challenge.realm, None);
    }

    #[rstest]
    #[case(http_error(401, None), true)]
    #[case(http_error(403, None), false)]
    #[case(http_error(500, None), false)]
    #[case(Error::Transport(TransportError::Request("HTTP 401 Unauthorized".into())), true)]
    #[case(Error::Transport(TransportError::Request("connection refused".into())), false)]
    #[case(Error::Transport(TransportError::NoToken), true)]
    #[case(Error::protocol(-32602, "GitHub API returned 401 for repo foo"), false)]
    #[case(Error::protocol(-32000, "Unauthorized access to resource"), false)]
    #[case(Error::Transport(TransportError::InvalidMessage("no response for request 401".into())), false)]
    #[case(Error::Transport(TransportError::ConnectionClosed), false)]
    #[case(Error::Transport(TransportError::Request("error sending request for url (http://127.0.0.1:4010/mcp)".into())), false)]
    fn detects_unauthorized(#[case] err: Error, #[case] expected: bool) {
        assert_eq!(is_unauthorized(&err), expected);
    }

    #[test]
    fn wraps_401_with_challenge_and_cause() {
        let err = check_for_auth_required(
            http_error(
                401,
                Some(r#"Bearer resource_metadata="https://mcp.example.com/.well-known/oauth-protected-resource""#),
            ),
            "https://mcp.example.com/mcp",
        );

        let auth = err.auth_required().expect("auth required");
        assert_eq!(auth.url, "https://mcp.example.com/mcp");
        assert_eq!(
            auth.challenge.resource_metadata_url.as_deref(),
            Some("https://mcp.example.com/.well-known/oauth-protected-resource")
        );
        assert_eq!(auth.source.http_status(), Some((401, Some(r#"Bearer resource_metadata="https://mcp.example.com/.well-known/oauth-protected-resource""#))));
    }

    #[test]
    fn json_rpc_error_mentioning_401_is_not_reclassified() {
        let err = check_for_auth_required(
            Error::Operation {
                operation: "call_tool",
                source: Box::new(Error::protocol(-32602, "upstream returned 401")),
            },
            "https://x.example.com/mcp",
        );
        assert!(err.auth_required().is_none());
        assert!(matches!(err.root(), Error::Protocol { code: -32602, .. }));
    }

    #[test]
    fn leaves_other_errors_untouched() {
        let err = check_for_auth_required(http_error(502, None), "https://x.example.com");
        assert!(err.auth_required().is_none());
        assert_eq!(err.http_status(), Some((502, None)));
    }
}
