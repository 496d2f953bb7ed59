//! Shared HTTP and log-redaction helpers.

use crate::error::{Error, Result};
use http::header::{HeaderMap, HeaderName, HeaderValue};

/// Build a header map from static name/value pairs.
///
/// Invalid names or values are a configuration error, reported before any
/// request is sent.
pub fn header_map<'a, I>(pairs: I) -> Result<HeaderMap>
where
    I: IntoIterator<Item = (&'a String, &'a String)>,
{
    let mut headers = HeaderMap::new();
    for (name, value) in pairs {
        let header_name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| Error::TransportCreation(format!("invalid header name {}: {}", name, e)))?;
        let header_value = HeaderValue::from_str(value).map_err(|e| {
            Error::TransportCreation(format!("invalid value for header {}: {}", name, e))
        })?;
        headers.append(header_name, header_value);
    }
    Ok(headers)
}

/// Keep the auth scheme of an `Authorization` value and hide the credential.
pub fn redact_authorization(value: &str) -> String {
    match value.split_once(' ') {
        Some((scheme, _)) => format!("{} [REDACTED]", scheme),
        None => "[REDACTED]".to_string(),
    }
}

/// Shorten an email for logs: the first 8 characters followed by `...`.
pub fn truncate_email(email: &str) -> String {
    truncate_for_log(email, 8)
}

/// Shorten a session id for logs.
pub fn truncate_session_id(session_id: &str) -> String {
    truncate_for_log(session_id, 8)
}

fn truncate_for_log(value: &str, keep: usize) -> String {
    if value.chars().count() <= keep {
        return value.to_string();
    }
    let prefix: String = value.chars().take(keep).collect();
    format!("{}...", prefix)
}
