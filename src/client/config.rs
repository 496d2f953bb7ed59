//! Declarative backend definitions.
//!
//! Definitions are usually loaded from a TOML document:
//!
//! ```toml
//! [servers.github]
//! type = "streamable-http"
//! url = "https://mcp.example.com/mcp"
//! forward_token = true
//!
//! [servers.files]
//! type = "stdio"
//! command = "mcp-files"
//! args = ["--root", "/srv"]
//! env = { LOG_LEVEL = "debug" }
//! ```

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

/// How to reach one backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum TransportDefinition {
    /// Local subprocess
    Stdio {
        /// Executable to run
        command: String,
        /// Command-line arguments
        #[serde(default)]
        args: Vec<String>,
        /// Extra environment variables
        #[serde(default)]
        env: HashMap<String, String>,
    },
    /// Streamable HTTP endpoint
    StreamableHttp {
        /// Endpoint URL
        url: String,
        /// Static request headers
        #[serde(default)]
        headers: HashMap<String, String>,
    },
    /// Event-stream endpoint
    Sse {
        /// Stream URL
        url: String,
        /// Static request headers
        #[serde(default)]
        headers: HashMap<String, String>,
    },
}

impl TransportDefinition {
    /// Whether the backend is reached over the network.
    pub fn is_remote(&self) -> bool {
        !matches!(self, TransportDefinition::Stdio { .. })
    }

    /// URL of a remote backend.
    pub fn url(&self) -> Option<&str> {
        match self {
            TransportDefinition::Stdio { .. } => None,
            TransportDefinition::StreamableHttp { url, .. } | TransportDefinition::Sse { url, .. } => {
                Some(url)
            },
        }
    }
}

/// One named backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerDefinition {
    /// Unique name; filled from the table key when loaded from TOML
    #[serde(default)]
    pub name: String,
    /// Transport settings
    #[serde(flatten)]
    pub transport: TransportDefinition,
    /// Connect on the user's behalf with their forwarded identity token
    #[serde(default)]
    pub forward_token: bool,
    /// Disabled definitions are ignored
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl ServerDefinition {
    /// Create an enabled definition.
    pub fn new(name: impl Into<String>, transport: TransportDefinition) -> Self {
        Self {
            name: name.into(),
            transport,
            forward_token: false,
            enabled: true,
        }
    }

    /// Mark the definition for identity-token forwarding.
    pub fn with_forward_token(mut self, forward_token: bool) -> Self {
        self.forward_token = forward_token;
        self
    }
}

/// Read access to the configured backends.
pub trait DefinitionStore: Send + Sync {
    /// Look up one definition by name.
    fn get(&self, name: &str) -> Option<ServerDefinition>;

    /// Every definition, in a stable order.
    fn list(&self) -> Vec<ServerDefinition>;
}

/// A set of definitions keyed by name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerDefinitions {
    /// Definitions by name
    #[serde(default)]
    pub servers: BTreeMap<String, ServerDefinition>,
}

impl ServerDefinitions {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load definitions from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&content)
    }

    /// Parse definitions from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self> {
        let mut definitions: Self = toml::from_str(content)
            .map_err(|e| Error::Configuration(format!("invalid server definitions: {}", e)))?;
        for (name, definition) in definitions.servers.iter_mut() {
            definition.name = name.clone();
        }
        Ok(definitions)
    }

    /// Add or replace a definition.
    pub fn insert(&mut self, definition: ServerDefinition) {
        self.servers.insert(definition.name.clone(), definition);
    }
}

impl DefinitionStore for ServerDefinitions {
    fn get(&self, name: &str) -> Option<ServerDefinition> {
        self.servers.get(name).cloned()
    }

    fn list(&self) -> Vec<ServerDefinition> {
        self.servers.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    const DEFINITIONS: &str = r#"
[servers.github]
type = "streamable-http"
url = "https://mcp.example.com/mcp"
forward_token = true

[servers.files]
type = "stdio"
command = "mcp-files"
args = ["--root", "/srv"]
env = { LOG_LEVEL = "debug" }

[servers.legacy]
type = "sse"
url = "https://legacy.example.com/sse"
headers = { "X-Api-Key" = "k" }
enabled = false
"#;

    #[test]
    fn parses_all_transport_kinds() {
        let definitions = ServerDefinitions::from_toml(DEFINITIONS).unwrap();
        assert_eq!(definitions.servers.len(), 3);

        let github = definitions.get("github").unwrap();
        assert_eq!(github.name, "github");
        assert!(github.forward_token);
        assert!(github.enabled);
        assert_eq!(github.transport.url(), Some("https://mcp.example.com/mcp"));

        let files = definitions.get("files").unwrap();
        assert!(!files.transport.is_remote());
        match files.transport {
            TransportDefinition::Stdio { command, args, env } => {
                assert_eq!(command, "mcp-files");
                assert_eq!(args, vec!["--root", "/srv"]);
                assert_eq!(env.get("LOG_LEVEL").map(String::as_str), Some("debug"));
            },
            other => panic!("unexpected transport: {:?}", other),
        }

        let legacy = definitions.get("legacy").unwrap();
        assert!(!legacy.enabled);
        assert!(!legacy.forward_token);
    }

    #[test]
    fn list_is_ordered_by_name() {
        let definitions = ServerDefinitions::from_toml(DEFINITIONS).unwrap();
        let names: Vec<_> = definitions.list().into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["files", "github", "legacy"]);
    }

    #[test]
    fn unknown_transport_type_is_rejected() {
        let err = ServerDefinitions::from_toml(
            r#"
[servers.bad]
type = "carrier-pigeon"
url = "https://x"
"#,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(DEFINITIONS.as_bytes()).unwrap();

        let definitions = ServerDefinitions::from_file(file.path()).unwrap();
        assert!(definitions.get("github").is_some());

        assert!(matches!(
            ServerDefinitions::from_file("/nonexistent/servers.toml"),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn insert_replaces_by_name() {
        let mut definitions = ServerDefinitions::new();
        definitions.insert(ServerDefinition::new(
            "a",
            TransportDefinition::Sse {
                url: "https://one.example.com/sse".into(),
                headers: HashMap::new(),
            },
        ));
        definitions.insert(
            ServerDefinition::new(
                "a",
                TransportDefinition::StreamableHttp {
                    url: "https://two.example.com/mcp".into(),
                    headers: HashMap::new(),
                },
            )
            .with_forward_token(true),
        );

        let a = definitions.get("a").unwrap();
        assert_eq!(a.transport.url(), Some("https://two.example.com/mcp"));
        assert!(a.forward_token);
    }
}
