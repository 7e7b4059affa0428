//! Configuration loading: the proxy's JSON configuration document, parsed
//! once at startup into the immutable records the core consumes.

use std::collections::HashMap;
use std::path::Path;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::{AtraxError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum ConflictStrategy {
    FirstWins,
    #[default]
    PrefixWithServerName,
    Reject,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "transportType", rename_all = "camelCase")]
pub enum TransportConfig {
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
    },
    Docker {
        /// The image to run; `docker run --rm -i <command> <args...>`.
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
    },
    Http {
        url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
    },
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfigBody {
    #[serde(flatten)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// An immutable per-session configuration record, named within the proxy.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub name: String,
    pub transport: TransportConfig,
    pub description: Option<String>,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ProxyConfig {
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub host: Option<String>,
    /// Opaque to the core; threaded through to the ambient HTTP listener.
    #[serde(default)]
    pub auth: Option<serde_json::Value>,
    #[serde(default)]
    pub conflict_strategy: ConflictStrategy,
    pub mcp_servers: IndexMap<String, ServerConfigBody>,
}

impl ProxyConfig {
    /// Loads and validates configuration from `path`, applying the `PORT`
    /// environment variable override.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| AtraxError::ConfigInvalid(format!("reading {}: {e}", path.display())))?;
        let mut config: ProxyConfig = serde_json::from_str(&text)
            .map_err(|e| AtraxError::ConfigInvalid(format!("parsing {}: {e}", path.display())))?;

        if let Ok(port_str) = std::env::var("PORT") {
            let port: u16 = port_str
                .parse()
                .map_err(|_| AtraxError::ConfigInvalid(format!("invalid PORT env var: {port_str}")))?;
            config.port = Some(port);
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.mcp_servers.is_empty() {
            return Err(AtraxError::ConfigInvalid(
                "mcpServers must declare at least one upstream".to_string(),
            ));
        }
        for (name, body) in &self.mcp_servers {
            if name.trim().is_empty() {
                return Err(AtraxError::ConfigInvalid("server name must not be blank".to_string()));
            }
            if name.contains("__") {
                return Err(AtraxError::ConfigInvalid(format!(
                    "server name '{name}' must not contain '__', reserved for name prefixing"
                )));
            }
            match &body.transport {
                TransportConfig::Stdio { command, .. } | TransportConfig::Docker { command, .. } => {
                    if command.trim().is_empty() {
                        return Err(AtraxError::ConfigInvalid(format!(
                            "server '{name}': command must not be blank"
                        )));
                    }
                }
                TransportConfig::Http { url, .. } => {
                    url::Url::parse(url).map_err(|e| {
                        AtraxError::ConfigInvalid(format!("server '{name}': invalid url '{url}': {e}"))
                    })?;
                }
            }
        }
        Ok(())
    }

    /// Flattens `mcpServers` into the ordered `ServerConfig` list the
    /// Registry constructs sessions from. Order follows the configuration
    /// document's own key order (`IndexMap` preserves insertion order).
    pub fn server_configs(&self) -> Vec<ServerConfig> {
        self.mcp_servers
            .iter()
            .map(|(name, body)| ServerConfig {
                name: name.clone(),
                transport: body.transport.clone(),
                description: body.description.clone(),
                tags: body.tags.clone(),
            })
            .collect()
    }
}
