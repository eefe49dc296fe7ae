//! Optional static bootstrap configuration: initial rules, listener bind
//! addresses, and engine parameters, loadable from a YAML or JSON file for
//! the CLI wrapper and integration tests. `Config::from_file` and `validate`
//! are kept as separate steps so callers can inspect a parsed-but-invalid
//! config before deciding whether to bail.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::channel::wire::RuleWire;
use crate::error::{ProxyError, Result};

fn default_listen() -> String {
    "127.0.0.1:0".to_string()
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Address the plain HTTP/H2 listener binds. Port `0` picks an ephemeral
    /// port, which is how `wiretap-cli` runs by default.
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Address the admin duplex channel listener binds, if this config wants
    /// one started. Absent means no channel listener is started — the engine
    /// is driven purely by the rules below.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_listen: Option<String>,
    #[serde(default)]
    pub rules: Vec<RuleWire>,
    #[serde(default)]
    pub parameters: HashMap<String, Value>,
    #[serde(default)]
    pub debug: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            channel_listen: None,
            rules: Vec::new(),
            parameters: HashMap::new(),
            debug: false,
        }
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ProxyError::Validation(format!("could not read config file {path:?}: {e}")))?;
        let config: Config = if path.extension().and_then(|e| e.to_str()) == Some("json") {
            serde_json::from_str(&contents)
                .map_err(|e| ProxyError::Validation(format!("invalid JSON config {path:?}: {e}")))?
        } else {
            serde_yaml::from_str(&contents)
                .map_err(|e| ProxyError::Validation(format!("invalid YAML config {path:?}: {e}")))?
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.listen
            .parse::<SocketAddr>()
            .map_err(|e| ProxyError::Validation(format!("invalid listen address {:?}: {e}", self.listen)))?;
        if let Some(channel_listen) = &self.channel_listen {
            channel_listen
                .parse::<SocketAddr>()
                .map_err(|e| ProxyError::Validation(format!("invalid channel listen address {:?}: {e}", channel_listen)))?;
        }
        for rule in &self.rules {
            if rule.matchers.is_empty() {
                return Err(ProxyError::Validation(format!(
                    "rule {:?} has no matchers",
                    rule.id.as_deref().unwrap_or("<unnamed>")
                )));
            }
            if rule.steps.is_empty() {
                return Err(ProxyError::Validation(format!(
                    "rule {:?} has no steps",
                    rule.id.as_deref().unwrap_or("<unnamed>")
                )));
            }
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> Result<SocketAddr> {
        self.listen
            .parse()
            .map_err(|e| ProxyError::Validation(format!("invalid listen address {:?}: {e}", self.listen)))
    }

    pub fn channel_listen_addr(&self) -> Result<Option<SocketAddr>> {
        self.channel_listen
            .as_ref()
            .map(|s| {
                s.parse()
                    .map_err(|e| ProxyError::Validation(format!("invalid channel listen address {s:?}: {e}")))
            })
            .transpose()
    }
}
