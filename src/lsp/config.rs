//! Language server configuration
//!
//! A [`ServerConfig`] binds a grammar scope prefix to the command that
//! launches the matching language server. Registration order matters: the
//! registry evaluates entries in the order they were configured.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Configuration for one language server, keyed by grammar scope prefix
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Scope prefix this server handles (e.g. "source.python")
    pub scope_key: String,

    /// Command used to spawn the server process
    pub command: String,

    /// Command line arguments
    #[serde(default)]
    pub args: Vec<String>,

    /// Environment overrides merged over the inherited environment
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Disabled entries never match and never spawn a process
    #[serde(default)]
    pub enabled: bool,
}

impl ServerConfig {
    /// Merge a partial configuration over this entry's fields
    pub fn apply(&mut self, patch: ServerConfigPatch) {
        if let Some(command) = patch.command {
            self.command = command;
        }
        if let Some(args) = patch.args {
            self.args = args;
        }
        if let Some(env) = patch.env {
            self.env = env;
        }
        if let Some(enabled) = patch.enabled {
            self.enabled = enabled;
        }
    }
}

/// Partial configuration used by reconfigure calls
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfigPatch {
    pub command: Option<String>,
    pub args: Option<Vec<String>>,
    pub env: Option<HashMap<String, String>>,
    pub enabled: Option<bool>,
}

impl ServerConfigPatch {
    /// Build a fresh entry for an unknown key
    ///
    /// Fields the patch does not carry fall back to defaults; a missing
    /// command yields an entry that stays unusable until reconfigured.
    pub fn into_config(self, scope_key: String) -> ServerConfig {
        ServerConfig {
            scope_key,
            command: self.command.unwrap_or_default(),
            args: self.args.unwrap_or_default(),
            env: self.env.unwrap_or_default(),
            enabled: self.enabled.unwrap_or(false),
        }
    }
}

/// The stock configuration table
///
/// All entries ship disabled: each depends on an external binary the host
/// may not have installed, and enabling one is an explicit reconfigure call.
pub fn default_configs() -> Vec<ServerConfig> {
    vec![
        ServerConfig {
            scope_key: "source.javascript".to_string(),
            command: "typescript-language-server".to_string(),
            args: vec!["--stdio".to_string()],
            env: HashMap::new(),
            enabled: false,
        },
        ServerConfig {
            scope_key: "source.python".to_string(),
            command: "pylsp".to_string(),
            args: Vec::new(),
            env: HashMap::new(),
            enabled: false,
        },
        ServerConfig {
            scope_key: "source.go".to_string(),
            command: "gopls".to_string(),
            args: Vec::new(),
            env: HashMap::new(),
            enabled: false,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_merges_only_present_fields() {
        let mut config = ServerConfig {
            scope_key: "source.python".to_string(),
            command: "pylsp".to_string(),
            args: vec!["-v".to_string()],
            env: HashMap::new(),
            enabled: false,
        };

        config.apply(ServerConfigPatch {
            enabled: Some(true),
            ..Default::default()
        });

        assert!(config.enabled);
        assert_eq!(config.command, "pylsp");
        assert_eq!(config.args, ["-v"]);
    }

    #[test]
    fn test_patch_into_config_defaults() {
        let patch = ServerConfigPatch {
            command: Some("gopls".to_string()),
            ..Default::default()
        };

        let config = patch.into_config("source.go".to_string());
        assert_eq!(config.scope_key, "source.go");
        assert_eq!(config.command, "gopls");
        assert!(config.args.is_empty());
        assert!(!config.enabled);
    }

    #[test]
    fn test_config_deserializes_with_defaults() {
        let config: ServerConfig = serde_json::from_str(
            r#"{"scope_key": "source.rust", "command": "rust-analyzer"}"#,
        )
        .unwrap();
        assert!(!config.enabled);
        assert!(config.args.is_empty());
        assert!(config.env.is_empty());
    }

    #[test]
    fn test_default_configs_ship_disabled() {
        let configs = default_configs();
        assert_eq!(configs.len(), 3);
        assert!(configs.iter().all(|c| !c.enabled));
    }

    #[test]
    fn test_config_table_loads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("servers.json");
        std::fs::write(
            &path,
            r#"[
                {"scope_key": "source.js", "command": "typescript-language-server",
                 "args": ["--stdio"], "enabled": true},
                {"scope_key": "source.rust", "command": "rust-analyzer"}
            ]"#,
        )
        .unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let configs: Vec<ServerConfig> = serde_json::from_str(&contents).unwrap();
        assert_eq!(configs.len(), 2);
        assert!(configs[0].enabled);
        assert_eq!(configs[0].args, ["--stdio"]);
        assert!(!configs[1].enabled);
    }
}
