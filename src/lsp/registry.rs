//! Per-scope language server registry
//!
//! [`ServerRegistry`] maps editor scope names (e.g. `source.js.jsx`) to
//! running [`LanguageClient`] instances. Configurations are matched by
//! prefix in registration order, clients are created lazily on first
//! resolve, and crashed servers are evicted so the next resolve respawns
//! them.

use crate::lsp::client::LanguageClient;
use crate::lsp::config::{ServerConfig, ServerConfigPatch, default_configs};
use crate::lsp::error::LspError;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

struct RegistryInner {
    /// Registration order decides prefix-match priority
    configs: Vec<ServerConfig>,
    /// Live clients keyed by the matched config's scope key
    clients: HashMap<String, Arc<LanguageClient>>,
}

/// Registry of language server clients, one per matched scope key
pub struct ServerRegistry {
    inner: Arc<Mutex<RegistryInner>>,
    workspace_root: Option<PathBuf>,
}

impl ServerRegistry {
    /// Empty registry; servers must be added via [`configure`](Self::configure)
    pub fn new(workspace_root: Option<PathBuf>) -> Self {
        Self::with_configs(Vec::new(), workspace_root)
    }

    /// Registry seeded with the built-in (disabled) defaults
    pub fn with_default_configs(workspace_root: Option<PathBuf>) -> Self {
        Self::with_configs(default_configs(), workspace_root)
    }

    pub fn with_configs(configs: Vec<ServerConfig>, workspace_root: Option<PathBuf>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(RegistryInner {
                configs,
                clients: HashMap::new(),
            })),
            workspace_root,
        }
    }

    /// Scope keys currently holding a live client
    pub async fn active_scopes(&self) -> Vec<String> {
        let inner = self.inner.lock().await;
        let mut scopes: Vec<String> = inner.clients.keys().cloned().collect();
        scopes.sort();
        scopes
    }

    /// Resolve a scope name to a running client
    ///
    /// The first enabled config whose scope key prefixes the name wins, so
    /// `source.js.jsx` resolves through a `source.js` entry. Returns None
    /// when no enabled config matches; spawns the server on first use.
    pub async fn resolve(&self, scope_name: &str) -> Result<Option<Arc<LanguageClient>>, LspError> {
        let (key, config) = {
            let inner = self.inner.lock().await;
            let Some(config) = inner
                .configs
                .iter()
                .find(|c| c.enabled && scope_name.starts_with(&c.scope_key))
            else {
                debug!("No enabled language server config for scope {}", scope_name);
                return Ok(None);
            };

            if let Some(client) = inner.clients.get(&config.scope_key) {
                return Ok(Some(Arc::clone(client)));
            }
            (config.scope_key.clone(), config.clone())
        };

        info!("Launching language server for scope key {}", key);
        let client = Arc::new(LanguageClient::new(config));

        // Publish before starting so concurrent resolves share one client
        {
            let mut inner = self.inner.lock().await;
            if let Some(existing) = inner.clients.get(&key) {
                return Ok(Some(Arc::clone(existing)));
            }
            inner.clients.insert(key.clone(), Arc::clone(&client));
        }

        self.spawn_eviction_task(&key, &client);

        if let Err(e) = client.start(self.workspace_root.as_deref()).await {
            warn!("Language server for {} failed to start: {}", key, e);
            self.inner.lock().await.clients.remove(&key);
            return Err(e);
        }

        Ok(Some(client))
    }

    /// Evict the client from the registry when its process dies, so a later
    /// resolve gets a fresh spawn
    fn spawn_eviction_task(&self, key: &str, client: &Arc<LanguageClient>) {
        let key = key.to_string();
        let inner = Arc::clone(&self.inner);
        let mut exits = client.subscribe_exits();
        let evicted = Arc::downgrade(client);

        tokio::spawn(async move {
            let Ok(event) = exits.recv().await else {
                return;
            };
            warn!(
                "Evicting crashed language server for {} (exit code {:?})",
                key, event.code
            );
            let mut inner = inner.lock().await;
            // Only evict the same instance; a respawn may already occupy the key
            if let Some(current) = inner.clients.get(&key) {
                let same = evicted.upgrade().is_some_and(|c| Arc::ptr_eq(current, &c));
                if same {
                    inner.clients.remove(&key);
                }
            }
        });
    }

    /// Merge a config patch for a scope key, inserting the entry when new
    ///
    /// A running client for that key is stopped so the next resolve picks up
    /// the new settings.
    pub async fn configure(&self, scope_key: &str, patch: ServerConfigPatch) -> Result<(), LspError> {
        let stopped = {
            let mut inner = self.inner.lock().await;
            match inner.configs.iter_mut().find(|c| c.scope_key == scope_key) {
                Some(config) => config.apply(patch),
                None => {
                    let config = patch.into_config(scope_key.to_string());
                    inner.configs.push(config);
                }
            }
            inner.clients.remove(scope_key)
        };

        if let Some(client) = stopped {
            info!("Restart pending for reconfigured scope key {}", scope_key);
            client.stop().await?;
        }
        Ok(())
    }

    /// Stop and remove the client for one scope key, if any
    pub async fn stop(&self, scope_key: &str) -> Result<(), LspError> {
        let client = self.inner.lock().await.clients.remove(scope_key);
        if let Some(client) = client {
            client.stop().await?;
        }
        Ok(())
    }

    /// Stop every live client; errors from individual stops are logged, not
    /// propagated, so one stubborn server cannot block the rest
    pub async fn stop_all(&self) {
        let clients: Vec<(String, Arc<LanguageClient>)> =
            self.inner.lock().await.clients.drain().collect();

        for (key, client) in clients {
            if let Err(e) = client.stop().await {
                warn!("Failed to stop language server for {}: {}", key, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn config(scope_key: &str, command: &str, enabled: bool) -> ServerConfig {
        ServerConfig {
            scope_key: scope_key.to_string(),
            command: command.to_string(),
            args: Vec::new(),
            env: HashMap::new(),
            enabled,
        }
    }

    fn sh_config(scope_key: &str, script: &str) -> ServerConfig {
        ServerConfig {
            scope_key: scope_key.to_string(),
            command: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            env: HashMap::new(),
            enabled: true,
        }
    }

    #[tokio::test]
    async fn test_resolve_matches_scope_prefix() {
        // The stub swallows the handshake, so resolve's start() blocks
        // until the shutdown path; drive it in the background and observe
        // the lazy spawn from outside
        let registry = Arc::new(ServerRegistry::with_configs(
            vec![sh_config("source.js", "cat > /dev/null")],
            None,
        ));

        let resolver = Arc::clone(&registry);
        let task = tokio::spawn(async move { resolver.resolve("source.js.jsx").await });

        // Wait until the lazy spawn registers the client
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while registry.active_scopes().await.is_empty() {
            assert!(tokio::time::Instant::now() < deadline);
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(registry.active_scopes().await, ["source.js"]);

        registry.stop_all().await;
        // The pending handshake settles once the process is stopped
        let _ = task.await.unwrap();
        assert!(registry.active_scopes().await.is_empty());
    }

    #[tokio::test]
    async fn test_resolve_ignores_disabled_and_unmatched() {
        let registry = ServerRegistry::with_configs(
            vec![
                config("source.js", "cat", false),
                config("source.python", "cat", false),
            ],
            None,
        );

        assert!(registry.resolve("source.js.jsx").await.unwrap().is_none());
        assert!(registry.resolve("source.rust").await.unwrap().is_none());
        assert!(registry.active_scopes().await.is_empty());
    }

    #[tokio::test]
    async fn test_disabled_entries_never_match() {
        let registry = ServerRegistry::with_configs(
            vec![
                config("source.js.jsx", "cat", false),
                config("source.js", "cat", false),
            ],
            None,
        );

        // Both prefixes cover the scope, but disabled entries do not match
        assert!(registry.resolve("source.js.jsx").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_defaults_are_present_but_disabled() {
        let registry = ServerRegistry::with_default_configs(None);

        assert!(registry.resolve("source.javascript").await.unwrap().is_none());
        assert!(registry.resolve("source.python").await.unwrap().is_none());
        assert!(registry.resolve("source.go").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failed_start_is_not_cached() {
        let registry = ServerRegistry::with_configs(
            vec![config("source.js", "/nonexistent/lsp-server-binary", true)],
            None,
        );

        assert!(registry.resolve("source.js").await.is_err());
        assert!(registry.active_scopes().await.is_empty());

        // A second resolve re-attempts the spawn rather than returning a
        // dead cached client
        assert!(registry.resolve("source.js").await.is_err());
    }

    #[tokio::test]
    async fn test_crashed_server_is_evicted() {
        let registry = ServerRegistry::with_configs(vec![sh_config("source.js", "exit 3")], None);

        assert!(registry.resolve("source.js").await.is_err());

        // The eviction task races the resolve error path; both remove the key
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while !registry.active_scopes().await.is_empty() {
            assert!(tokio::time::Instant::now() < deadline);
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn test_configure_merges_and_inserts() {
        let registry = ServerRegistry::with_default_configs(None);

        // Enable an existing default
        registry
            .configure(
                "source.python",
                ServerConfigPatch {
                    enabled: Some(true),
                    command: Some("cat".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        // Insert a brand new entry
        registry
            .configure(
                "source.ruby",
                ServerConfigPatch {
                    command: Some("solargraph".to_string()),
                    args: Some(vec!["stdio".to_string()]),
                    enabled: Some(false),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let inner = registry.inner.lock().await;
        let python = inner
            .configs
            .iter()
            .find(|c| c.scope_key == "source.python")
            .unwrap();
        assert!(python.enabled);
        assert_eq!(python.command, "cat");

        let ruby = inner
            .configs
            .iter()
            .find(|c| c.scope_key == "source.ruby")
            .unwrap();
        assert!(!ruby.enabled);
        assert_eq!(ruby.args, ["stdio"]);
    }

    #[tokio::test]
    async fn test_stop_unknown_key_is_noop() {
        let registry = ServerRegistry::new(None);
        registry.stop("source.unknown").await.unwrap();
        registry.stop_all().await;
    }
}
