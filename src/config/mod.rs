use anyhow::Context;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Complete credvault configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CredvaultConfig {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub oauth: OAuthConfig,
    #[serde(default)]
    pub api: ApiConfig,
    /// Extra or overriding OAuth providers, keyed by service name
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderSettings>,
}

/// Credential store configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    /// File holding the base64 master key; created on first run
    #[serde(default = "default_key_file")]
    pub key_file: PathBuf,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("credvault.db")
}

fn default_key_file() -> PathBuf {
    PathBuf::from("credvault.key")
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            key_file: default_key_file(),
        }
    }
}

/// Authorization flow configuration
#[derive(Debug, Clone, Deserialize)]
pub struct OAuthConfig {
    /// How long a flow waits for the browser redirect
    #[serde(default = "default_flow_timeout")]
    pub flow_timeout_seconds: u64,
    /// How long terminal flow records stay inspectable
    #[serde(default = "default_flow_retention")]
    pub flow_retention_seconds: u64,
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_seconds: u64,
    /// Interface the redirect listener binds (port is always ephemeral)
    #[serde(default = "default_callback_host")]
    pub callback_host: String,
    #[serde(default = "default_callback_path")]
    pub callback_path: String,
    #[serde(default = "default_exchange_timeout")]
    pub exchange_timeout_seconds: u64,
    /// Delay before the single retry of a failed token exchange
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_ms: u64,
}

fn default_flow_timeout() -> u64 {
    300
}

fn default_flow_retention() -> u64 {
    120
}

fn default_cleanup_interval() -> u64 {
    30
}

fn default_callback_host() -> String {
    "127.0.0.1".to_string()
}

fn default_callback_path() -> String {
    "/callback".to_string()
}

fn default_exchange_timeout() -> u64 {
    30
}

fn default_retry_backoff() -> u64 {
    500
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            flow_timeout_seconds: default_flow_timeout(),
            flow_retention_seconds: default_flow_retention(),
            cleanup_interval_seconds: default_cleanup_interval(),
            callback_host: default_callback_host(),
            callback_path: default_callback_path(),
            exchange_timeout_seconds: default_exchange_timeout(),
            retry_backoff_ms: default_retry_backoff(),
        }
    }
}

impl OAuthConfig {
    pub fn flow_timeout(&self) -> Duration {
        Duration::from_secs(self.flow_timeout_seconds)
    }

    pub fn flow_retention(&self) -> Duration {
        Duration::from_secs(self.flow_retention_seconds)
    }

    pub fn exchange_timeout(&self) -> Duration {
        Duration::from_secs(self.exchange_timeout_seconds)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

/// Command API configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// Allow any origin (the UI runs from its own origin)
    #[serde(default = "default_cors_permissive")]
    pub cors_permissive: bool,
}

fn default_bind_addr() -> String {
    "127.0.0.1:1420".to_string()
}

fn default_cors_permissive() -> bool {
    true
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            cors_permissive: default_cors_permissive(),
        }
    }
}

/// One `[providers.<name>]` table
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderSettings {
    pub auth_url: String,
    pub token_url: String,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default)]
    pub pkce: bool,
}

/// Load configuration from a TOML file. A missing file yields the defaults.
pub fn load_config(path: impl AsRef<Path>) -> anyhow::Result<CredvaultConfig> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(CredvaultConfig::default());
    }
    let contents = std::fs::read_to_string(path)?;
    let config: CredvaultConfig = toml::from_str(&contents)?;
    Ok(config)
}

impl CredvaultConfig {
    /// Apply `CREDVAULT_*` environment overrides.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("CREDVAULT_DB_PATH") {
            if !v.is_empty() {
                self.store.db_path = PathBuf::from(v);
            }
        }
        if let Ok(v) = std::env::var("CREDVAULT_BIND_ADDR") {
            if !v.is_empty() {
                self.api.bind_addr = v;
            }
        }
    }
}

impl StoreConfig {
    /// Master key for sealing secrets.
    ///
    /// `CREDVAULT_ENCRYPTION_KEY` wins over `key_file`. A missing key file is
    /// created with a fresh key (mode 0600 on unix).
    pub fn resolve_encryption_key(&self) -> anyhow::Result<String> {
        if let Ok(key) = std::env::var("CREDVAULT_ENCRYPTION_KEY") {
            if !key.trim().is_empty() {
                return Ok(key);
            }
        }
        read_or_create_key_file(&self.key_file)
    }
}

fn read_or_create_key_file(path: &Path) -> anyhow::Result<String> {
    if path.exists() {
        let key = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read key file {}", path.display()))?;
        return Ok(key.trim().to_string());
    }

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    let key = crate::credentials::generate_key();
    std::fs::write(path, &key)
        .with_context(|| format!("failed to write key file {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .with_context(|| format!("failed to restrict {}", path.display()))?;
    }

    tracing::info!(path = %path.display(), "Generated new encryption key");
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = CredvaultConfig::default();
        assert_eq!(config.store.db_path, PathBuf::from("credvault.db"));
        assert_eq!(config.oauth.flow_timeout(), Duration::from_secs(300));
        assert_eq!(config.oauth.callback_host, "127.0.0.1");
        assert_eq!(config.oauth.callback_path, "/callback");
        assert_eq!(config.oauth.retry_backoff(), Duration::from_millis(500));
        assert_eq!(config.api.bind_addr, "127.0.0.1:1420");
        assert!(config.providers.is_empty());
    }

    #[test]
    fn test_config_deserialization() {
        let toml = r#"
            [store]
            db_path = "/var/lib/credvault/app.db"
            key_file = "/var/lib/credvault/app.key"

            [oauth]
            flow_timeout_seconds = 60
            callback_path = "/oauth/callback"

            [api]
            bind_addr = "127.0.0.1:9000"
            cors_permissive = false

            [providers.acme]
            auth_url = "https://acme.example/authorize"
            token_url = "https://acme.example/token"
            scopes = ["read", "write"]
            pkce = true
        "#;

        let config: CredvaultConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.store.db_path, PathBuf::from("/var/lib/credvault/app.db"));
        assert_eq!(config.oauth.flow_timeout_seconds, 60);
        assert_eq!(config.oauth.callback_path, "/oauth/callback");
        assert_eq!(config.api.bind_addr, "127.0.0.1:9000");
        assert!(!config.api.cors_permissive);

        let acme = &config.providers["acme"];
        assert_eq!(acme.scopes, vec!["read", "write"]);
        assert!(acme.pkce);
    }

    #[test]
    fn test_partial_config() {
        let toml = r#"
            [oauth]
            retry_backoff_ms = 50
        "#;

        let config: CredvaultConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.oauth.retry_backoff_ms, 50);
        assert_eq!(config.oauth.flow_timeout_seconds, 300); // Default
        assert_eq!(config.api.bind_addr, "127.0.0.1:1420"); // Default
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.oauth.flow_retention_seconds, 120);
    }

    #[test]
    fn test_load_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credvault.toml");
        std::fs::write(&path, "[oauth]\nflow_timeout_seconds = 5\n").unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.oauth.flow_timeout_seconds, 5);
    }

    #[test]
    fn test_key_file_created_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys").join("credvault.key");

        let first = read_or_create_key_file(&path).unwrap();
        assert!(path.exists());
        assert!(crate::credentials::SecretBox::from_base64_key(&first).is_ok());

        let second = read_or_create_key_file(&path).unwrap();
        assert_eq!(first, second);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }
}
