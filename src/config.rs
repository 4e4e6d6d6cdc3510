//! Process configuration, read once at startup from flags and environment.

use std::net::IpAddr;
use std::time::Duration;

use clap::Parser;
use reqwest::Url;

use crate::error::ConfigError;

pub const DEFAULT_VAULT_ADDR: &str = "https://vault.example.com";
pub const DEFAULT_TRANSFORM_ROLE: &str = "creditcard-transform";
/// Older deployments set the Vault address under this name.
pub const LEGACY_VAULT_ADDR_ENV: &str = "VAULT_URL";
/// BigQuery sends remote function batches of up to roughly 10 MB.
pub const DEFAULT_MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

#[derive(Parser, Debug, Clone)]
#[command(name = "vault-transform-relay")]
#[command(about = "BigQuery remote function relay for the Vault Transform secret engine")]
pub struct Args {
    /// Vault base URL (falls back to VAULT_URL, then the built-in default)
    #[arg(long, env = "VAULT_ADDR")]
    pub vault_addr: Option<String>,

    /// Vault token sent as X-Vault-Token
    #[arg(long, env = "VAULT_TOKEN", hide_env_values = true)]
    pub vault_token: Option<String>,

    /// Vault Enterprise namespace sent as X-Vault-Namespace
    #[arg(long, env = "VAULT_NAMESPACE")]
    pub vault_namespace: Option<String>,

    /// Transform role used for encode and decode
    #[arg(long, env = "VAULT_TRANSFORM_ROLE", default_value = DEFAULT_TRANSFORM_ROLE)]
    pub transform_role: String,

    /// Timeout for each Vault call, in seconds
    #[arg(long, env = "VAULT_TIMEOUT_SECS", default_value = "30")]
    pub timeout_secs: u64,

    /// Address to bind the HTTP server to
    #[arg(long, env = "RELAY_HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Port to bind the HTTP server to
    #[arg(short, long, env = "PORT", default_value = "8080")]
    pub port: u16,

    /// Maximum Vault calls in flight for a single request
    #[arg(long, env = "RELAY_CONCURRENCY", default_value = "8")]
    pub concurrency: usize,

    /// Largest accepted request body, in bytes
    #[arg(long, env = "RELAY_MAX_BODY_BYTES", default_value_t = DEFAULT_MAX_BODY_BYTES)]
    pub max_body_bytes: usize,

    /// Enable verbose debug logging
    #[arg(short, long, env = "RELAY_VERBOSE")]
    pub verbose: bool,
}

/// Connection settings for the Vault Transform secret engine.
#[derive(Clone, PartialEq, Eq)]
pub struct VaultConfig {
    pub base_url: String,
    pub token: String,
    pub namespace: Option<String>,
    pub transform_role: String,
    pub timeout: Duration,
}

// Hand-written so the token never ends up in a log line.
impl std::fmt::Debug for VaultConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VaultConfig")
            .field("base_url", &self.base_url)
            .field("token", &"<redacted>")
            .field("namespace", &self.namespace)
            .field("transform_role", &self.transform_role)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl VaultConfig {
    /// Validates the raw settings. A missing or blank token is fatal.
    pub fn new(
        base_url: impl Into<String>,
        token: Option<String>,
        namespace: Option<String>,
        transform_role: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ConfigError> {
        let token = token
            .map(|t| t.trim().to_owned())
            .filter(|t| !t.is_empty())
            .ok_or(ConfigError::MissingToken)?;
        let namespace = namespace
            .map(|n| n.trim().to_owned())
            .filter(|n| !n.is_empty());
        let base_url = base_url.into().trim_end_matches('/').to_owned();

        Ok(Self {
            base_url,
            token,
            namespace,
            transform_role: transform_role.into(),
            timeout,
        })
    }

    /// True for `http://` URLs that leave the machine. Unparseable URLs are
    /// reported when the client builds its endpoints, not here.
    pub fn is_insecure_remote(&self) -> bool {
        let Ok(url) = Url::parse(&self.base_url) else {
            return false;
        };
        if url.scheme() != "http" {
            return false;
        }
        let host = url.host_str().unwrap_or("");
        let loopback = host.eq_ignore_ascii_case("localhost")
            || host
                .trim_start_matches('[')
                .trim_end_matches(']')
                .parse::<IpAddr>()
                .is_ok_and(|ip| ip.is_loopback());
        !loopback
    }
}

/// Listener and fan-out settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub concurrency: usize,
    pub max_body_bytes: usize,
}

impl ServerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Args {
    /// Builds the Vault settings, consulting `VAULT_URL` when no address was
    /// given by flag or `VAULT_ADDR`.
    pub fn vault_config(&self) -> Result<VaultConfig, ConfigError> {
        let legacy = std::env::var(LEGACY_VAULT_ADDR_ENV).ok();
        VaultConfig::new(
            resolve_vault_addr(self.vault_addr.clone(), legacy),
            self.vault_token.clone(),
            self.vault_namespace.clone(),
            self.transform_role.clone(),
            Duration::from_secs(self.timeout_secs),
        )
    }

    pub fn server_config(&self) -> Result<ServerConfig, ConfigError> {
        if self.concurrency == 0 {
            return Err(ConfigError::ZeroConcurrency);
        }
        Ok(ServerConfig {
            host: self.host.clone(),
            port: self.port,
            concurrency: self.concurrency,
            max_body_bytes: self.max_body_bytes,
        })
    }
}

fn resolve_vault_addr(explicit: Option<String>, legacy: Option<String>) -> String {
    explicit
        .into_iter()
        .chain(legacy)
        .map(|a| a.trim().to_owned())
        .find(|a| !a.is_empty())
        .unwrap_or_else(|| DEFAULT_VAULT_ADDR.to_owned())
}
