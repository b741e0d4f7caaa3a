use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

/// Process configuration loaded from TOML
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Server-wide settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Listeners opened at startup, keyed by connector name
    #[serde(default)]
    pub connectors: BTreeMap<String, ConnectorConfig>,

    /// Certificate files registered before any connector opens
    #[serde(default)]
    pub certificates: Vec<CertificateFileConfig>,

    /// Tenants registered at startup, keyed by tenant ID
    #[serde(default)]
    pub tenants: BTreeMap<String, TenantConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Maximum idle upstream connections per host (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle upstream connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,

    /// Time allowed for a client to send request headers (default: 10)
    #[serde(default = "default_header_read_timeout")]
    pub header_read_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
            header_read_timeout_secs: default_header_read_timeout(),
        }
    }
}

impl ServerConfig {
    pub fn pool_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.pool_idle_timeout_secs)
    }

    pub fn header_read_timeout(&self) -> Duration {
        Duration::from_secs(self.header_read_timeout_secs)
    }
}

/// A named listener
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ConnectorConfig {
    /// IP literal to bind, e.g. "0.0.0.0" or "::1"
    pub bind_address: String,

    /// Port to bind; 0 asks the OS for an ephemeral port
    pub port: u16,

    /// Terminate TLS using the SNI certificate resolver
    #[serde(default)]
    pub tls: bool,
}

impl ConnectorConfig {
    pub fn new(bind_address: impl Into<String>, port: u16, tls: bool) -> Self {
        Self {
            bind_address: bind_address.into(),
            port,
            tls,
        }
    }

    pub fn socket_addr(&self) -> Result<SocketAddr, String> {
        let ip: IpAddr = self.bind_address.parse().map_err(|_| {
            format!(
                "bind address '{}' is not an IP address",
                self.bind_address
            )
        })?;
        Ok(SocketAddr::new(ip, self.port))
    }

    pub fn validate(&self, name: &str) -> Result<(), String> {
        if name.is_empty() {
            return Err("connector name must not be empty".to_string());
        }
        self.socket_addr()
            .map(|_| ())
            .map_err(|e| format!("Connector '{}': {}", name, e))
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CertificateFileConfig {
    /// PEM certificate chain, leaf first
    pub cert_file: PathBuf,

    /// PEM private key
    pub key_file: PathBuf,
}

/// Everything a tenant exposes through the gateway
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct TenantConfig {
    /// Display name
    #[serde(default)]
    pub name: String,

    /// Certificate served for the tenant's hostnames
    #[serde(default)]
    pub x509: Option<X509Config>,

    /// Slot name to route for each declared endpoint slot
    #[serde(default)]
    pub server_endpoints: BTreeMap<String, ServerEndpointConfig>,

    #[serde(default)]
    pub reverse_proxy: Vec<ReverseProxyConfig>,

    #[serde(default)]
    pub file_server: Vec<FileServerConfig>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct X509Config {
    /// PEM certificate chain, leaf first
    pub cert: String,
    /// PEM private key
    pub key: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ServerEndpointConfig {
    pub connector: String,
    pub url: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ReverseProxyConfig {
    pub url: String,
    pub connector: String,
    pub methods: Vec<String>,
    pub target_url: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct FileServerConfig {
    pub url: String,
    pub connector: String,
    pub root_dir: PathBuf,
    #[serde(default)]
    pub dir_listing: bool,
}

impl TenantConfig {
    /// Validate URLs, methods and file server roots
    pub fn validate(&self, tenant_id: &str) -> Result<(), String> {
        for (slot, endpoint) in &self.server_endpoints {
            parse_rule_url(&endpoint.url).map_err(|e| {
                format!("Tenant '{}': server endpoint '{}': {}", tenant_id, slot, e)
            })?;
            require_connector(&endpoint.connector)
                .map_err(|e| format!("Tenant '{}': server endpoint '{}': {}", tenant_id, slot, e))?;
        }

        for rule in &self.reverse_proxy {
            parse_rule_url(&rule.url)
                .and_then(|_| parse_rule_url(&rule.target_url))
                .and_then(|_| require_connector(&rule.connector))
                .and_then(|_| validate_methods(&rule.methods))
                .map_err(|e| format!("Tenant '{}': reverse proxy '{}': {}", tenant_id, rule.url, e))?;
        }

        for rule in &self.file_server {
            parse_rule_url(&rule.url)
                .and_then(|_| require_connector(&rule.connector))
                .map_err(|e| format!("Tenant '{}': file server '{}': {}", tenant_id, rule.url, e))?;
            if !rule.root_dir.is_dir() {
                return Err(format!(
                    "Tenant '{}': file server '{}': root directory '{}' does not exist",
                    tenant_id,
                    rule.url,
                    rule.root_dir.display()
                ));
            }
        }

        Ok(())
    }

    /// Every connector name referenced by any rule
    pub fn referenced_connectors(&self) -> BTreeSet<&str> {
        self.server_endpoints
            .values()
            .map(|e| e.connector.as_str())
            .chain(self.reverse_proxy.iter().map(|r| r.connector.as_str()))
            .chain(self.file_server.iter().map(|r| r.connector.as_str()))
            .collect()
    }
}

/// Parse an absolute http or https URL
pub fn parse_rule_url(raw: &str) -> Result<Url, String> {
    let url = Url::parse(raw).map_err(|e| format!("invalid URL '{}': {}", raw, e))?;
    match url.scheme() {
        "http" | "https" => {}
        other => return Err(format!("URL '{}' has unsupported scheme '{}'", raw, other)),
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err(format!("URL '{}' has no host", raw));
    }
    Ok(url)
}

fn require_connector(connector: &str) -> Result<(), String> {
    if connector.is_empty() {
        return Err("connector must not be empty".to_string());
    }
    Ok(())
}

fn validate_methods(methods: &[String]) -> Result<(), String> {
    if methods.is_empty() {
        return Err("at least one method is required".to_string());
    }
    for method in methods {
        if method.is_empty() || hyper::Method::from_bytes(method.as_bytes()).is_err() {
            return Err(format!("invalid HTTP method '{}'", method));
        }
    }
    Ok(())
}

// Default value functions
fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_header_read_timeout() -> u64 {
    10
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        for (name, connector) in &self.connectors {
            if let Err(e) = connector.validate(name) {
                errors.push(e);
            }
        }

        for (id, tenant) in &self.tenants {
            if let Err(e) = tenant.validate(id) {
                errors.push(e);
            }
            for connector in tenant.referenced_connectors() {
                if !self.connectors.contains_key(connector) {
                    errors.push(format!(
                        "Tenant '{}': connector '{}' is not configured",
                        id, connector
                    ));
                }
            }
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
