//! Local relay configuration.

use std::fmt;
use std::net::IpAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::crypto::Method;
use crate::proxy::{ForwardProxy, ProxyKind, Remote};

/// Default per-server connect timeout.
pub const DEFAULT_SERVER_TIMEOUT_SECS: u64 = 5;

/// Upper bound on the per-server connect timeout.
pub const MAX_SERVER_TIMEOUT_SECS: u64 = 20;

/// Default forward-proxy connect timeout.
pub const DEFAULT_PROXY_TIMEOUT_SECS: u64 = 3;

/// Default handler idle timeout.
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 900;

/// Default UDP session cache capacity.
pub const DEFAULT_UDP_CACHE_SIZE: usize = 512;

/// Port reserved for the local HTTP-proxy helper.
pub const RESERVED_LOCAL_PORT: u16 = 8123;

/// A remote relay server. Identity is `address:port`.
#[derive(Clone, PartialEq, Eq)]
pub struct ServerDescriptor {
    /// Host name or IP literal
    pub address: String,
    /// Server port
    pub port: u16,
    /// Cipher method
    pub method: Method,
    /// Shared secret
    pub password: String,
    /// Connect timeout
    pub timeout: Duration,
}

impl ServerDescriptor {
    /// Create a descriptor with the default timeout.
    pub fn new(address: impl Into<String>, port: u16, method: Method, password: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            port,
            method,
            password: password.into(),
            timeout: Duration::from_secs(DEFAULT_SERVER_TIMEOUT_SECS),
        }
    }

    /// Identity key, `address:port`.
    pub fn identifier(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    /// Display name; IPv6 literals are bracketed.
    pub fn friendly_name(&self) -> String {
        if self.address.is_empty() {
            return "New server".into();
        }
        match self.address.parse::<IpAddr>() {
            Ok(IpAddr::V6(_)) => format!("[{}]:{}", self.address, self.port),
            _ => self.identifier(),
        }
    }

    /// Validate the descriptor.
    pub fn validate(&self) -> Result<(), String> {
        if self.address.is_empty() {
            return Err("server address cannot be empty".into());
        }
        if self.port == 0 {
            return Err("server port out of range".into());
        }
        if self.password.is_empty() {
            return Err("password cannot be empty".into());
        }
        let secs = self.timeout.as_secs();
        if secs == 0 || secs > MAX_SERVER_TIMEOUT_SECS {
            return Err(format!(
                "server timeout must be between 1 and {} seconds",
                MAX_SERVER_TIMEOUT_SECS
            ));
        }
        Ok(())
    }
}

impl fmt::Debug for ServerDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerDescriptor")
            .field("address", &self.address)
            .field("port", &self.port)
            .field("method", &self.method)
            .field("password", &"<redacted>")
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Which strategy picks the server for each connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    /// Always the server at `index`
    #[default]
    Fixed,
    /// Random per TCP connection, client-hash per UDP session
    Balancing,
    /// Best score from latency and failure history
    HighAvailability,
}

/// Forward proxy settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardProxyConfig {
    /// Proxy is used only when enabled
    pub enabled: bool,
    /// Protocol
    pub kind: ProxyKind,
    /// Proxy host
    pub host: String,
    /// Proxy port
    pub port: u16,
    /// Connect timeout for the proxy phase
    pub timeout: Duration,
}

impl Default for ForwardProxyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            kind: ProxyKind::Socks5,
            host: String::new(),
            port: 0,
            timeout: Duration::from_secs(DEFAULT_PROXY_TIMEOUT_SECS),
        }
    }
}

/// Runtime configuration of the local relay.
#[derive(Debug, Clone)]
pub struct LocalConfig {
    /// Local listening port (TCP and UDP)
    pub local_port: u16,
    /// Bind to all interfaces instead of loopback
    pub share_over_lan: bool,
    /// Configured relay servers
    pub servers: Vec<ServerDescriptor>,
    /// Server used by the fixed strategy
    pub index: usize,
    /// Server selection
    pub strategy: StrategyKind,
    /// Forward proxy
    pub proxy: ForwardProxyConfig,
    /// UDP session cache capacity
    pub udp_cache_size: usize,
    /// Handlers idle longer than this are closed
    pub idle_timeout: Duration,
    /// Local HTTP-proxy helper port for the port forwarder
    pub forward_port: Option<u16>,
}

impl LocalConfig {
    /// Configuration for a single server with defaults elsewhere.
    pub fn new_single(local_port: u16, server: ServerDescriptor) -> Self {
        Self {
            local_port,
            share_over_lan: false,
            servers: vec![server],
            index: 0,
            strategy: StrategyKind::Fixed,
            proxy: ForwardProxyConfig::default(),
            udp_cache_size: DEFAULT_UDP_CACHE_SIZE,
            idle_timeout: Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS),
            forward_port: None,
        }
    }

    /// The server at `index`, if any.
    pub fn current_server(&self) -> Option<&ServerDescriptor> {
        self.servers.get(self.index)
    }

    /// Upstream path as configured.
    pub fn remote(&self) -> Remote {
        if !self.proxy.enabled {
            return Remote::Direct;
        }
        Remote::Proxy(ForwardProxy {
            kind: self.proxy.kind,
            host: self.proxy.host.clone(),
            port: self.proxy.port,
        })
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.local_port == 0 {
            return Err("local port out of range".into());
        }
        if self.local_port == RESERVED_LOCAL_PORT {
            return Err(format!("local port cannot be {}", RESERVED_LOCAL_PORT));
        }
        if self.servers.is_empty() {
            return Err("at least one server must be configured".into());
        }
        if self.index >= self.servers.len() {
            return Err(format!("server index {} out of range", self.index));
        }
        for server in &self.servers {
            server
                .validate()
                .map_err(|e| format!("{}: {}", server.friendly_name(), e))?;
        }
        if self.proxy.enabled {
            if self.proxy.host.is_empty() {
                return Err("proxy server cannot be empty".into());
            }
            if self.proxy.port == 0 {
                return Err("proxy port out of range".into());
            }
            if self.proxy.timeout.is_zero() {
                return Err("proxy timeout must be positive".into());
            }
        }
        if self.udp_cache_size == 0 {
            return Err("udp_cache_size must be > 0".into());
        }
        if self.forward_port == Some(self.local_port) {
            return Err("forward_port cannot equal local_port".into());
        }
        Ok(())
    }
}

/// Server entry as stored in the configuration file.
#[derive(Clone, Serialize, Deserialize)]
pub struct ServerConfigFile {
    /// Host name or IP literal
    pub server: String,
    /// Server port
    #[serde(default = "default_server_port")]
    pub server_port: u16,
    /// Cipher method name
    #[serde(default)]
    pub method: String,
    /// Shared secret
    pub password: String,
    /// Connect timeout (seconds)
    #[serde(default = "default_server_timeout")]
    pub timeout: u64,
}

impl fmt::Debug for ServerConfigFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConfigFile")
            .field("server", &self.server)
            .field("server_port", &self.server_port)
            .field("method", &self.method)
            .field("password", &"<redacted>")
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Forward proxy section of the configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfigFile {
    /// Use the proxy
    #[serde(default)]
    pub enabled: bool,
    /// `socks5` or `http`
    #[serde(rename = "type")]
    pub kind: ProxyKind,
    /// Proxy host
    pub server: String,
    /// Proxy port
    pub port: u16,
    /// Connect timeout (seconds)
    #[serde(default = "default_proxy_timeout")]
    pub timeout: u64,
}

/// Configuration file format for serialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalConfigFile {
    /// Local listening port
    #[serde(default = "default_local_port")]
    pub local_port: u16,
    /// Bind to all interfaces
    #[serde(default)]
    pub share_over_lan: bool,
    /// Relay servers
    pub servers: Vec<ServerConfigFile>,
    /// Server used by the fixed strategy
    #[serde(default)]
    pub index: usize,
    /// Strategy name
    #[serde(default)]
    pub strategy: StrategyKind,
    /// Forward proxy
    #[serde(default)]
    pub proxy: Option<ProxyConfigFile>,
    /// UDP session cache capacity
    #[serde(default = "default_udp_cache_size")]
    pub udp_cache_size: usize,
    /// Handler idle timeout (seconds)
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
    /// HTTP-proxy helper port for the port forwarder
    #[serde(default)]
    pub forward_port: Option<u16>,
}

fn default_local_port() -> u16 {
    crate::DEFAULT_LOCAL_PORT
}

fn default_server_port() -> u16 {
    crate::DEFAULT_SERVER_PORT
}

fn default_server_timeout() -> u64 {
    DEFAULT_SERVER_TIMEOUT_SECS
}

fn default_proxy_timeout() -> u64 {
    DEFAULT_PROXY_TIMEOUT_SECS
}

fn default_udp_cache_size() -> usize {
    DEFAULT_UDP_CACHE_SIZE
}

fn default_idle_timeout() -> u64 {
    DEFAULT_IDLE_TIMEOUT_SECS
}

impl LocalConfigFile {
    /// Convert to runtime configuration.
    pub fn to_config(&self) -> Result<LocalConfig, String> {
        let mut servers = Vec::with_capacity(self.servers.len());
        for entry in &self.servers {
            let method: Method = entry
                .method
                .parse()
                .map_err(|e: crate::Error| e.to_string())?;
            servers.push(ServerDescriptor {
                address: entry.server.clone(),
                port: entry.server_port,
                method,
                password: entry.password.clone(),
                timeout: Duration::from_secs(entry.timeout),
            });
        }

        let proxy = match &self.proxy {
            Some(p) => ForwardProxyConfig {
                enabled: p.enabled,
                kind: p.kind,
                host: p.server.clone(),
                port: p.port,
                timeout: Duration::from_secs(p.timeout),
            },
            None => ForwardProxyConfig::default(),
        };

        let config = LocalConfig {
            local_port: self.local_port,
            share_over_lan: self.share_over_lan,
            servers,
            index: self.index,
            strategy: self.strategy,
            proxy,
            udp_cache_size: self.udp_cache_size,
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
            forward_port: self.forward_port,
        };
        config.validate()?;
        Ok(config)
    }

    /// Create from runtime configuration.
    pub fn from_config(config: &LocalConfig) -> Self {
        let proxy = if config.proxy.enabled || !config.proxy.host.is_empty() {
            Some(ProxyConfigFile {
                enabled: config.proxy.enabled,
                kind: config.proxy.kind,
                server: config.proxy.host.clone(),
                port: config.proxy.port,
                timeout: config.proxy.timeout.as_secs(),
            })
        } else {
            None
        };

        Self {
            local_port: config.local_port,
            share_over_lan: config.share_over_lan,
            servers: config
                .servers
                .iter()
                .map(|s| ServerConfigFile {
                    server: s.address.clone(),
                    server_port: s.port,
                    method: s.method.name().to_string(),
                    password: s.password.clone(),
                    timeout: s.timeout.as_secs(),
                })
                .collect(),
            index: config.index,
            strategy: config.strategy,
            proxy,
            udp_cache_size: config.udp_cache_size,
            idle_timeout_secs: config.idle_timeout.as_secs(),
            forward_port: config.forward_port,
        }
    }

    /// Parse a JSON configuration file's contents.
    pub fn from_json(json: &str) -> Result<Self, String> {
        serde_json::from_str(json).map_err(|e| format!("invalid configuration: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server() -> ServerDescriptor {
        ServerDescriptor::new("203.0.113.7", 8388, Method::Aes256Gcm, "secret")
    }

    #[test]
    fn test_config_creation() {
        let config = LocalConfig::new_single(1080, server());
        assert!(config.validate().is_ok());
        assert_eq!(config.current_server().unwrap().identifier(), "203.0.113.7:8388");
        assert_eq!(config.remote(), Remote::Direct);
    }

    #[test]
    fn test_server_validation() {
        let mut s = server();
        assert!(s.validate().is_ok());

        s.timeout = Duration::from_secs(21);
        assert!(s.validate().is_err());
        s.timeout = Duration::from_secs(0);
        assert!(s.validate().is_err());

        let mut s = server();
        s.password.clear();
        assert!(s.validate().is_err());

        let mut s = server();
        s.address.clear();
        assert!(s.validate().is_err());

        let mut s = server();
        s.port = 0;
        assert!(s.validate().is_err());
    }

    #[test]
    fn test_local_validation() {
        let mut config = LocalConfig::new_single(8123, server());
        assert!(config.validate().is_err());

        config.local_port = 1080;
        config.index = 3;
        assert!(config.validate().is_err());

        config.index = 0;
        config.proxy.enabled = true;
        assert!(config.validate().is_err());

        config.proxy.host = "127.0.0.1".into();
        config.proxy.port = 1081;
        assert!(config.validate().is_ok());
        assert!(matches!(config.remote(), Remote::Proxy(ref p) if p.port == 1081));
    }

    #[test]
    fn test_debug_redacts_password() {
        let dbg = format!("{:?}", server());
        assert!(dbg.contains("203.0.113.7"));
        assert!(dbg.contains("<redacted>"));
        assert!(!dbg.contains("secret"));

        let config = LocalConfig::new_single(1080, server());
        assert!(!format!("{:?}", config).contains("secret"));

        let file = LocalConfigFile::from_config(&config);
        assert!(!format!("{:?}", file).contains("secret"));
    }

    #[test]
    fn test_friendly_name() {
        let mut s = server();
        assert_eq!(s.friendly_name(), "203.0.113.7:8388");
        s.address = "2001:db8::1".into();
        assert_eq!(s.friendly_name(), "[2001:db8::1]:8388");
        assert_eq!(s.identifier(), "2001:db8::1:8388");
    }

    #[test]
    fn test_json_defaults() {
        let json = r#"{
            "servers": [{ "server": "ss.example.net", "password": "pw" }]
        }"#;
        let config = LocalConfigFile::from_json(json).unwrap().to_config().unwrap();

        assert_eq!(config.local_port, 1080);
        assert_eq!(config.udp_cache_size, 512);
        assert_eq!(config.idle_timeout, Duration::from_secs(900));
        assert_eq!(config.strategy, StrategyKind::Fixed);
        let s = config.current_server().unwrap();
        assert_eq!(s.port, 8388);
        assert_eq!(s.method, Method::Aes256Cfb);
        assert_eq!(s.timeout, Duration::from_secs(5));
        assert!(!config.proxy.enabled);
    }

    #[test]
    fn test_json_full() {
        let json = r#"{
            "local_port": 1086,
            "share_over_lan": true,
            "strategy": "high_availability",
            "servers": [
                { "server": "a.example", "server_port": 443, "method": "aes-128-gcm", "password": "x", "timeout": 10 },
                { "server": "b.example", "method": "salsa20", "password": "y" }
            ],
            "proxy": { "enabled": true, "type": "http", "server": "127.0.0.1", "port": 8080 },
            "forward_port": 8123
        }"#;
        let config = LocalConfigFile::from_json(json).unwrap().to_config().unwrap();

        assert_eq!(config.local_port, 1086);
        assert!(config.share_over_lan);
        assert_eq!(config.strategy, StrategyKind::HighAvailability);
        assert_eq!(config.servers.len(), 2);
        assert_eq!(config.servers[1].method, Method::Salsa20);
        assert_eq!(config.proxy.kind, ProxyKind::Http);
        assert_eq!(config.proxy.timeout, Duration::from_secs(3));
        assert_eq!(config.forward_port, Some(8123));
    }

    #[test]
    fn test_json_rejects_unknown_method() {
        let json = r#"{ "servers": [{ "server": "a", "method": "rc4-md5", "password": "x" }] }"#;
        let err = LocalConfigFile::from_json(json).unwrap().to_config().unwrap_err();
        assert!(err.contains("rc4-md5"));
    }

    #[test]
    fn test_config_serialization() {
        let mut config = LocalConfig::new_single(1080, server());
        config.strategy = StrategyKind::Balancing;

        let file = LocalConfigFile::from_config(&config);
        let json = serde_json::to_string(&file).unwrap();
        let restored = LocalConfigFile::from_json(&json).unwrap().to_config().unwrap();

        assert_eq!(restored.servers, config.servers);
        assert_eq!(restored.strategy, StrategyKind::Balancing);
        assert_eq!(restored.local_port, config.local_port);
    }
}
