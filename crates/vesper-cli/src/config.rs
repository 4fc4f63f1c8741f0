//! Configuration system for the VESPER CLI.

use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use vesper_nathole::stun::StunCredentials;
use vesper_nathole::{ControllerConfig, DiscoveryConfig};

/// VESPER configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Control-channel listener
    #[serde(default)]
    pub server: ServerConfig,
    /// Rendezvous controller tunables
    #[serde(default)]
    pub nathole: NatHoleConfig,
    /// STUN discovery
    #[serde(default)]
    pub stun: StunConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Proxies that clients may listen on
    #[serde(default)]
    pub clients: Vec<ClientEntry>,
}

/// Control-channel listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
}

/// Rendezvous controller configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NatHoleConfig {
    /// Seconds a visitor waits for the client to answer
    #[serde(default = "default_visitor_wait_timeout")]
    pub visitor_wait_timeout_secs: u64,
    /// Milliseconds the sender-role response is held back
    #[serde(default = "default_sender_send_delay")]
    pub sender_send_delay_ms: u64,
    /// Seconds a resolved session lingers past its read timeout
    #[serde(default = "default_session_linger_extra")]
    pub session_linger_extra_secs: u64,
    /// Reject sign keys older than this many seconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_sign_key_age_secs: Option<u64>,
    /// Sweep idle analyzer records this often (seconds)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub analyzer_sweep_interval_secs: Option<u64>,
    /// Idle age after which a sweep drops a record (seconds)
    #[serde(default = "default_analyzer_max_idle")]
    pub analyzer_max_idle_secs: u64,
}

/// STUN discovery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StunConfig {
    /// STUN servers, `host:port`
    #[serde(default = "default_stun_servers")]
    pub servers: Vec<String>,
    /// Per-request timeout in milliseconds
    #[serde(default = "default_stun_timeout")]
    pub request_timeout_ms: u64,
    /// Username for servers that require MESSAGE-INTEGRITY
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Password paired with `username`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Realm; selects long-term credentials
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub realm: Option<String>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

/// A proxy a client connection may listen on
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientEntry {
    /// Proxy name
    pub name: String,
    /// Shared secret visitors sign with
    pub sk: String,
    /// Visitor users allowed (`*` for everyone)
    #[serde(default = "default_allow_users")]
    pub allow_users: Vec<String>,
}

// Default values

fn default_listen_addr() -> String {
    "0.0.0.0:7001".to_string()
}

fn default_visitor_wait_timeout() -> u64 {
    10
}

fn default_sender_send_delay() -> u64 {
    1000
}

fn default_session_linger_extra() -> u64 {
    30
}

fn default_analyzer_max_idle() -> u64 {
    7 * 24 * 3600
}

fn default_stun_servers() -> Vec<String> {
    vec![
        "stun.easyvoip.com:3478".to_string(),
        "stun.l.google.com:19302".to_string(),
    ]
}

fn default_stun_timeout() -> u64 {
    3000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_allow_users() -> Vec<String> {
    vec!["*".to_string()]
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
        }
    }
}

impl Default for NatHoleConfig {
    fn default() -> Self {
        Self {
            visitor_wait_timeout_secs: default_visitor_wait_timeout(),
            sender_send_delay_ms: default_sender_send_delay(),
            session_linger_extra_secs: default_session_linger_extra(),
            max_sign_key_age_secs: None,
            analyzer_sweep_interval_secs: None,
            analyzer_max_idle_secs: default_analyzer_max_idle(),
        }
    }
}

impl Default for StunConfig {
    fn default() -> Self {
        Self {
            servers: default_stun_servers(),
            request_timeout_ms: default_stun_timeout(),
            username: None,
            password: None,
            realm: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;

        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        fs::write(path, contents)?;
        Ok(())
    }

    /// Get default config path
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("vesper/config.toml")
    }

    /// Load config from default path, or create default if it doesn't exist
    ///
    /// # Errors
    ///
    /// Returns an error if reading or creating the config fails.
    pub fn load_or_default() -> anyhow::Result<Self> {
        let path = Self::default_path();

        if path.exists() {
            Self::load(&path)
        } else {
            let config = Self::default();
            config.save(&path)?;
            Ok(config)
        }
    }

    /// Parse listen address as `SocketAddr`
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be parsed.
    pub fn parse_listen_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.server.listen_addr.parse()?)
    }

    /// Configured proxy by name
    #[must_use]
    pub fn client(&self, name: &str) -> Option<&ClientEntry> {
        self.clients.iter().find(|c| c.name == name)
    }

    /// Controller settings derived from `[nathole]`
    #[must_use]
    pub fn controller_config(&self) -> ControllerConfig {
        let n = &self.nathole;
        ControllerConfig {
            visitor_wait_timeout: Duration::from_secs(n.visitor_wait_timeout_secs),
            sender_send_delay: Duration::from_millis(n.sender_send_delay_ms),
            session_linger_extra: Duration::from_secs(n.session_linger_extra_secs),
            max_sign_key_age: n.max_sign_key_age_secs.map(Duration::from_secs),
            analyzer_sweep_interval: n.analyzer_sweep_interval_secs.map(Duration::from_secs),
            analyzer_max_idle: Duration::from_secs(n.analyzer_max_idle_secs),
        }
    }

    /// Discovery settings derived from `[stun]`
    #[must_use]
    pub fn discovery_config(&self) -> DiscoveryConfig {
        DiscoveryConfig {
            request_timeout: Duration::from_millis(self.stun.request_timeout_ms),
            credentials: self.stun.username.as_ref().map(|username| {
                StunCredentials::new(
                    username.clone(),
                    self.stun.password.clone().unwrap_or_default(),
                    self.stun.realm.clone(),
                )
            }),
            ..DiscoveryConfig::default()
        }
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is invalid.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.parse_listen_addr()?;

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid log level: {}. Must be one of: {}",
                self.logging.level,
                valid_log_levels.join(", ")
            );
        }

        if self.nathole.visitor_wait_timeout_secs == 0 {
            anyhow::bail!("nathole.visitor_wait_timeout_secs must be greater than 0");
        }

        if self.nathole.analyzer_sweep_interval_secs == Some(0) {
            anyhow::bail!("nathole.analyzer_sweep_interval_secs must be greater than 0");
        }

        if self.stun.request_timeout_ms == 0 {
            anyhow::bail!("stun.request_timeout_ms must be greater than 0");
        }

        for server in &self.stun.servers {
            validate_host_port(server, "STUN server")?;
        }

        if self.stun.username.is_none() && (self.stun.password.is_some() || self.stun.realm.is_some()) {
            anyhow::bail!("stun.password and stun.realm require stun.username");
        }

        let mut seen = std::collections::HashSet::new();
        for client in &self.clients {
            if client.name.is_empty() {
                anyhow::bail!("Client entry with empty name");
            }
            if client.sk.is_empty() {
                anyhow::bail!("Client '{}' has an empty sk", client.name);
            }
            if !seen.insert(client.name.as_str()) {
                anyhow::bail!("Duplicate client entry '{}'", client.name);
            }
        }

        Ok(())
    }
}

/// Validate host:port format
fn validate_host_port(addr: &str, name: &str) -> anyhow::Result<()> {
    let Some((host, port_str)) = addr.rsplit_once(':') else {
        anyhow::bail!("{name} '{addr}' missing port (expected format: host:port)");
    };

    let port: u16 = port_str
        .parse()
        .map_err(|_| anyhow::anyhow!("{name} '{addr}' has invalid port: {port_str}"))?;
    if port == 0 {
        anyhow::bail!("{name} '{addr}' has invalid port: 0");
    }
    if host.is_empty() {
        anyhow::bail!("{name} '{addr}' has empty hostname");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.server.listen_addr, "0.0.0.0:7001");
        assert_eq!(config.nathole.visitor_wait_timeout_secs, 10);
        assert_eq!(config.stun.request_timeout_ms, 3000);
        assert!(config.clients.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();

        config.logging.level = "loud".to_string();
        assert!(config.validate().is_err());

        config.logging.level = "debug".to_string();
        config.stun.servers = vec!["stun.example.com".to_string()];
        assert!(config.validate().is_err());

        config.stun.servers = vec!["stun.example.com:3478".to_string()];
        config.clients = vec![
            ClientEntry {
                name: "web".to_string(),
                sk: "k".to_string(),
                allow_users: default_allow_users(),
            },
            ClientEntry {
                name: "web".to_string(),
                sk: "k2".to_string(),
                allow_users: vec![],
            },
        ];
        assert!(config.validate().is_err());

        config.clients.pop();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_sections() {
        let config: Config = toml::from_str(
            r#"
            [server]
            listen_addr = "127.0.0.1:9000"

            [nathole]
            visitor_wait_timeout_secs = 3
            max_sign_key_age_secs = 600

            [[clients]]
            name = "web"
            sk = "secret"

            [[clients]]
            name = "ssh"
            sk = "other"
            allow_users = ["alice"]
            "#,
        )
        .unwrap();

        assert_eq!(config.parse_listen_addr().unwrap().port(), 9000);
        assert_eq!(config.client("web").unwrap().allow_users, vec!["*"]);
        assert_eq!(config.client("ssh").unwrap().allow_users, vec!["alice"]);
        assert!(config.client("db").is_none());

        let controller = config.controller_config();
        assert_eq!(controller.visitor_wait_timeout, Duration::from_secs(3));
        assert_eq!(controller.max_sign_key_age, Some(Duration::from_secs(600)));
        assert_eq!(controller.sender_send_delay, Duration::from_millis(1000));
        assert!(controller.analyzer_sweep_interval.is_none());
    }

    #[test]
    fn test_stun_credentials() {
        let mut config: Config = toml::from_str(
            r#"
            [stun]
            servers = ["stun.example.com:3478"]
            username = "peer"
            password = "hunter2"
            realm = "example.com"
            "#,
        )
        .unwrap();
        assert!(config.validate().is_ok());

        let discovery = config.discovery_config();
        let creds = discovery.credentials.unwrap();
        assert_eq!(creds.username, "peer");
        assert_eq!(creds.realm.as_deref(), Some("example.com"));

        config.stun.username = None;
        assert!(config.discovery_config().credentials.is_none());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/config.toml");

        let mut config = Config::default();
        config.clients.push(ClientEntry {
            name: "web".to_string(),
            sk: "secret".to_string(),
            allow_users: default_allow_users(),
        });
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.server.listen_addr, config.server.listen_addr);
        assert_eq!(loaded.clients.len(), 1);
        assert_eq!(loaded.client("web").unwrap().sk, "secret");
    }
}
