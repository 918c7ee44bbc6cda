//! Configuration management

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

/// Capabilities requested after registration
pub const DEFAULT_CAPABILITIES: &[&str] = &[
    "twitch.tv/commands",
    "twitch.tv/tags",
    "twitch.tv/membership",
];

/// Bridge configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Chat server settings
    pub server: ServerConfig,
    /// Accounts to connect with, one connection per account
    pub accounts: Vec<AccountConfig>,
    /// Channel to join
    pub channel: ChannelConfig,
    /// Remote control endpoint
    pub control: ControlConfig,
    /// Chat command settings
    pub command: CommandConfig,
    /// Queue cadence and reconnect settings
    pub scheduler: SchedulerConfig,
}

/// Transport used to carry chat lines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Plain byte stream, optionally TLS wrapped
    #[serde(alias = "irc")]
    Raw,
    /// WebSocket frames using the `irc` subprotocol
    #[serde(alias = "ws_irc", alias = "ws")]
    WebSocket,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::Raw => write!(f, "irc"),
            TransportKind::WebSocket => write!(f, "ws_irc"),
        }
    }
}

/// Chat server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Server hostname
    pub host: String,
    /// Server port
    pub port: u16,
    /// Transport kind
    pub protocol: TransportKind,
    /// Whether to use TLS (or `wss://`)
    pub secure: bool,
    /// Skip certificate verification
    pub tls_insecure: bool,
    /// Local address to bind outgoing sockets to
    pub local_address: Option<IpAddr>,
    /// Seconds between keepalive PINGs
    pub keepalive_interval_secs: u64,
    /// Seconds without inbound data before the connection is considered dead
    pub read_timeout_secs: u64,
    /// Capabilities requested after registration
    pub capabilities: Vec<String>,
}

/// Account credentials
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AccountConfig {
    /// Login name, used as the nickname
    pub name: String,
    /// OAuth token, with or without the `oauth:` prefix
    pub token: String,
}

impl AccountConfig {
    /// Password line value, with the `oauth:` prefix ensured
    pub fn pass(&self) -> Option<String> {
        if self.token.is_empty() {
            None
        } else if self.token.starts_with("oauth:") {
            Some(self.token.clone())
        } else {
            Some(format!("oauth:{}", self.token))
        }
    }
}

/// Channel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Channel name, with or without the leading `#`
    pub name: String,
}

/// Remote control endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    /// Control endpoint address
    pub address: String,
    /// Control endpoint port
    pub port: u16,
    /// Control endpoint password, empty when authentication is off
    pub password: String,
    /// Name of the controlled resource
    pub source_name: String,
    /// Seconds to wait for a control response
    pub request_timeout_secs: u64,
}

impl ControlConfig {
    /// WebSocket URL of the control endpoint
    pub fn url(&self) -> String {
        format!("ws://{}:{}", self.address, self.port)
    }

    /// Password, if one is configured
    pub fn password(&self) -> Option<&str> {
        if self.password.is_empty() {
            None
        } else {
            Some(&self.password)
        }
    }

    /// Request timeout as a duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Chat command configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandConfig {
    /// Command word that triggers a control call
    pub trigger: String,
    /// Senders whose messages are never processed
    pub ignored_senders: Vec<String>,
}

/// Dispatch queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Milliseconds between connect attempts
    pub connect_interval_ms: u64,
    /// Milliseconds between channel joins
    pub join_interval_ms: u64,
    /// Milliseconds between outbound chat messages
    pub outbound_interval_ms: u64,
    /// Milliseconds between inbound message dispatches
    pub inbound_interval_ms: u64,
    /// Maximum items held by each queue
    pub queue_capacity: usize,
    /// First reconnect delay after repeated drops
    pub reconnect_base_delay_ms: u64,
    /// Upper bound for the reconnect delay
    pub reconnect_max_delay_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "irc-ws.chat.twitch.tv".to_string(),
            port: 80,
            protocol: TransportKind::WebSocket,
            secure: false,
            tls_insecure: false,
            local_address: None,
            keepalive_interval_secs: 120,
            read_timeout_secs: 360,
            capabilities: DEFAULT_CAPABILITIES.iter().map(|c| c.to_string()).collect(),
        }
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            name: "myfuriouschannel".to_string(),
        }
    }
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            address: "localhost".to_string(),
            port: 4444,
            password: String::new(),
            source_name: "Music".to_string(),
            request_timeout_secs: 10,
        }
    }
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            trigger: "!volume".to_string(),
            ignored_senders: vec!["twitchnotify".to_string(), "jtv".to_string()],
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            connect_interval_ms: 500,
            join_interval_ms: 250,
            outbound_interval_ms: 300,
            inbound_interval_ms: 2,
            queue_capacity: 10_000,
            reconnect_base_delay_ms: 1_000,
            reconnect_max_delay_ms: 60_000,
        }
    }
}

impl Config {
    /// Load configuration from file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;

        toml::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse config file: {}", e)))
    }

    /// Save configuration to file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| Error::Config(format!("Failed to write config file: {}", e)))?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.server.host.is_empty() {
            return Err(Error::Config("Server host cannot be empty".to_string()));
        }

        if self.server.port == 0 {
            return Err(Error::Config("Server port cannot be 0".to_string()));
        }

        if self.server.keepalive_interval_secs == 0 || self.server.read_timeout_secs == 0 {
            return Err(Error::Config(
                "Keepalive and read timeout must be greater than 0".to_string(),
            ));
        }

        if self.accounts.is_empty() {
            return Err(Error::Config("At least one account must be configured".to_string()));
        }

        let mut seen_names = std::collections::HashSet::new();
        for account in &self.accounts {
            if account.name.is_empty() {
                return Err(Error::Config("Account name cannot be empty".to_string()));
            }
            if !seen_names.insert(account.name.to_lowercase()) {
                return Err(Error::Config(format!(
                    "Duplicate account {} in configuration",
                    account.name
                )));
            }
        }

        if self.channel.name.trim_start_matches('#').is_empty() {
            return Err(Error::Config("Channel name cannot be empty".to_string()));
        }

        if self.control.source_name.is_empty() {
            return Err(Error::Config("Control source name cannot be empty".to_string()));
        }

        if self.control.request_timeout_secs == 0 {
            return Err(Error::Config("Control request timeout must be greater than 0".to_string()));
        }

        if self.command.trigger.is_empty() || self.command.trigger.contains(char::is_whitespace) {
            return Err(Error::Config("Command trigger must be a single word".to_string()));
        }

        let scheduler = &self.scheduler;
        if scheduler.connect_interval_ms == 0
            || scheduler.join_interval_ms == 0
            || scheduler.outbound_interval_ms == 0
            || scheduler.inbound_interval_ms == 0
        {
            return Err(Error::Config("Queue intervals must be greater than 0".to_string()));
        }

        if scheduler.queue_capacity == 0 {
            return Err(Error::Config("Queue capacity must be greater than 0".to_string()));
        }

        if scheduler.reconnect_base_delay_ms > scheduler.reconnect_max_delay_ms {
            return Err(Error::Config("Reconnect base delay exceeds the maximum delay".to_string()));
        }

        Ok(())
    }

    /// Build one connection config per configured account
    pub fn connection_configs(&self) -> Result<Vec<ConnectionConfig>> {
        self.accounts
            .iter()
            .map(|account| {
                let config = ConnectionConfig::new(
                    &self.server.host,
                    self.server.port,
                    &account.name,
                    Some(self.server.protocol),
                )?
                .with_secure(self.server.secure)
                .with_tls_insecure(self.server.tls_insecure)
                .with_keepalive_interval(Duration::from_secs(self.server.keepalive_interval_secs))
                .with_read_timeout(Duration::from_secs(self.server.read_timeout_secs))
                .with_capabilities(self.server.capabilities.clone());

                let config = match account.pass() {
                    Some(pass) => config.with_pass(pass),
                    None => config,
                };

                Ok(match self.server.local_address {
                    Some(addr) => config.with_local_address(addr),
                    None => config,
                })
            })
            .collect()
    }
}

/// Immutable settings for a single chat connection
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionConfig {
    host: String,
    port: u16,
    nick: String,
    pass: Option<String>,
    transport: TransportKind,
    secure: bool,
    tls_insecure: bool,
    local_address: Option<IpAddr>,
    keepalive_interval: Duration,
    read_timeout: Duration,
    capabilities: Vec<String>,
}

impl ConnectionConfig {
    /// Create a connection config; host, port, nick and transport are mandatory
    pub fn new(
        host: &str,
        port: u16,
        nick: &str,
        transport: Option<TransportKind>,
    ) -> Result<Self> {
        if host.is_empty() {
            return Err(Error::Config("No host configured".to_string()));
        }
        if port == 0 {
            return Err(Error::Config("No port configured".to_string()));
        }
        if nick.is_empty() {
            return Err(Error::Config("No nick configured".to_string()));
        }
        let transport =
            transport.ok_or_else(|| Error::Config("No protocol configured".to_string()))?;

        Ok(Self {
            host: host.to_string(),
            port,
            nick: nick.to_string(),
            pass: None,
            transport,
            secure: false,
            tls_insecure: false,
            local_address: None,
            keepalive_interval: Duration::from_secs(120),
            read_timeout: Duration::from_secs(360),
            capabilities: DEFAULT_CAPABILITIES.iter().map(|c| c.to_string()).collect(),
        })
    }

    pub fn with_pass(mut self, pass: String) -> Self {
        self.pass = Some(pass);
        self
    }

    pub fn with_secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    pub fn with_tls_insecure(mut self, tls_insecure: bool) -> Self {
        self.tls_insecure = tls_insecure;
        self
    }

    pub fn with_local_address(mut self, addr: IpAddr) -> Self {
        self.local_address = Some(addr);
        self
    }

    pub fn with_keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval = interval;
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn with_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn nick(&self) -> &str {
        &self.nick
    }

    pub fn pass(&self) -> Option<&str> {
        self.pass.as_deref()
    }

    pub fn transport(&self) -> TransportKind {
        self.transport
    }

    pub fn secure(&self) -> bool {
        self.secure
    }

    pub fn tls_insecure(&self) -> bool {
        self.tls_insecure
    }

    pub fn local_address(&self) -> Option<IpAddr> {
        self.local_address
    }

    pub fn keepalive_interval(&self) -> Duration {
        self.keepalive_interval
    }

    pub fn read_timeout(&self) -> Duration {
        self.read_timeout
    }

    pub fn capabilities(&self) -> &[String] {
        &self.capabilities
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> Config {
        let mut config = Config::default();
        config.accounts.push(AccountConfig {
            name: "volbot".to_string(),
            token: "abc123".to_string(),
        });
        config
    }

    #[test]
    fn test_default_config_needs_account() {
        let config = Config::default();
        assert!(matches!(config.validate(), Err(Error::Config(_))));
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn test_token_prefix() {
        let account = AccountConfig { name: "a".to_string(), token: "abc".to_string() };
        assert_eq!(account.pass().as_deref(), Some("oauth:abc"));

        let account = AccountConfig { name: "a".to_string(), token: "oauth:abc".to_string() };
        assert_eq!(account.pass().as_deref(), Some("oauth:abc"));

        let account = AccountConfig { name: "a".to_string(), token: String::new() };
        assert!(account.pass().is_none());
    }

    #[test]
    fn test_connection_config_mandatory_fields() {
        assert!(ConnectionConfig::new("", 80, "nick", Some(TransportKind::Raw)).is_err());
        assert!(ConnectionConfig::new("host", 0, "nick", Some(TransportKind::Raw)).is_err());
        assert!(ConnectionConfig::new("host", 80, "", Some(TransportKind::Raw)).is_err());
        assert!(ConnectionConfig::new("host", 80, "nick", None).is_err());
        assert!(ConnectionConfig::new("host", 80, "nick", Some(TransportKind::WebSocket)).is_ok());
    }

    #[test]
    fn test_connection_configs_per_account() {
        let mut config = valid_config();
        config.accounts.push(AccountConfig {
            name: "volbot2".to_string(),
            token: String::new(),
        });

        let connections = config.connection_configs().unwrap();
        assert_eq!(connections.len(), 2);
        assert_eq!(connections[0].nick(), "volbot");
        assert_eq!(connections[0].pass(), Some("oauth:abc123"));
        assert_eq!(connections[0].transport(), TransportKind::WebSocket);
        assert_eq!(connections[1].pass(), None);
    }

    #[test]
    fn test_duplicate_accounts_rejected() {
        let mut config = valid_config();
        config.accounts.push(AccountConfig {
            name: "VolBot".to_string(),
            token: String::new(),
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_queue_capacity_rejected() {
        let mut config = valid_config();
        config.scheduler.queue_capacity = 0;
        match config.validate() {
            Err(Error::Config(msg)) => assert!(msg.contains("capacity")),
            other => panic!("unexpected result {:?}", other),
        }

        config.scheduler.queue_capacity = 1;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_protocol_aliases() {
        let config: Config = toml::from_str(
            r#"
            [server]
            host = "irc.chat.twitch.tv"
            port = 6697
            protocol = "irc"
            secure = true

            [[accounts]]
            name = "volbot"
            token = "oauth:xyz"
            "#,
        )
        .unwrap();
        assert_eq!(config.server.protocol, TransportKind::Raw);
        assert!(config.server.secure);
        assert_eq!(config.scheduler.join_interval_ms, 250);
        assert_eq!(config.command.trigger, "!volume");

        let config: Config = toml::from_str("[server]\nprotocol = \"ws_irc\"\n").unwrap();
        assert_eq!(config.server.protocol, TransportKind::WebSocket);
    }

    #[test]
    fn test_config_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("volbot.toml");

        let config = valid_config();
        config.to_file(&path).unwrap();
        let loaded = Config::from_file(&path).unwrap();

        assert_eq!(loaded.accounts.len(), 1);
        assert_eq!(loaded.accounts[0].name, "volbot");
        assert_eq!(loaded.control.source_name, "Music");
        assert!(loaded.validate().is_ok());
    }
}
