//! Configuration file support for the voice CLI tools

use serde::{Deserialize, Serialize};
use std::fs;
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::time::Duration;
use voice::ServerConfig;
use voice_protocol::packet::MAX_PLAYER_ID_LEN;
use voice_protocol::ConnectionInfo;
use voice_playback::PlaybackConfig;

/// Server configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerSettings {
    /// Local address for both listeners
    #[serde(default = "default_bind")]
    pub bind: IpAddr,
    /// Stream (TCP) port
    #[serde(default = "default_tcp_port")]
    pub tcp_port: u16,
    /// Datagram (UDP) port
    #[serde(default = "default_udp_port")]
    pub udp_port: u16,
    /// Address advertised to players; discovered when unset
    #[serde(default)]
    pub public_ip: Option<IpAddr>,
    /// Statistics interval in seconds (0 disables)
    #[serde(default = "default_stats_interval")]
    pub stats_interval_secs: u64,
}

fn default_bind() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_tcp_port() -> u16 {
    52525
}

fn default_udp_port() -> u16 {
    52526
}

fn default_stats_interval() -> u64 {
    10
}

impl Default for ServerSettings {
    fn default() -> Self {
        ServerSettings {
            bind: default_bind(),
            tcp_port: default_tcp_port(),
            udp_port: default_udp_port(),
            public_ip: None,
            stats_interval_secs: default_stats_interval(),
        }
    }
}

/// Client configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientSettings {
    /// Player id announced to the server
    pub player_id: String,
    /// Server host name or address
    pub server_address: String,
    /// Server stream (TCP) port
    #[serde(default = "default_tcp_port")]
    pub server_port: u16,
    /// Local address for the datagram receiver
    #[serde(default = "default_bind")]
    pub udp_bind: IpAddr,
    /// Local datagram port (0 picks one)
    #[serde(default)]
    pub udp_port: u16,
    /// Address announced for the datagram receiver; the bind address when unset
    #[serde(default)]
    pub advertised_ip: Option<IpAddr>,
    /// Raw PCM input (48 kHz mono s16le), "-" for stdin
    #[serde(default = "default_input")]
    pub input: String,
    /// File receiving played audio
    #[serde(default)]
    pub output: Option<String>,
    /// Readiness handshake bound in milliseconds
    #[serde(default = "default_readiness_timeout")]
    pub readiness_timeout_ms: u64,
    /// Jitter buffer slots per remote player
    #[serde(default = "default_jitter_slots")]
    pub jitter_slots: usize,
    /// Playback tick in milliseconds
    #[serde(default = "default_tick_interval")]
    pub tick_interval_ms: u64,
    /// Spatial refresh in milliseconds
    #[serde(default = "default_spatial_refresh")]
    pub spatial_refresh_ms: u64,
    /// Statistics interval in seconds (0 disables)
    #[serde(default = "default_stats_interval")]
    pub stats_interval_secs: u64,
}

fn default_input() -> String {
    "-".to_string()
}

fn default_readiness_timeout() -> u64 {
    5000
}

fn default_jitter_slots() -> usize {
    4
}

fn default_tick_interval() -> u64 {
    20
}

fn default_spatial_refresh() -> u64 {
    100
}

impl Default for ClientSettings {
    fn default() -> Self {
        ClientSettings {
            player_id: "player".to_string(),
            server_address: "127.0.0.1".to_string(),
            server_port: default_tcp_port(),
            udp_bind: default_bind(),
            udp_port: 0,
            advertised_ip: None,
            input: default_input(),
            output: None,
            readiness_timeout_ms: default_readiness_timeout(),
            jitter_slots: default_jitter_slots(),
            tick_interval_ms: default_tick_interval(),
            spatial_refresh_ms: default_spatial_refresh(),
            stats_interval_secs: default_stats_interval(),
        }
    }
}

/// Combined configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    pub server: Option<ServerSettings>,
    pub client: Option<ClientSettings>,
}

impl Config {
    /// Load configuration from TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }

    /// Check values that would make the tools misbehave
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(client) = &self.client {
            client.validate()?;
        }
        Ok(())
    }

    /// Create example server configuration
    pub fn example_server() -> Self {
        Config {
            server: Some(ServerSettings::default()),
            client: None,
        }
    }

    /// Create example client configuration
    pub fn example_client() -> Self {
        Config {
            server: None,
            client: Some(ClientSettings {
                player_id: "alice".to_string(),
                server_address: "voice.example.net".to_string(),
                output: Some("received.pcm".to_string()),
                ..ClientSettings::default()
            }),
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl ServerSettings {
    /// Datagram server configuration
    pub fn datagram_config(&self) -> ServerConfig {
        ServerConfig {
            bind_ip: self.bind,
            port: self.udp_port,
            public_ip: self.public_ip,
        }
    }

    /// Get statistics interval as Duration
    pub fn stats_interval(&self) -> Option<Duration> {
        (self.stats_interval_secs > 0).then(|| Duration::from_secs(self.stats_interval_secs))
    }
}

impl ClientSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.player_id.is_empty() {
            return Err(ConfigError::Invalid("player_id must not be empty".to_string()));
        }
        if self.player_id.len() > MAX_PLAYER_ID_LEN {
            return Err(ConfigError::Invalid(format!(
                "player_id must be at most {} bytes",
                MAX_PLAYER_ID_LEN
            )));
        }
        self.server_info()?;
        if self.jitter_slots == 0 {
            return Err(ConfigError::Invalid("jitter_slots must be at least 1".to_string()));
        }
        if self.tick_interval_ms == 0 {
            return Err(ConfigError::Invalid("tick_interval_ms must be positive".to_string()));
        }
        if self.readiness_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "readiness_timeout_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Stream endpoint of the server
    pub fn server_info(&self) -> Result<ConnectionInfo, ConfigError> {
        ConnectionInfo::new(self.server_address.clone(), self.server_port)
            .map_err(|e| ConfigError::Invalid(format!("server_address: {}", e)))
    }

    pub fn readiness_timeout(&self) -> Duration {
        Duration::from_millis(self.readiness_timeout_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn playback_config(&self) -> PlaybackConfig {
        PlaybackConfig {
            slots: self.jitter_slots,
            refresh_interval: Duration::from_millis(self.spatial_refresh_ms),
        }
    }

    /// Get statistics interval as Duration
    pub fn stats_interval(&self) -> Option<Duration> {
        (self.stats_interval_secs > 0).then(|| Duration::from_secs(self.stats_interval_secs))
    }
}
