use crate::streaming::relay::RelayClientConfig;
use crate::streaming::waveform::DEFAULT_DISPLAY_POINTS;
use crate::streaming::SessionConfig;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Relay configuration loaded from environment variables
#[derive(Debug, Clone, PartialEq)]
pub struct RelayConfig {
    /// Address the UDP listener binds to
    pub udp_host: String,
    /// UDP port the acquisition bridge sends to
    pub udp_port: u16,
    /// Receive buffer per datagram in bytes
    pub udp_buffer_size: usize,
    /// Reject datagrams with a different channel count
    pub channel_count: Option<usize>,
    /// Processing backend WebSocket endpoint
    pub backend_url: String,
    /// Relay connect timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Keep a session running when the backend is unreachable
    pub allow_offline: bool,
    /// Points kept per channel for display
    pub display_points: usize,
    /// SQLite database file
    pub database_path: PathBuf,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            udp_host: "127.0.0.1".to_string(),
            udp_port: 12345,
            udp_buffer_size: 65536,
            channel_count: None,
            backend_url: "ws://localhost:8000/ws".to_string(),
            connect_timeout_ms: 5000,
            allow_offline: false,
            display_points: DEFAULT_DISPLAY_POINTS,
            database_path: PathBuf::from("ecmo.db"),
        }
    }
}

impl RelayConfig {
    /// Load configuration from environment variables (and `.env` if present)
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from an arbitrary variable source; unset variables keep defaults
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let udp_port = match lookup("NEURASENSE_UDP_PORT") {
            Some(value) => value
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidPort(value))?,
            None => defaults.udp_port,
        };

        let backend_url = lookup("NEURASENSE_BACKEND_URL").unwrap_or(defaults.backend_url);
        if !(backend_url.starts_with("ws://") || backend_url.starts_with("wss://")) {
            return Err(ConfigError::InvalidValue(format!(
                "NEURASENSE_BACKEND_URL must be a ws:// or wss:// URL, got {}",
                backend_url
            )));
        }

        let udp_buffer_size = parse_number(&lookup, "NEURASENSE_UDP_BUFFER_SIZE")?
            .unwrap_or(defaults.udp_buffer_size);
        if udp_buffer_size == 0 {
            return Err(ConfigError::InvalidValue(
                "NEURASENSE_UDP_BUFFER_SIZE must be greater than 0".to_string(),
            ));
        }

        let channel_count: Option<usize> = parse_number(&lookup, "NEURASENSE_CHANNEL_COUNT")?;
        if channel_count == Some(0) {
            return Err(ConfigError::InvalidValue(
                "NEURASENSE_CHANNEL_COUNT must be greater than 0".to_string(),
            ));
        }

        Ok(Self {
            udp_host: lookup("NEURASENSE_UDP_HOST").unwrap_or(defaults.udp_host),
            udp_port,
            udp_buffer_size,
            channel_count,
            backend_url,
            connect_timeout_ms: parse_number(&lookup, "NEURASENSE_CONNECT_TIMEOUT_MS")?
                .unwrap_or(defaults.connect_timeout_ms),
            allow_offline: lookup("NEURASENSE_ALLOW_OFFLINE")
                .map(|v| matches!(v.trim().to_lowercase().as_str(), "true" | "1" | "yes"))
                .unwrap_or(defaults.allow_offline),
            display_points: parse_number(&lookup, "NEURASENSE_DISPLAY_POINTS")?
                .unwrap_or(defaults.display_points),
            database_path: lookup("NEURASENSE_DATABASE_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.database_path),
        })
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            udp_host: self.udp_host.clone(),
            udp_port: self.udp_port,
            backend_url: self.backend_url.clone(),
            allow_offline: self.allow_offline,
        }
    }

    pub fn relay_client_config(&self) -> RelayClientConfig {
        RelayClientConfig {
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            ..Default::default()
        }
    }
}

fn parse_number<F, T>(lookup: &F, key: &str) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(key) {
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue(format!("{}={}", key, value))),
        None => Ok(None),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid UDP port: {0}")]
    InvalidPort(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}
