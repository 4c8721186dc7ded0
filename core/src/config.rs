/// Configuration management
use crate::error::{ChatError, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_RELAY_PORT: u16 = 5000;
const DEFAULT_HTTP_PORT: u16 = 5001;

/// Reconnect behaviour after the link drops
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectPolicy {
    pub enabled: bool,

    /// Delay before the first retry
    pub base_delay: Duration,

    /// Upper bound for any single delay
    pub max_delay: Duration,

    /// Retries before giving up and staying disconnected
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            max_attempts: 8,
        }
    }
}

impl ReconnectPolicy {
    /// Capped exponential delay for the zero-based retry `attempt`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(31));
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }
}

/// Client-side chat configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatConfig {
    /// Relay address for the duplex channel
    pub relay_addr: SocketAddr,

    /// Base URL of the chat REST surface
    pub api_base: String,

    /// Connection establishment timeout (dial + authenticate)
    pub connect_timeout: Duration,

    /// How long a request waits for its acknowledgement
    pub ack_timeout: Duration,

    /// Interval between keepalive pings while connected
    pub keepalive_interval: Duration,

    pub reconnect: ReconnectPolicy,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            relay_addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_RELAY_PORT)),
            api_base: format!("http://127.0.0.1:{}", DEFAULT_HTTP_PORT),
            connect_timeout: Duration::from_secs(10),
            ack_timeout: Duration::from_secs(10),
            keepalive_interval: Duration::from_secs(30),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl ChatConfig {
    /// Parse `--flags` out of `args`; positional arguments are returned
    /// untouched for the caller.
    pub fn from_flags(args: &[String]) -> Result<(Self, Vec<String>)> {
        let mut config = Self::default();
        let mut positionals = Vec::new();

        let mut i = 0;
        while i < args.len() {
            match args[i].as_str() {
                "--relay" => {
                    let addr = flag_value(args, i, "--relay")?;
                    config.relay_addr = parse_addr(addr, "--relay")?;
                    i += 2;
                }
                "--api" => {
                    config.api_base = flag_value(args, i, "--api")?.trim_end_matches('/').to_string();
                    i += 2;
                }
                "--ack-timeout-ms" => {
                    let ms = flag_value(args, i, "--ack-timeout-ms")?;
                    config.ack_timeout = Duration::from_millis(ms.parse::<u64>().map_err(|_| {
                        ChatError::Config("--ack-timeout-ms must be a number".to_string())
                    })?);
                    i += 2;
                }
                "--no-reconnect" => {
                    config.reconnect.enabled = false;
                    i += 1;
                }
                other => {
                    positionals.push(other.to_string());
                    i += 1;
                }
            }
        }

        // Env overrides (nice for scripts)
        if let Ok(addr) = std::env::var("GIGCHAT_RELAY_ADDR") {
            config.relay_addr = parse_addr(&addr, "GIGCHAT_RELAY_ADDR")?;
        }
        if let Ok(base) = std::env::var("GIGCHAT_API_BASE") {
            config.api_base = base.trim_end_matches('/').to_string();
        }
        if std::env::var("GIGCHAT_NO_RECONNECT").is_ok() {
            config.reconnect.enabled = false;
        }

        Ok((config, positionals))
    }
}

/// Development relay configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Listening address for the duplex channel
    pub listen_addr: SocketAddr,

    /// Listening address for the HTTP history surface
    pub http_addr: SocketAddr,

    /// Optional directory for sled persistence (in-memory when unset)
    pub data_dir: Option<PathBuf>,

    /// Time allowed for a client to authenticate
    pub auth_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_RELAY_PORT)),
            http_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_HTTP_PORT)),
            data_dir: None,
            auth_timeout: Duration::from_secs(5),
        }
    }
}

impl RelayConfig {
    /// Create config from command line arguments
    pub fn from_args(args: &[String]) -> Result<Self> {
        let mut config = Self::default();

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "--http-port" => {
                    let p = flag_value(args, i, "--http-port")?;
                    config.http_addr.set_port(parse_port(p, "--http-port")?);
                    i += 2;
                }
                "--data-dir" => {
                    config.data_dir = Some(PathBuf::from(flag_value(args, i, "--data-dir")?));
                    i += 2;
                }
                "--help" | "-h" => {
                    return Err(ChatError::Config(format!(
                        "Usage: {} [port] [--http-port <port>] [--data-dir <path>]",
                        args.first().map(String::as_str).unwrap_or("relay")
                    )));
                }
                other => {
                    config.listen_addr.set_port(parse_port(other, "port")?);
                    i += 1;
                }
            }
        }

        if let Some(p) = std::env::var("GIGCHAT_HTTP_PORT")
            .ok()
            .and_then(|s| s.parse::<u16>().ok())
        {
            config.http_addr.set_port(p);
        }
        if let Ok(dir) = std::env::var("GIGCHAT_DATA_DIR") {
            config.data_dir = Some(PathBuf::from(dir));
        }

        Ok(config)
    }
}

fn flag_value<'a>(args: &'a [String], i: usize, flag: &str) -> Result<&'a str> {
    args.get(i + 1)
        .map(String::as_str)
        .ok_or_else(|| ChatError::Config(format!("{} requires an argument", flag)))
}

fn parse_port(value: &str, what: &str) -> Result<u16> {
    value
        .parse::<u16>()
        .map_err(|_| ChatError::Config(format!("{} must be a valid number (0-65535)", what)))
}

fn parse_addr(value: &str, what: &str) -> Result<SocketAddr> {
    value
        .parse()
        .map_err(|_| ChatError::Config(format!("{} must be host:port, got {}", what, value)))
}
