use crate::registry::{RegistryReader, REGISTRY_DIR_NAME};
use std::{fmt, path::PathBuf, str::FromStr, time::Duration};

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 6400;
pub const MIN_MAX_RETRIES: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportMode {
    Stdio,
    Http,
}

impl TransportMode {
    pub fn as_str(self) -> &'static str {
        match self {
            TransportMode::Stdio => "stdio",
            TransportMode::Http => "http",
        }
    }
}

impl fmt::Display for TransportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "stdio" | "socket" | "tcp" => Ok(TransportMode::Stdio),
            "http" | "hub" | "ws" => Ok(TransportMode::Http),
            other => Err(format!("unknown transport mode: {other}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub host: String,
    pub default_port: u16,
    pub registry_dir: PathBuf,
    pub connect_timeout: Duration,
    pub io_timeout: Duration,
    pub retry_io_timeout: Duration,
    pub probe_timeout: Duration,
    pub max_retries: u32,
    pub reload_retry_ms: u64,
    pub reload_max_retries: u32,
    pub status_stale_after: Option<Duration>,
    pub transport_mode: TransportMode,
    pub http_remote_hosted: bool,
    pub discovery_cache_ttl: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            default_port: DEFAULT_PORT,
            registry_dir: RegistryReader::default_dir()
                .unwrap_or_else(|| PathBuf::from(REGISTRY_DIR_NAME)),
            connect_timeout: Duration::from_secs(1),
            io_timeout: Duration::from_secs(30),
            retry_io_timeout: Duration::from_secs(1),
            probe_timeout: Duration::from_millis(300),
            max_retries: MIN_MAX_RETRIES,
            reload_retry_ms: 250,
            reload_max_retries: 40,
            status_stale_after: Some(Duration::from_secs(120)),
            transport_mode: TransportMode::Stdio,
            http_remote_hosted: false,
            discovery_cache_ttl: Duration::from_secs(2),
        }
    }
}

impl BridgeConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let value = |key: &str| {
            lookup(key)
                .map(|raw| raw.trim().to_string())
                .filter(|raw| !raw.is_empty())
        };
        let parsed = |key: &str| value(key).and_then(|raw| raw.parse::<u64>().ok());

        let mut config = Self::default();
        if let Some(host) = value("UMB_UNITY_HOST") {
            config.host = host;
        }
        if let Some(port) = value("UMB_DEFAULT_PORT").and_then(|raw| raw.parse::<u16>().ok()) {
            config.default_port = port;
        }
        if let Some(dir) = value("UMB_REGISTRY_DIR") {
            config.registry_dir = PathBuf::from(dir);
        }
        if let Some(ms) = parsed("UMB_CONNECT_TIMEOUT_MS") {
            config.connect_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parsed("UMB_IO_TIMEOUT_MS") {
            config.io_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parsed("UMB_PROBE_TIMEOUT_MS") {
            config.probe_timeout = Duration::from_millis(ms);
        }
        if let Some(retries) = parsed("UMB_MAX_RETRIES") {
            config.max_retries = u32::try_from(retries).unwrap_or(u32::MAX);
        }
        if let Some(ms) = parsed("UMB_RELOAD_RETRY_MS") {
            config.reload_retry_ms = ms;
        }
        if let Some(retries) = parsed("UMB_RELOAD_MAX_RETRIES") {
            config.reload_max_retries = u32::try_from(retries).unwrap_or(u32::MAX);
        }
        if let Some(secs) = parsed("UMB_STATUS_STALE_SECS") {
            config.status_stale_after = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Some(mode) = value("UMB_TRANSPORT").and_then(|raw| raw.parse().ok()) {
            config.transport_mode = mode;
        }
        if let Some(flag) = value("UMB_HTTP_REMOTE_HOSTED") {
            config.http_remote_hosted = is_truthy(&flag);
        }
        config
    }

    /// Transport attempts per dispatch; never fewer than five.
    pub fn attempts(&self) -> u32 {
        self.max_retries.max(MIN_MAX_RETRIES)
    }

    pub fn registry(&self) -> RegistryReader {
        RegistryReader::new(self.registry_dir.clone())
    }

    pub fn allows_port_descriptors(&self) -> bool {
        self.transport_mode == TransportMode::Stdio && !self.http_remote_hosted
    }
}

pub fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
