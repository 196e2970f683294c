use std::{fmt, str::FromStr, time::Duration};

pub const DEFAULT_HUB_ADDR: &str = "127.0.0.1:8080";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PendingPolicy {
    #[default]
    Fail,
    Timeout,
}

impl FromStr for PendingPolicy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "fail" => Ok(PendingPolicy::Fail),
            "timeout" => Ok(PendingPolicy::Timeout),
            other => Err(format!("unknown pending policy: {other}")),
        }
    }
}

impl fmt::Display for PendingPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PendingPolicy::Fail => f.write_str("fail"),
            PendingPolicy::Timeout => f.write_str("timeout"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct HubConfig {
    pub addr: String,
    pub command_timeout: Duration,
    pub keep_alive_interval: Duration,
    pub server_timeout: Duration,
    pub queue_capacity: usize,
    pub write_timeout: Duration,
    pub pending_on_disconnect: PendingPolicy,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            addr: DEFAULT_HUB_ADDR.to_string(),
            command_timeout: Duration::from_secs(30),
            keep_alive_interval: Duration::from_secs(15),
            server_timeout: Duration::from_secs(30),
            queue_capacity: 256,
            write_timeout: Duration::from_secs(2),
            pending_on_disconnect: PendingPolicy::Fail,
        }
    }
}
