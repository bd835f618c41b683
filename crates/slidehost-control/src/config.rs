use std::{net::SocketAddr, time::Duration};

fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_u64(name: &str) -> Option<u64> {
    env_string(name).and_then(|v| v.parse::<u64>().ok())
}

/// HTTP surface settings; orchestration settings live in `slidehost_agent::Settings`.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
    pub rate_limit_window: Duration,
    pub rate_limit_max_hits: usize,
    /// Upper bound for request bodies; sized for maximal content plus CSS.
    pub body_limit_bytes: usize,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            rate_limit_window: Duration::from_secs(15 * 60),
            rate_limit_max_hits: 100,
            body_limit_bytes: 8 * 1024 * 1024,
        }
    }
}

impl ApiConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            host: env_string("SLIDEHOST_HOST").unwrap_or(d.host),
            port: env_string("SLIDEHOST_PORT")
                .and_then(|v| v.parse::<u16>().ok())
                .unwrap_or(d.port),
            rate_limit_window: Duration::from_millis(
                env_u64("SLIDEHOST_RATE_LIMIT_WINDOW_MS")
                    .map(|v| v.clamp(1000, 24 * 60 * 60 * 1000))
                    .unwrap_or(d.rate_limit_window.as_millis() as u64),
            ),
            rate_limit_max_hits: env_u64("SLIDEHOST_RATE_LIMIT_MAX")
                .map(|v| v.clamp(1, 1_000_000) as usize)
                .unwrap_or(d.rate_limit_max_hits),
            body_limit_bytes: d.body_limit_bytes,
        }
    }

    pub fn addr(&self) -> anyhow::Result<SocketAddr> {
        let raw = format!("{}:{}", self.host, self.port);
        raw.parse::<SocketAddr>()
            .map_err(|e| anyhow::anyhow!("invalid listen address {raw}: {e}"))
    }
}
