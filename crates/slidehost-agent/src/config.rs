use std::{path::PathBuf, time::Duration};

use anyhow::Context;

use crate::{
    error::AgentError,
    install::InstallPlan,
    port_alloc::PortRange,
    readiness::{HealthCheck, ReadinessProbe},
    scaffold::{DependencyMode, ScaffoldConfig},
    supervisor::{RendererConfig, SupervisorConfig},
    support::{env_bool, env_list, env_millis, env_string, env_u16, env_u64, env_usize},
};

pub const DEFAULT_TTL_MS: u64 = 60 * 60 * 1000;
pub const MIN_TTL_MS: u64 = 60 * 1000;
pub const MAX_TTL_MS: u64 = 24 * 60 * 60 * 1000;

/// Allowed presentation lifetimes, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TtlPolicy {
    pub default_ms: u64,
    pub min_ms: u64,
    pub max_ms: u64,
}

impl Default for TtlPolicy {
    fn default() -> Self {
        Self {
            default_ms: DEFAULT_TTL_MS,
            min_ms: MIN_TTL_MS,
            max_ms: MAX_TTL_MS,
        }
    }
}

impl TtlPolicy {
    /// Absent means default; out of range is rejected rather than clamped.
    pub fn resolve(&self, requested: Option<u64>) -> Result<Duration, AgentError> {
        let ms = requested.unwrap_or(self.default_ms);
        if ms < self.min_ms || ms > self.max_ms {
            return Err(AgentError::invalid_field(
                "invalid_ttl",
                "ttl",
                format!(
                    "ttl must be between {} and {} milliseconds",
                    self.min_ms, self.max_ms
                ),
            ));
        }
        Ok(Duration::from_millis(ms))
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub temp_root: PathBuf,
    pub max_concurrent: usize,
    pub ttl: TtlPolicy,
    pub port_range: PortRange,
    pub probe_ports: bool,
    pub sweep_interval: Duration,
    /// Origin the renderer is reachable under, without a port.
    pub public_base_url: String,
    pub supervisor: SupervisorConfig,
    pub scaffold: ScaffoldConfig,
}

impl Settings {
    /// Defaults with every directory under `temp_root`.
    pub fn with_root(temp_root: PathBuf) -> Self {
        Self {
            scaffold: ScaffoldConfig::new(temp_root.clone()),
            temp_root,
            max_concurrent: 10,
            ttl: TtlPolicy::default(),
            port_range: PortRange {
                start: 3000,
                end: 3100,
            },
            probe_ports: true,
            sweep_interval: Duration::from_secs(5 * 60),
            public_base_url: "http://localhost".to_string(),
            supervisor: SupervisorConfig::default(),
        }
    }

    pub fn from_env() -> anyhow::Result<Self> {
        let temp_root = env_string("SLIDEHOST_TEMP_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| std::env::temp_dir().join("slidehost"));
        let mut s = Self::with_root(temp_root);

        s.max_concurrent = env_usize("SLIDEHOST_MAX_CONCURRENT")
            .map(|v| v.clamp(1, 1000))
            .unwrap_or(s.max_concurrent);

        let min_ms = env_u64("SLIDEHOST_MIN_TTL_MS")
            .map(|v| v.clamp(1000, MAX_TTL_MS * 7))
            .unwrap_or(MIN_TTL_MS);
        let max_ms = env_u64("SLIDEHOST_MAX_TTL_MS")
            .map(|v| v.clamp(min_ms, MAX_TTL_MS * 7))
            .unwrap_or(MAX_TTL_MS.max(min_ms));
        let default_ms = env_u64("SLIDEHOST_DEFAULT_TTL_MS")
            .unwrap_or(DEFAULT_TTL_MS)
            .clamp(min_ms, max_ms);
        s.ttl = TtlPolicy {
            default_ms,
            min_ms,
            max_ms,
        };

        let start = env_u16("SLIDEHOST_PORT_RANGE_START")
            .map(|v| v.max(1))
            .unwrap_or(s.port_range.start);
        let end = env_u16("SLIDEHOST_PORT_RANGE_END").unwrap_or(s.port_range.end);
        if end < start {
            anyhow::bail!("SLIDEHOST_PORT_RANGE_END ({end}) is below SLIDEHOST_PORT_RANGE_START ({start})");
        }
        s.port_range = PortRange { start, end };
        s.probe_ports = env_bool("SLIDEHOST_PORT_PROBE").unwrap_or(true);

        s.sweep_interval =
            env_millis("SLIDEHOST_CLEANUP_INTERVAL_MS", 1_000, 3_600_000, 300_000);
        if let Some(url) = env_string("SLIDEHOST_PUBLIC_BASE_URL") {
            s.public_base_url = parse_public_base_url(&url)?;
        }

        s.supervisor = supervisor_from_env();
        s.scaffold = scaffold_from_env(s.temp_root.clone());
        Ok(s)
    }
}

/// Accepts a bare `http(s)://host` origin; the instance port is added to it.
pub fn parse_public_base_url(raw: &str) -> anyhow::Result<String> {
    let url = reqwest::Url::parse(raw.trim())
        .with_context(|| format!("SLIDEHOST_PUBLIC_BASE_URL is not a URL: {raw}"))?;
    if !matches!(url.scheme(), "http" | "https") {
        anyhow::bail!("SLIDEHOST_PUBLIC_BASE_URL must be http or https: {raw}");
    }
    if url.port().is_some() {
        anyhow::bail!("SLIDEHOST_PUBLIC_BASE_URL must not carry a port: {raw}");
    }
    if url.path() != "/" || url.query().is_some() || url.fragment().is_some() {
        anyhow::bail!("SLIDEHOST_PUBLIC_BASE_URL must not carry a path: {raw}");
    }
    Ok(url.origin().ascii_serialization())
}

fn supervisor_from_env() -> SupervisorConfig {
    let defaults = SupervisorConfig::default();
    let renderer = RendererConfig {
        program: env_string("SLIDEHOST_RENDERER_BIN").unwrap_or(defaults.renderer.program.clone()),
        args: env_string("SLIDEHOST_RENDERER_ARGS")
            .map(|v| v.split_whitespace().map(String::from).collect())
            .unwrap_or(defaults.renderer.args.clone()),
        bind: env_string("SLIDEHOST_RENDERER_BIND").unwrap_or(defaults.renderer.bind.clone()),
        env: defaults.renderer.env.clone(),
    };

    let readiness = match env_string("SLIDEHOST_READY_PROBE").as_deref() {
        Some("http") => ReadinessProbe::HttpPoll {
            path: "/".to_string(),
            interval: Duration::from_millis(500),
        },
        Some("tcp") => ReadinessProbe::TcpConnect {
            interval: Duration::from_millis(500),
        },
        _ => match env_list("SLIDEHOST_READY_PATTERNS") {
            Some(patterns) => ReadinessProbe::OutputPattern { patterns },
            None => defaults.readiness.clone(),
        },
    };

    let health_check = match env_string("SLIDEHOST_HEALTH_CHECK").as_deref() {
        Some("tcp") => HealthCheck::TcpConnect,
        _ => HealthCheck::ProcessAlive,
    };

    SupervisorConfig {
        renderer,
        readiness,
        health_check,
        startup_timeout: env_millis("SLIDEHOST_STARTUP_TIMEOUT_MS", 1_000, 900_000, 180_000),
        termination_grace: env_millis("SLIDEHOST_TERM_GRACE_MS", 100, 60_000, 5_000),
        log_max_lines: env_usize("SLIDEHOST_LOG_MAX_LINES")
            .map(|v| v.clamp(100, 100_000))
            .unwrap_or(defaults.log_max_lines),
        ..defaults
    }
}

fn scaffold_from_env(root: PathBuf) -> ScaffoldConfig {
    let mut cfg = ScaffoldConfig::new(root);
    cfg.dependencies = match env_string("SLIDEHOST_DEPENDENCIES").as_deref() {
        Some("none" | "global") => DependencyMode::None,
        Some("per-request") => DependencyMode::PerRequest,
        _ if env_bool("SLIDEHOST_TEMPLATE_ENABLED") == Some(false) => DependencyMode::PerRequest,
        _ => DependencyMode::Template,
    };
    if let Some(paths) = env_list("SLIDEHOST_TEMPLATE_REQUIRED_PATHS") {
        cfg.required_paths = paths;
    }

    let defaults = InstallPlan::default();
    cfg.install = InstallPlan {
        max_attempts: env_u64("SLIDEHOST_INSTALL_ATTEMPTS")
            .map(|v| v.clamp(1, 10) as u32)
            .unwrap_or(defaults.max_attempts),
        backoff_base: env_millis("SLIDEHOST_INSTALL_BACKOFF_MS", 100, 60_000, 2_000),
        timeout: env_millis("SLIDEHOST_INSTALL_TIMEOUT_MS", 10_000, 3_600_000, 600_000),
        ..defaults
    };
    cfg
}
