use std::time::Duration;

/// How the supervisor decides a freshly spawned renderer is serving.
#[derive(Debug, Clone, PartialEq)]
pub enum ReadinessProbe {
    /// A line of output contains one of the patterns (case-insensitive).
    /// `{port}` is replaced with the allocated port.
    OutputPattern { patterns: Vec<String> },
    /// `GET http://127.0.0.1:{port}{path}` answers with anything but a 5xx.
    HttpPoll { path: String, interval: Duration },
    /// The port accepts TCP connections.
    TcpConnect { interval: Duration },
    /// Assume readiness after a fixed delay, as long as the process is alive.
    FixedDelay(Duration),
}

impl Default for ReadinessProbe {
    fn default() -> Self {
        ReadinessProbe::OutputPattern {
            patterns: vec![
                "localhost:{port}".to_string(),
                "127.0.0.1:{port}".to_string(),
                "0.0.0.0:{port}".to_string(),
            ],
        }
    }
}

impl ReadinessProbe {
    pub fn matches_line(&self, line: &str, port: u16) -> bool {
        let ReadinessProbe::OutputPattern { patterns } = self else {
            return false;
        };
        let lower = line.to_ascii_lowercase();
        let port = port.to_string();
        patterns.iter().any(|p| {
            let p = p.replace("{port}", &port).to_ascii_lowercase();
            !p.is_empty() && lower.contains(&p)
        })
    }

    pub(crate) fn poll_interval(&self) -> Option<Duration> {
        match self {
            ReadinessProbe::HttpPoll { interval, .. } | ReadinessProbe::TcpConnect { interval } => {
                Some((*interval).max(Duration::from_millis(50)))
            }
            _ => None,
        }
    }

    pub(crate) fn fixed_delay(&self) -> Option<Duration> {
        match self {
            ReadinessProbe::FixedDelay(d) => Some(*d),
            _ => None,
        }
    }

    /// One polling attempt; only meaningful for the polling variants.
    pub(crate) async fn poll_once(&self, http: &reqwest::Client, port: u16) -> bool {
        match self {
            ReadinessProbe::HttpPoll { path, .. } => http_ok(http, port, path).await,
            ReadinessProbe::TcpConnect { .. } => tcp_open(port).await,
            _ => false,
        }
    }
}

pub(crate) async fn tcp_open(port: u16) -> bool {
    let connect = tokio::net::TcpStream::connect(("127.0.0.1", port));
    matches!(
        tokio::time::timeout(Duration::from_millis(500), connect).await,
        Ok(Ok(_))
    )
}

/// Client shared by every readiness poll of one supervisor.
pub(crate) fn probe_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(2))
        .build()
        .unwrap_or_else(|e| {
            tracing::warn!(error = %e, "failed to build readiness http client, using defaults");
            reqwest::Client::new()
        })
}

async fn http_ok(http: &reqwest::Client, port: u16, path: &str) -> bool {
    let path = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    };
    let url = format!("http://127.0.0.1:{port}{path}");
    match http.get(&url).send().await {
        Ok(resp) => !resp.status().is_server_error(),
        Err(_) => false,
    }
}

/// Health-check depth applied to ready instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HealthCheck {
    /// The renderer process has not exited.
    #[default]
    ProcessAlive,
    /// Alive and its port accepts connections.
    TcpConnect,
}
