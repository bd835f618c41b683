use std::{sync::Arc, time::Instant};

use slidehost_agent::{Registry, Settings};

use crate::{config::ApiConfig, security::RateLimiter};

#[derive(Clone)]
pub struct AppState {
    pub registry: Registry,
    pub settings: Arc<Settings>,
    pub api: Arc<ApiConfig>,
    pub limiter: Arc<RateLimiter>,
    pub started: Instant,
}

impl AppState {
    pub fn new(registry: Registry, settings: Settings, api: ApiConfig) -> Self {
        let limiter = RateLimiter::new(api.rate_limit_window, api.rate_limit_max_hits);
        Self {
            registry,
            settings: Arc::new(settings),
            api: Arc::new(api),
            limiter: Arc::new(limiter),
            started: Instant::now(),
        }
    }
}
