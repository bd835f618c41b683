use std::{path::Path, time::Instant};

use chrono::{DateTime, Utc};

use crate::{
    registry::Registry,
    support::{disk_space, percentage, read_meminfo},
};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HealthThresholds {
    pub memory_pct: f64,
    pub disk_pct: f64,
    pub port_pct: f64,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            memory_pct: 90.0,
            disk_pct: 95.0,
            port_pct: 90.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
pub struct MemoryUsage {
    pub used: u64,
    pub total: u64,
    pub percentage: f64,
}

#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
pub struct DiskUsage {
    pub used: u64,
    pub total: u64,
    pub free: u64,
    pub percentage: f64,
}

#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: HealthStatus,
    /// Seconds since the service started.
    pub uptime: u64,
    pub active_presentations: usize,
    pub available_ports: usize,
    pub memory_usage: MemoryUsage,
    pub disk_usage: DiskUsage,
    pub version: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub issues: Vec<String>,
}

impl HealthReport {
    pub async fn collect(
        registry: &Registry,
        started: Instant,
        data_root: &Path,
        thresholds: HealthThresholds,
    ) -> Self {
        let memory = match read_meminfo().await {
            Some((total, available)) => {
                let used = total.saturating_sub(available);
                MemoryUsage {
                    used,
                    total,
                    percentage: percentage(used, total),
                }
            }
            None => MemoryUsage::default(),
        };

        // The temp root may not exist before the first presentation.
        let probe_path = if data_root.exists() {
            data_root
        } else {
            data_root.parent().unwrap_or(data_root)
        };
        let disk = match disk_space(probe_path) {
            Some((total, free)) => {
                let used = total.saturating_sub(free);
                DiskUsage {
                    used,
                    total,
                    free,
                    percentage: percentage(used, total),
                }
            }
            None => DiskUsage::default(),
        };

        let ports = registry.ports().stats();
        let stats = registry.stats().await;

        let mut report = Self {
            status: HealthStatus::Healthy,
            uptime: started.elapsed().as_secs(),
            active_presentations: stats.total,
            available_ports: ports.available,
            memory_usage: memory,
            disk_usage: disk,
            version: env!("CARGO_PKG_VERSION").to_string(),
            timestamp: Utc::now(),
            issues: Vec::new(),
        };
        report.evaluate(ports.utilization_percentage, thresholds);
        report
    }

    fn evaluate(&mut self, port_utilization: f64, t: HealthThresholds) {
        let mut issues = Vec::new();
        if self.memory_usage.percentage > t.memory_pct {
            issues.push(format!("memory usage {}%", self.memory_usage.percentage));
        }
        if self.disk_usage.percentage > t.disk_pct {
            issues.push(format!("disk usage {}%", self.disk_usage.percentage));
        }
        if port_utilization > t.port_pct {
            issues.push(format!("port utilization {port_utilization}%"));
        }
        if !issues.is_empty() {
            tracing::warn!(issues = %issues.join(", "), "service unhealthy");
            self.status = HealthStatus::Unhealthy;
        }
        self.issues = issues;
    }

    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }
}
