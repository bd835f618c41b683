use std::{path::Path, process::Stdio, time::Duration};

use anyhow::Context;

use crate::support::{compute_backoff, truncate_utf8};

const OUTPUT_TAIL_BYTES: usize = 2 * 1024;

/// One way of installing the renderer's dependencies into a project dir.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallStrategy {
    pub name: String,
    pub program: String,
    pub args: Vec<String>,
}

impl InstallStrategy {
    pub fn new(name: &str, program: &str, args: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }
}

/// Ordered escalation of install strategies with uniform backoff.
///
/// Attempt `n` uses strategy `n` (the last one repeats when attempts outnumber
/// strategies) after sleeping `backoff_base * 2^(n-2)`.
#[derive(Debug, Clone, PartialEq)]
pub struct InstallPlan {
    pub strategies: Vec<InstallStrategy>,
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub timeout: Duration,
}

impl Default for InstallPlan {
    fn default() -> Self {
        Self {
            strategies: vec![
                InstallStrategy::new("npm", "npm", &["install", "--no-audit", "--no-fund"]),
                InstallStrategy::new(
                    "npm-legacy-peer-deps",
                    "npm",
                    &["install", "--no-audit", "--no-fund", "--legacy-peer-deps"],
                ),
                InstallStrategy::new(
                    "npm-force",
                    "npm",
                    &["install", "--no-audit", "--no-fund", "--force"],
                ),
            ],
            max_attempts: 3,
            backoff_base: Duration::from_secs(2),
            backoff_max: Duration::from_secs(30),
            timeout: Duration::from_secs(600),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallOutcome {
    pub strategy: String,
    pub attempt: u32,
}

impl InstallPlan {
    pub fn strategy_for_attempt(&self, attempt: u32) -> Option<&InstallStrategy> {
        let idx = (attempt.saturating_sub(1) as usize).min(self.strategies.len().checked_sub(1)?);
        self.strategies.get(idx)
    }

    pub async fn run(&self, dir: &Path) -> anyhow::Result<InstallOutcome> {
        if self.strategies.is_empty() {
            anyhow::bail!("no install strategies configured");
        }

        let attempts = self.max_attempts.max(1);
        let mut failures = Vec::<String>::new();
        for attempt in 1..=attempts {
            let Some(strategy) = self.strategy_for_attempt(attempt) else {
                break;
            };
            if attempt > 1 {
                let delay = compute_backoff(self.backoff_base, self.backoff_max, attempt - 1);
                tracing::info!(
                    attempt,
                    strategy = %strategy.name,
                    delay_ms = delay.as_millis() as u64,
                    "retrying dependency install"
                );
                tokio::time::sleep(delay).await;
            }

            match self.run_one(strategy, dir).await {
                Ok(()) => {
                    tracing::info!(
                        attempt,
                        strategy = %strategy.name,
                        dir = %dir.display(),
                        "dependency install succeeded"
                    );
                    return Ok(InstallOutcome {
                        strategy: strategy.name.clone(),
                        attempt,
                    });
                }
                Err(e) => {
                    let msg = crate::support::format_error_chain(&e);
                    tracing::warn!(attempt, strategy = %strategy.name, error = %msg, "dependency install failed");
                    failures.push(format!("attempt {attempt} ({}): {msg}", strategy.name));
                }
            }
        }

        anyhow::bail!("dependency install failed: {}", failures.join("; "))
    }

    async fn run_one(&self, strategy: &InstallStrategy, dir: &Path) -> anyhow::Result<()> {
        let child = tokio::process::Command::new(&strategy.program)
            .args(&strategy.args)
            .current_dir(dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("spawn {}", strategy.program))?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| anyhow::anyhow!("timed out after {}ms", self.timeout.as_millis()))?
            .with_context(|| format!("wait for {}", strategy.program))?;

        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let tail = tail_str(stderr.trim(), OUTPUT_TAIL_BYTES);
        anyhow::bail!(
            "{} exited with {}: {}",
            strategy.program,
            output
                .status
                .code()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string()),
            truncate_utf8(&tail, OUTPUT_TAIL_BYTES)
        )
    }
}

fn tail_str(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }
    let mut start = s.len() - max_bytes;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    s[start..].to_string()
}
