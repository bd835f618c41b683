use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use slidehost_process::{
    InstanceState, InstanceStatus, PresentationId, PresentationRequest, PresentationUrls,
};
use tokio::sync::{Mutex, Notify, watch};

use crate::{
    config::{Settings, TtlPolicy},
    error::AgentError,
    logs::SharedLogs,
    port_alloc::{PortAllocator, PortStats},
    scaffold::{ENTRY_FILE, Scaffolder},
    supervisor::{LaunchSpec, ProcessHandle, Supervisor},
};

pub const DEFAULT_LOG_LIMIT: usize = 200;
const MAX_LOG_LIMIT: usize = 2000;

/// One slot of the global concurrency ceiling, returned on drop.
#[derive(Debug)]
struct CapacitySlot {
    counter: Arc<AtomicUsize>,
}

impl CapacitySlot {
    fn try_acquire(counter: &Arc<AtomicUsize>, limit: usize) -> Option<Self> {
        let mut current = counter.load(Ordering::SeqCst);
        loop {
            if current >= limit {
                return None;
            }
            match counter.compare_exchange(current, current + 1, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => {
                    return Some(Self {
                        counter: counter.clone(),
                    });
                }
                Err(actual) => current = actual,
            }
        }
    }
}

impl Drop for CapacitySlot {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Debug)]
struct Instance {
    id: PresentationId,
    dir: PathBuf,
    port: u16,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    state: InstanceState,
    last_error: Option<String>,
    request: PresentationRequest,
    pid: Option<u32>,
    process: Option<ProcessHandle>,
    logs: Option<SharedLogs>,
    abort: Arc<Notify>,
    /// Closes once the creating task is done, rollback included.
    provisioned: watch::Receiver<()>,
    /// Moves here from the creating task when the instance turns ready.
    _slot: Option<CapacitySlot>,
}

/// What the creating task owns until the instance is registered as ready.
///
/// Fields drop in declaration order: capacity is returned before anyone
/// waiting on `done` is released.
struct Provisioning {
    slot: Option<CapacitySlot>,
    _done: watch::Sender<()>,
}

#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryStats {
    pub total: usize,
    pub provisioning: usize,
    pub ready: usize,
    pub error: usize,
    pub max_concurrent: usize,
    pub ports: PortStats,
}

/// Owns every live presentation and drives its lifecycle.
#[derive(Debug, Clone)]
pub struct Registry {
    inner: Arc<RegistryInner>,
}

#[derive(Debug)]
struct RegistryInner {
    ports: PortAllocator,
    scaffolder: Scaffolder,
    supervisor: Supervisor,
    ttl: TtlPolicy,
    max_concurrent: usize,
    public_base_url: String,
    active: Arc<AtomicUsize>,
    closing: AtomicBool,
    instances: Mutex<HashMap<PresentationId, Instance>>,
}

/// How a removed instance's renderer is stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stop {
    Graceful,
    Immediate,
}

impl Registry {
    pub fn new(settings: &Settings) -> Self {
        Self::from_parts(
            settings,
            PortAllocator::new(settings.port_range, settings.probe_ports),
            Scaffolder::new(settings.scaffold.clone()),
            Supervisor::new(settings.supervisor.clone()),
        )
    }

    pub fn from_parts(
        settings: &Settings,
        ports: PortAllocator,
        scaffolder: Scaffolder,
        supervisor: Supervisor,
    ) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                ports,
                scaffolder,
                supervisor,
                ttl: settings.ttl,
                max_concurrent: settings.max_concurrent.max(1),
                public_base_url: settings.public_base_url.trim_end_matches('/').to_string(),
                active: Arc::new(AtomicUsize::new(0)),
                closing: AtomicBool::new(false),
                instances: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn ports(&self) -> &PortAllocator {
        &self.inner.ports
    }

    pub fn scaffolder(&self) -> &Scaffolder {
        &self.inner.scaffolder
    }

    pub fn ttl_policy(&self) -> TtlPolicy {
        self.inner.ttl
    }

    pub fn max_concurrent(&self) -> usize {
        self.inner.max_concurrent
    }

    /// Instances currently holding a capacity slot.
    pub fn active_count(&self) -> usize {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// Provisions a presentation and returns once its renderer is serving.
    ///
    /// Runs on its own task so a dropped caller (client disconnect) cannot
    /// interrupt provisioning halfway through a rollback.
    pub async fn create(&self, req: PresentationRequest) -> Result<InstanceStatus, AgentError> {
        let this = self.clone();
        tokio::spawn(async move { this.provision(req).await })
            .await
            .map_err(|e| AgentError::Internal(anyhow::anyhow!("provisioning task failed: {e}")))?
    }

    async fn provision(&self, req: PresentationRequest) -> Result<InstanceStatus, AgentError> {
        let inner = &self.inner;
        if inner.closing.load(Ordering::SeqCst) {
            return Err(shutting_down());
        }
        let slot = CapacitySlot::try_acquire(&inner.active, inner.max_concurrent).ok_or(
            AgentError::CapacityExceeded {
                limit: inner.max_concurrent,
            },
        )?;
        let (done, provisioned) = watch::channel(());
        let mut guard = Provisioning {
            slot: Some(slot),
            _done: done,
        };
        let ttl = inner.ttl.resolve(req.ttl)?;

        let (id, dir) = inner.scaffolder.materialize(&req).await?;

        let port = match inner.ports.allocate() {
            Ok(port) => port,
            Err(e) => {
                self.rollback(&id, None, &dir).await;
                return Err(e);
            }
        };

        let created_at = Utc::now();
        let abort = Arc::new(Notify::new());
        {
            let mut map = inner.instances.lock().await;
            // Checked under the lock that shutdown drains with.
            if inner.closing.load(Ordering::SeqCst) {
                drop(map);
                self.rollback(&id, Some(port), &dir).await;
                return Err(shutting_down());
            }
            map.insert(
                id.clone(),
                Instance {
                    id: id.clone(),
                    dir: dir.clone(),
                    port,
                    created_at,
                    expires_at: created_at + chrono_duration(ttl),
                    state: InstanceState::Provisioning,
                    last_error: None,
                    request: req,
                    pid: None,
                    process: None,
                    logs: None,
                    abort: abort.clone(),
                    provisioned,
                    _slot: None,
                },
            );
        }
        tracing::info!(%id, port, ttl_ms = ttl.as_millis() as u64, "provisioning presentation");

        let spec = LaunchSpec {
            id: &id,
            dir: &dir,
            entry: ENTRY_FILE,
            port,
        };
        let mut handle = match inner.supervisor.spawn(&spec).await {
            Ok(handle) => handle,
            Err(e) => {
                self.rollback(&id, Some(port), &dir).await;
                return Err(e);
            }
        };

        if let Some(entry) = inner.instances.lock().await.get_mut(&id) {
            entry.pid = handle.pid();
            entry.logs = Some(handle.logs());
        }

        if let Err(e) = inner.supervisor.await_ready(&mut handle, &abort).await {
            inner.supervisor.kill_now(&mut handle).await;
            self.rollback(&id, Some(port), &dir).await;
            return Err(e);
        }

        let exits = handle.exit_watch();
        let registered = {
            let mut map = inner.instances.lock().await;
            match map.get_mut(&id) {
                Some(entry) => {
                    entry.state = InstanceState::Ready;
                    entry.process = Some(handle);
                    entry._slot = guard.slot.take();
                    Ok(self.status_of(entry))
                }
                None => Err(handle),
            }
        };
        let status = match registered {
            Ok(status) => status,
            Err(mut handle) => {
                // Deleted between readiness and registration.
                inner.supervisor.kill_now(&mut handle).await;
                self.rollback(&id, Some(port), &dir).await;
                return Err(AgentError::startup("presentation was deleted while starting"));
            }
        };

        self.watch_exit(id.clone(), exits);
        tracing::info!(%id, port, url = %status.url, "presentation ready");
        Ok(status)
    }

    /// Releases everything a failed provisioning acquired. Failures here are
    /// logged; the caller still returns the original error.
    async fn rollback(&self, id: &PresentationId, port: Option<u16>, dir: &Path) {
        let inner = &self.inner;
        if let Some(mut entry) = inner.instances.lock().await.remove(id) {
            entry.state = InstanceState::Error;
        }
        if let Some(port) = port {
            inner.ports.release(port);
        }
        if let Err(e) = inner.scaffolder.cleanup(dir).await {
            tracing::error!(%id, error = %e, "rollback could not remove working directory");
        }
        tracing::warn!(%id, ?port, "provisioning rolled back");
    }

    fn watch_exit(
        &self,
        id: PresentationId,
        mut exits: tokio::sync::watch::Receiver<Option<crate::supervisor::ProcessExit>>,
    ) {
        let weak: Weak<RegistryInner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let exit = match exits.wait_for(Option::is_some).await {
                Ok(v) => v.clone(),
                Err(_) => None,
            };
            let Some(inner) = weak.upgrade() else {
                return;
            };
            Registry { inner }.handle_unexpected_exit(&id, exit).await;
        });
    }

    async fn handle_unexpected_exit(
        &self,
        id: &PresentationId,
        exit: Option<crate::supervisor::ProcessExit>,
    ) {
        let removed = {
            let mut map = self.inner.instances.lock().await;
            let ready = map
                .get(id)
                .is_some_and(|e| e.state == InstanceState::Ready);
            if ready { map.remove(id) } else { None }
        };
        let Some(mut entry) = removed else {
            // Already removed through delete, sweep or shutdown.
            return;
        };

        let reason = exit
            .map(|e| e.describe())
            .unwrap_or_else(|| "supervision ended".to_string());
        entry.state = InstanceState::Error;
        entry.last_error = Some(format!("renderer exited unexpectedly ({reason})"));
        tracing::warn!(%id, port = entry.port, %reason, "renderer exited unexpectedly");
        self.teardown(entry, Stop::Immediate).await;
    }

    pub async fn get(&self, id: &PresentationId) -> Option<InstanceStatus> {
        let map = self.inner.instances.lock().await;
        map.get(id).map(|entry| self.status_of(entry))
    }

    pub async fn list(&self) -> Vec<InstanceStatus> {
        let map = self.inner.instances.lock().await;
        let mut out: Vec<InstanceStatus> = map.values().map(|e| self.status_of(e)).collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        out
    }

    /// Removes a presentation and force-stops its renderer. Returns once
    /// the process, port and working directory are all released.
    pub async fn delete(&self, id: &PresentationId) -> bool {
        let removed = self.inner.instances.lock().await.remove(id);
        let Some(entry) = removed else {
            return false;
        };
        tracing::info!(%id, state = entry.state.as_str(), "deleting presentation");
        if entry.state == InstanceState::Provisioning {
            Self::abort_provisioning(entry).await;
            return true;
        }
        self.teardown(entry, Stop::Immediate).await;
        true
    }

    pub async fn extend(
        &self,
        id: &PresentationId,
        ttl_ms: u64,
    ) -> Result<InstanceStatus, AgentError> {
        let ttl = self.inner.ttl.resolve(Some(ttl_ms))?;
        let mut map = self.inner.instances.lock().await;
        let entry = map
            .get_mut(id)
            .ok_or_else(|| AgentError::NotFound(id.clone()))?;
        entry.expires_at = Utc::now() + chrono_duration(ttl);
        tracing::info!(%id, expires_at = %entry.expires_at, "presentation extended");
        Ok(self.status_of(entry))
    }

    pub async fn sweep_expired(&self) -> usize {
        self.sweep_expired_at(Utc::now()).await
    }

    /// Tears down every instance with `expires_at <= now`.
    pub async fn sweep_expired_at(&self, now: DateTime<Utc>) -> usize {
        let expired: Vec<Instance> = {
            let mut map = self.inner.instances.lock().await;
            let ids: Vec<PresentationId> = map
                .values()
                .filter(|e| e.expires_at <= now)
                .map(|e| e.id.clone())
                .collect();
            ids.iter().filter_map(|id| map.remove(id)).collect()
        };
        let count = expired.len();
        if count == 0 {
            return 0;
        }

        let mut tasks = Vec::with_capacity(count);
        for mut entry in expired {
            tracing::info!(id = %entry.id, expires_at = %entry.expires_at, "presentation expired");
            if entry.state == InstanceState::Provisioning {
                tasks.push(tokio::spawn(Self::abort_provisioning(entry)));
                continue;
            }
            entry.state = InstanceState::Expired;
            let this = self.clone();
            tasks.push(tokio::spawn(async move {
                this.teardown(entry, Stop::Graceful).await
            }));
        }
        for task in tasks {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "expiry teardown task failed");
            }
        }
        tracing::info!(count, "expired presentations swept");
        count
    }

    pub fn spawn_sweeper(&self, interval: Duration) -> tokio::task::JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                this.sweep_expired().await;
            }
        })
    }

    /// Renderer output after `cursor` (0 = most recent `limit` lines).
    pub async fn logs(
        &self,
        id: &PresentationId,
        cursor: u64,
        limit: Option<usize>,
    ) -> Result<(Vec<String>, u64), AgentError> {
        let logs = {
            let map = self.inner.instances.lock().await;
            let entry = map.get(id).ok_or_else(|| AgentError::NotFound(id.clone()))?;
            entry.logs.clone()
        };
        let limit = limit.unwrap_or(DEFAULT_LOG_LIMIT).clamp(1, MAX_LOG_LIMIT);
        match logs {
            Some(logs) => Ok(logs.lock().await.tail_after(cursor, limit)),
            None => Ok((Vec::new(), cursor)),
        }
    }

    pub async fn check_health(&self, id: &PresentationId) -> Result<bool, AgentError> {
        let (alive, port) = {
            let map = self.inner.instances.lock().await;
            let entry = map.get(id).ok_or_else(|| AgentError::NotFound(id.clone()))?;
            let alive = entry.state == InstanceState::Ready
                && entry.process.as_ref().is_some_and(|p| !p.has_exited());
            (alive, entry.port)
        };
        Ok(alive && self.inner.supervisor.probe_port(port).await)
    }

    pub async fn stats(&self) -> RegistryStats {
        let map = self.inner.instances.lock().await;
        let count = |s: InstanceState| map.values().filter(|e| e.state == s).count();
        RegistryStats {
            total: map.len(),
            provisioning: count(InstanceState::Provisioning),
            ready: count(InstanceState::Ready),
            error: count(InstanceState::Error),
            max_concurrent: self.inner.max_concurrent,
            ports: self.inner.ports.stats(),
        }
    }

    /// Stops every renderer and removes every working directory.
    pub async fn shutdown(&self) {
        let drained: Vec<Instance> = {
            let mut map = self.inner.instances.lock().await;
            self.inner.closing.store(true, Ordering::SeqCst);
            map.drain().map(|(_, e)| e).collect()
        };
        if drained.is_empty() {
            return;
        }
        tracing::info!(count = drained.len(), "shutting down presentations");

        let mut tasks = Vec::new();
        for entry in drained {
            if entry.state == InstanceState::Provisioning {
                tasks.push(tokio::spawn(Self::abort_provisioning(entry)));
                continue;
            }
            let this = self.clone();
            tasks.push(tokio::spawn(async move {
                this.teardown(entry, Stop::Graceful).await
            }));
        }
        for task in tasks {
            let _ = task.await;
        }
    }

    /// Signals the creating task to stop and waits until it has killed the
    /// renderer and rolled back.
    async fn abort_provisioning(entry: Instance) {
        let Instance {
            id,
            abort,
            mut provisioned,
            ..
        } = entry;
        abort.notify_one();
        // Errors once the creating task drops its sender.
        let _ = provisioned.changed().await;
        tracing::debug!(%id, "provisioning aborted");
    }

    /// Process, port, directory. Each step runs even if an earlier one failed.
    async fn teardown(&self, mut entry: Instance, stop: Stop) {
        let inner = &self.inner;
        let id = entry.id.clone();
        if let Some(mut handle) = entry.process.take() {
            let exit = match stop {
                Stop::Graceful => inner.supervisor.terminate(&mut handle).await,
                Stop::Immediate => inner.supervisor.kill_now(&mut handle).await,
            };
            match exit {
                Some(exit) => tracing::debug!(%id, exit = %exit.describe(), "renderer stopped"),
                None => tracing::error!(%id, pid = ?handle.pid(), "renderer did not stop"),
            }
        }
        if !inner.ports.release(entry.port) {
            tracing::warn!(%id, port = entry.port, "port was not held at teardown");
        }
        if let Err(e) = inner.scaffolder.cleanup(&entry.dir).await {
            tracing::error!(%id, error = %e, "failed to remove working directory");
        }
        tracing::info!(
            %id,
            state = entry.state.as_str(),
            last_error = ?entry.last_error,
            "presentation torn down"
        );
    }

    fn status_of(&self, entry: &Instance) -> InstanceStatus {
        let url = instance_origin(&self.inner.public_base_url, entry.port);
        InstanceStatus {
            id: entry.id.clone(),
            state: entry.state,
            port: entry.port,
            urls: PresentationUrls::from_base(&url),
            url,
            created_at: entry.created_at,
            expires_at: entry.expires_at,
            title: entry.request.title.clone(),
            theme: entry.request.theme.clone(),
            pid: entry.pid,
            last_error: entry.last_error.clone(),
            healthy: None,
        }
    }
}

fn shutting_down() -> AgentError {
    AgentError::ServiceUnavailable("registry is shutting down".to_string())
}

/// `base` with `port` placed in its authority.
fn instance_origin(base: &str, port: u16) -> String {
    if let Ok(mut url) = reqwest::Url::parse(base)
        && matches!(url.scheme(), "http" | "https")
        && url.set_port(Some(port)).is_ok()
    {
        return url.origin().ascii_serialization();
    }
    format!("{}:{port}", base.trim_end_matches('/'))
}

fn chrono_duration(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    use crate::{
        port_alloc::PortRange,
        readiness::{HealthCheck, ReadinessProbe},
        scaffold::DependencyMode,
        supervisor::{RendererConfig, SupervisorConfig},
    };

    fn temp_root(test_name: &str) -> PathBuf {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        std::env::temp_dir().join(format!(
            "slidehost-registry-{test_name}-{}-{n}",
            std::process::id()
        ))
    }

    fn settings(test_name: &str, script: &str, ports: (u16, u16)) -> Settings {
        let mut s = Settings::with_root(temp_root(test_name));
        s.scaffold.dependencies = DependencyMode::None;
        s.port_range = PortRange {
            start: ports.0,
            end: ports.1,
        };
        s.probe_ports = false;
        s.supervisor = SupervisorConfig {
            renderer: RendererConfig {
                program: "/bin/sh".to_string(),
                args: vec!["-c".to_string(), script.to_string()],
                bind: "127.0.0.1".to_string(),
                env: Vec::new(),
            },
            readiness: ReadinessProbe::OutputPattern {
                patterns: vec!["ready on {port}".to_string()],
            },
            startup_timeout: Duration::from_secs(5),
            termination_grace: Duration::from_millis(500),
            ..SupervisorConfig::default()
        };
        s
    }

    const SERVING: &str = "echo \"ready on $PORT\"; sleep 30";

    fn request() -> PresentationRequest {
        PresentationRequest {
            content: "# Hello\n\n---\n\n# World".to_string(),
            title: Some("Demo".to_string()),
            ..PresentationRequest::default()
        }
    }

    fn work_dirs(registry: &Registry) -> usize {
        std::fs::read_dir(registry.scaffolder().presentations_root())
            .map(|d| d.count())
            .unwrap_or(0)
    }

    fn cleanup(s: &Settings) {
        let _ = std::fs::remove_dir_all(&s.temp_root);
    }

    #[tokio::test]
    async fn create_get_delete_roundtrip() {
        let s = settings("roundtrip", SERVING, (41000, 41009));
        let registry = Registry::new(&s);

        let status = registry.create(request()).await.unwrap();
        assert_eq!(status.state, InstanceState::Ready);
        assert_eq!(status.port, 41000);
        assert_eq!(status.url, "http://localhost:41000");
        assert_eq!(status.urls.presenter, "http://localhost:41000/presenter/");
        assert_eq!(status.title.as_deref(), Some("Demo"));
        assert_eq!(
            (status.expires_at - status.created_at).num_milliseconds() as u64,
            crate::config::DEFAULT_TTL_MS
        );

        let fetched = registry.get(&status.id).await.unwrap();
        assert_eq!(fetched.id, status.id);
        assert_eq!(registry.list().await.len(), 1);
        assert!(registry.check_health(&status.id).await.unwrap());
        assert_eq!(work_dirs(&registry), 1);

        assert!(registry.delete(&status.id).await);
        assert!(registry.get(&status.id).await.is_none());
        assert!(!registry.ports().is_allocated(41000));
        assert_eq!(work_dirs(&registry), 0);
        assert_eq!(registry.active_count(), 0);
        assert!(!registry.delete(&status.id).await);
        cleanup(&s);
    }

    #[tokio::test]
    async fn concurrent_creates_get_distinct_ports_until_exhausted() {
        let s = settings("exhaust", SERVING, (41010, 41012));
        let registry = Registry::new(&s);

        let (a, b, c) = tokio::join!(
            registry.create(request()),
            registry.create(request()),
            registry.create(request())
        );
        let mut ports = vec![a.unwrap().port, b.unwrap().port, c.unwrap().port];
        ports.sort_unstable();
        assert_eq!(ports, vec![41010, 41011, 41012]);

        let err = registry.create(request()).await.unwrap_err();
        assert!(matches!(err, AgentError::ResourceExhausted { .. }));
        assert_eq!(registry.list().await.len(), 3);
        assert_eq!(work_dirs(&registry), 3);

        registry.shutdown().await;
        assert!(registry.list().await.is_empty());
        assert_eq!(registry.ports().stats().allocated, 0);
        cleanup(&s);
    }

    #[tokio::test]
    async fn capacity_ceiling_is_enforced() {
        let mut s = settings("capacity", SERVING, (41020, 41029));
        s.max_concurrent = 1;
        let registry = Registry::new(&s);

        let first = registry.create(request()).await.unwrap();
        let err = registry.create(request()).await.unwrap_err();
        assert_eq!(err.code(), "capacity_exceeded");
        assert_eq!(registry.ports().stats().allocated, 1);

        registry.delete(&first.id).await;
        registry.create(request()).await.unwrap();
        registry.shutdown().await;
        cleanup(&s);
    }

    #[tokio::test]
    async fn failed_startup_leaves_nothing_behind() {
        let mut s = settings("startup-fail", "echo 'cannot render' >&2; sleep 0.2; exit 1", (41030, 41031));
        s.supervisor.startup_timeout = Duration::from_secs(5);
        let registry = Registry::new(&s);

        let err = registry.create(request()).await.unwrap_err();
        assert_eq!(err.code(), "process_startup_failed");
        assert!(err.to_string().contains("cannot render"));
        assert!(registry.list().await.is_empty());
        assert_eq!(registry.ports().stats().allocated, 0);
        assert_eq!(work_dirs(&registry), 0);
        assert_eq!(registry.active_count(), 0);
        cleanup(&s);
    }

    #[tokio::test]
    async fn startup_timeout_rolls_back() {
        let mut s = settings("timeout", "echo booting; sleep 30", (41040, 41041));
        s.supervisor.startup_timeout = Duration::from_millis(300);
        let registry = Registry::new(&s);

        let err = registry.create(request()).await.unwrap_err();
        assert!(err.to_string().contains("did not become ready"));
        assert!(registry.list().await.is_empty());
        assert!(!registry.ports().is_allocated(41040));
        assert_eq!(work_dirs(&registry), 0);
        cleanup(&s);
    }

    #[tokio::test]
    async fn invalid_ttl_is_rejected_before_allocation() {
        let s = settings("ttl", SERVING, (41050, 41051));
        let registry = Registry::new(&s);
        let req = PresentationRequest {
            ttl: Some(1_000),
            ..request()
        };
        let err = registry.create(req).await.unwrap_err();
        assert_eq!(err.code(), "invalid_ttl");
        assert_eq!(registry.ports().stats().allocated, 0);
        assert_eq!(work_dirs(&registry), 0);
        cleanup(&s);
    }

    #[tokio::test]
    async fn extend_moves_expiry_and_validates_range() {
        let s = settings("extend", SERVING, (41060, 41061));
        let registry = Registry::new(&s);
        let req = PresentationRequest {
            ttl: Some(60_000),
            ..request()
        };
        let status = registry.create(req).await.unwrap();

        let extended = registry.extend(&status.id, 7_200_000).await.unwrap();
        assert!(extended.expires_at > status.expires_at);
        assert_eq!(extended.created_at, status.created_at);

        let err = registry.extend(&status.id, 10).await.unwrap_err();
        assert_eq!(err.code(), "invalid_ttl");
        let unchanged = registry.get(&status.id).await.unwrap();
        assert_eq!(unchanged.expires_at, extended.expires_at);

        let missing = PresentationId::new();
        let err = registry.extend(&missing, 60_000).await.unwrap_err();
        assert_eq!(err.code(), "not_found");

        registry.shutdown().await;
        cleanup(&s);
    }

    #[tokio::test]
    async fn sweep_removes_exactly_expired_instances() {
        let s = settings("sweep", SERVING, (41070, 41079));
        let registry = Registry::new(&s);
        let short = registry
            .create(PresentationRequest {
                ttl: Some(60_000),
                ..request()
            })
            .await
            .unwrap();
        let long = registry
            .create(PresentationRequest {
                ttl: Some(3_600_000),
                ..request()
            })
            .await
            .unwrap();

        let later = short.created_at + chrono::Duration::milliseconds(61_000);
        assert_eq!(registry.sweep_expired_at(later).await, 1);
        assert!(registry.get(&short.id).await.is_none());
        assert!(registry.get(&long.id).await.is_some());
        assert!(!registry.ports().is_allocated(short.port));
        assert_eq!(registry.ports().allocate().unwrap(), short.port);
        registry.ports().release(short.port);

        assert_eq!(registry.sweep_expired_at(later).await, 0);
        assert_eq!(registry.sweep_expired().await, 0);

        registry.shutdown().await;
        cleanup(&s);
    }

    /// Waits until the single instance being created shows up with a pid.
    async fn provisioning_instance(registry: &Registry) -> InstanceStatus {
        for _ in 0..200 {
            if let Some(status) = registry.list().await.into_iter().next()
                && status.pid.is_some()
            {
                assert_eq!(status.state, InstanceState::Provisioning);
                return status;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("no provisioning instance appeared");
    }

    fn process_alive(pid: u32) -> bool {
        unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
    }

    #[tokio::test]
    async fn delete_during_provisioning_releases_everything_before_returning() {
        let mut s = settings("abort", "sleep 30", (41080, 41081));
        s.max_concurrent = 1;
        let registry = Registry::new(&s);

        let creating = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.create(request()).await })
        };
        let status = provisioning_instance(&registry).await;
        assert_eq!(registry.active_count(), 1);

        assert!(registry.delete(&status.id).await);
        assert_eq!(registry.active_count(), 0);
        assert_eq!(registry.ports().stats().allocated, 0);
        assert_eq!(work_dirs(&registry), 0);
        assert!(!process_alive(status.pid.unwrap()));

        let err = creating.await.unwrap().unwrap_err();
        assert_eq!(err.code(), "process_startup_failed");
        assert!(registry.get(&status.id).await.is_none());
        cleanup(&s);
    }

    #[tokio::test]
    async fn shutdown_waits_for_provisioning_rollback() {
        let s = settings("shutdown-abort", "sleep 30", (41110, 41111));
        let registry = Registry::new(&s);

        let creating = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.create(request()).await })
        };
        let status = provisioning_instance(&registry).await;

        registry.shutdown().await;
        assert_eq!(work_dirs(&registry), 0);
        assert_eq!(registry.ports().stats().allocated, 0);
        assert_eq!(registry.active_count(), 0);
        assert!(!process_alive(status.pid.unwrap()));
        assert!(creating.await.unwrap().is_err());

        let err = registry.create(request()).await.unwrap_err();
        assert_eq!(err.code(), "service_unavailable");
        assert_eq!(work_dirs(&registry), 0);
        cleanup(&s);
    }

    #[tokio::test]
    async fn sweep_waits_for_expired_provisioning_rollback() {
        let s = settings("sweep-abort", "sleep 30", (41120, 41121));
        let registry = Registry::new(&s);

        let creating = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.create(request()).await })
        };
        let status = provisioning_instance(&registry).await;

        let later = status.expires_at + chrono::Duration::milliseconds(1);
        assert_eq!(registry.sweep_expired_at(later).await, 1);
        assert_eq!(work_dirs(&registry), 0);
        assert_eq!(registry.ports().stats().allocated, 0);
        assert_eq!(registry.active_count(), 0);
        assert!(creating.await.unwrap().is_err());
        cleanup(&s);
    }

    #[tokio::test]
    async fn spawn_failure_rolls_back() {
        let mut s = settings("spawn-fail", SERVING, (41130, 41131));
        s.supervisor.renderer.program = "/nonexistent/renderer".to_string();
        let registry = Registry::new(&s);

        let err = registry.create(request()).await.unwrap_err();
        assert_eq!(err.code(), "process_startup_failed");
        assert!(err.to_string().contains("/nonexistent/renderer"));
        assert!(registry.list().await.is_empty());
        assert_eq!(registry.ports().stats().allocated, 0);
        assert_eq!(work_dirs(&registry), 0);
        assert_eq!(registry.active_count(), 0);
        cleanup(&s);
    }

    #[tokio::test]
    async fn tcp_health_check_requires_a_listener() {
        let mut s = settings("health-tcp", SERVING, (41140, 41141));
        s.supervisor.health_check = HealthCheck::TcpConnect;
        let registry = Registry::new(&s);

        // The shell renderer never binds its port.
        let status = registry.create(request()).await.unwrap();
        assert!(!registry.check_health(&status.id).await.unwrap());
        assert_eq!(
            registry
                .check_health(&PresentationId::new())
                .await
                .unwrap_err()
                .code(),
            "not_found"
        );
        registry.shutdown().await;
        cleanup(&s);
    }

    #[test]
    fn instance_origin_puts_port_in_authority() {
        assert_eq!(
            instance_origin("http://localhost", 3001),
            "http://localhost:3001"
        );
        assert_eq!(
            instance_origin("https://slides.example.com/prefix", 3001),
            "https://slides.example.com:3001"
        );
    }

    #[tokio::test]
    async fn unexpected_exit_reclaims_resources() {
        let s = settings(
            "crash",
            "echo \"ready on $PORT\"; sleep 0.3; exit 2",
            (41090, 41091),
        );
        let registry = Registry::new(&s);
        let status = registry.create(request()).await.unwrap();

        let mut gone = false;
        for _ in 0..100 {
            if registry.get(&status.id).await.is_none() {
                gone = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(gone);
        assert!(!registry.ports().is_allocated(status.port));
        assert_eq!(work_dirs(&registry), 0);
        assert_eq!(registry.active_count(), 0);
        cleanup(&s);
    }

    #[tokio::test]
    async fn logs_and_stats_reflect_running_instances() {
        let s = settings(
            "logs",
            "echo first; echo \"ready on $PORT\"; sleep 30",
            (41100, 41101),
        );
        let registry = Registry::new(&s);
        let status = registry.create(request()).await.unwrap();

        let (lines, cursor) = registry.logs(&status.id, 0, None).await.unwrap();
        assert!(lines.iter().any(|l| l.contains("[stdout] first")));
        assert!(cursor > 0);
        let (more, same) = registry.logs(&status.id, cursor, Some(10)).await.unwrap();
        assert!(more.is_empty());
        assert_eq!(same, cursor);

        let stats = registry.stats().await;
        assert_eq!(stats.total, 1);
        assert_eq!(stats.ready, 1);
        assert_eq!(stats.ports.allocated, 1);

        let missing = PresentationId::new();
        assert_eq!(
            registry.logs(&missing, 0, None).await.unwrap_err().code(),
            "not_found"
        );
        registry.shutdown().await;
        cleanup(&s);
    }
}
