use std::{path::Path, process::Stdio, sync::Arc, time::Duration};

use slidehost_process::PresentationId;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWriteExt},
    process::{ChildStdin, Command},
    sync::{Mutex, Notify, mpsc, oneshot, watch},
    time::Instant,
};

use crate::{
    error::AgentError,
    interaction::{InteractionPolicy, PromptResponder},
    logs::{LineSplitter, LogBuffer, SharedLogs},
    readiness::{HealthCheck, ReadinessProbe},
};

/// How long to wait for the kernel to reap a SIGKILLed renderer.
const REAP_WINDOW: Duration = Duration::from_secs(3);
const FAILURE_TAIL_LINES: usize = 12;

/// Renderer command line. Arguments may use `{entry}`, `{port}`, `{bind}`
/// and `{dir}` placeholders.
#[derive(Debug, Clone, PartialEq)]
pub struct RendererConfig {
    pub program: String,
    pub args: Vec<String>,
    pub bind: String,
    pub env: Vec<(String, String)>,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            program: "npx".to_string(),
            args: ["slidev", "{entry}", "--port", "{port}", "--bind", "{bind}"]
                .into_iter()
                .map(String::from)
                .collect(),
            bind: "0.0.0.0".to_string(),
            env: vec![("BROWSER".to_string(), "none".to_string())],
        }
    }
}

impl RendererConfig {
    pub(crate) fn render_args(&self, spec: &LaunchSpec<'_>) -> Vec<String> {
        let port = spec.port.to_string();
        let dir = spec.dir.display().to_string();
        self.args
            .iter()
            .map(|a| {
                a.replace("{entry}", spec.entry)
                    .replace("{port}", &port)
                    .replace("{bind}", &self.bind)
                    .replace("{dir}", &dir)
            })
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub renderer: RendererConfig,
    pub readiness: ReadinessProbe,
    pub interaction: InteractionPolicy,
    /// Output fragments that mean startup cannot succeed.
    pub error_patterns: Vec<String>,
    pub health_check: HealthCheck,
    pub startup_timeout: Duration,
    pub termination_grace: Duration,
    pub log_max_lines: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            renderer: RendererConfig::default(),
            readiness: ReadinessProbe::default(),
            interaction: InteractionPolicy::auto_confirm(),
            error_patterns: vec![
                "EADDRINUSE".to_string(),
                "ERR_MODULE_NOT_FOUND".to_string(),
            ],
            health_check: HealthCheck::default(),
            startup_timeout: Duration::from_secs(180),
            termination_grace: Duration::from_secs(5),
            log_max_lines: crate::logs::DEFAULT_LOG_MAX_LINES,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct LaunchSpec<'a> {
    pub id: &'a PresentationId,
    pub dir: &'a Path,
    pub entry: &'a str,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessExit {
    pub code: Option<i32>,
    pub signal: Option<i32>,
    pub error: Option<String>,
}

impl ProcessExit {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    pub fn describe(&self) -> String {
        if let Some(err) = &self.error {
            return format!("wait failed: {err}");
        }
        match (self.code, self.signal) {
            (Some(code), _) => format!("exit code {code}"),
            (None, Some(sig)) => format!("killed by signal {sig}"),
            (None, None) => "exited".to_string(),
        }
    }
}

#[derive(Debug)]
pub(crate) enum OutputEvent {
    Line(String),
    Prompt(String),
}

/// Ownership of one spawned renderer.
///
/// Dropping the handle kills the process group; a renderer never outlives
/// the instance that owns it.
#[derive(Debug)]
pub struct ProcessHandle {
    pid: Option<u32>,
    pgid: Option<i32>,
    port: u16,
    stdin: Option<ChildStdin>,
    exit: watch::Receiver<Option<ProcessExit>>,
    kill_tx: Option<oneshot::Sender<()>>,
    events: Option<mpsc::UnboundedReceiver<OutputEvent>>,
    logs: SharedLogs,
}

impl ProcessHandle {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn logs(&self) -> SharedLogs {
        self.logs.clone()
    }

    pub fn exit_status(&self) -> Option<ProcessExit> {
        self.exit.borrow().clone()
    }

    pub fn has_exited(&self) -> bool {
        self.exit.borrow().is_some()
    }

    /// Resolves with the exit once the waiter task observes it.
    pub fn exit_watch(&self) -> watch::Receiver<Option<ProcessExit>> {
        self.exit.clone()
    }

    pub async fn wait_exit(&self, timeout: Duration) -> Option<ProcessExit> {
        let mut rx = self.exit.clone();
        let waited = tokio::time::timeout(timeout, async move {
            rx.wait_for(Option::is_some).await.ok().and_then(|v| v.clone())
        })
        .await;
        match waited {
            Ok(exit) => exit,
            Err(_) => None,
        }
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        if !self.has_exited() {
            signal_group(self.pgid, GroupSignal::Kill);
        }
    }
}

#[derive(Debug, Clone)]
pub struct Supervisor {
    cfg: Arc<SupervisorConfig>,
    http: reqwest::Client,
}

impl Supervisor {
    pub fn new(cfg: SupervisorConfig) -> Self {
        Self {
            cfg: Arc::new(cfg),
            http: crate::readiness::probe_client(),
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.cfg
    }

    pub async fn spawn(&self, spec: &LaunchSpec<'_>) -> Result<ProcessHandle, AgentError> {
        let renderer = &self.cfg.renderer;
        let args = renderer.render_args(spec);

        let mut cmd = Command::new(&renderer.program);
        cmd.current_dir(spec.dir)
            .args(&args)
            .env("PORT", spec.port.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (k, v) in &renderer.env {
            cmd.env(k, v);
        }

        #[cfg(unix)]
        {
            unsafe {
                cmd.pre_exec(|| {
                    set_parent_death_signal()?;
                    if libc::setsid() == -1 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }

        let logs: SharedLogs = Arc::new(Mutex::new(LogBuffer::with_capacity(
            self.cfg.log_max_lines,
        )));
        logs.lock().await.push_line(format!(
            "[slidehost] exec: {} {} (cwd {}) port={}",
            renderer.program,
            args.join(" "),
            spec.dir.display(),
            spec.port
        ));

        let mut child = cmd.spawn().map_err(|e| {
            AgentError::startup(format!(
                "spawn {} (cwd {}): {e}",
                renderer.program,
                spec.dir.display()
            ))
        })?;
        let pid = child.id();
        let pgid = pid.map(|p| p as i32);
        tracing::info!(id = %spec.id, ?pid, port = spec.port, "renderer spawned");

        let stdin = child.stdin.take();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        if let Some(out) = child.stdout.take() {
            tokio::spawn(pump_output(out, "stdout", logs.clone(), events_tx.clone()));
        }
        if let Some(err) = child.stderr.take() {
            tokio::spawn(pump_output(err, "stderr", logs.clone(), events_tx.clone()));
        }
        drop(events_tx);

        let (exit_tx, exit_rx) = watch::channel(None);
        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        let wait_logs = logs.clone();
        let id = spec.id.clone();
        tokio::spawn(async move {
            // A dropped sender counts as a kill request as well.
            let res = tokio::select! {
                res = child.wait() => res,
                _ = kill_rx => {
                    let _ = child.start_kill();
                    child.wait().await
                }
            };
            let exit = match res {
                Ok(status) => ProcessExit {
                    code: status.code(),
                    signal: exit_signal(&status),
                    error: None,
                },
                Err(e) => ProcessExit {
                    code: None,
                    signal: None,
                    error: Some(e.to_string()),
                },
            };
            wait_logs
                .lock()
                .await
                .push_line(format!("[slidehost] renderer exited: {}", exit.describe()));
            tracing::info!(%id, exit = %exit.describe(), "renderer exited");
            let _ = exit_tx.send(Some(exit));
        });

        Ok(ProcessHandle {
            pid,
            pgid,
            port: spec.port,
            stdin,
            exit: exit_rx,
            kill_tx: Some(kill_tx),
            events: Some(events_rx),
            logs,
        })
    }

    /// Waits for the readiness signal, answering prompts along the way.
    ///
    /// Fails when the renderer exits, prints an error pattern, misses the
    /// startup deadline, or `abort` is notified. The process is left running
    /// on failure; the caller decides how to dispose of it.
    pub async fn await_ready(
        &self,
        handle: &mut ProcessHandle,
        abort: &Notify,
    ) -> Result<(), AgentError> {
        let port = handle.port;
        let probe = &self.cfg.readiness;
        let started = Instant::now();
        let deadline = started + self.cfg.startup_timeout;
        let fixed_at = probe.fixed_delay().map(|d| started + d);
        let poll_every = probe.poll_interval();
        let mut ticker = tokio::time::interval(poll_every.unwrap_or(Duration::from_secs(3600)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let mut events = handle.events.take();
        let mut exit = handle.exit.clone();
        let mut responder = PromptResponder::default();

        let outcome: Result<(), String> = loop {
            if let Some(status) = exit.borrow_and_update().clone() {
                break Err(format!(
                    "renderer exited before becoming ready ({})",
                    status.describe()
                ));
            }

            tokio::select! {
                _ = abort.notified() => {
                    break Err("presentation was deleted while starting".to_string());
                }
                changed = exit.changed() => {
                    if changed.is_err() {
                        break Err("renderer supervision ended unexpectedly".to_string());
                    }
                }
                ev = next_event(&mut events) => match ev {
                    Some(OutputEvent::Line(line)) => {
                        self.answer_prompt(handle, &mut responder, &line).await;
                        if self.is_error_line(&line) {
                            break Err(format!("renderer reported an error: {line}"));
                        }
                        if probe.matches_line(&line, port) {
                            break Ok(());
                        }
                    }
                    Some(OutputEvent::Prompt(text)) => {
                        self.answer_prompt(handle, &mut responder, &text).await;
                    }
                    None => events = None,
                },
                _ = ticker.tick(), if poll_every.is_some() => {
                    if probe.poll_once(&self.http, port).await {
                        break Ok(());
                    }
                }
                _ = tokio::time::sleep_until(fixed_at.unwrap_or(deadline)), if fixed_at.is_some() => {
                    break Ok(());
                }
                _ = tokio::time::sleep_until(deadline) => {
                    break Err(format!(
                        "renderer did not become ready within {}ms",
                        self.cfg.startup_timeout.as_millis()
                    ));
                }
            }
        };

        match outcome {
            Ok(()) => {
                handle
                    .logs
                    .lock()
                    .await
                    .push_line(format!("[slidehost] renderer ready on port {port}"));
                tracing::info!(
                    port,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "renderer ready"
                );
                Ok(())
            }
            Err(reason) => {
                let tail = handle.logs.lock().await.last_lines(FAILURE_TAIL_LINES);
                tracing::warn!(port, %reason, "renderer startup failed");
                let message = if tail.is_empty() {
                    reason
                } else {
                    format!("{reason}; recent output:\n{}", tail.join("\n"))
                };
                Err(AgentError::startup(message))
            }
        }
    }

    /// SIGTERM to the process group, then SIGKILL after the grace window.
    pub async fn terminate(&self, handle: &mut ProcessHandle) -> Option<ProcessExit> {
        if let Some(exit) = handle.exit_status() {
            return Some(exit);
        }

        handle.stdin = None;
        if signal_group(handle.pgid, GroupSignal::Term) {
            if let Some(exit) = handle.wait_exit(self.cfg.termination_grace).await {
                // Helpers spawned by the renderer share its process group.
                signal_group(handle.pgid, GroupSignal::Kill);
                return Some(exit);
            }
            tracing::warn!(
                pid = ?handle.pid,
                grace_ms = self.cfg.termination_grace.as_millis() as u64,
                "renderer ignored SIGTERM; killing"
            );
        }
        self.kill_now(handle).await
    }

    pub async fn kill_now(&self, handle: &mut ProcessHandle) -> Option<ProcessExit> {
        handle.stdin = None;
        signal_group(handle.pgid, GroupSignal::Kill);
        if let Some(tx) = handle.kill_tx.take() {
            let _ = tx.send(());
        }
        let exit = handle.wait_exit(REAP_WINDOW).await;
        if exit.is_none() {
            tracing::error!(pid = ?handle.pid, "renderer still running after SIGKILL");
        }
        exit
    }

    pub async fn check_health(&self, handle: &ProcessHandle) -> bool {
        !handle.has_exited() && self.probe_port(handle.port).await
    }

    /// The part of the health check that goes beyond "process is alive".
    pub async fn probe_port(&self, port: u16) -> bool {
        match self.cfg.health_check {
            HealthCheck::ProcessAlive => true,
            HealthCheck::TcpConnect => crate::readiness::tcp_open(port).await,
        }
    }

    fn is_error_line(&self, line: &str) -> bool {
        let lower = line.to_ascii_lowercase();
        self.cfg
            .error_patterns
            .iter()
            .any(|p| !p.is_empty() && lower.contains(&p.to_ascii_lowercase()))
    }

    async fn answer_prompt(
        &self,
        handle: &mut ProcessHandle,
        responder: &mut PromptResponder,
        text: &str,
    ) {
        let Some(response) = responder.respond(&self.cfg.interaction, text) else {
            return;
        };
        let Some(stdin) = handle.stdin.as_mut() else {
            return;
        };
        let written = async {
            stdin.write_all(response.as_bytes()).await?;
            stdin.flush().await
        }
        .await;
        match written {
            Ok(()) => {
                tracing::debug!(prompt = %text, "answered renderer prompt");
                handle
                    .logs
                    .lock()
                    .await
                    .push_line(format!("[slidehost] answered prompt: {text}"));
            }
            Err(e) => tracing::warn!(prompt = %text, error = %e, "failed to answer renderer prompt"),
        }
    }
}

async fn next_event(
    events: &mut Option<mpsc::UnboundedReceiver<OutputEvent>>,
) -> Option<OutputEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn pump_output<R>(
    mut reader: R,
    stream: &'static str,
    logs: SharedLogs,
    events: mpsc::UnboundedSender<OutputEvent>,
) where
    R: AsyncRead + Unpin,
{
    let mut splitter = LineSplitter::default();
    let mut chunk = [0u8; 4096];
    let mut last_prompt: Option<String> = None;

    loop {
        let n = match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        for line in splitter.push(&chunk[..n]) {
            logs.lock().await.push_line(format!("[{stream}] {line}"));
            // The receiver goes away once startup is over.
            let _ = events.send(OutputEvent::Line(line));
        }
        let pending = splitter.pending();
        if let Some(text) = &pending
            && pending != last_prompt
        {
            let _ = events.send(OutputEvent::Prompt(text.clone()));
        }
        last_prompt = pending;
    }

    if let Some(line) = splitter.finish() {
        logs.lock().await.push_line(format!("[{stream}] {line}"));
        let _ = events.send(OutputEvent::Line(line));
    }
}

#[derive(Clone, Copy, Debug)]
enum GroupSignal {
    Term,
    Kill,
}

#[cfg(unix)]
fn signal_group(pgid: Option<i32>, sig: GroupSignal) -> bool {
    let Some(pgid) = pgid.filter(|p| *p > 0) else {
        return false;
    };
    let sig = match sig {
        GroupSignal::Term => libc::SIGTERM,
        GroupSignal::Kill => libc::SIGKILL,
    };
    unsafe { libc::kill(-pgid, sig) == 0 }
}

#[cfg(not(unix))]
fn signal_group(_pgid: Option<i32>, _sig: GroupSignal) -> bool {
    false
}

#[cfg(unix)]
fn exit_signal(status: &std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &std::process::ExitStatus) -> Option<i32> {
    None
}

#[cfg(target_os = "linux")]
unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    // If slidehost dies, the renderer goes with it.
    let rc = unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) };
    if rc == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(all(unix, not(target_os = "linux")))]
unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    Ok(())
}
