use std::{
    path::{Path, PathBuf},
    process::Stdio,
    sync::Arc,
    time::Duration,
};

use chrono::{DateTime, Utc};
use mcphost_process::{LogEntry, LogStream, ResourceUsage, ServerId, ServerState, ServerStatus};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::Command,
    sync::Mutex,
    time::Instant,
};

use crate::{
    logs::{CONSOLE_LOG_NAME, LogBuffer, LogSink, spawn_file_writer},
    proc_stats::{self, RawSample},
    sandbox,
    server_config::ServerConfig,
    settings::HostSettings,
};

const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);
const REAP_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    pub max_log_entries: usize,
    pub stop_timeout: Duration,
    pub health_probe_timeout: Duration,
    pub start_settle: Duration,
    pub resource_sample_interval: Duration,
    pub log_file_max_bytes: u64,
    pub log_file_max_files: usize,
}

impl From<&HostSettings> for SupervisorOptions {
    fn from(s: &HostSettings) -> Self {
        Self {
            max_log_entries: s.max_log_entries,
            stop_timeout: s.stop_timeout,
            health_probe_timeout: s.health_probe_timeout,
            start_settle: s.start_settle,
            resource_sample_interval: s.resource_sample_interval,
            log_file_max_bytes: s.log_file_max_bytes,
            log_file_max_files: s.log_file_max_files,
        }
    }
}

#[derive(Default)]
struct Runtime {
    state: ServerState,
    pid: Option<u32>,
    pgid: Option<i32>,
    // Bumped on every spawn so a stale waiter never clobbers a newer process.
    generation: u64,
    stopping: bool,
    // Unexpected exit or a failed restart attempt: the health loop owns recovery.
    crashed: bool,
    exhausted: bool,
    retired: bool,
    start_time: Option<DateTime<Utc>>,
    restart_count: u32,
    last_restart: Option<DateTime<Utc>>,
    health_check_failures: u32,
    last_health_check: Option<Instant>,
    exit_code: Option<i32>,
    message: Option<String>,
    usage: Option<ResourceUsage>,
    sink: Option<LogSink>,
}

fn describe_exit(status: &std::process::ExitStatus) -> String {
    if let Some(code) = status.code() {
        return format!("exit code {code}");
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(sig) = status.signal() {
            return format!("signal {sig}");
        }
    }
    "unknown exit status".to_string()
}

#[cfg(target_os = "linux")]
unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    // If the host dies, the child is terminated with it.
    let rc = unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) };
    if rc == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    Ok(())
}

fn signal_group(pgid: i32, sig: i32) {
    #[cfg(unix)]
    unsafe {
        libc::kill(-pgid, sig);
    }
    #[cfg(not(unix))]
    {
        let _ = (pgid, sig);
    }
}

#[cfg(unix)]
const SIGTERM: i32 = libc::SIGTERM;
#[cfg(unix)]
const SIGKILL: i32 = libc::SIGKILL;
#[cfg(not(unix))]
const SIGTERM: i32 = 15;
#[cfg(not(unix))]
const SIGKILL: i32 = 9;

fn usage_from(raw: &RawSample, cpu_percent: f64) -> ResourceUsage {
    let memory_percent = proc_stats::total_memory_bytes()
        .filter(|t| *t > 0)
        .map(|t| raw.rss_bytes as f64 / t as f64 * 100.0)
        .unwrap_or(0.0);
    ResourceUsage {
        cpu_percent,
        memory_mb: raw.rss_bytes as f64 / (1024.0 * 1024.0),
        memory_percent,
        thread_count: raw.threads,
        open_files: raw.open_files,
        connections: raw.sockets,
    }
}

// A start cancelled mid-settle drops the child (kill_on_drop) before any
// waiter exists; forget its pid so a later stop does not wait on a ghost.
struct PendingStart {
    runtime: Arc<Mutex<Runtime>>,
    generation: u64,
}

fn abandon_start(rt: &mut Runtime, generation: u64) {
    if rt.generation == generation && rt.state == ServerState::Starting {
        rt.state = ServerState::Stopped;
        rt.pid = None;
        rt.pgid = None;
        rt.start_time = None;
        rt.usage = None;
        rt.message = Some("start cancelled".to_string());
    }
}

impl Drop for PendingStart {
    fn drop(&mut self) {
        let generation = self.generation;
        if let Ok(mut rt) = self.runtime.try_lock() {
            abandon_start(&mut rt, generation);
            return;
        }
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let runtime = self.runtime.clone();
            handle.spawn(async move {
                abandon_start(&mut *runtime.lock().await, generation);
            });
        }
    }
}

pub struct ProcessSupervisor {
    config: ServerConfig,
    server_dir: PathBuf,
    opts: SupervisorOptions,
    runtime: Arc<Mutex<Runtime>>,
    logs: Arc<Mutex<LogBuffer>>,
    // Serializes start/stop/restart/reset/retire; status reads never wait on it.
    op_lock: Mutex<()>,
    http: reqwest::Client,
}

impl ProcessSupervisor {
    pub fn new(config: ServerConfig, server_dir: PathBuf, opts: SupervisorOptions) -> Self {
        let logs = Arc::new(Mutex::new(LogBuffer::new(opts.max_log_entries)));
        Self {
            config,
            server_dir,
            opts,
            runtime: Arc::new(Mutex::new(Runtime::default())),
            logs,
            op_lock: Mutex::new(()),
            http: reqwest::Client::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn server_dir(&self) -> &Path {
        &self.server_dir
    }

    pub fn log_dir(&self) -> PathBuf {
        self.server_dir.join("logs")
    }

    pub fn console_log_path(&self) -> PathBuf {
        self.log_dir().join(CONSOLE_LOG_NAME)
    }

    pub async fn state(&self) -> ServerState {
        self.runtime.lock().await.state
    }

    pub async fn restart_count(&self) -> u32 {
        self.runtime.lock().await.restart_count
    }

    pub async fn is_exhausted(&self) -> bool {
        self.runtime.lock().await.exhausted
    }

    pub async fn is_retired(&self) -> bool {
        self.runtime.lock().await.retired
    }

    pub async fn is_monitored(&self) -> bool {
        let rt = self.runtime.lock().await;
        !rt.exhausted && !rt.retired && (rt.state == ServerState::Running || rt.crashed)
    }

    pub async fn health_due(&self, now: Instant) -> bool {
        let interval = Duration::from_secs(self.config.health_check_interval_seconds);
        match self.runtime.lock().await.last_health_check {
            Some(at) => now.saturating_duration_since(at) >= interval,
            None => true,
        }
    }

    async fn current_sink(&self) -> LogSink {
        self.runtime
            .lock()
            .await
            .sink
            .clone()
            .unwrap_or_else(|| LogSink::new(self.logs.clone(), None))
    }

    // Ok(false): spawn failed, the process died inside the settle window,
    // or the server is exhausted or retired.
    pub async fn start(&self) -> anyhow::Result<bool> {
        let _op = self.op_lock.lock().await;
        self.start_locked().await
    }

    async fn start_locked(&self) -> anyhow::Result<bool> {
        {
            let rt = self.runtime.lock().await;
            if rt.state.is_live() && rt.pid.is_some() {
                return Ok(true);
            }
            if rt.exhausted || rt.retired {
                return Ok(false);
            }
        }

        let launch = sandbox::prepare_launch(&self.config)?;
        let file_tx = spawn_file_writer(
            self.console_log_path(),
            self.opts.log_file_max_bytes,
            self.opts.log_file_max_files,
        );
        let sink = LogSink::new(self.logs.clone(), Some(file_tx));
        for w in launch.warnings() {
            sink.note(format!("warning: {w}")).await;
        }

        let mut cmd = Command::new(&launch.exec);
        cmd.args(&launch.args)
            .current_dir(&launch.cwd)
            .envs(&self.config.environment)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(unix)]
        {
            let child_launch = launch.clone();
            unsafe {
                cmd.pre_exec(move || {
                    // New session so the whole process tree can be signalled.
                    if libc::setsid() == -1 {
                        return Err(std::io::Error::last_os_error());
                    }
                    child_launch.apply_pre_exec()?;
                    // setuid clears the parent-death signal, so it is armed last.
                    set_parent_death_signal()
                });
            }
        }

        sink.note(format!(
            "exec: {} {} (cwd {}) [{}]",
            launch.exec,
            launch.args.join(" "),
            launch.cwd.display(),
            launch.summary()
        ))
        .await;

        let mut child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => {
                let msg = format!("spawn failed: {e}");
                sink.note(&msg).await;
                tracing::warn!(server_id = %self.config.id, error = %e, "spawn failed");
                let mut rt = self.runtime.lock().await;
                rt.state = ServerState::Error;
                rt.message = Some(msg);
                rt.sink = Some(sink);
                return Ok(false);
            }
        };

        let pid = child.id();
        let generation = {
            let mut rt = self.runtime.lock().await;
            rt.generation = rt.generation.wrapping_add(1);
            rt.state = ServerState::Starting;
            rt.pid = pid;
            rt.pgid = pid.map(|p| p as i32);
            rt.stopping = false;
            rt.crashed = false;
            rt.exit_code = None;
            rt.start_time = Some(Utc::now());
            rt.usage = None;
            rt.message = Some("starting".to_string());
            rt.sink = Some(sink.clone());
            rt.generation
        };
        let _pending = PendingStart {
            runtime: self.runtime.clone(),
            generation,
        };

        // Readers start right away so output from an early crash is kept.
        if let Some(out) = child.stdout.take() {
            let sink = sink.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(out).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    sink.emit(LogStream::Stdout, line).await;
                }
            });
        }
        if let Some(err) = child.stderr.take() {
            let sink = sink.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(err).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    sink.emit(LogStream::Stderr, line).await;
                }
            });
        }
        if let Some(pid) = pid {
            self.spawn_resource_sampler(pid, generation);
        }

        match tokio::time::timeout(self.opts.start_settle, child.wait()).await {
            Ok(res) => {
                let (exit_code, detail) = match &res {
                    Ok(status) => (status.code(), describe_exit(status)),
                    Err(e) => (None, format!("wait failed: {e}")),
                };
                let msg = format!("exited during startup ({detail})");
                sink.note(&msg).await;
                tracing::warn!(server_id = %self.config.id, ?pid, %detail, "process exited during startup");

                let mut rt = self.runtime.lock().await;
                rt.state = ServerState::Failed;
                rt.pid = None;
                rt.pgid = None;
                rt.start_time = None;
                rt.usage = None;
                rt.exit_code = exit_code;
                rt.message = Some(msg);
                Ok(false)
            }
            Err(_) => {
                {
                    let mut rt = self.runtime.lock().await;
                    rt.state = ServerState::Running;
                    rt.message = Some("running".to_string());
                }
                tracing::info!(server_id = %self.config.id, ?pid, status = "running", "server started");
                self.spawn_waiter(child, generation, sink);
                Ok(true)
            }
        }
    }

    fn spawn_waiter(&self, mut child: tokio::process::Child, generation: u64, sink: LogSink) {
        let runtime = self.runtime.clone();
        let server_id = self.config.id.clone();
        tokio::spawn(async move {
            let res = child.wait().await;
            let (exit_code, detail) = match &res {
                Ok(status) => (status.code(), describe_exit(status)),
                Err(e) => (None, format!("wait failed: {e}")),
            };

            let mut rt = runtime.lock().await;
            if rt.generation != generation {
                return;
            }
            rt.pid = None;
            rt.pgid = None;
            rt.exit_code = exit_code;
            rt.usage = None;
            if rt.stopping {
                rt.state = ServerState::Stopped;
                rt.message = Some(format!("stopped ({detail})"));
                drop(rt);
                sink.note(format!("process exited ({detail})")).await;
            } else {
                rt.state = ServerState::Failed;
                rt.crashed = true;
                rt.message = Some(format!("exited unexpectedly ({detail})"));
                drop(rt);
                sink.note(format!("process exited unexpectedly ({detail})")).await;
                tracing::warn!(%server_id, %detail, "server exited unexpectedly");
            }
        });
    }

    fn spawn_resource_sampler(&self, pid: u32, generation: u64) {
        let runtime = self.runtime.clone();
        let interval = self.opts.resource_sample_interval;
        tokio::spawn(async move {
            let mut last: Option<(u64, Instant)> = None;
            loop {
                let now = Instant::now();
                let Some(raw) = proc_stats::read_sample(pid).await else {
                    break;
                };
                let cpu_percent = last
                    .map(|(ticks, at)| {
                        let elapsed = now.saturating_duration_since(at).as_secs_f64();
                        proc_stats::cpu_percent(raw.cpu_ticks.saturating_sub(ticks), elapsed)
                    })
                    .unwrap_or(0.0);
                last = Some((raw.cpu_ticks, now));

                {
                    let mut rt = runtime.lock().await;
                    if rt.generation != generation || rt.pid != Some(pid) {
                        break;
                    }
                    rt.usage = Some(usage_from(&raw, cpu_percent));
                }

                tokio::time::sleep(interval).await;
            }
        });
    }

    pub async fn stop(&self, timeout: Duration) -> anyhow::Result<()> {
        let _op = self.op_lock.lock().await;
        self.stop_locked(timeout).await
    }

    async fn stop_locked(&self, timeout: Duration) -> anyhow::Result<()> {
        let (pgid, generation) = {
            let mut rt = self.runtime.lock().await;
            if rt.pid.is_none() {
                rt.crashed = false;
                if !rt.exhausted {
                    rt.state = ServerState::Stopped;
                    rt.start_time = None;
                }
                return Ok(());
            }
            rt.stopping = true;
            rt.message = Some("stopping".to_string());
            (rt.pgid, rt.generation)
        };

        let sink = self.current_sink().await;
        sink.note(format!("stop requested (timeout_ms={})", timeout.as_millis()))
            .await;
        if let Some(pgid) = pgid {
            signal_group(pgid, SIGTERM);
        }

        let exited = |rt: &Runtime| rt.generation != generation || rt.pid.is_none();

        let kill_deadline = Instant::now() + timeout;
        let mut killed = false;
        loop {
            if exited(&*self.runtime.lock().await) {
                break;
            }
            let now = Instant::now();
            if !killed && now >= kill_deadline {
                if let Some(pgid) = pgid {
                    signal_group(pgid, SIGKILL);
                }
                killed = true;
                sink.note("stop: sent SIGKILL (timeout)").await;
            }
            if killed && now >= kill_deadline + REAP_GRACE {
                tracing::warn!(server_id = %self.config.id, "process not reaped after SIGKILL");
                break;
            }
            tokio::time::sleep(STOP_POLL_INTERVAL).await;
        }

        let mut rt = self.runtime.lock().await;
        rt.stopping = false;
        rt.crashed = false;
        rt.pid = None;
        rt.pgid = None;
        rt.start_time = None;
        rt.usage = None;
        rt.state = if rt.exhausted {
            ServerState::Failed
        } else {
            ServerState::Stopped
        };
        rt.message = Some(if killed {
            "killed after timeout".to_string()
        } else {
            "stopped".to_string()
        });
        tracing::info!(server_id = %self.config.id, killed, status = rt.state.as_str(), "server stopped");
        Ok(())
    }

    // At the ceiling this stops anything still running and leaves the server
    // permanently `failed`; only `reset` brings it back.
    pub async fn restart(&self) -> anyhow::Result<bool> {
        let _op = self.op_lock.lock().await;

        let (retired, at_ceiling) = {
            let rt = self.runtime.lock().await;
            (
                rt.retired,
                rt.exhausted || rt.restart_count >= self.config.max_restarts,
            )
        };
        if retired {
            return Ok(false);
        }
        if at_ceiling {
            self.stop_locked(self.opts.stop_timeout).await?;
            let mut rt = self.runtime.lock().await;
            rt.exhausted = true;
            rt.state = ServerState::Failed;
            rt.message = Some(format!(
                "restart limit reached ({}/{})",
                rt.restart_count, self.config.max_restarts
            ));
            drop(rt);
            self.current_sink()
                .await
                .note("restart limit reached; server is now permanently failed")
                .await;
            tracing::warn!(
                server_id = %self.config.id,
                max_restarts = self.config.max_restarts,
                "restart limit reached"
            );
            return Ok(false);
        }

        self.stop_locked(self.opts.stop_timeout).await?;
        tokio::time::sleep(Duration::from_secs(self.config.restart_delay_seconds)).await;
        let attempt = {
            let mut rt = self.runtime.lock().await;
            rt.restart_count = rt.restart_count.saturating_add(1);
            rt.last_restart = Some(Utc::now());
            rt.restart_count
        };
        self.current_sink()
            .await
            .note(format!(
                "restart attempt {attempt}/{}",
                self.config.max_restarts
            ))
            .await;

        let started = self.start_locked().await;
        if !matches!(started, Ok(true)) {
            // A restart that did not come up stays with the health loop
            // until it succeeds or the ceiling is hit.
            let mut rt = self.runtime.lock().await;
            if !rt.retired {
                rt.crashed = true;
            }
        }
        started
    }

    pub async fn reset(&self) -> anyhow::Result<()> {
        let _op = self.op_lock.lock().await;
        {
            let mut rt = self.runtime.lock().await;
            rt.exhausted = false;
            rt.restart_count = 0;
            rt.last_restart = None;
            rt.health_check_failures = 0;
            rt.last_health_check = None;
            rt.exit_code = None;
        }
        self.stop_locked(self.opts.stop_timeout).await?;
        self.current_sink().await.note("reset by operator").await;
        Ok(())
    }

    // Final stop before the server is removed. Waits for any in-flight
    // lifecycle operation; afterwards nothing can start the process again.
    // Ok(false) when the server is live and `force` is not set.
    pub async fn retire(&self, force: bool, timeout: Duration) -> anyhow::Result<bool> {
        let _op = self.op_lock.lock().await;
        {
            let mut rt = self.runtime.lock().await;
            if rt.state.is_live() && !force {
                return Ok(false);
            }
            rt.retired = true;
        }
        self.stop_locked(timeout).await?;
        Ok(true)
    }

    // Liveness, then the optional HTTP probe, then resource limits. Fails closed.
    pub async fn health_check(&self) -> bool {
        let healthy = match self.probe().await {
            Ok(()) => true,
            Err(reason) => {
                self.current_sink()
                    .await
                    .note(format!("health check failed: {reason}"))
                    .await;
                false
            }
        };

        let mut rt = self.runtime.lock().await;
        rt.last_health_check = Some(Instant::now());
        if healthy {
            rt.health_check_failures = 0;
        } else {
            rt.health_check_failures = rt.health_check_failures.saturating_add(1);
        }
        healthy
    }

    async fn probe(&self) -> Result<(), String> {
        let pid = {
            let rt = self.runtime.lock().await;
            match (rt.state, rt.pid) {
                (ServerState::Running, Some(pid)) => pid,
                (state, _) => return Err(format!("process not running (status {})", state.as_str())),
            }
        };
        if !proc_stats::pid_alive(pid) {
            return Err(format!("pid {pid} is gone"));
        }

        if let Some(url) = &self.config.health_check_url {
            let resp = self
                .http
                .get(url)
                .timeout(self.opts.health_probe_timeout)
                .send()
                .await
                .map_err(|e| format!("GET {url}: {e}"))?;
            if !resp.status().is_success() {
                return Err(format!("GET {url}: HTTP {}", resp.status()));
            }
        }

        // CPU comes from the sampler's fixed window; a missing snapshot only
        // means no full window has elapsed yet.
        let snapshot = self.runtime.lock().await.usage.clone();
        let usage = match snapshot {
            Some(u) => u,
            None => {
                let raw = proc_stats::read_sample(pid)
                    .await
                    .ok_or_else(|| format!("pid {pid} vanished while sampling"))?;
                usage_from(&raw, 0.0)
            }
        };
        let limits = &self.config.resource_limits;
        if usage.memory_mb > limits.memory_mb as f64 {
            return Err(format!(
                "memory {:.1}MiB over limit {}MiB",
                usage.memory_mb, limits.memory_mb
            ));
        }
        if usage.cpu_percent > f64::from(limits.cpu_percent) {
            return Err(format!(
                "cpu {:.1}% over limit {}%",
                usage.cpu_percent, limits.cpu_percent
            ));
        }
        Ok(())
    }

    pub async fn recent_logs(&self, limit: usize) -> Vec<LogEntry> {
        self.logs.lock().await.tail(limit)
    }

    pub async fn get_status(&self, log_lines: usize) -> ServerStatus {
        let logs = self.recent_logs(log_lines).await;

        let rt = self.runtime.lock().await;
        let uptime_seconds = rt
            .start_time
            .filter(|_| rt.pid.is_some())
            .map(|t| (Utc::now() - t).num_seconds().max(0) as u64);
        let resource_usage = rt
            .usage
            .clone()
            .filter(|_| rt.pid.is_some() && rt.state.is_live());
        ServerStatus {
            server_id: ServerId(self.config.id.clone()),
            name: self.config.name.clone(),
            description: self.config.description.clone(),
            status: rt.state,
            pid: rt.pid,
            start_time: rt.start_time,
            uptime_seconds,
            restart_count: rt.restart_count,
            max_restarts: self.config.max_restarts,
            last_restart: rt.last_restart,
            health_check_failures: rt.health_check_failures,
            exit_code: rt.exit_code,
            message: rt.message.clone(),
            detected_language: self.config.detected_language.clone(),
            resource_usage,
            logs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server_config::ResourceLimits;
    use std::collections::BTreeMap;

    fn opts() -> SupervisorOptions {
        SupervisorOptions {
            max_log_entries: 100,
            stop_timeout: Duration::from_secs(5),
            health_probe_timeout: Duration::from_secs(1),
            start_settle: Duration::from_millis(300),
            resource_sample_interval: Duration::from_millis(500),
            log_file_max_bytes: 1024 * 1024,
            log_file_max_files: 2,
        }
    }

    fn config(dir: &Path, command: &[&str], max_restarts: u32) -> ServerConfig {
        ServerConfig {
            id: "test-server".to_string(),
            name: "test".to_string(),
            description: String::new(),
            command: command.iter().map(|s| s.to_string()).collect(),
            working_dir: dir.to_path_buf(),
            environment: BTreeMap::new(),
            auto_restart: true,
            max_restarts,
            restart_delay_seconds: 1,
            health_check_url: None,
            health_check_interval_seconds: 10,
            resource_limits: ResourceLimits {
                memory_mb: 4096,
                cpu_percent: 100,
                cpu_seconds: 3600,
                max_processes: 64,
            },
            sandboxed: false,
            user: "nobody".to_string(),
            detected_language: "unknown".to_string(),
            uploaded_by: "tester".to_string(),
            upload_time: Utc::now(),
        }
    }

    fn supervisor(dir: &Path, command: &[&str], max_restarts: u32) -> ProcessSupervisor {
        ProcessSupervisor::new(
            config(dir, command, max_restarts),
            dir.to_path_buf(),
            opts(),
        )
    }

    #[tokio::test]
    async fn start_and_stop_are_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(dir.path(), &["sleep", "30"], 3);

        assert!(sup.start().await.unwrap());
        let first = sup.get_status(0).await.pid;
        assert!(first.is_some());
        assert!(sup.start().await.unwrap());
        assert_eq!(sup.get_status(0).await.pid, first);
        assert_eq!(sup.state().await, ServerState::Running);

        sup.stop(Duration::from_secs(5)).await.unwrap();
        let st = sup.get_status(0).await;
        assert_eq!(st.status, ServerState::Stopped);
        assert!(st.pid.is_none());
        assert!(st.resource_usage.is_none());

        sup.stop(Duration::from_secs(5)).await.unwrap();
        assert_eq!(sup.state().await, ServerState::Stopped);
    }

    #[tokio::test]
    async fn immediate_exit_marks_failed_without_restarting() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(dir.path(), &["false"], 3);

        assert!(!sup.start().await.unwrap());
        let st = sup.get_status(10).await;
        assert_eq!(st.status, ServerState::Failed);
        assert_eq!(st.exit_code, Some(1));
        assert_eq!(st.restart_count, 0);
        assert!(!sup.is_monitored().await);
    }

    #[tokio::test]
    async fn missing_binary_is_an_error_state() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(dir.path(), &["/nonexistent/mcp-server"], 3);
        assert!(!sup.start().await.unwrap());
        assert_eq!(sup.state().await, ServerState::Error);
    }

    #[tokio::test]
    async fn restart_stops_at_the_ceiling_until_reset() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(dir.path(), &["sleep", "30"], 1);

        assert!(sup.start().await.unwrap());
        assert!(sup.restart().await.unwrap());
        assert_eq!(sup.restart_count().await, 1);
        assert_eq!(sup.state().await, ServerState::Running);

        assert!(!sup.restart().await.unwrap());
        let st = sup.get_status(0).await;
        assert_eq!(st.status, ServerState::Failed);
        assert!(st.pid.is_none());
        assert_eq!(st.restart_count, 1);
        assert!(sup.is_exhausted().await);

        assert!(!sup.start().await.unwrap());
        sup.stop(Duration::from_secs(1)).await.unwrap();
        assert_eq!(sup.state().await, ServerState::Failed);

        sup.reset().await.unwrap();
        assert_eq!(sup.state().await, ServerState::Stopped);
        assert_eq!(sup.restart_count().await, 0);
        assert!(!sup.is_exhausted().await);
    }

    #[tokio::test]
    async fn output_is_captured_into_the_ring_buffer() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(
            dir.path(),
            &["sh", "-c", "echo hello; echo oops >&2; sleep 30"],
            3,
        );
        assert!(sup.start().await.unwrap());

        let mut found = false;
        for _ in 0..20 {
            let logs = sup.recent_logs(50).await;
            let out = logs
                .iter()
                .any(|e| e.stream == LogStream::Stdout && e.message == "hello");
            let err = logs
                .iter()
                .any(|e| e.stream == LogStream::Stderr && e.message == "oops");
            if out && err {
                found = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(found);
        sup.stop(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn unexpected_exit_is_flagged_as_crash() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(dir.path(), &["sh", "-c", "sleep 0.6; exit 3"], 3);
        assert!(sup.start().await.unwrap());

        tokio::time::sleep(Duration::from_millis(1200)).await;
        let st = sup.get_status(0).await;
        assert_eq!(st.status, ServerState::Failed);
        assert_eq!(st.exit_code, Some(3));
        assert!(sup.is_monitored().await);
        assert!(!sup.health_check().await);
        assert_eq!(sup.get_status(0).await.health_check_failures, 1);
    }

    #[tokio::test]
    async fn stop_escalates_to_sigkill() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(
            dir.path(),
            &["sh", "-c", "trap '' TERM; while true; do sleep 0.1; done"],
            3,
        );
        assert!(sup.start().await.unwrap());

        let began = Instant::now();
        sup.stop(Duration::from_millis(500)).await.unwrap();
        assert!(began.elapsed() >= Duration::from_millis(500));
        let st = sup.get_status(10).await;
        assert_eq!(st.status, ServerState::Stopped);
        assert_eq!(st.message.as_deref(), Some("killed after timeout"));
    }

    #[tokio::test]
    async fn running_process_without_probe_url_is_healthy() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(dir.path(), &["sleep", "30"], 3);
        assert!(sup.start().await.unwrap());
        assert!(sup.is_monitored().await);
        assert!(sup.health_check().await);

        let st = sup.get_status(0).await;
        assert_eq!(st.health_check_failures, 0);
        assert!(st.resource_usage.is_some());
        assert!(!sup.health_due(Instant::now()).await);
        sup.stop(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn restart_that_dies_during_startup_stays_monitored() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(
            dir.path(),
            &["sh", "-c", "if [ -f marker ]; then exit 1; fi; touch marker; sleep 30"],
            2,
        );
        assert!(sup.start().await.unwrap());

        assert!(!sup.restart().await.unwrap());
        assert_eq!(sup.state().await, ServerState::Failed);
        assert_eq!(sup.restart_count().await, 1);
        assert!(sup.is_monitored().await);
        assert!(!sup.health_check().await);

        assert!(!sup.restart().await.unwrap());
        assert_eq!(sup.restart_count().await, 2);
        assert!(sup.is_monitored().await);

        assert!(!sup.restart().await.unwrap());
        assert!(sup.is_exhausted().await);
        assert!(!sup.is_monitored().await);
        assert_eq!(sup.restart_count().await, 2);
    }

    #[tokio::test]
    async fn status_reads_do_not_skew_cpu_readings() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path(), &["sh", "-c", "while :; do :; done"], 3);
        cfg.resource_limits.cpu_percent = 150;
        let sup = ProcessSupervisor::new(cfg, dir.path().to_path_buf(), opts());
        assert!(sup.start().await.unwrap());

        let mut max_cpu = 0.0f64;
        for _ in 0..200 {
            if let Some(u) = sup.get_status(0).await.resource_usage {
                max_cpu = max_cpu.max(u.cpu_percent);
            }
        }
        tokio::time::sleep(Duration::from_millis(1200)).await;
        for _ in 0..50 {
            if let Some(u) = sup.get_status(0).await.resource_usage {
                max_cpu = max_cpu.max(u.cpu_percent);
            }
        }
        assert!(max_cpu <= 150.0, "cpu reading spiked to {max_cpu}");
        assert!(sup.health_check().await);
        sup.stop(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn busy_process_over_cpu_limit_is_unhealthy() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path(), &["sh", "-c", "while :; do :; done"], 3);
        cfg.resource_limits.cpu_percent = 5;
        let sup = ProcessSupervisor::new(cfg, dir.path().to_path_buf(), opts());
        assert!(sup.start().await.unwrap());

        tokio::time::sleep(Duration::from_millis(1500)).await;
        let cpu = sup.get_status(0).await.resource_usage.unwrap().cpu_percent;
        assert!(cpu > 5.0, "busy loop sampled at {cpu}%");
        assert!(!sup.health_check().await);
        sup.stop(Duration::from_secs(5)).await.unwrap();
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn sandboxed_child_runs_under_rlimits() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(
            dir.path(),
            &[
                "sh",
                "-c",
                "ulimit -v; ulimit -t; sed -n 's/^NoNewPrivs:[[:space:]]*//p' /proc/self/status; sleep 5",
            ],
            3,
        );
        cfg.sandboxed = true;
        // No privilege drop either way, so only the limits differ from the host.
        cfg.user = "root".to_string();
        cfg.resource_limits.memory_mb = 256;
        cfg.resource_limits.cpu_seconds = 120;
        cfg.resource_limits.max_processes = 4096;
        let sup = ProcessSupervisor::new(cfg, dir.path().to_path_buf(), opts());
        assert!(sup.start().await.unwrap());

        let mut stdout = Vec::new();
        for _ in 0..40 {
            stdout = sup
                .recent_logs(50)
                .await
                .into_iter()
                .filter(|e| e.stream == LogStream::Stdout)
                .map(|e| e.message)
                .collect();
            if stdout.len() >= 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(stdout, vec!["262144", "120", "1"]);
        sup.stop(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn retire_waits_for_restart_and_blocks_later_starts() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path(), &["sleep", "30"], 3);
        cfg.restart_delay_seconds = 2;
        let sup = Arc::new(ProcessSupervisor::new(cfg, dir.path().to_path_buf(), opts()));
        assert!(sup.start().await.unwrap());

        let restarting = {
            let sup = sup.clone();
            tokio::spawn(async move { sup.restart().await })
        };
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(sup.state().await, ServerState::Stopped);

        assert!(!sup.retire(false, Duration::from_secs(5)).await.unwrap());
        assert!(restarting.await.unwrap().unwrap());
        assert_eq!(sup.state().await, ServerState::Running);

        assert!(sup.retire(true, Duration::from_secs(5)).await.unwrap());
        assert_eq!(sup.state().await, ServerState::Stopped);
        assert!(sup.is_retired().await);
        assert!(!sup.is_monitored().await);
        assert!(!sup.start().await.unwrap());
        assert!(!sup.restart().await.unwrap());
        assert!(sup.get_status(0).await.pid.is_none());
    }

    #[tokio::test]
    async fn cancelled_start_does_not_stall_stop() {
        let dir = tempfile::tempdir().unwrap();
        let mut o = opts();
        o.start_settle = Duration::from_secs(5);
        let sup = Arc::new(ProcessSupervisor::new(
            config(dir.path(), &["sleep", "30"], 3),
            dir.path().to_path_buf(),
            o,
        ));

        let starting = {
            let sup = sup.clone();
            tokio::spawn(async move { sup.start().await })
        };
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(sup.state().await, ServerState::Starting);
        starting.abort();
        let _ = starting.await;

        let began = Instant::now();
        sup.stop(Duration::from_secs(3)).await.unwrap();
        assert!(began.elapsed() < Duration::from_secs(1));
        let st = sup.get_status(0).await;
        assert_eq!(st.status, ServerState::Stopped);
        assert!(st.pid.is_none());
    }
}
