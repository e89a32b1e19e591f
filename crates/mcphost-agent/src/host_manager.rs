use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::Context;
use mcphost_process::{LogEntry, ServerId, ServerState, ServerStatus};
use serde::Serialize;
use tokio::{io::AsyncWriteExt, sync::Mutex, task::JoinHandle, time::MissedTickBehavior};

use crate::{
    archive::{self, ArchiveKind},
    error::{HostError, format_error_chain},
    events::{self, EventSink, LifecycleEvent},
    logs,
    scanner::{self, ScanOutcome},
    server_config::{self, ServerConfig, UploadConfig},
    settings::HostSettings,
    supervisor::{ProcessSupervisor, SupervisorOptions},
};

pub const SERVER_CONFIG_FILE: &str = "server.json";

#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub name: String,
    pub filename: String,
    pub archive: Vec<u8>,
    pub config: UploadConfig,
    pub uploaded_by: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct UploadReceipt {
    pub server_id: String,
    pub status: &'static str,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub log_files_removed: usize,
    pub uploads_removed: usize,
    pub servers_deleted: Vec<String>,
}

async fn save_config(server_dir: &Path, config: &ServerConfig) -> anyhow::Result<()> {
    tokio::fs::create_dir_all(server_dir)
        .await
        .with_context(|| format!("create {}", server_dir.display()))?;

    let path = server_dir.join(SERVER_CONFIG_FILE);
    let tmp = path.with_extension("json.tmp");
    let data = serde_json::to_vec_pretty(config).context("serialize server config")?;

    let mut f = tokio::fs::File::create(&tmp)
        .await
        .with_context(|| format!("create {}", tmp.display()))?;
    f.write_all(&data).await.context("write server config")?;
    f.flush().await.context("flush server config")?;

    tokio::fs::rename(&tmp, &path)
        .await
        .context("persist server config")?;
    Ok(())
}

async fn load_config(path: &Path) -> anyhow::Result<ServerConfig> {
    let raw = tokio::fs::read(path)
        .await
        .with_context(|| format!("read {}", path.display()))?;
    serde_json::from_slice(&raw).with_context(|| format!("parse {}", path.display()))
}

fn log_failure<T>(op: &str, server_id: &str, res: Result<T, HostError>) -> Result<T, HostError> {
    if let Err(err) = &res {
        match err {
            HostError::Internal(e) => {
                tracing::error!(op, server_id, error = %format_error_chain(e), "operation failed")
            }
            other => tracing::warn!(op, server_id, code = other.code(), error = %other, "operation rejected"),
        }
    }
    res
}

pub struct HostManager {
    settings: HostSettings,
    supervisor_opts: SupervisorOptions,
    servers: Mutex<HashMap<String, Arc<ProcessSupervisor>>>,
    events: Arc<dyn EventSink>,
    loops: Mutex<Vec<JoinHandle<()>>>,
}

impl HostManager {
    pub fn new(settings: HostSettings, events: Arc<dyn EventSink>) -> Self {
        let supervisor_opts = SupervisorOptions::from(&settings);
        Self {
            settings,
            supervisor_opts,
            servers: Mutex::new(HashMap::new()),
            events,
            loops: Mutex::new(Vec::new()),
        }
    }

    pub fn settings(&self) -> &HostSettings {
        &self.settings
    }

    pub async fn init(&self) -> anyhow::Result<()> {
        for dir in [self.settings.servers_root(), self.settings.uploads_root()] {
            tokio::fs::create_dir_all(&dir)
                .await
                .with_context(|| format!("create {}", dir.display()))?;
        }
        Ok(())
    }

    fn server_dir(&self, server_id: &str) -> PathBuf {
        self.settings.servers_root().join(server_id)
    }

    pub async fn server_count(&self) -> usize {
        self.servers.lock().await.len()
    }

    async fn supervisor(&self, server_id: &str) -> Result<Arc<ProcessSupervisor>, HostError> {
        self.servers
            .lock()
            .await
            .get(server_id)
            .cloned()
            .ok_or_else(|| HostError::NotFound(server_id.to_string()))
    }

    async fn snapshot(&self) -> Vec<Arc<ProcessSupervisor>> {
        let mut all: Vec<_> = self.servers.lock().await.values().cloned().collect();
        all.sort_by(|a, b| a.id().cmp(b.id()));
        all
    }

    async fn emit(&self, event: LifecycleEvent) {
        events::emit(self.events.as_ref(), event).await;
    }

    pub async fn load_existing_servers(&self) -> anyhow::Result<usize> {
        let base = self.settings.servers_root();
        let mut rd = match tokio::fs::read_dir(&base).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e).with_context(|| format!("read {}", base.display())),
        };

        let mut loaded = 0;
        while let Some(de) = rd.next_entry().await.context("read servers entry")? {
            if !de.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }
            let dir_name = de.file_name().to_string_lossy().to_string();
            let cfg_path = de.path().join(SERVER_CONFIG_FILE);
            if tokio::fs::metadata(&cfg_path).await.is_err() {
                continue;
            }

            let config = match load_config(&cfg_path).await {
                Ok(c) => c,
                Err(e) => {
                    tracing::warn!(path = %cfg_path.display(), error = %format_error_chain(&e), "skipping unreadable server config");
                    continue;
                }
            };
            if config.id != dir_name {
                tracing::warn!(dir = %dir_name, server_id = %config.id, "server config id does not match its directory; skipping");
                continue;
            }

            let mut servers = self.servers.lock().await;
            if servers.contains_key(&config.id) {
                continue;
            }
            let id = config.id.clone();
            let sup = ProcessSupervisor::new(config, de.path(), self.supervisor_opts.clone());
            servers.insert(id, Arc::new(sup));
            loaded += 1;
        }

        tracing::info!(loaded, root = %base.display(), "rehydrated persisted servers");
        Ok(loaded)
    }

    pub async fn upload(&self, req: UploadRequest) -> Result<UploadReceipt, HostError> {
        let res = self.upload_inner(req).await;
        log_failure("upload", "-", res)
    }

    async fn upload_inner(&self, req: UploadRequest) -> Result<UploadReceipt, HostError> {
        let size = req.archive.len() as u64;
        if size > self.settings.max_upload_bytes {
            return Err(HostError::ArchiveTooLarge {
                size,
                limit: self.settings.max_upload_bytes,
            });
        }
        if self.server_count().await >= self.settings.max_servers {
            return Err(HostError::ServerLimitReached {
                limit: self.settings.max_servers,
            });
        }
        let kind = ArchiveKind::from_filename(&req.filename)
            .ok_or_else(|| HostError::UnsupportedArchive(req.filename.clone()))?;

        let id = ServerId::new().0;
        let server_dir = self.server_dir(&id);
        let config = server_config::normalize(
            &id,
            &req.name,
            &req.config,
            &req.uploaded_by,
            &server_dir,
            &self.settings.allowed_languages,
        )?;

        match self.deploy(&config, kind, &req.archive, &server_dir).await {
            Ok(()) => {}
            Err(err) => {
                if let Err(e) = tokio::fs::remove_dir_all(&server_dir).await
                    && e.kind() != std::io::ErrorKind::NotFound
                {
                    tracing::warn!(server_id = %id, error = %e, "failed to clean up rejected upload");
                }
                return Err(err);
            }
        }

        tracing::info!(
            server_id = %id,
            name = %config.name,
            language = %config.detected_language,
            uploaded_by = %config.uploaded_by,
            "server deployed"
        );
        self.emit(
            LifecycleEvent::new("deployed", &id, &config.name)
                .with("uploaded_by", config.uploaded_by.clone())
                .with("detected_language", config.detected_language.clone()),
        )
        .await;

        Ok(UploadReceipt {
            server_id: id,
            status: "deployed",
        })
    }

    async fn deploy(
        &self,
        config: &ServerConfig,
        kind: ArchiveKind,
        archive: &[u8],
        server_dir: &Path,
    ) -> Result<(), HostError> {
        let uploads = self.settings.uploads_root();
        tokio::fs::create_dir_all(&uploads)
            .await
            .with_context(|| format!("create {}", uploads.display()))?;
        let staged = uploads.join(format!("{}.{}", config.id, kind.extension()));
        tokio::fs::write(&staged, archive)
            .await
            .with_context(|| format!("stage {}", staged.display()))?;

        let files = archive::extract_and_remove(staged, kind, server_dir.to_path_buf())
            .await
            .map_err(|e| HostError::InvalidArchive(format_error_chain(&e)))?;

        let root = server_dir.to_path_buf();
        let outcome = tokio::task::spawn_blocking(move || scanner::scan_tree(&root))
            .await
            .context("join scan task")??;
        if let ScanOutcome::Flagged { file, pattern } = outcome {
            return Err(HostError::SecurityScanFailed {
                file: file.display().to_string(),
                pattern: pattern.to_string(),
            });
        }

        if !tokio::fs::metadata(&config.working_dir)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
        {
            return Err(HostError::InvalidConfig(format!(
                "working_dir {} does not exist in the bundle",
                config.working_dir.display()
            )));
        }

        save_config(server_dir, config).await?;

        let mut servers = self.servers.lock().await;
        if servers.len() >= self.settings.max_servers {
            return Err(HostError::ServerLimitReached {
                limit: self.settings.max_servers,
            });
        }
        let sup = ProcessSupervisor::new(
            config.clone(),
            server_dir.to_path_buf(),
            self.supervisor_opts.clone(),
        );
        servers.insert(config.id.clone(), Arc::new(sup));
        tracing::debug!(server_id = %config.id, files, "bundle extracted and registered");
        Ok(())
    }

    pub async fn start(&self, server_id: &str) -> Result<bool, HostError> {
        let res = async {
            let sup = self.supervisor(server_id).await?;
            if sup.is_exhausted().await {
                return Err(HostError::RestartLimitReached {
                    server_id: server_id.to_string(),
                    max_restarts: sup.config().max_restarts,
                });
            }
            let ok = sup.start().await?;
            let status = sup.get_status(0).await;
            let event_type = if ok { "started" } else { "start_failed" };
            self.emit(
                LifecycleEvent::new(event_type, server_id, sup.name())
                    .with("pid", status.pid)
                    .with("exit_code", status.exit_code),
            )
            .await;
            Ok::<_, HostError>(ok)
        }
        .await;
        log_failure("start", server_id, res)
    }

    pub async fn stop(&self, server_id: &str) -> Result<(), HostError> {
        let res = async {
            let sup = self.supervisor(server_id).await?;
            sup.stop(self.settings.stop_timeout).await?;
            self.emit(LifecycleEvent::new("stopped", server_id, sup.name()))
                .await;
            Ok::<_, HostError>(())
        }
        .await;
        log_failure("stop", server_id, res)
    }

    pub async fn restart(&self, server_id: &str) -> Result<bool, HostError> {
        let res = async {
            let sup = self.supervisor(server_id).await?;
            let ok = sup.restart().await?;
            if !ok && sup.is_exhausted().await {
                return Err(HostError::RestartLimitReached {
                    server_id: server_id.to_string(),
                    max_restarts: sup.config().max_restarts,
                });
            }
            self.emit(
                LifecycleEvent::new("restarted", server_id, sup.name())
                    .with("restart_count", sup.restart_count().await)
                    .with("running", ok),
            )
            .await;
            Ok::<_, HostError>(ok)
        }
        .await;
        log_failure("restart", server_id, res)
    }

    pub async fn reset(&self, server_id: &str) -> Result<(), HostError> {
        let res = async {
            let sup = self.supervisor(server_id).await?;
            sup.reset().await?;
            self.emit(LifecycleEvent::new("reset", server_id, sup.name()))
                .await;
            Ok::<_, HostError>(())
        }
        .await;
        log_failure("reset", server_id, res)
    }

    pub async fn delete(&self, server_id: &str, force: bool) -> Result<(), HostError> {
        let res = self.delete_inner(server_id, force, "deleted").await;
        log_failure("delete", server_id, res)
    }

    async fn delete_inner(
        &self,
        server_id: &str,
        force: bool,
        event_type: &'static str,
    ) -> Result<(), HostError> {
        let sup = self.supervisor(server_id).await?;
        if !sup.retire(force, self.settings.stop_timeout).await? {
            return Err(HostError::ServerRunning(server_id.to_string()));
        }

        self.servers.lock().await.remove(server_id);
        match tokio::fs::remove_dir_all(sup.server_dir()).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(anyhow::Error::new(e)
                    .context(format!("remove {}", sup.server_dir().display()))
                    .into());
            }
        }

        tracing::info!(server_id, force, "server deleted");
        self.emit(
            LifecycleEvent::new(event_type, server_id, sup.name()).with("force", force),
        )
        .await;
        Ok(())
    }

    pub async fn list(&self) -> Vec<ServerStatus> {
        let mut out = Vec::new();
        for sup in self.snapshot().await {
            out.push(sup.get_status(0).await);
        }
        out
    }

    pub async fn get_status(&self, server_id: &str, log_lines: usize) -> Result<ServerStatus, HostError> {
        let sup = self.supervisor(server_id).await?;
        Ok(sup.get_status(log_lines).await)
    }

    pub async fn get_config(&self, server_id: &str) -> Result<ServerConfig, HostError> {
        Ok(self.supervisor(server_id).await?.config().clone())
    }

    pub async fn get_logs(&self, server_id: &str, limit: usize) -> Result<Vec<LogEntry>, HostError> {
        let sup = self.supervisor(server_id).await?;
        Ok(sup.recent_logs(limit).await)
    }

    pub async fn run_health_cycle(&self) -> usize {
        self.health_cycle(false).await
    }

    pub(crate) async fn health_cycle(&self, force: bool) -> usize {
        let mut restarts = 0;
        for sup in self.snapshot().await {
            if !sup.is_monitored().await {
                continue;
            }
            if !force && !sup.health_due(tokio::time::Instant::now()).await {
                continue;
            }
            if sup.health_check().await || !sup.config().auto_restart {
                continue;
            }

            restarts += 1;
            let outcome = sup.restart().await;
            if sup.is_retired().await {
                continue;
            }
            let exhausted = sup.is_exhausted().await;
            match outcome {
                Ok(false) if exhausted => {
                    tracing::warn!(server_id = %sup.id(), "restart limit reached; server left failed");
                }
                Ok(ok) => {
                    self.emit(
                        LifecycleEvent::new("auto_restarted", sup.id(), sup.name())
                            .with("restart_count", sup.restart_count().await)
                            .with("running", ok),
                    )
                    .await;
                }
                Err(e) => {
                    tracing::warn!(server_id = %sup.id(), error = %format_error_chain(&e), "auto-restart failed");
                }
            }
        }
        restarts
    }

    pub async fn run_cleanup_cycle(&self) -> CleanupReport {
        let retention = self.settings.log_retention;
        let mut report = CleanupReport::default();

        for sup in self.snapshot().await {
            let keep = sup.console_log_path();
            match logs::prune_older_than(&sup.log_dir(), retention, Some(&keep)).await {
                Ok(n) => report.log_files_removed += n,
                Err(e) => tracing::warn!(server_id = %sup.id(), error = %e, "log cleanup failed"),
            }
        }

        match logs::prune_older_than(&self.settings.uploads_root(), retention, None).await {
            Ok(n) => report.uploads_removed = n,
            Err(e) => tracing::warn!(error = %e, "upload cleanup failed"),
        }

        for sup in self.snapshot().await {
            let dead = sup.state().await == ServerState::Failed
                && sup.restart_count().await >= sup.config().max_restarts;
            if !dead {
                continue;
            }
            match self.delete_inner(sup.id(), true, "cleanup_deleted").await {
                Ok(()) => report.servers_deleted.push(sup.id().to_string()),
                Err(e) => tracing::warn!(server_id = %sup.id(), error = %e, "cleanup delete failed"),
            }
        }

        if report != CleanupReport::default() {
            tracing::info!(
                log_files_removed = report.log_files_removed,
                uploads_removed = report.uploads_removed,
                servers_deleted = report.servers_deleted.len(),
                "cleanup cycle"
            );
        }
        report
    }

    pub async fn spawn_background_loops(self: &Arc<Self>) {
        let health = {
            let manager = self.clone();
            let period = self.settings.health_check_interval;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    manager.run_health_cycle().await;
                }
            })
        };
        let cleanup = {
            let manager = self.clone();
            let period = self.settings.cleanup_interval;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    manager.run_cleanup_cycle().await;
                }
            })
        };
        self.loops.lock().await.extend([health, cleanup]);
    }

    // Cancel the loops first, then stop every child within its grace period.
    pub async fn shutdown(&self) {
        let loops: Vec<_> = self.loops.lock().await.drain(..).collect();
        for handle in loops {
            handle.abort();
            let _ = handle.await;
        }

        let timeout = self.settings.stop_timeout;
        let mut set = tokio::task::JoinSet::new();
        for sup in self.snapshot().await {
            set.spawn(async move {
                if let Err(e) = sup.stop(timeout).await {
                    tracing::warn!(server_id = %sup.id(), error = %e, "stop during shutdown failed");
                }
            });
        }
        while set.join_next().await.is_some() {}
        tracing::info!("host manager shut down");
    }
}
