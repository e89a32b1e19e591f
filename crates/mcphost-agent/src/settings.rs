use std::{
    collections::BTreeSet,
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

const DEFAULT_MAX_SERVERS: usize = 50;
const DEFAULT_MAX_UPLOAD_BYTES: u64 = 100 * 1024 * 1024; // 100 MiB
const DEFAULT_MAX_LOG_ENTRIES: usize = 1000;
const DEFAULT_LOG_FILE_MAX_BYTES: u64 = 10 * 1024 * 1024; // 10 MiB
const DEFAULT_LOG_FILE_MAX_FILES: usize = 3;
const DEFAULT_ALLOWED_LANGUAGES: &str = "python,node,bash,unknown";

pub(crate) fn env_usize(name: &str) -> Option<usize> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
}

pub(crate) fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub(crate) fn parse_language_list(raw: &str) -> BTreeSet<String> {
    raw.split(',')
        .map(|v| v.trim().to_ascii_lowercase())
        .filter(|v| !v.is_empty())
        .collect()
}

#[derive(Debug, Clone)]
pub struct HostSettings {
    pub data_root: PathBuf,
    pub listen_addr: SocketAddr,
    pub max_servers: usize,
    pub max_upload_bytes: u64,
    pub max_log_entries: usize,
    pub health_check_interval: Duration,
    pub cleanup_interval: Duration,
    pub log_retention: Duration,
    pub stop_timeout: Duration,
    pub health_probe_timeout: Duration,
    pub start_settle: Duration,
    pub resource_sample_interval: Duration,
    pub allowed_languages: BTreeSet<String>,
    pub log_file_max_bytes: u64,
    pub log_file_max_files: usize,
}

impl Default for HostSettings {
    fn default() -> Self {
        Self {
            data_root: PathBuf::from("./data"),
            listen_addr: ([127, 0, 0, 1], 8765).into(),
            max_servers: DEFAULT_MAX_SERVERS,
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            max_log_entries: DEFAULT_MAX_LOG_ENTRIES,
            health_check_interval: Duration::from_secs(10),
            cleanup_interval: Duration::from_secs(3600),
            log_retention: Duration::from_secs(7 * 24 * 3600),
            stop_timeout: Duration::from_secs(10),
            health_probe_timeout: Duration::from_millis(5000),
            start_settle: Duration::from_millis(1000),
            resource_sample_interval: Duration::from_millis(2000),
            allowed_languages: parse_language_list(DEFAULT_ALLOWED_LANGUAGES),
            log_file_max_bytes: DEFAULT_LOG_FILE_MAX_BYTES,
            log_file_max_files: DEFAULT_LOG_FILE_MAX_FILES,
        }
    }
}

impl HostSettings {
    pub fn from_env() -> anyhow::Result<Self> {
        let d = Self::default();

        let listen_addr = match env_string("MCPHOST_LISTEN_ADDR") {
            Some(raw) => raw
                .parse::<SocketAddr>()
                .map_err(|e| anyhow::anyhow!("invalid MCPHOST_LISTEN_ADDR={raw:?}: {e}"))?,
            None => d.listen_addr,
        };

        Ok(Self {
            data_root: env_string("MCPHOST_DATA_ROOT")
                .map(PathBuf::from)
                .unwrap_or(d.data_root),
            listen_addr,
            max_servers: env_usize("MCPHOST_MAX_SERVERS")
                .map(|v| v.clamp(1, 10_000))
                .unwrap_or(d.max_servers),
            max_upload_bytes: env_u64("MCPHOST_MAX_UPLOAD_BYTES")
                .map(|v| v.clamp(1024, 4 * 1024 * 1024 * 1024))
                .unwrap_or(d.max_upload_bytes),
            max_log_entries: env_usize("MCPHOST_MAX_LOG_ENTRIES")
                .map(|v| v.clamp(10, 100_000))
                .unwrap_or(d.max_log_entries),
            health_check_interval: env_u64("MCPHOST_HEALTH_CHECK_INTERVAL_SEC")
                .map(|v| Duration::from_secs(v.clamp(1, 3600)))
                .unwrap_or(d.health_check_interval),
            cleanup_interval: env_u64("MCPHOST_CLEANUP_INTERVAL_SEC")
                .map(|v| Duration::from_secs(v.clamp(10, 7 * 24 * 3600)))
                .unwrap_or(d.cleanup_interval),
            log_retention: env_u64("MCPHOST_LOG_RETENTION_SEC")
                .map(|v| Duration::from_secs(v.clamp(60, 365 * 24 * 3600)))
                .unwrap_or(d.log_retention),
            stop_timeout: env_u64("MCPHOST_STOP_TIMEOUT_SEC")
                .map(|v| Duration::from_secs(v.clamp(1, 300)))
                .unwrap_or(d.stop_timeout),
            health_probe_timeout: env_u64("MCPHOST_HEALTH_PROBE_TIMEOUT_MS")
                .map(|v| Duration::from_millis(v.clamp(100, 60_000)))
                .unwrap_or(d.health_probe_timeout),
            start_settle: env_u64("MCPHOST_START_SETTLE_MS")
                .map(|v| Duration::from_millis(v.clamp(100, 30_000)))
                .unwrap_or(d.start_settle),
            resource_sample_interval: env_u64("MCPHOST_RESOURCE_SAMPLE_INTERVAL_MS")
                .map(|v| Duration::from_millis(v.clamp(250, 60_000)))
                .unwrap_or(d.resource_sample_interval),
            allowed_languages: env_string("MCPHOST_ALLOWED_LANGUAGES")
                .map(|v| parse_language_list(&v))
                .filter(|v| !v.is_empty())
                .unwrap_or(d.allowed_languages),
            log_file_max_bytes: env_u64("MCPHOST_LOG_FILE_MAX_BYTES")
                .map(|v| v.clamp(64 * 1024, 1024 * 1024 * 1024))
                .unwrap_or(d.log_file_max_bytes),
            log_file_max_files: env_usize("MCPHOST_LOG_FILE_MAX_FILES")
                .map(|v| v.clamp(1, 20))
                .unwrap_or(d.log_file_max_files),
        })
    }

    pub fn with_data_root(data_root: impl AsRef<Path>) -> Self {
        Self {
            data_root: data_root.as_ref().to_path_buf(),
            ..Self::default()
        }
    }

    pub fn servers_root(&self) -> PathBuf {
        self.data_root.join("servers")
    }

    pub fn uploads_root(&self) -> PathBuf {
        self.data_root.join("uploads")
    }

    pub fn events_path(&self) -> PathBuf {
        self.data_root.join("events.jsonl")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn language_list_is_normalized() {
        let got = parse_language_list(" Python, node ,,BASH ");
        let want: BTreeSet<String> = ["bash", "node", "python"]
            .into_iter()
            .map(String::from)
            .collect();
        assert_eq!(got, want);
    }

    #[test]
    fn default_layout_hangs_off_data_root() {
        let s = HostSettings::with_data_root("/srv/mcp");
        assert_eq!(s.servers_root(), PathBuf::from("/srv/mcp/servers"));
        assert_eq!(s.uploads_root(), PathBuf::from("/srv/mcp/uploads"));
        assert_eq!(s.events_path(), PathBuf::from("/srv/mcp/events.jsonl"));
        assert!(s.allowed_languages.contains("unknown"));
        assert_eq!(s.max_log_entries, DEFAULT_MAX_LOG_ENTRIES);
    }
}
