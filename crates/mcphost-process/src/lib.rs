use chrono::{DateTime, Utc};

/// Stable identifier of a hosted MCP server.
///
/// NOTE: Used verbatim as the on-disk directory name, so it must stay path-safe.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct ServerId(pub String);

impl ServerId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for ServerId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ServerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerState {
    #[default]
    Stopped,
    Starting,
    Running,
    Failed,
    Error,
}

impl ServerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerState::Stopped => "stopped",
            ServerState::Starting => "starting",
            ServerState::Running => "running",
            ServerState::Failed => "failed",
            ServerState::Error => "error",
        }
    }

    /// True while an OS process may back the server.
    pub fn is_live(&self) -> bool {
        matches!(self, ServerState::Starting | ServerState::Running)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub stream: LogStream,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ResourceUsage {
    pub cpu_percent: f64,
    pub memory_mb: f64,
    pub memory_percent: f64,
    pub thread_count: u32,
    pub open_files: u32,
    pub connections: u32,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ServerStatus {
    pub server_id: ServerId,
    pub name: String,
    pub description: String,
    pub status: ServerState,
    pub pid: Option<u32>,
    pub start_time: Option<DateTime<Utc>>,
    pub uptime_seconds: Option<u64>,
    pub restart_count: u32,
    pub max_restarts: u32,
    pub last_restart: Option<DateTime<Utc>>,
    pub health_check_failures: u32,
    pub exit_code: Option<i32>,
    pub message: Option<String>,
    pub detected_language: String,
    pub resource_usage: Option<ResourceUsage>,
    pub logs: Vec<LogEntry>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_id_is_non_empty() {
        let id = ServerId::new();
        assert!(!id.0.is_empty());
        assert_ne!(id, ServerId::new());
    }

    #[test]
    fn state_serializes_lowercase() {
        let v = serde_json::to_string(&ServerState::Running).unwrap();
        assert_eq!(v, "\"running\"");
        assert_eq!(ServerState::Failed.as_str(), "failed");
        assert!(ServerState::Starting.is_live());
        assert!(!ServerState::Failed.is_live());
    }
}
