const MAX_MESSAGE_BYTES: usize = 32 * 1024;
const MAX_HINT_BYTES: usize = 8 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error("archive is {size} bytes, exceeds the {limit} byte upload limit")]
    ArchiveTooLarge { size: u64, limit: u64 },
    #[error("server limit reached ({limit} servers)")]
    ServerLimitReached { limit: usize },
    #[error("unsupported archive format: {0}")]
    UnsupportedArchive(String),
    #[error("invalid archive: {0}")]
    InvalidArchive(String),
    #[error("invalid server config: {0}")]
    InvalidConfig(String),
    #[error("language {language:?} is not allowed (allowed: {allowed})")]
    LanguageNotAllowed { language: String, allowed: String },
    #[error("security scan rejected {file}: matched {pattern:?}")]
    SecurityScanFailed { file: String, pattern: String },
    #[error("server not found: {0}")]
    NotFound(String),
    #[error("server is running: {0}")]
    ServerRunning(String),
    #[error("restart limit reached for server {server_id} ({max_restarts} restarts)")]
    RestartLimitReached { server_id: String, max_restarts: u32 },
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl HostError {
    pub fn code(&self) -> &'static str {
        match self {
            HostError::ArchiveTooLarge { .. } => "archive_too_large",
            HostError::ServerLimitReached { .. } => "server_limit_reached",
            HostError::UnsupportedArchive(_) => "unsupported_archive",
            HostError::InvalidArchive(_) => "invalid_archive",
            HostError::InvalidConfig(_) => "invalid_config",
            HostError::LanguageNotAllowed { .. } => "language_not_allowed",
            HostError::SecurityScanFailed { .. } => "security_scan_failed",
            HostError::NotFound(_) => "not_found",
            HostError::ServerRunning(_) => "server_running",
            HostError::RestartLimitReached { .. } => "restart_limit_reached",
            HostError::Internal(_) => "internal",
        }
    }

    pub fn hint(&self) -> Option<&'static str> {
        match self {
            HostError::ArchiveTooLarge { .. } => {
                Some("Strip build artifacts from the bundle or raise MCPHOST_MAX_UPLOAD_BYTES.")
            }
            HostError::ServerLimitReached { .. } => {
                Some("Delete an unused server to free a slot.")
            }
            HostError::UnsupportedArchive(_) => Some("Upload a .zip, .tar, .tar.gz or .tgz file."),
            HostError::ServerRunning(_) => {
                Some("Stop the server first, or delete with force=true.")
            }
            HostError::RestartLimitReached { .. } => {
                Some("Inspect the logs, then reset the server to re-enable restarts.")
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

fn truncate_utf8(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }

    let suffix = "…(truncated)";
    let keep = max_bytes.saturating_sub(suffix.len()).max(1);
    let mut end = keep.min(s.len());
    while end > 0 && !s.is_char_boundary(end) {
        end = end.saturating_sub(1);
    }
    let mut out = s[..end].to_string();
    out.push_str(suffix);
    out
}

pub fn format_error_chain(err: &anyhow::Error) -> String {
    let mut parts = Vec::<String>::new();
    for cause in err.chain() {
        let s = cause.to_string();
        if s.is_empty() {
            continue;
        }
        if parts.last() == Some(&s) {
            continue;
        }
        parts.push(s);
    }
    if parts.is_empty() {
        "unknown error".to_string()
    } else {
        parts.join(": ")
    }
}

impl From<&HostError> for ErrorPayload {
    fn from(err: &HostError) -> Self {
        let message = match err {
            HostError::Internal(e) => format_error_chain(e),
            other => other.to_string(),
        };
        ErrorPayload {
            code: err.code().to_string(),
            message: truncate_utf8(&message, MAX_MESSAGE_BYTES),
            hint: err.hint().map(|h| truncate_utf8(h, MAX_HINT_BYTES)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_respects_char_boundaries() {
        let long = "é".repeat(MAX_MESSAGE_BYTES);
        let out = truncate_utf8(&long, MAX_MESSAGE_BYTES);
        assert!(out.len() <= MAX_MESSAGE_BYTES);
        assert!(out.ends_with("…(truncated)"));
    }

    #[test]
    fn payload_carries_code_and_hint() {
        let err = HostError::ServerRunning("abc".to_string());
        let p = ErrorPayload::from(&err);
        assert_eq!(p.code, "server_running");
        assert_eq!(p.message, "server is running: abc");
        assert!(p.hint.is_some());
    }

    #[test]
    fn internal_errors_flatten_context_chain() {
        let inner = anyhow::anyhow!("disk full").context("persist server config");
        let p = ErrorPayload::from(&HostError::Internal(inner));
        assert_eq!(p.code, "internal");
        assert_eq!(p.message, "persist server config: disk full");
    }
}
