use std::{
    collections::{BTreeMap, BTreeSet},
    path::{Component, Path, PathBuf},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::HostError;

pub const MAX_RESTARTS_CEILING: u32 = 10;
const MIN_RESTART_DELAY_SECS: u64 = 1;
const MIN_HEALTH_CHECK_INTERVAL_SECS: u64 = 10;

const DEFAULT_MAX_RESTARTS: u32 = 3;
const DEFAULT_RESTART_DELAY_SECS: u64 = 5;
const DEFAULT_HEALTH_CHECK_INTERVAL_SECS: u64 = 30;
const DEFAULT_RUN_AS_USER: &str = "nobody";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub memory_mb: u64,
    pub cpu_percent: u32,
    pub cpu_seconds: u64,
    pub max_processes: u64,
}

impl ResourceLimits {
    pub fn for_language(language: &str) -> Self {
        match language {
            "python" => Self {
                memory_mb: 512,
                cpu_percent: 50,
                cpu_seconds: 3600,
                max_processes: 10,
            },
            "node" => Self {
                memory_mb: 384,
                cpu_percent: 40,
                cpu_seconds: 3600,
                max_processes: 10,
            },
            "bash" => Self {
                memory_mb: 128,
                cpu_percent: 20,
                cpu_seconds: 600,
                max_processes: 5,
            },
            _ => Self {
                memory_mb: 256,
                cpu_percent: 25,
                cpu_seconds: 1800,
                max_processes: 5,
            },
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResourceLimitsInput {
    pub memory_mb: Option<u64>,
    pub cpu_percent: Option<u32>,
    pub cpu_seconds: Option<u64>,
    pub max_processes: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UploadConfig {
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub working_dir: Option<String>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(default)]
    pub auto_restart: Option<bool>,
    #[serde(default)]
    pub max_restarts: Option<u32>,
    #[serde(default)]
    pub restart_delay: Option<u64>,
    #[serde(default)]
    pub health_check_url: Option<String>,
    #[serde(default)]
    pub health_check_interval: Option<u64>,
    #[serde(default)]
    pub resource_limits: Option<ResourceLimitsInput>,
    #[serde(default)]
    pub sandboxed: Option<bool>,
    #[serde(default)]
    pub user: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub id: String,
    pub name: String,
    pub description: String,
    pub command: Vec<String>,
    pub working_dir: PathBuf,
    pub environment: BTreeMap<String, String>,
    pub auto_restart: bool,
    pub max_restarts: u32,
    pub restart_delay_seconds: u64,
    pub health_check_url: Option<String>,
    pub health_check_interval_seconds: u64,
    pub resource_limits: ResourceLimits,
    pub sandboxed: bool,
    pub user: String,
    pub detected_language: String,
    pub uploaded_by: String,
    pub upload_time: DateTime<Utc>,
}

pub fn detect_language(command: &[String]) -> &'static str {
    let joined = command.join(" ").to_ascii_lowercase();
    if joined.contains("python") {
        "python"
    } else if joined.contains("node") {
        "node"
    } else if joined.contains("bash") {
        "bash"
    } else {
        "unknown"
    }
}

fn normalize_rel_path(rel: &str) -> Result<PathBuf, HostError> {
    let p = Path::new(rel.trim());
    if p.is_absolute() {
        return Err(HostError::InvalidConfig(
            "working_dir must be relative to the bundle".to_string(),
        ));
    }
    let mut out = PathBuf::new();
    for c in p.components() {
        match c {
            Component::CurDir => {}
            Component::Normal(seg) => out.push(seg),
            Component::ParentDir => {
                return Err(HostError::InvalidConfig(
                    "working_dir must not contain `..`".to_string(),
                ));
            }
            Component::Prefix(_) | Component::RootDir => {
                return Err(HostError::InvalidConfig(
                    "working_dir must be relative to the bundle".to_string(),
                ));
            }
        }
    }
    Ok(out)
}

fn resolve_limits(input: Option<&ResourceLimitsInput>, language: &str) -> ResourceLimits {
    let d = ResourceLimits::for_language(language);
    let Some(input) = input else {
        return d;
    };
    ResourceLimits {
        memory_mb: input.memory_mb.filter(|v| *v > 0).unwrap_or(d.memory_mb),
        cpu_percent: input
            .cpu_percent
            .filter(|v| *v > 0)
            .map(|v| v.min(100))
            .unwrap_or(d.cpu_percent),
        cpu_seconds: input.cpu_seconds.filter(|v| *v > 0).unwrap_or(d.cpu_seconds),
        max_processes: input
            .max_processes
            .filter(|v| *v > 0)
            .unwrap_or(d.max_processes),
    }
}

/// Turn a caller config into a canonical [`ServerConfig`].
///
/// Fails fast on an empty command or a language outside `allowed_languages`.
/// `server_dir` is the directory the bundle is (or will be) extracted into.
pub fn normalize(
    id: &str,
    name: &str,
    input: &UploadConfig,
    uploaded_by: &str,
    server_dir: &Path,
    allowed_languages: &BTreeSet<String>,
) -> Result<ServerConfig, HostError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(HostError::InvalidConfig("name must be non-empty".to_string()));
    }

    let command: Vec<String> = input
        .command
        .iter()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .collect();
    if command.is_empty() {
        return Err(HostError::InvalidConfig(
            "command must be a non-empty argument list".to_string(),
        ));
    }

    let language = detect_language(&command);
    if !allowed_languages.contains(language) {
        return Err(HostError::LanguageNotAllowed {
            language: language.to_string(),
            allowed: allowed_languages
                .iter()
                .cloned()
                .collect::<Vec<_>>()
                .join(","),
        });
    }

    for key in input.environment.keys() {
        if key.is_empty() || key.contains('=') || key.contains('\0') {
            return Err(HostError::InvalidConfig(format!(
                "invalid environment variable name {key:?}"
            )));
        }
    }

    let health_check_url = input
        .health_check_url
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(|v| {
            if v.starts_with("http://") || v.starts_with("https://") {
                Ok(v.to_string())
            } else {
                Err(HostError::InvalidConfig(format!(
                    "health_check_url must be http(s): {v:?}"
                )))
            }
        })
        .transpose()?;

    let working_dir = match input.working_dir.as_deref().filter(|v| !v.trim().is_empty()) {
        Some(rel) => server_dir.join(normalize_rel_path(rel)?),
        None => server_dir.to_path_buf(),
    };

    Ok(ServerConfig {
        id: id.to_string(),
        name: name.to_string(),
        description: input.description.clone().unwrap_or_default(),
        command,
        working_dir,
        environment: input.environment.clone(),
        auto_restart: input.auto_restart.unwrap_or(true),
        max_restarts: input
            .max_restarts
            .unwrap_or(DEFAULT_MAX_RESTARTS)
            .min(MAX_RESTARTS_CEILING),
        restart_delay_seconds: input
            .restart_delay
            .unwrap_or(DEFAULT_RESTART_DELAY_SECS)
            .max(MIN_RESTART_DELAY_SECS),
        health_check_url,
        health_check_interval_seconds: input
            .health_check_interval
            .unwrap_or(DEFAULT_HEALTH_CHECK_INTERVAL_SECS)
            .max(MIN_HEALTH_CHECK_INTERVAL_SECS),
        resource_limits: resolve_limits(input.resource_limits.as_ref(), language),
        sandboxed: input.sandboxed.unwrap_or(true),
        user: input
            .user
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .unwrap_or(DEFAULT_RUN_AS_USER)
            .to_string(),
        detected_language: language.to_string(),
        uploaded_by: uploaded_by.to_string(),
        upload_time: Utc::now(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn langs(v: &[&str]) -> BTreeSet<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    fn cmd(v: &[&str]) -> UploadConfig {
        UploadConfig {
            command: v.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn python_without_limits_gets_python_defaults() {
        let cfg = normalize(
            "id1",
            "weather",
            &cmd(&["python", "server.py"]),
            "alice",
            Path::new("/srv/servers/id1"),
            &langs(&["python"]),
        )
        .unwrap();
        assert_eq!(cfg.detected_language, "python");
        assert_eq!(cfg.resource_limits.memory_mb, 512);
        assert_eq!(cfg.resource_limits.cpu_percent, 50);
        assert_eq!(cfg.working_dir, PathBuf::from("/srv/servers/id1"));
        assert_eq!(cfg.uploaded_by, "alice");
        assert!(cfg.auto_restart);
        assert!(cfg.sandboxed);
    }

    #[test]
    fn language_detection_uses_joined_command() {
        assert_eq!(detect_language(&["/usr/bin/python3".into()]), "python");
        assert_eq!(detect_language(&["node".into(), "index.js".into()]), "node");
        assert_eq!(detect_language(&["bash".into(), "run.sh".into()]), "bash");
        assert_eq!(detect_language(&["./server".into()]), "unknown");
    }

    #[test]
    fn empty_command_is_rejected() {
        let err = normalize("x", "n", &cmd(&["", "  "]), "u", Path::new("/d"), &langs(&["unknown"]))
            .unwrap_err();
        assert!(matches!(err, HostError::InvalidConfig(_)));
    }

    #[test]
    fn disallowed_language_is_rejected() {
        let err = normalize(
            "x",
            "n",
            &cmd(&["node", "index.js"]),
            "u",
            Path::new("/d"),
            &langs(&["python"]),
        )
        .unwrap_err();
        match err {
            HostError::LanguageNotAllowed { language, .. } => assert_eq!(language, "node"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn restart_and_health_parameters_are_clamped() {
        let input = UploadConfig {
            max_restarts: Some(99),
            restart_delay: Some(0),
            health_check_interval: Some(2),
            ..cmd(&["bash", "run.sh"])
        };
        let cfg = normalize("x", "n", &input, "u", Path::new("/d"), &langs(&["bash"])).unwrap();
        assert_eq!(cfg.max_restarts, MAX_RESTARTS_CEILING);
        assert_eq!(cfg.restart_delay_seconds, 1);
        assert_eq!(cfg.health_check_interval_seconds, 10);
    }

    #[test]
    fn partial_limits_fill_from_language_defaults() {
        let input = UploadConfig {
            resource_limits: Some(ResourceLimitsInput {
                memory_mb: Some(1024),
                cpu_percent: Some(250),
                ..Default::default()
            }),
            ..cmd(&["bash", "run.sh"])
        };
        let cfg = normalize("x", "n", &input, "u", Path::new("/d"), &langs(&["bash"])).unwrap();
        assert_eq!(cfg.resource_limits.memory_mb, 1024);
        assert_eq!(cfg.resource_limits.cpu_percent, 100);
        assert_eq!(cfg.resource_limits.cpu_seconds, 600);
        assert_eq!(cfg.resource_limits.max_processes, 5);
    }

    #[test]
    fn working_dir_must_stay_inside_bundle() {
        let mut input = cmd(&["./server"]);
        input.working_dir = Some("../etc".to_string());
        let err = normalize("x", "n", &input, "u", Path::new("/d"), &langs(&["unknown"]))
            .unwrap_err();
        assert!(matches!(err, HostError::InvalidConfig(_)));

        input.working_dir = Some("./app/bin".to_string());
        let cfg = normalize("x", "n", &input, "u", Path::new("/d"), &langs(&["unknown"])).unwrap();
        assert_eq!(cfg.working_dir, PathBuf::from("/d/app/bin"));
    }

    #[test]
    fn health_url_must_be_http() {
        let mut input = cmd(&["./server"]);
        input.health_check_url = Some("ftp://localhost/health".to_string());
        let err = normalize("x", "n", &input, "u", Path::new("/d"), &langs(&["unknown"]))
            .unwrap_err();
        assert!(matches!(err, HostError::InvalidConfig(_)));
    }

    #[test]
    fn config_round_trips_through_json() {
        let cfg = normalize(
            "id1",
            "weather",
            &cmd(&["python", "server.py"]),
            "alice",
            Path::new("/srv/servers/id1"),
            &langs(&["python"]),
        )
        .unwrap();
        let raw = serde_json::to_vec_pretty(&cfg).unwrap();
        let back: ServerConfig = serde_json::from_slice(&raw).unwrap();
        assert_eq!(back, cfg);
    }
}
