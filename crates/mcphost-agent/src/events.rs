use std::path::PathBuf;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::{io::AsyncWriteExt, sync::Mutex};

#[derive(Debug, Clone, Serialize)]
pub struct LifecycleEvent {
    pub event_type: &'static str,
    pub server_id: String,
    pub server_name: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl LifecycleEvent {
    pub fn new(event_type: &'static str, server_id: &str, server_name: &str) -> Self {
        Self {
            event_type,
            server_id: server_id.to_string(),
            server_name: server_name.to_string(),
            timestamp: Utc::now(),
            extra: serde_json::Map::new(),
        }
    }

    pub fn with(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.extra.insert(key.to_string(), value.into());
        self
    }
}

#[async_trait::async_trait]
pub trait EventSink: Send + Sync {
    async fn record(&self, event: &LifecycleEvent) -> anyhow::Result<()>;
}

// Fire-and-forget: a failing sink is logged, never surfaced to the caller.
pub async fn emit(sink: &dyn EventSink, event: LifecycleEvent) {
    if let Err(err) = sink.record(&event).await {
        tracing::warn!(
            error = %err,
            event_type = event.event_type,
            server_id = %event.server_id,
            "failed to record lifecycle event"
        );
    }
}

pub struct NoopEventSink;

#[async_trait::async_trait]
impl EventSink for NoopEventSink {
    async fn record(&self, _event: &LifecycleEvent) -> anyhow::Result<()> {
        Ok(())
    }
}

pub struct JsonlEventSink {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlEventSink {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            write_lock: Mutex::new(()),
        }
    }
}

#[async_trait::async_trait]
impl EventSink for JsonlEventSink {
    async fn record(&self, event: &LifecycleEvent) -> anyhow::Result<()> {
        let mut line = serde_json::to_string(event).context("serialize event")?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut f = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("open {}", self.path.display()))?;
        f.write_all(line.as_bytes()).await?;
        f.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingSink;

    #[async_trait::async_trait]
    impl EventSink for FailingSink {
        async fn record(&self, _event: &LifecycleEvent) -> anyhow::Result<()> {
            anyhow::bail!("store unavailable")
        }
    }

    #[tokio::test]
    async fn jsonl_sink_appends_flattened_events() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        let sink = JsonlEventSink::new(path.clone());

        emit(&sink, LifecycleEvent::new("deployed", "id1", "weather").with("uploaded_by", "alice")).await;
        emit(&sink, LifecycleEvent::new("started", "id1", "weather")).await;

        let raw = std::fs::read_to_string(path).unwrap();
        let lines: Vec<serde_json::Value> = raw
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["event_type"], "deployed");
        assert_eq!(lines[0]["server_name"], "weather");
        assert_eq!(lines[0]["uploaded_by"], "alice");
        assert_eq!(lines[1]["event_type"], "started");
    }

    #[tokio::test]
    async fn failing_sink_does_not_propagate() {
        emit(&FailingSink, LifecycleEvent::new("stopped", "id1", "weather")).await;
        NoopEventSink
            .record(&LifecycleEvent::new("stopped", "id1", "weather"))
            .await
            .unwrap();
    }
}
