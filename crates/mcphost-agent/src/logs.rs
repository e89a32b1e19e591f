use std::{
    collections::VecDeque,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, SystemTime},
};

use chrono::Utc;
use mcphost_process::{LogEntry, LogStream};
use tokio::{
    io::AsyncWriteExt,
    sync::{Mutex, mpsc},
};

pub const CONSOLE_LOG_NAME: &str = "console.log";

#[derive(Debug)]
pub struct LogBuffer {
    max_entries: usize,
    entries: VecDeque<LogEntry>,
}

impl LogBuffer {
    pub fn new(max_entries: usize) -> Self {
        Self {
            max_entries: max_entries.max(1),
            entries: VecDeque::new(),
        }
    }

    pub fn push(&mut self, entry: LogEntry) {
        while self.entries.len() >= self.max_entries {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn tail(&self, limit: usize) -> Vec<LogEntry> {
        let start = self.entries.len().saturating_sub(limit);
        self.entries.iter().skip(start).cloned().collect()
    }
}

#[derive(Clone)]
pub struct LogSink {
    buffer: Arc<Mutex<LogBuffer>>,
    file_tx: Option<mpsc::UnboundedSender<String>>,
}

impl LogSink {
    pub fn new(buffer: Arc<Mutex<LogBuffer>>, file_tx: Option<mpsc::UnboundedSender<String>>) -> Self {
        Self { buffer, file_tx }
    }

    pub async fn emit(&self, stream: LogStream, message: impl Into<String>) {
        let entry = LogEntry {
            timestamp: Utc::now(),
            stream,
            message: message.into(),
        };
        if let Some(tx) = &self.file_tx {
            let tag = match stream {
                LogStream::Stdout => "stdout",
                LogStream::Stderr => "stderr",
            };
            let _ = tx.send(format!(
                "{} [{tag}] {}",
                entry.timestamp.to_rfc3339(),
                entry.message
            ));
        }
        self.buffer.lock().await.push(entry);
    }

    pub async fn note(&self, message: impl AsRef<str>) {
        self.emit(LogStream::Stderr, format!("[mcphost] {}", message.as_ref()))
            .await;
    }
}

pub struct FileLogWriter {
    path: PathBuf,
    max_bytes: u64,
    max_files: usize,
    bytes: u64,
    file: tokio::fs::File,
}

impl FileLogWriter {
    pub async fn open(path: PathBuf, max_bytes: u64, max_files: usize) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let bytes = tokio::fs::metadata(&path)
            .await
            .map(|m| m.len())
            .unwrap_or(0);
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        Ok(Self {
            path,
            max_bytes,
            max_files,
            bytes,
            file,
        })
    }

    async fn rotate(&mut self) -> std::io::Result<()> {
        let _ = self.file.flush().await;

        // Shift old rotations: .(n-1) -> .n
        for i in (1..self.max_files).rev() {
            let from = PathBuf::from(format!("{}.{}", self.path.display(), i));
            let to = PathBuf::from(format!("{}.{}", self.path.display(), i + 1));
            if tokio::fs::metadata(&from).await.is_ok() {
                let _ = tokio::fs::rename(from, to).await;
            }
        }

        // Current -> .1
        let rotated = PathBuf::from(format!("{}.1", self.path.display()));
        if tokio::fs::metadata(&self.path).await.is_ok() {
            let _ = tokio::fs::rename(&self.path, &rotated).await;
        }

        self.file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        self.bytes = 0;
        Ok(())
    }

    pub async fn write_line(&mut self, line: &str) -> std::io::Result<()> {
        let mut line = line.to_string();
        if !line.ends_with('\n') {
            line.push('\n');
        }

        let write_len = line.len() as u64;
        if self.max_bytes > 0 && self.bytes.saturating_add(write_len) > self.max_bytes {
            self.rotate().await.ok();
        }

        self.file.write_all(line.as_bytes()).await?;
        self.bytes = self.bytes.saturating_add(write_len);
        Ok(())
    }
}

// Spawn the console-log writer task; it ends when every sender is dropped.
pub fn spawn_file_writer(
    path: PathBuf,
    max_bytes: u64,
    max_files: usize,
) -> mpsc::UnboundedSender<String> {
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    tokio::spawn(async move {
        let mut writer = match FileLogWriter::open(path.clone(), max_bytes, max_files).await {
            Ok(w) => w,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "console log unavailable");
                return;
            }
        };
        while let Some(line) = rx.recv().await {
            let _ = writer.write_line(&line).await;
        }
    });
    tx
}

pub async fn prune_older_than(
    dir: &Path,
    retention: Duration,
    keep: Option<&Path>,
) -> std::io::Result<usize> {
    let cutoff = SystemTime::now()
        .checked_sub(retention)
        .unwrap_or(SystemTime::UNIX_EPOCH);

    let mut rd = match tokio::fs::read_dir(dir).await {
        Ok(rd) => rd,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };

    let mut removed = 0;
    while let Some(de) = rd.next_entry().await? {
        let path = de.path();
        if keep.is_some_and(|k| k == path) {
            continue;
        }
        let meta = de.metadata().await?;
        if !meta.is_file() {
            continue;
        }
        let modified = meta.modified().unwrap_or(SystemTime::now());
        if modified < cutoff {
            tokio::fs::remove_file(&path).await?;
            removed += 1;
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(msg: &str) -> LogEntry {
        LogEntry {
            timestamp: Utc::now(),
            stream: LogStream::Stdout,
            message: msg.to_string(),
        }
    }

    #[test]
    fn buffer_evicts_oldest_at_capacity() {
        let mut b = LogBuffer::new(3);
        for i in 0..5 {
            b.push(entry(&format!("line {i}")));
            assert!(b.len() <= 3);
        }
        let msgs: Vec<String> = b.tail(10).into_iter().map(|e| e.message).collect();
        assert_eq!(msgs, vec!["line 2", "line 3", "line 4"]);
    }

    #[test]
    fn tail_returns_most_recent_in_order() {
        let mut b = LogBuffer::new(10);
        for i in 0..4 {
            b.push(entry(&format!("{i}")));
        }
        let msgs: Vec<String> = b.tail(2).into_iter().map(|e| e.message).collect();
        assert_eq!(msgs, vec!["2", "3"]);
        assert!(LogBuffer::new(0).is_empty());
    }

    #[tokio::test]
    async fn writer_rotates_when_full() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONSOLE_LOG_NAME);
        let mut w = FileLogWriter::open(path.clone(), 16, 2).await.unwrap();
        w.write_line("0123456789").await.unwrap();
        w.write_line("abcdefghij").await.unwrap();
        w.file.flush().await.unwrap();

        let rotated = dir.path().join(format!("{CONSOLE_LOG_NAME}.1"));
        assert_eq!(std::fs::read_to_string(rotated).unwrap(), "0123456789\n");
        assert_eq!(std::fs::read_to_string(path).unwrap(), "abcdefghij\n");
    }

    #[tokio::test]
    async fn prune_keeps_fresh_and_protected_files() {
        let dir = tempfile::tempdir().unwrap();
        let live = dir.path().join(CONSOLE_LOG_NAME);
        let old = dir.path().join("console.log.1");
        std::fs::write(&live, "live").unwrap();
        std::fs::write(&old, "old").unwrap();

        let removed = prune_older_than(dir.path(), Duration::from_secs(3600), Some(&live))
            .await
            .unwrap();
        assert_eq!(removed, 0);

        let removed = prune_older_than(dir.path(), Duration::ZERO, Some(&live))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert!(live.exists());
        assert!(!old.exists());
    }
}
