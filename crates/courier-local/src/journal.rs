use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use courier_core::{CourierError, DeadLetterJournal, DeadLetterRecord};
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument};

/// Journal kept in memory, for tests and local runs.
#[derive(Debug, Default)]
pub struct MemoryJournal {
    records: Mutex<Vec<DeadLetterRecord>>,
    failing: AtomicBool,
}

impl MemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `record` call fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn records(&self) -> Vec<DeadLetterRecord> {
        self.records.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

#[async_trait]
impl DeadLetterJournal for MemoryJournal {
    fn journal_name(&self) -> &'static str {
        "memory"
    }

    async fn record(&self, record: &DeadLetterRecord) -> Result<(), CourierError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(CourierError::Internal(
                "memory journal marked failing".to_string(),
            ));
        }
        self.records.lock().push(record.clone());
        Ok(())
    }
}

/// Append-only JSON-lines journal on the local filesystem.
///
/// Each record is one line; `record` returns after the line is flushed to disk.
#[derive(Debug)]
pub struct FileJournal {
    path: PathBuf,
    /// Serializes appends so lines never interleave.
    write_lock: tokio::sync::Mutex<()>,
}

impl FileJournal {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read every record written so far. A missing file is an empty journal.
    pub async fn read_all(&self) -> Result<Vec<DeadLetterRecord>, CourierError> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(CourierError::Internal(format!(
                    "Failed to read journal {}: {}",
                    self.path.display(),
                    e
                )))
            }
        };

        content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).map_err(CourierError::from))
            .collect()
    }

    fn io_error(&self, action: &str, e: std::io::Error) -> CourierError {
        CourierError::Internal(format!(
            "Failed to {} journal {}: {}",
            action,
            self.path.display(),
            e
        ))
    }
}

#[async_trait]
impl DeadLetterJournal for FileJournal {
    fn journal_name(&self) -> &'static str {
        "file"
    }

    #[instrument(skip(self, record), level = "debug", fields(path = %self.path.display()))]
    async fn record(&self, record: &DeadLetterRecord) -> Result<(), CourierError> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let _guard = self.write_lock.lock().await;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| self.io_error("create directory for", e))?;
            }
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| self.io_error("open", e))?;
        file.write_all(&line)
            .await
            .map_err(|e| self.io_error("append to", e))?;
        file.sync_data()
            .await
            .map_err(|e| self.io_error("sync", e))?;

        debug!("Appended {} bytes to dead-letter journal", line.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use courier_core::{Acknowledger, Delivery};
    use tempfile::TempDir;

    struct NoopAcker;

    #[async_trait]
    impl Acknowledger for NoopAcker {
        async fn ack(&self, _: u64) -> Result<(), CourierError> {
            Ok(())
        }
        async fn reject(&self, _: u64, _: bool) -> Result<(), CourierError> {
            Ok(())
        }
    }

    fn sample(payload: &'static str) -> DeadLetterRecord {
        let mut delivery = Delivery::new(1, "dead.letter.queue", Arc::new(NoopAcker));
        delivery.payload = bytes::Bytes::from(payload);
        delivery.message_id = Some(format!("msg-{}", payload));
        DeadLetterRecord::from_delivery(&delivery)
    }

    #[tokio::test]
    async fn test_file_journal_appends_lines() {
        let temp = TempDir::new().unwrap();
        let journal = FileJournal::new(temp.path().join("dlq").join("journal.jsonl"));

        assert!(journal.read_all().await.unwrap().is_empty());

        journal.record(&sample("first")).await.unwrap();
        journal.record(&sample("second")).await.unwrap();

        let records = journal.read_all().await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].payload_text.as_deref(), Some("first"));
        assert_eq!(records[1].message_id.as_deref(), Some("msg-second"));
        assert_eq!(records[1].payload_bytes().unwrap(), b"second".to_vec());
    }

    #[tokio::test]
    async fn test_memory_journal_failure_toggle() {
        let journal = MemoryJournal::new();
        journal.set_failing(true);
        assert!(journal.record(&sample("x")).await.is_err());
        assert!(journal.is_empty());

        journal.set_failing(false);
        journal.record(&sample("x")).await.unwrap();
        assert_eq!(journal.len(), 1);
    }
}
