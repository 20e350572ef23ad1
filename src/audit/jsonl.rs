//! JSON-lines audit backend: one `<run_id>.jsonl` file per run

use super::{AuditEntry, AuditEvent, AuditLog};
use crate::store::StoreError;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

/// Audit log persisted under `<data_dir>/audit`
pub struct JsonlAuditLog {
    dir: PathBuf,
    /// Last assigned sequence; the lock also serialises appends
    sequence: Mutex<u64>,
}

impl JsonlAuditLog {
    /// Open (or create) the log, resuming the sequence after the highest stored event
    pub async fn open(data_dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = data_dir.as_ref().join("audit");
        tokio::fs::create_dir_all(&dir).await?;

        let mut highest = 0;
        let mut files = 0usize;
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                continue;
            }
            files += 1;
            truncate_torn_tail(&path).await?;
            for event in read_events(&path).await? {
                highest = highest.max(event.sequence);
            }
        }
        info!(
            path = %dir.display(),
            runs = files,
            last_sequence = highest,
            "Opened audit log"
        );

        Ok(Self {
            dir,
            sequence: Mutex::new(highest),
        })
    }

    fn run_path(&self, run_id: Uuid) -> PathBuf {
        self.dir.join(format!("{run_id}.jsonl"))
    }
}

/// Drop bytes after the last newline so the next append starts on a fresh line
async fn truncate_torn_tail(path: &Path) -> Result<(), StoreError> {
    let raw = tokio::fs::read(path).await?;
    let keep = raw.iter().rposition(|b| *b == b'\n').map_or(0, |i| i + 1);
    if keep == raw.len() {
        return Ok(());
    }

    warn!(
        path = %path.display(),
        dropped_bytes = raw.len() - keep,
        "Truncating torn audit line"
    );
    let file = tokio::fs::OpenOptions::new().write(true).open(path).await?;
    file.set_len(keep as u64).await?;
    file.sync_all().await?;
    Ok(())
}

/// Parse a run file, skipping lines torn by a crash mid-append
async fn read_events(path: &Path) -> Result<Vec<AuditEvent>, StoreError> {
    let raw = match tokio::fs::read_to_string(path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut events = Vec::new();
    for (index, line) in raw.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<AuditEvent>(line) {
            Ok(event) => events.push(event),
            Err(e) => warn!(
                path = %path.display(),
                line = index + 1,
                error = %e,
                "Skipping unreadable audit line"
            ),
        }
    }
    events.sort_by_key(|e| e.sequence);
    Ok(events)
}

#[async_trait]
impl AuditLog for JsonlAuditLog {
    async fn append(&self, entry: AuditEntry) -> Result<AuditEvent, StoreError> {
        let mut sequence = self.sequence.lock().await;
        let event = entry.into_event(*sequence + 1);

        let mut line =
            serde_json::to_vec(&event).map_err(|e| StoreError::Corrupt(e.to_string()))?;
        line.push(b'\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.run_path(event.run_id))
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;

        *sequence = event.sequence;
        Ok(event)
    }

    async fn events_for_run(&self, run_id: Uuid) -> Result<Vec<AuditEvent>, StoreError> {
        read_events(&self.run_path(run_id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditEventType;
    use serde_json::json;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_events_persist_across_reopen() {
        let dir = TempDir::new().unwrap();
        let run = Uuid::new_v4();
        let task = Uuid::new_v4();
        {
            let log = JsonlAuditLog::open(dir.path()).await.unwrap();
            log.append(AuditEntry::run(run, AuditEventType::RunSubmitted))
                .await
                .unwrap();
            log.append(
                AuditEntry::task(run, task, AuditEventType::TaskEnqueued)
                    .with_detail(json!({"stage": "analyse"})),
            )
            .await
            .unwrap();
        }

        let log = JsonlAuditLog::open(dir.path()).await.unwrap();
        let next = log
            .append(AuditEntry::task(run, task, AuditEventType::TaskDispatched))
            .await
            .unwrap();
        assert_eq!(next.sequence, 3);

        let events = log.events_for_run(run).await.unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events[1].detail["stage"], "analyse");
        assert_eq!(log.non_terminal_tasks(run).await.unwrap(), vec![task]);
    }

    #[tokio::test]
    async fn test_append_after_torn_line_is_kept() {
        let dir = TempDir::new().unwrap();
        let run = Uuid::new_v4();
        {
            let log = JsonlAuditLog::open(dir.path()).await.unwrap();
            log.append(AuditEntry::run(run, AuditEventType::RunSubmitted))
                .await
                .unwrap();
        }
        let path = dir.path().join("audit").join(format!("{run}.jsonl"));
        let mut file = tokio::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .await
            .unwrap();
        file.write_all(b"{\"event_id\":").await.unwrap();
        file.flush().await.unwrap();

        let log = JsonlAuditLog::open(dir.path()).await.unwrap();
        assert_eq!(log.events_for_run(run).await.unwrap().len(), 1);

        let recovered = log
            .append(AuditEntry::run(run, AuditEventType::RunRecovered))
            .await
            .unwrap();
        assert_eq!(recovered.sequence, 2);

        let events = log.events_for_run(run).await.unwrap();
        let types: Vec<AuditEventType> = events.iter().map(|e| e.event_type).collect();
        assert_eq!(
            types,
            vec![AuditEventType::RunSubmitted, AuditEventType::RunRecovered]
        );
        let raw = tokio::fs::read_to_string(&path).await.unwrap();
        assert!(!raw.contains("{\"event_id\":{"), "torn bytes left in {raw}");
    }

    #[tokio::test]
    async fn test_unparsable_middle_line_is_skipped() {
        let dir = TempDir::new().unwrap();
        let run = Uuid::new_v4();
        let path = dir.path().join("audit").join(format!("{run}.jsonl"));
        let log = JsonlAuditLog::open(dir.path()).await.unwrap();
        log.append(AuditEntry::run(run, AuditEventType::RunSubmitted))
            .await
            .unwrap();
        let mut file = tokio::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .await
            .unwrap();
        file.write_all(b"not json\n").await.unwrap();
        file.flush().await.unwrap();
        log.append(AuditEntry::run(run, AuditEventType::RunCompleted))
            .await
            .unwrap();

        assert_eq!(log.events_for_run(run).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_unknown_run_has_no_events() {
        let dir = TempDir::new().unwrap();
        let log = JsonlAuditLog::open(dir.path()).await.unwrap();
        assert!(log.events_for_run(Uuid::new_v4()).await.unwrap().is_empty());
    }
}
