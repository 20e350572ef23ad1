use super::{AuditEntry, AuditEvent, AuditLog};
use crate::store::StoreError;
use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Audit log held in memory
#[derive(Default)]
pub struct InMemoryAuditLog {
    events: RwLock<Vec<AuditEvent>>,
}

impl InMemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every event across all runs, in append order
    pub async fn all_events(&self) -> Vec<AuditEvent> {
        self.events.read().await.clone()
    }
}

#[async_trait]
impl AuditLog for InMemoryAuditLog {
    async fn append(&self, entry: AuditEntry) -> Result<AuditEvent, StoreError> {
        let mut events = self.events.write().await;
        let event = entry.into_event(events.len() as u64 + 1);
        events.push(event.clone());
        Ok(event)
    }

    async fn events_for_run(&self, run_id: Uuid) -> Result<Vec<AuditEvent>, StoreError> {
        Ok(self
            .events
            .read()
            .await
            .iter()
            .filter(|e| e.run_id == run_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditEventType;

    #[tokio::test]
    async fn test_sequence_is_global_and_monotonic() {
        let log = InMemoryAuditLog::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        log.append(AuditEntry::run(a, AuditEventType::RunSubmitted))
            .await
            .unwrap();
        log.append(AuditEntry::run(b, AuditEventType::RunSubmitted))
            .await
            .unwrap();
        let last = log
            .append(AuditEntry::run(a, AuditEventType::RunCompleted))
            .await
            .unwrap();
        assert_eq!(last.sequence, 3);

        let for_a = log.events_for_run(a).await.unwrap();
        assert_eq!(for_a.len(), 2);
        assert!(for_a[0].sequence < for_a[1].sequence);
        assert_eq!(log.all_events().await.len(), 3);
    }

    #[tokio::test]
    async fn test_non_terminal_tasks_query() {
        let log = InMemoryAuditLog::new();
        let run = Uuid::new_v4();
        let task = Uuid::new_v4();
        log.append(AuditEntry::task(run, task, AuditEventType::TaskDispatched))
            .await
            .unwrap();
        assert_eq!(log.non_terminal_tasks(run).await.unwrap(), vec![task]);

        log.append(AuditEntry::task(run, task, AuditEventType::TaskSucceeded))
            .await
            .unwrap();
        assert!(log.non_terminal_tasks(run).await.unwrap().is_empty());
    }
}
