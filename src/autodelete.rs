use crate::fsio::{self, FileLock, StoreError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tokio::sync::Mutex;

/// Сообщение в чате пользователя, которое надо удалить после `delete_at`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledDelete {
    pub chat_id: i64,
    pub message_id: i32,
    pub delete_at: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Doc {
    entries: Vec<ScheduledDelete>,
}

/* ====== Очередь автоудаления выданных постов ======
   Тот же порядок, что и у заявок: лок файла → загрузка → изменение → сохранение. */
#[derive(Clone)]
pub struct AutoDeleteLedger {
    inner: Arc<Inner>,
}

struct Inner {
    path: PathBuf,
    lock_timeout: Duration,
    writer: Mutex<()>,
}

impl AutoDeleteLedger {
    pub fn new(path: impl Into<PathBuf>, lock_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner { path: path.into(), lock_timeout, writer: Mutex::new(()) }),
        }
    }

    pub fn in_dir(dir: &Path, lock_timeout: Duration) -> Self {
        Self::new(dir.join("autodelete.json"), lock_timeout)
    }

    async fn update<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Doc) -> T + Send + 'static,
        T: Send + 'static,
    {
        let _writer = self.inner.writer.lock().await;
        let path = self.inner.path.clone();
        let timeout = self.inner.lock_timeout;
        fsio::blocking(move || {
            let _lock = FileLock::exclusive(&path, timeout)?;
            let mut doc: Doc = fsio::read_json_or_default(&path)?;
            let out = op(&mut doc);
            fsio::write_json_atomic(&path, &doc)?;
            Ok(out)
        })
        .await
    }

    pub async fn schedule(
        &self,
        chat_id: i64,
        message_id: i32,
        delete_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.update(move |doc| {
            doc.entries.push(ScheduledDelete { chat_id, message_id, delete_at });
        })
        .await
    }

    /// Забрать (и убрать из очереди) всё, чей срок наступил.
    pub async fn take_due(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledDelete>, StoreError> {
        self.update(move |doc| {
            let (due, rest): (Vec<_>, Vec<_>) =
                doc.entries.drain(..).partition(|e| e.delete_at <= now);
            doc.entries = rest;
            due
        })
        .await
    }

    pub async fn len(&self) -> Result<usize, StoreError> {
        let path = self.inner.path.clone();
        let timeout = self.inner.lock_timeout;
        fsio::blocking(move || {
            let _lock = FileLock::shared(&path, timeout)?;
            let doc: Doc = fsio::read_json_or_default(&path)?;
            Ok(doc.entries.len())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;
    use tempfile::TempDir;

    #[tokio::test]
    async fn take_due_returns_only_expired_entries_once() {
        let dir = TempDir::new().unwrap();
        let ledger = AutoDeleteLedger::in_dir(dir.path(), Duration::from_millis(500));
        let now = Utc::now();
        ledger.schedule(1, 10, now - TimeDelta::seconds(5)).await.unwrap();
        ledger.schedule(1, 11, now + TimeDelta::minutes(10)).await.unwrap();
        ledger.schedule(2, 12, now).await.unwrap();

        let due = ledger.take_due(now).await.unwrap();
        let ids: Vec<_> = due.iter().map(|e| e.message_id).collect();
        assert_eq!(ids, vec![10, 12]);
        assert_eq!(ledger.len().await.unwrap(), 1);
        assert!(ledger.take_due(now).await.unwrap().is_empty());

        let later = ledger.take_due(now + TimeDelta::hours(1)).await.unwrap();
        assert_eq!(later[0].message_id, 11);
        assert_eq!(ledger.len().await.unwrap(), 0);
    }
}
