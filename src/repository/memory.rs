//! In-memory repository.
//!
//! Backs the test suites and small experiments. Transactions buffer their
//! writes and apply them on commit, giving the same all-or-nothing
//! behavior per publisher file as the SQL repository.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use super::{Repository, RepositoryError, RepositoryTx};
use crate::notification::{FileHeader, NotificationFile};
use crate::rpsl::RpslObject;
use crate::source::{now_millis, NotificationHistoryEntry, NrtmSource};

/// `(source_id, object_class, primary_key)`
type ObjectKey = (i64, String, String);

struct Inner {
    sources: DashMap<i64, NrtmSource>,
    objects: DashMap<ObjectKey, RpslObject>,
    history: DashMap<i64, Vec<NotificationHistoryEntry>>,
    next_id: AtomicI64,
}

#[derive(Clone)]
pub struct MemoryRepository {
    inner: Arc<Inner>,
}

impl MemoryRepository {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                sources: DashMap::new(),
                objects: DashMap::new(),
                history: DashMap::new(),
                next_id: AtomicI64::new(1),
            }),
        }
    }

    /// Number of current RPSL objects across all sources.
    #[must_use]
    pub fn object_count(&self) -> usize {
        self.inner.objects.len()
    }

    /// Current object for `(source_id, class, primary_key)`, if any.
    #[must_use]
    pub fn get_object(&self, source_id: i64, class: &str, primary_key: &str) -> Option<RpslObject> {
        self.inner
            .objects
            .get(&(source_id, class.to_ascii_lowercase(), primary_key.to_string()))
            .map(|r| r.value().clone())
    }
}

impl Default for MemoryRepository {
    fn default() -> Self {
        Self::new()
    }
}

fn notification_payload(notification: &NotificationFile) -> Result<String, RepositoryError> {
    serde_json::to_string(notification).map_err(|e| RepositoryError::Backend(e.to_string()))
}

impl Inner {
    fn record_history(&self, source_id: i64, version: u32, payload: String) {
        self.history
            .entry(source_id)
            .or_default()
            .push(NotificationHistoryEntry {
                source_id,
                version,
                created: now_millis(),
                payload,
            });
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn save_new_source(
        &self,
        mut source: NrtmSource,
        notification: &NotificationFile,
    ) -> Result<NrtmSource, RepositoryError> {
        let payload = notification_payload(notification)?;
        source.id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        self.inner.sources.insert(source.id, source.clone());
        self.inner.record_history(source.id, source.version, payload);
        Ok(source)
    }

    async fn get_source_by_name_and_label(
        &self,
        name: &str,
        label: &str,
    ) -> Result<Option<NrtmSource>, RepositoryError> {
        Ok(self
            .inner
            .sources
            .iter()
            .find(|r| r.source == name && r.label == label)
            .map(|r| r.value().clone()))
    }

    async fn get_source_by_url_and_label(
        &self,
        url: &str,
        label: &str,
    ) -> Result<Option<NrtmSource>, RepositoryError> {
        Ok(self
            .inner
            .sources
            .iter()
            .find(|r| r.notification_url == url && r.label == label)
            .map(|r| r.value().clone()))
    }

    async fn list_sources(&self) -> Result<Vec<NrtmSource>, RepositoryError> {
        let mut sources: Vec<NrtmSource> =
            self.inner.sources.iter().map(|r| r.value().clone()).collect();
        sources.sort_by(|a, b| (&a.source, &a.label).cmp(&(&b.source, &b.label)));
        Ok(sources)
    }

    async fn get_notification_history(
        &self,
        source: &NrtmSource,
        from: u32,
        to: u32,
    ) -> Result<Vec<NotificationHistoryEntry>, RepositoryError> {
        let mut entries: Vec<NotificationHistoryEntry> = self
            .inner
            .history
            .get(&source.id)
            .map(|h| {
                h.iter()
                    .filter(|e| e.version >= from && e.version <= to)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        entries.sort_by(|a, b| b.version.cmp(&a.version));
        Ok(entries)
    }

    async fn update_source(&self, source: &NrtmSource) -> Result<(), RepositoryError> {
        let mut entry = self
            .inner
            .sources
            .get_mut(&source.id)
            .ok_or(RepositoryError::NotFound)?;
        *entry = source.clone();
        Ok(())
    }

    async fn begin(&self) -> Result<Box<dyn RepositoryTx>, RepositoryError> {
        Ok(Box::new(MemoryTx {
            inner: Arc::clone(&self.inner),
            ops: Vec::new(),
        }))
    }
}

enum TxOp {
    SaveSource {
        source: NrtmSource,
        payload: String,
    },
    PutObjects {
        source_id: i64,
        objects: Vec<RpslObject>,
    },
    DeleteObject {
        source_id: i64,
        class: String,
        primary_key: String,
    },
}

struct MemoryTx {
    inner: Arc<Inner>,
    ops: Vec<TxOp>,
}

#[async_trait]
impl RepositoryTx for MemoryTx {
    async fn save_source(
        &mut self,
        source: &NrtmSource,
        notification: &NotificationFile,
    ) -> Result<(), RepositoryError> {
        self.ops.push(TxOp::SaveSource {
            source: source.clone(),
            payload: notification_payload(notification)?,
        });
        Ok(())
    }

    async fn save_snapshot_objects(
        &mut self,
        source: &NrtmSource,
        objects: Vec<RpslObject>,
        _header: &FileHeader,
    ) -> Result<(), RepositoryError> {
        self.ops.push(TxOp::PutObjects {
            source_id: source.id,
            objects,
        });
        Ok(())
    }

    async fn add_modify_object(
        &mut self,
        source: &NrtmSource,
        object: RpslObject,
        _header: &FileHeader,
    ) -> Result<(), RepositoryError> {
        self.ops.push(TxOp::PutObjects {
            source_id: source.id,
            objects: vec![object],
        });
        Ok(())
    }

    async fn delete_object(
        &mut self,
        source: &NrtmSource,
        object_class: &str,
        primary_key: &str,
        _header: &FileHeader,
    ) -> Result<(), RepositoryError> {
        self.ops.push(TxOp::DeleteObject {
            source_id: source.id,
            class: object_class.to_ascii_lowercase(),
            primary_key: primary_key.to_string(),
        });
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), RepositoryError> {
        for op in self.ops {
            match op {
                TxOp::SaveSource { source, payload } => {
                    let version = source.version;
                    let id = source.id;
                    self.inner.sources.insert(id, source);
                    self.inner.record_history(id, version, payload);
                }
                TxOp::PutObjects { source_id, objects } => {
                    for object in objects {
                        let key = (source_id, object.class.clone(), object.primary_key.clone());
                        self.inner.objects.insert(key, object);
                    }
                }
                TxOp::DeleteObject {
                    source_id,
                    class,
                    primary_key,
                } => {
                    self.inner.objects.remove(&(source_id, class, primary_key));
                }
            }
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), RepositoryError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notification::{FileRef, FileType};
    use crate::rpsl;

    fn notification(version: u32) -> NotificationFile {
        NotificationFile {
            nrtm_version: 4,
            file_type: FileType::Notification,
            source: "EXAMPLE".into(),
            session_id: "sess".into(),
            version,
            timestamp: "2025-01-04T23:01:00Z".into(),
            snapshot: FileRef {
                version,
                url: "https://example.com/s".into(),
                hash: "00".into(),
            },
            deltas: None,
            next_signing_key: None,
        }
    }

    fn header(version: u32) -> FileHeader {
        FileHeader {
            nrtm_version: 4,
            file_type: FileType::Snapshot,
            source: "EXAMPLE".into(),
            session_id: "sess".into(),
            version,
        }
    }

    fn source() -> NrtmSource {
        NrtmSource::from_notification(&notification(1), "", "https://example.com/n.json")
    }

    #[tokio::test]
    async fn test_save_new_source_assigns_ids() {
        let repo = MemoryRepository::new();
        let a = repo.save_new_source(source(), &notification(1)).await.unwrap();
        let mut other = source();
        other.label = "second".into();
        let b = repo.save_new_source(other, &notification(1)).await.unwrap();

        assert!(a.id > 0);
        assert!(b.id > a.id);
        assert_eq!(repo.list_sources().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_lookup_by_name_and_url() {
        let repo = MemoryRepository::new();
        repo.save_new_source(source(), &notification(1)).await.unwrap();

        let by_name = repo
            .get_source_by_name_and_label("EXAMPLE", "")
            .await
            .unwrap();
        assert!(by_name.is_some());

        let by_url = repo
            .get_source_by_url_and_label("https://example.com/n.json", "")
            .await
            .unwrap();
        assert!(by_url.is_some());

        assert!(repo
            .get_source_by_name_and_label("EXAMPLE", "other")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_commit_applies_writes() {
        let repo = MemoryRepository::new();
        let src = repo.save_new_source(source(), &notification(1)).await.unwrap();

        let mut tx = repo.begin().await.unwrap();
        let objects = vec![
            rpsl::parse("route: 192.0.2.0/24\norigin: AS65536\n").unwrap(),
            rpsl::parse("route: 198.51.100.0/24\norigin: AS65537\n").unwrap(),
        ];
        tx.save_snapshot_objects(&src, objects, &header(1)).await.unwrap();
        let mut bumped = src.clone();
        bumped.version = 1;
        tx.save_source(&bumped, &notification(1)).await.unwrap();

        // Nothing visible before commit
        assert_eq!(repo.object_count(), 0);
        tx.commit().await.unwrap();

        assert_eq!(repo.object_count(), 2);
        assert!(repo.get_object(src.id, "route", "192.0.2.0/24").is_some());
        let reloaded = repo
            .get_source_by_name_and_label("EXAMPLE", "")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reloaded.version, 1);
    }

    #[tokio::test]
    async fn test_rollback_discards_writes() {
        let repo = MemoryRepository::new();
        let src = repo.save_new_source(source(), &notification(1)).await.unwrap();

        let mut tx = repo.begin().await.unwrap();
        tx.add_modify_object(
            &src,
            rpsl::parse("route: 192.0.2.0/24\n").unwrap(),
            &header(1),
        )
        .await
        .unwrap();
        tx.rollback().await.unwrap();

        assert_eq!(repo.object_count(), 0);
    }

    #[tokio::test]
    async fn test_delete_removes_current_object() {
        let repo = MemoryRepository::new();
        let src = repo.save_new_source(source(), &notification(1)).await.unwrap();

        let mut tx = repo.begin().await.unwrap();
        tx.add_modify_object(
            &src,
            rpsl::parse("route: 192.0.2.0/24\n").unwrap(),
            &header(1),
        )
        .await
        .unwrap();
        tx.commit().await.unwrap();
        assert_eq!(repo.object_count(), 1);

        let mut tx = repo.begin().await.unwrap();
        // Class matching is case-insensitive
        tx.delete_object(&src, "Route", "192.0.2.0/24", &header(2))
            .await
            .unwrap();
        tx.commit().await.unwrap();
        assert_eq!(repo.object_count(), 0);
    }

    #[tokio::test]
    async fn test_history_window_and_order() {
        let repo = MemoryRepository::new();
        let mut src = repo.save_new_source(source(), &notification(1)).await.unwrap();

        for v in 2..=5 {
            let mut tx = repo.begin().await.unwrap();
            src.version = v;
            tx.save_source(&src, &notification(v)).await.unwrap();
            tx.commit().await.unwrap();
        }

        let entries = repo.get_notification_history(&src, 3, 5).await.unwrap();
        let versions: Vec<u32> = entries.iter().map(|e| e.version).collect();
        assert_eq!(versions, vec![5, 4, 3]);
    }

    #[tokio::test]
    async fn test_update_source_changes_label_only() {
        let repo = MemoryRepository::new();
        let mut src = repo.save_new_source(source(), &notification(1)).await.unwrap();
        src.label = "renamed".into();
        repo.update_source(&src).await.unwrap();

        assert!(repo
            .get_source_by_name_and_label("EXAMPLE", "renamed")
            .await
            .unwrap()
            .is_some());

        let missing = NrtmSource {
            id: 9999,
            ..src.clone()
        };
        assert!(matches!(
            repo.update_source(&missing).await,
            Err(RepositoryError::NotFound)
        ));
    }
}
