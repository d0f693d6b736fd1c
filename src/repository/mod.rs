//! Persistence capability consumed by the sync engine.
//!
//! [`Repository`] covers source bookkeeping and reads; [`RepositoryTx`] is
//! the transactional scope a pipeline holds for exactly one publisher
//! file. Header validation, object writes, and the source version bump all
//! happen inside one transaction, so a mid-file failure rolls the mirror
//! back to its previous version.

pub mod memory;
pub mod sql;

use async_trait::async_trait;
use thiserror::Error;

use crate::notification::{FileHeader, NotificationFile};
use crate::rpsl::RpslObject;
use crate::source::{NotificationHistoryEntry, NrtmSource};

pub use memory::MemoryRepository;
pub use sql::SqlRepository;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("not found")]
    NotFound,
    #[error("storage backend error: {0}")]
    Backend(String),
    #[error("connection error: {0}")]
    Connection(String),
    #[error("transaction is no longer usable")]
    TransactionClosed,
}

/// Persistent store for mirrored sources and their RPSL objects.
#[async_trait]
pub trait Repository: Send + Sync {
    /// Persist a brand-new source and record the notification that created
    /// it. Returns the source with its assigned id.
    async fn save_new_source(
        &self,
        source: NrtmSource,
        notification: &NotificationFile,
    ) -> Result<NrtmSource, RepositoryError>;

    async fn get_source_by_name_and_label(
        &self,
        name: &str,
        label: &str,
    ) -> Result<Option<NrtmSource>, RepositoryError>;

    async fn get_source_by_url_and_label(
        &self,
        url: &str,
        label: &str,
    ) -> Result<Option<NrtmSource>, RepositoryError>;

    async fn list_sources(&self) -> Result<Vec<NrtmSource>, RepositoryError>;

    /// Notification history entries for `source` with version in
    /// `from..=to`, newest first.
    async fn get_notification_history(
        &self,
        source: &NrtmSource,
        from: u32,
        to: u32,
    ) -> Result<Vec<NotificationHistoryEntry>, RepositoryError>;

    /// Update a source's mutable metadata (label). Does not touch version
    /// or history.
    async fn update_source(&self, source: &NrtmSource) -> Result<(), RepositoryError>;

    /// Open a transaction scoping the ingestion of one publisher file.
    async fn begin(&self) -> Result<Box<dyn RepositoryTx>, RepositoryError>;
}

/// Transactional scope for one snapshot or delta file.
///
/// Dropping an uncommitted transaction rolls it back.
#[async_trait]
pub trait RepositoryTx: Send {
    /// Upsert the source (version bump) and append a notification history
    /// entry.
    async fn save_source(
        &mut self,
        source: &NrtmSource,
        notification: &NotificationFile,
    ) -> Result<(), RepositoryError>;

    /// Bulk-insert a chunk of snapshot objects.
    async fn save_snapshot_objects(
        &mut self,
        source: &NrtmSource,
        objects: Vec<RpslObject>,
        header: &FileHeader,
    ) -> Result<(), RepositoryError>;

    /// Insert or replace the current object identified by
    /// `(source, class, primary_key)`.
    async fn add_modify_object(
        &mut self,
        source: &NrtmSource,
        object: RpslObject,
        header: &FileHeader,
    ) -> Result<(), RepositoryError>;

    /// Remove the current object identified by
    /// `(source, class, primary_key)`.
    async fn delete_object(
        &mut self,
        source: &NrtmSource,
        object_class: &str,
        primary_key: &str,
        header: &FileHeader,
    ) -> Result<(), RepositoryError>;

    async fn commit(self: Box<Self>) -> Result<(), RepositoryError>;

    async fn rollback(self: Box<Self>) -> Result<(), RepositoryError>;
}
