// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Mirror coordinator.
//!
//! The [`NrtmProcessor`] owns the progression of a source through a sync:
//! notification download, session/regression checks, snapshot ingestion on
//! first connect, then delta application up to the notification's version.
//!
//! ```text
//! Absent ──connect──▶ Snapshotting ──▶ Synced(v) ──▶ ApplyingDelta(v→v') ──▶ Synced(v')
//!                                         │                   │
//!                                         └──────── Failed ◀──┘
//! ```
//!
//! Operations on the same source are serialized by an advisory lock keyed
//! on the source; concurrent operations on different sources are fine.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::analyzer::find_updates;
use crate::cache::FileCache;
use crate::config::MirrorConfig;
use crate::error::{MirrorError, ProtocolError};
use crate::fetch::Fetcher;
use crate::notification::{FileType, NotificationFile, NRTM_VERSION};
use crate::pipeline::{apply_deltas, ingest_snapshot};
use crate::repository::Repository;
use crate::source::{normalize_label, NrtmSource, SourceDetails};

/// Where a source is in its sync lifecycle. Used for logging and error
/// context; the durable state lives in the repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Absent,
    Snapshotting,
    Synced(u32),
    ApplyingDelta { from: u32, to: u32 },
    Failed,
}

impl std::fmt::Display for SyncState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Absent => write!(f, "Absent"),
            Self::Snapshotting => write!(f, "Snapshotting"),
            Self::Synced(v) => write!(f, "Synced({v})"),
            Self::ApplyingDelta { from, to } => write!(f, "ApplyingDelta({from}->{to})"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// Top-level mirror operations over injected transport and storage.
pub struct NrtmProcessor {
    config: MirrorConfig,
    repository: Arc<dyn Repository>,
    fetcher: Arc<dyn Fetcher>,
    cache: FileCache,
    locks: DashMap<String, Arc<Mutex<()>>>,
    cancel: CancellationToken,
}

impl NrtmProcessor {
    pub fn new(
        config: MirrorConfig,
        repository: Arc<dyn Repository>,
        fetcher: Arc<dyn Fetcher>,
    ) -> Self {
        let cache = FileCache::new(&config.file_cache_dir);
        Self {
            config,
            repository,
            fetcher,
            cache,
            locks: DashMap::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Replace the processor's cancellation token, e.g. with one tied to
    /// process shutdown. Every long-running step observes it.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Connect to a publisher: download the notification, ingest the
    /// current snapshot, then apply any published deltas.
    #[tracing::instrument(skip(self), fields(url = %notification_url, label = %label))]
    pub async fn connect(
        &self,
        notification_url: &str,
        label: &str,
    ) -> Result<NrtmSource, MirrorError> {
        match self.connect_inner(notification_url, label).await {
            Ok(source) => Ok(source),
            Err(e) => {
                error!(state = %SyncState::Failed, error = %e, "connect failed");
                Err(e)
            }
        }
    }

    async fn connect_inner(
        &self,
        notification_url: &str,
        label: &str,
    ) -> Result<NrtmSource, MirrorError> {
        let label = normalize_label(label)?;
        let lock = self.guard(format!("url:{notification_url}#{label}"));
        let _held = lock.lock().await;

        info!(state = %SyncState::Absent, "fetching notification");
        let notification = self.fetcher.get_notification(notification_url).await?;
        validate_notification(&notification)?;

        if self
            .repository
            .get_source_by_url_and_label(notification_url, &label)
            .await?
            .is_some()
            || self
                .repository
                .get_source_by_name_and_label(&notification.source, &label)
                .await?
                .is_some()
        {
            return Err(MirrorError::SourceAlreadyExists);
        }

        info!(source = %notification.source, "saving new source");
        let source = NrtmSource::from_notification(&notification, &label, notification_url);
        let source = self.repository.save_new_source(source, &notification).await?;

        debug!(state = %SyncState::Snapshotting, "state transition");
        let (source, stats) = ingest_snapshot(
            self.repository.as_ref(),
            self.fetcher.as_ref(),
            &self.cache,
            &self.config,
            &source,
            &notification,
            &self.cancel,
        )
        .await?;
        info!(
            state = %SyncState::Synced(source.version),
            inserted = stats.inserted,
            failed = stats.failed,
            "snapshot applied"
        );

        if !notification.has_deltas() {
            return Ok(source);
        }
        self.sync_deltas(notification, source).await
    }

    /// Bring an existing mirror up to date with its publisher.
    #[tracing::instrument(skip(self), fields(source = %source_name, label = %label))]
    pub async fn update(&self, source_name: &str, label: &str) -> Result<NrtmSource, MirrorError> {
        match self.update_inner(source_name, label).await {
            Ok(source) => Ok(source),
            Err(e) => {
                error!(state = %SyncState::Failed, error = %e, "update failed");
                Err(e)
            }
        }
    }

    async fn update_inner(
        &self,
        source_name: &str,
        label: &str,
    ) -> Result<NrtmSource, MirrorError> {
        let label = label.trim();
        let Some(source) = self
            .repository
            .get_source_by_name_and_label(source_name, label)
            .await?
        else {
            warn!("no source with given name and label");
            return Err(MirrorError::NoSuchSource {
                name: source_name.to_string(),
                label: label.to_string(),
            });
        };
        let lock = self.guard(format!("source:{}", source.id));
        let _held = lock.lock().await;

        let notification = self
            .fetcher
            .get_notification(&source.notification_url)
            .await?;
        validate_notification(&notification)?;

        if notification.session_id != source.session_id {
            return Err(ProtocolError::SessionChanged.into());
        }
        if notification.version < source.version {
            return Err(ProtocolError::ServerRegressed {
                server: notification.version,
                local: source.version,
            }
            .into());
        }
        if notification.version == source.version {
            info!(version = source.version, "already at latest version");
            return Ok(source);
        }
        self.sync_deltas(notification, source).await
    }

    async fn sync_deltas(
        &self,
        notification: NotificationFile,
        source: NrtmSource,
    ) -> Result<NrtmSource, MirrorError> {
        let delta_refs = find_updates(&notification, &source)?;
        if delta_refs.is_empty() {
            return Ok(source);
        }
        debug!(
            state = %SyncState::ApplyingDelta {
                from: source.version,
                to: notification.version,
            },
            deltas = delta_refs.len(),
            "state transition"
        );
        let source = apply_deltas(
            self.repository.as_ref(),
            self.fetcher.as_ref(),
            &self.cache,
            &source,
            &notification,
            &delta_refs,
            &self.cancel,
        )
        .await?;
        info!(state = %SyncState::Synced(source.version), "deltas applied");
        Ok(source)
    }

    /// All mirrored sources plus their recent notification history.
    pub async fn list_sources(&self) -> Result<Vec<SourceDetails>, MirrorError> {
        let sources = self.repository.list_sources().await?;
        let mut details = Vec::with_capacity(sources.len());
        for source in sources {
            let (from, to) = SourceDetails::history_range(source.version);
            let notifications = self
                .repository
                .get_notification_history(&source, from, to)
                .await?;
            details.push(SourceDetails {
                source,
                notifications,
            });
        }
        Ok(details)
    }

    /// Rename a mirror's label. Fails if the target label is taken.
    #[tracing::instrument(skip(self), fields(source = %source_name))]
    pub async fn replace_label(
        &self,
        source_name: &str,
        from_label: &str,
        to_label: &str,
    ) -> Result<NrtmSource, MirrorError> {
        let from = from_label.trim();
        let to = normalize_label(to_label)?;

        let Some(mut target) = self
            .repository
            .get_source_by_name_and_label(source_name, from)
            .await?
        else {
            return Err(MirrorError::NoSuchSource {
                name: source_name.to_string(),
                label: from.to_string(),
            });
        };
        let lock = self.guard(format!("source:{}", target.id));
        let _held = lock.lock().await;

        if self
            .repository
            .get_source_by_name_and_label(source_name, &to)
            .await?
            .is_some()
        {
            return Err(MirrorError::SourceAlreadyExists);
        }

        target.label = to;
        self.repository.update_source(&target).await?;
        info!(label = %target.label, "label replaced");
        Ok(target)
    }

    fn guard(&self, key: String) -> Arc<Mutex<()>> {
        self.locks
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

fn validate_notification(notification: &NotificationFile) -> Result<(), ProtocolError> {
    if notification.nrtm_version != NRTM_VERSION {
        return Err(ProtocolError::NrtmVersionMismatch);
    }
    if notification.file_type != FileType::Notification {
        return Err(ProtocolError::FileTypeMismatch);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notification::FileRef;

    fn notification() -> NotificationFile {
        NotificationFile {
            nrtm_version: 4,
            file_type: FileType::Notification,
            source: "EXAMPLE".into(),
            session_id: "sess".into(),
            version: 1,
            timestamp: "t".into(),
            snapshot: FileRef {
                version: 1,
                url: "u".into(),
                hash: "h".into(),
            },
            deltas: None,
            next_signing_key: None,
        }
    }

    #[test]
    fn test_validate_notification() {
        assert!(validate_notification(&notification()).is_ok());

        let mut bad = notification();
        bad.nrtm_version = 3;
        assert_eq!(
            validate_notification(&bad),
            Err(ProtocolError::NrtmVersionMismatch)
        );

        let mut bad = notification();
        bad.file_type = FileType::Snapshot;
        assert_eq!(
            validate_notification(&bad),
            Err(ProtocolError::FileTypeMismatch)
        );
    }

    #[test]
    fn test_sync_state_display() {
        assert_eq!(format!("{}", SyncState::Absent), "Absent");
        assert_eq!(format!("{}", SyncState::Synced(7)), "Synced(7)");
        assert_eq!(
            format!("{}", SyncState::ApplyingDelta { from: 7, to: 9 }),
            "ApplyingDelta(7->9)"
        );
        assert_eq!(format!("{}", SyncState::Failed), "Failed");
    }
}
