// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Delta application.
//!
//! Deltas are applied strictly one file at a time, in ascending version
//! order, and entries within a file in stream order. Each delta file is
//! one transaction: the header-driven version bump and the body commit
//! together, so a failure mid-file leaves the source at the last fully
//! applied version.

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{next_record, spawn_record_reader, validate_delta_header};
use crate::cache::FileCache;
use crate::error::{MirrorError, ProtocolError};
use crate::fetch::Fetcher;
use crate::jsonseq::JsonSeqError;
use crate::notification::{DeltaEntry, FileHeader, FileRef, NotificationFile};
use crate::repository::{Repository, RepositoryTx};
use crate::rpsl;
use crate::source::NrtmSource;

/// Deltas are small files; a fixed channel bound is plenty.
const RECORD_CHANNEL_CAPACITY: usize = 64;

/// Apply `delta_refs` to `source` in ascending version order, returning
/// the source at its final version.
pub async fn apply_deltas(
    repository: &dyn Repository,
    fetcher: &dyn Fetcher,
    cache: &FileCache,
    source: &NrtmSource,
    notification: &NotificationFile,
    delta_refs: &[FileRef],
    cancel: &CancellationToken,
) -> Result<NrtmSource, MirrorError> {
    let mut refs = delta_refs.to_vec();
    refs.sort_by_key(|r| r.version);

    let mut current = source.clone();
    for delta_ref in &refs {
        info!(version = delta_ref.version, url = %delta_ref.url, "processing delta");
        current = apply_one(repository, fetcher, cache, &current, notification, delta_ref, cancel)
            .await?;
    }
    debug!(source = %current.source, version = current.version, "finished syncing deltas");
    Ok(current)
}

async fn apply_one(
    repository: &dyn Repository,
    fetcher: &dyn Fetcher,
    cache: &FileCache,
    source: &NrtmSource,
    notification: &NotificationFile,
    delta_ref: &FileRef,
    cancel: &CancellationToken,
) -> Result<NrtmSource, MirrorError> {
    let path = cache.fetch_and_verify(fetcher, delta_ref, cancel).await?;
    let mut records = spawn_record_reader(path, RECORD_CHANNEL_CAPACITY, cancel.child_token());

    let header_bytes = next_record(&mut records)
        .await
        .ok_or(MirrorError::Record(JsonSeqError::TruncatedRecord))??;
    let header: FileHeader = serde_json::from_slice(&header_bytes)?;
    validate_delta_header(&header, source, delta_ref)?;

    let mut bumped = source.clone();
    bumped.version = delta_ref.version;

    let mut tx = repository.begin().await?;
    let outcome: Result<usize, MirrorError> = async {
        tx.save_source(&bumped, notification).await?;
        let mut applied = 0usize;
        while let Some(record) = next_record(&mut records).await {
            if cancel.is_cancelled() {
                return Err(MirrorError::Cancelled);
            }
            let bytes = record?;
            let entry: DeltaEntry = serde_json::from_slice(&bytes)?;
            apply_entry(&mut tx, &bumped, &header, entry).await?;
            applied += 1;
        }
        Ok(applied)
    }
    .await;

    match outcome {
        Ok(applied) => {
            tx.commit().await?;
            debug!(version = bumped.version, applied, "delta committed");
            Ok(bumped)
        }
        Err(e) => {
            let _ = tx.rollback().await;
            Err(e)
        }
    }
}

async fn apply_entry(
    tx: &mut Box<dyn RepositoryTx>,
    source: &NrtmSource,
    header: &FileHeader,
    entry: DeltaEntry,
) -> Result<(), MirrorError> {
    match entry.action.as_str() {
        DeltaEntry::ADD_MODIFY => {
            let text = entry
                .object
                .ok_or(MirrorError::MissingDeltaField("object"))?;
            let object = rpsl::parse(&text)?;
            tx.add_modify_object(source, object, header).await?;
        }
        DeltaEntry::DELETE => {
            let class = entry
                .object_class
                .ok_or(MirrorError::MissingDeltaField("object_class"))?;
            let primary_key = entry
                .primary_key
                .ok_or(MirrorError::MissingDeltaField("primary_key"))?;
            tx.delete_object(source, &class, &primary_key, header).await?;
        }
        other => {
            return Err(ProtocolError::UnknownDeltaAction(other.to_string()).into());
        }
    }
    Ok(())
}
