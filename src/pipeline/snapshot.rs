// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Snapshot ingestion.
//!
//! A snapshot is the full object set of a source at one version. Ingestion
//! fans RPSL parsing out across a semaphore-bounded pool of tasks (the
//! record order carries no meaning inside a snapshot, so parsed objects
//! may be persisted in any order), collects parsed objects into the
//! [`ObjectBatcher`], and writes fixed-size chunks to the repository.
//!
//! The whole file is one transaction: header, every object chunk, and the
//! source version bump commit together or not at all. Individual objects
//! that fail to parse are counted and logged, never fatal — a snapshot is
//! best-effort complete.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{next_record, spawn_record_reader, validate_snapshot_header};
use crate::batch::ObjectBatcher;
use crate::cache::FileCache;
use crate::config::MirrorConfig;
use crate::error::MirrorError;
use crate::fetch::Fetcher;
use crate::jsonseq::JsonSeqError;
use crate::notification::{FileHeader, NotificationFile, SnapshotObject};
use crate::repository::{Repository, RepositoryTx};
use crate::rpsl::{self, RpslObject};
use crate::source::NrtmSource;

/// Outcome counters for one snapshot ingestion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotStats {
    /// Objects parsed and persisted
    pub inserted: usize,
    /// Records that failed to parse (logged, not fatal)
    pub failed: usize,
}

/// Download, verify, and ingest the snapshot referenced by `notification`,
/// leaving the source at the snapshot's version.
pub async fn ingest_snapshot(
    repository: &dyn Repository,
    fetcher: &dyn Fetcher,
    cache: &FileCache,
    config: &MirrorConfig,
    source: &NrtmSource,
    notification: &NotificationFile,
    cancel: &CancellationToken,
) -> Result<(NrtmSource, SnapshotStats), MirrorError> {
    let path = cache
        .fetch_and_verify(fetcher, &notification.snapshot, cancel)
        .await?;

    let mut records =
        spawn_record_reader(path, config.record_channel_capacity(), cancel.child_token());

    let header_bytes = next_record(&mut records)
        .await
        .ok_or(MirrorError::Record(JsonSeqError::TruncatedRecord))??;
    let header: FileHeader = serde_json::from_slice(&header_bytes)?;
    validate_snapshot_header(&header, source, &notification.snapshot)?;

    let mut tx = repository.begin().await?;
    let outcome = snapshot_body(
        &mut tx,
        config,
        source,
        notification,
        &header,
        &mut records,
        cancel,
    )
    .await;

    match outcome {
        Ok(stats) => {
            tx.commit().await?;
            let mut updated = source.clone();
            updated.version = header.version;
            info!(
                source = %updated.source,
                version = updated.version,
                inserted = stats.inserted,
                failed = stats.failed,
                "snapshot ingested"
            );
            Ok((updated, stats))
        }
        Err(e) => {
            let _ = tx.rollback().await;
            Err(e)
        }
    }
}

async fn snapshot_body(
    tx: &mut Box<dyn RepositoryTx>,
    config: &MirrorConfig,
    source: &NrtmSource,
    notification: &NotificationFile,
    header: &FileHeader,
    records: &mut mpsc::Receiver<Result<Vec<u8>, JsonSeqError>>,
    cancel: &CancellationToken,
) -> Result<SnapshotStats, MirrorError> {
    let semaphore = Arc::new(Semaphore::new(config.parser_workers.max(1)));
    let batcher = Arc::new(Mutex::new(ObjectBatcher::new(config.insert_batch_size)));
    let failed = Arc::new(AtomicUsize::new(0));
    let mut workers: JoinSet<()> = JoinSet::new();
    let mut inserted = 0usize;

    while let Some(record) = next_record(records).await {
        if cancel.is_cancelled() {
            workers.abort_all();
            return Err(MirrorError::Cancelled);
        }
        let bytes = record?;

        let Ok(permit) = semaphore.clone().acquire_owned().await else {
            break;
        };
        let task_batcher = Arc::clone(&batcher);
        let task_failed = Arc::clone(&failed);
        workers.spawn(async move {
            let _permit = permit;
            match parse_record(&bytes) {
                Ok(object) => task_batcher.lock().await.push(object),
                Err(e) => {
                    task_failed.fetch_add(1, Ordering::Relaxed);
                    warn!(error = %e, "snapshot object rejected");
                }
            }
        });

        // Single drainer: hand a full chunk to the store as soon as the
        // workers have produced one.
        let chunk = batcher.lock().await.take_chunk();
        if let Some(chunk) = chunk {
            inserted += chunk.len();
            debug!(chunk = chunk.len(), total = inserted, "persisting snapshot chunk");
            tx.save_snapshot_objects(source, chunk, header).await?;
        }
    }

    // Join outstanding parsers, then flush the remainder
    while workers.join_next().await.is_some() {}
    if cancel.is_cancelled() {
        return Err(MirrorError::Cancelled);
    }
    loop {
        let chunk = batcher.lock().await.take_chunk();
        match chunk {
            Some(chunk) => {
                inserted += chunk.len();
                tx.save_snapshot_objects(source, chunk, header).await?;
            }
            None => break,
        }
    }
    let rest = batcher.lock().await.drain_all();
    if !rest.is_empty() {
        inserted += rest.len();
        tx.save_snapshot_objects(source, rest, header).await?;
    }

    let mut updated = source.clone();
    updated.version = header.version;
    tx.save_source(&updated, notification).await?;

    Ok(SnapshotStats {
        inserted,
        failed: failed.load(Ordering::Relaxed),
    })
}

fn parse_record(bytes: &[u8]) -> Result<RpslObject, MirrorError> {
    let record: SnapshotObject = serde_json::from_slice(bytes)?;
    Ok(rpsl::parse(&record.object)?)
}
