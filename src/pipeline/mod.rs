// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Ingestion pipelines for publisher files.
//!
//! Both pipelines share the same front end: the cached file is read on the
//! blocking path by the JSON-sequence reader, which feeds raw records
//! through a bounded channel to the async side. The channel bound is the
//! backpressure mechanism — when parsing or persistence falls behind, the
//! reader stalls instead of buffering the file in memory.

pub mod delta;
pub mod snapshot;

pub use delta::apply_deltas;
pub use snapshot::{ingest_snapshot, SnapshotStats};

use std::path::PathBuf;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::cache;
use crate::error::ProtocolError;
use crate::jsonseq::{JsonSeqError, JsonSeqReader};
use crate::notification::{FileHeader, FileRef, FileType, NRTM_VERSION};
use crate::source::NrtmSource;

pub(crate) fn validate_snapshot_header(
    header: &FileHeader,
    source: &NrtmSource,
    snapshot_ref: &FileRef,
) -> Result<(), ProtocolError> {
    if header.nrtm_version != NRTM_VERSION {
        return Err(ProtocolError::NrtmVersionMismatch);
    }
    if header.file_type != FileType::Snapshot {
        return Err(ProtocolError::FileTypeMismatch);
    }
    if header.session_id != source.session_id {
        return Err(ProtocolError::SessionIdMismatch);
    }
    if header.source != source.source {
        return Err(ProtocolError::SourceNameMismatch);
    }
    if header.version != snapshot_ref.version {
        return Err(ProtocolError::FileVersionMismatch);
    }
    Ok(())
}

pub(crate) fn validate_delta_header(
    header: &FileHeader,
    source: &NrtmSource,
    delta_ref: &FileRef,
) -> Result<(), ProtocolError> {
    if header.nrtm_version != NRTM_VERSION {
        return Err(ProtocolError::NrtmVersionMismatch);
    }
    if header.file_type != FileType::Delta {
        return Err(ProtocolError::FileTypeMismatch);
    }
    if header.session_id != source.session_id {
        return Err(ProtocolError::SessionIdMismatch);
    }
    if header.source != source.source {
        return Err(ProtocolError::SourceNameMismatch);
    }
    if header.version != delta_ref.version {
        return Err(ProtocolError::FileVersionMismatch);
    }
    if header.version < source.version {
        return Err(ProtocolError::FileVersionInconsistency);
    }
    Ok(())
}

/// Run the JSON-sequence reader over a cached file on the blocking pool,
/// feeding records into a bounded channel. The reader stops when the file
/// is exhausted, the consumer hangs up, or the token is cancelled.
pub(crate) fn spawn_record_reader(
    path: PathBuf,
    capacity: usize,
    cancel: CancellationToken,
) -> mpsc::Receiver<Result<Vec<u8>, JsonSeqError>> {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    tokio::task::spawn_blocking(move || {
        let reader = match cache::open_decoded(&path) {
            Ok(reader) => reader,
            Err(e) => {
                let _ = tx.blocking_send(Err(JsonSeqError::Io(e)));
                return;
            }
        };
        for record in JsonSeqReader::new(reader) {
            if cancel.is_cancelled() {
                return;
            }
            if tx.blocking_send(record).is_err() {
                return;
            }
        }
    });
    rx
}

/// Next non-empty record from the reader channel. Empty records are legal
/// in the stream but carry nothing to apply, so they are logged and
/// skipped here.
pub(crate) async fn next_record(
    records: &mut mpsc::Receiver<Result<Vec<u8>, JsonSeqError>>,
) -> Option<Result<Vec<u8>, JsonSeqError>> {
    while let Some(item) = records.recv().await {
        if matches!(item, Err(JsonSeqError::EmptyRecord)) {
            warn!("skipping empty record");
            continue;
        }
        return Some(item);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(file_type: FileType, version: u32) -> FileHeader {
        FileHeader {
            nrtm_version: 4,
            file_type,
            source: "EXAMPLE".into(),
            session_id: "sess".into(),
            version,
        }
    }

    fn source() -> NrtmSource {
        NrtmSource {
            id: 1,
            source: "EXAMPLE".into(),
            session_id: "sess".into(),
            version: 3,
            notification_url: "https://example.com/n.json".into(),
            label: String::new(),
            created: 0,
        }
    }

    fn file_ref(version: u32) -> FileRef {
        FileRef {
            version,
            url: "https://example.com/f".into(),
            hash: "00".into(),
        }
    }

    #[test]
    fn test_snapshot_header_valid() {
        let h = header(FileType::Snapshot, 5);
        assert!(validate_snapshot_header(&h, &source(), &file_ref(5)).is_ok());
    }

    #[test]
    fn test_snapshot_header_rejections() {
        let mut h = header(FileType::Snapshot, 5);
        h.nrtm_version = 3;
        assert_eq!(
            validate_snapshot_header(&h, &source(), &file_ref(5)),
            Err(ProtocolError::NrtmVersionMismatch)
        );

        let h = header(FileType::Delta, 5);
        assert_eq!(
            validate_snapshot_header(&h, &source(), &file_ref(5)),
            Err(ProtocolError::FileTypeMismatch)
        );

        let mut h = header(FileType::Snapshot, 5);
        h.session_id = "other".into();
        assert_eq!(
            validate_snapshot_header(&h, &source(), &file_ref(5)),
            Err(ProtocolError::SessionIdMismatch)
        );

        let mut h = header(FileType::Snapshot, 5);
        h.source = "OTHER".into();
        assert_eq!(
            validate_snapshot_header(&h, &source(), &file_ref(5)),
            Err(ProtocolError::SourceNameMismatch)
        );

        let h = header(FileType::Snapshot, 6);
        assert_eq!(
            validate_snapshot_header(&h, &source(), &file_ref(5)),
            Err(ProtocolError::FileVersionMismatch)
        );
    }

    #[test]
    fn test_delta_header_rejections() {
        let h = header(FileType::Delta, 4);
        assert!(validate_delta_header(&h, &source(), &file_ref(4)).is_ok());

        // Header version must equal its reference
        let h = header(FileType::Delta, 5);
        assert_eq!(
            validate_delta_header(&h, &source(), &file_ref(4)),
            Err(ProtocolError::FileVersionMismatch)
        );

        // A delta below the source version is a publisher inconsistency
        let h = header(FileType::Delta, 2);
        assert_eq!(
            validate_delta_header(&h, &source(), &file_ref(2)),
            Err(ProtocolError::FileVersionInconsistency)
        );
    }
}
