// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error taxonomy for the mirror client.
//!
//! Errors are grouped by concern: [`ProtocolError`] for NRTM rule
//! violations (these come from the publisher's data, not from this host),
//! [`FetchError`](crate::fetch::FetchError) for transport,
//! [`RepositoryError`](crate::repository::RepositoryError) for storage, and
//! [`MirrorError`] as the top-level type every coordinator operation
//! returns.

use thiserror::Error;

use crate::fetch::FetchError;
use crate::jsonseq::JsonSeqError;
use crate::repository::RepositoryError;
use crate::rpsl::RpslError;

/// A violation of the NRTM v4 protocol by the publisher's file set.
///
/// The last three variants are recoverability classes rather than plain
/// protocol faults: they tell the operator what manual step is required.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("nrtm version is not 4")]
    NrtmVersionMismatch,
    #[error("source name does not match source")]
    SourceNameMismatch,
    #[error("session id does not match source")]
    SessionIdMismatch,
    #[error("file type does not match its reference")]
    FileTypeMismatch,
    #[error("file version does not match its reference")]
    FileVersionMismatch,
    #[error("file version is lower than the source version")]
    FileVersionInconsistency,
    #[error("no deltas listed in notification file")]
    NoDeltasInNotification,
    #[error("server has an incontiguous list of delta versions")]
    DeltaSequenceBroken,
    #[error("highest delta version is not the notification version")]
    VersionDoesNotMatchDelta,
    #[error("notification file lists a duplicate delta version")]
    DuplicateDeltaVersion,
    #[error("unknown delta action: {0}")]
    UnknownDeltaAction(String),

    #[error("repository is too old to update from the server; a fresh snapshot is required")]
    NextConsecutiveDeltaUnavailable,
    #[error("server has a new mirror session; re-initialize the source")]
    SessionChanged,
    #[error("server regressed from version {local} to {server}")]
    ServerRegressed { server: u32, local: u32 },
}

/// Top-level error returned by every mirror operation.
#[derive(Debug, Error)]
pub enum MirrorError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error("rpsl parse error: {0}")]
    Rpsl(#[from] RpslError),
    #[error("record stream error: {0}")]
    Record(#[from] JsonSeqError),
    #[error("malformed JSON record: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("label {0:?} is not valid")]
    InvalidLabel(String),
    #[error("a source with the given label already exists")]
    SourceAlreadyExists,
    #[error("no source named {name:?} with label {label:?}")]
    NoSuchSource { name: String, label: String },
    #[error("delta entry is missing required field {0:?}")]
    MissingDeltaField(&'static str),
    #[error("operation cancelled")]
    Cancelled,
}

impl MirrorError {
    /// Whether the failure requires operator intervention (fresh `connect`)
    /// rather than a retry of the same operation.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Protocol(
                ProtocolError::SessionChanged | ProtocolError::NextConsecutiveDeltaUnavailable
            )
        )
    }
}
