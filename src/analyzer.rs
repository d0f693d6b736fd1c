// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Notification analysis: which deltas must be applied?
//!
//! [`find_updates`] is a pure function over a parsed notification and the
//! local source record. It enforces the publisher-side ordering rules
//! (no duplicates, contiguous versions, highest delta == notification
//! version) and the client-side reachability rule (the next consecutive
//! delta must still be on offer), then returns the refs that advance the
//! local version, ascending.
//!
//! Session and regression checks are deliberately NOT here: the coordinator
//! rejects a changed `session_id` or a regressed notification version
//! before calling this function.

use std::collections::HashSet;

use tracing::{debug, error};

use crate::error::ProtocolError;
use crate::notification::{FileRef, NotificationFile};
use crate::source::NrtmSource;

/// Determine the ordered list of delta files that must be applied to bring
/// `source` up to `notification.version`.
///
/// An `Ok` with an empty list means the mirror is already caught up.
pub fn find_updates(
    notification: &NotificationFile,
    source: &NrtmSource,
) -> Result<Vec<FileRef>, ProtocolError> {
    let delta_refs = match notification.deltas.as_deref() {
        Some(refs) if !refs.is_empty() => refs,
        _ => return Err(ProtocolError::NoDeltasInNotification),
    };

    let mut versions: Vec<u32> = Vec::with_capacity(delta_refs.len());
    let mut pending: Vec<FileRef> = Vec::new();
    for delta_ref in delta_refs {
        versions.push(delta_ref.version);
        if delta_ref.version > source.version {
            pending.push(delta_ref.clone());
        }
    }

    let distinct: HashSet<u32> = versions.iter().copied().collect();
    if distinct.len() != versions.len() {
        error!(
            source = %notification.source,
            url = %source.notification_url,
            "duplicate delta version in notification file"
        );
        return Err(ProtocolError::DuplicateDeltaVersion);
    }

    versions.sort_unstable();
    let lo = versions[0];
    let hi = versions[versions.len() - 1];
    if hi != notification.version {
        return Err(ProtocolError::VersionDoesNotMatchDelta);
    }
    for pair in versions.windows(2) {
        if pair[0] + 1 != pair[1] {
            error!(
                missing = pair[0] + 1,
                source = %notification.source,
                url = %source.notification_url,
                "delta version missing from notification file"
            );
            return Err(ProtocolError::DeltaSequenceBroken);
        }
    }
    if source.version + 1 < lo {
        return Err(ProtocolError::NextConsecutiveDeltaUnavailable);
    }

    pending.sort_by_key(|r| r.version);
    debug!(
        source = %notification.source,
        pending = pending.len(),
        "notification analyzed"
    );
    Ok(pending)
}
