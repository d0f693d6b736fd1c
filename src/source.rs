//! Local mirror bookkeeping: sources, labels, notification history.

use std::sync::LazyLock;
use std::time::{SystemTime, UNIX_EPOCH};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::MirrorError;
use crate::notification::NotificationFile;

static LABEL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new("^[A-Za-z0-9 ._-]*[A-Za-z0-9][A-Za-z0-9 ._-]*$").expect("label regex is valid")
});

/// Trim and validate a user-supplied label.
///
/// Empty labels are allowed (the unlabeled mirror of a source); non-empty
/// labels must match the label pattern.
pub fn normalize_label(label: &str) -> Result<String, MirrorError> {
    let label = label.trim();
    if !label.is_empty() && !LABEL_RE.is_match(label) {
        return Err(MirrorError::InvalidLabel(label.to_string()));
    }
    Ok(label.to_string())
}

pub(crate) fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// One mirrored source: the local record of a publisher connection.
///
/// Uniquely identified by `(source, label)` and by
/// `(notification_url, label)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NrtmSource {
    /// Repository-assigned id; 0 until first persisted
    pub id: i64,
    /// Publisher's source name, e.g. "RIPE"
    pub source: String,
    /// Publisher session this mirror is bound to; a change is terminal
    pub session_id: String,
    /// Highest fully-applied version
    pub version: u32,
    pub notification_url: String,
    /// Optional user tag; empty for the default mirror of a source
    pub label: String,
    /// Creation timestamp (epoch millis)
    pub created: i64,
}

impl NrtmSource {
    /// Build the local record for a fresh connection. The version starts at
    /// zero; snapshot ingestion bumps it to the snapshot header's version.
    #[must_use]
    pub fn from_notification(
        notification: &NotificationFile,
        label: &str,
        notification_url: &str,
    ) -> Self {
        Self {
            id: 0,
            source: notification.source.clone(),
            session_id: notification.session_id.clone(),
            version: 0,
            notification_url: notification_url.to_string(),
            label: label.to_string(),
            created: now_millis(),
        }
    }
}

/// Audit-trail record of one processed notification file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationHistoryEntry {
    pub source_id: i64,
    pub version: u32,
    /// When the notification was recorded (epoch millis)
    pub created: i64,
    /// The notification file as received, serialized JSON
    pub payload: String,
}

/// A source plus its recent notification history, as returned by
/// `list_sources`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceDetails {
    pub source: NrtmSource,
    pub notifications: Vec<NotificationHistoryEntry>,
}

impl SourceDetails {
    /// History window reported per source: the most recent 100 versions.
    pub const HISTORY_WINDOW: u32 = 100;

    /// Inclusive `(from, to)` version range of the history window for a
    /// source at `version`.
    #[must_use]
    pub fn history_range(version: u32) -> (u32, u32) {
        let from = if version <= Self::HISTORY_WINDOW - 1 {
            1
        } else {
            version - (Self::HISTORY_WINDOW - 1)
        };
        (from, version)
    }
}
