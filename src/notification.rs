//! NRTM v4 wire types.
//!
//! Everything a publisher serves is either a JSON notification file or a
//! JSON-text-sequence of records (snapshot, delta). These types mirror the
//! wire field names; unknown fields are tolerated so that protocol
//! extensions do not break older mirrors.

use serde::{Deserialize, Serialize};

/// The protocol version this client speaks.
pub const NRTM_VERSION: u32 = 4;

/// `type` discriminator carried by every publisher file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileType {
    Notification,
    Snapshot,
    Delta,
}

impl std::fmt::Display for FileType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Notification => write!(f, "notification"),
            Self::Snapshot => write!(f, "snapshot"),
            Self::Delta => write!(f, "delta"),
        }
    }
}

/// Pointer to a snapshot or delta file published alongside the notification.
///
/// The `hash` is the lowercase hex SHA-256 digest of the file's on-wire
/// bytes (i.e. the compressed form for `.gz` files).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRef {
    pub version: u32,
    pub url: String,
    pub hash: String,
}

/// The publisher's manifest: where the current snapshot lives and which
/// deltas are still available.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationFile {
    pub nrtm_version: u32,
    #[serde(rename = "type")]
    pub file_type: FileType,
    pub source: String,
    pub session_id: String,
    pub version: u32,
    pub timestamp: String,
    pub snapshot: FileRef,
    #[serde(default)]
    pub deltas: Option<Vec<FileRef>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_signing_key: Option<String>,
}

impl NotificationFile {
    /// Whether the notification lists at least one delta.
    #[must_use]
    pub fn has_deltas(&self) -> bool {
        self.deltas.as_ref().is_some_and(|d| !d.is_empty())
    }
}

/// First record of a snapshot or delta stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileHeader {
    pub nrtm_version: u32,
    #[serde(rename = "type")]
    pub file_type: FileType,
    pub source: String,
    pub session_id: String,
    pub version: u32,
}

/// One entry inside a snapshot stream: a single RPSL text blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotObject {
    pub object: String,
}

/// One entry inside a delta stream.
///
/// `action` stays a plain string rather than a closed enum so that an
/// unrecognized action surfaces as a protocol error carrying the offending
/// value instead of a deserialization failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeltaEntry {
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_class: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_key: Option<String>,
}

impl DeltaEntry {
    pub const ADD_MODIFY: &'static str = "add_modify";
    pub const DELETE: &'static str = "delete";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notification_deserializes_wire_names() {
        let json = r#"{
            "nrtm_version": 4,
            "type": "notification",
            "source": "EXAMPLE",
            "session_id": "ca128382-78d9-41d1-8927-1ecef15275be",
            "version": 3,
            "timestamp": "2025-01-04T23:01:00Z",
            "snapshot": {"version": 2, "url": "https://example.com/snapshot.2.json.gz", "hash": "ab"},
            "deltas": [{"version": 3, "url": "https://example.com/delta.3.json", "hash": "cd"}]
        }"#;
        let n: NotificationFile = serde_json::from_str(json).unwrap();
        assert_eq!(n.nrtm_version, 4);
        assert_eq!(n.file_type, FileType::Notification);
        assert_eq!(n.source, "EXAMPLE");
        assert_eq!(n.version, 3);
        assert_eq!(n.snapshot.version, 2);
        assert!(n.has_deltas());
        assert_eq!(n.deltas.unwrap()[0].version, 3);
    }

    #[test]
    fn test_notification_without_deltas() {
        let json = r#"{
            "nrtm_version": 4,
            "type": "notification",
            "source": "EXAMPLE",
            "session_id": "ca128382-78d9-41d1-8927-1ecef15275be",
            "version": 1,
            "timestamp": "2025-01-04T23:01:00Z",
            "snapshot": {"version": 1, "url": "u", "hash": "h"}
        }"#;
        let n: NotificationFile = serde_json::from_str(json).unwrap();
        assert!(n.deltas.is_none());
        assert!(!n.has_deltas());
    }

    #[test]
    fn test_unknown_fields_tolerated() {
        let json = r#"{
            "nrtm_version": 4,
            "type": "notification",
            "source": "EXAMPLE",
            "session_id": "s",
            "version": 1,
            "timestamp": "t",
            "snapshot": {"version": 1, "url": "u", "hash": "h", "size": 12345},
            "next_signing_key": "k",
            "future_extension": {"nested": true}
        }"#;
        let n: NotificationFile = serde_json::from_str(json).unwrap();
        assert_eq!(n.next_signing_key.as_deref(), Some("k"));
    }

    #[test]
    fn test_file_header_type_discriminator() {
        let h: FileHeader = serde_json::from_str(
            r#"{"nrtm_version": 4, "type": "snapshot", "source": "X", "session_id": "s", "version": 7}"#,
        )
        .unwrap();
        assert_eq!(h.file_type, FileType::Snapshot);
        assert_eq!(format!("{}", h.file_type), "snapshot");
    }

    #[test]
    fn test_delta_entry_shapes() {
        let add: DeltaEntry = serde_json::from_str(
            r#"{"action": "add_modify", "object": "route: 192.0.2.0/24\norigin: AS65536\n"}"#,
        )
        .unwrap();
        assert_eq!(add.action, DeltaEntry::ADD_MODIFY);
        assert!(add.object.is_some());

        let del: DeltaEntry = serde_json::from_str(
            r#"{"action": "delete", "object_class": "route", "primary_key": "192.0.2.0/24"}"#,
        )
        .unwrap();
        assert_eq!(del.action, DeltaEntry::DELETE);
        assert_eq!(del.object_class.as_deref(), Some("route"));

        // An action this client does not know still deserializes; the
        // pipeline rejects it with a protocol error.
        let odd: DeltaEntry = serde_json::from_str(r#"{"action": "merge"}"#).unwrap();
        assert_eq!(odd.action, "merge");
    }
}
