//! Snapshot and rollback record types.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{ContextSyncError, Result};
use crate::types::{DomainId, JobId};

/// Hex SHA-256 digest of a byte slice.
pub fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Status of a rollback record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackStatus {
    /// The owning job has not settled; the record must stay restorable.
    Pending,
    /// The owning job completed; the record is only kept for history.
    Committed,
    /// The owning job failed or a restore failed.
    Failed,
}

impl RollbackStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Committed => "committed",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for RollbackStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RollbackStatus {
    type Err = ContextSyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "committed" => Ok(Self::Committed),
            "failed" => Ok(Self::Failed),
            other => Err(ContextSyncError::Storage(format!(
                "unknown rollback status '{other}'"
            ))),
        }
    }
}

/// Kind of write a commit performs on one artifact file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileOpKind {
    Create,
    Modify,
    Delete,
}

/// One intended artifact write, recorded before commit begins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileOperation {
    pub domain: DomainId,
    /// Path relative to the domain's artifact directory.
    pub path: String,
    pub operation: FileOpKind,
}

/// Captured bytes of one artifact file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotFile {
    pub content: Vec<u8>,
    pub sha256: String,
}

impl SnapshotFile {
    pub fn new(content: Vec<u8>) -> Self {
        let sha256 = sha256_hex(&content);
        Self { content, sha256 }
    }

    /// Whether the stored digest still matches the stored bytes.
    pub fn is_intact(&self) -> bool {
        sha256_hex(&self.content) == self.sha256
    }
}

/// A domain's artifact directory at one point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub domain: DomainId,
    pub captured_at: DateTime<Utc>,
    /// Relative path → captured file. Empty for a first-time domain.
    pub files: BTreeMap<String, SnapshotFile>,
}

impl Snapshot {
    pub fn empty(domain: DomainId) -> Self {
        Self {
            domain,
            captured_at: Utc::now(),
            files: BTreeMap::new(),
        }
    }
}

/// Everything needed to undo one job's artifact writes.
#[derive(Debug, Clone)]
pub struct RollbackRecord {
    /// The job this record belongs to.
    pub update_id: JobId,
    pub affected_domains: Vec<DomainId>,
    pub snapshots: Vec<Snapshot>,
    pub file_operations: Vec<FileOperation>,
    pub status: RollbackStatus,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RollbackRecord {
    /// A new pending record with no snapshots yet.
    pub fn pending(update_id: JobId, affected_domains: Vec<DomainId>) -> Self {
        let now = Utc::now();
        Self {
            update_id,
            affected_domains,
            snapshots: Vec::new(),
            file_operations: Vec::new(),
            status: RollbackStatus::Pending,
            failure_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn snapshot_for(&self, domain: &DomainId) -> Option<&Snapshot> {
        self.snapshots.iter().find(|s| &s.domain == domain)
    }

    /// Total number of captured files across all snapshots.
    pub fn file_count(&self) -> usize {
        self.snapshots.iter().map(|s| s.files.len()).sum()
    }
}

/// Listing row for a rollback record, without snapshot contents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RollbackSummary {
    pub update_id: JobId,
    pub status: RollbackStatus,
    pub domain_count: usize,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_file_digest() {
        let file = SnapshotFile::new(b"# Analysis\n".to_vec());
        assert_eq!(file.sha256.len(), 64);
        assert!(file.is_intact());

        let mut tampered = file.clone();
        tampered.content.push(b'!');
        assert!(!tampered.is_intact());
    }

    #[test]
    fn rollback_status_parse() {
        assert_eq!(
            "committed".parse::<RollbackStatus>().expect("parse"),
            RollbackStatus::Committed
        );
        assert!("gone".parse::<RollbackStatus>().is_err());
    }

    #[test]
    fn record_lookup() {
        let analysis = DomainId::new("Analysis").unwrap();
        let mut record = RollbackRecord::pending(JobId::new(), vec![analysis.clone()]);
        let mut snapshot = Snapshot::empty(analysis.clone());
        snapshot
            .files
            .insert("context.md".into(), SnapshotFile::new(b"x".to_vec()));
        record.snapshots.push(snapshot);

        assert_eq!(record.status, RollbackStatus::Pending);
        assert_eq!(record.file_count(), 1);
        assert!(record.snapshot_for(&analysis).is_some());
        assert!(
            record
                .snapshot_for(&DomainId::new("Data").unwrap())
                .is_none()
        );
    }
}
