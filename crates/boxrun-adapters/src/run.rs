//! Run records and workspace labels.

use boxrun_proto::Status;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::path::Path;
use std::time::Duration;
use uuid::Uuid;

/// Stable label for a workspace: the first 16 hex chars of the SHA-256 of
/// its canonical path.
///
/// Paths that cannot be canonicalized are hashed as given.
pub fn workspace_label(path: &Path) -> String {
    let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    let digest = Sha256::digest(canonical.to_string_lossy().as_bytes());
    hex::encode(digest)[..16].to_string()
}

/// One top-level invocation, handed to persistence once finished.
#[derive(Debug, Clone, Serialize)]
pub struct Run {
    pub id: Uuid,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    pub idle_timeout: Duration,
    pub status: Status,
    pub workspace_label: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,
}

impl Run {
    pub(crate) fn start(
        id: Uuid,
        workspace_label: String,
        idle_timeout: Duration,
        container: String,
    ) -> Self {
        Self {
            id,
            started_at: Utc::now(),
            ended_at: None,
            idle_timeout,
            status: Status::Running,
            workspace_label,
            container: Some(container),
        }
    }

    pub(crate) fn finish(&mut self, status: Status) {
        self.status = status;
        self.ended_at = Some(Utc::now());
    }

    /// Short id used in container names and logs.
    pub fn short_id(&self) -> String {
        short_id(&self.id)
    }

    pub fn elapsed(&self) -> Option<chrono::Duration> {
        self.ended_at.map(|end| end - self.started_at)
    }
}

pub(crate) fn short_id(id: &Uuid) -> String {
    id.simple().to_string()[..12].to_string()
}
