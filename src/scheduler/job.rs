use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Canonical run status vocabulary.
///
/// `queued → starting → running → {success | failed}`. Cancellation is a
/// transition into `failed` with a reason on the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Queued,
    Starting,
    Running,
    Success,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Success | RunStatus::Failed)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Queued => write!(f, "queued"),
            RunStatus::Starting => write!(f, "starting"),
            RunStatus::Running => write!(f, "running"),
            RunStatus::Success => write!(f, "success"),
            RunStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Reason recorded on runs forced into `failed` by a cancel.
pub const CANCELLED_REASON: &str = "cancelled";

/// Entry of the per-node ordered queue (`node:<id>:queued_builds`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub job_id: String,
    pub build_config_id: i64,
}

impl QueueEntry {
    pub fn new(job_id: impl Into<String>, build_config_id: i64) -> Self {
        Self {
            job_id: job_id.into(),
            build_config_id,
        }
    }
}

/// Durable, log-bearing record of one job's execution (`run:<job_id>`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: String,
    pub builder_id: i64,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub gitcommit: String,
    /// Seconds between `started_at` and `ended_at`
    #[serde(default)]
    pub duration: i64,
    #[serde(default)]
    pub log: String,
    pub node_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl RunRecord {
    pub fn new(job_id: impl Into<String>, builder_id: i64, node_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: job_id.into(),
            builder_id,
            status: RunStatus::Queued,
            started_at: now,
            ended_at: None,
            updated_at: now,
            gitcommit: String::new(),
            duration: 0,
            log: String::new(),
            node_id: node_id.into(),
            reason: None,
        }
    }

    /// Append one inbound frame verbatim, newline terminated.
    pub fn append_log(&mut self, line: &str) {
        self.log.push_str(line);
        if !line.ends_with('\n') {
            self.log.push('\n');
        }
        self.updated_at = Utc::now();
    }

    /// Replace the status. Terminal statuses also stamp `ended_at` and
    /// `duration`. Returns the previous status.
    pub fn transition(&mut self, status: RunStatus, reason: Option<String>) -> RunStatus {
        let old = self.status;
        let now = Utc::now();
        self.status = status;
        self.updated_at = now;
        if reason.is_some() {
            self.reason = reason;
        }
        if status.is_terminal() {
            self.ended_at = Some(now);
            self.duration = (now - self.started_at).num_seconds().max(0);
        }
        old
    }
}
