use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed)
    }
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    ClusterBootstrap,
    BulkImport,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct Job {
    pub id: Uuid,
    pub kind: JobKind,
    pub status: JobStatus,
    /// In `[0, 1]`.
    pub progress: f32,
    pub payload: serde_json::Value,
    pub error: Option<String>,
    /// Structured outcome (e.g. bulk-import per-row results). `Null` until
    /// the job records one.
    #[serde(default)]
    pub result: serde_json::Value,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

impl Job {
    pub fn queued(kind: JobKind, payload: serde_json::Value) -> Self {
        let now = chrono::Utc::now();
        Self {
            id: Uuid::new_v4(),
            kind,
            status: JobStatus::Queued,
            progress: 0.0,
            payload,
            error: None,
            result: serde_json::Value::Null,
            created_at: now,
            updated_at: now,
        }
    }
}
