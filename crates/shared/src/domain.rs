use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::time;

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub name: String,
    pub display_name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(with = "time::lenient")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "time::lenient")]
    pub updated_at: DateTime<Utc>,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub file_id: String,
    pub filename: String,
    pub stored_path: String,
    #[serde(default)]
    pub original_name: Option<String>,
    #[serde(default)]
    pub mime: Option<String>,
    /// Older records carry no size; those read as zero.
    #[serde(default, deserialize_with = "deserialize_size")]
    pub size_bytes: u64,
    #[serde(with = "time::lenient")]
    pub uploaded_at: DateTime<Utc>,
    pub source: String,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

fn deserialize_size<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::<u64>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Pending,
    Running,
    Success,
    Failed,
}

impl WorkflowStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub wf_id: String,
    pub name: String,
    pub status: WorkflowStatus,
    #[serde(default, with = "time::lenient_option")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, with = "time::lenient_option")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl WorkflowRun {
    /// Placeholder for a run the server has accepted but not yet reported on.
    pub fn pending(wf_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            wf_id: wf_id.into(),
            name: name.into(),
            status: WorkflowStatus::Pending,
            started_at: None,
            finished_at: None,
            error_message: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorInfo {
    pub user_id: String,
    pub display_name: String,
}

/// Everything the server knows about one (project, date) record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordMetadata {
    pub record_id: String,
    pub project: String,
    pub date: String,
    #[serde(with = "time::lenient")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "time::lenient")]
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub author: Option<AuthorInfo>,
    #[serde(default)]
    pub files: Vec<FileRecord>,
    #[serde(default)]
    pub workflows: Vec<WorkflowRun>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub notes_general: Option<String>,
}
