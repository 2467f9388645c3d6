use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::{Project, WorkflowRun};

/// Uniform reply shape for every non-blob endpoint. `code == 0` is success.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiEnvelope<T> {
    pub code: i64,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub message: String,
    #[serde(default = "Option::default")]
    pub data: Option<T>,
}

impl<T> ApiEnvelope<T> {
    pub fn ok(data: T) -> Self {
        Self {
            code: 0,
            status: "ok".to_string(),
            message: String::new(),
            data: Some(data),
        }
    }

    pub fn error(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            status: "error".to_string(),
            message: message.into(),
            data: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectListing {
    #[serde(default)]
    pub projects: Vec<Project>,
    #[serde(default)]
    pub current_project: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewProject {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl NewProject {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwitchProjectRequest {
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadMode {
    /// `upload_files`: add a new file to the record.
    Create,
    /// `update_files`: replace a file already in the record.
    Update,
}

impl UploadMode {
    pub fn endpoint(self) -> &'static str {
        match self {
            Self::Create => "upload_files",
            Self::Update => "update_files",
        }
    }
}

#[derive(Debug, Clone)]
pub struct FileUpload {
    pub filename: String,
    pub bytes: Vec<u8>,
    pub source: String,
    pub tags: Vec<String>,
    pub notes: Option<String>,
}

impl FileUpload {
    /// Tags travel as a single comma-joined form field.
    pub fn tags_field(&self) -> String {
        self.tags
            .iter()
            .map(|tag| tag.trim())
            .filter(|tag| !tag.is_empty())
            .collect::<Vec<_>>()
            .join(",")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateFromTemplateRequest {
    pub date: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overrides: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadWorkflowRequest {
    pub date: String,
    pub wf_id: String,
    pub config: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowIdResponse {
    pub wf_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StartWorkflow {
    pub wf_id: String,
    pub date: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_prompt: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartedWorkflow {
    pub wf_id: String,
    pub date: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDetail {
    #[serde(default)]
    pub status: Value,
    #[serde(default)]
    pub output: Value,
}

impl WorkflowDetail {
    /// Reads the run status whether the server sent a bare status string or a
    /// full run record.
    pub fn run_status(&self) -> Option<crate::domain::WorkflowStatus> {
        let raw = match &self.status {
            Value::Object(map) => map.get("status")?,
            other => other,
        };
        serde_json::from_value(raw.clone()).ok()
    }

    pub fn run(&self) -> Option<WorkflowRun> {
        serde_json::from_value(self.status.clone()).ok()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub has_api_key: bool,
    #[serde(default)]
    pub default_model: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LlmConfigUpdate {
    pub base_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_model: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LlmModel {
    pub id: String,
    #[serde(default)]
    pub owned_by: Option<String>,
    #[serde(default)]
    pub object: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LlmStatus {
    #[serde(default)]
    pub langchain_available: bool,
    #[serde(default)]
    pub openai_configured: bool,
    #[serde(default)]
    pub available_models: u32,
    #[serde(default)]
    pub models: Vec<String>,
    #[serde(default)]
    pub default_model: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReinitializeResult {
    #[serde(default)]
    pub models: Vec<String>,
    #[serde(default)]
    pub count: u32,
}

#[cfg(test)]
#[path = "tests/protocol_tests.rs"]
mod tests;
