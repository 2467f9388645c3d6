//! Scripted in-memory gateway for component tests.
//!
//! Behaves like a tiny server for projects and answers the rest from scripts.
//! Any call can be held open with [`FakeGateway::hold_next`] so tests decide
//! the order in which concurrent calls complete. Responses are computed when
//! the call is made, not when it is released, so a held call returns what the
//! server said at issue time.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use serde_json::{json, Value};
use shared::{
    domain::{FileRecord, Project, RecordMetadata, WorkflowRun, WorkflowStatus},
    error::GatewayError,
    protocol::{
        CreateFromTemplateRequest, FileUpload, HealthStatus, LlmConfig, LlmConfigUpdate,
        LlmModel, LlmStatus, NewProject, ProjectListing, ReinitializeResult, StartWorkflow,
        StartedWorkflow, UploadMode, UploadWorkflowRequest, WorkflowDetail,
    },
};
use tokio::sync::oneshot;

use crate::gateway::Gateway;

pub(crate) fn project(name: &str) -> Project {
    let at = Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap();
    Project {
        name: name.to_string(),
        display_name: name.to_uppercase(),
        description: None,
        created_at: at,
        updated_at: at,
        is_active: true,
    }
}

pub(crate) fn file_record(file_id: &str, filename: &str) -> FileRecord {
    FileRecord {
        file_id: file_id.to_string(),
        filename: filename.to_string(),
        stored_path: format!("data/{filename}"),
        original_name: None,
        mime: None,
        size_bytes: 42,
        uploaded_at: Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap(),
        source: "manual_upload".to_string(),
        tags: Default::default(),
        notes: None,
    }
}

pub(crate) fn metadata(project: &str, date: &str, files: &[&str]) -> RecordMetadata {
    let at = Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap();
    RecordMetadata {
        record_id: format!("{project}-{date}"),
        project: project.to_string(),
        date: date.to_string(),
        created_at: at,
        updated_at: at,
        author: None,
        files: files
            .iter()
            .enumerate()
            .map(|(index, name)| file_record(&format!("f{index}"), name))
            .collect(),
        workflows: Vec::new(),
        tags: Vec::new(),
        notes_general: None,
    }
}

pub(crate) fn run(wf_id: &str, status: WorkflowStatus) -> WorkflowRun {
    WorkflowRun {
        wf_id: wf_id.to_string(),
        name: "daily".to_string(),
        status,
        started_at: None,
        finished_at: None,
        error_message: None,
    }
}

#[derive(Default)]
pub(crate) struct FakeState {
    pub projects: Vec<Project>,
    pub current: Option<String>,
    pub calls: Vec<String>,
    failures: HashMap<&'static str, VecDeque<GatewayError>>,
    gates: HashMap<&'static str, VecDeque<oneshot::Receiver<()>>>,
    metadata: HashMap<(String, String), VecDeque<Option<RecordMetadata>>>,
    dates: HashMap<String, VecDeque<Vec<String>>>,
    statuses: HashMap<String, VecDeque<WorkflowRun>>,
    pub workflow_list: Vec<WorkflowRun>,
    pub detail: Option<WorkflowDetail>,
    pub uploads: Vec<(String, String, String, UploadMode)>,
    pub health_delay: Option<Duration>,
    pub tools: HashMap<String, Value>,
}

#[derive(Default)]
pub(crate) struct FakeGateway {
    state: Mutex<FakeState>,
}

impl FakeGateway {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_projects(names: &[&str], current: Option<&str>) -> Arc<Self> {
        let fake = Self::default();
        {
            let mut state = fake.state();
            state.projects = names.iter().map(|name| project(name)).collect();
            state.current = current.map(str::to_string);
        }
        Arc::new(fake)
    }

    pub fn state(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().expect("fake state")
    }

    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    pub fn call_count(&self) -> usize {
        self.state().calls.len()
    }

    pub fn fail_next(&self, op: &'static str, err: GatewayError) {
        self.state().failures.entry(op).or_default().push_back(err);
    }

    /// The next call to `op` waits until the returned sender fires or drops.
    pub fn hold_next(&self, op: &'static str) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        self.state().gates.entry(op).or_default().push_back(rx);
        tx
    }

    pub fn script_metadata(&self, project: &str, date: &str, value: Option<RecordMetadata>) {
        self.state()
            .metadata
            .entry((project.to_string(), date.to_string()))
            .or_default()
            .push_back(value);
    }

    pub fn script_dates(&self, project: &str, dates: &[&str]) {
        self.state()
            .dates
            .entry(project.to_string())
            .or_default()
            .push_back(dates.iter().map(|date| date.to_string()).collect());
    }

    pub fn script_status(&self, wf_id: &str, status: WorkflowStatus) {
        self.state()
            .statuses
            .entry(wf_id.to_string())
            .or_default()
            .push_back(run(wf_id, status));
    }

    /// Wait until `count` calls have been recorded.
    pub async fn wait_for_calls(&self, count: usize) {
        while self.call_count() < count {
            tokio::task::yield_now().await;
        }
    }

    async fn call<T>(
        &self,
        op: &'static str,
        respond: impl FnOnce(&mut FakeState) -> Result<T, GatewayError>,
    ) -> Result<T, GatewayError> {
        let (result, gate) = {
            let mut state = self.state();
            state.calls.push(op.to_string());
            let gate = state.gates.get_mut(op).and_then(VecDeque::pop_front);
            let result = match state.failures.get_mut(op).and_then(VecDeque::pop_front) {
                Some(err) => Err(err),
                None => respond(&mut *state),
            };
            (result, gate)
        };
        if let Some(gate) = gate {
            let _ = gate.await;
        }
        result
    }
}

#[async_trait]
impl Gateway for FakeGateway {
    async fn health(&self) -> Result<HealthStatus, GatewayError> {
        let delay = self.call("health", |state| Ok(state.health_delay)).await?;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(HealthStatus {
            status: "ok".to_string(),
        })
    }

    async fn list_projects(&self) -> Result<ProjectListing, GatewayError> {
        self.call("list_projects", |state| {
            Ok(ProjectListing {
                projects: state.projects.clone(),
                current_project: state.current.clone(),
            })
        })
        .await
    }

    async fn create_project(&self, new_project: &NewProject) -> Result<(), GatewayError> {
        self.call("create_project", |state| {
            if state.projects.iter().any(|p| p.name == new_project.name) {
                return Err(GatewayError::business(1, "project already exists"));
            }
            state.projects.push(project(&new_project.name));
            Ok(())
        })
        .await
    }

    async fn switch_project(&self, name: &str) -> Result<(), GatewayError> {
        self.call("switch_project", |state| {
            if !state.projects.iter().any(|p| p.name == name) {
                return Err(GatewayError::business(1, "project not found"));
            }
            state.current = Some(name.to_string());
            Ok(())
        })
        .await
    }

    async fn delete_project(&self, name: &str) -> Result<(), GatewayError> {
        self.call("delete_project", |state| {
            state.projects.retain(|p| p.name != name);
            if state.current.as_deref() == Some(name) {
                state.current = None;
            }
            Ok(())
        })
        .await
    }

    async fn current_project(&self) -> Result<Option<String>, GatewayError> {
        self.call("current_project", |state| Ok(state.current.clone()))
            .await
    }

    async fn upload_file(
        &self,
        project: &str,
        date: &str,
        upload: &FileUpload,
        mode: UploadMode,
    ) -> Result<FileRecord, GatewayError> {
        self.call("upload_file", |state| {
            state.uploads.push((
                project.to_string(),
                date.to_string(),
                upload.filename.clone(),
                mode,
            ));
            Ok(file_record("uploaded", &upload.filename))
        })
        .await
    }

    async fn fetch_metadata(
        &self,
        project: &str,
        date: &str,
    ) -> Result<Option<RecordMetadata>, GatewayError> {
        self.call("fetch_metadata", |state| {
            Ok(state
                .metadata
                .get_mut(&(project.to_string(), date.to_string()))
                .and_then(VecDeque::pop_front)
                .flatten())
        })
        .await
    }

    async fn list_dates(&self, project: &str) -> Result<Vec<String>, GatewayError> {
        self.call("list_dates", |state| {
            Ok(state
                .dates
                .get_mut(project)
                .and_then(VecDeque::pop_front)
                .unwrap_or_default())
        })
        .await
    }

    async fn preview_file(
        &self,
        _project: &str,
        _date: &str,
        filename: &str,
    ) -> Result<Vec<u8>, GatewayError> {
        self.call("preview_file", |_| Ok(format!("preview:{filename}").into_bytes()))
            .await
    }

    async fn workflow_template(&self, _project: &str) -> Result<Value, GatewayError> {
        self.call("workflow_template", |_| Ok(json!({"name": "template", "nodes": []})))
            .await
    }

    async fn workflow_list(&self, _project: &str) -> Result<Vec<WorkflowRun>, GatewayError> {
        self.call("workflow_list", |state| Ok(state.workflow_list.clone()))
            .await
    }

    async fn create_workflow_from_template(
        &self,
        _project: &str,
        request: &CreateFromTemplateRequest,
    ) -> Result<String, GatewayError> {
        self.call("create_workflow_from_template", |_| {
            Ok(format!("{}-{}", request.date, request.name))
        })
        .await
    }

    async fn upload_workflow(
        &self,
        _project: &str,
        request: &UploadWorkflowRequest,
    ) -> Result<String, GatewayError> {
        self.call("upload_workflow", |_| Ok(request.wf_id.clone()))
            .await
    }

    async fn start_workflow(
        &self,
        _project: &str,
        request: &StartWorkflow,
    ) -> Result<StartedWorkflow, GatewayError> {
        self.call("start_workflow", |_| {
            Ok(StartedWorkflow {
                wf_id: request.wf_id.clone(),
                date: request.date.clone(),
            })
        })
        .await
    }

    async fn workflow_status(
        &self,
        _project: &str,
        wf_id: &str,
    ) -> Result<WorkflowRun, GatewayError> {
        self.call("workflow_status", |state| {
            state
                .statuses
                .get_mut(wf_id)
                .and_then(VecDeque::pop_front)
                .ok_or_else(|| GatewayError::business(5, "workflow not found"))
        })
        .await
    }

    async fn workflow_detail(
        &self,
        _project: &str,
        _wf_id: &str,
    ) -> Result<WorkflowDetail, GatewayError> {
        self.call("workflow_detail", |state| {
            Ok(state.detail.clone().unwrap_or(WorkflowDetail {
                status: json!("running"),
                output: Value::Null,
            }))
        })
        .await
    }

    async fn llm_config(&self) -> Result<LlmConfig, GatewayError> {
        self.call("llm_config", |_| Ok(LlmConfig::default())).await
    }

    async fn update_llm_config(&self, _update: &LlmConfigUpdate) -> Result<(), GatewayError> {
        self.call("update_llm_config", |_| Ok(())).await
    }

    async fn llm_models(&self) -> Result<Vec<LlmModel>, GatewayError> {
        self.call("llm_models", |_| Ok(Vec::new())).await
    }

    async fn llm_status(&self) -> Result<LlmStatus, GatewayError> {
        self.call("llm_status", |_| Ok(LlmStatus::default())).await
    }

    async fn reinitialize_llm(&self) -> Result<ReinitializeResult, GatewayError> {
        self.call("reinitialize_llm", |_| Ok(ReinitializeResult::default()))
            .await
    }

    async fn tool_list(&self) -> Result<Value, GatewayError> {
        self.call("tool_list", |state| Ok(json!(state.tools))).await
    }

    async fn tool(&self, name: &str) -> Result<Value, GatewayError> {
        self.call("tool", |state| {
            state
                .tools
                .get(name)
                .cloned()
                .ok_or_else(|| GatewayError::business(1, "tool not found"))
        })
        .await
    }

    async fn add_tool(&self, name: &str, config: &Value) -> Result<Value, GatewayError> {
        self.call("add_tool", |state| {
            state.tools.insert(name.to_string(), config.clone());
            Ok(config.clone())
        })
        .await
    }

    async fn edit_tool(&self, name: &str, config: &Value) -> Result<Value, GatewayError> {
        self.call("edit_tool", |state| match state.tools.get_mut(name) {
            Some(stored) => {
                *stored = config.clone();
                Ok(config.clone())
            }
            None => Err(GatewayError::business(4, "failed to update user tool")),
        })
        .await
    }

    async fn default_tools(&self) -> Result<Value, GatewayError> {
        self.call("default_tools", |_| Ok(json!({}))).await
    }

    async fn tool_templates(&self) -> Result<Value, GatewayError> {
        self.call("tool_templates", |_| Ok(json!({}))).await
    }
}
