//! Typed boundary to the processing server.
//!
//! Every non-blob endpoint answers with an [`ApiEnvelope`]. The envelope is
//! classified into an [`Outcome`] before anything else looks at it, so callers
//! match on `Ok` / `BusinessEmpty` / `Err` instead of string-sniffing errors.

use std::{error::Error as StdError, io};

use async_trait::async_trait;
use reqwest::{multipart, Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use shared::{
    domain::{FileRecord, RecordMetadata, WorkflowRun},
    error::{ErrorKind, GatewayError},
    protocol::{
        ApiEnvelope, CreateFromTemplateRequest, FileUpload, HealthStatus, LlmConfig,
        LlmConfigUpdate, LlmModel, LlmStatus, NewProject, ProjectListing, ReinitializeResult,
        StartWorkflow, StartedWorkflow, SwitchProjectRequest, UploadMode, UploadWorkflowRequest,
        WorkflowDetail, WorkflowIdResponse,
    },
};
use tracing::{debug, warn};
use url::Url;

use crate::{config::ClientSettings, notify::Notifier};

/// Business replies that mean "nothing here yet" rather than failure.
///
/// Kept as an explicit list: other non-zero codes are real errors even when
/// they look similar.
pub const EXPECTED_EMPTY_REPLIES: &[(i64, &str)] = &[(3, "metadata not found")];

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<T> {
    Ok(T),
    BusinessEmpty { code: i64, message: String },
    Err(GatewayError),
}

impl<T> From<ApiEnvelope<T>> for Outcome<Option<T>> {
    fn from(envelope: ApiEnvelope<T>) -> Self {
        if envelope.code == 0 {
            return Outcome::Ok(envelope.data);
        }
        let expected_empty = EXPECTED_EMPTY_REPLIES
            .iter()
            .any(|(code, message)| *code == envelope.code && *message == envelope.message);
        if expected_empty {
            return Outcome::BusinessEmpty {
                code: envelope.code,
                message: envelope.message,
            };
        }
        let message = if envelope.message.is_empty() {
            "request failed".to_string()
        } else {
            envelope.message
        };
        Outcome::Err(GatewayError::business(envelope.code, message))
    }
}

impl<T> Outcome<Option<T>> {
    /// For endpoints whose success must carry a payload.
    pub fn into_data(self) -> Result<T, GatewayError> {
        match self {
            Outcome::Ok(Some(data)) => Ok(data),
            Outcome::Ok(None) => Err(GatewayError::new(
                ErrorKind::Unknown,
                "server reply carried no data",
            )),
            Outcome::BusinessEmpty { code, message } => Err(GatewayError::business(code, message)),
            Outcome::Err(err) => Err(err),
        }
    }

    /// For endpoints where an allow-listed empty reply is valid state.
    pub fn into_optional(self) -> Result<Option<T>, GatewayError> {
        match self {
            Outcome::Ok(data) => Ok(data),
            Outcome::BusinessEmpty { .. } => Ok(None),
            Outcome::Err(err) => Err(err),
        }
    }

    /// For endpoints where only success matters.
    pub fn into_ack(self) -> Result<(), GatewayError> {
        match self {
            Outcome::Ok(_) => Ok(()),
            Outcome::BusinessEmpty { code, message } => Err(GatewayError::business(code, message)),
            Outcome::Err(err) => Err(err),
        }
    }
}

#[async_trait]
pub trait Gateway: Send + Sync {
    /// Probe `/health`. Never publishes a notice; the caller owns messaging.
    async fn health(&self) -> Result<HealthStatus, GatewayError>;

    async fn list_projects(&self) -> Result<ProjectListing, GatewayError>;
    async fn create_project(&self, project: &NewProject) -> Result<(), GatewayError>;
    async fn switch_project(&self, name: &str) -> Result<(), GatewayError>;
    async fn delete_project(&self, name: &str) -> Result<(), GatewayError>;
    /// Name of the server-side current project, `None` when nothing is selected.
    async fn current_project(&self) -> Result<Option<String>, GatewayError>;

    async fn upload_file(
        &self,
        project: &str,
        date: &str,
        upload: &FileUpload,
        mode: UploadMode,
    ) -> Result<FileRecord, GatewayError>;
    /// `Ok(None)` when the server has no record for this date yet.
    async fn fetch_metadata(
        &self,
        project: &str,
        date: &str,
    ) -> Result<Option<RecordMetadata>, GatewayError>;
    async fn list_dates(&self, project: &str) -> Result<Vec<String>, GatewayError>;
    async fn preview_file(
        &self,
        project: &str,
        date: &str,
        filename: &str,
    ) -> Result<Vec<u8>, GatewayError>;

    async fn workflow_template(&self, project: &str) -> Result<Value, GatewayError>;
    async fn workflow_list(&self, project: &str) -> Result<Vec<WorkflowRun>, GatewayError>;
    async fn create_workflow_from_template(
        &self,
        project: &str,
        request: &CreateFromTemplateRequest,
    ) -> Result<String, GatewayError>;
    async fn upload_workflow(
        &self,
        project: &str,
        request: &UploadWorkflowRequest,
    ) -> Result<String, GatewayError>;
    async fn start_workflow(
        &self,
        project: &str,
        request: &StartWorkflow,
    ) -> Result<StartedWorkflow, GatewayError>;
    async fn workflow_status(&self, project: &str, wf_id: &str)
        -> Result<WorkflowRun, GatewayError>;
    async fn workflow_detail(
        &self,
        project: &str,
        wf_id: &str,
    ) -> Result<WorkflowDetail, GatewayError>;

    async fn llm_config(&self) -> Result<LlmConfig, GatewayError>;
    async fn update_llm_config(&self, update: &LlmConfigUpdate) -> Result<(), GatewayError>;
    async fn llm_models(&self) -> Result<Vec<LlmModel>, GatewayError>;
    async fn llm_status(&self) -> Result<LlmStatus, GatewayError>;
    async fn reinitialize_llm(&self) -> Result<ReinitializeResult, GatewayError>;

    /// Tool configurations are opaque JSON owned by the server.
    async fn tool_list(&self) -> Result<Value, GatewayError>;
    async fn tool(&self, name: &str) -> Result<Value, GatewayError>;
    async fn add_tool(&self, name: &str, config: &Value) -> Result<Value, GatewayError>;
    async fn edit_tool(&self, name: &str, config: &Value) -> Result<Value, GatewayError>;
    async fn default_tools(&self) -> Result<Value, GatewayError>;
    async fn tool_templates(&self) -> Result<Value, GatewayError>;
}

pub struct HttpGateway {
    http: Client,
    base: Url,
    notifier: Notifier,
}

impl HttpGateway {
    pub fn new(settings: &ClientSettings, notifier: Notifier) -> Result<Self, GatewayError> {
        let base = Url::parse(&settings.api_base).map_err(|err| {
            GatewayError::new(
                ErrorKind::Unknown,
                format!("invalid api base '{}': {err}", settings.api_base),
            )
        })?;
        let http = Client::builder()
            .timeout(settings.request_timeout)
            .build()
            .map_err(|err| {
                GatewayError::new(ErrorKind::Unknown, format!("failed to build http client: {err}"))
            })?;
        Ok(Self {
            http,
            base,
            notifier,
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, GatewayError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| GatewayError::new(ErrorKind::Unknown, "api base cannot carry a path"))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// Single exit for every notifying call: one failed call, one notice.
    fn surface<T>(&self, operation: &str, result: Result<T, GatewayError>) -> Result<T, GatewayError> {
        if let Err(err) = &result {
            warn!(
                kind = ?err.kind,
                status = ?err.status,
                code = ?err.code,
                "gateway: {operation} failed: {}",
                err.message
            );
            self.notifier.error(err.message.clone());
        }
        result
    }

    async fn exchange<T: DeserializeOwned>(&self, request: RequestBuilder) -> Outcome<Option<T>> {
        let response = match request.send().await {
            Ok(response) => response,
            Err(err) => return Outcome::Err(classify_transport(&err, &self.base)),
        };
        let status = response.status();
        if !status.is_success() {
            let body = response.json::<Value>().await.ok();
            return Outcome::Err(http_error(status, body.as_ref()));
        }
        match response.json::<ApiEnvelope<T>>().await {
            Ok(envelope) => Outcome::from(envelope),
            Err(err) => Outcome::Err(GatewayError::new(
                ErrorKind::Unknown,
                format!("unexpected server reply: {err}"),
            )
            .with_status(status.as_u16())),
        }
    }

    async fn get_data<T: DeserializeOwned>(
        &self,
        operation: &str,
        segments: &[&str],
    ) -> Result<T, GatewayError> {
        let result = match self.endpoint(segments) {
            Ok(url) => self.exchange(self.http.get(url)).await.into_data(),
            Err(err) => Err(err),
        };
        self.surface(operation, result)
    }

    async fn post_json<B, T>(
        &self,
        operation: &str,
        segments: &[&str],
        body: &B,
    ) -> Result<Outcome<Option<T>>, GatewayError>
    where
        B: serde::Serialize + Sync,
        T: DeserializeOwned,
    {
        let url = self.endpoint(segments)?;
        debug!("gateway: {operation} POST {url}");
        Ok(self.exchange(self.http.post(url).json(body)).await)
    }

    async fn fetch_preview(
        &self,
        project: &str,
        date: &str,
        filename: &str,
    ) -> Result<Vec<u8>, GatewayError> {
        let url = self.endpoint(&["project", project, "data", date, "preview"])?;
        let response = self
            .http
            .get(url)
            .query(&[("filename", filename)])
            .send()
            .await
            .map_err(|err| classify_transport(&err, &self.base))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.json::<Value>().await.ok();
            return Err(http_error(status, body.as_ref()));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|err| classify_transport(&err, &self.base))?;
        Ok(bytes.to_vec())
    }
}

#[async_trait]
impl Gateway for HttpGateway {
    async fn health(&self) -> Result<HealthStatus, GatewayError> {
        let url = self.endpoint(&["health"])?;
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|err| classify_transport(&err, &self.base))?;
        let status = response.status();
        if status != StatusCode::OK {
            let body = response.json::<Value>().await.ok();
            return Err(http_error(status, body.as_ref()));
        }
        let body = response.json::<Value>().await.unwrap_or(Value::Null);
        let reported = body
            .get("status")
            .or_else(|| body.get("data").and_then(|data| data.get("status")))
            .and_then(Value::as_str)
            .unwrap_or("ok");
        Ok(HealthStatus {
            status: reported.to_string(),
        })
    }

    async fn list_projects(&self) -> Result<ProjectListing, GatewayError> {
        self.get_data("list_projects", &["project", "projects"]).await
    }

    async fn create_project(&self, project: &NewProject) -> Result<(), GatewayError> {
        let result = self
            .post_json::<_, Value>("create_project", &["project", "projects"], project)
            .await
            .and_then(Outcome::into_ack);
        self.surface("create_project", result)
    }

    async fn switch_project(&self, name: &str) -> Result<(), GatewayError> {
        let body = SwitchProjectRequest {
            name: name.to_string(),
        };
        let result = self
            .post_json::<_, Value>("switch_project", &["project", "projects", "switch"], &body)
            .await
            .and_then(Outcome::into_ack);
        self.surface("switch_project", result)
    }

    async fn delete_project(&self, name: &str) -> Result<(), GatewayError> {
        let result = match self.endpoint(&["project", "projects", name]) {
            Ok(url) => self
                .exchange::<Value>(self.http.delete(url))
                .await
                .into_ack(),
            Err(err) => Err(err),
        };
        self.surface("delete_project", result)
    }

    async fn current_project(&self) -> Result<Option<String>, GatewayError> {
        let result = match self.endpoint(&["project", "projects", "current"]) {
            Ok(url) => self
                .exchange::<Value>(self.http.get(url))
                .await
                .into_optional()
                .map(|data| data.as_ref().and_then(current_name)),
            Err(err) => Err(err),
        };
        self.surface("current_project", result)
    }

    async fn upload_file(
        &self,
        project: &str,
        date: &str,
        upload: &FileUpload,
        mode: UploadMode,
    ) -> Result<FileRecord, GatewayError> {
        let result = match self.endpoint(&["project", project, "data", date, mode.endpoint()]) {
            Ok(url) => {
                let mut form = multipart::Form::new()
                    .part(
                        "file",
                        multipart::Part::bytes(upload.bytes.clone())
                            .file_name(upload.filename.clone()),
                    )
                    .text("source", upload.source.clone())
                    .text("tags", upload.tags_field());
                if let Some(notes) = &upload.notes {
                    form = form.text("notes", notes.clone());
                }
                self.exchange(self.http.post(url).multipart(form))
                    .await
                    .into_data()
            }
            Err(err) => Err(err),
        };
        self.surface("upload_file", result)
    }

    async fn fetch_metadata(
        &self,
        project: &str,
        date: &str,
    ) -> Result<Option<RecordMetadata>, GatewayError> {
        let result = match self.endpoint(&["project", project, "data", date, "metadata"]) {
            Ok(url) => self.exchange(self.http.get(url)).await.into_optional(),
            Err(err) => Err(err),
        };
        self.surface("fetch_metadata", result)
    }

    async fn list_dates(&self, project: &str) -> Result<Vec<String>, GatewayError> {
        self.get_data("list_dates", &["project", project, "data", "dates"])
            .await
    }

    async fn preview_file(
        &self,
        project: &str,
        date: &str,
        filename: &str,
    ) -> Result<Vec<u8>, GatewayError> {
        let result = self.fetch_preview(project, date, filename).await;
        self.surface("preview_file", result)
    }

    async fn workflow_template(&self, project: &str) -> Result<Value, GatewayError> {
        self.get_data("workflow_template", &["project", project, "workflow_template"])
            .await
    }

    async fn workflow_list(&self, project: &str) -> Result<Vec<WorkflowRun>, GatewayError> {
        self.get_data("workflow_list", &["project", project, "workflow_list"])
            .await
    }

    async fn create_workflow_from_template(
        &self,
        project: &str,
        request: &CreateFromTemplateRequest,
    ) -> Result<String, GatewayError> {
        let result = self
            .post_json::<_, WorkflowIdResponse>(
                "create_workflow_from_template",
                &["project", project, "create_workflow_from_template"],
                request,
            )
            .await
            .and_then(Outcome::into_data)
            .map(|reply| reply.wf_id);
        self.surface("create_workflow_from_template", result)
    }

    async fn upload_workflow(
        &self,
        project: &str,
        request: &UploadWorkflowRequest,
    ) -> Result<String, GatewayError> {
        let result = self
            .post_json::<_, WorkflowIdResponse>(
                "upload_workflow",
                &["project", project, "upload_workflow"],
                request,
            )
            .await
            .and_then(Outcome::into_data)
            .map(|reply| reply.wf_id);
        self.surface("upload_workflow", result)
    }

    async fn start_workflow(
        &self,
        project: &str,
        request: &StartWorkflow,
    ) -> Result<StartedWorkflow, GatewayError> {
        let result = self
            .post_json("start_workflow", &["project", project, "start_workflow"], request)
            .await
            .and_then(Outcome::into_data);
        self.surface("start_workflow", result)
    }

    async fn workflow_status(
        &self,
        project: &str,
        wf_id: &str,
    ) -> Result<WorkflowRun, GatewayError> {
        self.get_data("workflow_status", &["project", project, "workflow_status", wf_id])
            .await
    }

    async fn workflow_detail(
        &self,
        project: &str,
        wf_id: &str,
    ) -> Result<WorkflowDetail, GatewayError> {
        self.get_data("workflow_detail", &["project", project, "workflow_detail", wf_id])
            .await
    }

    async fn llm_config(&self) -> Result<LlmConfig, GatewayError> {
        self.get_data("llm_config", &["llm", "config"]).await
    }

    async fn update_llm_config(&self, update: &LlmConfigUpdate) -> Result<(), GatewayError> {
        let result = self
            .post_json::<_, Value>("update_llm_config", &["llm", "config"], update)
            .await
            .and_then(Outcome::into_ack);
        self.surface("update_llm_config", result)
    }

    async fn llm_models(&self) -> Result<Vec<LlmModel>, GatewayError> {
        self.get_data("llm_models", &["llm", "models"]).await
    }

    async fn llm_status(&self) -> Result<LlmStatus, GatewayError> {
        self.get_data("llm_status", &["llm", "status"]).await
    }

    async fn reinitialize_llm(&self) -> Result<ReinitializeResult, GatewayError> {
        let result = match self.endpoint(&["llm", "reinitialize"]) {
            Ok(url) => self.exchange(self.http.post(url)).await.into_data(),
            Err(err) => Err(err),
        };
        self.surface("reinitialize_llm", result)
    }

    async fn tool_list(&self) -> Result<Value, GatewayError> {
        self.get_data("tool_list", &["tool", "tool_list"]).await
    }

    async fn tool(&self, name: &str) -> Result<Value, GatewayError> {
        self.get_data("tool", &["tool", name]).await
    }

    async fn add_tool(&self, name: &str, config: &Value) -> Result<Value, GatewayError> {
        let result = self
            .post_json("add_tool", &["tool", name, "add"], config)
            .await
            .and_then(Outcome::into_data);
        self.surface("add_tool", result)
    }

    async fn edit_tool(&self, name: &str, config: &Value) -> Result<Value, GatewayError> {
        let result = self
            .post_json("edit_tool", &["tool", name, "edit"], config)
            .await
            .and_then(Outcome::into_data);
        self.surface("edit_tool", result)
    }

    async fn default_tools(&self) -> Result<Value, GatewayError> {
        self.get_data("default_tools", &["tool", "defaults"]).await
    }

    async fn tool_templates(&self) -> Result<Value, GatewayError> {
        self.get_data("tool_templates", &["tool", "templates"]).await
    }
}

/// The current-project reply is either a bare name or an object naming it.
fn current_name(data: &Value) -> Option<String> {
    let name = match data {
        Value::String(name) => Some(name.as_str()),
        Value::Object(fields) => fields
            .get("name")
            .or_else(|| fields.get("current_project"))
            .and_then(Value::as_str),
        _ => None,
    };
    name.filter(|name| !name.is_empty()).map(str::to_string)
}

pub(crate) fn classify_transport(err: &reqwest::Error, base: &Url) -> GatewayError {
    if err.is_timeout() {
        return GatewayError::new(
            ErrorKind::Timeout,
            "connection timed out; check the network or server status",
        );
    }
    if is_dns_failure(err) {
        return GatewayError::new(
            ErrorKind::Dns,
            format!("cannot resolve server address {base}; check the API_BASE setting"),
        );
    }
    if has_io_kind(err, io::ErrorKind::ConnectionRefused) {
        return GatewayError::new(
            ErrorKind::Refused,
            format!("connection refused; make sure the server is running at {base}"),
        );
    }
    if has_io_kind(err, io::ErrorKind::TimedOut) {
        return GatewayError::new(
            ErrorKind::Timeout,
            "connection timed out; check the network or server status",
        );
    }
    if let Some(status) = err.status() {
        return GatewayError::http(status.as_u16(), format!("request failed with status {status}"));
    }
    if err.is_connect() {
        return GatewayError::new(
            ErrorKind::Unknown,
            format!("cannot connect to server at {base} ({})", root_cause(err)),
        );
    }
    GatewayError::new(ErrorKind::Unknown, format!("request failed: {}", root_cause(err)))
}

fn http_error(status: StatusCode, body: Option<&Value>) -> GatewayError {
    let detail = body
        .and_then(|body| {
            body.get("message")
                .or_else(|| body.get("detail"))
                .and_then(Value::as_str)
        })
        .filter(|detail| !detail.is_empty())
        .unwrap_or("request failed");
    let message = match status {
        StatusCode::NOT_FOUND => "endpoint not found".to_string(),
        StatusCode::INTERNAL_SERVER_ERROR => format!("server error: {detail}"),
        _ => detail.to_string(),
    };
    GatewayError::http(status.as_u16(), message)
}

fn error_chain<'a>(err: &'a (dyn StdError + 'static)) -> impl Iterator<Item = &'a (dyn StdError + 'static)> {
    std::iter::successors(Some(err), |err| (*err).source())
}

fn has_io_kind(err: &reqwest::Error, kind: io::ErrorKind) -> bool {
    error_chain(err)
        .filter_map(|err| err.downcast_ref::<io::Error>())
        .any(|io_err| io_err.kind() == kind)
}

fn is_dns_failure(err: &reqwest::Error) -> bool {
    error_chain(err).any(|err| {
        let text = err.to_string().to_ascii_lowercase();
        text.contains("dns error") || text.contains("failed to lookup address")
    })
}

fn root_cause(err: &reqwest::Error) -> String {
    error_chain(err)
        .last()
        .map(ToString::to_string)
        .unwrap_or_else(|| err.to_string())
}

#[cfg(test)]
#[path = "tests/gateway_tests.rs"]
mod tests;
