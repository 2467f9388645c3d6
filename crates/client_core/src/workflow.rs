//! Workflow run lifecycle as observed from the client.
//!
//! `pending -> running -> {success, failed}`. `pending` is set locally when a
//! start call returns; every later state comes from a status observation.
//! Terminal runs are frozen: late observations for them are dropped, and
//! polling them again costs no request.

use std::{collections::HashMap, sync::Arc, time::Duration};

use serde_json::Value;
use shared::{
    domain::WorkflowRun,
    error::GatewayError,
    protocol::{
        CreateFromTemplateRequest, StartWorkflow, StartedWorkflow, UploadWorkflowRequest,
        WorkflowDetail,
    },
};
use tokio::{sync::Mutex, time::MissedTickBehavior};
use tracing::{debug, info};

use crate::gateway::Gateway;

/// Shortest cadence `poll_until_terminal` will use; shorter requests are raised to it.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

struct TrackedRun {
    run: WorkflowRun,
    /// Ticket of the observation currently stored.
    applied: u64,
}

#[derive(Default)]
struct ControllerState {
    runs: HashMap<String, TrackedRun>,
    /// Names given at creation time, used for the pending placeholder.
    names: HashMap<String, String>,
    next_ticket: u64,
}

impl ControllerState {
    fn issue(&mut self) -> u64 {
        self.next_ticket += 1;
        self.next_ticket
    }

    /// Apply an observation unless the run is already terminal or a newer
    /// observation has been stored. Returns the stored record either way.
    fn observe(&mut self, wf_id: &str, mut observed: WorkflowRun, ticket: u64) -> WorkflowRun {
        observed.wf_id = wf_id.to_string();
        let Some(tracked) = self.runs.get_mut(wf_id) else {
            self.runs.insert(
                wf_id.to_string(),
                TrackedRun {
                    run: observed.clone(),
                    applied: ticket,
                },
            );
            return observed;
        };

        if tracked.run.is_terminal() {
            debug!(
                "workflow: dropping late observation wf_id={wf_id} status={} stored={}",
                observed.status, tracked.run.status
            );
            return tracked.run.clone();
        }
        if ticket <= tracked.applied {
            debug!("workflow: dropping stale observation wf_id={wf_id} ticket={ticket}");
            return tracked.run.clone();
        }

        if observed.status != tracked.run.status {
            info!(
                "workflow: wf_id={wf_id} {} -> {}",
                tracked.run.status, observed.status
            );
        }
        tracked.run = observed;
        tracked.applied = ticket;
        tracked.run.clone()
    }
}

pub struct WorkflowController {
    gateway: Arc<dyn Gateway>,
    state: Mutex<ControllerState>,
}

impl WorkflowController {
    pub fn new(gateway: Arc<dyn Gateway>) -> Self {
        Self {
            gateway,
            state: Mutex::new(ControllerState::default()),
        }
    }

    pub async fn run(&self, wf_id: &str) -> Option<WorkflowRun> {
        let guard = self.state.lock().await;
        guard.runs.get(wf_id).map(|tracked| tracked.run.clone())
    }

    pub async fn runs(&self) -> Vec<WorkflowRun> {
        let guard = self.state.lock().await;
        let mut runs: Vec<_> = guard
            .runs
            .values()
            .map(|tracked| tracked.run.clone())
            .collect();
        runs.sort_by(|a, b| a.wf_id.cmp(&b.wf_id));
        runs
    }

    pub async fn template(&self, project: &str) -> Result<Value, GatewayError> {
        self.gateway.workflow_template(project).await
    }

    pub async fn create_from_template(
        &self,
        project: &str,
        date: &str,
        name: &str,
        overrides: Option<Value>,
    ) -> Result<String, GatewayError> {
        let request = CreateFromTemplateRequest {
            date: date.to_string(),
            name: name.to_string(),
            overrides,
        };
        let wf_id = self
            .gateway
            .create_workflow_from_template(project, &request)
            .await?;
        info!("workflow: created wf_id={wf_id} project={project} date={date}");
        self.state
            .lock()
            .await
            .names
            .insert(wf_id.clone(), name.to_string());
        Ok(wf_id)
    }

    pub async fn upload_workflow(
        &self,
        project: &str,
        date: &str,
        wf_id: &str,
        config: Value,
    ) -> Result<String, GatewayError> {
        let name = config
            .get("name")
            .and_then(Value::as_str)
            .map(str::to_string);
        let request = UploadWorkflowRequest {
            date: date.to_string(),
            wf_id: wf_id.to_string(),
            config,
        };
        let stored = self.gateway.upload_workflow(project, &request).await?;
        if let Some(name) = name {
            self.state.lock().await.names.insert(stored.clone(), name);
        }
        Ok(stored)
    }

    /// Submit a run and record it as `pending`. Observation is the caller's
    /// job: nothing polls automatically.
    pub async fn start_workflow(
        &self,
        project: &str,
        params: StartWorkflow,
    ) -> Result<StartedWorkflow, GatewayError> {
        let started = self.gateway.start_workflow(project, &params).await?;

        let mut guard = self.state.lock().await;
        let ticket = guard.issue();
        let name = guard
            .names
            .get(&started.wf_id)
            .cloned()
            .unwrap_or_else(|| started.wf_id.clone());
        // A restart replaces the previous run; polls issued before it are stale.
        guard.runs.insert(
            started.wf_id.clone(),
            TrackedRun {
                run: WorkflowRun::pending(started.wf_id.clone(), name),
                applied: ticket,
            },
        );
        info!(
            "workflow: started wf_id={} project={project} date={}",
            started.wf_id, started.date
        );
        Ok(started)
    }

    /// One status fetch. A terminal run is returned as stored without a
    /// request. On failure the stored record is left as it was.
    pub async fn poll_status(&self, project: &str, wf_id: &str) -> Result<WorkflowRun, GatewayError> {
        let ticket = {
            let mut guard = self.state.lock().await;
            if let Some(tracked) = guard.runs.get(wf_id) {
                if tracked.run.is_terminal() {
                    return Ok(tracked.run.clone());
                }
            }
            guard.issue()
        };

        let observed = self.gateway.workflow_status(project, wf_id).await?;

        let mut guard = self.state.lock().await;
        Ok(guard.observe(wf_id, observed, ticket))
    }

    /// Poll on a fixed cadence until the run is terminal. The first failure is
    /// returned unchanged; retrying is up to the caller.
    pub async fn poll_until_terminal(
        &self,
        project: &str,
        wf_id: &str,
        every: Duration,
    ) -> Result<WorkflowRun, GatewayError> {
        let mut ticker = tokio::time::interval(every.max(MIN_POLL_INTERVAL));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let run = self.poll_status(project, wf_id).await?;
            if run.is_terminal() {
                return Ok(run);
            }
        }
    }

    /// Status plus output. Valid in any state; output is only meaningful once
    /// the run is terminal.
    pub async fn get_detail(&self, project: &str, wf_id: &str) -> Result<WorkflowDetail, GatewayError> {
        self.gateway.workflow_detail(project, wf_id).await
    }

    /// Fetch the project's run list and merge it as observations.
    pub async fn list_workflows(&self, project: &str) -> Result<Vec<WorkflowRun>, GatewayError> {
        let ticket = self.state.lock().await.issue();
        let listed = self.gateway.workflow_list(project).await?;

        let mut guard = self.state.lock().await;
        Ok(listed
            .into_iter()
            .map(|run| {
                let wf_id = run.wf_id.clone();
                guard.observe(&wf_id, run, ticket)
            })
            .collect())
    }
}

#[cfg(test)]
#[path = "tests/workflow_tests.rs"]
mod tests;
