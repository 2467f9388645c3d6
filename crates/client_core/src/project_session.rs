//! Known projects and the single current-project designator.
//!
//! Every operation takes a ticket when it is issued. A state write, whether an
//! optimistic switch or a reload result, lands only if no operation issued
//! later has already written; results of superseded operations are dropped.
//! An operation the server rejects writes nothing, so it supersedes nothing.
//! The lock is never held across a gateway call.

use std::sync::Arc;

use shared::{domain::Project, error::GatewayError, protocol::NewProject};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::gateway::Gateway;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProjectSnapshot {
    pub projects: Vec<Project>,
    /// `None` is the explicit empty designator: no project exists.
    pub current: Option<String>,
}

#[derive(Default)]
struct SessionState {
    projects: Vec<Project>,
    current: Option<String>,
    next_ticket: u64,
    /// Ticket of the operation that last wrote `projects` or `current`.
    written: u64,
}

impl SessionState {
    fn snapshot(&self) -> ProjectSnapshot {
        ProjectSnapshot {
            projects: self.projects.clone(),
            current: self.current.clone(),
        }
    }

    fn first_name(&self) -> Option<String> {
        self.projects.first().map(|project| project.name.clone())
    }

    fn contains(&self, name: &str) -> bool {
        self.projects.iter().any(|project| project.name == name)
    }
}

/// What a reload saw, handed to the per-operation adjustment.
struct Reloaded {
    previous_current: Option<String>,
    reported_current: Option<String>,
}

pub struct ProjectSession {
    gateway: Arc<dyn Gateway>,
    state: Mutex<SessionState>,
}

impl ProjectSession {
    pub fn new(gateway: Arc<dyn Gateway>) -> Self {
        Self {
            gateway,
            state: Mutex::new(SessionState::default()),
        }
    }

    pub async fn snapshot(&self) -> ProjectSnapshot {
        self.state.lock().await.snapshot()
    }

    pub async fn current_project(&self) -> Option<String> {
        self.state.lock().await.current.clone()
    }

    async fn issue(&self) -> u64 {
        let mut guard = self.state.lock().await;
        guard.next_ticket += 1;
        guard.next_ticket
    }

    pub async fn load_projects(&self) -> Result<ProjectSnapshot, GatewayError> {
        let ticket = self.issue().await;
        self.reload(ticket, "load_projects", |_, _| {}).await
    }

    /// Create, reload, and make the new project current regardless of what
    /// the reload reported.
    pub async fn create_project(&self, project: NewProject) -> Result<ProjectSnapshot, GatewayError> {
        let ticket = self.issue().await;
        self.gateway.create_project(&project).await?;
        info!("projects: created name={}", project.name);

        let name = project.name;
        self.reload(ticket, "create_project", move |state, _| {
            state.current = Some(name);
        })
        .await
    }

    pub async fn switch_project(&self, name: &str) -> Result<ProjectSnapshot, GatewayError> {
        {
            let guard = self.state.lock().await;
            if name.is_empty() || guard.current.as_deref() == Some(name) {
                return Ok(guard.snapshot());
            }
        }

        let ticket = self.issue().await;
        self.gateway.switch_project(name).await?;
        {
            let mut guard = self.state.lock().await;
            if ticket >= guard.written {
                guard.written = ticket;
                guard.current = Some(name.to_string());
                info!("projects: switched current={name}");
            } else {
                debug!("projects: switch to {name} superseded ticket={ticket}");
            }
        }

        let switched = name.to_string();
        self.reload(ticket, "switch_project", move |state, reloaded| {
            // A listing without a designator must not undo the switch.
            if reloaded.reported_current.is_none() && state.contains(&switched) {
                state.current = Some(switched);
            }
        })
        .await
    }

    /// Delete, reload, and if the deleted project was current fall back to the
    /// first remaining project, or to no project at all.
    pub async fn delete_project(&self, name: &str) -> Result<ProjectSnapshot, GatewayError> {
        let ticket = self.issue().await;
        self.gateway.delete_project(name).await?;
        info!("projects: deleted name={name}");

        let deleted = name.to_string();
        self.reload(ticket, "delete_project", move |state, reloaded| {
            if reloaded.previous_current.as_deref() == Some(deleted.as_str()) {
                state.current = state.first_name();
            }
        })
        .await
    }

    async fn reload<F>(
        &self,
        ticket: u64,
        operation: &str,
        adjust: F,
    ) -> Result<ProjectSnapshot, GatewayError>
    where
        F: FnOnce(&mut SessionState, &Reloaded),
    {
        let listing = self.gateway.list_projects().await?;

        let mut guard = self.state.lock().await;
        if ticket < guard.written {
            debug!(
                "projects: dropping superseded {operation} reload ticket={ticket} written={}",
                guard.written
            );
            return Ok(guard.snapshot());
        }

        let state = &mut *guard;
        state.written = ticket;
        let reloaded = Reloaded {
            previous_current: state.current.take(),
            reported_current: listing.current_project.filter(|name| !name.is_empty()),
        };
        state.projects = listing.projects;
        state.current = reloaded
            .reported_current
            .clone()
            .or_else(|| state.first_name());
        adjust(state, &reloaded);

        debug!(
            "projects: {operation} applied count={} current={:?}",
            state.projects.len(),
            state.current
        );
        Ok(state.snapshot())
    }
}

#[cfg(test)]
#[path = "tests/project_session_tests.rs"]
mod tests;
