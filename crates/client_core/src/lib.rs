//! Client core for the project workbench.
//!
//! [`ClientContext`] owns one instance of each stateful component for the
//! lifetime of a client. Nothing here is global: a fresh context is a fresh
//! session, which is also how tests get isolation.

use std::sync::Arc;

use shared::error::GatewayError;

pub mod config;
pub mod connectivity;
pub mod file_registry;
pub mod gateway;
pub mod notify;
pub mod project_session;
pub mod workflow;

pub use config::{load_settings, ClientSettings};
pub use connectivity::{CheckMode, ConnectivityMonitor, ConnectivityState};
pub use file_registry::FileRegistry;
pub use gateway::{Gateway, HttpGateway, Outcome};
pub use notify::{Notice, NoticeLevel, Notifier};
pub use project_session::{ProjectSession, ProjectSnapshot};
pub use workflow::WorkflowController;

pub struct ClientContext {
    settings: ClientSettings,
    notifier: Notifier,
    gateway: Arc<dyn Gateway>,
    connectivity: Arc<ConnectivityMonitor>,
    projects: ProjectSession,
    workflows: WorkflowController,
    files: FileRegistry,
}

impl ClientContext {
    pub fn new(settings: ClientSettings) -> Result<Self, GatewayError> {
        let notifier = Notifier::new();
        let gateway = Arc::new(HttpGateway::new(&settings, notifier.clone())?);
        Ok(Self::with_gateway(settings, notifier, gateway))
    }

    pub fn with_gateway(
        settings: ClientSettings,
        notifier: Notifier,
        gateway: Arc<dyn Gateway>,
    ) -> Self {
        let connectivity = Arc::new(ConnectivityMonitor::new(
            Arc::clone(&gateway),
            notifier.clone(),
            settings.api_base.clone(),
        ));
        Self {
            projects: ProjectSession::new(Arc::clone(&gateway)),
            workflows: WorkflowController::new(Arc::clone(&gateway)),
            files: FileRegistry::new(Arc::clone(&gateway)),
            connectivity,
            gateway,
            notifier,
            settings,
        }
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    pub fn gateway(&self) -> &Arc<dyn Gateway> {
        &self.gateway
    }

    pub fn connectivity(&self) -> &Arc<ConnectivityMonitor> {
        &self.connectivity
    }

    pub fn projects(&self) -> &ProjectSession {
        &self.projects
    }

    pub fn workflows(&self) -> &WorkflowController {
        &self.workflows
    }

    pub fn files(&self) -> &FileRegistry {
        &self.files
    }
}

#[cfg(test)]
#[path = "tests/support.rs"]
pub(crate) mod test_support;

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
