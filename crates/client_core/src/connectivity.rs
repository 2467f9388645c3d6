//! Server reachability.
//!
//! Advisory state only: nothing else in the client waits on it. Concurrent
//! checks are not coalesced, whichever finishes last owns the state.

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use shared::error::{ErrorKind, GatewayError};
use tokio::{sync::RwLock, task::JoinHandle, time::MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::{gateway::Gateway, notify::Notifier};

/// Budget for one health probe. The probe is dropped, and with it the
/// underlying request, once this elapses.
pub const HEALTH_TIMEOUT: Duration = Duration::from_millis(5000);

/// Shortest cadence for background checks.
pub const MIN_CHECK_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckMode {
    /// Startup and background checks: state only, no notices.
    Silent,
    /// User-initiated "test connection": publishes the outcome.
    Verbose,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectivityFailure {
    pub kind: ErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectivityState {
    pub is_connected: bool,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub last_error: Option<ConnectivityFailure>,
}

pub struct ConnectivityMonitor {
    gateway: Arc<dyn Gateway>,
    notifier: Notifier,
    server_url: String,
    state: RwLock<ConnectivityState>,
    in_flight: AtomicUsize,
}

struct InFlightGuard<'a>(&'a AtomicUsize);

impl<'a> InFlightGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ConnectivityMonitor {
    pub fn new(gateway: Arc<dyn Gateway>, notifier: Notifier, server_url: impl Into<String>) -> Self {
        Self {
            gateway,
            notifier,
            server_url: server_url.into(),
            state: RwLock::new(ConnectivityState::default()),
            in_flight: AtomicUsize::new(0),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.server_url
    }

    pub async fn state(&self) -> ConnectivityState {
        self.state.read().await.clone()
    }

    pub async fn is_connected(&self) -> bool {
        self.state.read().await.is_connected
    }

    pub fn is_checking(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst) > 0
    }

    pub async fn check(&self, mode: CheckMode) -> ConnectivityState {
        self.check_within(HEALTH_TIMEOUT, mode).await
    }

    pub async fn auto_check(&self) -> ConnectivityState {
        self.check(CheckMode::Silent).await
    }

    /// Run one probe bounded by `timeout`. Never fails: the outcome is the
    /// returned state.
    pub async fn check_within(&self, timeout: Duration, mode: CheckMode) -> ConnectivityState {
        let probe = {
            let _guard = InFlightGuard::enter(&self.in_flight);
            tokio::time::timeout(timeout, self.gateway.health()).await
        };

        let failure = match probe {
            Ok(Ok(health)) => {
                debug!("connectivity: health status={}", health.status);
                None
            }
            Ok(Err(err)) => Some(err),
            Err(_) => Some(GatewayError::new(
                ErrorKind::Timeout,
                format!("no answer within {} ms", timeout.as_millis()),
            )),
        };

        let state = ConnectivityState {
            is_connected: failure.is_none(),
            last_checked_at: Some(Utc::now()),
            last_error: failure.map(|err| ConnectivityFailure {
                kind: err.kind,
                message: err.message,
            }),
        };

        match &state.last_error {
            None => info!("connectivity: server reachable url={}", self.server_url),
            Some(failure) => warn!(
                kind = ?failure.kind,
                "connectivity: server unreachable url={}: {}",
                self.server_url,
                failure.message
            ),
        }
        if mode == CheckMode::Verbose {
            self.announce(&state);
        }

        *self.state.write().await = state.clone();
        state
    }

    fn announce(&self, state: &ConnectivityState) {
        let Some(failure) = &state.last_error else {
            self.notifier.success("server connection ok");
            return;
        };
        let message = match failure.kind {
            ErrorKind::Refused => format!(
                "cannot reach server at {}; make sure it is running",
                self.server_url
            ),
            ErrorKind::Timeout => "connection timed out; check the server status".to_string(),
            _ => format!("connection failed: {}", failure.message),
        };
        self.notifier.error(message);
    }

    /// Silent checks on a fixed cadence until the handle is aborted. The
    /// cadence is never shorter than [`MIN_CHECK_INTERVAL`].
    pub fn spawn_periodic(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        let every = every.max(MIN_CHECK_INTERVAL);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                monitor.check(CheckMode::Silent).await;
            }
        })
    }
}

#[cfg(test)]
#[path = "tests/connectivity_tests.rs"]
mod tests;
