use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tokio::sync::watch;
use tracing::warn;

use crate::types::WorkerState;

/// Liveness reporting for the loops of the worker.
///
/// Every loop registers a component and must report healthy more often than
/// its deadline. The process is live only if every registered component is:
///   - a component that reported unhealthy fails the check
///   - a component that missed its deadline is stalled and fails the check
///   - a registry without components fails the check
///
/// Readiness is a separate concern, see [`Readiness`].
#[derive(Default, Debug)]
pub struct HealthStatus {
    pub healthy: bool,
    /// Current status of each registered component, for display
    pub components: HashMap<String, ComponentStatus>,
}

impl IntoResponse for HealthStatus {
    fn into_response(self) -> Response {
        let body = format!("{self:?}");
        match self.healthy {
            true => (StatusCode::OK, body),
            false => (StatusCode::INTERNAL_SERVER_ERROR, body),
        }
        .into_response()
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ComponentStatus {
    /// Set on registration
    Starting,
    /// Must report again before the instant
    HealthyUntil(Instant),
    Unhealthy,
    /// Missed its deadline
    Stalled,
}

type Components = Arc<RwLock<HashMap<String, ComponentStatus>>>;

#[derive(Clone)]
pub struct HealthHandle {
    component: String,
    deadline: Duration,
    components: Components,
}

impl HealthHandle {
    /// Report healthy. Must be called more frequently than the deadline.
    pub fn report_healthy(&self) {
        self.report_status(ComponentStatus::HealthyUntil(Instant::now() + self.deadline));
    }

    pub fn report_status(&self, status: ComponentStatus) {
        match self.components.write() {
            Ok(mut map) => {
                map.insert(self.component.clone(), status);
            }
            // Probes will fail and the process restart
            Err(_) => warn!("poisoned health registry lock"),
        }
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }
}

#[derive(Clone)]
pub struct HealthRegistry {
    name: String,
    components: Components,
}

impl HealthRegistry {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            components: Default::default(),
        }
    }

    /// Register a component. Pass the returned handle to it so it can report.
    pub fn register(&self, component: impl Into<String>, deadline: Duration) -> HealthHandle {
        let handle = HealthHandle {
            component: component.into(),
            deadline,
            components: self.components.clone(),
        };
        handle.report_status(ComponentStatus::Starting);
        handle
    }

    /// Overall status from every registered component. Usable as an axum handler.
    pub fn get_status(&self) -> HealthStatus {
        let Ok(components) = self.components.read() else {
            warn!("{} health check failed: poisoned lock", self.name);
            return HealthStatus::default();
        };

        let now = Instant::now();
        let mut result = HealthStatus {
            healthy: !components.is_empty(),
            components: HashMap::with_capacity(components.len()),
        };

        for (name, status) in components.iter() {
            let status = match status {
                ComponentStatus::HealthyUntil(until) if *until > now => *status,
                ComponentStatus::HealthyUntil(_) => ComponentStatus::Stalled,
                other => *other,
            };
            if !matches!(status, ComponentStatus::HealthyUntil(_)) {
                result.healthy = false;
            }
            result.components.insert(name.clone(), status);
        }

        if !result.healthy {
            warn!("{} health check failed: {:?}", self.name, result.components);
        }
        result
    }
}

/// Readiness derived from the worker state: ready only while Running.
#[derive(Clone)]
pub struct Readiness {
    state: watch::Receiver<WorkerState>,
}

impl Readiness {
    pub fn new(state: watch::Receiver<WorkerState>) -> Self {
        Self { state }
    }

    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == WorkerState::Running
    }

    pub fn check(&self) -> (StatusCode, String) {
        let state = self.state();
        let status = if state == WorkerState::Running {
            StatusCode::OK
        } else {
            StatusCode::SERVICE_UNAVAILABLE
        };
        (status, state.to_string())
    }
}
