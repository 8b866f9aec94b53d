//! Liveness reporting for the host's long-running loops.
//!
//! The poll thread and the HTTP server each register here and ping while
//! they run. The probe fails when no loop has registered yet, when a loop
//! reports unhealthy, or when one stops pinging past its deadline. Reports
//! come straight from the poll thread, which is not async, so handles write
//! the shared map directly instead of going through a channel.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use tracing::warn;

#[derive(Default, Debug)]
pub struct HealthStatus {
    /// True only if every registered loop is alive and current
    pub healthy: bool,
    /// What each loop last reported, for display
    pub components: HashMap<String, ComponentStatus>,
}

impl IntoResponse for HealthStatus {
    /// 200 when healthy, 500 otherwise, with the per-loop detail in the
    /// body for debugging.
    fn into_response(self) -> Response {
        let body = format!("{self:?}");
        match self.healthy {
            true => (StatusCode::OK, body),
            false => (StatusCode::INTERNAL_SERVER_ERROR, body),
        }
        .into_response()
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ComponentStatus {
    /// Registered but has not pinged yet
    Starting,
    /// Pinged recently; must ping again before the date
    HealthyUntil(chrono::DateTime<Utc>),
    /// Reported unhealthy
    Unhealthy,
    /// Missed its reporting deadline
    Stalled,
}

/// Handed to a loop at registration so it can ping from wherever it runs,
/// async or not.
#[derive(Clone)]
pub struct HealthHandle {
    component: String,
    deadline: chrono::Duration,
    components: Arc<RwLock<HashMap<String, ComponentStatus>>>,
}

impl HealthHandle {
    /// Report healthy. Must be called more often than the registered
    /// deadline; the poll loop does this once per tick.
    pub fn report_healthy(&self) {
        self.report_status(ComponentStatus::HealthyUntil(Utc::now() + self.deadline));
    }

    pub fn report_status(&self, status: ComponentStatus) {
        match self.components.write() {
            Ok(mut components) => {
                components.insert(self.component.clone(), status);
            }
            // Poisoned lock: the probe will fail and the process restart
            Err(_) => warn!(component = %self.component, "poisoned health map"),
        }
    }
}

#[derive(Clone)]
pub struct HealthRegistry {
    name: String,
    components: Arc<RwLock<HashMap<String, ComponentStatus>>>,
}

impl HealthRegistry {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            components: Default::default(),
        }
    }

    /// Register a loop. It shows up as `Starting`, which reads as
    /// unhealthy, until its first ping.
    pub fn register(&self, component: impl Into<String>, deadline: Duration) -> HealthHandle {
        let component = component.into();
        if let Ok(mut components) = self.components.write() {
            components.insert(component.clone(), ComponentStatus::Starting);
        }
        HealthHandle {
            component,
            deadline: chrono::Duration::from_std(deadline)
                .unwrap_or_else(|_| chrono::Duration::zero()),
            components: self.components.clone(),
        }
    }

    /// Combined status over every registered loop. Used as the axum
    /// `/_liveness` handler.
    pub fn get_status(&self) -> HealthStatus {
        let Ok(components) = self.components.read() else {
            warn!("{} health map poisoned", self.name);
            return HealthStatus::default();
        };

        let now = Utc::now();
        let mut status = HealthStatus {
            // Unhealthy until at least one loop has registered
            healthy: !components.is_empty(),
            components: HashMap::with_capacity(components.len()),
        };

        for (name, component) in components.iter() {
            let observed = match component {
                ComponentStatus::HealthyUntil(until) if *until > now => component.clone(),
                ComponentStatus::HealthyUntil(_) => ComponentStatus::Stalled,
                other => other.clone(),
            };
            if !matches!(observed, ComponentStatus::HealthyUntil(_)) {
                status.healthy = false;
            }
            status.components.insert(name.clone(), observed);
        }

        if !status.healthy {
            warn!(
                "{} health check failed: {:?}",
                self.name, status.components
            );
        }
        status
    }
}
