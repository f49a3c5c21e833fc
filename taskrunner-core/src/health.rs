//! Liveness tracking shared by the Worker, Scheduler, and Callback Server.
//!
//! Each of those binaries runs at least one long-lived loop (the claim loop, the
//! tick loop, the HTTP accept loop), and the process can only be trusted to make
//! progress if that loop is still reporting in. `HealthRegistry` lets any number of
//! named components report their own health; the process' overall health is the
//! logical AND of all registered components:
//!   - any component unhealthy ⇒ the process is unhealthy
//!   - all components recently reported healthy ⇒ the process is healthy
//!   - a component that missed its deadline is treated as unhealthy (`Stalled`)
//!
//! Liveness and readiness are kept as separate registries by convention rather than
//! conflated into one status, since a process that is alive but not yet accepting
//! claims has different operational meaning than one that has crashed.

use std::collections::HashMap;
use std::ops::Add;
use std::sync::{Arc, RwLock};

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

#[derive(Default, Debug)]
pub struct HealthStatus {
    /// `true` iff every registered component is currently healthy.
    pub healthy: bool,
    pub components: HashMap<String, ComponentStatus>,
}

impl IntoResponse for HealthStatus {
    fn into_response(self) -> Response {
        let body = format!("{:?}", self);
        match self.healthy {
            true => (StatusCode::OK, body),
            false => (StatusCode::INTERNAL_SERVER_ERROR, body),
        }
        .into_response()
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ComponentStatus {
    /// Set automatically when a component first registers.
    Starting,
    /// Reported healthy, valid until this deadline.
    HealthyUntil(time::OffsetDateTime),
    Unhealthy,
    /// Set automatically once a `HealthyUntil` deadline passes unreported.
    Stalled,
}

struct HealthMessage {
    component: String,
    status: ComponentStatus,
}

/// Handle a component uses to report its own health on a schedule.
pub struct HealthHandle {
    component: String,
    deadline: Duration,
    sender: mpsc::Sender<HealthMessage>,
}

impl HealthHandle {
    /// Report healthy for another `deadline`. Must be called more often than that.
    pub async fn report_healthy(&self) {
        self.report_status(ComponentStatus::HealthyUntil(time::OffsetDateTime::now_utc().add(self.deadline)))
            .await
    }

    pub async fn report_status(&self, status: ComponentStatus) {
        let message = HealthMessage {
            component: self.component.clone(),
            status,
        };
        if let Err(err) = self.sender.send(message).await {
            warn!("failed to report health status: {}", err)
        }
    }

    /// Synchronous variant for call sites without an `.await` point handy.
    pub fn report_healthy_blocking(&self) {
        self.report_status_blocking(ComponentStatus::HealthyUntil(time::OffsetDateTime::now_utc().add(self.deadline)))
    }

    pub fn report_status_blocking(&self, status: ComponentStatus) {
        let message = HealthMessage {
            component: self.component.clone(),
            status,
        };
        if let Err(err) = self.sender.blocking_send(message) {
            warn!("failed to report health status: {}", err)
        }
    }
}

#[derive(Clone)]
pub struct HealthRegistry {
    name: String,
    components: Arc<RwLock<HashMap<String, ComponentStatus>>>,
    sender: mpsc::Sender<HealthMessage>,
}

impl HealthRegistry {
    pub fn new(name: &str) -> Self {
        let (tx, mut rx) = mpsc::channel::<HealthMessage>(16);
        let registry = Self {
            name: name.to_owned(),
            components: Default::default(),
            sender: tx,
        };

        let components = registry.components.clone();
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                match components.write() {
                    Ok(mut map) => {
                        map.insert(message.component, message.status);
                    }
                    Err(_) => warn!("poisoned HealthRegistry mutex"),
                }
            }
        });

        registry
    }

    /// Register a new component, returning a handle it should retain to report its
    /// own health. The component starts in `Starting` until its first report.
    pub async fn register(&self, component: String, deadline: Duration) -> HealthHandle {
        let handle = HealthHandle {
            component,
            deadline,
            sender: self.sender.clone(),
        };
        handle.report_status(ComponentStatus::Starting).await;
        handle
    }

    /// The overall process status, suitable for use as an axum handler body.
    pub fn get_status(&self) -> HealthStatus {
        let components = self.components.read().expect("poisoned HealthRegistry mutex");
        let now = time::OffsetDateTime::now_utc();

        let result = components.iter().fold(
            HealthStatus {
                healthy: !components.is_empty(),
                components: Default::default(),
            },
            |mut acc, (name, status)| {
                match status {
                    ComponentStatus::HealthyUntil(until) if until.gt(&now) => {
                        acc.components.insert(name.clone(), status.clone());
                    }
                    ComponentStatus::HealthyUntil(_) => {
                        acc.healthy = false;
                        acc.components.insert(name.clone(), ComponentStatus::Stalled);
                    }
                    _ => {
                        acc.healthy = false;
                        acc.components.insert(name.clone(), status.clone());
                    }
                }
                acc
            },
        );

        match result.healthy {
            true => info!("{} health check ok", self.name),
            false => warn!("{} health check failed: {:?}", self.name, result.components),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ops::Sub;
    use time::OffsetDateTime;

    async fn eventually<F: Fn() -> bool>(check: F) {
        let deadline = OffsetDateTime::now_utc().add(Duration::seconds(5));
        while !check() && OffsetDateTime::now_utc().lt(&deadline) {
            tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;
        }
        assert!(check());
    }

    #[tokio::test]
    async fn defaults_to_unhealthy_with_no_components() {
        let registry = HealthRegistry::new("liveness");
        assert!(!registry.get_status().healthy);
    }

    #[tokio::test]
    async fn a_single_component_drives_overall_health() {
        let registry = HealthRegistry::new("liveness");
        let handle = registry.register("worker".to_string(), Duration::seconds(30)).await;
        eventually(|| registry.get_status().components.len() == 1).await;
        assert_eq!(registry.get_status().components.get("worker"), Some(&ComponentStatus::Starting));

        handle.report_healthy().await;
        eventually(|| registry.get_status().healthy).await;

        handle.report_status(ComponentStatus::Unhealthy).await;
        eventually(|| !registry.get_status().healthy).await;
    }

    #[tokio::test]
    async fn a_stale_report_is_treated_as_stalled() {
        let registry = HealthRegistry::new("liveness");
        let handle = registry.register("worker".to_string(), Duration::seconds(30)).await;
        handle.report_healthy().await;
        eventually(|| registry.get_status().healthy).await;

        handle
            .report_status(ComponentStatus::HealthyUntil(OffsetDateTime::now_utc().sub(Duration::seconds(1))))
            .await;
        eventually(|| !registry.get_status().healthy).await;
        assert_eq!(registry.get_status().components.get("worker"), Some(&ComponentStatus::Stalled));
    }

    #[tokio::test]
    async fn two_components_must_both_be_healthy() {
        let registry = HealthRegistry::new("liveness");
        let worker = registry.register("worker".to_string(), Duration::seconds(30)).await;
        let scheduler = registry.register("scheduler".to_string(), Duration::seconds(30)).await;
        eventually(|| registry.get_status().components.len() == 2).await;

        worker.report_healthy().await;
        assert!(!registry.get_status().healthy);

        scheduler.report_healthy().await;
        eventually(|| registry.get_status().healthy).await;

        worker.report_status(ComponentStatus::Unhealthy).await;
        eventually(|| !registry.get_status().healthy).await;
    }

    #[test]
    fn health_status_maps_to_http_status_codes() {
        let unhealthy = HealthStatus::default().into_response();
        assert_eq!(unhealthy.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let healthy = HealthStatus {
            healthy: true,
            components: Default::default(),
        }
        .into_response();
        assert_eq!(healthy.status(), StatusCode::OK);
    }
}
