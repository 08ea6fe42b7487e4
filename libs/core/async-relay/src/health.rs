//! Dependency health
//!
//! - [`StartupHealthGate`] blocks startup until every dependency answers, or fails
//!   with `HealthCheckFailed` after `max_retries` attempts on one of them.
//! - [`ConnectionHealthState`] keeps the last known reachability per dependency and
//!   is refreshed by the gate, by `/ready`, and by the scheduled health job.
//! - [`health_router`] exposes `/health`, `/ready` and `/metrics`.

use async_trait::async_trait;
use axum::{
    Json, Router,
    extract::State,
    http::{StatusCode, header},
    response::IntoResponse,
    routing::get,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Value, json};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, error, info, warn};

use crate::broker::ResilientBroker;
use crate::config::HealthGateConfig;
use crate::error::{ClientError, RelayError};
use crate::metrics::{RelayMetrics, render_metrics};
use crate::store::KeyValueStore;

/// Last observed state of one dependency
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DependencyStatus {
    pub reachable: bool,
    pub last_checked: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Shared, cheaply cloneable reachability map
#[derive(Clone, Default)]
pub struct ConnectionHealthState {
    inner: Arc<RwLock<HashMap<String, DependencyStatus>>>,
}

impl ConnectionHealthState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, dependency: &str, result: &Result<(), ClientError>) {
        let status = DependencyStatus {
            reachable: result.is_ok(),
            last_checked: Utc::now(),
            error: result.as_ref().err().map(|e| e.to_string()),
        };
        RelayMetrics::dependency_up(dependency, status.reachable);
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(dependency.to_string(), status);
    }

    pub fn get(&self, dependency: &str) -> Option<DependencyStatus> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(dependency)
            .cloned()
    }

    /// Sorted copy for reporting
    pub fn snapshot(&self) -> BTreeMap<String, DependencyStatus> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// True when every recorded dependency was reachable at its last check
    pub fn all_reachable(&self) -> bool {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .all(|s| s.reachable)
    }
}

#[async_trait]
pub trait HealthProbe: Send + Sync + 'static {
    fn name(&self) -> &str;

    async fn check(&self) -> Result<(), ClientError>;
}

/// PING through the broker connection
pub struct BrokerProbe {
    broker: ResilientBroker,
}

impl BrokerProbe {
    pub fn new(broker: ResilientBroker) -> Self {
        Self { broker }
    }
}

#[async_trait]
impl HealthProbe for BrokerProbe {
    fn name(&self) -> &str {
        "broker"
    }

    async fn check(&self) -> Result<(), ClientError> {
        self.broker.ping().await
    }
}

/// PING through the result/lock store connection
pub struct StoreProbe {
    store: Arc<dyn KeyValueStore>,
}

impl StoreProbe {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl HealthProbe for StoreProbe {
    fn name(&self) -> &str {
        "store"
    }

    async fn check(&self) -> Result<(), ClientError> {
        self.store.ping().await
    }
}

#[derive(Clone)]
pub struct StartupHealthGate {
    config: HealthGateConfig,
    probes: Vec<Arc<dyn HealthProbe>>,
    state: ConnectionHealthState,
}

impl StartupHealthGate {
    pub fn new(config: HealthGateConfig, state: ConnectionHealthState) -> Self {
        Self {
            config,
            probes: Vec::new(),
            state,
        }
    }

    /// Probes are checked in the order they are added
    pub fn with_probe(mut self, probe: Arc<dyn HealthProbe>) -> Self {
        self.probes.push(probe);
        self
    }

    pub fn state(&self) -> &ConnectionHealthState {
        &self.state
    }

    pub fn probe_names(&self) -> Vec<&str> {
        self.probes.iter().map(|p| p.name()).collect()
    }

    /// Check each dependency in turn, retrying with a fixed delay.
    ///
    /// Returns `HealthCheckFailed` for the first dependency that never answers;
    /// later dependencies are not checked.
    pub async fn run(&self) -> Result<(), RelayError> {
        if !self.config.enabled {
            info!("Startup health gate disabled");
            return Ok(());
        }

        let max_attempts = self.config.max_retries.max(1);

        for probe in &self.probes {
            let name = probe.name();
            let mut attempt = 0;

            loop {
                attempt += 1;
                let result = probe.check().await;
                self.state.record(name, &result);

                match result {
                    Ok(()) => {
                        info!(dependency = %name, attempt, "Dependency is reachable");
                        break;
                    }
                    Err(e) if attempt >= max_attempts => {
                        error!(dependency = %name, attempts = attempt, error = %e, "Dependency never became reachable");
                        return Err(RelayError::HealthCheckFailed {
                            dependency: name.to_string(),
                            attempts: attempt,
                            message: e.to_string(),
                        });
                    }
                    Err(e) => {
                        warn!(
                            dependency = %name,
                            attempt,
                            max_attempts,
                            retry_in_secs = self.config.interval.as_secs_f64(),
                            error = %e,
                            "Dependency not reachable yet"
                        );
                        tokio::time::sleep(self.config.interval).await;
                    }
                }
            }
        }

        info!(dependencies = self.probes.len(), "All dependencies reachable");
        Ok(())
    }

    /// Probe one dependency once and record the result. `None` for an unknown name.
    pub async fn check_now(&self, dependency: &str) -> Option<bool> {
        let probe = self.probes.iter().find(|p| p.name() == dependency)?;
        let result = probe.check().await;
        self.state.record(dependency, &result);
        Some(result.is_ok())
    }

    /// Probe every dependency once; true when all answered
    pub async fn check_all(&self) -> bool {
        let mut healthy = true;
        for probe in &self.probes {
            let result = probe.check().await;
            if let Err(e) = &result {
                debug!(dependency = %probe.name(), error = %e, "Health probe failed");
                healthy = false;
            }
            self.state.record(probe.name(), &result);
        }
        healthy
    }
}

/// State for the health endpoints
#[derive(Clone)]
pub struct HealthState {
    pub gate: StartupHealthGate,
    pub app_name: String,
    pub app_version: String,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub name: String,
    pub version: String,
}

pub fn health_router(state: HealthState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

/// Liveness: answers whenever the process is serving
pub async fn health_handler(State(state): State<HealthState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        name: state.app_name,
        version: state.app_version,
    })
}

/// Readiness: re-probes every dependency
pub async fn ready_handler(State(state): State<HealthState>) -> (StatusCode, Json<Value>) {
    let ready = state.gate.check_all().await;
    let checks = state.gate.state().snapshot();

    let (code, status) = if ready {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not_ready")
    };

    (code, Json(json!({ "status": status, "checks": checks })))
}

pub async fn metrics_handler() -> impl IntoResponse {
    match render_metrics() {
        Some(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            body,
        )
            .into_response(),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            "Metrics recorder not installed".to_string(),
        )
            .into_response(),
    }
}
