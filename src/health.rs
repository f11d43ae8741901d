//! Component health reporting and the per-service `/healthz` endpoint.
//!
//! Every component surfaces `{status, issues, stats}`; a service aggregates
//! its components (unhealthy if any component is unhealthy, else degraded
//! if any is degraded).

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub issues: Vec<String>,
    pub stats: serde_json::Value,
}

impl HealthReport {
    pub fn healthy(stats: serde_json::Value) -> Self {
        Self {
            status: HealthStatus::Healthy,
            issues: Vec::new(),
            stats,
        }
    }

    pub fn degraded(issues: Vec<String>, stats: serde_json::Value) -> Self {
        Self {
            status: HealthStatus::Degraded,
            issues,
            stats,
        }
    }

    pub fn unhealthy(issues: Vec<String>, stats: serde_json::Value) -> Self {
        Self {
            status: HealthStatus::Unhealthy,
            issues,
            stats,
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }

    /// Roll component reports up into a service-level report.
    pub fn aggregate(components: BTreeMap<String, HealthReport>) -> Self {
        let mut status = HealthStatus::Healthy;
        let mut issues = Vec::new();

        for (name, report) in &components {
            match report.status {
                HealthStatus::Unhealthy => status = HealthStatus::Unhealthy,
                HealthStatus::Degraded if status == HealthStatus::Healthy => {
                    status = HealthStatus::Degraded
                }
                _ => {}
            }
            for issue in &report.issues {
                issues.push(format!("{name}: {issue}"));
            }
        }

        let stats = serde_json::json!({
            "components": components,
        });

        Self {
            status,
            issues,
            stats,
        }
    }
}

/// A service exposing its aggregated health.
#[async_trait::async_trait]
pub trait HealthSource: Send + Sync + 'static {
    async fn health_check(&self) -> HealthReport;
}

async fn healthz(State(source): State<Arc<dyn HealthSource>>) -> impl IntoResponse {
    let report = source.health_check().await;
    let code = match report.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (code, Json(report))
}

pub fn health_router(source: Arc<dyn HealthSource>) -> Router {
    Router::new().route("/healthz", get(healthz)).with_state(source)
}

/// Serve `/healthz` until the process exits.
pub async fn serve_health(port: u16, source: Arc<dyn HealthSource>) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind health endpoint on {addr}"))?;
    info!(%addr, "health_endpoint_listening");
    axum::serve(listener, health_router(source))
        .await
        .context("health endpoint server failed")
}
