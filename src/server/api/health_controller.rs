use std::time::Duration;

use axum::Extension;
use axum::Json;
use axum::http::StatusCode;
use chrono::Utc;

use crate::logger::Logger;
use crate::server::dtos::health_dto::{HealthResponse, HealthStatus, SnapshotHealth};
use crate::server::services::edge_services::EdgeServices;
use crate::server::{get_app_version, get_uptime_seconds};

fn snapshot_health(age: Option<Duration>) -> SnapshotHealth {
    SnapshotHealth {
        loaded: age.is_some(),
        age_seconds: age.map(|a| a.as_secs()),
    }
}

/// health endpoint, never touches the network so it stays cheap for load balancers
pub async fn health_endpoint(
    Extension(services): Extension<EdgeServices>,
) -> (StatusCode, Json<HealthResponse>) {
    let catalog = snapshot_health(services.catalog_snapshot.age().await);
    let guide = snapshot_health(services.guide_snapshot.age().await);

    // a cold cache still serves, the next api call fetches
    let status = if catalog.loaded && guide.loaded {
        HealthStatus::Healthy
    } else {
        HealthStatus::Degraded
    };

    let response = HealthResponse {
        status,
        timestamp: Utc::now(),
        uptime_seconds: get_uptime_seconds(),
        version: get_app_version().to_string(),
        environment: Logger::environment_name(services.config.cargo_env).to_string(),
        catalog,
        guide,
    };

    (StatusCode::OK, Json(response))
}
