use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    /// serving, but nothing has been fetched from the catalog or guide source yet
    Degraded,
}

#[derive(Debug, Serialize)]
pub struct SnapshotHealth {
    pub loaded: bool,
    pub age_seconds: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub timestamp: DateTime<Utc>,
    pub uptime_seconds: u64,
    pub version: String,
    pub environment: String,
    pub catalog: SnapshotHealth,
    pub guide: SnapshotHealth,
}
