//! Request and response bodies for the preview routes.

use crate::session::{
    ActionResult, HealthAssessment, HealthLevel, MaintenanceAction, MemorySnapshot, PortUsage,
    PreviewInfo, PreviewStatus,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Per-project preview state. Every field is `null` when no session exists.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewResponse {
    pub status: Option<PreviewStatus>,
    pub port: Option<u16>,
    pub url: Option<String>,
    pub build_logs: Option<Vec<String>>,
    pub started_at: Option<DateTime<Utc>>,
    pub ready_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl From<PreviewInfo> for PreviewResponse {
    fn from(info: PreviewInfo) -> Self {
        Self {
            status: Some(info.status),
            port: Some(info.port),
            url: info.url,
            build_logs: Some(info.build_logs),
            started_at: Some(info.started_at),
            ready_at: info.ready_at,
            error: info.error,
        }
    }
}

impl From<Option<PreviewInfo>> for PreviewResponse {
    fn from(info: Option<PreviewInfo>) -> Self {
        info.map(Self::from).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StopResponse {
    pub stopped: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StopAllResponse {
    pub stopped_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemHealth {
    /// `None` where the platform does not expose memory counters.
    pub memory: Option<MemorySnapshot>,
    /// Seconds since the manager started.
    pub uptime: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolHealth {
    pub active_sessions: usize,
    pub max_sessions: usize,
    pub port_usage: PortUsage,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: HealthLevel,
    pub score: u8,
    pub system: SystemHealth,
    pub preview: PoolHealth,
    pub recommendations: Vec<String>,
}

impl HealthResponse {
    pub fn new(assessment: HealthAssessment, system: SystemHealth, preview: PoolHealth) -> Self {
        Self {
            status: assessment.status,
            score: assessment.score,
            system,
            preview,
            recommendations: assessment.recommendations,
        }
    }
}

/// Body of `POST /preview/health`. The action is parsed by the handler so an
/// unknown name maps to a 400 with the usual error body.
#[derive(Debug, Clone, Deserialize)]
pub struct MaintenanceRequest {
    pub action: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct MaintenanceResponse {
    pub action: MaintenanceAction,
    pub results: Vec<ActionResult>,
}
