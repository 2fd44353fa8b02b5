//! System-wide health scoring for the preview pool.
//!
//! Everything here is a pure function of the counters passed in; the manager
//! gathers the counters, this module only judges them.

use crate::error::PreviewError;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Free-port count below which the pool counts as nearly exhausted.
const LOW_FREE_PORTS: usize = 2;
/// Memory usage (percent) that starts costing score.
const MEMORY_WARN_PERCENT: f64 = 75.0;
/// Memory usage (percent) treated as critical.
const MEMORY_CRITICAL_PERCENT: f64 = 90.0;

/// Counters the score is derived from.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct HealthInputs {
    pub active_sessions: usize,
    /// Soft cap on concurrently active previews.
    pub max_sessions: usize,
    pub pool_capacity: usize,
    pub free_ports: usize,
    /// Failed records still held in the session table.
    pub failed_sessions: usize,
    /// Optional externally supplied memory usage, 0..=100.
    pub memory_percent: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthLevel {
    Healthy,
    Warning,
    Critical,
}

impl HealthLevel {
    pub fn from_score(score: u8) -> Self {
        match score {
            80..=100 => HealthLevel::Healthy,
            50..=79 => HealthLevel::Warning,
            _ => HealthLevel::Critical,
        }
    }
}

impl std::fmt::Display for HealthLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthLevel::Healthy => write!(f, "healthy"),
            HealthLevel::Warning => write!(f, "warning"),
            HealthLevel::Critical => write!(f, "critical"),
        }
    }
}

/// Score, level and advice for one set of inputs.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthAssessment {
    pub status: HealthLevel,
    pub score: u8,
    pub recommendations: Vec<String>,
}

pub fn assess(inputs: &HealthInputs) -> HealthAssessment {
    let score = health_score(inputs);
    HealthAssessment {
        status: HealthLevel::from_score(score),
        score,
        recommendations: recommendations(inputs),
    }
}

/// 0..=100, higher is healthier.
pub fn health_score(inputs: &HealthInputs) -> u8 {
    let mut score: i64 = 100;

    if inputs.pool_capacity > 0 {
        let utilization = inputs.active_sessions as f64 / inputs.pool_capacity as f64;
        score -= (utilization.min(1.0) * 30.0).round() as i64;
    }

    if inputs.free_ports == 0 {
        score -= 50;
    } else if inputs.free_ports < LOW_FREE_PORTS {
        score -= 40;
    }

    if inputs.active_sessions > inputs.max_sessions {
        let excess = (inputs.active_sessions - inputs.max_sessions).min(5) as i64;
        score -= 25 + 5 * excess;
    }

    score -= (inputs.failed_sessions as i64 * 5).min(15);

    match inputs.memory_percent {
        Some(m) if m >= MEMORY_CRITICAL_PERCENT => score -= 25,
        Some(m) if m >= MEMORY_WARN_PERCENT => score -= 10,
        _ => {}
    }

    score.clamp(0, 100) as u8
}

/// Threshold rules, evaluated in a fixed order.
pub fn recommendations(inputs: &HealthInputs) -> Vec<String> {
    let mut out = Vec::new();

    if inputs.free_ports == 0 {
        out.push("Port pool exhausted: stop unused previews or widen the port range".to_string());
    } else if inputs.free_ports < LOW_FREE_PORTS {
        out.push(format!(
            "Port pool nearly exhausted ({} free): stop unused previews",
            inputs.free_ports
        ));
    }

    if inputs.active_sessions > inputs.max_sessions {
        out.push(format!(
            "Active previews ({}) exceed the soft cap of {}: run cleanup",
            inputs.active_sessions, inputs.max_sessions
        ));
    } else if inputs.max_sessions > 0 && inputs.active_sessions * 5 >= inputs.max_sessions * 4 {
        out.push("Active sessions high: consider running cleanup".to_string());
    }

    if inputs.failed_sessions > 0 {
        out.push(format!(
            "{} failed preview record(s) retained: run gc to clear them",
            inputs.failed_sessions
        ));
    }

    match inputs.memory_percent {
        Some(m) if m >= MEMORY_CRITICAL_PERCENT => {
            out.push(format!("Memory usage critical ({m:.0}%): restart previews"));
        }
        Some(m) if m >= MEMORY_WARN_PERCENT => {
            out.push(format!("Memory usage elevated ({m:.0}%): monitor closely"));
        }
        _ => {}
    }

    out
}

/// Maintenance operations accepted by the health endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MaintenanceAction {
    /// Stop every preview and purge the records.
    Cleanup,
    /// Restart every active preview.
    Restart,
    /// Drop terminal records and idle bookkeeping.
    Gc,
}

impl FromStr for MaintenanceAction {
    type Err = PreviewError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cleanup" => Ok(MaintenanceAction::Cleanup),
            "restart" => Ok(MaintenanceAction::Restart),
            "gc" => Ok(MaintenanceAction::Gc),
            other => Err(PreviewError::UnknownAction(other.to_string())),
        }
    }
}

impl std::fmt::Display for MaintenanceAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MaintenanceAction::Cleanup => write!(f, "cleanup"),
            MaintenanceAction::Restart => write!(f, "restart"),
            MaintenanceAction::Gc => write!(f, "gc"),
        }
    }
}

/// Resident memory of this process and of the host, where the OS exposes it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemorySnapshot {
    pub rss_bytes: u64,
    pub total_bytes: u64,
    pub percent: f64,
}

#[cfg(target_os = "linux")]
pub fn memory_snapshot() -> Option<MemorySnapshot> {
    fn kib_field(text: &str, key: &str) -> Option<u64> {
        text.lines()
            .find(|l| l.starts_with(key))?
            .split_whitespace()
            .nth(1)?
            .parse::<u64>()
            .ok()
            .map(|kib| kib * 1024)
    }

    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
    let rss_bytes = kib_field(&status, "VmRSS:")?;
    let total_bytes = kib_field(&meminfo, "MemTotal:")?;
    let available = kib_field(&meminfo, "MemAvailable:").unwrap_or(total_bytes);
    let percent = if total_bytes == 0 {
        0.0
    } else {
        (total_bytes.saturating_sub(available)) as f64 * 100.0 / total_bytes as f64
    };
    Some(MemorySnapshot {
        rss_bytes,
        total_bytes,
        percent,
    })
}

#[cfg(not(target_os = "linux"))]
pub fn memory_snapshot() -> Option<MemorySnapshot> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn idle() -> HealthInputs {
        HealthInputs {
            active_sessions: 0,
            max_sessions: 8,
            pool_capacity: 10,
            free_ports: 10,
            failed_sessions: 0,
            memory_percent: None,
        }
    }

    #[test]
    fn idle_pool_is_fully_healthy() {
        let report = assess(&idle());
        assert_eq!(report.score, 100);
        assert_eq!(report.status, HealthLevel::Healthy);
        assert!(report.recommendations.is_empty());
    }

    #[test]
    fn near_exhaustion_is_penalized_heavily() {
        let inputs = HealthInputs {
            active_sessions: 9,
            max_sessions: 10,
            free_ports: 1,
            ..idle()
        };
        let score = health_score(&inputs);
        assert!(score < 50, "score {score}");
        assert_eq!(HealthLevel::from_score(score), HealthLevel::Critical);
        assert!(recommendations(&inputs)[0].contains("nearly exhausted"));
    }

    #[test]
    fn exceeding_soft_cap_costs_score() {
        let under = HealthInputs {
            active_sessions: 4,
            free_ports: 6,
            max_sessions: 4,
            ..idle()
        };
        let over = HealthInputs {
            active_sessions: 5,
            free_ports: 5,
            ..under
        };
        assert!(health_score(&over) + 25 <= health_score(&under));
        assert!(recommendations(&over)
            .iter()
            .any(|r| r.contains("exceed the soft cap")));
    }

    #[test]
    fn score_is_deterministic_and_clamped() {
        let worst = HealthInputs {
            active_sessions: 50,
            max_sessions: 1,
            pool_capacity: 50,
            free_ports: 0,
            failed_sessions: 20,
            memory_percent: Some(99.0),
        };
        assert_eq!(health_score(&worst), 0);
        assert_eq!(health_score(&worst), health_score(&worst));
    }

    #[test]
    fn memory_and_failures_show_up_in_advice() {
        let inputs = HealthInputs {
            failed_sessions: 2,
            memory_percent: Some(80.0),
            ..idle()
        };
        let recs = recommendations(&inputs);
        assert!(recs.iter().any(|r| r.contains("run gc")));
        assert!(recs.iter().any(|r| r.contains("Memory usage elevated")));
        assert_eq!(health_score(&inputs), 80);
    }

    #[test]
    fn parses_maintenance_actions() {
        assert_eq!("cleanup".parse::<MaintenanceAction>().unwrap(), MaintenanceAction::Cleanup);
        assert_eq!(" GC ".parse::<MaintenanceAction>().unwrap(), MaintenanceAction::Gc);
        assert!(matches!(
            "reboot".parse::<MaintenanceAction>(),
            Err(PreviewError::UnknownAction(_))
        ));
    }

    #[test]
    fn level_thresholds() {
        assert_eq!(HealthLevel::from_score(80), HealthLevel::Healthy);
        assert_eq!(HealthLevel::from_score(79), HealthLevel::Warning);
        assert_eq!(HealthLevel::from_score(50), HealthLevel::Warning);
        assert_eq!(HealthLevel::from_score(49), HealthLevel::Critical);
    }
}
