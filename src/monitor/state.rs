//! Per-endpoint failover state
//!
//! Mutated only by the endpoint's own scheduler loop and by the switch
//! coordinator run it triggered; always read as a cloned snapshot so
//! concurrent status queries never see a torn record.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Probe-derived health of an endpoint's active upstream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// No probe has completed yet
    #[default]
    Unknown,
    /// Last probe succeeded
    Healthy,
    /// Last probe failed
    Unhealthy,
}

/// Mutable failover record for one endpoint
#[derive(Debug, Clone, Serialize, Default)]
pub struct FailoverState {
    /// Current health status
    pub status: HealthStatus,
    /// Failed probes since the last success or switch attempt
    pub consecutive_failures: u32,
    /// When the last probe completed
    pub last_check_at: Option<DateTime<Utc>>,
    /// When the last successful probe completed
    pub last_success_at: Option<DateTime<Utc>>,
    /// True for the entire duration of one switch coordinator run
    pub switch_in_flight: bool,
}

impl FailoverState {
    /// Record a successful probe: healthy, counter reset
    pub fn record_success(&mut self) {
        let now = Utc::now();
        self.status = HealthStatus::Healthy;
        self.consecutive_failures = 0;
        self.last_check_at = Some(now);
        self.last_success_at = Some(now);
    }

    /// Record a failed probe and return the new consecutive count
    pub fn record_failure(&mut self) -> u32 {
        self.status = HealthStatus::Unhealthy;
        self.consecutive_failures += 1;
        self.last_check_at = Some(Utc::now());
        self.consecutive_failures
    }
}
