//! Per-endpoint monitoring loop
//!
//! Each monitored endpoint gets its own task so a slow or hung probe on
//! one endpoint never delays checks on any other. Scheduling is
//! fixed-delay: the next cycle starts `check_interval` after the current
//! one completes, which bounds concurrent probes per endpoint to one at
//! the cost of slight interval drift.

use std::sync::Arc;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::switch::SwitchCoordinator;
use super::{EndpointEntry, Inner};
use crate::history::{HealthCheckRecord, SwitchReason};

/// Spawn the monitoring loop for one endpoint
pub(crate) fn spawn(
    inner: Arc<Inner>,
    entry: Arc<EndpointEntry>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(run(inner, entry, cancel))
}

async fn run(inner: Arc<Inner>, entry: Arc<EndpointEntry>, cancel: CancellationToken) {
    let port = entry.port;
    info!(endpoint = port, "Monitoring loop started");

    loop {
        // Cancellation is observed here and right after the probe, never
        // mid-probe; worst-case stop latency is one probe timeout.
        if cancel.is_cancelled() {
            break;
        }

        let monitoring = inner.config.read().monitoring.clone();
        let Some(endpoint) = inner.config.read().endpoint(port).cloned() else {
            warn!(endpoint = port, "Endpoint removed from configuration, stopping loop");
            break;
        };

        if endpoint.monitoring_enabled {
            if let Some(upstream) = endpoint.upstream {
                let outcome = inner
                    .probe
                    .probe(&upstream, &monitoring.check_url, monitoring.check_timeout)
                    .await;

                let failures = if outcome.ok {
                    entry.record_success();
                    debug!(endpoint = port, "Health check passed");
                    0
                } else {
                    let failures = entry.record_failure();
                    warn!(
                        endpoint = port,
                        failures,
                        threshold = monitoring.failure_threshold,
                        error = outcome.error.as_deref().unwrap_or("unknown"),
                        "Health check failed"
                    );
                    failures
                };

                inner.history.record_health_check(&HealthCheckRecord {
                    endpoint: port,
                    upstream: upstream.addr(),
                    ok: outcome.ok,
                    latency_ms: outcome.latency.map(|l| l.as_millis() as u64),
                    error: outcome.error,
                    timestamp: Utc::now(),
                });

                // Stop requested while the probe was in flight: the
                // completed check is recorded, but no new switch starts.
                if cancel.is_cancelled() {
                    break;
                }

                if failures >= monitoring.failure_threshold
                    && !entry.snapshot().switch_in_flight
                {
                    info!(
                        endpoint = port,
                        failures, "Failure threshold reached, triggering switch"
                    );
                    // Detached task: the switch survives a stop() issued
                    // after this point and never blocks other endpoints.
                    let coordinator = SwitchCoordinator::new(Arc::clone(&inner));
                    tokio::spawn(async move {
                        if let Err(e) =
                            coordinator.switch(port, SwitchReason::HealthCheckFailed).await
                        {
                            warn!(endpoint = port, error = %e, "Automatic switch not started");
                        }
                    });
                }
            }
        }

        tokio::select! {
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(monitoring.check_interval) => {}
        }
    }

    info!(endpoint = port, "Monitoring loop stopped");
}
