//! Health-monitoring and failover controller
//!
//! One independent scheduler loop per monitored endpoint, a per-endpoint
//! failure-counting state machine, and a switch coordinator with
//! retry/backoff and mutual exclusion. [`MonitorRegistry`] is the entire
//! control surface consumed by the CLI layer.

mod probe;
mod scheduler;
mod state;
mod switch;

pub use probe::{HttpProbe, Probe, ProbeOutcome};
pub use state::{FailoverState, HealthStatus};
pub use switch::SwitchCoordinator;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{Config, EndpointConfig};
use crate::engine::ProxyEngine;
use crate::history::{HistorySink, SwitchEvent, SwitchReason};
use crate::provider::ProviderRegistry;
use crate::upstream::Upstream;
use crate::{Error, Result};

/// Consistent point-in-time view of one endpoint's monitoring state
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    /// Endpoint listen port
    pub endpoint: u16,
    /// Endpoint name
    pub name: String,
    /// Whether a scheduler loop is currently running
    pub running: bool,
    /// Whether monitoring is enabled in configuration
    pub monitoring_enabled: bool,
    /// Active upstream, `None` in direct mode
    pub upstream: Option<Upstream>,
    /// Failover state
    #[serde(flatten)]
    pub state: FailoverState,
}

/// Per-endpoint runtime record: failover state plus loop control.
///
/// The state lock is per endpoint; holding it never blocks any other
/// endpoint's loop or a registry-level operation.
pub(crate) struct EndpointEntry {
    port: u16,
    state: Mutex<FailoverState>,
    cancel: Mutex<Option<CancellationToken>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl EndpointEntry {
    fn new(port: u16) -> Self {
        Self {
            port,
            state: Mutex::new(FailoverState::default()),
            cancel: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    pub(crate) fn snapshot(&self) -> FailoverState {
        self.state.lock().clone()
    }

    pub(crate) fn record_success(&self) {
        self.state.lock().record_success();
    }

    pub(crate) fn record_failure(&self) -> u32 {
        self.state.lock().record_failure()
    }

    /// Atomically claim the switch gate. At most one switch runs per
    /// endpoint; a second request while the gate is held is dropped by
    /// the caller, never queued.
    pub(crate) fn try_begin_switch(&self) -> bool {
        let mut state = self.state.lock();
        if state.switch_in_flight {
            false
        } else {
            state.switch_in_flight = true;
            true
        }
    }

    /// Release the switch gate after an attempt completes.
    ///
    /// Reset-on-attempt policy: the failure counter restarts from zero
    /// whether the switch succeeded or not, so a still-broken upstream
    /// must fail a full threshold of fresh probes before the provider is
    /// contacted again.
    pub(crate) fn end_switch(&self) {
        let mut state = self.state.lock();
        state.switch_in_flight = false;
        state.consecutive_failures = 0;
    }

    fn is_running(&self) -> bool {
        self.cancel
            .lock()
            .as_ref()
            .is_some_and(|token| !token.is_cancelled())
    }
}

/// Shared internals handed to scheduler loops and switch coordinators
pub(crate) struct Inner {
    pub(crate) config: RwLock<Config>,
    pub(crate) config_path: Option<PathBuf>,
    pub(crate) entries: DashMap<u16, Arc<EndpointEntry>>,
    pub(crate) providers: ProviderRegistry,
    pub(crate) engine: Arc<dyn ProxyEngine>,
    pub(crate) history: Arc<dyn HistorySink>,
    pub(crate) probe: Arc<dyn Probe>,
    /// Engine applications serialize across endpoints so two concurrent
    /// switches cannot clobber each other's committed upstream.
    pub(crate) apply_lock: tokio::sync::Mutex<()>,
}

impl Inner {
    /// Current endpoint set, sorted by port for deterministic rendering
    pub(crate) fn endpoint_set(&self) -> Vec<EndpointConfig> {
        let mut endpoints = self.config.read().endpoints.clone();
        endpoints.sort_by_key(|e| e.listen_port);
        endpoints
    }
}

/// Top-level monitoring controller; the only entry point external layers
/// consume.
///
/// All operations are safe to call concurrently with running scheduler
/// loops. The endpoint map is guarded independently of any individual
/// endpoint's state.
pub struct MonitorRegistry {
    inner: Arc<Inner>,
}

impl MonitorRegistry {
    /// Build a registry over an already-validated configuration.
    ///
    /// Endpoints whose upstream fails validation are reported and
    /// skipped; they never prevent other endpoints from registering.
    #[must_use]
    pub fn new(
        config: Config,
        config_path: Option<PathBuf>,
        providers: ProviderRegistry,
        engine: Arc<dyn ProxyEngine>,
        history: Arc<dyn HistorySink>,
        probe: Arc<dyn Probe>,
    ) -> Self {
        let entries = DashMap::new();
        for endpoint in &config.endpoints {
            if let Some(upstream) = &endpoint.upstream {
                if let Err(e) = upstream.validate() {
                    error!(
                        endpoint = endpoint.listen_port,
                        error = %e,
                        "Skipping endpoint with invalid upstream"
                    );
                    continue;
                }
            }
            entries.insert(
                endpoint.listen_port,
                Arc::new(EndpointEntry::new(endpoint.listen_port)),
            );
        }

        Self {
            inner: Arc::new(Inner {
                config: RwLock::new(config),
                config_path,
                entries,
                providers,
                engine,
                history,
                probe,
                apply_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    fn entry(&self, port: u16) -> Result<Arc<EndpointEntry>> {
        self.inner
            .entries
            .get(&port)
            .map(|e| Arc::clone(e.value()))
            .ok_or(Error::EndpointNotFound(port))
    }

    /// Start the monitoring loop for one endpoint. No-op when already
    /// running.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EndpointNotFound`] for unknown ports.
    pub fn start(&self, port: u16) -> Result<()> {
        let entry = self.entry(port)?;

        if entry.is_running() {
            debug!(endpoint = port, "Monitoring already running");
            return Ok(());
        }

        info!(endpoint = port, "Starting monitoring");
        let token = CancellationToken::new();
        *entry.cancel.lock() = Some(token.clone());
        let handle = scheduler::spawn(Arc::clone(&self.inner), Arc::clone(&entry), token);
        *entry.task.lock() = Some(handle);
        Ok(())
    }

    /// Stop the monitoring loop for one endpoint. No-op when already
    /// stopped. The loop observes the signal at the next probe boundary;
    /// a switch already in flight is allowed to complete.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EndpointNotFound`] for unknown ports.
    pub fn stop(&self, port: u16) -> Result<()> {
        let entry = self.entry(port)?;

        let token = entry.cancel.lock().take();
        match token {
            Some(token) => {
                info!(endpoint = port, "Stopping monitoring");
                token.cancel();
            }
            None => debug!(endpoint = port, "Monitoring already stopped"),
        }
        Ok(())
    }

    /// Snapshot one endpoint's status.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EndpointNotFound`] for unknown ports.
    pub fn status(&self, port: u16) -> Result<StatusSnapshot> {
        let entry = self.entry(port)?;
        let endpoint = self
            .inner
            .config
            .read()
            .endpoint(port)
            .cloned()
            .ok_or(Error::EndpointNotFound(port))?;

        Ok(StatusSnapshot {
            endpoint: port,
            name: endpoint.name,
            running: entry.is_running(),
            monitoring_enabled: endpoint.monitoring_enabled,
            upstream: endpoint.upstream,
            state: entry.snapshot(),
        })
    }

    /// Snapshot every registered endpoint, keyed by listen port
    #[must_use]
    pub fn list_statuses(&self) -> HashMap<u16, StatusSnapshot> {
        let ports: Vec<u16> = self.inner.entries.iter().map(|e| *e.key()).collect();
        ports
            .into_iter()
            .filter_map(|port| self.status(port).ok().map(|s| (port, s)))
            .collect()
    }

    /// Manually trigger a switch for one endpoint.
    ///
    /// Bypasses the failure threshold but shares the per-endpoint mutual
    /// exclusion gate with automatic switches.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EndpointNotFound`], [`Error::MonitoringDisabled`],
    /// or [`Error::SwitchInFlight`] when the request cannot start.
    pub async fn switch_now(&self, port: u16) -> Result<SwitchEvent> {
        let _ = self.entry(port)?;
        let monitoring_enabled = self
            .inner
            .config
            .read()
            .endpoint(port)
            .ok_or(Error::EndpointNotFound(port))?
            .monitoring_enabled;
        if !monitoring_enabled {
            return Err(Error::MonitoringDisabled(port));
        }

        SwitchCoordinator::new(Arc::clone(&self.inner))
            .switch(port, SwitchReason::Manual)
            .await
    }

    /// Start monitoring for every endpoint configured with it enabled.
    /// Direct-mode and invalid endpoints are skipped with a log line.
    pub fn start_all(&self) {
        let endpoints = self.inner.config.read().endpoints.clone();
        for endpoint in endpoints {
            if !endpoint.monitoring_enabled {
                continue;
            }
            if endpoint.upstream.is_none() {
                warn!(
                    endpoint = endpoint.listen_port,
                    "Monitoring enabled but endpoint is in direct mode, skipping"
                );
                continue;
            }
            if let Err(e) = self.start(endpoint.listen_port) {
                error!(endpoint = endpoint.listen_port, error = %e, "Failed to start monitoring");
            }
        }
    }

    /// Stop every running loop and wait for them to wind down, bounded
    /// by one probe timeout plus slack per the stop contract.
    pub async fn stop_all(&self) {
        let ports: Vec<u16> = self.inner.entries.iter().map(|e| *e.key()).collect();
        let mut handles: Vec<(u16, JoinHandle<()>)> = Vec::new();
        for port in ports {
            let _ = self.stop(port);
            if let Ok(entry) = self.entry(port) {
                if let Some(handle) = entry.task.lock().take() {
                    handles.push((port, handle));
                }
            }
        }

        let grace = self.inner.config.read().monitoring.check_timeout + Duration::from_secs(1);
        for (port, handle) in handles {
            if tokio::time::timeout(grace, handle).await.is_err() {
                warn!(endpoint = port, "Monitoring loop did not stop in time");
            }
        }
    }

    /// Push the current endpoint set to the proxy engine (startup and
    /// manual config edits).
    ///
    /// # Errors
    ///
    /// Returns [`Error::EngineApply`] when the engine rejects the set.
    pub async fn apply_engine(&self) -> Result<()> {
        let _guard = self.inner.apply_lock.lock().await;
        let endpoints = self.inner.endpoint_set();
        self.inner.engine.apply(&endpoints).await
    }

    /// Clone of the current configuration
    #[must_use]
    pub fn config(&self) -> Config {
        self.inner.config.read().clone()
    }
}
