//! Switch coordination
//!
//! One logical run per switch attempt: acquire a replacement upstream
//! from the endpoint's provider (with exponential backoff), validate it,
//! apply it through the proxy engine, and record the outcome. Exactly one
//! [`SwitchEvent`] is appended per attempt; requests rejected by the
//! mutual exclusion gate are dropped, not queued, and record nothing.

use std::sync::Arc;
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use chrono::Utc;
use tracing::{error, info, warn};

use super::Inner;
use crate::config::EndpointConfig;
use crate::history::{SwitchEvent, SwitchReason};
use crate::upstream::Upstream;
use crate::{Error, Result};

/// Orchestrates one switch attempt for one endpoint
pub struct SwitchCoordinator {
    inner: Arc<Inner>,
}

impl SwitchCoordinator {
    pub(crate) fn new(inner: Arc<Inner>) -> Self {
        Self { inner }
    }

    /// Run one switch attempt.
    ///
    /// Returns the recorded [`SwitchEvent`] - also on acquisition,
    /// validation, and apply failures, which leave the active upstream
    /// unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EndpointNotFound`] or [`Error::SwitchInFlight`]
    /// when no attempt was started (and no event recorded).
    pub async fn switch(&self, port: u16, reason: SwitchReason) -> Result<SwitchEvent> {
        let entry = self
            .inner
            .entries
            .get(&port)
            .map(|e| Arc::clone(e.value()))
            .ok_or(Error::EndpointNotFound(port))?;
        let endpoint = self
            .inner
            .config
            .read()
            .endpoint(port)
            .cloned()
            .ok_or(Error::EndpointNotFound(port))?;

        // Mutual exclusion: manual and automatic requests share this
        // gate; the loser is dropped, never queued.
        if !entry.try_begin_switch() {
            warn!(endpoint = port, ?reason, "Switch request dropped: one already in flight");
            return Err(Error::SwitchInFlight(port));
        }

        info!(endpoint = port, ?reason, "Switch started");
        let old_upstream = endpoint.upstream.clone();
        let outcome = self.acquire_and_apply(&endpoint).await;
        entry.end_switch();

        let event = match outcome {
            Ok(new_upstream) => {
                let old = old_upstream
                    .as_ref()
                    .map_or_else(|| "direct".to_string(), Upstream::addr);
                info!(
                    endpoint = port,
                    old = %old,
                    new = %new_upstream.addr(),
                    "Switch completed"
                );
                SwitchEvent {
                    endpoint: port,
                    old_upstream,
                    new_upstream: Some(new_upstream),
                    reason,
                    success: true,
                    error: None,
                    timestamp: Utc::now(),
                }
            }
            Err((candidate, e)) => {
                error!(endpoint = port, error = %e, "Switch failed, keeping current upstream");
                SwitchEvent {
                    endpoint: port,
                    old_upstream,
                    new_upstream: candidate,
                    reason,
                    success: false,
                    error: Some(e.to_string()),
                    timestamp: Utc::now(),
                }
            }
        };

        self.inner.history.record_switch(&event);
        Ok(event)
    }

    /// Acquire, validate, apply, commit. Any failure carries the
    /// candidate (when one existed) for the event record.
    async fn acquire_and_apply(
        &self,
        endpoint: &EndpointConfig,
    ) -> std::result::Result<Upstream, (Option<Upstream>, Error)> {
        let port = endpoint.listen_port;

        let provider_id = endpoint.provider.clone().ok_or_else(|| {
            (
                None,
                Error::ProviderNotFound(format!("endpoint {port} has no provider configured")),
            )
        })?;
        let provider = self
            .inner
            .providers
            .get(&provider_id)
            .map_err(|e| (None, e))?;

        let (max_attempts, initial_backoff) = {
            let config = self.inner.config.read();
            config
                .provider(&provider_id)
                .map_or((3, Duration::from_secs(1)), |p| {
                    (p.retry_attempts, p.retry_initial_backoff)
                })
        };

        // Exponential backoff on retryable errors only; a non-retryable
        // error aborts without consuming the remaining attempts.
        let fetch = move || {
            let provider = Arc::clone(&provider);
            async move { provider.fetch().await }
        };
        let candidate = fetch
            .retry(
                ExponentialBuilder::default()
                    .with_min_delay(initial_backoff)
                    .with_factor(2.0)
                    .with_max_times(max_attempts.saturating_sub(1) as usize),
            )
            .when(Error::is_retryable)
            .notify(|err: &Error, delay: Duration| {
                warn!(
                    endpoint = port,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Upstream acquisition failed, retrying"
                );
            })
            .await
            .map_err(|e| (None, e))?;

        candidate
            .validate()
            .map_err(|e| (Some(candidate.clone()), e))?;

        // Serialize engine applications so a concurrent switch on another
        // endpoint cannot apply a set missing this commit.
        let _guard = self.inner.apply_lock.lock().await;

        let mut endpoints = self.inner.endpoint_set();
        if let Some(target) = endpoints.iter_mut().find(|e| e.listen_port == port) {
            target.upstream = Some(candidate.clone());
        }
        self.inner
            .engine
            .apply(&endpoints)
            .await
            .map_err(|e| (Some(candidate.clone()), e))?;

        // Apply succeeded: commit the new upstream and persist it.
        {
            let mut config = self.inner.config.write();
            let _ = config.set_upstream(port, Some(candidate.clone()));
        }
        if let Some(path) = &self.inner.config_path {
            let snapshot = self.inner.config.read().clone();
            if let Err(e) = snapshot.save(path) {
                warn!(endpoint = port, error = %e, "Failed to persist switched configuration");
            }
        }

        Ok(candidate)
    }
}
