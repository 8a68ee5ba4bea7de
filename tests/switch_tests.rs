//! Switch coordinator integration tests
//!
//! Exercises the acquire → validate → apply path, the retry/backoff
//! schedule, and the per-endpoint mutual exclusion gate.

mod common;

use std::sync::atomic::Ordering;
use std::time::Duration;

use common::{
    GatedProvider, ProviderStep, ScriptedProbe, ScriptedProvider, base_config, harness, upstream,
    wait_until,
};
use relayguard::Error;
use relayguard::history::SwitchReason;
use relayguard::upstream::{Protocol, Upstream};

const PORT: u16 = 24000;
const INTERVAL: Duration = Duration::from_secs(30);

#[tokio::test(start_paused = true)]
async fn manual_switch_success_updates_endpoint() {
    let provider = ScriptedProvider::new("pool", vec![ProviderStep::Give(upstream(8))]);
    let h = harness(
        base_config(3, INTERVAL),
        ScriptedProbe::new(vec![], true),
        provider,
    );

    let event = h.registry.switch_now(PORT).await.unwrap();
    assert!(event.success);
    assert_eq!(event.reason, SwitchReason::Manual);
    assert_eq!(event.old_upstream.as_ref().unwrap().addr(), "10.0.0.1:1080");
    assert_eq!(event.new_upstream.as_ref().unwrap().addr(), "10.0.0.8:1080");

    let status = h.registry.status(PORT).unwrap();
    assert_eq!(status.upstream.as_ref().unwrap().addr(), "10.0.0.8:1080");
    assert_eq!(
        h.engine.last_upstream_for(PORT).unwrap().addr(),
        "10.0.0.8:1080"
    );
    assert_eq!(h.history.switches().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn manual_switch_rejected_while_another_in_flight() {
    // Scenario: an automatic switch is blocked inside the provider; a
    // manual request for the same endpoint must be dropped, not queued.
    let probe = ScriptedProbe::always_failing();
    let (provider, gate) = GatedProvider::new("pool", upstream(7));
    let h = harness(base_config(1, INTERVAL), probe, provider.clone());

    h.registry.start(PORT).unwrap();
    wait_until(
        || h.registry.status(PORT).is_ok_and(|s| s.state.switch_in_flight),
        Duration::from_secs(600),
        "automatic switch in flight",
    )
    .await;

    let err = h.registry.switch_now(PORT).await.unwrap_err();
    assert!(matches!(err, Error::SwitchInFlight(p) if p == PORT));
    // A dropped request is not an attempt: nothing recorded
    assert!(h.history.switches().is_empty());

    // The original switch proceeds unaffected once the provider answers
    gate.add_permits(1);
    wait_until(
        || !h.history.switches().is_empty(),
        Duration::from_secs(600),
        "original switch completion",
    )
    .await;

    let switches = h.history.switches();
    assert_eq!(switches.len(), 1);
    assert!(switches[0].success);
    assert_eq!(switches[0].reason, SwitchReason::HealthCheckFailed);
    assert_eq!(switches[0].new_upstream.as_ref().unwrap().addr(), "10.0.0.7:1080");

    h.registry.stop_all().await;
}

#[tokio::test(start_paused = true)]
async fn transient_provider_errors_retry_with_increasing_delays() {
    // Scenario: the provider fails transiently on all attempts; exactly
    // three calls with 1s and 2s backoff, then a failed event and an
    // untouched endpoint.
    let provider = ScriptedProvider::new(
        "pool",
        vec![
            ProviderStep::Transient("gateway timeout"),
            ProviderStep::Transient("gateway timeout"),
            ProviderStep::Transient("gateway timeout"),
        ],
    );
    let h = harness(
        base_config(3, INTERVAL),
        ScriptedProbe::new(vec![], true),
        provider.clone(),
    );

    let event = h.registry.switch_now(PORT).await.unwrap();
    assert!(!event.success);
    assert!(event.new_upstream.is_none());
    assert!(event.error.as_deref().unwrap().contains("gateway timeout"));

    assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
    let times = provider.call_times.lock();
    let first_delay = times[1] - times[0];
    let second_delay = times[2] - times[1];
    assert!(
        first_delay >= Duration::from_secs(1) && first_delay < Duration::from_secs(2),
        "first retry after {first_delay:?}"
    );
    assert!(
        second_delay >= Duration::from_secs(2) && second_delay < Duration::from_secs(4),
        "second retry after {second_delay:?}"
    );
    drop(times);

    // Old upstream retained, engine never touched
    let status = h.registry.status(PORT).unwrap();
    assert_eq!(status.upstream.as_ref().unwrap().addr(), "10.0.0.1:1080");
    assert_eq!(h.engine.apply_count(), 0);
    assert_eq!(h.history.switches().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn fatal_provider_error_aborts_without_retry() {
    let provider = ScriptedProvider::new(
        "pool",
        vec![ProviderStep::Fatal("malformed provider config")],
    );
    let h = harness(
        base_config(3, INTERVAL),
        ScriptedProbe::new(vec![], true),
        provider.clone(),
    );

    let event = h.registry.switch_now(PORT).await.unwrap();
    assert!(!event.success);
    assert_eq!(provider.calls.load(Ordering::SeqCst), 1, "no retries consumed");
    assert_eq!(h.engine.apply_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn invalid_candidate_fails_like_acquisition() {
    let bad = Upstream::new("", 0, Protocol::Socks5);
    let provider = ScriptedProvider::new("pool", vec![ProviderStep::Give(bad)]);
    let h = harness(
        base_config(3, INTERVAL),
        ScriptedProbe::new(vec![], true),
        provider,
    );

    let event = h.registry.switch_now(PORT).await.unwrap();
    assert!(!event.success);
    assert!(event.new_upstream.is_some(), "candidate kept for diagnostics");
    assert!(event.error.as_deref().unwrap().contains("Validation"));
    assert_eq!(h.engine.apply_count(), 0);

    let status = h.registry.status(PORT).unwrap();
    assert_eq!(status.upstream.as_ref().unwrap().addr(), "10.0.0.1:1080");
}

#[tokio::test(start_paused = true)]
async fn engine_rejection_leaves_upstream_unchanged() {
    let provider = ScriptedProvider::new("pool", vec![ProviderStep::Give(upstream(5))]);
    let h = harness(
        base_config(3, INTERVAL),
        ScriptedProbe::new(vec![], true),
        provider,
    );
    h.engine.fail.store(true, Ordering::SeqCst);

    let event = h.registry.switch_now(PORT).await.unwrap();
    assert!(!event.success);
    assert!(event.error.as_deref().unwrap().contains("Engine apply"));
    assert_eq!(h.engine.apply_count(), 1);

    // No partial commit
    let status = h.registry.status(PORT).unwrap();
    assert_eq!(status.upstream.as_ref().unwrap().addr(), "10.0.0.1:1080");
}

#[tokio::test(start_paused = true)]
async fn switch_now_guards_on_endpoint_state() {
    let provider = ScriptedProvider::new("pool", vec![]);
    let mut config = base_config(3, INTERVAL);
    config.endpoints[0].monitoring_enabled = false;
    let h = harness(config, ScriptedProbe::new(vec![], true), provider);

    assert!(matches!(
        h.registry.switch_now(PORT).await.unwrap_err(),
        Error::MonitoringDisabled(p) if p == PORT
    ));
    assert!(matches!(
        h.registry.switch_now(9).await.unwrap_err(),
        Error::EndpointNotFound(9)
    ));
    assert!(h.history.switches().is_empty());
}

#[tokio::test(start_paused = true)]
async fn switch_gate_released_after_attempt() {
    // A failed attempt must release the gate so a later one can run.
    let provider = ScriptedProvider::new(
        "pool",
        vec![
            ProviderStep::Fatal("pool exhausted"),
            ProviderStep::Give(upstream(6)),
        ],
    );
    let h = harness(
        base_config(3, INTERVAL),
        ScriptedProbe::new(vec![], true),
        provider,
    );

    let first = h.registry.switch_now(PORT).await.unwrap();
    assert!(!first.success);
    assert!(!h.registry.status(PORT).unwrap().state.switch_in_flight);

    let second = h.registry.switch_now(PORT).await.unwrap();
    assert!(second.success);
    assert_eq!(
        h.registry.status(PORT).unwrap().upstream.unwrap().addr(),
        "10.0.0.6:1080"
    );
}
