//! Shared fakes for monitor integration tests
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use relayguard::config::{Config, EndpointConfig, MonitoringConfig, ProviderConfig};
use relayguard::engine::ProxyEngine;
use relayguard::history::{HistorySink, MemoryHistory};
use relayguard::monitor::{MonitorRegistry, Probe, ProbeOutcome};
use relayguard::provider::{ExtractionConfig, ProviderRegistry, UpstreamProvider};
use relayguard::upstream::{Protocol, Upstream};
use relayguard::{Error, Result};

/// Probe that replays a scripted sequence of outcomes, then a default
pub struct ScriptedProbe {
    script: Mutex<VecDeque<bool>>,
    default_ok: bool,
}

impl ScriptedProbe {
    pub fn new(script: Vec<bool>, default_ok: bool) -> Self {
        Self {
            script: Mutex::new(script.into()),
            default_ok,
        }
    }

    pub fn always_failing() -> Self {
        Self::new(Vec::new(), false)
    }
}

#[async_trait]
impl Probe for ScriptedProbe {
    async fn probe(&self, _: &Upstream, _: &str, _: Duration) -> ProbeOutcome {
        let ok = self.script.lock().pop_front().unwrap_or(self.default_ok);
        if ok {
            ProbeOutcome {
                ok: true,
                latency: Some(Duration::from_millis(5)),
                error: None,
            }
        } else {
            ProbeOutcome {
                ok: false,
                latency: None,
                error: Some("connection refused".to_string()),
            }
        }
    }
}

/// One scripted provider response
pub enum ProviderStep {
    Give(Upstream),
    Transient(&'static str),
    Fatal(&'static str),
}

/// Provider replaying scripted steps; records call count and times
pub struct ScriptedProvider {
    id: String,
    steps: Mutex<VecDeque<ProviderStep>>,
    pub calls: AtomicU32,
    pub call_times: Mutex<Vec<tokio::time::Instant>>,
}

impl ScriptedProvider {
    pub fn new(id: &str, steps: Vec<ProviderStep>) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            steps: Mutex::new(steps.into()),
            calls: AtomicU32::new(0),
            call_times: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl UpstreamProvider for ScriptedProvider {
    fn id(&self) -> &str {
        &self.id
    }

    async fn fetch(&self) -> Result<Upstream> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.call_times.lock().push(tokio::time::Instant::now());
        match self.steps.lock().pop_front() {
            Some(ProviderStep::Give(upstream)) => Ok(upstream),
            Some(ProviderStep::Transient(msg)) => Err(Error::provider_transient(msg)),
            Some(ProviderStep::Fatal(msg)) => Err(Error::provider_fatal(msg)),
            None => Err(Error::provider_transient("script exhausted")),
        }
    }
}

/// Provider that blocks until released, then yields a fixed upstream
pub struct GatedProvider {
    id: String,
    gate: Arc<tokio::sync::Semaphore>,
    result: Upstream,
    pub calls: AtomicU32,
}

impl GatedProvider {
    pub fn new(id: &str, result: Upstream) -> (Arc<Self>, Arc<tokio::sync::Semaphore>) {
        let gate = Arc::new(tokio::sync::Semaphore::new(0));
        let provider = Arc::new(Self {
            id: id.to_string(),
            gate: Arc::clone(&gate),
            result,
            calls: AtomicU32::new(0),
        });
        (provider, gate)
    }
}

#[async_trait]
impl UpstreamProvider for GatedProvider {
    fn id(&self) -> &str {
        &self.id
    }

    async fn fetch(&self) -> Result<Upstream> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.gate.acquire().await.expect("gate closed").forget();
        Ok(self.result.clone())
    }
}

/// Engine that records every applied endpoint set
#[derive(Default)]
pub struct RecordingEngine {
    pub applies: Mutex<Vec<Vec<EndpointConfig>>>,
    pub fail: AtomicBool,
}

impl RecordingEngine {
    pub fn apply_count(&self) -> usize {
        self.applies.lock().len()
    }

    pub fn last_upstream_for(&self, port: u16) -> Option<Upstream> {
        self.applies
            .lock()
            .last()?
            .iter()
            .find(|e| e.listen_port == port)?
            .upstream
            .clone()
    }
}

#[async_trait]
impl ProxyEngine for RecordingEngine {
    async fn apply(&self, endpoints: &[EndpointConfig]) -> Result<()> {
        self.applies.lock().push(endpoints.to_vec());
        if self.fail.load(Ordering::SeqCst) {
            Err(Error::EngineApply("rejected by test engine".to_string()))
        } else {
            Ok(())
        }
    }
}

pub fn upstream(octet: u8) -> Upstream {
    Upstream::new(format!("10.0.0.{octet}"), 1080, Protocol::Socks5)
}

/// One monitored endpoint on port 24000 backed by provider "pool"
pub fn base_config(failure_threshold: u32, check_interval: Duration) -> Config {
    Config {
        monitoring: MonitoringConfig {
            check_interval,
            failure_threshold,
            check_timeout: Duration::from_secs(2),
            check_url: "http://check.invalid".to_string(),
        },
        providers: vec![ProviderConfig {
            id: "pool".to_string(),
            name: "Pool".to_string(),
            enabled: true,
            endpoint: "http://provider.invalid/api".to_string(),
            method: relayguard::config::HttpMethod::Get,
            params: HashMap::new(),
            headers: HashMap::new(),
            body: None,
            timeout: Duration::from_secs(5),
            retry_attempts: 3,
            retry_initial_backoff: Duration::from_secs(1),
            extraction: ExtractionConfig::default(),
        }],
        endpoints: vec![EndpointConfig {
            listen_port: 24000,
            name: "primary".to_string(),
            provider: Some("pool".to_string()),
            upstream: Some(upstream(1)),
            monitoring_enabled: true,
            local_username: None,
            local_password: None,
        }],
        ..Default::default()
    }
}

pub struct Harness {
    pub registry: MonitorRegistry,
    pub history: Arc<MemoryHistory>,
    pub engine: Arc<RecordingEngine>,
}

pub fn harness(
    config: Config,
    probe: impl Probe + 'static,
    provider: Arc<dyn UpstreamProvider>,
) -> Harness {
    let history = Arc::new(MemoryHistory::new(100));
    let engine = Arc::new(RecordingEngine::default());
    let mut providers = ProviderRegistry::default();
    providers.register(provider);

    let registry = MonitorRegistry::new(
        config,
        None,
        providers,
        Arc::clone(&engine) as Arc<dyn ProxyEngine>,
        Arc::clone(&history) as Arc<dyn HistorySink>,
        Arc::new(probe),
    );

    Harness {
        registry,
        history,
        engine,
    }
}

/// Poll a condition under the (usually paused) tokio clock
pub async fn wait_until<F: Fn() -> bool>(cond: F, max: Duration, what: &str) {
    let step = Duration::from_millis(20);
    let mut waited = Duration::ZERO;
    while !cond() && waited < max {
        tokio::time::sleep(step).await;
        waited += step;
    }
    assert!(cond(), "timed out waiting for {what}");
}
