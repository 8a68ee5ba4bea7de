//! Upstream providers - external sources of replacement upstreams
//!
//! The switch coordinator only sees the [`UpstreamProvider`] trait and a
//! retryable/non-retryable error classification; vendor-specific request
//! and response shapes stay inside the adapter.

mod extract;

pub use extract::{ExtractionConfig, SuccessCondition};

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, info};

use crate::config::{Config, HttpMethod, ProviderConfig};
use crate::upstream::Upstream;
use crate::{Error, Result};

/// Source of replacement upstreams
#[async_trait]
pub trait UpstreamProvider: Send + Sync {
    /// Provider id as referenced by endpoint configs
    fn id(&self) -> &str;

    /// Acquire one fresh upstream.
    ///
    /// # Errors
    ///
    /// Returns an error whose [`Error::is_retryable`] classification is
    /// the only thing callers may branch on.
    async fn fetch(&self) -> Result<Upstream>;
}

/// HTTP API provider
pub struct HttpProvider {
    config: ProviderConfig,
    client: Client,
}

impl HttpProvider {
    /// Build a provider from its configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(config: ProviderConfig) -> Result<Self> {
        let client = Client::builder().timeout(config.timeout).build()?;
        Ok(Self { config, client })
    }
}

#[async_trait]
impl UpstreamProvider for HttpProvider {
    fn id(&self) -> &str {
        &self.config.id
    }

    async fn fetch(&self) -> Result<Upstream> {
        debug!(provider = %self.config.id, endpoint = %self.config.endpoint, "Requesting new upstream");

        let mut request = match self.config.method {
            HttpMethod::Get => self
                .client
                .get(&self.config.endpoint)
                .query(&self.config.params),
            HttpMethod::Post => {
                let builder = self.client.post(&self.config.endpoint);
                match &self.config.body {
                    Some(body) => builder.json(body),
                    None => builder,
                }
            }
        };
        for (key, value) in &self.config.headers {
            request = request.header(key.as_str(), value.as_str());
        }

        let response = request.send().await?;

        let status = response.status();
        if !status.is_success() {
            let message = format!("provider {} returned HTTP {status}", self.config.id);
            // Server-side and throttling failures may clear up; client
            // errors mean the request itself is wrong.
            return if status.is_server_error() || status.as_u16() == 429 {
                Err(Error::provider_transient(message))
            } else {
                Err(Error::provider_fatal(message))
            };
        }

        let payload: serde_json::Value = response.json().await?;
        let upstream = self.config.extraction.extract(&payload)?;

        info!(
            provider = %self.config.id,
            upstream = %upstream.addr(),
            "Obtained new upstream"
        );
        Ok(upstream)
    }
}

/// Registry of enabled providers, keyed by id
#[derive(Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn UpstreamProvider>>,
}

impl ProviderRegistry {
    /// Build the registry from configuration; disabled providers are
    /// skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if a provider adapter cannot be constructed.
    pub fn from_config(config: &Config) -> Result<Self> {
        let mut providers: HashMap<String, Arc<dyn UpstreamProvider>> = HashMap::new();
        for provider_config in &config.providers {
            if !provider_config.enabled {
                debug!(provider = %provider_config.id, "Provider disabled, skipping");
                continue;
            }
            let provider = HttpProvider::new(provider_config.clone())?;
            providers.insert(provider_config.id.clone(), Arc::new(provider));
        }
        Ok(Self { providers })
    }

    /// Register a provider (tests swap in fakes through this)
    pub fn register(&mut self, provider: Arc<dyn UpstreamProvider>) {
        self.providers.insert(provider.id().to_string(), provider);
    }

    /// Look up an enabled provider.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ProviderNotFound`] for unknown or disabled ids.
    pub fn get(&self, id: &str) -> Result<Arc<dyn UpstreamProvider>> {
        self.providers
            .get(id)
            .cloned()
            .ok_or_else(|| Error::ProviderNotFound(id.to_string()))
    }
}
