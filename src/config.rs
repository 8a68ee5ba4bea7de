//! Configuration management
//!
//! Loads the YAML configuration file merged with `RELAYGUARD_`-prefixed
//! environment variables, validates it, and writes edits back so a loaded
//! configuration round-trips to an equivalent set.

use std::{collections::HashMap, env, fs, path::Path, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::provider::ExtractionConfig;
use crate::upstream::Upstream;
use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Environment files to load before processing config.
    /// Paths support ~ expansion. Loaded in order, later files override earlier.
    /// Variables are set into the process environment for `${VAR}` resolution.
    #[serde(default)]
    pub env_files: Vec<String>,
    /// System configuration
    pub system: SystemConfig,
    /// Health monitoring configuration
    pub monitoring: MonitoringConfig,
    /// Proxy engine configuration
    pub engine: EngineConfig,
    /// History sink configuration
    pub history: HistoryConfig,
    /// Upstream provider configurations
    pub providers: Vec<ProviderConfig>,
    /// Endpoint configurations
    pub endpoints: Vec<EndpointConfig>,
}

/// System configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log format (text, json)
    pub log_format: Option<String>,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: None,
        }
    }
}

/// Health monitoring configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    /// Delay between the end of one check and the start of the next
    #[serde(with = "humantime_serde")]
    pub check_interval: Duration,
    /// Consecutive failures required to trigger a switch
    pub failure_threshold: u32,
    /// Per-probe timeout
    #[serde(with = "humantime_serde")]
    pub check_timeout: Duration,
    /// URL fetched through the upstream to verify reachability
    pub check_url: String,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(30),
            failure_threshold: 3,
            check_timeout: Duration::from_secs(10),
            check_url: "http://www.google.com".to_string(),
        }
    }
}

/// Proxy engine configuration (sing-box)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Where the rendered engine configuration is written
    pub config_path: String,
    /// Command executed to make the engine pick up the new configuration
    pub reload_command: String,
    /// Timeout for the reload command
    #[serde(with = "humantime_serde")]
    pub reload_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            config_path: "/etc/sing-box/config.json".to_string(),
            reload_command: "systemctl restart sing-box".to_string(),
            reload_timeout: Duration::from_secs(15),
        }
    }
}

/// History sink configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    /// Append switch/health records to this JSONL file (unset = memory only)
    pub file: Option<String>,
    /// Records retained in the in-memory window
    pub memory_capacity: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            file: None,
            memory_capacity: 1000,
        }
    }
}

/// HTTP method for provider requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    /// GET with query parameters
    #[default]
    Get,
    /// POST with a JSON body
    Post,
}

/// Upstream provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Unique provider id referenced by endpoints
    pub id: String,
    /// Human-readable name
    pub name: String,
    /// Whether this provider may be used
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// API endpoint URL
    pub endpoint: String,
    /// HTTP method
    #[serde(default)]
    pub method: HttpMethod,
    /// Query parameters (GET); values support `${VAR}` expansion
    #[serde(default)]
    pub params: HashMap<String, String>,
    /// Request headers; values support `${VAR}` expansion
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// JSON body (POST)
    #[serde(default)]
    pub body: Option<serde_json::Value>,
    /// Request timeout
    #[serde(default = "default_provider_timeout", with = "humantime_serde")]
    pub timeout: Duration,
    /// Total acquisition attempts (first try included)
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    /// Delay before the first retry; doubles on each subsequent retry
    #[serde(default = "default_retry_backoff", with = "humantime_serde")]
    pub retry_initial_backoff: Duration,
    /// How to interpret the provider's response
    #[serde(default)]
    pub extraction: ExtractionConfig,
}

fn default_true() -> bool {
    true
}

fn default_provider_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_backoff() -> Duration {
    Duration::from_secs(1)
}

/// Endpoint configuration - one local proxy listener
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Local listening port; unique, doubles as the endpoint id
    pub listen_port: u16,
    /// Human-readable name
    pub name: String,
    /// Provider consulted when a replacement upstream is needed
    #[serde(default)]
    pub provider: Option<String>,
    /// Active upstream; `None` means direct mode (no upstream)
    #[serde(default)]
    pub upstream: Option<Upstream>,
    /// Whether health monitoring is enabled for this endpoint
    #[serde(default)]
    pub monitoring_enabled: bool,
    /// Optional local SOCKS authentication
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_username: Option<String>,
    /// Optional local SOCKS authentication
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_password: Option<String>,
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist, cannot be
    /// parsed, or fails validation.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        // Merge environment variables (RELAYGUARD_ prefix)
        figment = figment.merge(Env::prefixed("RELAYGUARD_").split("__"));

        let mut config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        // Load env files into process environment (before env var expansion)
        config.load_env_files();

        // Expand ${VAR} in provider params and headers
        config.expand_env_vars();

        config.validate()?;

        Ok(config)
    }

    /// Persist the configuration as YAML.
    ///
    /// A set written here and loaded back produces an equivalent
    /// configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if validation fails or the file cannot be written.
    pub fn save(&self, path: &Path) -> Result<()> {
        self.validate()?;

        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir)?;
            }
        }

        let yaml = serde_yaml::to_string(self)?;
        fs::write(path, yaml)?;
        tracing::info!(path = %path.display(), "Configuration saved");
        Ok(())
    }

    /// Check cross-field invariants the serde layer cannot express.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] listing every violation found.
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        if self.monitoring.check_interval.is_zero() {
            errors.push("monitoring.check_interval must be positive".to_string());
        }
        if self.monitoring.failure_threshold == 0 {
            errors.push("monitoring.failure_threshold must be positive".to_string());
        }
        if self.monitoring.check_timeout.is_zero() {
            errors.push("monitoring.check_timeout must be positive".to_string());
        }
        if self.monitoring.check_url.is_empty() {
            errors.push("monitoring.check_url cannot be empty".to_string());
        }

        let mut provider_ids = std::collections::HashSet::new();
        for provider in &self.providers {
            if provider.id.is_empty() {
                errors.push("provider id cannot be empty".to_string());
            }
            if !provider_ids.insert(provider.id.as_str()) {
                errors.push(format!("duplicate provider id: {}", provider.id));
            }
            if provider.endpoint.is_empty() {
                errors.push(format!("provider {} has an empty endpoint", provider.id));
            }
            if provider.timeout.is_zero() {
                errors.push(format!("provider {} timeout must be positive", provider.id));
            }
            if provider.retry_attempts == 0 {
                errors.push(format!(
                    "provider {} retry_attempts must be positive",
                    provider.id
                ));
            }
        }

        let mut ports = std::collections::HashSet::new();
        for endpoint in &self.endpoints {
            if !ports.insert(endpoint.listen_port) {
                errors.push(format!("duplicate listen_port: {}", endpoint.listen_port));
            }
            if endpoint.name.is_empty() {
                errors.push(format!(
                    "endpoint {} name cannot be empty",
                    endpoint.listen_port
                ));
            }
            if let Some(upstream) = &endpoint.upstream {
                if let Err(e) = upstream.validate() {
                    errors.push(format!("endpoint {}: {e}", endpoint.listen_port));
                }
            }
            if endpoint.monitoring_enabled && endpoint.upstream.is_none() {
                errors.push(format!(
                    "endpoint {}: monitoring cannot be enabled in direct mode",
                    endpoint.listen_port
                ));
            }
            if let Some(provider_id) = &endpoint.provider {
                if !self.providers.iter().any(|p| &p.id == provider_id) {
                    errors.push(format!(
                        "endpoint {} references unknown provider: {provider_id}",
                        endpoint.listen_port
                    ));
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::Config(errors.join("; ")))
        }
    }

    /// Get the endpoint configured for a listen port
    #[must_use]
    pub fn endpoint(&self, port: u16) -> Option<&EndpointConfig> {
        self.endpoints.iter().find(|e| e.listen_port == port)
    }

    /// Get a provider by id
    #[must_use]
    pub fn provider(&self, id: &str) -> Option<&ProviderConfig> {
        self.providers.iter().find(|p| p.id == id)
    }

    /// Replace the upstream of an endpoint in place.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EndpointNotFound`] when no endpoint listens on
    /// `port`.
    pub fn set_upstream(&mut self, port: u16, upstream: Option<Upstream>) -> Result<()> {
        let endpoint = self
            .endpoints
            .iter_mut()
            .find(|e| e.listen_port == port)
            .ok_or(Error::EndpointNotFound(port))?;
        endpoint.upstream = upstream;
        Ok(())
    }

    /// Load environment files into the process environment.
    /// Supports ~ expansion. Files that don't exist are silently skipped.
    fn load_env_files(&self) {
        for path_str in &self.env_files {
            let expanded = if path_str.starts_with('~') {
                if let Some(home) = dirs::home_dir() {
                    path_str.replacen('~', &home.display().to_string(), 1)
                } else {
                    path_str.clone()
                }
            } else {
                path_str.clone()
            };

            let path = Path::new(&expanded);
            if path.exists() {
                match dotenvy::from_path(path) {
                    Ok(()) => {
                        tracing::info!("Loaded env file: {expanded}");
                    }
                    Err(e) => {
                        tracing::warn!("Failed to load env file {expanded}: {e}");
                    }
                }
            } else {
                tracing::debug!("Env file not found (skipped): {expanded}");
            }
        }
    }

    /// Expand ${VAR} and ${VAR:-default} patterns in provider values
    fn expand_env_vars(&mut self) {
        let re = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}").unwrap();

        for provider in &mut self.providers {
            for value in provider.params.values_mut() {
                *value = Self::expand_string(&re, value);
            }
            for value in provider.headers.values_mut() {
                *value = Self::expand_string(&re, value);
            }
        }
    }

    /// Expand environment variables in a string
    fn expand_string(re: &Regex, value: &str) -> String {
        re.replace_all(value, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default = caps.get(2).map_or("", |m| m.as_str());
            env::var(var_name).unwrap_or_else(|_| default.to_string())
        })
        .into_owned()
    }
}

/// Custom humantime serde module for Duration
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize Duration to human-readable string (e.g., "30s")
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() > 0 {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        } else {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        }
    }

    /// Deserialize human-readable duration string (e.g., "30s", "5m", "100ms")
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the string cannot be parsed as a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;

        if let Some(ms) = s.strip_suffix("ms") {
            ms.parse::<u64>()
                .map(Duration::from_millis)
                .map_err(serde::de::Error::custom)
        } else if let Some(mins) = s.strip_suffix('m') {
            mins.parse::<u64>()
                .map(|m| Duration::from_secs(m * 60))
                .map_err(serde::de::Error::custom)
        } else if let Some(secs) = s.strip_suffix('s') {
            secs.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(serde::de::Error::custom)
        } else {
            // Assume seconds
            s.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(serde::de::Error::custom)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::Protocol;

    fn sample_config() -> Config {
        Config {
            providers: vec![ProviderConfig {
                id: "pool-a".to_string(),
                name: "Pool A".to_string(),
                enabled: true,
                endpoint: "https://api.example.com/proxy".to_string(),
                method: HttpMethod::Get,
                params: HashMap::new(),
                headers: HashMap::new(),
                body: None,
                timeout: Duration::from_secs(10),
                retry_attempts: 3,
                retry_initial_backoff: Duration::from_secs(1),
                extraction: ExtractionConfig::default(),
            }],
            endpoints: vec![EndpointConfig {
                listen_port: 24000,
                name: "office".to_string(),
                provider: Some("pool-a".to_string()),
                upstream: Some(Upstream::new("10.0.0.1", 1080, Protocol::Socks5)),
                monitoring_enabled: true,
                local_username: None,
                local_password: None,
            }],
            ..Default::default()
        }
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");

        let config = sample_config();
        config.save(&path).unwrap();
        let loaded = Config::load(Some(&path)).unwrap();

        assert_eq!(loaded.endpoints.len(), 1);
        let endpoint = loaded.endpoint(24000).unwrap();
        assert_eq!(endpoint.name, "office");
        assert_eq!(endpoint.upstream.as_ref().unwrap().server, "10.0.0.1");
        assert_eq!(loaded.providers[0].id, "pool-a");
        assert_eq!(loaded.monitoring.check_interval, Duration::from_secs(30));

        // Re-save without modification and compare the serialized forms
        let again = dir.path().join("again.yaml");
        loaded.save(&again).unwrap();
        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            fs::read_to_string(&again).unwrap()
        );
    }

    #[test]
    fn test_load_missing_file() {
        let err = Config::load(Some(Path::new("/nonexistent/config.yaml"))).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_validate_duplicate_ports() {
        let mut config = sample_config();
        let mut dup = config.endpoints[0].clone();
        dup.name = "copy".to_string();
        config.endpoints.push(dup);

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate listen_port"));
    }

    #[test]
    fn test_validate_monitoring_requires_upstream() {
        let mut config = sample_config();
        config.endpoints[0].upstream = None;

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("direct mode"));
    }

    #[test]
    fn test_validate_unknown_provider_reference() {
        let mut config = sample_config();
        config.endpoints[0].provider = Some("nope".to_string());

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("unknown provider"));
    }

    #[test]
    fn test_set_upstream_replaces_value() {
        let mut config = sample_config();
        let replacement = Upstream::new("10.9.9.9", 1080, Protocol::Socks5);
        config.set_upstream(24000, Some(replacement.clone())).unwrap();
        assert_eq!(config.endpoint(24000).unwrap().upstream, Some(replacement));

        assert!(matches!(
            config.set_upstream(1, None),
            Err(Error::EndpointNotFound(1))
        ));
    }

    #[test]
    fn test_humantime_roundtrip() {
        let yaml = "check_interval: 5m\nfailure_threshold: 2\ncheck_timeout: 500ms\ncheck_url: http://example.com\n";
        let monitoring: MonitoringConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(monitoring.check_interval, Duration::from_secs(300));
        assert_eq!(monitoring.check_timeout, Duration::from_millis(500));
    }
}
