//! sing-box engine adapter
//!
//! Renders one SOCKS inbound, one outbound, and one route rule per
//! endpoint, writes the result to the engine's config path with a backup
//! for rollback, and runs the configured reload command. sing-box keeps
//! established connections on the old outbound alive across a reload,
//! which is what makes a switch invisible to in-flight traffic.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use tokio::process::Command;
use tracing::{debug, error, info, warn};

use super::ProxyEngine;
use crate::config::{EndpointConfig, EngineConfig};
use crate::upstream::{Protocol, Upstream};
use crate::{Error, Result};

/// sing-box configuration adapter
pub struct SingBoxEngine {
    config: EngineConfig,
}

impl SingBoxEngine {
    /// Create an adapter from engine configuration
    #[must_use]
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    /// Render the full sing-box configuration for an endpoint set
    #[must_use]
    pub fn render(endpoints: &[EndpointConfig]) -> Value {
        let mut inbounds = Vec::new();
        let mut outbounds = Vec::new();
        let mut rules = Vec::new();

        for endpoint in endpoints {
            let inbound_tag = format!("socks-{}", endpoint.listen_port);
            let outbound_tag = format!("upstream-{}", endpoint.listen_port);

            let mut inbound = json!({
                "type": "socks",
                "tag": inbound_tag,
                "listen": "0.0.0.0",
                "listen_port": endpoint.listen_port,
            });
            if let (Some(user), Some(pass)) =
                (&endpoint.local_username, &endpoint.local_password)
            {
                inbound["users"] = json!([{"username": user, "password": pass}]);
            }
            inbounds.push(inbound);

            outbounds.push(match &endpoint.upstream {
                None => json!({"type": "direct", "tag": outbound_tag}),
                Some(upstream) => render_outbound(&outbound_tag, upstream),
            });

            rules.push(json!({
                "inbound": [inbound_tag],
                "outbound": outbound_tag,
            }));
        }

        json!({
            "log": {"level": "info", "timestamp": true},
            "inbounds": inbounds,
            "outbounds": outbounds,
            "route": {"rules": rules},
        })
    }

    fn config_path(&self) -> &Path {
        Path::new(&self.config.config_path)
    }

    fn backup_path(&self) -> PathBuf {
        PathBuf::from(format!("{}.backup", self.config.config_path))
    }

    /// Write the rendered config, keeping a backup of the previous one
    fn write_config(&self, rendered: &Value) -> Result<Option<PathBuf>> {
        let path = self.config_path();

        let backup = if path.exists() {
            let backup = self.backup_path();
            match std::fs::copy(path, &backup) {
                Ok(_) => Some(backup),
                Err(e) => {
                    // A missing backup must not block the update
                    warn!("Failed to back up engine config: {e}");
                    None
                }
            }
        } else {
            None
        };

        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir)
                    .map_err(|e| Error::EngineApply(format!("create config dir: {e}")))?;
            }
        }
        let body = serde_json::to_string_pretty(rendered)
            .map_err(|e| Error::EngineApply(format!("serialize config: {e}")))?;
        std::fs::write(path, body)
            .map_err(|e| Error::EngineApply(format!("write config: {e}")))?;

        debug!(path = %path.display(), "Engine configuration written");
        Ok(backup)
    }

    fn rollback(&self, backup: &Path) {
        match std::fs::copy(backup, self.config_path()) {
            Ok(_) => {
                info!("Engine configuration rolled back");
            }
            Err(e) => {
                error!("Failed to roll back engine configuration: {e}");
            }
        }
    }

    /// Run the reload command and wait for it within the configured timeout
    async fn reload(&self) -> Result<()> {
        let argv = shlex::split(&self.config.reload_command).ok_or_else(|| {
            Error::EngineApply(format!(
                "unparseable reload command: {:?}",
                self.config.reload_command
            ))
        })?;
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| Error::EngineApply("empty reload command".into()))?;

        debug!(command = %self.config.reload_command, "Reloading engine");

        let output = tokio::time::timeout(
            self.config.reload_timeout,
            Command::new(program).args(args).output(),
        )
        .await
        .map_err(|_| {
            Error::EngineApply(format!(
                "reload command timed out after {:?}",
                self.config.reload_timeout
            ))
        })?
        .map_err(|e| Error::EngineApply(format!("reload command failed to start: {e}")))?;

        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(Error::EngineApply(format!(
                "reload command exited with {}: {}",
                output.status,
                stderr.trim()
            )))
        }
    }
}

#[async_trait]
impl ProxyEngine for SingBoxEngine {
    async fn apply(&self, endpoints: &[EndpointConfig]) -> Result<()> {
        info!(endpoints = endpoints.len(), "Applying engine configuration");

        let rendered = Self::render(endpoints);
        let backup = self.write_config(&rendered)?;

        match self.reload().await {
            Ok(()) => {
                if let Some(backup) = backup {
                    let _ = std::fs::remove_file(backup);
                }
                info!("Engine configuration applied");
                Ok(())
            }
            Err(e) => {
                if let Some(backup) = &backup {
                    self.rollback(backup);
                    // Old config restored on disk; bring the engine back
                    // in line with it as well
                    if let Err(reload_err) = self.reload().await {
                        error!("Reload after rollback failed: {reload_err}");
                    }
                }
                Err(e)
            }
        }
    }
}

/// Render the outbound section for one upstream
fn render_outbound(tag: &str, upstream: &Upstream) -> Value {
    match upstream.protocol {
        Protocol::Socks5 => {
            // sing-box names the SOCKS5 outbound "socks"
            let mut outbound = json!({
                "type": "socks",
                "tag": tag,
                "server": upstream.server,
                "server_port": upstream.port,
            });
            add_credentials(&mut outbound, upstream);
            outbound
        }
        Protocol::Http | Protocol::Https => {
            let mut outbound = json!({
                "type": "http",
                "tag": tag,
                "server": upstream.server,
                "server_port": upstream.port,
            });
            add_credentials(&mut outbound, upstream);
            if upstream.protocol == Protocol::Https {
                outbound["tls"] = json!({"enabled": true});
            }
            outbound
        }
        Protocol::Vless => render_vless_outbound(tag, upstream),
    }
}

fn add_credentials(outbound: &mut Value, upstream: &Upstream) {
    if let (Some(user), Some(pass)) = (&upstream.username, &upstream.password) {
        outbound["username"] = json!(user);
        outbound["password"] = json!(pass);
    }
}

fn render_vless_outbound(tag: &str, upstream: &Upstream) -> Value {
    let t = &upstream.transport;
    let get_str = |key: &str| t.get(key).and_then(Value::as_str);

    let mut outbound = json!({
        "type": "vless",
        "tag": tag,
        "server": upstream.server,
        "server_port": upstream.port,
        "uuid": get_str("uuid").unwrap_or_default(),
    });
    if let Some(flow) = get_str("flow") {
        outbound["flow"] = json!(flow);
    }

    if t.get("tls").and_then(Value::as_bool).unwrap_or(false) {
        let mut tls = Map::new();
        tls.insert("enabled".into(), Value::Bool(true));
        if let Some(sni) = get_str("sni") {
            tls.insert("server_name".into(), Value::String(sni.into()));
        }
        if let Some(alpn) = t.get("alpn").filter(|v| v.is_array()) {
            tls.insert("alpn".into(), alpn.clone());
        }
        if t.get("reality").and_then(Value::as_bool).unwrap_or(false) {
            let mut reality = Map::new();
            reality.insert("enabled".into(), Value::Bool(true));
            if let Some(pbk) = get_str("reality_public_key") {
                reality.insert("public_key".into(), Value::String(pbk.into()));
            }
            if let Some(sid) = get_str("reality_short_id") {
                reality.insert("short_id".into(), Value::String(sid.into()));
            }
            tls.insert("reality".into(), Value::Object(reality));
            if let Some(fp) = get_str("reality_fingerprint") {
                tls.insert(
                    "utls".into(),
                    json!({"enabled": true, "fingerprint": fp}),
                );
            }
        }
        outbound["tls"] = Value::Object(tls);
    }

    match get_str("network") {
        Some("ws") => {
            let mut transport = json!({
                "type": "ws",
                "path": get_str("ws_path").unwrap_or("/"),
            });
            if let Some(host) = get_str("ws_host") {
                transport["headers"] = json!({"Host": host});
            }
            outbound["transport"] = transport;
        }
        Some("grpc") => {
            outbound["transport"] = json!({
                "type": "grpc",
                "service_name": get_str("grpc_service_name").unwrap_or_default(),
            });
        }
        _ => {}
    }

    outbound
}
