//! Relayguard Library
//!
//! Keeps local proxy endpoints reachable: one independent health-check
//! loop per endpoint probes *through* the active upstream, and when the
//! failure threshold is crossed a switch coordinator acquires a
//! replacement from a provider, validates it, and applies it through the
//! proxy engine without dropping in-flight connections.
//!
//! # Components
//!
//! - [`monitor::MonitorRegistry`] - start/stop/status/manual-switch, the
//!   entire control surface
//! - [`monitor::HttpProbe`] - reachability checks routed through the
//!   candidate upstream
//! - [`monitor::SwitchCoordinator`] - acquire → validate → apply with
//!   retry/backoff and per-endpoint mutual exclusion
//! - [`provider`] - HTTP upstream providers with declarative response
//!   extraction
//! - [`engine`] - sing-box configuration rendering and hot reload

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod history;
pub mod monitor;
pub mod provider;
pub mod upstream;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => {
            subscriber.with(fmt::layer().json()).init();
        }
        _ => {
            subscriber.with(fmt::layer()).init();
        }
    }

    Ok(())
}
