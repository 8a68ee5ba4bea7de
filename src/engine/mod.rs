//! Proxy engine adapter
//!
//! The data plane is owned by an external engine; the controller only
//! regenerates its configuration and signals a reload. The engine
//! guarantees that connections established under the old mapping keep
//! running until they close naturally.

mod singbox;

pub use singbox::SingBoxEngine;

use async_trait::async_trait;

use crate::Result;
use crate::config::EndpointConfig;

/// Engine configuration application, atomic-or-rejected.
///
/// Either the full endpoint mapping takes effect or the call fails and
/// the previous mapping stays live; callers must never assume partial
/// application.
#[async_trait]
pub trait ProxyEngine: Send + Sync {
    /// Regenerate and apply the engine configuration for the given
    /// endpoint set.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::EngineApply`] when the engine rejected or
    /// failed to load the new configuration.
    async fn apply(&self, endpoints: &[EndpointConfig]) -> Result<()>;
}
