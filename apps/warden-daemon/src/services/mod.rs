//! Uniform adapters over the two data planes.

#[cfg(test)]
pub mod memory;
pub mod proxy;
mod proxy_proto;
pub mod vpn;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use warden_shared::{Error, Result, Traffic};

use crate::config::Config;

pub use proxy::{subscription_urls, ProxyService};
pub use vpn::VpnService;

/// The capability set every managed data plane exposes: membership
/// changes and a per-user traffic query. Implementations bound each call
/// with the configured service timeout.
#[async_trait]
pub trait Service: Send + Sync {
    /// Stable key used in configuration and the state table.
    fn name(&self) -> &'static str;

    /// Human-readable name used in log lines.
    fn alias(&self) -> &'static str;

    /// Whether the data plane keeps reporting traffic for users that
    /// were already deleted from it. Drives zombie-log suppression.
    fn reports_stale_traffic(&self) -> bool {
        false
    }

    async fn add_user(&self, username: &str, uuid: &Uuid) -> Result<()>;

    async fn delete_user(&self, username: &str) -> Result<()>;

    /// Traffic consumed per user since the previous query (when `reset`
    /// is requested), keyed by username.
    async fn users_traffic_usage(&self, reset: bool) -> Result<HashMap<String, Traffic>>;

    async fn close(&self) {}

    /// The timeout kind this data plane surfaces.
    fn timeout_error(&self) -> Error;
}

/// Builds the adapters for every service enabled in the configuration.
///
/// Adapters open (lazy) transports; construct them only in the process
/// that uses them, after any worker subprocess has been spawned.
pub fn build(config: &Config) -> Result<Vec<Arc<dyn Service>>> {
    let mut services: Vec<Arc<dyn Service>> = Vec::new();
    if config.main.manage_proxy {
        services.push(Arc::new(ProxyService::new(config)?));
    }
    if config.main.manage_vpn {
        services.push(Arc::new(VpnService::new(config)));
    }
    if services.is_empty() {
        return Err(Error::Unexpected(
            "no service is enabled for managing".into(),
        ));
    }
    Ok(services)
}
