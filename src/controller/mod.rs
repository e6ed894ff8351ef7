pub mod compensate;
pub mod power;
pub mod provision;
pub mod records;
pub mod teardown;

use std::{sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
    allocator::{IpAllocator, SubdomainAllocator},
    bootstrap::{GuestBootstrap, ScriptLibrary},
    dns::DnsProvider,
    firewall::Firewall,
    guard::Guard,
    machinery::store::Store,
    notify::Notifier,
    platform::PlatformSessionCache,
};

/// What the saga does when the power-on step fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PowerOnFailure {
    /// Unwind everything, like any other failed step.
    #[default]
    Abort,
    /// Log and carry on with the bootstrap step.
    Continue,
}

#[derive(Debug, Clone)]
pub struct ProvisioningConfig {
    pub vm_name_prefix: String,
    pub object_prefix: String,
    pub settle_delay: Duration,
    pub power_on_failure: PowerOnFailure,
    pub max_allowed_sources_per_user: usize,
    pub dns_ttl: u32,
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            vm_name_prefix: "AUTO".to_string(),
            object_prefix: "AUTO".to_string(),
            settle_delay: Duration::from_secs(30),
            power_on_failure: PowerOnFailure::Abort,
            max_allowed_sources_per_user: 3,
            dns_ttl: 3600,
        }
    }
}

#[derive(Clone)]
pub struct ControllerContext {
    pub store: Arc<Store>,
    pub ips: Arc<IpAllocator>,
    pub subdomains: Arc<SubdomainAllocator>,
    pub guard: Arc<Guard>,
    pub sessions: Arc<PlatformSessionCache>,
    pub firewall: Arc<dyn Firewall>,
    pub dns: Arc<dyn DnsProvider>,
    pub bootstrap: Arc<dyn GuestBootstrap>,
    pub scripts: Arc<ScriptLibrary>,
    pub notifier: Arc<Notifier>,
    pub config: Arc<ProvisioningConfig>,
}
