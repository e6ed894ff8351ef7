pub mod sophos;

use std::net::Ipv4Addr;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FirewallError {
    #[error("firewall object not found")]
    NotFound,
    #[error("firewall rejected request: {0}")]
    Rejected(String),
    #[error(transparent)]
    Remote(#[from] anyhow::Error),
}

impl From<reqwest::Error> for FirewallError {
    fn from(e: reqwest::Error) -> Self {
        FirewallError::Remote(e.into())
    }
}

/// Names of the objects that expose one VM. Derived from the owner and VM name only, so
/// teardown can find them without anything stored locally.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FirewallBinding {
    pub host: String,
    pub inbound: String,
    pub outbound: String,
}

impl FirewallBinding {
    pub fn new(prefix: &str, external_id: &str, vm_name: &str) -> Self {
        Self {
            host: format!("{prefix}-HOST-{external_id}-{vm_name}"),
            inbound: format!("{prefix}-Inbound-{external_id}-{vm_name}"),
            outbound: format!("{prefix}-Outbound-{external_id}-{vm_name}"),
        }
    }
}

/// An entry of the home network allow-list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllowedSource {
    pub name: String,
    pub ip: Ipv4Addr,
}

pub fn allowed_source_prefix(prefix: &str, external_id: &str) -> String {
    format!("{prefix}-HOME-{external_id}-")
}

pub fn allowed_source_name(prefix: &str, external_id: &str, index: usize) -> String {
    format!("{}{index}", allowed_source_prefix(prefix, external_id))
}

#[async_trait]
pub trait Firewall: Send + Sync {
    async fn create_ip_host(&self, name: &str, ip: Ipv4Addr) -> Result<(), FirewallError>;

    async fn create_inbound_rule(&self, binding: &FirewallBinding) -> Result<(), FirewallError>;

    async fn create_outbound_rule(&self, binding: &FirewallBinding) -> Result<(), FirewallError>;

    async fn add_rules_to_group(&self, binding: &FirewallBinding) -> Result<(), FirewallError>;

    async fn remove_ip_host(&self, name: &str) -> Result<(), FirewallError>;

    async fn remove_inbound_rule(&self, binding: &FirewallBinding) -> Result<(), FirewallError>;

    async fn remove_outbound_rule(&self, binding: &FirewallBinding) -> Result<(), FirewallError>;

    async fn list_allowed_sources(&self) -> Result<Vec<AllowedSource>, FirewallError>;

    async fn add_allowed_source(&self, name: &str, ip: Ipv4Addr) -> Result<(), FirewallError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binding_names() {
        let binding = FirewallBinding::new("AUTO", "s100", "web1");
        assert_eq!(binding.host, "AUTO-HOST-s100-web1");
        assert_eq!(binding.inbound, "AUTO-Inbound-s100-web1");
        assert_eq!(binding.outbound, "AUTO-Outbound-s100-web1");
        assert_eq!(allowed_source_name("AUTO", "s100", 3), "AUTO-HOME-s100-3");
    }
}
