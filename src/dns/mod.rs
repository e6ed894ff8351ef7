pub mod record;
pub mod technitium;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

pub use record::RecordData;

#[derive(Debug, Error)]
pub enum DnsError {
    #[error("dns record not found")]
    NotFound,
    #[error("dns server rejected request: {0}")]
    Rejected(String),
    #[error(transparent)]
    Remote(#[from] anyhow::Error),
}

impl From<reqwest::Error> for DnsError {
    fn from(e: reqwest::Error) -> Self {
        DnsError::Remote(e.into())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DnsRecordEntry {
    pub name: String,
    pub record_type: String,
    pub ttl: u32,
}

#[async_trait]
pub trait DnsProvider: Send + Sync {
    /// `name` is relative to `zone`.
    async fn create_record(
        &self,
        zone: &str,
        name: &str,
        data: &RecordData,
        ttl: u32,
    ) -> Result<(), DnsError>;

    async fn delete_record(&self, zone: &str, name: &str, data: &RecordData)
    -> Result<(), DnsError>;

    /// Zones users may create records in; internal zones are left out.
    async fn list_zones(&self) -> Result<Vec<String>, DnsError>;

    async fn list_records(&self, zone: &str) -> Result<Vec<DnsRecordEntry>, DnsError>;
}

pub fn fqdn(zone: &str, name: &str) -> String {
    if name.is_empty() {
        zone.to_string()
    } else {
        format!("{name}.{zone}")
    }
}
