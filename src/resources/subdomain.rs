use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{
    data::Collections,
    machinery::store::{Key, PartialKey},
};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum RecordType {
    A,
    Aaaa,
    Cname,
    Mx,
    Txt,
    Srv,
    Caa,
    Ptr,
    Dname,
    Aname,
}

impl RecordType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordType::A => "A",
            RecordType::Aaaa => "AAAA",
            RecordType::Cname => "CNAME",
            RecordType::Mx => "MX",
            RecordType::Txt => "TXT",
            RecordType::Srv => "SRV",
            RecordType::Caa => "CAA",
            RecordType::Ptr => "PTR",
            RecordType::Dname => "DNAME",
            RecordType::Aname => "ANAME",
        }
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A DNS record the backend is authoritative for.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubdomainRecord {
    pub zone: String,
    /// Fully normalised name below the zone, e.g. `blog.students`.
    pub subdomain: String,
    pub record_type: RecordType,
    pub value: String,
    pub vm_id: u64,
    pub user_id: String,
}

impl SubdomainRecord {
    pub fn key(
        zone: &str,
        subdomain: &str,
        record_type: RecordType,
        value: &str,
    ) -> Key<Self> {
        Key::scoped(
            Collections::Subdomain,
            zone,
            format!("{subdomain}/{record_type}/{value}"),
        )
    }

    pub fn zone_key(zone: &str) -> PartialKey<Self> {
        PartialKey::scoped(Collections::Subdomain, zone)
    }

    pub fn partial_key() -> PartialKey<Self> {
        PartialKey::collection(Collections::Subdomain)
    }

    pub fn own_key(&self) -> Key<Self> {
        Self::key(&self.zone, &self.subdomain, self.record_type, &self.value)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CreateRecordRequest {
    pub zone: String,
    /// Label as typed by the user; the configured suffix is appended.
    pub subdomain: String,
    pub record_type: RecordType,
    pub value: String,
    #[serde(default)]
    pub ttl: Option<u32>,
}

/// Identifies a stored record exactly, as returned by the record listing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeleteRecordRequest {
    pub zone: String,
    pub subdomain: String,
    pub record_type: RecordType,
    pub value: String,
}
