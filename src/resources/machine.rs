use std::net::Ipv4Addr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::{
    data::Collections,
    machinery::store::{Key, PartialKey},
};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VirtualMachineRecord {
    pub id: u64,
    pub user_id: String,
    /// Owner's directory id, part of every remote object name.
    pub external_id: String,
    /// Set once the platform has deployed the VM.
    pub platform_id: Option<String>,
    pub name: String,
    pub description: String,
    pub end_date: NaiveDate,
    pub operating_system: String,
    pub storage_gib: u32,
    pub memory_gib: u32,
    pub ip: Option<Ipv4Addr>,
}

impl VirtualMachineRecord {
    pub fn key(id: u64) -> Key<Self> {
        Key::new(Collections::VirtualMachine, format!("{id:020}"))
    }

    pub fn partial_key() -> PartialKey<Self> {
        PartialKey::collection(Collections::VirtualMachine)
    }

    pub fn visible_to(&self, user_id: &str, is_admin: bool) -> bool {
        is_admin || self.user_id == user_id
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PowerState {
    PoweredOn,
    PoweredOff,
    Suspended,
    Unknown,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ServerView {
    #[serde(flatten)]
    pub record: VirtualMachineRecord,
    pub power_status: PowerState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerAction {
    On,
    Off,
    ForceOff,
    Reset,
}

impl std::str::FromStr for PowerAction {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "ON" => Ok(PowerAction::On),
            "OFF" => Ok(PowerAction::Off),
            "FORCE_OFF" => Ok(PowerAction::ForceOff),
            "RESET" => Ok(PowerAction::Reset),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubdomainRequest {
    pub label: String,
    pub zone: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CreateServerRequest {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub operating_system: String,
    pub end_date: String,
    pub storage: u32,
    pub memory: u32,
    #[serde(default)]
    pub home_ips: Option<Vec<String>>,
    #[serde(default)]
    pub sub_domain: Option<String>,
    #[serde(default)]
    pub domain_zone: Option<String>,
}

impl CreateServerRequest {
    pub fn subdomain(&self) -> Option<SubdomainRequest> {
        match (&self.sub_domain, &self.domain_zone) {
            (Some(label), Some(zone)) => Some(SubdomainRequest {
                label: label.clone(),
                zone: zone.clone(),
            }),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProvisioningStarted {
    pub id: u64,
    pub ip: Ipv4Addr,
    pub message: String,
}
