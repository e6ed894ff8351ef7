use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

use crate::{data::Collections, machinery::store::{Key, PartialKey}};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "state", rename_all = "kebab-case")]
pub enum LeaseOwner {
    /// Claimed for a machine whose platform VM does not exist yet.
    Reserved { vm_id: u64 },
    Bound { vm_id: u64, platform_id: String },
}

impl LeaseOwner {
    pub fn vm_id(&self) -> u64 {
        match self {
            LeaseOwner::Reserved { vm_id } | LeaseOwner::Bound { vm_id, .. } => *vm_id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IpAddressLease {
    pub ip: Ipv4Addr,
    pub owner: Option<LeaseOwner>,
}

impl IpAddressLease {
    pub fn key(ip: Ipv4Addr) -> Key<Self> {
        Key::new(Collections::IpLease, ip.to_string())
    }

    pub fn partial_key() -> PartialKey<Self> {
        PartialKey::collection(Collections::IpLease)
    }

    pub fn in_use(&self) -> bool {
        self.owner.is_some()
    }
}
