use std::{net::Ipv4Addr, sync::Arc};

use anyhow::{Result, bail};
use tracing::{info, warn};

use crate::{
    error::{ConflictError, RequestResult},
    machinery::store::{Store, WriteTxn},
    resources::lease::{IpAddressLease, LeaseOwner},
};

pub struct IpAllocator {
    store: Arc<Store>,
}

impl IpAllocator {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Adds lease rows for `ips`. Rows that already exist are left untouched.
    pub fn seed(&self, ips: &[Ipv4Addr]) -> Result<usize> {
        let added = self.store.write(|txn| {
            let mut added = 0;
            for ip in ips {
                let key = IpAddressLease::key(*ip);
                if txn.exists(&key)? {
                    continue;
                }
                txn.put(&key, &IpAddressLease { ip: *ip, owner: None })?;
                added += 1;
            }
            Ok(added)
        })?;

        info!("seeded {} of {} ip leases", added, ips.len());
        Ok(added)
    }

    pub fn list(&self) -> Result<Vec<IpAddressLease>> {
        self.store.list(&IpAddressLease::partial_key())
    }

    /// Claims any free lease for `vm_id` inside `txn`. The read and the write happen in
    /// the same transaction so two callers can never be handed the same address.
    pub fn claim_in(txn: &mut WriteTxn<'_>, vm_id: u64) -> RequestResult<IpAddressLease> {
        let leases = txn.list(&IpAddressLease::partial_key())?;
        let Some(mut lease) = leases.into_iter().find(|lease| !lease.in_use()) else {
            return Err(ConflictError::NoCapacity.into());
        };

        lease.owner = Some(LeaseOwner::Reserved { vm_id });
        txn.put(&IpAddressLease::key(lease.ip), &lease)?;

        Ok(lease)
    }

    pub fn find_unassigned_ip(&self, vm_id: u64) -> RequestResult<IpAddressLease> {
        self.store.try_write(|txn| Self::claim_in(txn, vm_id))
    }

    /// Marks the lease as bound to the deployed platform VM.
    pub fn bind(&self, ip: Ipv4Addr, vm_id: u64, platform_id: &str) -> Result<()> {
        self.store.write(|txn| {
            let key = IpAddressLease::key(ip);
            let Some(mut lease) = txn.get(&key)? else {
                bail!("ip lease {ip} does not exist");
            };

            match &lease.owner {
                Some(owner) if owner.vm_id() == vm_id => {}
                Some(owner) => bail!("ip lease {ip} is held by vm {}", owner.vm_id()),
                None => bail!("ip lease {ip} is not reserved for vm {vm_id}"),
            }

            lease.owner = Some(LeaseOwner::Bound {
                vm_id,
                platform_id: platform_id.to_string(),
            });
            txn.put(&key, &lease)
        })
    }

    /// Clears the owner if it is still `vm_id`. Returns whether anything was released.
    pub fn release(&self, ip: Ipv4Addr, vm_id: u64) -> Result<bool> {
        self.store.write(|txn| {
            let key = IpAddressLease::key(ip);
            let Some(mut lease) = txn.get(&key)? else {
                warn!("releasing unknown ip lease {ip}");
                return Ok(false);
            };

            match &lease.owner {
                Some(owner) if owner.vm_id() == vm_id => {
                    lease.owner = None;
                    txn.put(&key, &lease)?;
                    Ok(true)
                }
                _ => Ok(false),
            }
        })
    }

    /// Releases every lease held by `vm_id`, whatever address the record remembers.
    pub fn release_all_for(&self, vm_id: u64) -> Result<usize> {
        self.store.write(|txn| {
            let mut released = 0;
            for mut lease in txn.list(&IpAddressLease::partial_key())? {
                if lease.owner.as_ref().map(|o| o.vm_id()) != Some(vm_id) {
                    continue;
                }
                lease.owner = None;
                txn.put(&IpAddressLease::key(lease.ip), &lease)?;
                released += 1;
            }
            Ok(released)
        })
    }
}
