use std::net::Ipv4Addr;

use anyhow::{Result, anyhow};
use tracing::{debug, error, info};

use crate::{
    controller::{ControllerContext, provision::ProvisioningStep},
    dns::{DnsError, RecordData},
    firewall::{FirewallBinding, FirewallError},
    platform::PlatformError,
    resources::{identity::Identity, machine::VirtualMachineRecord},
};

/// Everything needed to find the objects a run may have created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompensationTarget {
    pub vm_id: u64,
    pub user_id: String,
    pub name: String,
    pub external_id: String,
    pub platform_id: Option<String>,
    pub ip: Option<Ipv4Addr>,
}

impl From<&VirtualMachineRecord> for CompensationTarget {
    fn from(record: &VirtualMachineRecord) -> Self {
        Self {
            vm_id: record.id,
            user_id: record.user_id.clone(),
            name: record.name.clone(),
            external_id: record.external_id.clone(),
            platform_id: record.platform_id.clone(),
            ip: record.ip,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UndoStage {
    DnsRecords,
    IpLease,
    FirewallHost,
    InboundRule,
    OutboundRule,
    PlatformVm,
    Record,
}

/// Undo operations that did not succeed. Objects that were already gone are not listed.
#[derive(Debug, Default)]
pub struct CompensationReport {
    pub failures: Vec<(UndoStage, String)>,
}

impl CompensationReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn failed(&self, stage: UndoStage) -> bool {
        self.failures.iter().any(|(s, _)| *s == stage)
    }

    fn record(&mut self, stage: UndoStage, target: &CompensationTarget, result: Result<()>) {
        match result {
            Ok(()) => debug!("undid {:?} for vm {}", stage, target.vm_id),
            Err(e) => {
                error!("failed to undo {:?} for vm {}: {:#}", stage, target.vm_id, e);
                self.failures.push((stage, format!("{e:#}")));
            }
        }
    }
}

fn tolerate_platform(result: Result<(), PlatformError>) -> Result<()> {
    match result {
        Ok(()) | Err(PlatformError::NotFound) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn tolerate_firewall(result: Result<(), FirewallError>) -> Result<()> {
    match result {
        Ok(()) | Err(FirewallError::NotFound) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

pub(crate) fn tolerate_dns(result: Result<(), DnsError>) -> Result<()> {
    match result {
        Ok(()) | Err(DnsError::NotFound) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

pub struct Compensator {
    ctx: ControllerContext,
}

impl Compensator {
    pub fn new(ctx: ControllerContext) -> Self {
        Self { ctx }
    }

    /// Undoes everything up to and including `step`, newest first. Every undo is
    /// attempted even if an earlier one failed. Safe to run more than once.
    pub async fn unwind(
        &self,
        step: ProvisioningStep,
        target: &CompensationTarget,
    ) -> CompensationReport {
        let mut report = self.unwind_remote(step, target).await;

        if step >= ProvisioningStep::DbCreated {
            let result = self.delete_row(target.vm_id);
            report.record(UndoStage::Record, target, result);
        }

        report
    }

    /// [`Compensator::unwind`] followed by the failure notification the owner always gets.
    pub async fn compensate(
        &self,
        step: ProvisioningStep,
        target: &CompensationTarget,
        identity: &Identity,
    ) -> CompensationReport {
        info!(
            "compensating vm {} ({}) from step {:?}",
            target.vm_id, target.name, step
        );
        let report = self.unwind(step, target).await;

        self.ctx
            .notifier
            .notify_user(
                identity,
                "Server creation failed",
                &format!(
                    "Something went wrong while creating server {}. Everything that was \
                     created for it has been removed, please try again.",
                    target.name
                ),
            )
            .await;

        report
    }

    /// Remote objects and the IP lease, leaving the local row in place.
    pub async fn unwind_remote(
        &self,
        step: ProvisioningStep,
        target: &CompensationTarget,
    ) -> CompensationReport {
        let mut report = CompensationReport::default();

        if step >= ProvisioningStep::DnsCreated {
            let result = self.remove_dns_records(target.vm_id).await;
            report.record(UndoStage::DnsRecords, target, result);
        }

        if step >= ProvisioningStep::DbCreated {
            let result = self.ctx.ips.release_all_for(target.vm_id).map(|released| {
                if released > 0 {
                    info!("released ip lease of vm {}", target.vm_id);
                }
            });
            report.record(UndoStage::IpLease, target, result);
        }

        if step >= ProvisioningStep::FirewallCreated {
            let binding = FirewallBinding::new(
                &self.ctx.config.object_prefix,
                &target.external_id,
                &target.name,
            );
            let firewall = &self.ctx.firewall;

            // rules reference the host, so they go first
            let result = tolerate_firewall(firewall.remove_inbound_rule(&binding).await);
            report.record(UndoStage::InboundRule, target, result);
            let result = tolerate_firewall(firewall.remove_outbound_rule(&binding).await);
            report.record(UndoStage::OutboundRule, target, result);
            let result = tolerate_firewall(firewall.remove_ip_host(&binding.host).await);
            report.record(UndoStage::FirewallHost, target, result);
        }

        if step >= ProvisioningStep::PlatformCreated {
            if let Some(platform_id) = target.platform_id.as_deref() {
                let result = self.delete_platform_vm(platform_id).await;
                report.record(UndoStage::PlatformVm, target, result);
            }
        }

        report
    }

    pub async fn delete_platform_vm(&self, platform_id: &str) -> Result<()> {
        tolerate_platform(
            self.ctx
                .sessions
                .call(|platform, session| async move {
                    platform.delete_vm(&session, platform_id).await
                })
                .await,
        )
    }

    /// Remote record first; the local row only goes once the remote delete did not error.
    pub async fn remove_dns_records(&self, vm_id: u64) -> Result<()> {
        let mut failed = 0;
        for record in self.ctx.subdomains.records_for_vm(vm_id)? {
            let data = match RecordData::parse(record.record_type, &record.value) {
                Ok(data) => data,
                Err(e) => {
                    error!("stored record {:?} is not valid: {}", record, e);
                    failed += 1;
                    continue;
                }
            };

            let result = tolerate_dns(
                self.ctx
                    .dns
                    .delete_record(&record.zone, &record.subdomain, &data)
                    .await,
            );
            match result {
                Ok(()) => {
                    self.ctx.subdomains.remove(&record)?;
                }
                Err(e) => {
                    error!(
                        "failed to delete {} {} from dns: {:#}",
                        record.record_type, record.subdomain, e
                    );
                    failed += 1;
                }
            }
        }

        if failed > 0 {
            return Err(anyhow!("{failed} dns records could not be removed"));
        }
        Ok(())
    }

    fn delete_row(&self, vm_id: u64) -> Result<()> {
        if self.ctx.store.delete(&VirtualMachineRecord::key(vm_id))? {
            info!("deleted record of vm {}", vm_id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        resources::subdomain::RecordType,
        testing::{Harness, identity},
    };

    async fn provisioned(harness: &Harness) -> CompensationTarget {
        let user = identity("alice", false);
        let started = harness
            .provisioner()
            .create_server(&user, harness.request("web1"))
            .await
            .unwrap();
        harness.wait_idle().await;

        let record = harness.record(started.id).unwrap();
        CompensationTarget::from(&record)
    }

    #[tokio::test]
    async fn test_unwind_removes_everything() {
        let harness = Harness::new().await;
        let target = provisioned(&harness).await;
        let compensator = Compensator::new(harness.ctx.clone());

        let report = compensator
            .unwind(ProvisioningStep::DnsCreated, &target)
            .await;

        assert!(report.is_clean(), "{report:?}");
        assert!(harness.record(target.vm_id).is_none());
        assert!(harness.leases_in_use().is_empty());
        assert_eq!(harness.firewall.object_count(), 0);
        assert!(harness.platform.vm_ids().is_empty());
        assert!(harness.dns.records().is_empty());
        assert!(
            harness
                .ctx
                .subdomains
                .records_for_vm(target.vm_id)
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn test_compensation_is_idempotent() {
        let harness = Harness::new().await;
        let target = provisioned(&harness).await;
        let compensator = Compensator::new(harness.ctx.clone());
        let user = identity("alice", false);

        let first = compensator
            .compensate(ProvisioningStep::HomenetAllowed, &target, &user)
            .await;
        let state_after_first = (
            harness.leases_in_use(),
            harness.firewall.object_count(),
            harness.platform.vm_ids(),
        );
        let second = compensator
            .compensate(ProvisioningStep::HomenetAllowed, &target, &user)
            .await;

        assert!(first.is_clean(), "{first:?}");
        assert!(second.is_clean(), "{second:?}");
        assert_eq!(
            state_after_first,
            (
                harness.leases_in_use(),
                harness.firewall.object_count(),
                harness.platform.vm_ids(),
            )
        );
        assert!(harness.record(target.vm_id).is_none());

        let failures = harness
            .ctx
            .notifier
            .list("alice")
            .unwrap()
            .into_iter()
            .filter(|n| n.title == "Server creation failed")
            .count();
        assert_eq!(failures, 2);
    }

    #[tokio::test]
    async fn test_unwind_only_touches_reached_steps() {
        let harness = Harness::new().await;
        let target = provisioned(&harness).await;
        let compensator = Compensator::new(harness.ctx.clone());

        let report = compensator
            .unwind(ProvisioningStep::DbCreated, &target)
            .await;

        assert!(report.is_clean());
        assert!(harness.record(target.vm_id).is_none());
        assert!(harness.leases_in_use().is_empty());
        // nothing past the row was reached, so remote objects stay untouched
        assert_eq!(harness.firewall.object_count(), 3);
        assert_eq!(harness.platform.vm_ids().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_dns_delete_keeps_local_record() {
        let harness = Harness::new().await;
        let target = provisioned(&harness).await;
        let compensator = Compensator::new(harness.ctx.clone());
        harness.dns.fail("delete_record");

        let report = compensator
            .unwind(ProvisioningStep::DnsCreated, &target)
            .await;

        assert!(report.failed(UndoStage::DnsRecords));
        assert!(!report.failed(UndoStage::PlatformVm));
        let records = harness
            .ctx
            .subdomains
            .records_for_vm(target.vm_id)
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].record_type, RecordType::A);
    }
}
