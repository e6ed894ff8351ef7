use std::sync::Arc;

use anyhow::anyhow;
use tracing::{info, warn};

use crate::{
    controller::{
        ControllerContext,
        compensate::{CompensationTarget, UndoStage},
        provision::{ProvisioningStep, Provisioner},
    },
    error::{RequestError, RequestResult},
    platform::vm_name,
    resources::{identity::Identity, machine::VirtualMachineRecord},
};

/// Deletes a server regardless of how far its provisioning got.
pub struct Teardown {
    ctx: ControllerContext,
    provisioner: Arc<Provisioner>,
}

impl Teardown {
    pub fn new(provisioner: Arc<Provisioner>) -> Self {
        Self {
            ctx: provisioner.context().clone(),
            provisioner,
        }
    }

    pub async fn delete_server(&self, identity: &Identity, id: u64) -> RequestResult<()> {
        let Some(record) = self.visible(id, identity)? else {
            return Err(RequestError::NotFound);
        };

        if self.provisioner.cancel(id).await {
            info!("cancelled in-flight provisioning of vm {}", id);
        }

        // the cancelled run may already have unwound and removed the row
        let record = self
            .ctx
            .store
            .get(&VirtualMachineRecord::key(id))?
            .unwrap_or(record);

        let compensator = self.provisioner.compensator();
        compensator
            .remove_dns_records(id)
            .await
            .map_err(|e| e.context("failed to remove dns records, server kept"))?;

        let mut target = CompensationTarget::from(&record);
        if target.platform_id.is_none() {
            target.platform_id = self.find_platform_id(&record).await;
        }

        let report = compensator
            .unwind(ProvisioningStep::DnsCreated, &target)
            .await;
        if report.failed(UndoStage::Record) {
            return Err(anyhow!("failed to delete record of vm {id}").into());
        }
        if !report.is_clean() {
            warn!(
                "vm {} deleted with {} remote cleanup failures",
                id,
                report.failures.len()
            );
        }

        info!("{} deleted vm {} ({})", identity.user_id, id, record.name);
        Ok(())
    }

    fn visible(&self, id: u64, identity: &Identity) -> RequestResult<Option<VirtualMachineRecord>> {
        Ok(self
            .ctx
            .store
            .get(&VirtualMachineRecord::key(id))?
            .filter(|r| r.visible_to(&identity.user_id, identity.is_admin)))
    }

    /// Looks the VM up by its deterministic name, for rows whose platform id was never
    /// written back.
    async fn find_platform_id(&self, record: &VirtualMachineRecord) -> Option<String> {
        let name = vm_name(
            &self.ctx.config.vm_name_prefix,
            &record.external_id,
            &record.name,
        );

        match self
            .ctx
            .sessions
            .call(|platform, session| async move { platform.list_vms(&session).await })
            .await
        {
            Ok(vms) => vms.into_iter().find(|vm| vm.name == name).map(|vm| vm.id),
            Err(e) => {
                warn!("failed to look up platform vm {}: {}", name, e);
                None
            }
        }
    }
}
