use anyhow::Context;
use tracing::{error, info};

use crate::{
    controller::{ControllerContext, compensate::tolerate_dns},
    dns::RecordData,
    error::{RequestError, RequestResult},
    resources::{
        identity::Identity,
        machine::VirtualMachineRecord,
        subdomain::{CreateRecordRequest, DeleteRecordRequest, SubdomainRecord},
    },
};

/// DNS records of servers that already exist.
pub struct RecordManager {
    ctx: ControllerContext,
}

impl RecordManager {
    pub fn new(ctx: ControllerContext) -> Self {
        Self { ctx }
    }

    pub async fn list_zones(&self) -> RequestResult<Vec<String>> {
        Ok(self
            .ctx
            .dns
            .list_zones()
            .await
            .context("failed to list zones")?)
    }

    pub fn list_records(
        &self,
        identity: &Identity,
        vm_id: u64,
    ) -> RequestResult<Vec<SubdomainRecord>> {
        self.owned(identity, vm_id)?;
        Ok(self.ctx.subdomains.records_for_vm(vm_id)?)
    }

    pub async fn create_record(
        &self,
        identity: &Identity,
        vm_id: u64,
        request: CreateRecordRequest,
    ) -> RequestResult<SubdomainRecord> {
        let server = self.owned(identity, vm_id)?;
        let data = RecordData::parse(request.record_type, &request.value)?;
        let value = data.value();

        // ownership is judged for the server's owner, also when an admin acts for them
        let claim = self.ctx.subdomains.claim_subdomain(
            &request.zone,
            &request.subdomain,
            &server.user_id,
            request.record_type,
            &value,
        )?;

        let ttl = request.ttl.unwrap_or(self.ctx.config.dns_ttl);
        self.ctx
            .dns
            .create_record(&claim.zone, &claim.subdomain, &data, ttl)
            .await
            .context("failed to create dns record")?;

        match self.ctx.subdomains.commit(
            &claim,
            request.record_type,
            &value,
            vm_id,
            &server.user_id,
        ) {
            Ok(record) => {
                info!(
                    "{} created {} {} for vm {}",
                    identity.user_id, record.record_type, record.subdomain, vm_id
                );
                Ok(record)
            }
            Err(e) => {
                if let Err(e) = self
                    .ctx
                    .dns
                    .delete_record(&claim.zone, &claim.subdomain, &data)
                    .await
                {
                    error!("failed to remove dns record {}: {}", claim.subdomain, e);
                }
                Err(e)
            }
        }
    }

    /// Remote first; the local row is only removed once the provider did not error.
    pub async fn delete_record(
        &self,
        identity: &Identity,
        vm_id: u64,
        request: DeleteRecordRequest,
    ) -> RequestResult<()> {
        self.owned(identity, vm_id)?;

        let key = SubdomainRecord::key(
            &request.zone,
            &request.subdomain,
            request.record_type,
            &request.value,
        );
        let Some(record) = self
            .ctx
            .store
            .get(&key)?
            .filter(|r| r.vm_id == vm_id)
        else {
            return Err(RequestError::NotFound);
        };

        let data = RecordData::parse(record.record_type, &record.value)?;
        tolerate_dns(
            self.ctx
                .dns
                .delete_record(&record.zone, &record.subdomain, &data)
                .await,
        )
        .context("failed to delete dns record")?;
        self.ctx.subdomains.remove(&record)?;

        info!(
            "{} deleted {} {} of vm {}",
            identity.user_id, record.record_type, record.subdomain, vm_id
        );
        Ok(())
    }

    fn owned(&self, identity: &Identity, vm_id: u64) -> RequestResult<VirtualMachineRecord> {
        self.ctx
            .store
            .get(&VirtualMachineRecord::key(vm_id))?
            .filter(|r| r.visible_to(&identity.user_id, identity.is_admin))
            .ok_or(RequestError::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::{ConflictError, ValidationError},
        resources::subdomain::RecordType,
        testing::{Harness, identity},
    };

    fn txt(subdomain: &str, value: &str) -> CreateRecordRequest {
        CreateRecordRequest {
            zone: "example.org".to_string(),
            subdomain: subdomain.to_string(),
            record_type: RecordType::Txt,
            value: value.to_string(),
            ttl: None,
        }
    }

    async fn provisioned(harness: &Harness) -> u64 {
        let started = harness
            .provisioner()
            .create_server(&identity("alice", false), harness.request("web1"))
            .await
            .unwrap();
        harness.wait_idle().await;
        started.id
    }

    #[tokio::test]
    async fn test_create_and_delete_record() {
        let harness = Harness::new().await;
        let vm_id = provisioned(&harness).await;
        let records = RecordManager::new(harness.ctx.clone());
        let alice = identity("alice", false);

        let record = records
            .create_record(&alice, vm_id, txt("api.web1", "hello"))
            .await
            .unwrap();
        assert_eq!(
            record.subdomain,
            format!("api.web1.{}", harness.ctx.subdomains.suffix())
        );
        assert_eq!(harness.dns.records().len(), 2);
        assert_eq!(records.list_records(&alice, vm_id).unwrap().len(), 2);

        records
            .delete_record(
                &alice,
                vm_id,
                DeleteRecordRequest {
                    zone: record.zone.clone(),
                    subdomain: record.subdomain.clone(),
                    record_type: record.record_type,
                    value: record.value.clone(),
                },
            )
            .await
            .unwrap();
        assert_eq!(harness.dns.records().len(), 1);
        assert_eq!(records.list_records(&alice, vm_id).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_record_rules_apply() {
        let harness = Harness::new().await;
        let vm_id = provisioned(&harness).await;
        let records = RecordManager::new(harness.ctx.clone());
        let alice = identity("alice", false);

        assert!(matches!(
            records
                .create_record(&alice, vm_id, txt("x.api.other", "x"))
                .await,
            Err(RequestError::Conflict(ConflictError::OwnershipRequired { .. }))
        ));

        let mut bad = txt("web1", "10.0.0.300");
        bad.record_type = RecordType::A;
        assert!(matches!(
            records.create_record(&alice, vm_id, bad).await,
            Err(RequestError::Validation(ValidationError::InvalidRecord(_)))
        ));

        for label in ["api.web1", "a.api.web1", "b.api.web1"] {
            records
                .create_record(&alice, vm_id, txt(label, "1"))
                .await
                .unwrap();
        }
        assert!(matches!(
            records
                .create_record(&alice, vm_id, txt("c.api.web1", "1"))
                .await,
            Err(RequestError::Conflict(ConflictError::TooManySubSubdomains { .. }))
        ));
        assert_eq!(harness.dns.records().len(), 4);
    }

    #[tokio::test]
    async fn test_records_of_other_users_are_hidden() {
        let harness = Harness::new().await;
        let vm_id = provisioned(&harness).await;
        let records = RecordManager::new(harness.ctx.clone());
        let bob = identity("bob", false);

        assert!(matches!(
            records.list_records(&bob, vm_id),
            Err(RequestError::NotFound)
        ));
        assert!(matches!(
            records.create_record(&bob, vm_id, txt("x.web1", "1")).await,
            Err(RequestError::NotFound)
        ));

        let admin = identity("root", true);
        let record = records
            .create_record(&admin, vm_id, txt("x.web1", "1"))
            .await
            .unwrap();
        assert_eq!(record.user_id, "alice");
    }

    #[tokio::test]
    async fn test_failed_remote_delete_keeps_record() {
        let harness = Harness::new().await;
        let vm_id = provisioned(&harness).await;
        let records = RecordManager::new(harness.ctx.clone());
        let alice = identity("alice", false);
        let stored = records.list_records(&alice, vm_id).unwrap().remove(0);
        harness.dns.fail("delete_record");

        let result = records
            .delete_record(
                &alice,
                vm_id,
                DeleteRecordRequest {
                    zone: stored.zone,
                    subdomain: stored.subdomain,
                    record_type: stored.record_type,
                    value: stored.value,
                },
            )
            .await;

        assert!(matches!(result, Err(RequestError::Internal(_))));
        assert_eq!(records.list_records(&alice, vm_id).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_list_zones() {
        let harness = Harness::new().await;
        let zones = RecordManager::new(harness.ctx.clone()).list_zones().await.unwrap();
        assert_eq!(zones, vec!["example.org".to_string()]);
    }
}
