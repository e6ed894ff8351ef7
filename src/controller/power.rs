use std::{collections::HashMap, sync::Arc};

use anyhow::anyhow;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::{
    controller::ControllerContext,
    error::{ConflictError, RequestError, RequestResult},
    platform::PlatformError,
    resources::{
        identity::Identity,
        machine::{PowerAction, PowerState, ServerView, VirtualMachineRecord},
    },
};

pub struct PowerAggregator {
    ctx: ControllerContext,
}

impl PowerAggregator {
    pub fn new(ctx: ControllerContext) -> Self {
        Self { ctx }
    }

    fn visible_records(
        &self,
        id: Option<u64>,
        identity: &Identity,
    ) -> RequestResult<Vec<VirtualMachineRecord>> {
        match id {
            Some(id) => Ok(vec![self.visible_record(id, identity)?]),
            None => Ok(self
                .ctx
                .store
                .list(&VirtualMachineRecord::partial_key())?
                .into_iter()
                .filter(|r| r.visible_to(&identity.user_id, identity.is_admin))
                .collect()),
        }
    }

    pub fn visible_record(
        &self,
        id: u64,
        identity: &Identity,
    ) -> RequestResult<VirtualMachineRecord> {
        self.ctx
            .store
            .get(&VirtualMachineRecord::key(id))?
            .filter(|r| r.visible_to(&identity.user_id, identity.is_admin))
            .ok_or(RequestError::NotFound)
    }

    /// Joins the visible records with the platform's power states. The platform list is
    /// fetched once; rows it does not know about are `UNKNOWN`. Result order is
    /// unspecified.
    pub async fn list_with_power_status(
        &self,
        id: Option<u64>,
        identity: &Identity,
    ) -> RequestResult<Vec<ServerView>> {
        let records = self.visible_records(id, identity)?;
        if records.is_empty() {
            return Ok(vec![]);
        }

        let states: HashMap<String, PowerState> = match self
            .ctx
            .sessions
            .call(|platform, session| async move { platform.list_vms(&session).await })
            .await
        {
            Ok(vms) => vms.into_iter().map(|vm| (vm.id, vm.power_state)).collect(),
            Err(e) => {
                warn!("failed to fetch platform vms, reporting unknown power state: {}", e);
                HashMap::new()
            }
        };
        let states = Arc::new(states);

        let mut lookups = JoinSet::new();
        for record in records {
            let states = states.clone();
            lookups.spawn(async move {
                let power_status = record
                    .platform_id
                    .as_ref()
                    .and_then(|id| states.get(id).copied())
                    .unwrap_or(PowerState::Unknown);
                ServerView {
                    record,
                    power_status,
                }
            });
        }

        let mut views = Vec::with_capacity(lookups.len());
        while let Some(view) = lookups.join_next().await {
            views.push(view.map_err(|e| anyhow!("power lookup task failed: {e}"))?);
        }

        Ok(views)
    }

    pub async fn power_action(
        &self,
        identity: &Identity,
        id: u64,
        action: PowerAction,
    ) -> RequestResult<()> {
        let record = self.visible_record(id, identity)?;
        let Some(platform_id) = record.platform_id.as_deref() else {
            return Err(ConflictError::NotProvisioned.into());
        };

        let result = self
            .ctx
            .sessions
            .call(|platform, session| async move {
                platform.power(&session, platform_id, action).await
            })
            .await;

        match result {
            Ok(()) => {
                info!("{} ran {:?} on vm {}", identity.user_id, action, id);
                Ok(())
            }
            Err(PlatformError::NotFound) => Err(RequestError::NotFound),
            Err(e) => Err(anyhow::Error::from(e).context("power action failed").into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Harness, identity};

    #[tokio::test]
    async fn test_power_status_join() {
        let harness = Harness::new().await;
        let alice = identity("alice", false);
        let bob = identity("bob", false);

        let web = harness
            .provisioner()
            .create_server(&alice, harness.request("web1"))
            .await
            .unwrap();
        harness.wait_idle().await;

        // a row the platform has never seen
        let mut pending = harness.record(web.id).unwrap();
        pending.id = 99;
        pending.user_id = "bob".to_string();
        pending.platform_id = None;
        harness
            .ctx
            .store
            .put(&VirtualMachineRecord::key(99), &pending)
            .unwrap();

        let aggregator = PowerAggregator::new(harness.ctx.clone());

        let views = aggregator.list_with_power_status(None, &alice).await.unwrap();
        assert_eq!(views.len(), 1);
        assert_eq!(views[0].power_status, PowerState::PoweredOn);

        let views = aggregator.list_with_power_status(Some(99), &bob).await.unwrap();
        assert_eq!(views[0].power_status, PowerState::Unknown);

        let all = aggregator
            .list_with_power_status(None, &identity("root", true))
            .await
            .unwrap();
        assert_eq!(all.len(), 2);

        assert!(matches!(
            aggregator.list_with_power_status(Some(web.id), &bob).await,
            Err(RequestError::NotFound)
        ));
        assert!(matches!(
            aggregator.list_with_power_status(Some(1234), &alice).await,
            Err(RequestError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_platform_outage_reports_unknown() {
        let harness = Harness::new().await;
        let alice = identity("alice", false);
        harness
            .provisioner()
            .create_server(&alice, harness.request("web1"))
            .await
            .unwrap();
        harness.wait_idle().await;
        harness.platform.fail("list_vms");

        let views = PowerAggregator::new(harness.ctx.clone())
            .list_with_power_status(None, &alice)
            .await
            .unwrap();
        assert_eq!(views.len(), 1);
        assert_eq!(views[0].power_status, PowerState::Unknown);
    }

    #[tokio::test]
    async fn test_power_action() {
        let harness = Harness::new().await;
        let alice = identity("alice", false);
        let web = harness
            .provisioner()
            .create_server(&alice, harness.request("web1"))
            .await
            .unwrap();
        harness.wait_idle().await;

        let aggregator = PowerAggregator::new(harness.ctx.clone());
        aggregator
            .power_action(&alice, web.id, PowerAction::ForceOff)
            .await
            .unwrap();

        let views = aggregator
            .list_with_power_status(Some(web.id), &alice)
            .await
            .unwrap();
        assert_eq!(views[0].power_status, PowerState::PoweredOff);

        assert!(matches!(
            aggregator
                .power_action(&identity("bob", false), web.id, PowerAction::On)
                .await,
            Err(RequestError::NotFound)
        ));
    }
}
