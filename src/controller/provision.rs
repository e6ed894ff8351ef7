use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Instant,
};

use anyhow::{Context, anyhow};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    allocator::{IpAllocator, SubdomainClaim},
    bootstrap::BootstrapContext,
    controller::{
        ControllerContext, PowerOnFailure,
        compensate::{CompensationTarget, Compensator},
    },
    dns::RecordData,
    error::{RequestError, RequestResult},
    firewall::{AllowedSource, FirewallBinding, allowed_source_name, allowed_source_prefix},
    guard::ServerSpec,
    platform::{DeploySpec, PlatformError, vm_name},
    resources::{
        identity::Identity,
        lease::IpAddressLease,
        machine::{CreateServerRequest, PowerAction, ProvisioningStarted, VirtualMachineRecord},
        subdomain::RecordType,
    },
    utils::time,
};

/// Furthest point a provisioning run has reached. Only lives in memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ProvisioningStep {
    None,
    DbCreated,
    PlatformCreated,
    FirewallCreated,
    IpBound,
    HomenetAllowed,
    PoweredOn,
    Bootstrapped,
    DnsCreated,
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error("provisioning was cancelled")]
    Cancelled,
    /// The platform already has a VM under the deterministic name.
    #[error("platform vm {0:?} already exists")]
    AlreadyExists(String),
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

struct RunHandle {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// One provisioning run: what it is building and how far it got.
struct Saga {
    identity: Identity,
    spec: ServerSpec,
    lease: IpAddressLease,
    claim: Option<SubdomainClaim>,
    target: CompensationTarget,
    step: ProvisioningStep,
    token: CancellationToken,
}

impl Saga {
    fn checkpoint(&self) -> Result<(), RunError> {
        if self.token.is_cancelled() {
            return Err(RunError::Cancelled);
        }
        Ok(())
    }

    fn reached(&mut self, step: ProvisioningStep, started: Instant) {
        debug!(
            "vm {} reached {:?} in {:?}",
            self.target.vm_id,
            step,
            started.elapsed()
        );
        self.step = step;
    }
}

pub struct Provisioner {
    ctx: ControllerContext,
    compensator: Compensator,
    runs: Mutex<HashMap<u64, RunHandle>>,
}

impl Provisioner {
    pub fn new(ctx: ControllerContext) -> Self {
        Self {
            compensator: Compensator::new(ctx.clone()),
            ctx,
            runs: Mutex::new(HashMap::new()),
        }
    }

    pub fn context(&self) -> &ControllerContext {
        &self.ctx
    }

    pub fn compensator(&self) -> &Compensator {
        &self.compensator
    }

    /// Validates the request, inserts the record and reserves its address, then hands the
    /// rest of the work to a background task. Only the synchronous part can be rejected.
    ///
    /// Nothing is awaited between the insert and the spawn, so dropping the returned
    /// future never leaves a row without a run.
    pub async fn create_server(
        self: &Arc<Self>,
        identity: &Identity,
        request: CreateServerRequest,
    ) -> RequestResult<ProvisioningStarted> {
        let templates = self
            .ctx
            .sessions
            .template_names()
            .await
            .context("failed to load templates")?;
        let spec = self
            .ctx
            .guard
            .validate(&request, &templates, time::today())?;
        self.ctx.guard.check(&self.ctx.store, identity, &spec.name)?;

        let (record, lease, claim) = self.insert_record(identity, &spec)?;
        info!(
            "vm {} ({}) created for {}, provisioning with ip {}",
            record.id, record.name, identity.user_id, lease.ip
        );

        let ip = lease.ip;
        let token = CancellationToken::new();
        let saga = Saga {
            identity: identity.clone(),
            target: CompensationTarget::from(&record),
            spec,
            lease,
            claim,
            step: ProvisioningStep::DbCreated,
            token: token.clone(),
        };

        let mut runs = self.runs();
        let provisioner = self.clone();
        let handle = tokio::spawn(async move { provisioner.run(saga).await });
        runs.insert(record.id, RunHandle { token, handle });
        drop(runs);

        Ok(ProvisioningStarted {
            id: record.id,
            ip,
            message: "provisioning started".to_string(),
        })
    }

    /// `NONE -> DB_CREATED`. Name, quota, address and subdomain are decided in the same
    /// transaction that writes the row, so concurrent requests cannot both pass.
    fn insert_record(
        &self,
        identity: &Identity,
        spec: &ServerSpec,
    ) -> RequestResult<(VirtualMachineRecord, IpAddressLease, Option<SubdomainClaim>)> {
        self.ctx.store.try_write(|txn| {
            self.ctx.guard.check_in(txn, identity, &spec.name)?;

            let id = txn.next_sequence("virtual_machine")?;
            let lease = IpAllocator::claim_in(txn, id)?;

            let claim = match &spec.subdomain {
                Some(request) => Some(self.ctx.subdomains.check_in(
                    txn,
                    &request.zone,
                    &request.label,
                    &identity.user_id,
                    RecordType::A,
                    &lease.ip.to_string(),
                )?),
                None => None,
            };

            let record = VirtualMachineRecord {
                id,
                user_id: identity.user_id.clone(),
                external_id: identity.external_id.clone(),
                platform_id: None,
                name: spec.name.clone(),
                description: spec.description.clone(),
                end_date: spec.end_date,
                operating_system: spec.operating_system.clone(),
                storage_gib: spec.storage_gib,
                memory_gib: spec.memory_gib,
                ip: None,
            };
            txn.put(&VirtualMachineRecord::key(id), &record)?;

            Ok::<_, RequestError>((record, lease, claim))
        })
    }

    async fn run(self: Arc<Self>, mut saga: Saga) {
        let started = Instant::now();
        let vm_id = saga.target.vm_id;

        match self.advance(&mut saga).await {
            Ok(()) => {
                info!("vm {} provisioned in {:?}", vm_id, started.elapsed());
                self.notify_success(&saga).await;
            }
            Err(RunError::Cancelled) => {
                info!("provisioning of vm {} cancelled at {:?}", vm_id, saga.step);
                let report = self.compensator.unwind(saga.step, &saga.target).await;
                if !report.is_clean() {
                    warn!("cancelled vm {} left {} undo failures", vm_id, report.failures.len());
                }
                self.ctx
                    .notifier
                    .notify_user(
                        &saga.identity,
                        "Server creation cancelled",
                        &format!("Creation of server {} was cancelled.", saga.target.name),
                    )
                    .await;
            }
            Err(RunError::AlreadyExists(name)) => {
                warn!(
                    "vm {} not deployed, platform vm {:?} was left behind by an earlier run",
                    vm_id, name
                );
                self.compensator
                    .compensate(saga.step, &saga.target, &saga.identity)
                    .await;
            }
            Err(e) => {
                error!(
                    "provisioning of vm {} failed after {:?}: {:#}",
                    vm_id, saga.step, e
                );
                self.compensator
                    .compensate(saga.step, &saga.target, &saga.identity)
                    .await;
            }
        }

        self.runs().remove(&vm_id);
    }

    async fn advance(&self, saga: &mut Saga) -> Result<(), RunError> {
        saga.checkpoint()?;
        self.deploy(saga).await?;

        saga.checkpoint()?;
        self.create_firewall(saga).await?;

        saga.checkpoint()?;
        let started = Instant::now();
        info!("vm {}: binding ip {}", saga.target.vm_id, saga.lease.ip);
        let platform_id = saga
            .target
            .platform_id
            .clone()
            .ok_or_else(|| anyhow!("platform id missing after deploy"))?;
        self.ctx
            .ips
            .bind(saga.lease.ip, saga.target.vm_id, &platform_id)?;
        saga.reached(ProvisioningStep::IpBound, started);

        saga.checkpoint()?;
        self.allow_home_networks(saga).await?;

        saga.checkpoint()?;
        self.power_on(saga, &platform_id).await?;

        self.bootstrap(saga, &platform_id).await?;

        saga.checkpoint()?;
        self.create_dns_record(saga).await?;

        Ok(())
    }

    /// `DB_CREATED -> PLATFORM_CREATED`.
    async fn deploy(&self, saga: &mut Saga) -> Result<(), RunError> {
        let started = Instant::now();
        info!("vm {}: deploying on platform", saga.target.vm_id);

        let template_id = self
            .ctx
            .sessions
            .template_id(&saga.spec.operating_system)
            .await
            .context("failed to resolve template")?;
        let spec = DeploySpec {
            name: vm_name(
                &self.ctx.config.vm_name_prefix,
                &saga.identity.external_id,
                &saga.spec.name,
            ),
            template_id,
            storage_gib: saga.spec.storage_gib,
            memory_gib: saga.spec.memory_gib,
        };

        let deployed = self
            .ctx
            .sessions
            .call(|platform, session| {
                let spec = &spec;
                async move { platform.deploy_vm(&session, spec).await }
            })
            .await;
        let platform_id = match deployed {
            Ok(id) => id,
            Err(PlatformError::AlreadyExists) => return Err(RunError::AlreadyExists(spec.name)),
            Err(e) => return Err(anyhow::Error::from(e).context("deploy failed").into()),
        };

        saga.target.platform_id = Some(platform_id.clone());
        saga.target.ip = Some(saga.lease.ip);
        saga.reached(ProvisioningStep::PlatformCreated, started);

        let vm_id = saga.target.vm_id;
        let ip = saga.lease.ip;
        self.ctx.store.write(|txn| {
            let key = VirtualMachineRecord::key(vm_id);
            let Some(mut record) = txn.get(&key)? else {
                return Err(anyhow!("record of vm {vm_id} disappeared"));
            };
            record.platform_id = Some(platform_id.clone());
            record.ip = Some(ip);
            txn.put(&key, &record)
        })?;

        Ok(())
    }

    /// `PLATFORM_CREATED -> FIREWALL_CREATED`. Cleans up its own partial work before
    /// returning an error.
    async fn create_firewall(&self, saga: &mut Saga) -> Result<(), RunError> {
        let started = Instant::now();
        info!("vm {}: creating firewall rules", saga.target.vm_id);

        let firewall = &self.ctx.firewall;
        let binding = FirewallBinding::new(
            &self.ctx.config.object_prefix,
            &saga.identity.external_id,
            &saga.spec.name,
        );

        firewall
            .create_ip_host(&binding.host, saga.lease.ip)
            .await
            .context("failed to create ip host")?;

        let (inbound, outbound) = tokio::join!(
            firewall.create_inbound_rule(&binding),
            firewall.create_outbound_rule(&binding)
        );

        let grouped = match (&inbound, &outbound) {
            (Ok(()), Ok(())) => firewall
                .add_rules_to_group(&binding)
                .await
                .context("failed to add rules to group"),
            _ => Err(anyhow!("failed to create firewall rules")),
        };

        if let Err(e) = grouped {
            if let Err(e) = &inbound {
                warn!("inbound rule for vm {}: {}", saga.target.vm_id, e);
            }
            if let Err(e) = &outbound {
                warn!("outbound rule for vm {}: {}", saga.target.vm_id, e);
            }

            if inbound.is_ok() {
                if let Err(e) = firewall.remove_inbound_rule(&binding).await {
                    error!("failed to remove {}: {}", binding.inbound, e);
                }
            }
            if outbound.is_ok() {
                if let Err(e) = firewall.remove_outbound_rule(&binding).await {
                    error!("failed to remove {}: {}", binding.outbound, e);
                }
            }
            if let Err(e) = firewall.remove_ip_host(&binding.host).await {
                error!("failed to remove {}: {}", binding.host, e);
            }
            return Err(e.into());
        }

        saga.reached(ProvisioningStep::FirewallCreated, started);
        Ok(())
    }

    /// `IP_BOUND -> HOMENET_ALLOWED`.
    async fn allow_home_networks(&self, saga: &mut Saga) -> Result<(), RunError> {
        let started = Instant::now();

        if !saga.spec.home_ips.is_empty() {
            info!("vm {}: allowing home networks", saga.target.vm_id);
            let firewall = &self.ctx.firewall;
            let prefix = &self.ctx.config.object_prefix;
            let external_id = &saga.identity.external_id;

            let existing = firewall
                .list_allowed_sources()
                .await
                .context("failed to list allowed sources")?;
            let owner_prefix = allowed_source_prefix(prefix, external_id);
            let mut used_names: HashSet<String> = existing
                .iter()
                .filter(|s| s.name.starts_with(&owner_prefix))
                .map(|s| s.name.clone())
                .collect();

            for ip in &saga.spec.home_ips {
                if existing.iter().any(|s: &AllowedSource| s.ip == *ip) {
                    debug!("home ip {} already allowed", ip);
                    continue;
                }
                if used_names.len() >= self.ctx.config.max_allowed_sources_per_user {
                    warn!(
                        "{} already has {} allowed sources, skipping {}",
                        external_id,
                        used_names.len(),
                        ip
                    );
                    continue;
                }

                let name = (0..)
                    .map(|index| allowed_source_name(prefix, external_id, index))
                    .find(|name| !used_names.contains(name))
                    .ok_or_else(|| anyhow!("no free allowed source name"))?;
                firewall
                    .add_allowed_source(&name, *ip)
                    .await
                    .with_context(|| format!("failed to allow {ip}"))?;
                used_names.insert(name);
            }
        }

        saga.reached(ProvisioningStep::HomenetAllowed, started);
        Ok(())
    }

    /// `HOMENET_ALLOWED -> POWERED_ON`.
    async fn power_on(&self, saga: &mut Saga, platform_id: &str) -> Result<(), RunError> {
        let started = Instant::now();
        info!("vm {}: powering on", saga.target.vm_id);

        let result = self
            .ctx
            .sessions
            .call(|platform, session| async move {
                platform.power(&session, platform_id, PowerAction::On).await
            })
            .await;

        if let Err(e) = result {
            match self.ctx.config.power_on_failure {
                PowerOnFailure::Abort => {
                    return Err(anyhow::Error::from(e).context("power on failed").into());
                }
                PowerOnFailure::Continue => {
                    warn!("vm {}: power on failed, continuing: {}", saga.target.vm_id, e)
                }
            }
        }

        saga.reached(ProvisioningStep::PoweredOn, started);
        Ok(())
    }

    /// `POWERED_ON -> BOOTSTRAPPED`, after giving the guest time to boot.
    async fn bootstrap(&self, saga: &mut Saga, platform_id: &str) -> Result<(), RunError> {
        let started = Instant::now();

        tokio::select! {
            _ = saga.token.cancelled() => return Err(RunError::Cancelled),
            _ = tokio::time::sleep(self.ctx.config.settle_delay) => {}
        }

        info!("vm {}: running startup script", saga.target.vm_id);
        let script = self
            .ctx
            .scripts
            .load(&saga.spec.operating_system)
            .await
            .context("failed to load startup script")?;
        let context = BootstrapContext {
            username: saga.identity.first_name().to_string(),
            external_id: saga.identity.external_id.clone(),
            platform_id: platform_id.to_string(),
            ip: saga.lease.ip,
            vm_name: saga.spec.name.clone(),
        };

        self.ctx
            .bootstrap
            .run_startup_script(&script, &context)
            .await
            .context("startup script failed")?;

        saga.reached(ProvisioningStep::Bootstrapped, started);
        Ok(())
    }

    /// `BOOTSTRAPPED -> DNS_CREATED`, only when a subdomain was requested.
    async fn create_dns_record(&self, saga: &mut Saga) -> Result<(), RunError> {
        let Some(claim) = saga.claim.clone() else {
            return Ok(());
        };
        let started = Instant::now();
        info!(
            "vm {}: creating dns record {} in {}",
            saga.target.vm_id, claim.subdomain, claim.zone
        );

        let data = RecordData::A(saga.lease.ip);
        self.ctx
            .dns
            .create_record(&claim.zone, &claim.subdomain, &data, self.ctx.config.dns_ttl)
            .await
            .context("failed to create dns record")?;

        let committed = self.ctx.subdomains.commit(
            &claim,
            RecordType::A,
            &data.value(),
            saga.target.vm_id,
            &saga.identity.user_id,
        );
        if let Err(e) = committed {
            if let Err(e) = self
                .ctx
                .dns
                .delete_record(&claim.zone, &claim.subdomain, &data)
                .await
            {
                error!("failed to remove dns record {}: {}", claim.subdomain, e);
            }
            return Err(anyhow!("subdomain claim no longer holds: {e}").into());
        }

        saga.reached(ProvisioningStep::DnsCreated, started);
        Ok(())
    }

    async fn notify_success(&self, saga: &Saga) {
        let username = saga.identity.first_name();
        let mut body = format!(
            "Your server {} is ready at {}. Log in as {} with password {} and change it.",
            saga.spec.name,
            saga.lease.ip,
            username,
            username
        );
        if let Some(claim) = &saga.claim {
            body.push_str(&format!(" It is reachable as {}.{}.", claim.subdomain, claim.zone));
        }

        self.ctx
            .notifier
            .notify_user(&saga.identity, "Server created", &body)
            .await;
    }

    /// Cancels the background run of `vm_id`, if any, and waits until it has unwound.
    pub async fn cancel(&self, vm_id: u64) -> bool {
        let run = self.runs().remove(&vm_id);
        let Some(run) = run else {
            return false;
        };

        run.token.cancel();
        if let Err(e) = run.handle.await {
            error!("provisioning task of vm {} failed: {}", vm_id, e);
        }
        true
    }

    /// Waits for every run that is currently in flight.
    pub async fn wait_idle(&self) {
        let handles: Vec<JoinHandle<()>> = {
            let mut runs = self.runs();
            runs.drain().map(|(_, run)| run.handle).collect()
        };

        for handle in handles {
            if let Err(e) = handle.await {
                error!("provisioning task failed: {}", e);
            }
        }
    }

    pub fn in_flight(&self) -> usize {
        self.runs().len()
    }

    /// The registry is never held across an await.
    fn runs(&self) -> MutexGuard<'_, HashMap<u64, RunHandle>> {
        self.runs.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
