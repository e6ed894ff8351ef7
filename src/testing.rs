// In-memory collaborators and a fully wired controller context for unit tests.

use std::{
    collections::{BTreeMap, BTreeSet, HashSet},
    net::Ipv4Addr,
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use anyhow::anyhow;
use async_trait::async_trait;
use tempfile::TempDir;

use crate::{
    allocator::{IpAllocator, SubdomainAllocator},
    bootstrap::{BootstrapContext, BootstrapError, GuestBootstrap, ScriptLibrary, StartupScript},
    controller::{ControllerContext, ProvisioningConfig, provision::Provisioner},
    dns::{DnsError, DnsProvider, DnsRecordEntry, RecordData},
    firewall::{AllowedSource, Firewall, FirewallBinding, FirewallError},
    guard::{Guard, GuardLimits},
    machinery::store::Store,
    notify::{Mailer, Notifier},
    platform::{
        DeploySpec, Platform, PlatformError, PlatformSession, PlatformSessionCache, PlatformVm,
        Template,
    },
    resources::{
        identity::Identity,
        lease::IpAddressLease,
        machine::{CreateServerRequest, PowerAction, PowerState, VirtualMachineRecord},
    },
};

pub fn identity(user_id: &str, is_admin: bool) -> Identity {
    Identity {
        user_id: user_id.to_string(),
        is_admin,
        display_name: "Test User".to_string(),
        external_id: format!("s-{user_id}"),
        email: None,
    }
}

#[derive(Default)]
struct PlatformState {
    sessions: HashSet<String>,
    templates: Vec<Template>,
    vms: BTreeMap<String, PlatformVm>,
    deleted: Vec<String>,
    failing: HashSet<String>,
    next_vm: usize,
}

pub struct FakePlatform {
    pub sessions_created: AtomicUsize,
    state: Mutex<PlatformState>,
}

impl Default for FakePlatform {
    fn default() -> Self {
        let platform = Self {
            sessions_created: AtomicUsize::new(0),
            state: Mutex::new(PlatformState::default()),
        };
        platform.add_template("UBUNTU");
        platform
    }
}

impl FakePlatform {
    /// `deploy`, `deploy_exists`, `power` or `list_vms`.
    pub fn fail(&self, operation: &str) {
        self.state.lock().unwrap().failing.insert(operation.to_string());
    }

    pub fn expire_sessions(&self) {
        self.state.lock().unwrap().sessions.clear();
    }

    pub fn add_template(&self, name: &str) {
        let mut state = self.state.lock().unwrap();
        let id = format!("tpl-{}", state.templates.len() + 1);
        state.templates.push(Template {
            id,
            name: name.to_string(),
        });
    }

    pub fn vm_ids(&self) -> Vec<String> {
        self.state.lock().unwrap().vms.keys().cloned().collect()
    }

    pub fn vm_names(&self) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state.vms.values().map(|vm| vm.name.clone()).collect()
    }

    pub fn deleted(&self) -> Vec<String> {
        self.state.lock().unwrap().deleted.clone()
    }

    fn authorize(&self, session: &PlatformSession) -> Result<(), PlatformError> {
        if self.state.lock().unwrap().sessions.contains(&session.0) {
            Ok(())
        } else {
            Err(PlatformError::Unauthorized)
        }
    }

    fn failing(&self, operation: &str) -> bool {
        self.state.lock().unwrap().failing.contains(operation)
    }
}

#[async_trait]
impl Platform for FakePlatform {
    async fn create_session(&self) -> Result<PlatformSession, PlatformError> {
        let n = self.sessions_created.fetch_add(1, Ordering::SeqCst) + 1;
        let session = format!("session-{n}");
        self.state.lock().unwrap().sessions.insert(session.clone());
        Ok(PlatformSession(session))
    }

    async fn session_valid(&self, session: &PlatformSession) -> Result<bool, PlatformError> {
        Ok(self.state.lock().unwrap().sessions.contains(&session.0))
    }

    async fn list_templates(
        &self,
        session: &PlatformSession,
    ) -> Result<Vec<Template>, PlatformError> {
        self.authorize(session)?;
        Ok(self.state.lock().unwrap().templates.clone())
    }

    async fn deploy_vm(
        &self,
        session: &PlatformSession,
        spec: &DeploySpec,
    ) -> Result<String, PlatformError> {
        self.authorize(session)?;
        if self.failing("deploy") {
            return Err(anyhow!("deploy failed").into());
        }
        if self.failing("deploy_exists") {
            return Err(PlatformError::AlreadyExists);
        }

        let mut state = self.state.lock().unwrap();
        if state.vms.values().any(|vm| vm.name == spec.name) {
            return Err(PlatformError::AlreadyExists);
        }
        state.next_vm += 1;
        let id = format!("vm-{}", state.next_vm);
        state.vms.insert(
            id.clone(),
            PlatformVm {
                id: id.clone(),
                name: spec.name.clone(),
                power_state: PowerState::PoweredOff,
            },
        );
        Ok(id)
    }

    async fn delete_vm(&self, session: &PlatformSession, id: &str) -> Result<(), PlatformError> {
        self.authorize(session)?;
        let mut state = self.state.lock().unwrap();
        if state.vms.remove(id).is_none() {
            return Err(PlatformError::NotFound);
        }
        state.deleted.push(id.to_string());
        Ok(())
    }

    async fn power(
        &self,
        session: &PlatformSession,
        id: &str,
        action: PowerAction,
    ) -> Result<(), PlatformError> {
        self.authorize(session)?;
        if self.failing("power") {
            return Err(anyhow!("power failed").into());
        }

        let mut state = self.state.lock().unwrap();
        let vm = state.vms.get_mut(id).ok_or(PlatformError::NotFound)?;
        vm.power_state = match action {
            PowerAction::On | PowerAction::Reset => PowerState::PoweredOn,
            PowerAction::Off | PowerAction::ForceOff => PowerState::PoweredOff,
        };
        Ok(())
    }

    async fn list_vms(&self, session: &PlatformSession) -> Result<Vec<PlatformVm>, PlatformError> {
        self.authorize(session)?;
        if self.failing("list_vms") {
            return Err(anyhow!("list failed").into());
        }
        Ok(self.state.lock().unwrap().vms.values().cloned().collect())
    }
}

#[derive(Default)]
struct FirewallState {
    hosts: BTreeMap<String, Ipv4Addr>,
    rules: BTreeSet<String>,
    group: BTreeSet<String>,
    sources: Vec<AllowedSource>,
    calls: Vec<String>,
    failing: HashSet<String>,
}

#[derive(Default)]
pub struct FakeFirewall {
    state: Mutex<FirewallState>,
}

impl FakeFirewall {
    /// Makes the named trait method fail from now on.
    pub fn fail(&self, operation: &str) {
        self.state.lock().unwrap().failing.insert(operation.to_string());
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    /// Hosts and rules; allowed sources are not counted.
    pub fn object_count(&self) -> usize {
        let state = self.state.lock().unwrap();
        state.hosts.len() + state.rules.len()
    }

    pub fn has_object(&self, name: &str) -> bool {
        let state = self.state.lock().unwrap();
        state.hosts.contains_key(name) || state.rules.contains(name)
    }

    pub fn in_group(&self, name: &str) -> bool {
        self.state.lock().unwrap().group.contains(name)
    }

    pub fn seed_source(&self, name: &str, ip: Ipv4Addr) {
        self.state.lock().unwrap().sources.push(AllowedSource {
            name: name.to_string(),
            ip,
        });
    }

    pub fn sources(&self) -> Vec<AllowedSource> {
        self.state.lock().unwrap().sources.clone()
    }

    fn enter(
        &self,
        operation: &str,
        object: &str,
    ) -> Result<MutexGuard<'_, FirewallState>, FirewallError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("{operation} {object}"));
        if state.failing.contains(operation) {
            return Err(FirewallError::Rejected(format!("{operation} failed")));
        }
        Ok(state)
    }

    fn add_rule(&self, operation: &str, name: &str) -> Result<(), FirewallError> {
        let mut state = self.enter(operation, name)?;
        state.rules.insert(name.to_string());
        Ok(())
    }

    fn remove_rule(&self, operation: &str, name: &str) -> Result<(), FirewallError> {
        let mut state = self.enter(operation, name)?;
        state.group.remove(name);
        if !state.rules.remove(name) {
            return Err(FirewallError::NotFound);
        }
        Ok(())
    }
}

#[async_trait]
impl Firewall for FakeFirewall {
    async fn create_ip_host(&self, name: &str, ip: Ipv4Addr) -> Result<(), FirewallError> {
        let mut state = self.enter("create_ip_host", name)?;
        state.hosts.insert(name.to_string(), ip);
        Ok(())
    }

    async fn create_inbound_rule(&self, binding: &FirewallBinding) -> Result<(), FirewallError> {
        self.add_rule("create_inbound_rule", &binding.inbound)
    }

    async fn create_outbound_rule(&self, binding: &FirewallBinding) -> Result<(), FirewallError> {
        self.add_rule("create_outbound_rule", &binding.outbound)
    }

    async fn add_rules_to_group(&self, binding: &FirewallBinding) -> Result<(), FirewallError> {
        let mut state = self.enter("add_rules_to_group", &binding.inbound)?;
        state.group.insert(binding.inbound.clone());
        state.group.insert(binding.outbound.clone());
        Ok(())
    }

    async fn remove_ip_host(&self, name: &str) -> Result<(), FirewallError> {
        let mut state = self.enter("remove_ip_host", name)?;
        if state.hosts.remove(name).is_none() {
            return Err(FirewallError::NotFound);
        }
        Ok(())
    }

    async fn remove_inbound_rule(&self, binding: &FirewallBinding) -> Result<(), FirewallError> {
        self.remove_rule("remove_inbound_rule", &binding.inbound)
    }

    async fn remove_outbound_rule(&self, binding: &FirewallBinding) -> Result<(), FirewallError> {
        self.remove_rule("remove_outbound_rule", &binding.outbound)
    }

    async fn list_allowed_sources(&self) -> Result<Vec<AllowedSource>, FirewallError> {
        let state = self.enter("list_allowed_sources", "")?;
        Ok(state.sources.clone())
    }

    async fn add_allowed_source(&self, name: &str, ip: Ipv4Addr) -> Result<(), FirewallError> {
        let mut state = self.enter("add_allowed_source", name)?;
        state.sources.push(AllowedSource {
            name: name.to_string(),
            ip,
        });
        Ok(())
    }
}

#[derive(Default)]
struct DnsState {
    records: Vec<(String, String, RecordData)>,
    failing: HashSet<String>,
}

#[derive(Default)]
pub struct FakeDns {
    state: Mutex<DnsState>,
}

impl FakeDns {
    /// `create_record`, `delete_record` or `list_zones`.
    pub fn fail(&self, operation: &str) {
        self.state.lock().unwrap().failing.insert(operation.to_string());
    }

    /// `(zone, name, value)` of every record currently held.
    pub fn records(&self) -> Vec<(String, String, String)> {
        self.state
            .lock()
            .unwrap()
            .records
            .iter()
            .map(|(zone, name, data)| (zone.clone(), name.clone(), data.value()))
            .collect()
    }

    fn failing(&self, operation: &str) -> bool {
        self.state.lock().unwrap().failing.contains(operation)
    }
}

#[async_trait]
impl DnsProvider for FakeDns {
    async fn create_record(
        &self,
        zone: &str,
        name: &str,
        data: &RecordData,
        _ttl: u32,
    ) -> Result<(), DnsError> {
        if self.failing("create_record") {
            return Err(DnsError::Rejected("create failed".to_string()));
        }
        self.state
            .lock()
            .unwrap()
            .records
            .push((zone.to_string(), name.to_string(), data.clone()));
        Ok(())
    }

    async fn delete_record(
        &self,
        zone: &str,
        name: &str,
        data: &RecordData,
    ) -> Result<(), DnsError> {
        if self.failing("delete_record") {
            return Err(DnsError::Rejected("delete failed".to_string()));
        }
        let mut state = self.state.lock().unwrap();
        let before = state.records.len();
        state
            .records
            .retain(|(z, n, d)| !(z == zone && n == name && d == data));
        if state.records.len() == before {
            return Err(DnsError::NotFound);
        }
        Ok(())
    }

    async fn list_zones(&self) -> Result<Vec<String>, DnsError> {
        if self.failing("list_zones") {
            return Err(DnsError::Rejected("list failed".to_string()));
        }
        Ok(vec!["example.org".to_string()])
    }

    async fn list_records(&self, zone: &str) -> Result<Vec<DnsRecordEntry>, DnsError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .records
            .iter()
            .filter(|(z, _, _)| z == zone)
            .map(|(_, name, data)| DnsRecordEntry {
                name: name.clone(),
                record_type: data.record_type().to_string(),
                ttl: 3600,
            })
            .collect())
    }
}

#[derive(Default)]
pub struct FakeBootstrap {
    usernames: Mutex<Vec<String>>,
    failing: AtomicBool,
}

impl FakeBootstrap {
    pub fn fail(&self) {
        self.failing.store(true, Ordering::SeqCst);
    }

    /// Accounts the startup script was asked to create.
    pub fn usernames(&self) -> Vec<String> {
        self.usernames.lock().unwrap().clone()
    }
}

#[async_trait]
impl GuestBootstrap for FakeBootstrap {
    async fn run_startup_script(
        &self,
        _script: &StartupScript,
        context: &BootstrapContext,
    ) -> Result<(), BootstrapError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(anyhow!("script exited with 1").into());
        }
        self.usernames.lock().unwrap().push(context.username.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeMailer {
    sent: Mutex<Vec<String>>,
}

impl FakeMailer {
    /// Recipients, in send order.
    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Mailer for FakeMailer {
    async fn send(&self, to: &str, _subject: &str, _body: &str) -> anyhow::Result<()> {
        self.sent.lock().unwrap().push(to.to_string());
        Ok(())
    }
}

/// A controller context over a temporary store and fake collaborators, with two
/// addresses in the pool.
pub struct Harness {
    _dir: TempDir,
    pub ctx: ControllerContext,
    pub platform: Arc<FakePlatform>,
    pub firewall: Arc<FakeFirewall>,
    pub dns: Arc<FakeDns>,
    pub bootstrap: Arc<FakeBootstrap>,
    provisioner: Arc<Provisioner>,
}

impl Harness {
    pub const SUFFIX: &'static str = "students";

    /// Defaults with no settle delay.
    pub fn config() -> ProvisioningConfig {
        ProvisioningConfig {
            settle_delay: Duration::ZERO,
            ..ProvisioningConfig::default()
        }
    }

    pub async fn new() -> Self {
        Self::with_config(Self::config()).await
    }

    pub async fn with_config(config: ProvisioningConfig) -> Self {
        let dir = tempfile::tempdir().expect("failed to create tempdir");
        let store = Arc::new(
            Store::new(dir.path().join("db"))
                .await
                .expect("failed to create store"),
        );

        let ips = Arc::new(IpAllocator::new(store.clone()));
        ips.seed(&["10.0.0.10".parse().unwrap(), "10.0.0.11".parse().unwrap()])
            .expect("failed to seed ips");

        let scripts = dir.path().join("scripts");
        tokio::fs::create_dir_all(&scripts).await.unwrap();
        let script = StartupScript {
            user: "root".to_string(),
            password: "root".to_string(),
            script_location: "/opt/setup.sh".to_string(),
            script_executable: "/bin/bash".to_string(),
        };
        tokio::fs::write(
            scripts.join("UBUNTU.json"),
            serde_json::to_vec(&script).unwrap(),
        )
        .await
        .unwrap();

        let platform = Arc::new(FakePlatform::default());
        let firewall = Arc::new(FakeFirewall::default());
        let dns = Arc::new(FakeDns::default());
        let bootstrap = Arc::new(FakeBootstrap::default());

        let ctx = ControllerContext {
            ips,
            subdomains: Arc::new(SubdomainAllocator::new(store.clone(), Self::SUFFIX)),
            guard: Arc::new(Guard::new(GuardLimits::default())),
            sessions: Arc::new(PlatformSessionCache::new(
                platform.clone(),
                Duration::from_secs(60),
                Duration::from_secs(3600),
            )),
            firewall: firewall.clone(),
            dns: dns.clone(),
            bootstrap: bootstrap.clone(),
            scripts: Arc::new(ScriptLibrary::new(&scripts)),
            notifier: Arc::new(Notifier::new(store.clone(), None)),
            config: Arc::new(config),
            store,
        };

        Self {
            _dir: dir,
            provisioner: Arc::new(Provisioner::new(ctx.clone())),
            ctx,
            platform,
            firewall,
            dns,
            bootstrap,
        }
    }

    pub fn provisioner(&self) -> Arc<Provisioner> {
        self.provisioner.clone()
    }

    /// A valid request for `name`, with a subdomain of the same name.
    pub fn request(&self, name: &str) -> CreateServerRequest {
        CreateServerRequest {
            name: name.to_string(),
            description: format!("test server {name}"),
            operating_system: "UBUNTU".to_string(),
            end_date: "2099-12-31".to_string(),
            storage: 10,
            memory: 1,
            home_ips: None,
            sub_domain: Some(name.to_string()),
            domain_zone: Some("example.org".to_string()),
        }
    }

    pub async fn wait_idle(&self) {
        self.provisioner.wait_idle().await;
    }

    pub fn record(&self, id: u64) -> Option<VirtualMachineRecord> {
        self.ctx.store.get(&VirtualMachineRecord::key(id)).unwrap()
    }

    pub fn records(&self) -> Vec<VirtualMachineRecord> {
        self.ctx
            .store
            .list(&VirtualMachineRecord::partial_key())
            .unwrap()
    }

    pub fn leases_in_use(&self) -> Vec<IpAddressLease> {
        self.ctx
            .ips
            .list()
            .unwrap()
            .into_iter()
            .filter(|l| l.in_use())
            .collect()
    }

    /// Newest first.
    pub fn notification_titles(&self, user_id: &str) -> Vec<String> {
        self.ctx
            .notifier
            .list(user_id)
            .unwrap()
            .into_iter()
            .map(|n| n.title)
            .collect()
    }
}
