use std::{net::Ipv4Addr, path::PathBuf, time::Duration};

use anyhow::{Context, Result, bail};
use autonet::{
    controller::{PowerOnFailure, ProvisioningConfig},
    dns::technitium::TechnitiumConfig,
    firewall::sophos::SophosConfig,
    guard::GuardLimits,
    platform::vcenter::VCenterConfig,
};
use serde::{Deserialize, Serialize};
use tokio::fs::read_to_string;
use tracing::warn;
use url::Url;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    #[serde(skip_serializing, skip_deserializing)]
    pub config_path: PathBuf,
    #[serde(skip_serializing, skip_deserializing)]
    pub config_dir: PathBuf,

    #[serde(rename = "data-dir")]
    pub data_dir: PathBuf,

    #[serde(rename = "api")]
    pub api_server_config: ApiServerConfig,

    #[serde(rename = "platform")]
    pub platform_config: PlatformConfig,

    #[serde(rename = "firewall")]
    pub firewall_config: FirewallConfig,

    #[serde(rename = "dns")]
    pub dns_config: DnsConfig,

    #[serde(rename = "provisioning", default)]
    pub provisioning_config: ProvisioningSection,

    #[serde(rename = "mail", default)]
    pub mail_config: Option<MailConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApiServerConfig {
    #[serde(rename = "host")]
    pub host: String,
    #[serde(rename = "port")]
    pub port: u16,
    #[serde(rename = "jwt-secret")]
    pub jwt_secret: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlatformConfig {
    #[serde(rename = "url")]
    pub url: String,
    #[serde(rename = "user")]
    pub user: String,
    #[serde(rename = "password")]
    pub password: String,
    #[serde(rename = "datastore")]
    pub datastore: String,
    #[serde(rename = "cluster")]
    pub cluster: String,
    #[serde(rename = "folder")]
    pub folder: String,
    #[serde(rename = "vm-name-prefix", default = "default_prefix")]
    pub vm_name_prefix: String,
    #[serde(rename = "verify-tls", default = "default_true")]
    pub verify_tls: bool,
    #[serde(rename = "session-check-interval-secs", default = "default_session_check")]
    pub session_check_interval_secs: u64,
    #[serde(rename = "template-cache-ttl-secs", default = "default_template_ttl")]
    pub template_cache_ttl_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FirewallConfig {
    #[serde(rename = "url")]
    pub url: String,
    #[serde(rename = "user")]
    pub user: String,
    #[serde(rename = "password")]
    pub password: String,
    #[serde(rename = "rule-group")]
    pub rule_group: String,
    #[serde(rename = "home-group")]
    pub home_group: String,
    #[serde(rename = "object-prefix", default = "default_prefix")]
    pub object_prefix: String,
    #[serde(rename = "source-networks", default)]
    pub source_networks: Vec<String>,
    #[serde(rename = "inbound-services", default)]
    pub inbound_services: Vec<String>,
    #[serde(rename = "outbound-services", default)]
    pub outbound_services: Vec<String>,
    #[serde(rename = "verify-tls", default = "default_true")]
    pub verify_tls: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DnsConfig {
    #[serde(rename = "url")]
    pub url: String,
    #[serde(rename = "token")]
    pub token: String,
    #[serde(rename = "default-ttl", default = "default_ttl")]
    pub default_ttl: u32,
}

/// Every key is optional.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProvisioningSection {
    #[serde(rename = "server-limit")]
    pub server_limit: usize,
    #[serde(rename = "max-storage-gib")]
    pub max_storage_gib: u32,
    #[serde(rename = "max-memory-gib")]
    pub max_memory_gib: u32,
    #[serde(rename = "settle-delay-secs")]
    pub settle_delay_secs: u64,
    #[serde(rename = "subdomain-suffix")]
    pub subdomain_suffix: String,
    #[serde(rename = "scripts-dir")]
    pub scripts_dir: PathBuf,
    #[serde(rename = "max-allowed-sources-per-user")]
    pub max_allowed_sources_per_user: usize,
    #[serde(rename = "power-on-failure")]
    pub power_on_failure: PowerOnFailure,
    /// Addresses added to the pool at start-up. Existing leases are kept.
    #[serde(rename = "ip-pool")]
    pub ip_pool: Vec<Ipv4Addr>,
}

impl Default for ProvisioningSection {
    fn default() -> Self {
        let limits = GuardLimits::default();
        let provisioning = ProvisioningConfig::default();
        Self {
            server_limit: limits.server_limit,
            max_storage_gib: limits.max_storage_gib,
            max_memory_gib: limits.max_memory_gib,
            settle_delay_secs: provisioning.settle_delay.as_secs(),
            subdomain_suffix: String::new(),
            scripts_dir: PathBuf::from("scripts"),
            max_allowed_sources_per_user: provisioning.max_allowed_sources_per_user,
            power_on_failure: provisioning.power_on_failure,
            ip_pool: vec![],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MailConfig {
    #[serde(rename = "relay-url")]
    pub relay_url: String,
}

fn default_prefix() -> String {
    "AUTO".to_string()
}

fn default_true() -> bool {
    true
}

fn default_session_check() -> u64 {
    60
}

fn default_template_ttl() -> u64 {
    60 * 60 * 24
}

fn default_ttl() -> u32 {
    3600
}

async fn resolve_config_path(path_override: Option<PathBuf>) -> Result<PathBuf> {
    let config_path =
        path_override.or_else(|| std::env::var("AUTONET_CONFIG").ok().map(PathBuf::from));

    if let Some(path) = config_path {
        return Ok(path);
    } else {
        warn!("No config path override found, looking for config in default locations");

        let cwd = std::env::current_dir()?;

        let path = cwd.join("autonet.toml");
        if path.exists() {
            return Ok(path);
        }
        warn!("No config found in current directory ({})", path.display());

        let Some(project_dirs) = directories::ProjectDirs::from("", "", "autonet") else {
            bail!("Failed to get config dir");
        };

        let path = project_dirs.config_dir().join("config.toml");
        if path.exists() {
            return Ok(path);
        }
        warn!("No config found in home config dir ({})", path.display());

        let path = PathBuf::from("/etc/autonet/config.toml");
        if path.exists() {
            return Ok(path);
        }
        warn!("No config found in global config dir ({})", path.display());
    }

    bail!("Couldn't load config file.");
}

impl Config {
    pub async fn load(path_override: Option<PathBuf>) -> Result<Self> {
        let config_path = resolve_config_path(path_override).await?;

        let config_str = read_to_string(&config_path).await?;
        let mut config = Self::parse(&config_str)?;
        config.config_path = config_path.clone();

        let Some(config_dir) = config_path.parent().map(|p| p.to_path_buf()) else {
            bail!("Couldn't determine config dir");
        };
        config.config_dir = config_dir;

        Ok(config)
    }

    pub fn parse(config_str: &str) -> Result<Self> {
        let config: Self = toml::from_str(config_str)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let mut endpoints = vec![
            ("platform.url", &self.platform_config.url),
            ("firewall.url", &self.firewall_config.url),
            ("dns.url", &self.dns_config.url),
        ];
        if let Some(mail) = &self.mail_config {
            endpoints.push(("mail.relay-url", &mail.relay_url));
        }

        for (key, value) in endpoints {
            let url = Url::parse(value).with_context(|| format!("{key} is not a valid url"))?;
            if !matches!(url.scheme(), "http" | "https") {
                bail!("{key} must be an http(s) url, got {value:?}");
            }
        }
        Ok(())
    }

    pub fn absolute_data_dir(&self) -> PathBuf {
        self.config_dir.join(&self.data_dir)
    }

    pub fn absolute_scripts_dir(&self) -> PathBuf {
        self.config_dir.join(&self.provisioning_config.scripts_dir)
    }

    pub fn guard_limits(&self) -> GuardLimits {
        GuardLimits {
            server_limit: self.provisioning_config.server_limit,
            max_storage_gib: self.provisioning_config.max_storage_gib,
            max_memory_gib: self.provisioning_config.max_memory_gib,
        }
    }

    pub fn provisioning(&self) -> ProvisioningConfig {
        ProvisioningConfig {
            vm_name_prefix: self.platform_config.vm_name_prefix.clone(),
            object_prefix: self.firewall_config.object_prefix.clone(),
            settle_delay: Duration::from_secs(self.provisioning_config.settle_delay_secs),
            power_on_failure: self.provisioning_config.power_on_failure,
            max_allowed_sources_per_user: self.provisioning_config.max_allowed_sources_per_user,
            dns_ttl: self.dns_config.default_ttl,
        }
    }

    pub fn vcenter(&self) -> VCenterConfig {
        let platform = &self.platform_config;
        VCenterConfig {
            url: platform.url.clone(),
            user: platform.user.clone(),
            password: platform.password.clone(),
            datastore: platform.datastore.clone(),
            cluster: platform.cluster.clone(),
            folder: platform.folder.clone(),
            verify_tls: platform.verify_tls,
        }
    }

    pub fn sophos(&self) -> SophosConfig {
        let firewall = &self.firewall_config;
        SophosConfig {
            url: firewall.url.clone(),
            user: firewall.user.clone(),
            password: firewall.password.clone(),
            rule_group: firewall.rule_group.clone(),
            home_group: firewall.home_group.clone(),
            object_prefix: firewall.object_prefix.clone(),
            source_networks: firewall.source_networks.clone(),
            inbound_services: firewall.inbound_services.clone(),
            outbound_services: firewall.outbound_services.clone(),
            verify_tls: firewall.verify_tls,
        }
    }

    pub fn technitium(&self) -> TechnitiumConfig {
        TechnitiumConfig {
            url: self.dns_config.url.clone(),
            token: self.dns_config.token.clone(),
        }
    }
}
