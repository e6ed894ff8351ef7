mod cmd;
mod config;

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use autonet::{
    allocator::{IpAllocator, SubdomainAllocator},
    api::{
        ApiServer, ApiServerConfig, ApiState,
        auth::AuthHandler,
        core::CoreService,
        services::{AdminService, DnsService, NotificationService, ServerService, TemplateService},
    },
    bootstrap::{ScriptLibrary, VCenterGuestRunner},
    controller::{ControllerContext, provision::Provisioner},
    dns::technitium::TechnitiumClient,
    firewall::sophos::SophosClient,
    guard::Guard,
    machinery::store::Store,
    notify::{Mailer, Notifier, RelayMailer},
    platform::{Platform, PlatformSessionCache, vcenter::VCenterClient},
    utils::tracing::init_tracing,
};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::{cmd::Cli, config::Config};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let config = Config::load(cli.config_path).await?;
    info!("loaded config from {}", config.config_path.display());

    let store = Arc::new(Store::new(config.absolute_data_dir()).await?);

    let ips = Arc::new(IpAllocator::new(store.clone()));
    let pool = &config.provisioning_config.ip_pool;
    if !pool.is_empty() {
        let added = ips.seed(pool)?;
        info!("ip pool has {} configured addresses, {} new", pool.len(), added);
    }

    let platform: Arc<dyn Platform> = Arc::new(VCenterClient::new(config.vcenter())?);
    let sessions = Arc::new(PlatformSessionCache::new(
        platform,
        Duration::from_secs(config.platform_config.session_check_interval_secs),
        Duration::from_secs(config.platform_config.template_cache_ttl_secs),
    ));
    let bootstrap = Arc::new(VCenterGuestRunner::new(
        config.platform_config.url.clone(),
        config.platform_config.verify_tls,
        sessions.clone(),
    )?);

    let mailer = config
        .mail_config
        .as_ref()
        .map(|mail| Arc::new(RelayMailer::new(mail.relay_url.clone())) as Arc<dyn Mailer>);

    let ctx = ControllerContext {
        ips,
        subdomains: Arc::new(SubdomainAllocator::new(
            store.clone(),
            config.provisioning_config.subdomain_suffix.clone(),
        )),
        guard: Arc::new(Guard::new(config.guard_limits())),
        sessions,
        firewall: Arc::new(SophosClient::new(config.sophos())?),
        dns: Arc::new(TechnitiumClient::new(config.technitium())),
        bootstrap,
        scripts: Arc::new(ScriptLibrary::new(config.absolute_scripts_dir())),
        notifier: Arc::new(Notifier::new(store.clone(), mailer)),
        config: Arc::new(config.provisioning()),
        store,
    };

    let provisioner = Arc::new(Provisioner::new(ctx));
    let auth_handler = Arc::new(AuthHandler::new(&config.api_server_config.jwt_secret));

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("failed to listen for shutdown signal: {}", e);
            }
            info!("shutting down");
            shutdown.cancel();
        }
    });

    let api_server = ApiServer::new(
        ApiState::new(provisioner.clone(), auth_handler),
        ApiServerConfig {
            host: config.api_server_config.host.clone(),
            port: config.api_server_config.port,
        },
    )
    .add_service::<CoreService>()
    .add_service::<ServerService>()
    .add_service::<DnsService>()
    .add_service::<TemplateService>()
    .add_service::<NotificationService>()
    .add_service::<AdminService>();

    api_server.start(shutdown).await?;

    let in_flight = provisioner.in_flight();
    if in_flight > 0 {
        info!("waiting for {} provisioning runs to finish", in_flight);
    }
    provisioner.wait_idle().await;

    Ok(())
}
