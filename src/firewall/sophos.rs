use std::net::Ipv4Addr;

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use quick_xml::{
    Reader,
    escape::escape,
    events::{BytesStart, Event},
};
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

use crate::firewall::{AllowedSource, Firewall, FirewallBinding, FirewallError};

#[derive(Debug, Clone)]
pub struct SophosConfig {
    pub url: String,
    pub user: String,
    pub password: String,
    pub rule_group: String,
    pub home_group: String,
    pub object_prefix: String,
    pub source_networks: Vec<String>,
    pub inbound_services: Vec<String>,
    pub outbound_services: Vec<String>,
    pub verify_tls: bool,
}

/// Sophos XG XML API client.
pub struct SophosClient {
    client: Client,
    config: SophosConfig,
}

impl SophosClient {
    pub fn new(config: SophosConfig) -> anyhow::Result<Self> {
        let client = Client::builder()
            .danger_accept_invalid_certs(!config.verify_tls)
            .build()?;
        Ok(Self { client, config })
    }

    async fn request(&self, operation: &str) -> Result<String, FirewallError> {
        let body = format!(
            "<Request><Login><Username>{}</Username><Password>{}</Password></Login>{}</Request>",
            escape(&self.config.user),
            escape(&self.config.password),
            operation
        );

        let response = self
            .client
            .post(&self.config.url)
            .form(&[("reqxml", body)])
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(FirewallError::Remote(anyhow!(
                "firewall request failed with status {status}: {text}"
            )));
        }

        Ok(text)
    }

    async fn set(&self, operation: &str) -> Result<(), FirewallError> {
        let response = self.request(operation).await?;
        check_status(&response)
    }

    async fn remove(&self, entity: &str, name: &str) -> Result<(), FirewallError> {
        debug!("removing {} {}", entity, name);
        self.set(&format!(
            "<Remove><{entity}><Name>{}</Name></{entity}></Remove>",
            escape(name)
        ))
        .await
    }

    fn rule_xml(
        &self,
        name: &str,
        source_zones: &[&str],
        destination_zone: &str,
        services: &[String],
        destination_host: Option<&str>,
    ) -> String {
        let zones: String = source_zones
            .iter()
            .map(|z| format!("<Zone>{z}</Zone>"))
            .collect();
        let networks = wrap_all("Network", &self.config.source_networks);
        let services = wrap_all("Service", services);
        let destination = destination_host
            .map(|h| format!("<Network>{}</Network>", escape(h)))
            .unwrap_or_default();

        format!(
            "<Set operation=\"add\"><FirewallRule><Name>{}</Name><Position>bottom</Position>\
             <PolicyType>Network</PolicyType><NetworkPolicy><Action>Accept</Action>\
             <SourceZones>{zones}</SourceZones><SourceNetworks>{networks}</SourceNetworks>\
             <Services>{services}</Services><DestinationZones><Zone>{destination_zone}</Zone>\
             </DestinationZones><DestinationNetworks>{destination}</DestinationNetworks>\
             </NetworkPolicy></FirewallRule></Set>",
            escape(name)
        )
    }
}

#[async_trait]
impl Firewall for SophosClient {
    async fn create_ip_host(&self, name: &str, ip: Ipv4Addr) -> Result<(), FirewallError> {
        self.set(&format!(
            "<Set operation=\"add\"><IPHost><Name>{}</Name><HostType>IP</HostType>\
             <IPAddress>{ip}</IPAddress></IPHost></Set>",
            escape(name)
        ))
        .await
    }

    async fn create_inbound_rule(&self, binding: &FirewallBinding) -> Result<(), FirewallError> {
        let xml = self.rule_xml(
            &binding.inbound,
            &["LAN", "WAN"],
            "DMZ",
            &self.config.inbound_services,
            Some(&binding.host),
        );
        self.set(&xml).await
    }

    async fn create_outbound_rule(&self, binding: &FirewallBinding) -> Result<(), FirewallError> {
        let xml = self.rule_xml(
            &binding.outbound,
            &["DMZ", "LAN"],
            "WAN",
            &self.config.outbound_services,
            None,
        );
        self.set(&xml).await
    }

    async fn add_rules_to_group(&self, binding: &FirewallBinding) -> Result<(), FirewallError> {
        self.set(&format!(
            "<Set operation=\"update\"><FirewallRuleGroup><Name>{}</Name><SecurityPolicyList>\
             <SecurityPolicy>{}</SecurityPolicy><SecurityPolicy>{}</SecurityPolicy>\
             </SecurityPolicyList></FirewallRuleGroup></Set>",
            escape(&self.config.rule_group),
            escape(&binding.inbound),
            escape(&binding.outbound)
        ))
        .await
    }

    async fn remove_ip_host(&self, name: &str) -> Result<(), FirewallError> {
        self.remove("IPHost", name).await
    }

    async fn remove_inbound_rule(&self, binding: &FirewallBinding) -> Result<(), FirewallError> {
        self.remove("FirewallRule", &binding.inbound).await
    }

    async fn remove_outbound_rule(&self, binding: &FirewallBinding) -> Result<(), FirewallError> {
        self.remove("FirewallRule", &binding.outbound).await
    }

    async fn list_allowed_sources(&self) -> Result<Vec<AllowedSource>, FirewallError> {
        let prefix = format!("{}-HOME-", self.config.object_prefix);
        let response = self
            .request(&format!(
                "<Get><IPHost><Filter><key name=\"Name\" criteria=\"like\">{}</key>\
                 </Filter></IPHost></Get>",
                escape(&prefix)
            ))
            .await?;

        parse_ip_hosts(&response)
    }

    async fn add_allowed_source(&self, name: &str, ip: Ipv4Addr) -> Result<(), FirewallError> {
        self.set(&format!(
            "<Set operation=\"add\"><IPHost><Name>{}</Name><HostType>IP</HostType>\
             <IPAddress>{ip}</IPAddress><HostGroupList><HostGroup>{}</HostGroup>\
             </HostGroupList></IPHost></Set>",
            escape(name),
            escape(&self.config.home_group)
        ))
        .await
    }
}

fn wrap_all(tag: &str, values: &[String]) -> String {
    values
        .iter()
        .map(|v| format!("<{tag}>{}</{tag}>", escape(v)))
        .collect()
}

fn check_status(response: &str) -> Result<(), FirewallError> {
    let statuses = statuses(response)?;
    if statuses.iter().any(|s| s.code == "200") {
        return Ok(());
    }

    let status = statuses
        .into_iter()
        .next()
        .map(|s| s.text)
        .unwrap_or_else(|| response.to_string());
    let lowered = status.to_lowercase();
    if lowered.contains("not found") || lowered.contains("does not exist") {
        return Err(FirewallError::NotFound);
    }

    Err(FirewallError::Rejected(status))
}

struct StatusElement {
    code: String,
    text: String,
}

/// Every `<Status code="..">` in the response, at any depth.
fn statuses(xml: &str) -> anyhow::Result<Vec<StatusElement>> {
    let mut reader = Reader::from_str(xml);
    let mut statuses = Vec::new();
    let mut current: Option<StatusElement> = None;

    loop {
        match reader.read_event()? {
            Event::Start(e) if e.name().as_ref() == b"Status" => {
                current = Some(StatusElement {
                    code: status_code(&e)?,
                    text: String::new(),
                });
            }
            Event::Empty(e) if e.name().as_ref() == b"Status" => {
                statuses.push(StatusElement {
                    code: status_code(&e)?,
                    text: String::new(),
                });
            }
            Event::Text(e) => {
                if let Some(status) = current.as_mut() {
                    status.text.push_str(&e.unescape()?);
                }
            }
            Event::CData(e) => {
                if let Some(status) = current.as_mut() {
                    status.text.push_str(&String::from_utf8_lossy(&e));
                }
            }
            Event::End(e) if e.name().as_ref() == b"Status" => {
                statuses.extend(current.take());
            }
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(statuses)
}

fn status_code(element: &BytesStart<'_>) -> anyhow::Result<String> {
    Ok(match element.try_get_attribute("code")? {
        Some(code) => code.unescape_value()?.into_owned(),
        None => String::new(),
    })
}

#[derive(Debug, Deserialize)]
struct IpHostResponse {
    #[serde(rename = "IPHost", default)]
    hosts: Vec<IpHostEntry>,
}

#[derive(Debug, Deserialize)]
struct IpHostEntry {
    #[serde(rename = "Name")]
    name: Option<String>,
    #[serde(rename = "IPAddress")]
    ip_address: Option<String>,
}

fn parse_ip_hosts(xml: &str) -> Result<Vec<AllowedSource>, FirewallError> {
    let response: IpHostResponse =
        quick_xml::de::from_str(xml).context("invalid ip host listing")?;

    Ok(response
        .hosts
        .into_iter()
        .filter_map(|host| {
            let ip = host.ip_address?.trim().parse().ok()?;
            Some(AllowedSource {
                name: host.name?,
                ip,
            })
        })
        .collect())
}
