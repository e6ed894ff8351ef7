use anyhow::{Context, anyhow};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use crate::{
    platform::{DeploySpec, Platform, PlatformError, PlatformSession, PlatformVm, Template},
    resources::machine::{PowerAction, PowerState},
};

const SESSION_HEADER: &str = "vmware-api-session-id";

#[derive(Debug, Clone)]
pub struct VCenterConfig {
    pub url: String,
    pub user: String,
    pub password: String,
    pub datastore: String,
    pub cluster: String,
    pub folder: String,
    pub verify_tls: bool,
}

/// vSphere Automation REST client.
pub struct VCenterClient {
    client: Client,
    config: VCenterConfig,
    datastore_id: OnceCell<String>,
}

#[derive(Debug, Deserialize)]
struct VmSummary {
    vm: String,
    name: String,
    power_state: String,
}

#[derive(Debug, Deserialize)]
struct LibraryItem {
    name: String,
}

#[derive(Debug, Deserialize)]
struct DatastoreSummary {
    datastore: String,
}

impl VCenterClient {
    pub fn new(config: VCenterConfig) -> anyhow::Result<Self> {
        let client = Client::builder()
            .danger_accept_invalid_certs(!config.verify_tls)
            .build()?;

        Ok(Self {
            client,
            config,
            datastore_id: OnceCell::new(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api{}", self.config.url.trim_end_matches('/'), path)
    }

    fn authed(&self, request: RequestBuilder, session: &PlatformSession) -> RequestBuilder {
        request.header(SESSION_HEADER, &session.0)
    }

    async fn datastore_id(&self, session: &PlatformSession) -> Result<String, PlatformError> {
        let id = self
            .datastore_id
            .get_or_try_init(|| async {
                let request = self
                    .client
                    .get(self.url("/vcenter/datastore"))
                    .query(&[("names", self.config.datastore.as_str())]);
                let response = check(self.authed(request, session).send().await?).await?;
                let datastores: Vec<DatastoreSummary> = response.json().await?;

                datastores
                    .into_iter()
                    .next()
                    .map(|d| d.datastore)
                    .ok_or_else(|| {
                        PlatformError::Remote(anyhow!(
                            "datastore {} not found",
                            self.config.datastore
                        ))
                    })
            })
            .await?;

        Ok(id.clone())
    }
}

async fn check(response: Response) -> Result<Response, PlatformError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    match status {
        StatusCode::UNAUTHORIZED => Err(PlatformError::Unauthorized),
        StatusCode::NOT_FOUND => Err(PlatformError::NotFound),
        _ if body.contains("ALREADY_EXISTS") => Err(PlatformError::AlreadyExists),
        _ => Err(PlatformError::Remote(anyhow!(
            "vcenter request failed with status {}: {}",
            status,
            body
        ))),
    }
}

fn power_state(state: &str) -> PowerState {
    match state {
        "POWERED_ON" => PowerState::PoweredOn,
        "POWERED_OFF" => PowerState::PoweredOff,
        "SUSPENDED" => PowerState::Suspended,
        _ => PowerState::Unknown,
    }
}

fn power_query(action: PowerAction) -> &'static str {
    match action {
        PowerAction::On => "start",
        PowerAction::Off => "shutdown",
        PowerAction::ForceOff => "stop",
        PowerAction::Reset => "reset",
    }
}

#[async_trait]
impl Platform for VCenterClient {
    async fn create_session(&self) -> Result<PlatformSession, PlatformError> {
        let response = self
            .client
            .post(self.url("/session"))
            .basic_auth(&self.config.user, Some(&self.config.password))
            .send()
            .await?;
        let token: String = check(response)
            .await?
            .json()
            .await
            .context("failed to decode session token")?;

        Ok(PlatformSession(token))
    }

    async fn session_valid(&self, session: &PlatformSession) -> Result<bool, PlatformError> {
        let request = self.client.get(self.url("/session"));
        let response = self.authed(request, session).send().await?;
        Ok(response.status().is_success())
    }

    async fn list_templates(
        &self,
        session: &PlatformSession,
    ) -> Result<Vec<Template>, PlatformError> {
        let request = self
            .client
            .post(self.url("/content/library/item"))
            .query(&[("action", "find")])
            .json(&json!({ "type": "vm-template" }));
        let ids: Vec<String> = check(self.authed(request, session).send().await?)
            .await?
            .json()
            .await?;

        let mut templates = Vec::with_capacity(ids.len());
        for id in ids {
            let request = self
                .client
                .get(self.url(&format!("/content/library/item/{id}")));
            let item: LibraryItem = check(self.authed(request, session).send().await?)
                .await?
                .json()
                .await?;
            templates.push(Template { id, name: item.name });
        }

        Ok(templates)
    }

    async fn deploy_vm(
        &self,
        session: &PlatformSession,
        spec: &DeploySpec,
    ) -> Result<String, PlatformError> {
        let datastore = self.datastore_id(session).await?;
        let body = json!({
            "name": spec.name,
            "placement": {
                "cluster": self.config.cluster,
                "folder": self.config.folder,
            },
            "disk_storage": { "datastore": datastore },
            "vm_home_storage": { "datastore": datastore },
            "hardware_customization": {
                "disks_to_update": {
                    "2000": { "capacity": u64::from(spec.storage_gib) << 30 }
                },
                "memory_update": { "memory": u64::from(spec.memory_gib) * 1024 },
            },
        });

        let request = self
            .client
            .post(self.url(&format!(
                "/vcenter/vm-template/library-items/{}",
                spec.template_id
            )))
            .query(&[("action", "deploy")])
            .json(&body);
        let id: String = check(self.authed(request, session).send().await?)
            .await?
            .json()
            .await?;

        debug!("deployed {} as {}", spec.name, id);
        Ok(id)
    }

    async fn delete_vm(&self, session: &PlatformSession, id: &str) -> Result<(), PlatformError> {
        match self.power(session, id, PowerAction::ForceOff).await {
            Ok(()) | Err(PlatformError::Remote(_)) => {}
            Err(e) => return Err(e),
        }

        let request = self.client.delete(self.url(&format!("/vcenter/vm/{id}")));
        check(self.authed(request, session).send().await?).await?;
        Ok(())
    }

    async fn power(
        &self,
        session: &PlatformSession,
        id: &str,
        action: PowerAction,
    ) -> Result<(), PlatformError> {
        let request = self
            .client
            .post(self.url(&format!("/vcenter/vm/{id}/power")))
            .query(&[("action", power_query(action))]);
        let response = self.authed(request, session).send().await?;

        // vCenter answers 400 when the VM is already in the requested state
        if response.status() == StatusCode::BAD_REQUEST {
            let body = response.text().await.unwrap_or_default();
            if body.contains("ALREADY_IN_DESIRED_STATE") {
                return Ok(());
            }
            warn!("power {:?} on {} rejected: {}", action, id, body);
            return Err(PlatformError::Remote(anyhow!("power action rejected: {body}")));
        }

        check(response).await?;
        Ok(())
    }

    async fn list_vms(&self, session: &PlatformSession) -> Result<Vec<PlatformVm>, PlatformError> {
        let request = self.client.get(self.url("/vcenter/vm"));
        let vms: Vec<VmSummary> = check(self.authed(request, session).send().await?)
            .await?
            .json()
            .await?;

        Ok(vms
            .into_iter()
            .map(|vm| PlatformVm {
                power_state: power_state(&vm.power_state),
                id: vm.vm,
                name: vm.name,
            })
            .collect())
    }
}
