use std::{
    net::Ipv4Addr,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::anyhow;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info};

use crate::platform::{PlatformError, PlatformSession, PlatformSessionCache};

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("no startup script for template {0:?}")]
    MissingScript(String),
    #[error(transparent)]
    Platform(#[from] PlatformError),
    #[error(transparent)]
    Remote(#[from] anyhow::Error),
}

/// Per-template guest script, read from `<scripts-dir>/<template>.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartupScript {
    /// Guest account used to run the script.
    pub user: String,
    pub password: String,
    pub script_location: String,
    pub script_executable: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapContext {
    /// Account the script creates; its password is the same string.
    pub username: String,
    pub external_id: String,
    pub platform_id: String,
    pub ip: Ipv4Addr,
    pub vm_name: String,
}

impl BootstrapContext {
    pub fn arguments(&self, script: &StartupScript) -> String {
        let ip = self.ip.to_string();
        [
            script.script_location.as_str(),
            self.username.as_str(),
            self.username.as_str(),
            self.external_id.as_str(),
            ip.as_str(),
            self.vm_name.as_str(),
        ]
        .iter()
        .map(|arg| shell_quote(arg))
        .collect::<Vec<_>>()
        .join(" ")
    }
}

fn shell_quote(arg: &str) -> String {
    format!("'{}'", arg.replace('\'', "'\\''"))
}

pub struct ScriptLibrary {
    dir: PathBuf,
}

impl ScriptLibrary {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub async fn load(&self, template: &str) -> Result<StartupScript, BootstrapError> {
        if template.contains(['/', '\\']) || template.starts_with('.') {
            return Err(BootstrapError::MissingScript(template.to_string()));
        }

        let path = self.dir.join(format!("{template}.json"));
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(BootstrapError::MissingScript(template.to_string()));
            }
            Err(e) => return Err(anyhow!("failed to read {}: {e}", path.display()).into()),
        };

        let script = serde_json::from_str(&content)
            .map_err(|e| anyhow!("invalid startup script {}: {e}", path.display()))?;
        Ok(script)
    }
}

#[async_trait]
pub trait GuestBootstrap: Send + Sync {
    async fn run_startup_script(
        &self,
        script: &StartupScript,
        context: &BootstrapContext,
    ) -> Result<(), BootstrapError>;
}

/// Runs the script through the vCenter guest operations API.
pub struct VCenterGuestRunner {
    client: Client,
    url: String,
    sessions: Arc<PlatformSessionCache>,
}

impl VCenterGuestRunner {
    pub fn new(
        url: impl Into<String>,
        verify_tls: bool,
        sessions: Arc<PlatformSessionCache>,
    ) -> anyhow::Result<Self> {
        let client = Client::builder()
            .danger_accept_invalid_certs(!verify_tls)
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
            sessions,
        })
    }
}

impl VCenterGuestRunner {
    async fn start_process(
        &self,
        session: &PlatformSession,
        platform_id: &str,
        body: &serde_json::Value,
    ) -> Result<(), PlatformError> {
        let url = format!(
            "{}/api/vcenter/vm/{}/guest/processes",
            self.url.trim_end_matches('/'),
            platform_id
        );
        let response = self
            .client
            .post(url)
            .query(&[("action", "create")])
            .header("vmware-api-session-id", &session.0)
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(PlatformError::Unauthorized);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("guest script failed with status {status}: {body}").into());
        }
        Ok(())
    }
}

#[async_trait]
impl GuestBootstrap for VCenterGuestRunner {
    async fn run_startup_script(
        &self,
        script: &StartupScript,
        context: &BootstrapContext,
    ) -> Result<(), BootstrapError> {
        let body = json!({
            "credentials": {
                "interactive_session": false,
                "type": "USERNAME_PASSWORD",
                "user_name": script.user,
                "password": script.password,
            },
            "spec": {
                "path": script.script_executable,
                "arguments": context.arguments(script),
            },
        });

        debug!("starting guest script on {}", context.platform_id);
        let body = &body;
        self.sessions
            .call(|_, session| async move {
                self.start_process(&session, &context.platform_id, body)
                    .await
            })
            .await?;

        info!("startup script launched on {}", context.vm_name);
        Ok(())
    }
}
