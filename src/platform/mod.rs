pub mod session;
pub mod vcenter;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::resources::machine::{PowerAction, PowerState};

pub use session::PlatformSessionCache;

#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("platform object not found")]
    NotFound,
    /// A VM with the requested name is already deployed, usually left behind by an
    /// earlier partial run.
    #[error("platform vm already exists")]
    AlreadyExists,
    #[error("platform session is not valid")]
    Unauthorized,
    #[error("unknown template {0:?}")]
    UnknownTemplate(String),
    #[error(transparent)]
    Remote(#[from] anyhow::Error),
}

impl From<reqwest::Error> for PlatformError {
    fn from(e: reqwest::Error) -> Self {
        PlatformError::Remote(e.into())
    }
}

/// Opaque authentication handle issued by the platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformSession(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Template {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploySpec {
    pub name: String,
    pub template_id: String,
    pub storage_gib: u32,
    pub memory_gib: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformVm {
    pub id: String,
    pub name: String,
    pub power_state: PowerState,
}

#[async_trait]
pub trait Platform: Send + Sync {
    async fn create_session(&self) -> Result<PlatformSession, PlatformError>;

    async fn session_valid(&self, session: &PlatformSession) -> Result<bool, PlatformError>;

    async fn list_templates(&self, session: &PlatformSession)
    -> Result<Vec<Template>, PlatformError>;

    /// Returns the platform id of the new VM.
    async fn deploy_vm(
        &self,
        session: &PlatformSession,
        spec: &DeploySpec,
    ) -> Result<String, PlatformError>;

    async fn delete_vm(&self, session: &PlatformSession, id: &str) -> Result<(), PlatformError>;

    async fn power(
        &self,
        session: &PlatformSession,
        id: &str,
        action: PowerAction,
    ) -> Result<(), PlatformError>;

    async fn list_vms(&self, session: &PlatformSession) -> Result<Vec<PlatformVm>, PlatformError>;
}

/// `<prefix>-<externalId>-<vmName>`. Stable for a given owner and name so the VM can be
/// found again without a local index.
pub fn vm_name(prefix: &str, external_id: &str, name: &str) -> String {
    format!("{prefix}-{external_id}-{name}")
}
