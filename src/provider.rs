use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Opaque failure from a provider driver; fatal for the pipeline stage that
/// observed it.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct ProviderError(pub String);

#[derive(Debug, Clone)]
pub struct ProviderSession {
    pub id: String,
}

#[derive(Debug, Clone, Default)]
pub struct ExecSpec {
    pub cmd: Vec<String>,
    pub env: Option<HashMap<String, String>>,
}

impl ExecSpec {
    pub fn shell(command: impl Into<String>) -> Self {
        Self {
            cmd: vec!["sh".into(), "-c".into(), command.into()],
            env: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Declared service inside a workspace's in-tree configuration
/// (`.nexus/config.yaml`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceSpec {
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub services: HashMap<String, ServiceSpec>,
}

/// Contract a driver (containers, VMs) must satisfy for the provisioning
/// pipeline. Drivers live outside this crate.
#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    async fn create(
        &self,
        workspace_id: &str,
        workspace_dir: &Path,
        config: &WorkspaceConfig,
    ) -> Result<ProviderSession, ProviderError>;

    async fn start(&self, session_id: &str) -> Result<(), ProviderError>;

    async fn exec(&self, session_id: &str, spec: ExecSpec) -> Result<ExecOutput, ProviderError>;

    async fn stop(&self, session_id: &str) -> Result<(), ProviderError>;

    /// Container-port to host-port mappings, when the driver can report
    /// them. The default says "unsupported".
    async fn port_mappings(
        &self,
        _session_id: &str,
    ) -> Result<Option<HashMap<u16, u16>>, ProviderError> {
        Ok(None)
    }
}
