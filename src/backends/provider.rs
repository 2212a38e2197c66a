//! Sandbox providers: named factories that create sandbox instances on demand.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::tools::{BackendError, SandboxBackend};

/// Options passed to [SandboxProvider::create].
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxCreateOptions {
    /// Directory the sandbox should run in; providers pick a default when `None`.
    pub working_directory: Option<PathBuf>,
}

impl SandboxCreateOptions {
    pub fn with_working_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }
}

/// Creates sandboxes of one kind (local shell, container, remote agent, ...).
#[async_trait]
pub trait SandboxProvider: Send + Sync {
    /// Stable type key, e.g. `"local-shell-sandbox"`.
    fn provider_type(&self) -> &str;

    /// Human-readable name.
    fn name(&self) -> &str;

    async fn create(
        &self,
        options: SandboxCreateOptions,
    ) -> Result<Arc<dyn SandboxBackend>, BackendError>;
}
